use chrono::Utc;
use impulses::{app::Impulses, config::Config};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenv::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config = Config::from_env()?;
    let interval = config.reminder_interval;
    let app = Impulses::from_config(config)?;

    info!("Impulses - worker, tick every {}s", interval.as_secs());

    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let report = app.tick(Utc::now()).await;
                for draw in &report.draws {
                    info!(
                        lottery = %draw.lottery_name,
                        entries = draw.total_entries,
                        notified = draw.winner_notified,
                        "Lottery drawn"
                    );
                }
            }
            result = tokio::signal::ctrl_c() => {
                if let Err(e) = result {
                    warn!("Failed to listen for shutdown signal: {}", e);
                }
                info!("Shutting down worker");
                break;
            }
        }
    }

    Ok(())
}
