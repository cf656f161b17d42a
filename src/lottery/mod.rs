//! Lottery drawing
//!
//! Entries are bought with coins. Once a lottery's end date passes, one
//! winner is drawn with probability proportional to entries held.

use crate::error::ImpulsesError;
use crate::models::{DrawOutcome, Lottery, LotteryEntry};
use crate::notify::{to_e164, Notifier};
use crate::store::Store;
use crate::Result;
use chrono::{DateTime, Utc};
use rand::distributions::{Distribution, WeightedIndex};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::Serialize;
use std::sync::{Arc, Mutex};
use tracing::{info, warn};
use uuid::Uuid;

/// Result of drawing one lottery
#[derive(Debug, Clone, Serialize)]
pub struct DrawResult {
    pub lottery_id: Uuid,
    pub lottery_name: String,
    pub outcome: DrawOutcome,
    pub total_entries: u32,
    pub winner_notified: bool,
}

/// Pick a winner, weighting each user by their entry count
pub fn pick_winner<R: Rng + ?Sized>(entries: &[LotteryEntry], rng: &mut R) -> Option<Uuid> {
    let pool: Vec<&LotteryEntry> = entries.iter().filter(|e| e.entries > 0).collect();
    if pool.is_empty() {
        return None;
    }

    let weights = WeightedIndex::new(pool.iter().map(|e| e.entries)).ok()?;
    Some(pool[weights.sample(rng)].user_id)
}

pub fn winner_message(lottery_name: &str) -> String {
    format!("Congratulations! You've won the lottery for {}!", lottery_name)
}

pub struct LotteryDrawer {
    store: Arc<dyn Store>,
    notifier: Arc<dyn Notifier>,
    rng: Mutex<StdRng>,
}

impl LotteryDrawer {
    pub fn new(store: Arc<dyn Store>, notifier: Arc<dyn Notifier>) -> Self {
        Self::with_rng(store, notifier, StdRng::from_entropy())
    }

    pub fn with_rng(store: Arc<dyn Store>, notifier: Arc<dyn Notifier>, rng: StdRng) -> Self {
        Self {
            store,
            notifier,
            rng: Mutex::new(rng),
        }
    }

    pub async fn create_lottery(
        &self,
        name: &str,
        cost: i64,
        end_date: DateTime<Utc>,
    ) -> Result<Lottery> {
        let name = name.trim();
        if name.is_empty() {
            return Err(ImpulsesError::InvalidInput("lottery name is empty".to_string()));
        }
        if cost <= 0 {
            return Err(ImpulsesError::InvalidInput(format!(
                "lottery cost must be positive, got {}",
                cost
            )));
        }

        let lottery = Lottery {
            lottery_id: Uuid::new_v4(),
            lottery_name: name.to_string(),
            cost,
            end_date,
            outcome: None,
            drawn_at: None,
        };
        self.store.insert_lottery(lottery.clone()).await?;

        info!(lottery_id = %lottery.lottery_id, name = %lottery.lottery_name, cost, "Lottery created");
        Ok(lottery)
    }

    /// Draw every lottery that has ended without an outcome
    pub async fn draw_due(&self, now: DateTime<Utc>) -> Result<Vec<DrawResult>> {
        let due = self.store.lotteries_due(now).await?;
        let mut results = Vec::with_capacity(due.len());

        for lottery in due {
            if let Some(result) = self.draw(&lottery, now).await? {
                results.push(result);
            }
        }

        Ok(results)
    }

    async fn draw(&self, lottery: &Lottery, now: DateTime<Utc>) -> Result<Option<DrawResult>> {
        let pick = |entries: &[LotteryEntry]| {
            let mut rng = self.rng.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
            pick_winner(entries, &mut *rng)
                .map(DrawOutcome::Winner)
                .unwrap_or(DrawOutcome::NoEntries)
        };
        let Some((outcome, total_entries)) =
            self.store.draw_lottery(lottery.lottery_id, now, &pick).await?
        else {
            warn!(lottery_id = %lottery.lottery_id, "Lottery already drawn, skipping");
            return Ok(None);
        };

        info!(
            lottery_id = %lottery.lottery_id,
            name = %lottery.lottery_name,
            total_entries,
            outcome = ?outcome,
            "Lottery drawn"
        );

        let winner_notified = match outcome {
            DrawOutcome::Winner(user_id) => self.notify_winner(lottery, user_id).await,
            DrawOutcome::NoEntries => false,
        };

        Ok(Some(DrawResult {
            lottery_id: lottery.lottery_id,
            lottery_name: lottery.lottery_name.clone(),
            outcome,
            total_entries,
            winner_notified,
        }))
    }

    async fn notify_winner(&self, lottery: &Lottery, user_id: Uuid) -> bool {
        let user = match self.store.get_user(user_id).await {
            Ok(Some(user)) => user,
            Ok(None) => {
                warn!(user_id = %user_id, "Lottery winner no longer exists");
                return false;
            }
            Err(e) => {
                warn!(user_id = %user_id, "Failed to load lottery winner: {}", e);
                return false;
            }
        };

        match self
            .notifier
            .send_sms(&to_e164(&user.phone), &winner_message(&lottery.lottery_name))
            .await
        {
            Ok(()) => true,
            Err(e) => {
                warn!(user_id = %user_id, "Failed to notify lottery winner: {}", e);
                false
            }
        }
    }
}
