//! Service wiring
//!
//! `Impulses` owns one store and one notifier and hands them to every
//! component. Both binaries build it from `Config`.

use crate::coins::CoinLedger;
use crate::config::Config;
use crate::habits::{CategoryTaxonomy, HabitTracker};
use crate::ingest::PlaidIngest;
use crate::lottery::{DrawResult, LotteryDrawer};
use crate::models::{CoinEntry, User};
use crate::notify::{parse_reply, LogNotifier, Notifier, ReplyIntent, TwilioNotifier};
use crate::savings::SavingsTracker;
use crate::schedule::{ReminderDispatcher, ReminderReport};
use crate::store::{build_store, Store};
use crate::users::UserDirectory;
use crate::Result;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;
use tracing::{info, warn};
use uuid::Uuid;

/// What an inbound SMS reply led to
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ReplyOutcome {
    Saved {
        user_id: Uuid,
        coins_awarded: i64,
        balance: i64,
    },
    Acknowledged {
        user_id: Uuid,
    },
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct TickReport {
    pub reminders: ReminderReport,
    pub draws: Vec<DrawResult>,
}

pub struct Impulses {
    pub config: Config,
    pub store: Arc<dyn Store>,
    pub notifier: Arc<dyn Notifier>,
    pub users: UserDirectory,
    pub coins: CoinLedger,
    pub lottery: LotteryDrawer,
    pub savings: SavingsTracker,
    pub habits: HabitTracker,
    pub reminders: ReminderDispatcher,
    pub ingest: PlaidIngest,
}

impl Impulses {
    pub fn new(
        config: Config,
        store: Arc<dyn Store>,
        notifier: Arc<dyn Notifier>,
        taxonomy: CategoryTaxonomy,
    ) -> Self {
        let tz = config.timezone;
        Self {
            users: UserDirectory::new(store.clone()),
            coins: CoinLedger::new(store.clone(), config.coin_rules, tz),
            lottery: LotteryDrawer::new(store.clone(), notifier.clone()),
            savings: SavingsTracker::new(store.clone(), tz),
            habits: HabitTracker::new(store.clone(), Arc::new(taxonomy)),
            reminders: ReminderDispatcher::new(
                store.clone(),
                notifier.clone(),
                tz,
                config.reminder_catch_up,
            ),
            ingest: PlaidIngest::new(store.clone()),
            config,
            store,
            notifier,
        }
    }

    /// Pick the store, SMS channel and category taxonomy from config
    pub fn from_config(config: Config) -> Result<Self> {
        let store = build_store(config.database_url.as_deref());

        let notifier: Arc<dyn Notifier> = match &config.twilio {
            Some(twilio) => Arc::new(TwilioNotifier::new(
                twilio.account_sid.clone(),
                twilio.auth_token.clone(),
                twilio.from_number.clone(),
            )?),
            None => {
                warn!("Twilio credentials not set, SMS will only be logged");
                Arc::new(LogNotifier)
            }
        };

        let taxonomy = match &config.categories_file {
            Some(path) => CategoryTaxonomy::from_file(path)?,
            None => {
                warn!("PLAID_CATEGORIES_FILE not set, lunch habit detection is disabled");
                CategoryTaxonomy::default()
            }
        };

        info!(
            notifier = notifier.name(),
            timezone = %config.timezone,
            categories = taxonomy.len(),
            "Impulses initialized"
        );
        Ok(Self::new(config, store, notifier, taxonomy))
    }

    /// Check credentials and award the login coins for today
    pub async fn login(
        &self,
        email: &str,
        password: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<(User, Option<CoinEntry>)>> {
        let Some(user) = self.users.authenticate(email, password).await? else {
            return Ok(None);
        };
        let award = self.coins.award_login(user.user_id, now).await?;
        Ok(Some((user, award)))
    }

    /// Handle a reply to a reminder SMS
    pub async fn handle_reply(&self, from: &str, body: &str, now: DateTime<Utc>) -> Result<ReplyOutcome> {
        let user = self.users.by_phone(from).await?;

        match parse_reply(body) {
            ReplyIntent::Saved => {
                let entry = self.coins.award_saving(user.user_id, now).await?;
                let balance = self.coins.balance(user.user_id).await?;
                Ok(ReplyOutcome::Saved {
                    user_id: user.user_id,
                    coins_awarded: entry.coin_amount,
                    balance,
                })
            }
            ReplyIntent::Other => {
                info!(user_id = %user.user_id, "Reply acknowledged");
                Ok(ReplyOutcome::Acknowledged {
                    user_id: user.user_id,
                })
            }
        }
    }

    /// One worker pass: send due reminders, then draw ended lotteries.
    ///
    /// A failure in one half is logged and does not stop the other.
    pub async fn tick(&self, now: DateTime<Utc>) -> TickReport {
        let reminders = self.reminders.tick(now).await.unwrap_or_else(|e| {
            warn!("Reminder dispatch failed: {}", e);
            ReminderReport::default()
        });
        let draws = self.lottery.draw_due(now).await.unwrap_or_else(|e| {
            warn!("Lottery drawing failed: {}", e);
            Vec::new()
        });
        TickReport { reminders, draws }
    }
}
