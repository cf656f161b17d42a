//! Coin ledger
//!
//! Coins are earned by logging in and by confirming a saving, and spent
//! on lottery entries. Every change is a ledger entry; the store keeps the
//! user's running balance in step with it.

use crate::config::CoinRules;
use crate::error::ImpulsesError;
use crate::models::{CoinEntry, CoinReason, LotteryEntry};
use crate::schedule::local_date;
use crate::store::Store;
use crate::Result;
use chrono::{DateTime, NaiveDate, Utc};
use chrono_tz::Tz;
use std::sync::Arc;
use tracing::{debug, info};
use uuid::Uuid;

/// Login reward owed given the last registration or login award date.
pub fn login_reward(
    last: Option<NaiveDate>,
    today: NaiveDate,
    rules: CoinRules,
) -> Option<(i64, CoinReason)> {
    match last {
        None => Some((rules.registration_bonus, CoinReason::Registration)),
        Some(last) if last < today => Some((rules.daily_login, CoinReason::Login)),
        Some(_) => None,
    }
}

pub struct CoinLedger {
    store: Arc<dyn Store>,
    rules: CoinRules,
    tz: Tz,
}

impl CoinLedger {
    pub fn new(store: Arc<dyn Store>, rules: CoinRules, tz: Tz) -> Self {
        Self { store, rules, tz }
    }

    pub fn rules(&self) -> CoinRules {
        self.rules
    }

    /// Reward a login.
    ///
    /// The first login ever earns the registration bonus; after that one
    /// daily reward per local calendar day. Returns `None` when nothing
    /// was awarded.
    pub async fn award_login(&self, user_id: Uuid, now: DateTime<Utc>) -> Result<Option<CoinEntry>> {
        let today = local_date(now, self.tz);
        let Some((entry, balance)) = self.store.award_login(user_id, today, self.rules).await? else {
            debug!(user_id = %user_id, "Login coins already awarded today");
            return Ok(None);
        };

        info!(
            user_id = %user_id,
            reason = %entry.description,
            amount = entry.coin_amount,
            balance,
            "Login coins awarded"
        );
        Ok(Some(entry))
    }

    /// Reward a confirmed saving
    pub async fn award_saving(&self, user_id: Uuid, now: DateTime<Utc>) -> Result<CoinEntry> {
        let entry = CoinEntry::new(
            user_id,
            self.rules.saving_reward,
            local_date(now, self.tz),
            CoinReason::Saving,
        );
        let balance = self.store.apply_coin_entry(entry.clone()).await?;

        info!(user_id = %user_id, amount = entry.coin_amount, balance, "Saving coins awarded");
        Ok(entry)
    }

    /// Buy one entry into an open lottery
    pub async fn enter_lottery(
        &self,
        user_id: Uuid,
        lottery_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<LotteryEntry> {
        let lottery = self
            .store
            .get_lottery(lottery_id)
            .await?
            .ok_or(ImpulsesError::LotteryNotFound(lottery_id))?;

        let payment = CoinEntry::new(
            user_id,
            -lottery.cost,
            local_date(now, self.tz),
            CoinReason::Lottery,
        );
        let entry = self.store.purchase_entry(lottery_id, payment, now).await?;

        info!(
            user_id = %user_id,
            lottery = %lottery.lottery_name,
            cost = lottery.cost,
            entries = entry.entries,
            "Lottery entry purchased"
        );
        Ok(entry)
    }

    pub async fn balance(&self, user_id: Uuid) -> Result<i64> {
        let user = self
            .store
            .get_user(user_id)
            .await?
            .ok_or_else(|| ImpulsesError::UserNotFound(user_id.to_string()))?;
        Ok(user.coins)
    }

    pub async fn history(&self, user_id: Uuid) -> Result<Vec<CoinEntry>> {
        self.store.coin_entries(user_id).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Lottery, User, UserStatus};
    use crate::store::InMemoryStore;
    use chrono::{Duration, TimeZone};
    use chrono_tz::America::Los_Angeles;

    async fn setup() -> (CoinLedger, Arc<dyn Store>, Uuid) {
        let store: Arc<dyn Store> = Arc::new(InMemoryStore::new());
        let user_id = Uuid::new_v4();
        store
            .insert_user(User {
                user_id,
                first_name: "Sam".to_string(),
                last_name: "Saver".to_string(),
                email: "sam@example.com".to_string(),
                phone: "4155550111".to_string(),
                password_hash: String::new(),
                signup_date: Utc::now(),
                status: UserStatus::Active,
                auth_id: None,
                coins: 0,
            })
            .await
            .unwrap();
        let ledger = CoinLedger::new(store.clone(), CoinRules::default(), Los_Angeles);
        (ledger, store, user_id)
    }

    fn la(y: i32, m: u32, d: u32, h: u32, min: u32) -> DateTime<Utc> {
        Los_Angeles
            .with_ymd_and_hms(y, m, d, h, min, 0)
            .unwrap()
            .with_timezone(&Utc)
    }

    async fn open_lottery(store: &Arc<dyn Store>, cost: i64, end_date: DateTime<Utc>) -> Uuid {
        let lottery = Lottery {
            lottery_id: Uuid::new_v4(),
            lottery_name: "Monthly".to_string(),
            cost,
            end_date,
            outcome: None,
            drawn_at: None,
        };
        let lottery_id = lottery.lottery_id;
        store.insert_lottery(lottery).await.unwrap();
        lottery_id
    }

    #[tokio::test]
    async fn test_first_login_awards_registration_bonus() {
        let (ledger, _, user_id) = setup().await;
        let entry = ledger.award_login(user_id, la(2024, 5, 1, 9, 0)).await.unwrap().unwrap();
        assert_eq!(entry.description, CoinReason::Registration);
        assert_eq!(entry.coin_amount, 10);
        assert_eq!(ledger.balance(user_id).await.unwrap(), 10);
    }

    #[tokio::test]
    async fn test_daily_login_once_per_local_day() {
        let (ledger, _, user_id) = setup().await;
        ledger.award_login(user_id, la(2024, 5, 1, 9, 0)).await.unwrap();

        // Same local day: nothing more, not even a second registration bonus
        assert!(ledger.award_login(user_id, la(2024, 5, 1, 23, 30)).await.unwrap().is_none());

        let next_day = ledger.award_login(user_id, la(2024, 5, 2, 0, 5)).await.unwrap().unwrap();
        assert_eq!(next_day.description, CoinReason::Login);
        assert_eq!(next_day.coin_amount, 2);

        assert!(ledger.award_login(user_id, la(2024, 5, 2, 18, 0)).await.unwrap().is_none());
        assert_eq!(ledger.balance(user_id).await.unwrap(), 12);
    }

    #[tokio::test]
    async fn test_login_day_boundary_follows_local_time() {
        let (ledger, _, user_id) = setup().await;
        ledger.award_login(user_id, la(2024, 5, 1, 16, 0)).await.unwrap();

        // 2024-05-02 01:00 UTC is still May 1st in Los Angeles
        let late_evening = Utc.with_ymd_and_hms(2024, 5, 2, 1, 0, 0).unwrap();
        assert!(ledger.award_login(user_id, late_evening).await.unwrap().is_none());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_logins_award_bonus_once() {
        let (ledger, _, user_id) = setup().await;
        let ledger = Arc::new(ledger);
        let now = la(2024, 5, 1, 9, 0);

        let handles: Vec<_> = (0..16)
            .map(|_| {
                let ledger = ledger.clone();
                tokio::spawn(async move { ledger.award_login(user_id, now).await })
            })
            .collect();

        let mut awarded = 0;
        for handle in handles {
            if handle.await.unwrap().unwrap().is_some() {
                awarded += 1;
            }
        }
        assert_eq!(awarded, 1);

        let history = ledger.history(user_id).await.unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].description, CoinReason::Registration);
        assert_eq!(ledger.balance(user_id).await.unwrap(), 10);
    }

    #[test]
    fn test_login_reward_rules() {
        let rules = CoinRules::default();
        let day = NaiveDate::from_ymd_opt(2024, 5, 1).unwrap();
        let next = NaiveDate::from_ymd_opt(2024, 5, 2).unwrap();

        assert_eq!(login_reward(None, day, rules), Some((10, CoinReason::Registration)));
        assert_eq!(login_reward(Some(day), next, rules), Some((2, CoinReason::Login)));
        assert_eq!(login_reward(Some(day), day, rules), None);
        assert_eq!(login_reward(Some(next), day, rules), None);
    }

    #[tokio::test]
    async fn test_saving_reward() {
        let (ledger, _, user_id) = setup().await;
        ledger.award_saving(user_id, Utc::now()).await.unwrap();
        ledger.award_saving(user_id, Utc::now()).await.unwrap();
        assert_eq!(ledger.balance(user_id).await.unwrap(), 20);
        assert_eq!(ledger.history(user_id).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_enter_lottery_deducts_cost_and_counts_entries() {
        let (ledger, store, user_id) = setup().await;
        let now = Utc::now();
        ledger.award_saving(user_id, now).await.unwrap();
        let lottery_id = open_lottery(&store, 4, now + Duration::days(7)).await;

        ledger.enter_lottery(user_id, lottery_id, now).await.unwrap();
        let entry = ledger.enter_lottery(user_id, lottery_id, now).await.unwrap();
        assert_eq!(entry.entries, 2);
        assert_eq!(ledger.balance(user_id).await.unwrap(), 2);

        let history = ledger.history(user_id).await.unwrap();
        let spent: Vec<i64> = history
            .iter()
            .filter(|c| c.description == CoinReason::Lottery)
            .map(|c| c.coin_amount)
            .collect();
        assert_eq!(spent, vec![-4, -4]);
    }

    #[tokio::test]
    async fn test_enter_lottery_rejects_insufficient_coins() {
        let (ledger, store, user_id) = setup().await;
        let now = Utc::now();
        let lottery_id = open_lottery(&store, 4, now + Duration::days(7)).await;

        let result = ledger.enter_lottery(user_id, lottery_id, now).await;
        assert!(matches!(
            result,
            Err(ImpulsesError::InsufficientCoins { balance: 0, required: 4 })
        ));
        assert!(store.lottery_entries(lottery_id).await.unwrap().is_empty());
        assert!(ledger.history(user_id).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_enter_lottery_rejects_ended_or_unknown() {
        let (ledger, store, user_id) = setup().await;
        let now = Utc::now();
        ledger.award_saving(user_id, now).await.unwrap();
        let ended = open_lottery(&store, 1, now - Duration::minutes(1)).await;

        assert!(matches!(
            ledger.enter_lottery(user_id, ended, now).await,
            Err(ImpulsesError::LotteryClosed(_))
        ));
        assert!(matches!(
            ledger.enter_lottery(user_id, Uuid::new_v4(), now).await,
            Err(ImpulsesError::LotteryNotFound(_))
        ));
        assert_eq!(ledger.balance(user_id).await.unwrap(), 10);
    }

    #[tokio::test]
    async fn test_unknown_user() {
        let (ledger, _, _) = setup().await;
        assert!(matches!(
            ledger.award_saving(Uuid::new_v4(), Utc::now()).await,
            Err(ImpulsesError::UserNotFound(_))
        ));
    }
}
