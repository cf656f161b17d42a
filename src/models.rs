//! Core data models for the savings-habit service

use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

use crate::schedule::DayPattern;

//
// ================= Users =================
//

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum UserStatus {
    Active,
    Inactive,
}

impl UserStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            UserStatus::Active => "active",
            UserStatus::Inactive => "inactive",
        }
    }

    pub fn from_db(value: &str) -> Self {
        match value {
            "inactive" => UserStatus::Inactive,
            _ => UserStatus::Active,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct User {
    pub user_id: Uuid,
    pub first_name: String,
    pub last_name: String,
    pub email: String,
    /// Ten digits, no country code
    pub phone: String,
    #[serde(skip_serializing, default)]
    pub password_hash: String,
    pub signup_date: DateTime<Utc>,
    pub status: UserStatus,
    pub auth_id: Option<String>,
    /// Running coin balance, always the sum of the user's ledger deltas
    pub coins: i64,
}

impl User {
    pub fn is_active(&self) -> bool {
        self.status == UserStatus::Active
    }
}

//
// ================= Bank Data =================
//

/// A bank login linked through Plaid
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlaidItem {
    pub plaid_id: Uuid,
    pub user_id: Uuid,
    pub item_id: String,
    #[serde(skip_serializing, default)]
    pub access_token: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Account {
    pub account_id: Uuid,
    pub user_id: Uuid,
    pub plaid_id: Uuid,
    pub account_plaid_id: String,
    pub account_name: Option<String>,
    pub account_type: Option<String>,
    pub account_subtype: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Transaction {
    pub transaction_id: Uuid,
    pub user_id: Uuid,
    pub account_id: Uuid,
    pub trans_amount: Decimal,
    pub category_id: Option<String>,
    pub is_preferred_saving: Option<String>,
    pub trans_date: NaiveDate,
    pub post_date: Option<NaiveDate>,
    pub merchant: MerchantInfo,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MerchantInfo {
    /// Plaid category hierarchy joined with ';'
    pub category: Option<String>,
    pub address: Option<String>,
    pub city: Option<String>,
    pub state: Option<String>,
    pub country: Option<String>,
    pub postal_code: Option<String>,
    pub longitude: Option<String>,
    pub latitude: Option<String>,
}

//
// ================= Savings =================
//

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SavingsEntry {
    pub savings_id: Uuid,
    pub user_id: Uuid,
    /// Negative for withdrawals
    pub savings_amount: Decimal,
    pub total_savings: Decimal,
    pub predicted_savings: Option<Decimal>,
    pub transfer_date: NaiveDate,
    pub update_date: NaiveDate,
}

//
// ================= Habits =================
//

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Habit {
    pub habit_id: Uuid,
    pub user_id: Uuid,
    pub habit_name: String,
    pub habit_category: String,
    pub time_hour: u8,
    pub time_minute: u8,
    pub time_day_of_week: DayPattern,
}

//
// ================= Coins =================
//

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum CoinReason {
    Registration,
    Login,
    Saving,
    Lottery,
}

impl CoinReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            CoinReason::Registration => "registration",
            CoinReason::Login => "login",
            CoinReason::Saving => "saving",
            CoinReason::Lottery => "lottery",
        }
    }

    pub fn from_db(value: &str) -> Option<Self> {
        match value {
            "registration" => Some(CoinReason::Registration),
            "login" => Some(CoinReason::Login),
            "saving" => Some(CoinReason::Saving),
            "lottery" => Some(CoinReason::Lottery),
            _ => None,
        }
    }
}

impl fmt::Display for CoinReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One coin ledger delta
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CoinEntry {
    pub coin_id: Uuid,
    pub user_id: Uuid,
    pub coin_amount: i64,
    /// Local calendar date of the award
    pub log_date: NaiveDate,
    pub description: CoinReason,
    pub created_at: DateTime<Utc>,
}

impl CoinEntry {
    pub fn new(user_id: Uuid, coin_amount: i64, log_date: NaiveDate, description: CoinReason) -> Self {
        Self {
            coin_id: Uuid::new_v4(),
            user_id,
            coin_amount,
            log_date,
            description,
            created_at: Utc::now(),
        }
    }
}

//
// ================= Lotteries =================
//

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "kind", content = "user_id", rename_all = "snake_case")]
pub enum DrawOutcome {
    Winner(Uuid),
    NoEntries,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Lottery {
    pub lottery_id: Uuid,
    pub lottery_name: String,
    /// Coins per entry
    pub cost: i64,
    pub end_date: DateTime<Utc>,
    pub outcome: Option<DrawOutcome>,
    pub drawn_at: Option<DateTime<Utc>>,
}

impl Lottery {
    pub fn is_open(&self, now: DateTime<Utc>) -> bool {
        self.outcome.is_none() && self.end_date > now
    }

    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.outcome.is_none() && self.end_date <= now
    }

    pub fn winner(&self) -> Option<Uuid> {
        match self.outcome {
            Some(DrawOutcome::Winner(user_id)) => Some(user_id),
            _ => None,
        }
    }
}

/// Number of entries a user holds in a lottery
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct LotteryEntry {
    pub lottery_id: Uuid,
    pub user_id: Uuid,
    pub entries: u32,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn lottery(end_date: DateTime<Utc>) -> Lottery {
        Lottery {
            lottery_id: Uuid::new_v4(),
            lottery_name: "Weekly".to_string(),
            cost: 5,
            end_date,
            outcome: None,
            drawn_at: None,
        }
    }

    #[test]
    fn test_lottery_open_and_due() {
        let now = Utc::now();
        let running = lottery(now + Duration::hours(1));
        assert!(running.is_open(now));
        assert!(!running.is_due(now));

        let ended = lottery(now);
        assert!(!ended.is_open(now));
        assert!(ended.is_due(now));
    }

    #[test]
    fn test_drawn_lottery_is_never_due() {
        let now = Utc::now();
        let mut drawn = lottery(now - Duration::days(1));
        drawn.outcome = Some(DrawOutcome::NoEntries);
        assert!(!drawn.is_due(now));
        assert!(drawn.winner().is_none());
    }

    #[test]
    fn test_coin_reason_db_names() {
        for reason in [
            CoinReason::Registration,
            CoinReason::Login,
            CoinReason::Saving,
            CoinReason::Lottery,
        ] {
            assert_eq!(CoinReason::from_db(reason.as_str()), Some(reason));
        }
        assert_eq!(CoinReason::from_db("bonus"), None);
    }
}
