//! Spending habit detection
//!
//! Looks for repeated spending in Plaid categories (coffee, lunch out,
//! ride hailing) that a user could turn into savings.

pub mod taxonomy;

pub use taxonomy::CategoryTaxonomy;

use crate::error::ImpulsesError;
use crate::models::{Habit, Transaction};
use crate::schedule::{validate_time, DayPattern};
use crate::store::Store;
use crate::Result;
use chrono::NaiveDate;
use lazy_static::lazy_static;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use tracing::{debug, info};
use uuid::Uuid;

lazy_static! {
    static ref COFFEE_CATEGORIES: HashSet<&'static str> = [
        "13005047", // Cafe
        "13005043", // Coffee Shop
    ]
    .into_iter()
    .collect();

    static ref NOT_LUNCH_CATEGORIES: HashSet<&'static str> = [
        "13005001", // Winery
        "13005019", // Juice Bar
        "13005024", // Ice Cream
        "13005037", // Distillery
        "13005043", // Coffee Shop
        "13005047", // Cafe
    ]
    .into_iter()
    .collect();

    static ref TRANSPORTATION_CATEGORIES: HashSet<&'static str> = [
        "22016000", // Taxi
        "22011000", // Limos and Chauffeurs
        "22006001", // Ride Share
    ]
    .into_iter()
    .collect();
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum SpendingHabit {
    Coffee,
    Lunch,
    Transportation,
}

impl SpendingHabit {
    pub fn from_name(name: &str) -> Option<Self> {
        name.parse().ok()
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            SpendingHabit::Coffee => "coffee",
            SpendingHabit::Lunch => "lunch",
            SpendingHabit::Transportation => "transportation",
        }
    }

    /// Plaid category ids that count towards this habit
    pub fn category_ids(&self, taxonomy: &CategoryTaxonomy) -> HashSet<String> {
        match self {
            SpendingHabit::Coffee => COFFEE_CATEGORIES.iter().map(|s| s.to_string()).collect(),
            SpendingHabit::Transportation => TRANSPORTATION_CATEGORIES
                .iter()
                .map(|s| s.to_string())
                .collect(),
            SpendingHabit::Lunch => taxonomy
                .ids_in_hierarchy("Restaurants")
                .into_iter()
                .filter(|id| !NOT_LUNCH_CATEGORIES.contains(id.as_str()))
                .collect(),
        }
    }
}

impl FromStr for SpendingHabit {
    type Err = ImpulsesError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "coffee" => Ok(SpendingHabit::Coffee),
            "lunch" => Ok(SpendingHabit::Lunch),
            "transportation" => Ok(SpendingHabit::Transportation),
            other => Err(ImpulsesError::InvalidInput(format!("unknown habit '{}'", other))),
        }
    }
}

impl fmt::Display for SpendingHabit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How often and how much a user spent on a habit
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HabitSummary {
    pub habit: SpendingHabit,
    pub count: usize,
    pub total_amount: Decimal,
}

/// Summarize matching transactions; `None` below the threshold
pub fn summarize(
    habit: SpendingHabit,
    transactions: &[Transaction],
    category_ids: &HashSet<String>,
    threshold: usize,
) -> Option<HabitSummary> {
    let matching: Vec<&Transaction> = transactions
        .iter()
        .filter(|t| {
            t.category_id
                .as_deref()
                .map(|id| category_ids.contains(id))
                .unwrap_or(false)
        })
        .collect();

    if matching.len() < threshold {
        return None;
    }

    let total_amount: Decimal = matching.iter().map(|t| t.trans_amount).sum();
    Some(HabitSummary {
        habit,
        count: matching.len(),
        total_amount: total_amount.round_dp(2),
    })
}

#[derive(Debug, Clone)]
pub struct NewHabit {
    pub habit_name: String,
    pub habit_category: String,
    pub time_hour: u8,
    pub time_minute: u8,
    pub time_day_of_week: String,
}

pub struct HabitTracker {
    store: Arc<dyn Store>,
    taxonomy: Arc<CategoryTaxonomy>,
}

impl HabitTracker {
    pub fn new(store: Arc<dyn Store>, taxonomy: Arc<CategoryTaxonomy>) -> Self {
        Self { store, taxonomy }
    }

    /// Register a reminder habit for a user
    pub async fn add_habit(&self, user_id: Uuid, new: NewHabit) -> Result<Habit> {
        let habit_name = new.habit_name.trim();
        if habit_name.is_empty() {
            return Err(ImpulsesError::InvalidInput("habit name is required".to_string()));
        }
        validate_time(new.time_hour, new.time_minute)?;
        let days = DayPattern::parse(&new.time_day_of_week)?;

        let habit = Habit {
            habit_id: Uuid::new_v4(),
            user_id,
            habit_name: habit_name.to_string(),
            habit_category: new.habit_category.trim().to_string(),
            time_hour: new.time_hour,
            time_minute: new.time_minute,
            time_day_of_week: days,
        };
        self.store.insert_habit(habit.clone()).await?;

        info!(
            user_id = %user_id,
            habit = %habit.habit_name,
            days = %habit.time_day_of_week,
            "Habit added"
        );
        Ok(habit)
    }

    pub async fn habits(&self, user_id: Uuid) -> Result<Vec<Habit>> {
        self.store.habits_for_user(user_id).await
    }

    /// Count the user's spending on `habit` since `since`.
    ///
    /// Returns `None` when there are fewer than `threshold` transactions.
    pub async fn detect(
        &self,
        user_id: Uuid,
        since: NaiveDate,
        habit: SpendingHabit,
        threshold: usize,
    ) -> Result<Option<HabitSummary>> {
        let transactions = self.store.transactions_since(user_id, since).await?;
        let category_ids = habit.category_ids(&self.taxonomy);
        let summary = summarize(habit, &transactions, &category_ids, threshold);

        debug!(
            user_id = %user_id,
            habit = %habit,
            scanned = transactions.len(),
            detected = summary.is_some(),
            "Habit detection"
        );
        Ok(summary)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::MerchantInfo;
    use rust_decimal_macros::dec;

    fn taxonomy() -> CategoryTaxonomy {
        CategoryTaxonomy::from_json(
            r#"{"categories": [
                {"category_id": "13005000", "group": "place", "hierarchy": ["Food and Drink", "Restaurants"]},
                {"category_id": "13005032", "group": "place", "hierarchy": ["Food and Drink", "Restaurants", "Fast Food"]},
                {"category_id": "13005043", "group": "place", "hierarchy": ["Food and Drink", "Restaurants", "Coffee Shop"]},
                {"category_id": "13005047", "group": "place", "hierarchy": ["Food and Drink", "Restaurants", "Cafe"]},
                {"category_id": "13005024", "group": "place", "hierarchy": ["Food and Drink", "Restaurants", "Ice Cream"]},
                {"category_id": "22016000", "group": "place", "hierarchy": ["Travel", "Taxi"]}
            ]}"#,
        )
        .unwrap()
    }

    fn tx(category: &str, amount: Decimal) -> Transaction {
        Transaction {
            transaction_id: Uuid::new_v4(),
            user_id: Uuid::nil(),
            account_id: Uuid::nil(),
            trans_amount: amount,
            category_id: Some(category.to_string()),
            is_preferred_saving: None,
            trans_date: NaiveDate::from_ymd_opt(2019, 10, 5).unwrap(),
            post_date: None,
            merchant: MerchantInfo::default(),
        }
    }

    #[test]
    fn test_parse_habit_names() {
        assert_eq!("Coffee".parse::<SpendingHabit>().unwrap(), SpendingHabit::Coffee);
        assert_eq!(" lunch ".parse::<SpendingHabit>().unwrap(), SpendingHabit::Lunch);
        assert!("gym".parse::<SpendingHabit>().is_err());
        assert_eq!(
            SpendingHabit::from_name("TRANSPORTATION"),
            Some(SpendingHabit::Transportation)
        );
        assert_eq!(SpendingHabit::from_name("rent"), None);
    }

    #[test]
    fn test_lunch_excludes_coffee_and_dessert() {
        let ids = SpendingHabit::Lunch.category_ids(&taxonomy());
        let mut ids: Vec<String> = ids.into_iter().collect();
        ids.sort();
        assert_eq!(ids, vec!["13005000".to_string(), "13005032".to_string()]);
    }

    #[test]
    fn test_fixed_category_sets() {
        let taxonomy = taxonomy();
        assert_eq!(SpendingHabit::Coffee.category_ids(&taxonomy).len(), 2);
        assert!(SpendingHabit::Transportation
            .category_ids(&taxonomy)
            .contains("22006001"));
    }

    #[test]
    fn test_summarize_threshold_and_total() {
        let transactions = vec![
            tx("13005043", dec!(4.25)),
            tx("13005047", dec!(3.10)),
            tx("13005032", dec!(11.00)),
            tx("13005043", dec!(4.333)),
        ];
        let coffee = SpendingHabit::Coffee.category_ids(&taxonomy());

        let summary = summarize(SpendingHabit::Coffee, &transactions, &coffee, 3).unwrap();
        assert_eq!(summary.count, 3);
        assert_eq!(summary.total_amount, dec!(11.68));

        assert!(summarize(SpendingHabit::Coffee, &transactions, &coffee, 4).is_none());
    }

    #[tokio::test]
    async fn test_detect_reads_transactions_since_date() {
        use crate::models::{Account, PlaidItem, User, UserStatus};
        use crate::store::InMemoryStore;

        let store: Arc<dyn Store> = Arc::new(InMemoryStore::new());
        let user_id = Uuid::new_v4();
        store
            .insert_user(User {
                user_id,
                first_name: "Cora".to_string(),
                last_name: "Fee".to_string(),
                email: "cora@example.com".to_string(),
                phone: "7185550188".to_string(),
                password_hash: String::new(),
                signup_date: chrono::Utc::now(),
                status: UserStatus::Active,
                auth_id: None,
                coins: 0,
            })
            .await
            .unwrap();
        let plaid_id = Uuid::new_v4();
        let account_id = Uuid::new_v4();
        let item = PlaidItem {
            plaid_id,
            user_id,
            item_id: "item".to_string(),
            access_token: "token".to_string(),
        };
        let account = Account {
            account_id,
            user_id,
            plaid_id,
            account_plaid_id: "acc".to_string(),
            account_name: None,
            account_type: None,
            account_subtype: None,
        };
        store.link_item(item, &[account], &[]).await.unwrap();

        let mut old = tx("13005043", dec!(5));
        old.trans_date = NaiveDate::from_ymd_opt(2019, 9, 1).unwrap();
        let transactions: Vec<Transaction> = vec![old, tx("13005043", dec!(4.5)), tx("22016000", dec!(30))]
            .into_iter()
            .map(|mut t| {
                t.user_id = user_id;
                t.account_id = account_id;
                t
            })
            .collect();
        store.insert_transactions(&transactions).await.unwrap();

        let tracker = HabitTracker::new(store, Arc::new(taxonomy()));
        let since = NaiveDate::from_ymd_opt(2019, 10, 1).unwrap();

        let coffee = tracker
            .detect(user_id, since, SpendingHabit::Coffee, 1)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(coffee.count, 1);
        assert_eq!(coffee.total_amount, dec!(4.5));

        assert!(tracker
            .detect(user_id, since, SpendingHabit::Transportation, 2)
            .await
            .unwrap()
            .is_none());
    }

    #[test]
    fn test_summarize_ignores_uncategorized() {
        let mut uncategorized = tx("13005043", dec!(2));
        uncategorized.category_id = None;
        let coffee = SpendingHabit::Coffee.category_ids(&taxonomy());
        assert!(summarize(SpendingHabit::Coffee, &[uncategorized], &coffee, 1).is_none());
    }
}
