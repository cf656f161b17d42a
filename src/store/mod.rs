//! Persistence layer
//!
//! Every table the service touches sits behind the `Store` trait.
//! `InMemoryStore` backs tests and local development; `PgStore` is used
//! when a database URL is configured.

pub mod postgres;

pub use postgres::PgStore;

use crate::coins::login_reward;
use crate::config::CoinRules;
use crate::error::ImpulsesError;
use crate::models::{
    Account, CoinEntry, CoinReason, DrawOutcome, Habit, Lottery, LotteryEntry, PlaidItem,
    SavingsEntry, Transaction, User,
};
use crate::Result;
use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{info, warn};
use uuid::Uuid;

/// Trait for state persistence
#[async_trait::async_trait]
pub trait Store: Send + Sync {
    // Users
    async fn insert_user(&self, user: User) -> Result<()>;
    async fn get_user(&self, user_id: Uuid) -> Result<Option<User>>;
    async fn find_user_by_email(&self, email: &str) -> Result<Option<User>>;
    async fn find_user_by_phone(&self, phone: &str) -> Result<Option<User>>;
    async fn list_users(&self) -> Result<Vec<User>>;

    // Linked bank data
    /// Write a newly linked item with its accounts and transactions, all or
    /// nothing. A user who already has an item keeps it: nothing is written
    /// and the existing item is returned.
    async fn link_item(
        &self,
        item: PlaidItem,
        accounts: &[Account],
        transactions: &[Transaction],
    ) -> Result<Option<PlaidItem>>;
    async fn plaid_item_for_user(&self, user_id: Uuid) -> Result<Option<PlaidItem>>;
    async fn accounts_for_user(&self, user_id: Uuid) -> Result<Vec<Account>>;
    async fn insert_transactions(&self, transactions: &[Transaction]) -> Result<()>;
    async fn transactions_since(&self, user_id: Uuid, since: NaiveDate) -> Result<Vec<Transaction>>;

    // Savings
    /// Append a savings delta, computing the running total atomically.
    /// Fails if the total would drop below zero.
    async fn append_savings(
        &self,
        user_id: Uuid,
        amount: Decimal,
        transfer_date: NaiveDate,
        update_date: NaiveDate,
    ) -> Result<SavingsEntry>;
    async fn savings_history(&self, user_id: Uuid) -> Result<Vec<SavingsEntry>>;

    // Habits
    async fn insert_habit(&self, habit: Habit) -> Result<()>;
    async fn list_habits(&self) -> Result<Vec<Habit>>;
    async fn habits_for_user(&self, user_id: Uuid) -> Result<Vec<Habit>>;

    // Coins
    /// Apply a ledger entry and return the new balance.
    /// Fails if the balance would drop below zero.
    async fn apply_coin_entry(&self, entry: CoinEntry) -> Result<i64>;
    /// Pay the login reward for `today` unless one was already paid.
    /// The lookup and the payment happen atomically. Returns the entry and
    /// the new balance.
    async fn award_login(
        &self,
        user_id: Uuid,
        today: NaiveDate,
        rules: CoinRules,
    ) -> Result<Option<(CoinEntry, i64)>>;
    async fn coin_entries(&self, user_id: Uuid) -> Result<Vec<CoinEntry>>;

    // Lotteries
    async fn insert_lottery(&self, lottery: Lottery) -> Result<()>;
    async fn get_lottery(&self, lottery_id: Uuid) -> Result<Option<Lottery>>;
    async fn lotteries_due(&self, now: DateTime<Utc>) -> Result<Vec<Lottery>>;
    /// Deduct `payment` and add one entry, atomically. The lottery must be
    /// open at `now` and the user must afford the cost.
    async fn purchase_entry(
        &self,
        lottery_id: Uuid,
        payment: CoinEntry,
        now: DateTime<Utc>,
    ) -> Result<LotteryEntry>;
    async fn lottery_entries(&self, lottery_id: Uuid) -> Result<Vec<LotteryEntry>>;
    /// Draw a lottery with no outcome yet. `pick` sees the final entries and
    /// no purchase can land between the read and the recorded outcome.
    /// Returns the outcome and total entries, or `None` if already drawn.
    async fn draw_lottery(
        &self,
        lottery_id: Uuid,
        drawn_at: DateTime<Utc>,
        pick: &(dyn for<'e> Fn(&'e [LotteryEntry]) -> DrawOutcome + Send + Sync),
    ) -> Result<Option<(DrawOutcome, u32)>>;
}

/// Build the store from configuration: Postgres when a URL is given,
/// in-memory otherwise
pub fn build_store(database_url: Option<&str>) -> Arc<dyn Store> {
    if let Some(url) = database_url {
        match PgStore::connect_lazy(url) {
            Ok(store) => {
                info!("Store backend: postgres");
                return Arc::new(store);
            }
            Err(error) => {
                warn!(
                    "Failed to initialize postgres store, falling back to in-memory: {}",
                    error
                );
            }
        }
    }

    info!("Store backend: in-memory");
    Arc::new(InMemoryStore::new())
}

#[derive(Default)]
struct Tables {
    users: HashMap<Uuid, User>,
    plaid_items: Vec<PlaidItem>,
    accounts: Vec<Account>,
    transactions: Vec<Transaction>,
    savings: Vec<SavingsEntry>,
    habits: Vec<Habit>,
    coins: Vec<CoinEntry>,
    lotteries: HashMap<Uuid, Lottery>,
    entries: HashMap<(Uuid, Uuid), LotteryEntry>, // (lottery_id, user_id)
}

impl Tables {
    fn user_mut(&mut self, user_id: Uuid) -> Result<&mut User> {
        self.users
            .get_mut(&user_id)
            .ok_or_else(|| ImpulsesError::UserNotFound(user_id.to_string()))
    }
}

/// In-memory store for development and tests.
///
/// A single lock covers every table so multi-table updates are atomic.
pub struct InMemoryStore {
    tables: Arc<RwLock<Tables>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self {
            tables: Arc::new(RwLock::new(Tables::default())),
        }
    }
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl Store for InMemoryStore {

    async fn insert_user(&self, user: User) -> Result<()> {
        let mut tables = self.tables.write().await;

        let email = user.email.to_lowercase();
        if tables
            .users
            .values()
            .any(|u| u.email.to_lowercase() == email || u.phone == user.phone)
        {
            return Err(ImpulsesError::DuplicateUser(format!(
                "email {} or phone {} already registered",
                user.email, user.phone
            )));
        }

        tables.users.insert(user.user_id, user);
        Ok(())
    }

    async fn get_user(&self, user_id: Uuid) -> Result<Option<User>> {
        let tables = self.tables.read().await;
        Ok(tables.users.get(&user_id).cloned())
    }

    async fn find_user_by_email(&self, email: &str) -> Result<Option<User>> {
        let email = email.to_lowercase();
        let tables = self.tables.read().await;
        Ok(tables
            .users
            .values()
            .find(|u| u.email.to_lowercase() == email)
            .cloned())
    }

    async fn find_user_by_phone(&self, phone: &str) -> Result<Option<User>> {
        let tables = self.tables.read().await;
        Ok(tables.users.values().find(|u| u.phone == phone).cloned())
    }

    async fn list_users(&self) -> Result<Vec<User>> {
        let tables = self.tables.read().await;
        let mut users: Vec<User> = tables.users.values().cloned().collect();
        users.sort_by_key(|u| u.signup_date);
        Ok(users)
    }

    async fn link_item(
        &self,
        item: PlaidItem,
        accounts: &[Account],
        transactions: &[Transaction],
    ) -> Result<Option<PlaidItem>> {
        let mut tables = self.tables.write().await;
        tables.user_mut(item.user_id)?;

        if let Some(existing) = tables.plaid_items.iter().find(|i| i.user_id == item.user_id) {
            return Ok(Some(existing.clone()));
        }
        if let Some(orphan) = transactions
            .iter()
            .find(|t| !accounts.iter().any(|a| a.account_id == t.account_id))
        {
            return Err(ImpulsesError::InvalidInput(format!(
                "transaction {} references an account outside this item",
                orphan.transaction_id
            )));
        }

        tables.plaid_items.push(item);
        tables.accounts.extend_from_slice(accounts);
        tables.transactions.extend_from_slice(transactions);
        Ok(None)
    }

    async fn plaid_item_for_user(&self, user_id: Uuid) -> Result<Option<PlaidItem>> {
        let tables = self.tables.read().await;
        Ok(tables
            .plaid_items
            .iter()
            .find(|item| item.user_id == user_id)
            .cloned())
    }

    async fn accounts_for_user(&self, user_id: Uuid) -> Result<Vec<Account>> {
        let tables = self.tables.read().await;
        Ok(tables
            .accounts
            .iter()
            .filter(|a| a.user_id == user_id)
            .cloned()
            .collect())
    }

    async fn insert_transactions(&self, transactions: &[Transaction]) -> Result<()> {
        let mut tables = self.tables.write().await;
        tables.transactions.extend_from_slice(transactions);
        Ok(())
    }

    async fn transactions_since(&self, user_id: Uuid, since: NaiveDate) -> Result<Vec<Transaction>> {
        let tables = self.tables.read().await;
        let mut transactions: Vec<Transaction> = tables
            .transactions
            .iter()
            .filter(|t| t.user_id == user_id && t.trans_date >= since)
            .cloned()
            .collect();
        transactions.sort_by_key(|t| t.trans_date);
        Ok(transactions)
    }

    async fn append_savings(
        &self,
        user_id: Uuid,
        amount: Decimal,
        transfer_date: NaiveDate,
        update_date: NaiveDate,
    ) -> Result<SavingsEntry> {
        let mut tables = self.tables.write().await;
        tables.user_mut(user_id)?;

        let previous = tables
            .savings
            .iter()
            .rev()
            .find(|s| s.user_id == user_id)
            .map(|s| s.total_savings)
            .unwrap_or(Decimal::ZERO);

        let total = previous + amount;
        if total < Decimal::ZERO {
            return Err(ImpulsesError::InsufficientSavings(format!(
                "withdrawal of {} exceeds total savings {}",
                -amount, previous
            )));
        }

        let entry = SavingsEntry {
            savings_id: Uuid::new_v4(),
            user_id,
            savings_amount: amount,
            total_savings: total,
            predicted_savings: None,
            transfer_date,
            update_date,
        };
        tables.savings.push(entry.clone());
        Ok(entry)
    }

    async fn savings_history(&self, user_id: Uuid) -> Result<Vec<SavingsEntry>> {
        let tables = self.tables.read().await;
        Ok(tables
            .savings
            .iter()
            .filter(|s| s.user_id == user_id)
            .cloned()
            .collect())
    }

    async fn insert_habit(&self, habit: Habit) -> Result<()> {
        let mut tables = self.tables.write().await;
        tables.user_mut(habit.user_id)?;
        tables.habits.push(habit);
        Ok(())
    }

    async fn list_habits(&self) -> Result<Vec<Habit>> {
        let tables = self.tables.read().await;
        Ok(tables.habits.clone())
    }

    async fn habits_for_user(&self, user_id: Uuid) -> Result<Vec<Habit>> {
        let tables = self.tables.read().await;
        Ok(tables
            .habits
            .iter()
            .filter(|h| h.user_id == user_id)
            .cloned()
            .collect())
    }

    async fn apply_coin_entry(&self, entry: CoinEntry) -> Result<i64> {
        let mut tables = self.tables.write().await;
        let user = tables.user_mut(entry.user_id)?;

        let balance = user.coins + entry.coin_amount;
        if balance < 0 {
            return Err(ImpulsesError::InsufficientCoins {
                balance: user.coins,
                required: -entry.coin_amount,
            });
        }
        user.coins = balance;
        tables.coins.push(entry);
        Ok(balance)
    }

    async fn award_login(
        &self,
        user_id: Uuid,
        today: NaiveDate,
        rules: CoinRules,
    ) -> Result<Option<(CoinEntry, i64)>> {
        let mut tables = self.tables.write().await;
        tables.user_mut(user_id)?;

        let last = tables
            .coins
            .iter()
            .filter(|c| {
                c.user_id == user_id
                    && matches!(c.description, CoinReason::Registration | CoinReason::Login)
            })
            .map(|c| c.log_date)
            .max();
        let Some((amount, reason)) = login_reward(last, today, rules) else {
            return Ok(None);
        };

        let entry = CoinEntry::new(user_id, amount, today, reason);
        let user = tables.user_mut(user_id)?;
        user.coins += amount;
        let balance = user.coins;
        tables.coins.push(entry.clone());
        Ok(Some((entry, balance)))
    }

    async fn coin_entries(&self, user_id: Uuid) -> Result<Vec<CoinEntry>> {
        let tables = self.tables.read().await;
        Ok(tables
            .coins
            .iter()
            .filter(|c| c.user_id == user_id)
            .cloned()
            .collect())
    }

    async fn insert_lottery(&self, lottery: Lottery) -> Result<()> {
        let mut tables = self.tables.write().await;
        tables.lotteries.insert(lottery.lottery_id, lottery);
        Ok(())
    }

    async fn get_lottery(&self, lottery_id: Uuid) -> Result<Option<Lottery>> {
        let tables = self.tables.read().await;
        Ok(tables.lotteries.get(&lottery_id).cloned())
    }

    async fn lotteries_due(&self, now: DateTime<Utc>) -> Result<Vec<Lottery>> {
        let tables = self.tables.read().await;
        let mut due: Vec<Lottery> = tables
            .lotteries
            .values()
            .filter(|l| l.is_due(now))
            .cloned()
            .collect();
        due.sort_by_key(|l| l.end_date);
        Ok(due)
    }

    async fn purchase_entry(
        &self,
        lottery_id: Uuid,
        payment: CoinEntry,
        now: DateTime<Utc>,
    ) -> Result<LotteryEntry> {
        let mut tables = self.tables.write().await;

        let lottery = tables
            .lotteries
            .get(&lottery_id)
            .ok_or(ImpulsesError::LotteryNotFound(lottery_id))?;
        if !lottery.is_open(now) {
            return Err(ImpulsesError::LotteryClosed(lottery.lottery_name.clone()));
        }

        let user_id = payment.user_id;
        let user = tables.user_mut(user_id)?;
        let balance = user.coins + payment.coin_amount;
        if balance < 0 {
            return Err(ImpulsesError::InsufficientCoins {
                balance: user.coins,
                required: -payment.coin_amount,
            });
        }
        user.coins = balance;
        tables.coins.push(payment);

        let entry = tables
            .entries
            .entry((lottery_id, user_id))
            .or_insert_with(|| LotteryEntry {
                lottery_id,
                user_id,
                entries: 0,
            });
        entry.entries += 1;
        Ok(entry.clone())
    }

    async fn lottery_entries(&self, lottery_id: Uuid) -> Result<Vec<LotteryEntry>> {
        let tables = self.tables.read().await;
        let mut entries: Vec<LotteryEntry> = tables
            .entries
            .values()
            .filter(|e| e.lottery_id == lottery_id)
            .cloned()
            .collect();
        entries.sort_by_key(|e| e.user_id);
        Ok(entries)
    }

    async fn draw_lottery(
        &self,
        lottery_id: Uuid,
        drawn_at: DateTime<Utc>,
        pick: &(dyn for<'e> Fn(&'e [LotteryEntry]) -> DrawOutcome + Send + Sync),
    ) -> Result<Option<(DrawOutcome, u32)>> {
        let mut tables = self.tables.write().await;
        let already_drawn = tables
            .lotteries
            .get(&lottery_id)
            .ok_or(ImpulsesError::LotteryNotFound(lottery_id))?
            .outcome
            .is_some();
        if already_drawn {
            return Ok(None);
        }

        let mut entries: Vec<LotteryEntry> = tables
            .entries
            .values()
            .filter(|e| e.lottery_id == lottery_id)
            .cloned()
            .collect();
        entries.sort_by_key(|e| e.user_id);
        let total_entries = entries.iter().map(|e| e.entries).sum();
        let outcome = pick(&entries);

        if let Some(lottery) = tables.lotteries.get_mut(&lottery_id) {
            lottery.outcome = Some(outcome);
            lottery.drawn_at = Some(drawn_at);
        }
        Ok(Some((outcome, total_entries)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::UserStatus;
    use chrono::Duration;
    use rust_decimal_macros::dec;

    fn user(email: &str, phone: &str) -> User {
        User {
            user_id: Uuid::new_v4(),
            first_name: "Grace".to_string(),
            last_name: "Hopper".to_string(),
            email: email.to_string(),
            phone: phone.to_string(),
            password_hash: "x".to_string(),
            signup_date: Utc::now(),
            status: UserStatus::Active,
            auth_id: None,
            coins: 0,
        }
    }

    fn today() -> NaiveDate {
        Utc::now().date_naive()
    }

    #[test]
    fn test_build_store_defaults_to_memory() {
        let store = build_store(None);
        let users = tokio_test::block_on(store.list_users()).unwrap();
        assert!(users.is_empty());
    }

    #[tokio::test]
    async fn test_unique_email_and_phone() {
        let store = InMemoryStore::new();
        store.insert_user(user("a@example.com", "1111111111")).await.unwrap();

        let same_email = store.insert_user(user("A@Example.com", "2222222222")).await;
        assert!(matches!(same_email, Err(ImpulsesError::DuplicateUser(_))));

        let same_phone = store.insert_user(user("b@example.com", "1111111111")).await;
        assert!(matches!(same_phone, Err(ImpulsesError::DuplicateUser(_))));

        assert_eq!(store.list_users().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_coin_balance_tracks_ledger() {
        let store = InMemoryStore::new();
        let u = user("c@example.com", "3333333333");
        let user_id = u.user_id;
        store.insert_user(u).await.unwrap();

        store
            .apply_coin_entry(CoinEntry::new(user_id, 10, today(), CoinReason::Registration))
            .await
            .unwrap();
        let balance = store
            .apply_coin_entry(CoinEntry::new(user_id, -4, today(), CoinReason::Lottery))
            .await
            .unwrap();
        assert_eq!(balance, 6);

        let overdraw = store
            .apply_coin_entry(CoinEntry::new(user_id, -7, today(), CoinReason::Lottery))
            .await;
        assert!(matches!(
            overdraw,
            Err(ImpulsesError::InsufficientCoins { balance: 6, required: 7 })
        ));

        let ledger: i64 = store
            .coin_entries(user_id)
            .await
            .unwrap()
            .iter()
            .map(|c| c.coin_amount)
            .sum();
        let stored = store.get_user(user_id).await.unwrap().unwrap().coins;
        assert_eq!(ledger, stored);
    }

    #[tokio::test]
    async fn test_savings_running_total() {
        let store = InMemoryStore::new();
        let u = user("d@example.com", "4444444444");
        let user_id = u.user_id;
        store.insert_user(u).await.unwrap();

        store.append_savings(user_id, dec!(12.50), today(), today()).await.unwrap();
        let second = store.append_savings(user_id, dec!(7.25), today(), today()).await.unwrap();
        assert_eq!(second.total_savings, dec!(19.75));

        let overdraw = store.append_savings(user_id, dec!(-20), today(), today()).await;
        assert!(matches!(overdraw, Err(ImpulsesError::InsufficientSavings(_))));
        assert_eq!(store.savings_history(user_id).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_draw_lottery_only_once() {
        let store = InMemoryStore::new();
        let lottery = Lottery {
            lottery_id: Uuid::new_v4(),
            lottery_name: "Spring".to_string(),
            cost: 3,
            end_date: Utc::now() - Duration::minutes(1),
            outcome: None,
            drawn_at: None,
        };
        let lottery_id = lottery.lottery_id;
        store.insert_lottery(lottery).await.unwrap();
        assert_eq!(store.lotteries_due(Utc::now()).await.unwrap().len(), 1);

        let first = store
            .draw_lottery(lottery_id, Utc::now(), &|_| DrawOutcome::NoEntries)
            .await
            .unwrap();
        assert_eq!(first, Some((DrawOutcome::NoEntries, 0)));

        let winner = Uuid::new_v4();
        let second = store
            .draw_lottery(lottery_id, Utc::now(), &move |_| DrawOutcome::Winner(winner))
            .await
            .unwrap();
        assert!(second.is_none());

        let stored = store.get_lottery(lottery_id).await.unwrap().unwrap();
        assert_eq!(stored.outcome, Some(DrawOutcome::NoEntries));
        assert!(store.lotteries_due(Utc::now()).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_draw_lottery_sees_entries_and_closes_purchases() {
        let store = InMemoryStore::new();
        let u = user("f@example.com", "6666666666");
        let user_id = u.user_id;
        store.insert_user(u).await.unwrap();
        store
            .apply_coin_entry(CoinEntry::new(user_id, 10, today(), CoinReason::Saving))
            .await
            .unwrap();

        let now = Utc::now();
        let lottery = Lottery {
            lottery_id: Uuid::new_v4(),
            lottery_name: "Summer".to_string(),
            cost: 2,
            end_date: now + Duration::minutes(5),
            outcome: None,
            drawn_at: None,
        };
        let lottery_id = lottery.lottery_id;
        store.insert_lottery(lottery).await.unwrap();
        for _ in 0..2 {
            store
                .purchase_entry(lottery_id, CoinEntry::new(user_id, -2, today(), CoinReason::Lottery), now)
                .await
                .unwrap();
        }

        let drawn = store
            .draw_lottery(lottery_id, now, &|entries| match entries.first() {
                Some(entry) => DrawOutcome::Winner(entry.user_id),
                None => DrawOutcome::NoEntries,
            })
            .await
            .unwrap();
        assert_eq!(drawn, Some((DrawOutcome::Winner(user_id), 2)));

        let late = store
            .purchase_entry(lottery_id, CoinEntry::new(user_id, -2, today(), CoinReason::Lottery), now)
            .await;
        assert!(matches!(late, Err(ImpulsesError::LotteryClosed(_))));
        assert_eq!(store.get_user(user_id).await.unwrap().unwrap().coins, 6);
    }

    #[tokio::test]
    async fn test_award_login_pays_once_per_day() {
        let store = InMemoryStore::new();
        let u = user("g@example.com", "7777777777");
        let user_id = u.user_id;
        store.insert_user(u).await.unwrap();
        let rules = CoinRules::default();
        let day = NaiveDate::from_ymd_opt(2024, 3, 1).unwrap();

        let (entry, balance) = store.award_login(user_id, day, rules).await.unwrap().unwrap();
        assert_eq!(entry.description, CoinReason::Registration);
        assert_eq!(balance, 10);
        assert!(store.award_login(user_id, day, rules).await.unwrap().is_none());

        let next = day.succ_opt().unwrap();
        let (entry, balance) = store.award_login(user_id, next, rules).await.unwrap().unwrap();
        assert_eq!(entry.description, CoinReason::Login);
        assert_eq!(balance, 12);

        assert!(matches!(
            store.award_login(Uuid::new_v4(), day, rules).await,
            Err(ImpulsesError::UserNotFound(_))
        ));
    }

    fn linked(user_id: Uuid) -> (PlaidItem, Vec<Account>, Vec<Transaction>) {
        let item = PlaidItem {
            plaid_id: Uuid::new_v4(),
            user_id,
            item_id: "item-1".to_string(),
            access_token: "access-sandbox".to_string(),
        };
        let account = Account {
            account_id: Uuid::new_v4(),
            user_id,
            plaid_id: item.plaid_id,
            account_plaid_id: "acc-1".to_string(),
            account_name: Some("Checking".to_string()),
            account_type: Some("depository".to_string()),
            account_subtype: Some("checking".to_string()),
        };
        let transaction = Transaction {
            transaction_id: Uuid::new_v4(),
            user_id,
            account_id: account.account_id,
            trans_amount: dec!(4.50),
            category_id: Some("13005043".to_string()),
            is_preferred_saving: None,
            trans_date: today(),
            post_date: None,
            merchant: Default::default(),
        };
        (item, vec![account], vec![transaction])
    }

    #[tokio::test]
    async fn test_link_item_writes_nothing_on_failure() {
        let store = InMemoryStore::new();
        let u = user("h@example.com", "8888888888");
        let user_id = u.user_id;
        store.insert_user(u).await.unwrap();

        let (item, accounts, mut transactions) = linked(user_id);
        let good = transactions[0].clone();
        let mut orphan = good.clone();
        orphan.transaction_id = Uuid::new_v4();
        orphan.account_id = Uuid::new_v4();
        transactions.push(orphan);

        let failed = store.link_item(item.clone(), &accounts, &transactions).await;
        assert!(matches!(failed, Err(ImpulsesError::InvalidInput(_))));
        assert!(store.plaid_item_for_user(user_id).await.unwrap().is_none());
        assert!(store.accounts_for_user(user_id).await.unwrap().is_empty());
        assert!(store.transactions_since(user_id, today()).await.unwrap().is_empty());

        // A retry with clean data links everything
        assert!(store.link_item(item, &accounts, &[good]).await.unwrap().is_none());
        assert!(store.plaid_item_for_user(user_id).await.unwrap().is_some());
        assert_eq!(store.accounts_for_user(user_id).await.unwrap().len(), 1);
        assert_eq!(store.transactions_since(user_id, today()).await.unwrap().len(), 1);

        // A second item keeps the first
        let (other, accounts, transactions) = linked(user_id);
        let existing = store.link_item(other, &accounts, &transactions).await.unwrap().unwrap();
        assert_eq!(existing.item_id, "item-1");
        assert_eq!(store.accounts_for_user(user_id).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_link_item_requires_known_user() {
        let store = InMemoryStore::new();
        let (item, accounts, transactions) = linked(Uuid::new_v4());
        assert!(matches!(
            store.link_item(item, &accounts, &transactions).await,
            Err(ImpulsesError::UserNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_habit_requires_known_user() {
        let store = InMemoryStore::new();
        let habit = Habit {
            habit_id: Uuid::new_v4(),
            user_id: Uuid::new_v4(),
            habit_name: "lunch".to_string(),
            habit_category: "food".to_string(),
            time_hour: 12,
            time_minute: 0,
            time_day_of_week: crate::schedule::DayPattern::everyday(),
        };
        assert!(matches!(
            store.insert_habit(habit).await,
            Err(ImpulsesError::UserNotFound(_))
        ));
    }
}
