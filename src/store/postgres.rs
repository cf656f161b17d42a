//! Postgres-backed store
//!
//! Schema is created lazily on first use. Multi-table updates run inside
//! a single SQL transaction with the user row locked.

use super::Store;
use crate::coins::login_reward;
use crate::config::CoinRules;
use crate::error::ImpulsesError;
use crate::models::{
    Account, CoinEntry, CoinReason, DrawOutcome, Habit, Lottery, LotteryEntry, MerchantInfo,
    PlaidItem, SavingsEntry, Transaction, User, UserStatus,
};
use crate::schedule::DayPattern;
use crate::Result;
use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::{PgConnection, Row};
use std::sync::Arc;
use tokio::sync::OnceCell;
use uuid::Uuid;

const SCHEMA: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS users (
      user_id UUID PRIMARY KEY,
      first_name TEXT NOT NULL,
      last_name TEXT NOT NULL,
      email TEXT NOT NULL,
      phone TEXT NOT NULL UNIQUE,
      password_hash TEXT NOT NULL,
      signup_date TIMESTAMPTZ NOT NULL DEFAULT NOW(),
      status TEXT NOT NULL DEFAULT 'active',
      auth_id TEXT,
      coins BIGINT NOT NULL DEFAULT 0 CHECK (coins >= 0)
    );
    "#,
    r#"
    CREATE UNIQUE INDEX IF NOT EXISTS idx_users_email_lower ON users (LOWER(email));
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS plaid_items (
      plaid_id UUID PRIMARY KEY,
      user_id UUID NOT NULL REFERENCES users (user_id),
      item_id TEXT NOT NULL,
      access_token TEXT NOT NULL
    );
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS accounts (
      account_id UUID PRIMARY KEY,
      user_id UUID NOT NULL REFERENCES users (user_id),
      plaid_id UUID NOT NULL REFERENCES plaid_items (plaid_id),
      account_plaid_id TEXT NOT NULL,
      account_name TEXT,
      account_type TEXT,
      account_subtype TEXT
    );
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS transactions (
      transaction_id UUID PRIMARY KEY,
      user_id UUID NOT NULL REFERENCES users (user_id),
      account_id UUID NOT NULL REFERENCES accounts (account_id),
      trans_amount NUMERIC(10, 2) NOT NULL,
      category_id TEXT,
      is_preferred_saving TEXT,
      trans_date DATE NOT NULL,
      post_date DATE,
      merchant_category TEXT,
      merchant_address TEXT,
      merchant_city TEXT,
      merchant_state TEXT,
      merchant_country TEXT,
      merchant_postal_code TEXT,
      merchant_longitude TEXT,
      merchant_latitude TEXT
    );
    "#,
    r#"
    CREATE INDEX IF NOT EXISTS idx_transactions_user_date ON transactions (user_id, trans_date);
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS savings_history (
      savings_id UUID PRIMARY KEY,
      user_id UUID NOT NULL REFERENCES users (user_id),
      savings_amount NUMERIC(10, 2) NOT NULL,
      total_savings NUMERIC(10, 2) NOT NULL CHECK (total_savings >= 0),
      predicted_savings NUMERIC(10, 2),
      transfer_date DATE NOT NULL,
      update_date DATE NOT NULL,
      created_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
    );
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS habits (
      habit_id UUID PRIMARY KEY,
      user_id UUID NOT NULL REFERENCES users (user_id),
      habit_name TEXT NOT NULL,
      habit_category TEXT NOT NULL,
      time_hour SMALLINT NOT NULL,
      time_minute SMALLINT NOT NULL,
      time_day_of_week TEXT NOT NULL
    );
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS coins (
      coin_id UUID PRIMARY KEY,
      user_id UUID NOT NULL REFERENCES users (user_id),
      coin_amount BIGINT NOT NULL,
      log_date DATE NOT NULL,
      description TEXT NOT NULL,
      created_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
    );
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS lotteries (
      lottery_id UUID PRIMARY KEY,
      lottery_name TEXT NOT NULL,
      cost BIGINT NOT NULL CHECK (cost > 0),
      end_date TIMESTAMPTZ NOT NULL,
      drawn BOOLEAN NOT NULL DEFAULT FALSE,
      winner_user_id UUID REFERENCES users (user_id),
      drawn_at TIMESTAMPTZ
    );
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS lottery_entries (
      lottery_id UUID NOT NULL REFERENCES lotteries (lottery_id),
      user_id UUID NOT NULL REFERENCES users (user_id),
      entries INTEGER NOT NULL DEFAULT 0,
      PRIMARY KEY (lottery_id, user_id)
    );
    "#,
];

pub struct PgStore {
    pool: PgPool,
    schema_ready: Arc<OnceCell<()>>,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool,
            schema_ready: Arc::new(OnceCell::new()),
        }
    }

    pub fn connect_lazy(url: &str) -> Result<Self> {
        let pool = PgPoolOptions::new().max_connections(5).connect_lazy(url)?;
        Ok(Self::new(pool))
    }

    async fn ensure_schema(&self) -> Result<()> {
        self.schema_ready
            .get_or_try_init(|| async {
                for statement in SCHEMA {
                    sqlx::query(statement).execute(&self.pool).await?;
                }
                Ok::<(), sqlx::Error>(())
            })
            .await
            .map_err(|e| {
                ImpulsesError::DatabaseError(format!("Failed to initialize schema: {}", e))
            })?;

        Ok(())
    }

    async fn fetch_user(&self, sql: &str, key: &str) -> Result<Option<User>> {
        self.ensure_schema().await?;
        let row = sqlx::query(sql).bind(key).fetch_optional(&self.pool).await?;
        row.as_ref().map(user_from_row).transpose()
    }
}

fn is_unique_violation(err: &sqlx::Error) -> bool {
    err.as_database_error()
        .and_then(|e| e.code())
        .map(|code| code == "23505")
        .unwrap_or(false)
}

/// Lock the user row and apply a coin delta inside an open transaction
async fn apply_coin_entry_tx(conn: &mut PgConnection, entry: &CoinEntry) -> Result<i64> {
    let row = sqlx::query("SELECT coins FROM users WHERE user_id = $1 FOR UPDATE")
        .bind(entry.user_id)
        .fetch_optional(&mut *conn)
        .await?;
    let Some(row) = row else {
        return Err(ImpulsesError::UserNotFound(entry.user_id.to_string()));
    };

    let coins: i64 = row.try_get("coins")?;
    let balance = coins + entry.coin_amount;
    if balance < 0 {
        return Err(ImpulsesError::InsufficientCoins {
            balance: coins,
            required: -entry.coin_amount,
        });
    }

    sqlx::query("UPDATE users SET coins = $1 WHERE user_id = $2")
        .bind(balance)
        .bind(entry.user_id)
        .execute(&mut *conn)
        .await?;

    sqlx::query(
        r#"
        INSERT INTO coins (coin_id, user_id, coin_amount, log_date, description, created_at)
        VALUES ($1, $2, $3, $4, $5, $6)
        "#,
    )
    .bind(entry.coin_id)
    .bind(entry.user_id)
    .bind(entry.coin_amount)
    .bind(entry.log_date)
    .bind(entry.description.as_str())
    .bind(entry.created_at)
    .execute(&mut *conn)
    .await?;

    Ok(balance)
}

async fn insert_transaction_tx(conn: &mut PgConnection, t: &Transaction) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO transactions (transaction_id, user_id, account_id, trans_amount,
            category_id, is_preferred_saving, trans_date, post_date,
            merchant_category, merchant_address, merchant_city, merchant_state,
            merchant_country, merchant_postal_code, merchant_longitude, merchant_latitude)
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16)
        "#,
    )
    .bind(t.transaction_id)
    .bind(t.user_id)
    .bind(t.account_id)
    .bind(t.trans_amount)
    .bind(&t.category_id)
    .bind(&t.is_preferred_saving)
    .bind(t.trans_date)
    .bind(t.post_date)
    .bind(&t.merchant.category)
    .bind(&t.merchant.address)
    .bind(&t.merchant.city)
    .bind(&t.merchant.state)
    .bind(&t.merchant.country)
    .bind(&t.merchant.postal_code)
    .bind(&t.merchant.longitude)
    .bind(&t.merchant.latitude)
    .execute(&mut *conn)
    .await?;
    Ok(())
}

//
// ================= Row mapping =================
//

fn user_from_row(row: &PgRow) -> Result<User> {
    let status: String = row.try_get("status")?;
    Ok(User {
        user_id: row.try_get("user_id")?,
        first_name: row.try_get("first_name")?,
        last_name: row.try_get("last_name")?,
        email: row.try_get("email")?,
        phone: row.try_get("phone")?,
        password_hash: row.try_get("password_hash")?,
        signup_date: row.try_get("signup_date")?,
        status: UserStatus::from_db(&status),
        auth_id: row.try_get("auth_id")?,
        coins: row.try_get("coins")?,
    })
}

fn plaid_item_from_row(row: &PgRow) -> Result<PlaidItem> {
    Ok(PlaidItem {
        plaid_id: row.try_get("plaid_id")?,
        user_id: row.try_get("user_id")?,
        item_id: row.try_get("item_id")?,
        access_token: row.try_get("access_token")?,
    })
}

fn account_from_row(row: &PgRow) -> Result<Account> {
    Ok(Account {
        account_id: row.try_get("account_id")?,
        user_id: row.try_get("user_id")?,
        plaid_id: row.try_get("plaid_id")?,
        account_plaid_id: row.try_get("account_plaid_id")?,
        account_name: row.try_get("account_name")?,
        account_type: row.try_get("account_type")?,
        account_subtype: row.try_get("account_subtype")?,
    })
}

fn transaction_from_row(row: &PgRow) -> Result<Transaction> {
    Ok(Transaction {
        transaction_id: row.try_get("transaction_id")?,
        user_id: row.try_get("user_id")?,
        account_id: row.try_get("account_id")?,
        trans_amount: row.try_get("trans_amount")?,
        category_id: row.try_get("category_id")?,
        is_preferred_saving: row.try_get("is_preferred_saving")?,
        trans_date: row.try_get("trans_date")?,
        post_date: row.try_get("post_date")?,
        merchant: MerchantInfo {
            category: row.try_get("merchant_category")?,
            address: row.try_get("merchant_address")?,
            city: row.try_get("merchant_city")?,
            state: row.try_get("merchant_state")?,
            country: row.try_get("merchant_country")?,
            postal_code: row.try_get("merchant_postal_code")?,
            longitude: row.try_get("merchant_longitude")?,
            latitude: row.try_get("merchant_latitude")?,
        },
    })
}

fn savings_from_row(row: &PgRow) -> Result<SavingsEntry> {
    Ok(SavingsEntry {
        savings_id: row.try_get("savings_id")?,
        user_id: row.try_get("user_id")?,
        savings_amount: row.try_get("savings_amount")?,
        total_savings: row.try_get("total_savings")?,
        predicted_savings: row.try_get("predicted_savings")?,
        transfer_date: row.try_get("transfer_date")?,
        update_date: row.try_get("update_date")?,
    })
}

fn habit_from_row(row: &PgRow) -> Result<Habit> {
    let hour: i16 = row.try_get("time_hour")?;
    let minute: i16 = row.try_get("time_minute")?;
    let days: String = row.try_get("time_day_of_week")?;
    Ok(Habit {
        habit_id: row.try_get("habit_id")?,
        user_id: row.try_get("user_id")?,
        habit_name: row.try_get("habit_name")?,
        habit_category: row.try_get("habit_category")?,
        time_hour: hour.clamp(0, 23) as u8,
        time_minute: minute.clamp(0, 59) as u8,
        time_day_of_week: DayPattern::parse(&days)?,
    })
}

fn coin_from_row(row: &PgRow) -> Result<CoinEntry> {
    let description: String = row.try_get("description")?;
    let description = CoinReason::from_db(&description).ok_or_else(|| {
        ImpulsesError::DatabaseError(format!("unknown coin description '{}'", description))
    })?;
    Ok(CoinEntry {
        coin_id: row.try_get("coin_id")?,
        user_id: row.try_get("user_id")?,
        coin_amount: row.try_get("coin_amount")?,
        log_date: row.try_get("log_date")?,
        description,
        created_at: row.try_get("created_at")?,
    })
}

fn lottery_from_row(row: &PgRow) -> Result<Lottery> {
    let drawn: bool = row.try_get("drawn")?;
    let winner: Option<Uuid> = row.try_get("winner_user_id")?;
    let outcome = match (drawn, winner) {
        (false, _) => None,
        (true, Some(user_id)) => Some(DrawOutcome::Winner(user_id)),
        (true, None) => Some(DrawOutcome::NoEntries),
    };
    Ok(Lottery {
        lottery_id: row.try_get("lottery_id")?,
        lottery_name: row.try_get("lottery_name")?,
        cost: row.try_get("cost")?,
        end_date: row.try_get("end_date")?,
        outcome,
        drawn_at: row.try_get("drawn_at")?,
    })
}

fn entry_from_row(row: &PgRow) -> Result<LotteryEntry> {
    let entries: i32 = row.try_get("entries")?;
    Ok(LotteryEntry {
        lottery_id: row.try_get("lottery_id")?,
        user_id: row.try_get("user_id")?,
        entries: entries.max(0) as u32,
    })
}

#[async_trait::async_trait]
impl Store for PgStore {

    async fn insert_user(&self, user: User) -> Result<()> {
        self.ensure_schema().await?;

        let result = sqlx::query(
            r#"
            INSERT INTO users (user_id, first_name, last_name, email, phone,
                               password_hash, signup_date, status, auth_id, coins)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            "#,
        )
        .bind(user.user_id)
        .bind(&user.first_name)
        .bind(&user.last_name)
        .bind(&user.email)
        .bind(&user.phone)
        .bind(&user.password_hash)
        .bind(user.signup_date)
        .bind(user.status.as_str())
        .bind(&user.auth_id)
        .bind(user.coins)
        .execute(&self.pool)
        .await;

        match result {
            Ok(_) => Ok(()),
            Err(e) if is_unique_violation(&e) => Err(ImpulsesError::DuplicateUser(format!(
                "email {} or phone {} already registered",
                user.email, user.phone
            ))),
            Err(e) => Err(e.into()),
        }
    }

    async fn get_user(&self, user_id: Uuid) -> Result<Option<User>> {
        self.ensure_schema().await?;
        let row = sqlx::query("SELECT * FROM users WHERE user_id = $1")
            .bind(user_id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(user_from_row).transpose()
    }

    async fn find_user_by_email(&self, email: &str) -> Result<Option<User>> {
        self.fetch_user("SELECT * FROM users WHERE LOWER(email) = LOWER($1)", email)
            .await
    }

    async fn find_user_by_phone(&self, phone: &str) -> Result<Option<User>> {
        self.fetch_user("SELECT * FROM users WHERE phone = $1", phone).await
    }

    async fn list_users(&self) -> Result<Vec<User>> {
        self.ensure_schema().await?;
        let rows = sqlx::query("SELECT * FROM users ORDER BY signup_date")
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(user_from_row).collect()
    }

    async fn link_item(
        &self,
        item: PlaidItem,
        accounts: &[Account],
        transactions: &[Transaction],
    ) -> Result<Option<PlaidItem>> {
        self.ensure_schema().await?;
        let mut tx = self.pool.begin().await?;

        // Serializes concurrent links for the same user
        sqlx::query("SELECT user_id FROM users WHERE user_id = $1 FOR UPDATE")
            .bind(item.user_id)
            .fetch_optional(&mut *tx)
            .await?
            .ok_or_else(|| ImpulsesError::UserNotFound(item.user_id.to_string()))?;

        let existing = sqlx::query("SELECT * FROM plaid_items WHERE user_id = $1 LIMIT 1")
            .bind(item.user_id)
            .fetch_optional(&mut *tx)
            .await?;
        if let Some(row) = existing {
            return Ok(Some(plaid_item_from_row(&row)?));
        }

        sqlx::query(
            "INSERT INTO plaid_items (plaid_id, user_id, item_id, access_token) VALUES ($1, $2, $3, $4)",
        )
        .bind(item.plaid_id)
        .bind(item.user_id)
        .bind(&item.item_id)
        .bind(&item.access_token)
        .execute(&mut *tx)
        .await?;

        for account in accounts {
            sqlx::query(
                r#"
                INSERT INTO accounts (account_id, user_id, plaid_id, account_plaid_id,
                                      account_name, account_type, account_subtype)
                VALUES ($1, $2, $3, $4, $5, $6, $7)
                "#,
            )
            .bind(account.account_id)
            .bind(account.user_id)
            .bind(account.plaid_id)
            .bind(&account.account_plaid_id)
            .bind(&account.account_name)
            .bind(&account.account_type)
            .bind(&account.account_subtype)
            .execute(&mut *tx)
            .await?;
        }
        for t in transactions {
            insert_transaction_tx(&mut *tx, t).await?;
        }

        tx.commit().await?;
        Ok(None)
    }

    async fn plaid_item_for_user(&self, user_id: Uuid) -> Result<Option<PlaidItem>> {
        self.ensure_schema().await?;
        let row = sqlx::query("SELECT * FROM plaid_items WHERE user_id = $1 LIMIT 1")
            .bind(user_id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(plaid_item_from_row).transpose()
    }

    async fn accounts_for_user(&self, user_id: Uuid) -> Result<Vec<Account>> {
        self.ensure_schema().await?;
        let rows = sqlx::query("SELECT * FROM accounts WHERE user_id = $1")
            .bind(user_id)
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(account_from_row).collect()
    }

    async fn insert_transactions(&self, transactions: &[Transaction]) -> Result<()> {
        self.ensure_schema().await?;
        let mut tx = self.pool.begin().await?;
        for t in transactions {
            insert_transaction_tx(&mut *tx, t).await?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn transactions_since(&self, user_id: Uuid, since: NaiveDate) -> Result<Vec<Transaction>> {
        self.ensure_schema().await?;
        let rows = sqlx::query(
            "SELECT * FROM transactions WHERE user_id = $1 AND trans_date >= $2 ORDER BY trans_date",
        )
        .bind(user_id)
        .bind(since)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(transaction_from_row).collect()
    }

    async fn append_savings(
        &self,
        user_id: Uuid,
        amount: Decimal,
        transfer_date: NaiveDate,
        update_date: NaiveDate,
    ) -> Result<SavingsEntry> {
        self.ensure_schema().await?;
        let mut tx = self.pool.begin().await?;

        // Serializes concurrent appends for the same user
        let locked = sqlx::query("SELECT user_id FROM users WHERE user_id = $1 FOR UPDATE")
            .bind(user_id)
            .fetch_optional(&mut *tx)
            .await?;
        if locked.is_none() {
            return Err(ImpulsesError::UserNotFound(user_id.to_string()));
        }

        let previous: Option<Decimal> = sqlx::query(
            r#"
            SELECT total_savings FROM savings_history
            WHERE user_id = $1
            ORDER BY created_at DESC
            LIMIT 1
            "#,
        )
        .bind(user_id)
        .fetch_optional(&mut *tx)
        .await?
        .map(|row| row.try_get("total_savings"))
        .transpose()?;

        let previous = previous.unwrap_or(Decimal::ZERO);
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

        sqlx::query(
            r#"
            INSERT INTO savings_history (savings_id, user_id, savings_amount, total_savings,
                                         predicted_savings, transfer_date, update_date)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            "#,
        )
        .bind(entry.savings_id)
        .bind(entry.user_id)
        .bind(entry.savings_amount)
        .bind(entry.total_savings)
        .bind(entry.predicted_savings)
        .bind(entry.transfer_date)
        .bind(entry.update_date)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(entry)
    }

    async fn savings_history(&self, user_id: Uuid) -> Result<Vec<SavingsEntry>> {
        self.ensure_schema().await?;
        let rows = sqlx::query("SELECT * FROM savings_history WHERE user_id = $1 ORDER BY created_at")
            .bind(user_id)
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(savings_from_row).collect()
    }

    async fn insert_habit(&self, habit: Habit) -> Result<()> {
        self.ensure_schema().await?;
        sqlx::query(
            r#"
            INSERT INTO habits (habit_id, user_id, habit_name, habit_category,
                                time_hour, time_minute, time_day_of_week)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            "#,
        )
        .bind(habit.habit_id)
        .bind(habit.user_id)
        .bind(&habit.habit_name)
        .bind(&habit.habit_category)
        .bind(habit.time_hour as i16)
        .bind(habit.time_minute as i16)
        .bind(habit.time_day_of_week.as_str())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn list_habits(&self) -> Result<Vec<Habit>> {
        self.ensure_schema().await?;
        let rows = sqlx::query("SELECT * FROM habits ORDER BY time_hour, time_minute")
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(habit_from_row).collect()
    }

    async fn habits_for_user(&self, user_id: Uuid) -> Result<Vec<Habit>> {
        self.ensure_schema().await?;
        let rows = sqlx::query("SELECT * FROM habits WHERE user_id = $1 ORDER BY time_hour, time_minute")
            .bind(user_id)
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(habit_from_row).collect()
    }

    async fn apply_coin_entry(&self, entry: CoinEntry) -> Result<i64> {
        self.ensure_schema().await?;
        let mut tx = self.pool.begin().await?;
        let balance = apply_coin_entry_tx(&mut *tx, &entry).await?;
        tx.commit().await?;
        Ok(balance)
    }

    async fn award_login(
        &self,
        user_id: Uuid,
        today: NaiveDate,
        rules: CoinRules,
    ) -> Result<Option<(CoinEntry, i64)>> {
        self.ensure_schema().await?;
        let mut tx = self.pool.begin().await?;

        sqlx::query("SELECT coins FROM users WHERE user_id = $1 FOR UPDATE")
            .bind(user_id)
            .fetch_optional(&mut *tx)
            .await?
            .ok_or_else(|| ImpulsesError::UserNotFound(user_id.to_string()))?;

        let reasons = vec![
            CoinReason::Registration.as_str().to_string(),
            CoinReason::Login.as_str().to_string(),
        ];
        let row = sqlx::query(
            "SELECT MAX(log_date) AS last_date FROM coins WHERE user_id = $1 AND description = ANY($2)",
        )
        .bind(user_id)
        .bind(reasons)
        .fetch_one(&mut *tx)
        .await?;
        let last: Option<NaiveDate> = row.try_get("last_date")?;

        let Some((amount, reason)) = login_reward(last, today, rules) else {
            return Ok(None);
        };
        let entry = CoinEntry::new(user_id, amount, today, reason);
        let balance = apply_coin_entry_tx(&mut *tx, &entry).await?;

        tx.commit().await?;
        Ok(Some((entry, balance)))
    }

    async fn coin_entries(&self, user_id: Uuid) -> Result<Vec<CoinEntry>> {
        self.ensure_schema().await?;
        let rows = sqlx::query("SELECT * FROM coins WHERE user_id = $1 ORDER BY created_at")
            .bind(user_id)
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(coin_from_row).collect()
    }

    async fn insert_lottery(&self, lottery: Lottery) -> Result<()> {
        self.ensure_schema().await?;
        sqlx::query(
            r#"
            INSERT INTO lotteries (lottery_id, lottery_name, cost, end_date, drawn, winner_user_id, drawn_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            "#,
        )
        .bind(lottery.lottery_id)
        .bind(&lottery.lottery_name)
        .bind(lottery.cost)
        .bind(lottery.end_date)
        .bind(lottery.outcome.is_some())
        .bind(lottery.winner())
        .bind(lottery.drawn_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_lottery(&self, lottery_id: Uuid) -> Result<Option<Lottery>> {
        self.ensure_schema().await?;
        let row = sqlx::query("SELECT * FROM lotteries WHERE lottery_id = $1")
            .bind(lottery_id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(lottery_from_row).transpose()
    }

    async fn lotteries_due(&self, now: DateTime<Utc>) -> Result<Vec<Lottery>> {
        self.ensure_schema().await?;
        let rows = sqlx::query(
            "SELECT * FROM lotteries WHERE NOT drawn AND end_date <= $1 ORDER BY end_date",
        )
        .bind(now)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(lottery_from_row).collect()
    }

    async fn purchase_entry(
        &self,
        lottery_id: Uuid,
        payment: CoinEntry,
        now: DateTime<Utc>,
    ) -> Result<LotteryEntry> {
        self.ensure_schema().await?;
        let mut tx = self.pool.begin().await?;

        let row = sqlx::query("SELECT * FROM lotteries WHERE lottery_id = $1 FOR SHARE")
            .bind(lottery_id)
            .fetch_optional(&mut *tx)
            .await?
            .ok_or(ImpulsesError::LotteryNotFound(lottery_id))?;
        let lottery = lottery_from_row(&row)?;
        if !lottery.is_open(now) {
            return Err(ImpulsesError::LotteryClosed(lottery.lottery_name));
        }

        let user_id = payment.user_id;
        apply_coin_entry_tx(&mut *tx, &payment).await?;

        let row = sqlx::query(
            r#"
            INSERT INTO lottery_entries (lottery_id, user_id, entries)
            VALUES ($1, $2, 1)
            ON CONFLICT (lottery_id, user_id)
            DO UPDATE SET entries = lottery_entries.entries + 1
            RETURNING *
            "#,
        )
        .bind(lottery_id)
        .bind(user_id)
        .fetch_one(&mut *tx)
        .await?;
        let entry = entry_from_row(&row)?;

        tx.commit().await?;
        Ok(entry)
    }

    async fn lottery_entries(&self, lottery_id: Uuid) -> Result<Vec<LotteryEntry>> {
        self.ensure_schema().await?;
        let rows = sqlx::query("SELECT * FROM lottery_entries WHERE lottery_id = $1 ORDER BY user_id")
            .bind(lottery_id)
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(entry_from_row).collect()
    }

    async fn draw_lottery(
        &self,
        lottery_id: Uuid,
        drawn_at: DateTime<Utc>,
        pick: &(dyn for<'e> Fn(&'e [LotteryEntry]) -> DrawOutcome + Send + Sync),
    ) -> Result<Option<(DrawOutcome, u32)>> {
        self.ensure_schema().await?;
        let mut tx = self.pool.begin().await?;

        // Waits for in-flight purchases, which hold the row FOR SHARE
        let row = sqlx::query("SELECT * FROM lotteries WHERE lottery_id = $1 FOR UPDATE")
            .bind(lottery_id)
            .fetch_optional(&mut *tx)
            .await?
            .ok_or(ImpulsesError::LotteryNotFound(lottery_id))?;
        if lottery_from_row(&row)?.outcome.is_some() {
            return Ok(None);
        }

        let rows = sqlx::query("SELECT * FROM lottery_entries WHERE lottery_id = $1 ORDER BY user_id")
            .bind(lottery_id)
            .fetch_all(&mut *tx)
            .await?;
        let entries = rows.iter().map(entry_from_row).collect::<Result<Vec<_>>>()?;
        let total_entries = entries.iter().map(|e| e.entries).sum();
        let outcome = pick(&entries);
        let winner = match outcome {
            DrawOutcome::Winner(user_id) => Some(user_id),
            DrawOutcome::NoEntries => None,
        };

        sqlx::query(
            r#"
            UPDATE lotteries
            SET drawn = TRUE, winner_user_id = $2, drawn_at = $3
            WHERE lottery_id = $1
            "#,
        )
        .bind(lottery_id)
        .bind(winner)
        .bind(drawn_at)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(Some((outcome, total_entries)))
    }
}
