//! Simulated investment platform
//!
//! Keeps a per-user savings history with a running total. Deposits are
//! positive entries, withdrawals negative ones.

use crate::error::ImpulsesError;
use crate::models::SavingsEntry;
use crate::schedule::local_date;
use crate::store::Store;
use crate::Result;
use chrono::{DateTime, NaiveDate, Utc};
use chrono_tz::Tz;
use rust_decimal::Decimal;
use std::sync::Arc;
use tracing::info;
use uuid::Uuid;

pub struct SavingsTracker {
    store: Arc<dyn Store>,
    tz: Tz,
}

impl SavingsTracker {
    pub fn new(store: Arc<dyn Store>, tz: Tz) -> Self {
        Self { store, tz }
    }

    /// Record money moved into savings on `transfer_date`
    pub async fn record_saving(
        &self,
        user_id: Uuid,
        amount: Decimal,
        transfer_date: NaiveDate,
        now: DateTime<Utc>,
    ) -> Result<SavingsEntry> {
        let amount = positive_amount(amount)?;
        let entry = self
            .store
            .append_savings(user_id, amount, transfer_date, local_date(now, self.tz))
            .await?;

        info!(
            user_id = %user_id,
            amount = %entry.savings_amount,
            total = %entry.total_savings,
            "Saving recorded"
        );
        Ok(entry)
    }

    /// Record money taken out of savings. Cannot exceed the current total.
    pub async fn withdraw(
        &self,
        user_id: Uuid,
        amount: Decimal,
        transfer_date: NaiveDate,
        now: DateTime<Utc>,
    ) -> Result<SavingsEntry> {
        let amount = positive_amount(amount)?;
        let entry = self
            .store
            .append_savings(user_id, -amount, transfer_date, local_date(now, self.tz))
            .await?;

        info!(
            user_id = %user_id,
            amount = %amount,
            total = %entry.total_savings,
            "Withdrawal recorded"
        );
        Ok(entry)
    }

    pub async fn history(&self, user_id: Uuid) -> Result<Vec<SavingsEntry>> {
        self.store.savings_history(user_id).await
    }

    pub async fn total(&self, user_id: Uuid) -> Result<Decimal> {
        Ok(self
            .history(user_id)
            .await?
            .last()
            .map(|entry| entry.total_savings)
            .unwrap_or(Decimal::ZERO))
    }
}

/// Amounts are kept to cents and must stay positive after rounding
fn positive_amount(amount: Decimal) -> Result<Decimal> {
    let rounded = amount.round_dp(2);
    if rounded <= Decimal::ZERO {
        return Err(ImpulsesError::InvalidInput(format!(
            "amount must be at least one cent, got {}",
            amount
        )));
    }
    Ok(rounded)
}
