//! Plaid payload mapping
//!
//! Turns the account and transaction JSON returned by Plaid into rows
//! for the store. Fetching from Plaid itself happens elsewhere.

use crate::error::ImpulsesError;
use crate::models::{Account, MerchantInfo, PlaidItem, Transaction};
use crate::store::Store;
use crate::Result;
use chrono::NaiveDate;
use rust_decimal::prelude::FromPrimitive;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{info, warn};
use uuid::Uuid;

#[derive(Debug, Clone, Deserialize)]
pub struct PlaidAccount {
    pub account_id: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default, rename = "type")]
    pub account_type: Option<String>,
    #[serde(default)]
    pub subtype: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PlaidTransaction {
    pub account_id: String,
    pub amount: f64,
    #[serde(default)]
    pub date: Option<String>,
    #[serde(default)]
    pub authorized_date: Option<String>,
    #[serde(default)]
    pub category: Option<Vec<String>>,
    #[serde(default)]
    pub category_id: Option<String>,
    #[serde(default)]
    pub location: PlaidLocation,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct PlaidLocation {
    pub address: Option<String>,
    pub city: Option<String>,
    pub region: Option<String>,
    pub country: Option<String>,
    pub postal_code: Option<String>,
    pub lat: Option<f64>,
    pub lon: Option<f64>,
}

/// What `link_item` did
#[derive(Debug, Clone, Serialize)]
pub struct LinkReport {
    pub plaid_id: Uuid,
    pub already_linked: bool,
    pub accounts: usize,
    pub transactions: usize,
    pub skipped: usize,
}

/// Parse a Plaid `YYYY-MM-DD` date
pub fn parse_date(raw: &str) -> Result<NaiveDate> {
    NaiveDate::parse_from_str(raw.trim(), "%Y-%m-%d")
        .map_err(|e| ImpulsesError::InvalidInput(format!("invalid date '{}': {}", raw, e)))
}

pub fn map_accounts(user_id: Uuid, plaid_id: Uuid, accounts: &[PlaidAccount]) -> Vec<Account> {
    accounts
        .iter()
        .map(|a| Account {
            account_id: Uuid::new_v4(),
            user_id,
            plaid_id,
            account_plaid_id: a.account_id.clone(),
            account_name: a.name.clone(),
            account_type: a.account_type.clone(),
            account_subtype: a.subtype.clone(),
        })
        .collect()
}

/// Map one Plaid transaction onto a known account
pub fn map_transaction(user_id: Uuid, account_id: Uuid, raw: &PlaidTransaction) -> Result<Transaction> {
    let trans_date = match raw.date.as_deref() {
        Some(date) => parse_date(date)?,
        None => {
            return Err(ImpulsesError::InvalidInput(
                "transaction has no date".to_string(),
            ))
        }
    };
    let post_date = raw
        .authorized_date
        .as_deref()
        .and_then(|d| parse_date(d).ok());

    let trans_amount = Decimal::from_f64(raw.amount)
        .ok_or_else(|| ImpulsesError::InvalidInput(format!("invalid amount {}", raw.amount)))?
        .round_dp(2);

    let location = &raw.location;
    Ok(Transaction {
        transaction_id: Uuid::new_v4(),
        user_id,
        account_id,
        trans_amount,
        category_id: raw.category_id.clone(),
        is_preferred_saving: None,
        trans_date,
        post_date,
        merchant: MerchantInfo {
            category: raw.category.as_ref().map(|c| c.join(";")),
            address: location.address.clone(),
            city: location.city.clone(),
            state: location.region.clone(),
            country: location.country.clone(),
            postal_code: location.postal_code.clone(),
            longitude: location.lon.map(|v| v.to_string()),
            latitude: location.lat.map(|v| v.to_string()),
        },
    })
}

/// Map transactions against a user's accounts.
///
/// Returns the mapped rows and how many were skipped for an unknown account.
pub fn map_transactions(
    user_id: Uuid,
    accounts: &[Account],
    raw: &[PlaidTransaction],
) -> Result<(Vec<Transaction>, usize)> {
    let by_plaid_id: HashMap<&str, Uuid> = accounts
        .iter()
        .map(|a| (a.account_plaid_id.as_str(), a.account_id))
        .collect();

    let mut mapped = Vec::with_capacity(raw.len());
    let mut skipped = 0;
    for tx in raw {
        match by_plaid_id.get(tx.account_id.as_str()) {
            Some(account_id) => mapped.push(map_transaction(user_id, *account_id, tx)?),
            None => {
                warn!(
                    user_id = %user_id,
                    account = %tx.account_id,
                    "Skipping transaction for unknown account"
                );
                skipped += 1;
            }
        }
    }
    Ok((mapped, skipped))
}

pub struct PlaidIngest {
    store: Arc<dyn Store>,
}

impl PlaidIngest {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self { store }
    }

    /// Store a newly linked item with its accounts and transactions.
    ///
    /// A user who already has an item keeps it and nothing is written.
    pub async fn link_item(
        &self,
        user_id: Uuid,
        item_id: &str,
        access_token: &str,
        accounts: &[PlaidAccount],
        transactions: &[PlaidTransaction],
    ) -> Result<LinkReport> {
        if let Some(existing) = self.store.plaid_item_for_user(user_id).await? {
            info!(user_id = %user_id, item_id = %existing.item_id, "User already linked");
            return Ok(LinkReport {
                plaid_id: existing.plaid_id,
                already_linked: true,
                accounts: 0,
                transactions: 0,
                skipped: 0,
            });
        }

        let item = PlaidItem {
            plaid_id: Uuid::new_v4(),
            user_id,
            item_id: item_id.to_string(),
            access_token: access_token.to_string(),
        };
        let accounts = map_accounts(user_id, item.plaid_id, accounts);
        let (transactions, skipped) = map_transactions(user_id, &accounts, transactions)?;

        if let Some(existing) = self.store.link_item(item.clone(), &accounts, &transactions).await? {
            info!(user_id = %user_id, item_id = %existing.item_id, "User linked concurrently");
            return Ok(LinkReport {
                plaid_id: existing.plaid_id,
                already_linked: true,
                accounts: 0,
                transactions: 0,
                skipped: 0,
            });
        }

        info!(
            user_id = %user_id,
            item_id = %item.item_id,
            accounts = accounts.len(),
            transactions = transactions.len(),
            skipped,
            "Plaid item linked"
        );
        Ok(LinkReport {
            plaid_id: item.plaid_id,
            already_linked: false,
            accounts: accounts.len(),
            transactions: transactions.len(),
            skipped,
        })
    }

    /// Add newly fetched transactions for a user's linked accounts
    pub async fn import_transactions(
        &self,
        user_id: Uuid,
        transactions: &[PlaidTransaction],
    ) -> Result<usize> {
        let accounts = self.store.accounts_for_user(user_id).await?;
        let (mapped, skipped) = map_transactions(user_id, &accounts, transactions)?;
        self.store.insert_transactions(&mapped).await?;

        info!(
            user_id = %user_id,
            imported = mapped.len(),
            skipped,
            "Transactions imported"
        );
        Ok(mapped.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{User, UserStatus};
    use crate::store::InMemoryStore;
    use chrono::Utc;
    use rust_decimal_macros::dec;

    const ACCOUNTS: &str = r#"[
        {"account_id": "acc-checking", "name": "Plaid Checking", "type": "depository", "subtype": "checking"},
        {"account_id": "acc-credit", "name": "Plaid Credit Card", "type": "credit", "subtype": "credit card"}
    ]"#;

    const TRANSACTIONS: &str = r#"[
        {
            "account_id": "acc-credit",
            "amount": 4.33,
            "date": "2019-10-02",
            "authorized_date": "2019-10-01",
            "category": ["Food and Drink", "Restaurants", "Coffee Shop"],
            "category_id": "13005043",
            "location": {"address": "1 Main St", "city": "San Francisco", "region": "CA",
                         "country": "US", "postal_code": "94103", "lat": 37.77, "lon": -122.41}
        },
        {
            "account_id": "acc-checking",
            "amount": 25,
            "date": "2019-10-03",
            "authorized_date": null,
            "category": null,
            "category_id": null,
            "location": {}
        },
        {
            "account_id": "acc-unknown",
            "amount": 1.0,
            "date": "2019-10-03"
        }
    ]"#;

    async fn setup() -> (PlaidIngest, Arc<dyn Store>, Uuid) {
        let store: Arc<dyn Store> = Arc::new(InMemoryStore::new());
        let user_id = Uuid::new_v4();
        store
            .insert_user(User {
                user_id,
                first_name: "Lin".to_string(),
                last_name: "Ked".to_string(),
                email: "linked@example.com".to_string(),
                phone: "2125550123".to_string(),
                password_hash: String::new(),
                signup_date: Utc::now(),
                status: UserStatus::Active,
                auth_id: None,
                coins: 0,
            })
            .await
            .unwrap();
        (PlaidIngest::new(store.clone()), store, user_id)
    }

    fn payloads() -> (Vec<PlaidAccount>, Vec<PlaidTransaction>) {
        (
            serde_json::from_str(ACCOUNTS).unwrap(),
            serde_json::from_str(TRANSACTIONS).unwrap(),
        )
    }

    #[test]
    fn test_parse_date() {
        assert_eq!(
            parse_date("2019-10-02").unwrap(),
            NaiveDate::from_ymd_opt(2019, 10, 2).unwrap()
        );
        assert!(parse_date("10/02/2019").is_err());
        assert!(parse_date("").is_err());
    }

    #[test]
    fn test_map_transaction_fields() {
        let (_, transactions) = payloads();
        let tx = map_transaction(Uuid::nil(), Uuid::nil(), &transactions[0]).unwrap();

        assert_eq!(tx.trans_amount, dec!(4.33));
        assert_eq!(tx.category_id.as_deref(), Some("13005043"));
        assert_eq!(tx.post_date, NaiveDate::from_ymd_opt(2019, 10, 1));
        assert_eq!(
            tx.merchant.category.as_deref(),
            Some("Food and Drink;Restaurants;Coffee Shop")
        );
        assert_eq!(tx.merchant.state.as_deref(), Some("CA"));
        assert_eq!(tx.merchant.latitude.as_deref(), Some("37.77"));
    }

    #[test]
    fn test_dates_required_and_optional() {
        let (_, mut transactions) = payloads();

        let bad_post = {
            let mut tx = transactions[1].clone();
            tx.authorized_date = Some("not-a-date".to_string());
            tx
        };
        assert!(map_transaction(Uuid::nil(), Uuid::nil(), &bad_post)
            .unwrap()
            .post_date
            .is_none());

        transactions[1].date = None;
        assert!(map_transaction(Uuid::nil(), Uuid::nil(), &transactions[1]).is_err());
    }

    #[tokio::test]
    async fn test_link_item_stores_everything() {
        let (ingest, store, user_id) = setup().await;
        let (accounts, transactions) = payloads();

        let report = ingest
            .link_item(user_id, "item-1", "access-sandbox-1", &accounts, &transactions)
            .await
            .unwrap();
        assert!(!report.already_linked);
        assert_eq!(report.accounts, 2);
        assert_eq!(report.transactions, 2);
        assert_eq!(report.skipped, 1);

        let stored = store
            .transactions_since(user_id, NaiveDate::from_ymd_opt(2019, 1, 1).unwrap())
            .await
            .unwrap();
        assert_eq!(stored.len(), 2);
        assert_eq!(store.accounts_for_user(user_id).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_link_item_keeps_existing_item() {
        let (ingest, store, user_id) = setup().await;
        let (accounts, transactions) = payloads();

        let first = ingest
            .link_item(user_id, "item-1", "token-1", &accounts, &transactions)
            .await
            .unwrap();
        let second = ingest
            .link_item(user_id, "item-2", "token-2", &accounts, &[])
            .await
            .unwrap();

        assert!(second.already_linked);
        assert_eq!(second.plaid_id, first.plaid_id);
        let item = store.plaid_item_for_user(user_id).await.unwrap().unwrap();
        assert_eq!(item.item_id, "item-1");
        assert_eq!(store.accounts_for_user(user_id).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_failed_link_can_be_retried() {
        let (ingest, store, user_id) = setup().await;
        let (accounts, mut transactions) = payloads();
        transactions[1].date = None;

        assert!(ingest
            .link_item(user_id, "item-1", "token-1", &accounts, &transactions)
            .await
            .is_err());
        assert!(store.plaid_item_for_user(user_id).await.unwrap().is_none());
        assert!(store.accounts_for_user(user_id).await.unwrap().is_empty());

        let (accounts, transactions) = payloads();
        let report = ingest
            .link_item(user_id, "item-1", "token-1", &accounts, &transactions)
            .await
            .unwrap();
        assert!(!report.already_linked);
        assert_eq!(report.transactions, 2);
        assert_eq!(store.accounts_for_user(user_id).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_import_transactions_uses_linked_accounts() {
        let (ingest, _store, user_id) = setup().await;
        let (accounts, transactions) = payloads();
        ingest
            .link_item(user_id, "item-1", "token-1", &accounts, &[])
            .await
            .unwrap();

        let imported = ingest.import_transactions(user_id, &transactions).await.unwrap();
        assert_eq!(imported, 2);
    }
}
