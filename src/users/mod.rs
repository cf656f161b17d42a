//! User registration and password checks

pub mod password;

use crate::error::ImpulsesError;
use crate::models::{User, UserStatus};
use crate::notify::normalize_phone;
use crate::store::Store;
use crate::Result;
use chrono::Utc;
use std::sync::Arc;
use tracing::info;
use uuid::Uuid;

#[derive(Debug, Clone)]
pub struct Registration {
    pub first_name: String,
    pub last_name: String,
    pub email: String,
    pub phone: String,
    pub password: String,
    pub auth_id: Option<String>,
}

pub struct UserDirectory {
    store: Arc<dyn Store>,
}

impl UserDirectory {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self { store }
    }

    /// Create a new active user. Email and phone must be unused.
    pub async fn register(&self, registration: Registration) -> Result<User> {
        let first_name = required("first name", &registration.first_name)?;
        let last_name = required("last name", &registration.last_name)?;
        let email = normalize_email(&registration.email)?;
        let phone = normalize_phone(&registration.phone)?;
        if registration.password.is_empty() {
            return Err(ImpulsesError::InvalidInput("password is empty".to_string()));
        }

        if self.store.find_user_by_email(&email).await?.is_some()
            || self.store.find_user_by_phone(&phone).await?.is_some()
        {
            return Err(ImpulsesError::DuplicateUser(format!(
                "email {} or phone {} already registered",
                email, phone
            )));
        }

        let plain = registration.password;
        let password_hash = tokio::task::spawn_blocking(move || password::hash_password(&plain)).await?;

        let user = User {
            user_id: Uuid::new_v4(),
            first_name,
            last_name,
            email,
            phone,
            password_hash,
            signup_date: Utc::now(),
            status: UserStatus::Active,
            auth_id: registration.auth_id,
            coins: 0,
        };
        self.store.insert_user(user.clone()).await?;

        info!(user_id = %user.user_id, "User registered");
        Ok(user)
    }

    /// Look up by email and check the password
    pub async fn authenticate(&self, email: &str, password: &str) -> Result<Option<User>> {
        let email = email.trim().to_lowercase();
        let Some(user) = self.store.find_user_by_email(&email).await? else {
            return Ok(None);
        };
        let stored = user.password_hash.clone();
        let candidate = password.to_string();
        let verified =
            tokio::task::spawn_blocking(move || password::verify_password(&stored, &candidate)).await?;
        Ok(verified.then_some(user))
    }

    pub async fn get(&self, user_id: Uuid) -> Result<User> {
        self.store
            .get_user(user_id)
            .await?
            .ok_or_else(|| ImpulsesError::UserNotFound(user_id.to_string()))
    }

    pub async fn by_phone(&self, raw_phone: &str) -> Result<User> {
        let phone = normalize_phone(raw_phone)?;
        self.store
            .find_user_by_phone(&phone)
            .await?
            .ok_or(ImpulsesError::UserNotFound(phone))
    }
}

fn required(field: &str, value: &str) -> Result<String> {
    let value = value.trim();
    if value.is_empty() {
        return Err(ImpulsesError::InvalidInput(format!("{} is required", field)));
    }
    Ok(value.to_string())
}

fn normalize_email(raw: &str) -> Result<String> {
    let email = raw.trim().to_lowercase();
    let valid = match email.split_once('@') {
        Some((local, domain)) => !local.is_empty() && domain.contains('.') && !domain.starts_with('.'),
        None => false,
    };
    if !valid {
        return Err(ImpulsesError::InvalidInput(format!("'{}' is not an email address", raw)));
    }
    Ok(email)
}
