//! Runtime configuration loaded from the environment

use crate::error::ImpulsesError;
use crate::Result;
use chrono_tz::Tz;
use std::env;
use std::time::Duration;

pub const DEFAULT_TIMEZONE: &str = "America/Los_Angeles";
pub const DEFAULT_PORT: u16 = 8080;

/// Coin rewards
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CoinRules {
    /// First login after signing up
    pub registration_bonus: i64,
    /// At most once per local calendar day
    pub daily_login: i64,
    /// Replying "yes" to a savings nudge
    pub saving_reward: i64,
}

impl Default for CoinRules {
    fn default() -> Self {
        Self {
            registration_bonus: 10,
            daily_login: 2,
            saving_reward: 10,
        }
    }
}

#[derive(Debug, Clone)]
pub struct TwilioConfig {
    pub account_sid: String,
    pub auth_token: String,
    pub from_number: String,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub database_url: Option<String>,
    pub port: u16,
    pub timezone: Tz,
    pub twilio: Option<TwilioConfig>,
    pub reminder_interval: Duration,
    /// How long after its scheduled minute a reminder may still go out
    pub reminder_catch_up: Duration,
    pub categories_file: Option<String>,
    pub coin_rules: CoinRules,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            database_url: None,
            port: DEFAULT_PORT,
            timezone: chrono_tz::America::Los_Angeles,
            twilio: None,
            reminder_interval: Duration::from_secs(60),
            reminder_catch_up: Duration::from_secs(15 * 60),
            categories_file: None,
            coin_rules: CoinRules::default(),
        }
    }
}

impl Config {
    /// Read configuration from the process environment.
    ///
    /// Call `dotenv::dotenv()` first to pick up a `.env` file.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Build configuration from any key lookup
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let database_url = get("DATABASE_URL").or_else(|| get("POSTGRES_URL"));

        let port = match get("PORT").or_else(|| get("API_PORT")) {
            Some(raw) => parse_number::<u16>("PORT", &raw)?,
            None => defaults.port,
        };

        let timezone_name = get("IMPULSES_TIMEZONE").unwrap_or_else(|| DEFAULT_TIMEZONE.to_string());
        let timezone: Tz = timezone_name.parse().map_err(|e| {
            ImpulsesError::ConfigError(format!("invalid timezone '{}': {}", timezone_name, e))
        })?;

        let twilio = match (
            get("TWILIO_ACCOUNT_SID"),
            get("TWILIO_AUTH_TOKEN"),
            get("TWILIO_FROM_NUMBER"),
        ) {
            (Some(account_sid), Some(auth_token), Some(from_number)) => Some(TwilioConfig {
                account_sid,
                auth_token,
                from_number,
            }),
            _ => None,
        };

        let reminder_interval = match get("REMINDER_INTERVAL_SECS") {
            Some(raw) => Duration::from_secs(parse_number::<u64>("REMINDER_INTERVAL_SECS", &raw)?.max(1)),
            None => defaults.reminder_interval,
        };

        let reminder_catch_up = match get("REMINDER_CATCH_UP_SECS") {
            Some(raw) => Duration::from_secs(parse_number::<u64>("REMINDER_CATCH_UP_SECS", &raw)?),
            None => defaults.reminder_catch_up,
        };

        let mut coin_rules = defaults.coin_rules;
        if let Some(raw) = get("COIN_REGISTRATION_BONUS") {
            coin_rules.registration_bonus = parse_reward("COIN_REGISTRATION_BONUS", &raw)?;
        }
        if let Some(raw) = get("COIN_DAILY_LOGIN") {
            coin_rules.daily_login = parse_reward("COIN_DAILY_LOGIN", &raw)?;
        }
        if let Some(raw) = get("COIN_SAVING_REWARD") {
            coin_rules.saving_reward = parse_reward("COIN_SAVING_REWARD", &raw)?;
        }

        Ok(Self {
            database_url,
            port,
            timezone,
            twilio,
            reminder_interval,
            reminder_catch_up,
            categories_file: get("PLAID_CATEGORIES_FILE"),
            coin_rules,
        })
    }
}

fn parse_number<T: std::str::FromStr>(key: &str, raw: &str) -> Result<T> {
    raw.trim()
        .parse::<T>()
        .map_err(|_| ImpulsesError::ConfigError(format!("{} must be a number, got '{}'", key, raw)))
}

fn parse_reward(key: &str, raw: &str) -> Result<i64> {
    let value = parse_number::<i64>(key, raw)?;
    if value <= 0 {
        return Err(ImpulsesError::ConfigError(format!(
            "{} must be positive, got {}",
            key, value
        )));
    }
    Ok(value)
}
