//! Outbound SMS
//!
//! Reminders and lottery results go out through a `Notifier`.
//! `TwilioNotifier` talks to the Twilio Messages API; the other two
//! implementations are for local runs and tests.

pub mod twilio;

pub use twilio::TwilioNotifier;

use crate::error::ImpulsesError;
use crate::Result;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::info;

/// Trait for an outbound SMS channel
#[async_trait::async_trait]
pub trait Notifier: Send + Sync {
    fn name(&self) -> &'static str;
    async fn send_sms(&self, to: &str, body: &str) -> Result<()>;
}

/// Logs messages instead of sending them
pub struct LogNotifier;

#[async_trait::async_trait]
impl Notifier for LogNotifier {
    fn name(&self) -> &'static str {
        "log"
    }

    async fn send_sms(&self, to: &str, body: &str) -> Result<()> {
        info!(to = %to, body = %body, "SMS (log only)");
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SentMessage {
    pub to: String,
    pub body: String,
}

/// Records every message; can be told to fail for a given number
pub struct MemoryNotifier {
    sent: Arc<RwLock<Vec<SentMessage>>>,
    failing: Arc<RwLock<Vec<String>>>,
}

impl MemoryNotifier {
    pub fn new() -> Self {
        Self {
            sent: Arc::new(RwLock::new(Vec::new())),
            failing: Arc::new(RwLock::new(Vec::new())),
        }
    }

    pub async fn sent(&self) -> Vec<SentMessage> {
        self.sent.read().await.clone()
    }

    pub async fn fail_for(&self, to: &str) {
        self.failing.write().await.push(to.to_string());
    }

    pub async fn recover(&self) {
        self.failing.write().await.clear();
    }
}

impl Default for MemoryNotifier {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl Notifier for MemoryNotifier {
    fn name(&self) -> &'static str {
        "memory"
    }

    async fn send_sms(&self, to: &str, body: &str) -> Result<()> {
        if self.failing.read().await.iter().any(|n| n == to) {
            return Err(ImpulsesError::NotificationError(format!(
                "delivery to {} failed",
                to
            )));
        }
        self.sent.write().await.push(SentMessage {
            to: to.to_string(),
            body: body.to_string(),
        });
        Ok(())
    }
}

/// Normalize a US phone number to its ten national digits.
///
/// Accepts punctuation and an optional leading country code 1.
pub fn normalize_phone(raw: &str) -> Result<String> {
    let digits: String = raw.chars().filter(|c| c.is_ascii_digit()).collect();
    let national = match digits.len() {
        10 => digits,
        11 if digits.starts_with('1') => digits[1..].to_string(),
        _ => {
            return Err(ImpulsesError::InvalidInput(format!(
                "'{}' is not a 10-digit phone number",
                raw
            )))
        }
    };
    Ok(national)
}

/// E.164 form used on the wire
pub fn to_e164(phone: &str) -> String {
    format!("+1{}", phone)
}

/// What an inbound reply asks for
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplyIntent {
    /// The user confirms they saved instead of spending
    Saved,
    Other,
}

pub fn parse_reply(body: &str) -> ReplyIntent {
    match body.trim().trim_end_matches(&['.', '!'][..]).to_lowercase().as_str() {
        "yes" | "y" => ReplyIntent::Saved,
        _ => ReplyIntent::Other,
    }
}
