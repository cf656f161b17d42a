//! Twilio SMS client
//!
//! Uses a long-lived reqwest::Client for connection pooling.

use super::Notifier;
use crate::error::ImpulsesError;
use crate::Result;
use reqwest::Client;
use serde::Deserialize;
use std::time::Duration;
use tracing::{error, info};

const TWILIO_API_BASE: &str = "https://api.twilio.com/2010-04-01";

pub struct TwilioNotifier {
    client: Client,
    account_sid: String,
    auth_token: String,
    from_number: String,
    base_url: String,
}

#[derive(Debug, Deserialize)]
struct MessageResponse {
    sid: String,
    status: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ErrorResponse {
    code: Option<i64>,
    message: Option<String>,
}

impl TwilioNotifier {
    pub fn new(account_sid: String, auth_token: String, from_number: String) -> Result<Self> {
        let client = Client::builder()
            .pool_idle_timeout(Duration::from_secs(90))
            .pool_max_idle_per_host(4)
            .timeout(Duration::from_secs(15))
            .build()?;

        Ok(Self {
            client,
            account_sid,
            auth_token,
            from_number,
            base_url: TWILIO_API_BASE.to_string(),
        })
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into().trim_end_matches('/').to_string();
        self
    }

    fn messages_url(&self) -> String {
        format!("{}/Accounts/{}/Messages.json", self.base_url, self.account_sid)
    }
}

#[async_trait::async_trait]
impl Notifier for TwilioNotifier {
    fn name(&self) -> &'static str {
        "twilio"
    }

    async fn send_sms(&self, to: &str, body: &str) -> Result<()> {
        let params = [
            ("To", to),
            ("From", self.from_number.as_str()),
            ("Body", body),
        ];

        let response = self
            .client
            .post(self.messages_url())
            .basic_auth(&self.account_sid, Some(&self.auth_token))
            .form(&params)
            .send()
            .await
            .map_err(|e| {
                error!("Twilio request failed: {}", e);
                ImpulsesError::NotificationError(format!("Twilio request failed: {}", e))
            })?;

        let status = response.status();
        if !status.is_success() {
            let detail = match response.json::<ErrorResponse>().await {
                Ok(err) => format!(
                    "{} (code {})",
                    err.message.unwrap_or_default(),
                    err.code.map(|c| c.to_string()).unwrap_or_else(|| "?".to_string())
                ),
                Err(_) => String::new(),
            };
            error!(status = %status, detail = %detail, "Twilio rejected message");
            return Err(ImpulsesError::NotificationError(format!(
                "Twilio returned {}: {}",
                status, detail
            )));
        }

        let message: MessageResponse = response.json().await.map_err(|e| {
            ImpulsesError::NotificationError(format!("Invalid Twilio response: {}", e))
        })?;

        info!(
            sid = %message.sid,
            status = message.status.as_deref().unwrap_or("unknown"),
            "SMS queued"
        );
        Ok(())
    }
}
