//! Outbound WhatsApp delivery
//!
//! [`MessageGateway`] is the seam between the reminder logic and the
//! messaging provider. [`TwilioWhatsApp`] talks to the Twilio Messages API.

use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;

use crate::config::GatewayConfig;
use crate::error::{AppResult, DeliveryError};
use crate::models::SentMessage;

const TWILIO_API_BASE: &str = "https://api.twilio.com/2010-04-01";

#[async_trait]
pub trait MessageGateway: Send + Sync {
    /// `to` is a bare international number such as `+5511999990000`.
    async fn send(&self, to: &str, body: &str) -> Result<SentMessage, DeliveryError>;
}

/// Twilio WhatsApp sender. Without credentials every send fails with
/// [`DeliveryError::NotConfigured`].
pub struct TwilioWhatsApp {
    client: Client,
    config: Option<GatewayConfig>,
    api_base: String,
}

#[derive(Debug, Deserialize)]
struct TwilioMessageResponse {
    sid: String,
    status: String,
}

#[derive(Debug, Deserialize)]
struct TwilioErrorResponse {
    message: Option<String>,
}

impl TwilioWhatsApp {
    pub fn new(config: Option<GatewayConfig>) -> AppResult<Self> {
        let client = Client::builder()
            .timeout(std::time::Duration::from_secs(30))
            .build()?;

        if config.is_none() {
            log::warn!("Twilio credentials missing; reminders will be recorded as not configured");
        }

        Ok(Self {
            client,
            config,
            api_base: TWILIO_API_BASE.to_string(),
        })
    }

    /// Point at a different API host (sandbox or local stub).
    pub fn with_api_base(mut self, api_base: impl Into<String>) -> Self {
        self.api_base = api_base.into();
        self
    }

    pub fn is_configured(&self) -> bool {
        self.config.is_some()
    }
}

#[async_trait]
impl MessageGateway for TwilioWhatsApp {
    async fn send(&self, to: &str, body: &str) -> Result<SentMessage, DeliveryError> {
        let config = self.config.as_ref().ok_or(DeliveryError::NotConfigured)?;

        let url = format!(
            "{}/Accounts/{}/Messages.json",
            self.api_base.trim_end_matches('/'),
            config.account_sid
        );
        let to = format!("whatsapp:{}", to);

        let res = self
            .client
            .post(&url)
            .basic_auth(&config.account_sid, Some(&config.auth_token))
            .form(&[("From", config.from.as_str()), ("To", to.as_str()), ("Body", body)])
            .send()
            .await?;

        let status = res.status();
        if status.is_success() {
            let message: TwilioMessageResponse = res.json().await?;
            log::debug!("Twilio accepted {} -> {} ({})", message.sid, to, message.status);
            Ok(SentMessage {
                id: message.sid,
                status: message.status,
            })
        } else {
            let text = res.text().await.unwrap_or_default();
            let message = serde_json::from_str::<TwilioErrorResponse>(&text)
                .ok()
                .and_then(|e| e.message)
                .unwrap_or(text);
            Err(DeliveryError::Rejected {
                status: status.as_u16(),
                message,
            })
        }
    }
}

#[cfg(test)]
pub use recording::RecordingGateway;
