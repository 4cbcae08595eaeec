//! Alert delivery across configured channels.
//!
//! Each channel delivery is synchronous and independently reported;
//! failures are logged and never retried in-process (the cooldown has
//! already advanced by the time dispatch runs).

use async_trait::async_trait;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

use dtk_common::{AlertPolicy, ChannelConfig, Error, Result};

use crate::event::AlertEvent;
use crate::templates;

/// Outcome of delivery to one channel
#[derive(Debug, Clone)]
pub struct ChannelDelivery {
    pub channel: String,
    pub kind: &'static str,
    pub success: bool,
    pub error: Option<String>,
}

/// Sends a rendered alert as an email. The engine only depends on this
/// narrow seam; the default transport logs the message instead of
/// speaking SMTP.
#[async_trait]
pub trait EmailTransport: Send + Sync {
    async fn send(&self, from: &str, to: &[String], subject: &str, body: &str) -> Result<()>;
}

/// Default transport: log and succeed
pub struct LogEmailTransport;

#[async_trait]
impl EmailTransport for LogEmailTransport {
    async fn send(&self, from: &str, to: &[String], subject: &str, body: &str) -> Result<()> {
        info!(from, to = to.join(", "), subject, body, "email alert (log transport)");
        Ok(())
    }
}

/// Renders the alert template and fans out to every configured channel
pub struct AlertDispatcher {
    client: reqwest::Client,
    channels: BTreeMap<String, ChannelConfig>,
    email: Arc<dyn EmailTransport>,
}

impl AlertDispatcher {
    pub fn new(channels: BTreeMap<String, ChannelConfig>) -> Result<Self> {
        Self::with_email_transport(channels, Arc::new(LogEmailTransport))
    }

    pub fn with_email_transport(
        channels: BTreeMap<String, ChannelConfig>,
        email: Arc<dyn EmailTransport>,
    ) -> Result<Self> {
        let client = reqwest::Client::builder()
            .build()
            .map_err(|e| Error::Alert(format!("cannot build HTTP client: {}", e)))?;
        Ok(AlertDispatcher {
            client,
            channels,
            email,
        })
    }

    /// Deliver `event` to every channel named by the policy. Returns one
    /// delivery record per channel; rendering problems fail the whole
    /// dispatch since no channel could receive a message.
    pub async fn dispatch(
        &self,
        policy: &AlertPolicy,
        event: &AlertEvent,
    ) -> Result<Vec<ChannelDelivery>> {
        let message = templates::render(policy, event)?;
        let mut deliveries = Vec::with_capacity(policy.channels.len());

        for name in &policy.channels {
            let Some(config) = self.channels.get(name) else {
                warn!(channel = %name, "alert channel is not declared in the profiles file");
                deliveries.push(ChannelDelivery {
                    channel: name.clone(),
                    kind: "unknown",
                    success: false,
                    error: Some("channel not declared".to_string()),
                });
                continue;
            };
            let result = self.send_to_channel(config, &message, event).await;
            match &result {
                Ok(()) => info!(
                    channel = %name,
                    kind = config.kind(),
                    metric = %event.metric_name,
                    "alert delivered"
                ),
                Err(e) => error!(
                    channel = %name,
                    kind = config.kind(),
                    metric = %event.metric_name,
                    error = %e,
                    "alert delivery failed"
                ),
            }
            deliveries.push(ChannelDelivery {
                channel: name.clone(),
                kind: config.kind(),
                success: result.is_ok(),
                error: result.err().map(|e| e.to_string()),
            });
        }
        Ok(deliveries)
    }

    async fn send_to_channel(
        &self,
        config: &ChannelConfig,
        message: &str,
        event: &AlertEvent,
    ) -> Result<()> {
        match config {
            ChannelConfig::Mattermost {
                url,
                channel,
                timeout_seconds,
            } => {
                let mut payload = serde_json::json!({ "text": message });
                if let Some(channel) = channel {
                    payload["channel"] = serde_json::json!(channel);
                }
                self.post_json(url, &payload, *timeout_seconds).await
            }
            ChannelConfig::Slack {
                webhook_url,
                timeout_seconds,
            } => {
                let payload = serde_json::json!({ "text": message });
                self.post_json(webhook_url, &payload, *timeout_seconds).await
            }
            ChannelConfig::Telegram {
                bot_token,
                chat_id,
                timeout_seconds,
            } => {
                let url = format!("https://api.telegram.org/bot{}/sendMessage", bot_token);
                let payload = serde_json::json!({ "chat_id": chat_id, "text": message });
                self.post_json(&url, &payload, *timeout_seconds).await
            }
            ChannelConfig::Webhook {
                url,
                headers,
                timeout_seconds,
            } => {
                let payload = serde_json::json!({ "message": message, "event": event });
                let mut request = self
                    .client
                    .post(url)
                    .timeout(Duration::from_secs(*timeout_seconds))
                    .json(&payload);
                for (key, value) in headers {
                    request = request.header(key, value);
                }
                check_response(request.send().await, url).await
            }
            ChannelConfig::Email { from, to, .. } => {
                let subject = format!(
                    "[driftkit] {} alert: {}",
                    event.kind.as_str(),
                    event.metric_name
                );
                self.email.send(from, to, &subject, message).await
            }
        }
    }

    async fn post_json(
        &self,
        url: &str,
        payload: &serde_json::Value,
        timeout_seconds: u64,
    ) -> Result<()> {
        let response = self
            .client
            .post(url)
            .timeout(Duration::from_secs(timeout_seconds))
            .json(payload)
            .send()
            .await;
        check_response(response, url).await
    }
}

async fn check_response(
    response: std::result::Result<reqwest::Response, reqwest::Error>,
    url: &str,
) -> Result<()> {
    let response = response.map_err(|e| Error::Alert(format!("request to {} failed: {}", url, e)))?;
    let status = response.status();
    if !status.is_success() {
        return Err(Error::Alert(format!(
            "{} returned status {}",
            url, status
        )));
    }
    Ok(())
}
