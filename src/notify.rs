//! Outbound notifications (email, SMS, script hooks)
//!
//! Delivery itself is somebody else's business: the hub posts every notification
//! to a webhook per channel and lets that endpoint do the mailing or texting.

use std::fmt;
use std::sync::Arc;

use anyhow::{Context, bail};
use async_trait::async_trait;
use chrono::Utc;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{debug, info, instrument};

use crate::config::NotificationConfig;
use crate::models::Severity;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Channel {
    Email,
    Sms,
    Script,
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Channel::Email => "email",
            Channel::Sms => "sms",
            Channel::Script => "script",
        };
        f.write_str(name)
    }
}

/// Which channels an alert should be pushed to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct AlertChannels {
    #[serde(default)]
    pub email: bool,
    #[serde(default)]
    pub sms: bool,
    #[serde(default)]
    pub script: bool,
}

impl AlertChannels {
    pub fn all() -> Self {
        Self {
            email: true,
            sms: true,
            script: true,
        }
    }

    pub fn enabled(&self) -> Vec<Channel> {
        [
            (self.email, Channel::Email),
            (self.sms, Channel::Sms),
            (self.script, Channel::Script),
        ]
        .into_iter()
        .filter_map(|(on, channel)| on.then_some(channel))
        .collect()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Notification {
    pub channel: Channel,
    pub subject: String,
    pub body: String,
    pub severity: Severity,
    /// Overrides the endpoint's default recipients when not empty
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub recipients: Vec<String>,
}

#[async_trait]
pub trait Notifier: Send + Sync {
    async fn send(&self, notification: Notification) -> anyhow::Result<()>;
}

/// Posts notifications as JSON to one webhook per channel
pub struct WebhookNotifier {
    client: Client,
    config: NotificationConfig,
}

impl WebhookNotifier {
    pub fn new(config: NotificationConfig) -> Self {
        Self {
            client: Client::new(),
            config,
        }
    }

    pub fn shared(config: NotificationConfig) -> Arc<dyn Notifier> {
        Arc::new(Self::new(config))
    }

    fn endpoint(&self, channel: Channel) -> Option<&str> {
        match channel {
            Channel::Email => self.config.email_webhook.as_deref(),
            Channel::Sms => self.config.sms_webhook.as_deref(),
            Channel::Script => self.config.script_webhook.as_deref(),
        }
    }
}

#[async_trait]
impl Notifier for WebhookNotifier {
    #[instrument(skip(self, notification), fields(channel = %notification.channel))]
    async fn send(&self, notification: Notification) -> anyhow::Result<()> {
        let Some(url) = self.endpoint(notification.channel) else {
            debug!("no webhook configured, skipping notification");
            return Ok(());
        };

        let payload = json!({
            "channel": notification.channel,
            "subject": notification.subject,
            "body": notification.body,
            "severity": notification.severity,
            "recipients": notification.recipients,
            "timestamp": Utc::now().to_rfc3339()
        });

        let response = self
            .client
            .post(url)
            .json(&payload)
            .send()
            .await
            .with_context(|| format!("failed to post {} notification", notification.channel))?;

        if !response.status().is_success() {
            bail!(
                "{} webhook answered with status {}",
                notification.channel,
                response.status()
            );
        }

        info!("sent {} notification", notification.channel);
        Ok(())
    }
}
