//! Alert lifecycle and notification fan-out
//!
//! There is at most one open alert per [`AlertKey`]. The repository enforces that
//! with an atomic insert-if-absent; this module decides when to notify and never
//! lets a slow or failing notifier hold up the caller.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, instrument};

use crate::models::Severity;
use crate::notify::{AlertChannels, Channel, Notification, Notifier};
use crate::storage::{Repository, StoreResult};

/// Identity of an alert: what failed on which agent
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum AlertKey {
    Check { check_id: u64, agent_id: String },
    Task { task_id: u64, agent_id: String },
}

impl AlertKey {
    pub fn agent_id(&self) -> &str {
        match self {
            AlertKey::Check { agent_id, .. } | AlertKey::Task { agent_id, .. } => agent_id,
        }
    }
}

impl fmt::Display for AlertKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AlertKey::Check { check_id, agent_id } => write!(f, "check {check_id} on {agent_id}"),
            AlertKey::Task { task_id, agent_id } => write!(f, "task {task_id} on {agent_id}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Alert {
    pub id: u64,
    pub key: AlertKey,
    pub severity: Severity,
    pub message: String,
    pub opened_at: DateTime<Utc>,
    pub resolved_at: Option<DateTime<Utc>>,
    pub email_sent: Option<DateTime<Utc>>,
    pub sms_sent: Option<DateTime<Utc>>,
    pub script_sent: Option<DateTime<Utc>>,
}

impl Alert {
    pub fn is_open(&self) -> bool {
        self.resolved_at.is_none()
    }

    pub fn last_sent(&self, channel: Channel) -> Option<DateTime<Utc>> {
        match channel {
            Channel::Email => self.email_sent,
            Channel::Sms => self.sms_sent,
            Channel::Script => self.script_sent,
        }
    }

    pub fn mark_sent(&mut self, channel: Channel, at: DateTime<Utc>) {
        let slot = match channel {
            Channel::Email => &mut self.email_sent,
            Channel::Sms => &mut self.sms_sent,
            Channel::Script => &mut self.script_sent,
        };
        *slot = Some(at);
    }

    fn notified_channels(&self) -> Vec<Channel> {
        [Channel::Email, Channel::Sms, Channel::Script]
            .into_iter()
            .filter(|channel| self.last_sent(*channel).is_some())
            .collect()
    }
}

/// Alert fields supplied on creation
#[derive(Debug, Clone)]
pub struct NewAlert {
    pub key: AlertKey,
    pub severity: Severity,
    pub message: String,
}

/// Everything needed to open (or refresh) an alert
#[derive(Debug, Clone)]
pub struct AlertRequest {
    pub key: AlertKey,
    pub severity: Severity,
    pub message: String,
    pub channels: AlertChannels,
}

/// When notifications are (re)sent
#[derive(Debug, Clone, Copy, Default)]
pub struct NotificationPolicy {
    /// Repeat a channel once its last send is older than this; `None` sends once
    pub renotify_after: Option<Duration>,
    pub notify_on_resolve: bool,
}

impl NotificationPolicy {
    fn is_due(&self, last_sent: Option<DateTime<Utc>>, now: DateTime<Utc>) -> bool {
        let Some(last_sent) = last_sent else {
            return true;
        };

        self.renotify_after.is_some_and(|window| {
            (now - last_sent)
                .to_std()
                .is_ok_and(|elapsed| elapsed >= window)
        })
    }
}

#[derive(Clone)]
pub struct AlertCoordinator {
    store: Arc<dyn Repository>,
    notifier: Arc<dyn Notifier>,
    policy: NotificationPolicy,
}

impl AlertCoordinator {
    pub fn new(
        store: Arc<dyn Repository>,
        notifier: Arc<dyn Notifier>,
        policy: NotificationPolicy,
    ) -> Self {
        Self {
            store,
            notifier,
            policy,
        }
    }

    /// Return the open alert for the key, creating it if there is none
    ///
    /// Every enabled channel that is due gets a notification. The send time is
    /// claimed in the store before the notification is handed off, so each
    /// channel is sent once even when callers race.
    #[instrument(skip(self, request), fields(key = %request.key))]
    pub async fn open_or_get(&self, request: AlertRequest) -> StoreResult<Alert> {
        let (mut alert, created) = self
            .store
            .insert_alert_if_absent(NewAlert {
                key: request.key.clone(),
                severity: request.severity,
                message: request.message.clone(),
            })
            .await?;

        if created {
            info!(alert_id = alert.id, severity = %alert.severity, "opened alert");
        } else {
            debug!(alert_id = alert.id, "alert already open");
        }

        let now = Utc::now();
        for channel in request.channels.enabled() {
            let last_sent = alert.last_sent(channel);
            if !self.policy.is_due(last_sent, now) {
                continue;
            }

            // a concurrent caller may have claimed this send already
            let claimed = self
                .store
                .record_notification(alert.id, channel, last_sent, now)
                .await?;
            if !claimed {
                continue;
            }
            alert.mark_sent(channel, now);

            self.dispatch(Notification {
                channel,
                subject: format!("{} alert", alert.severity),
                body: alert.message.clone(),
                severity: alert.severity,
                recipients: Vec::new(),
            });
        }

        Ok(alert)
    }

    /// Resolve the open alert for the key, if any
    #[instrument(skip(self), fields(key = %key))]
    pub async fn resolve(&self, key: &AlertKey) -> StoreResult<Option<Alert>> {
        let resolved = self.store.resolve_alert(key, Utc::now()).await?;

        match &resolved {
            Some(alert) => {
                info!(alert_id = alert.id, "resolved alert");
                if self.policy.notify_on_resolve {
                    for channel in alert.notified_channels() {
                        self.dispatch(Notification {
                            channel,
                            subject: "resolved".to_string(),
                            body: format!("Resolved: {}", alert.message),
                            severity: Severity::Info,
                            recipients: Vec::new(),
                        });
                    }
                }
            }
            None => debug!("no open alert to resolve"),
        }

        Ok(resolved)
    }

    fn dispatch(&self, notification: Notification) {
        let notifier = Arc::clone(&self.notifier);
        tokio::spawn(async move {
            let channel = notification.channel;
            if let Err(e) = notifier.send(notification).await {
                error!("failed to send {channel} notification: {e:#}");
            }
        });
    }
}
