use std::time::Duration;

use serde::Deserialize;
use tracing::trace;

use crate::alerts::NotificationPolicy;
use crate::checks::NewCheck;
use crate::models::{Agent, CustomField, Script};
use crate::util;

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct NatsConfig {
    pub url: String,

    /// Prefix of the reply subjects; replies arrive on `<inbox_prefix>.<token>`
    pub inbox_prefix: String,

    /// Subject agents publish check results on
    pub results_subject: String,

    /// Subject agents publish automated task outcomes on
    pub task_results_subject: String,

    /// Subject agents report finished pending actions on
    pub pending_results_subject: String,
}

impl Default for NatsConfig {
    fn default() -> Self {
        Self {
            url: "nats://localhost:4222".to_string(),
            inbox_prefix: "_FLEETWATCH_INBOX".to_string(),
            results_subject: "fleetwatch.results".to_string(),
            task_results_subject: "fleetwatch.tasks".to_string(),
            pending_results_subject: "fleetwatch.pending".to_string(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LinkConfig {
    /// Allowance on top of every command timeout
    pub grace_ms: u64,
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self { grace_ms: 500 }
    }
}

impl LinkConfig {
    pub fn grace(&self) -> Duration {
        Duration::from_millis(self.grace_ms)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    /// Work units executed at the same time
    pub concurrency: usize,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self { concurrency: 8 }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct NotificationConfig {
    pub email_webhook: Option<String>,

    pub sms_webhook: Option<String>,

    pub script_webhook: Option<String>,

    /// Resend notifications of an alert that stays open this long
    pub renotify_minutes: Option<u64>,

    pub notify_on_resolve: bool,
}

impl NotificationConfig {
    pub fn policy(&self) -> NotificationPolicy {
        NotificationPolicy {
            renotify_after: self
                .renotify_minutes
                .map(|minutes| Duration::from_secs(minutes * 60)),
            notify_on_resolve: self.notify_on_resolve,
        }
    }
}

/// Records loaded into the in-memory store at startup
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct FleetConfig {
    pub agents: Vec<Agent>,
    pub scripts: Vec<Script>,
    pub custom_fields: Vec<CustomField>,
    pub checks: Vec<NewCheck>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    pub nats: NatsConfig,
    pub link: LinkConfig,
    pub workers: WorkerConfig,
    pub notifications: NotificationConfig,
    pub fleet: FleetConfig,
}

impl Config {
    /// Apply overrides from the environment
    pub fn with_env_overrides(mut self) -> Self {
        if let Some(url) = util::get_nats_url() {
            self.nats.url = url;
        }
        if let Some(workers) = util::get_worker_count() {
            self.workers.concurrency = workers;
        }
        self
    }
}

pub fn read_config_file(path: &str) -> anyhow::Result<Config> {
    let file_content = std::fs::read_to_string(path)?;
    serde_json::from_str(&file_content)
        .map_err(|e| anyhow::anyhow!("Invalid configuration file provided: {e}"))
        .inspect(|config| trace!("loaded config: {config:?}"))
}
