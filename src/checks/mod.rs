//! Health checks and the state they leave behind per agent
//!
//! A [`Check`] is defined once (for an agent directly or through a policy) and is
//! run by every agent it applies to. Each run reports a raw JSON result which the
//! engine turns into a [`CheckResult`] plus an entry in the check history.

pub mod engine;
pub mod error;
pub mod kind;
pub mod transition;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::models::{Agent, Severity};
use crate::notify::AlertChannels;

pub use engine::{CheckEngine, IngestOutcome, TaskOutcome};
pub use error::EngineError;
pub use kind::{CheckKind, Evaluation, EventIdMatch, EventLogCheck, FailWhen, Percent, Thresholds};
pub use transition::{AlertAction, CheckState, CheckStatus};

fn default_failures() -> u32 {
    1
}

/// Who a check belongs to
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "type", content = "id", rename_all = "lowercase")]
pub enum CheckOwner {
    Agent(String),
    Policy(u64),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Check {
    pub id: u64,
    pub owner: CheckOwner,
    #[serde(default)]
    pub name: Option<String>,
    pub kind: CheckKind,
    /// Consecutive failures before the check turns failing
    #[serde(default = "default_failures")]
    pub failures: u32,
    #[serde(default)]
    pub alert: AlertChannels,
    pub severity: Severity,
}

/// A check definition that has not been stored yet
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewCheck {
    pub owner: CheckOwner,
    #[serde(default)]
    pub name: Option<String>,
    pub kind: CheckKind,
    #[serde(default = "default_failures")]
    pub failures: u32,
    #[serde(default)]
    pub alert: AlertChannels,
    pub severity: Severity,
}

fn validate_definition(kind: &CheckKind, failures: u32) -> Result<(), EngineError> {
    if failures == 0 {
        return Err(EngineError::InvalidInput(
            "failures must be at least 1".to_string(),
        ));
    }
    kind.validate()
}

impl NewCheck {
    pub fn validate(&self) -> Result<(), EngineError> {
        validate_definition(&self.kind, self.failures)
    }

    pub fn with_id(self, id: u64) -> Check {
        Check {
            id,
            owner: self.owner,
            name: self.name,
            kind: self.kind,
            failures: self.failures,
            alert: self.alert,
            severity: self.severity,
        }
    }
}

impl Check {
    pub fn validate(&self) -> Result<(), EngineError> {
        validate_definition(&self.kind, self.failures)
    }

    /// Whether `agent` runs this check, directly or through one of its policies
    pub fn applies_to(&self, agent: &Agent) -> bool {
        match &self.owner {
            CheckOwner::Agent(agent_id) => *agent_id == agent.agent_id,
            CheckOwner::Policy(policy_id) => agent.policies.contains(policy_id),
        }
    }

    pub fn readable_desc(&self) -> String {
        match &self.name {
            Some(name) if !name.trim().is_empty() => name.clone(),
            _ => self.kind.describe(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncStatus {
    Initial,
    Synced,
    NotSynced,
    PendingDeletion,
}

/// Latest state of one check on one agent
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckResult {
    pub check_id: u64,
    pub agent_id: String,
    pub status: CheckStatus,
    pub fail_count: u32,
    pub severity: Severity,
    pub detail: String,
    pub last_run: Option<DateTime<Utc>>,
    pub sync_status: SyncStatus,
    /// Bumped by the repository on every successful swap
    pub version: u64,
}

impl CheckResult {
    pub fn pending(check_id: u64, agent_id: impl Into<String>) -> Self {
        Self {
            check_id,
            agent_id: agent_id.into(),
            status: CheckStatus::Pending,
            fail_count: 0,
            severity: Severity::Info,
            detail: String::new(),
            last_run: None,
            sync_status: SyncStatus::Initial,
            version: 0,
        }
    }

    pub fn state(&self) -> CheckState {
        CheckState {
            status: self.status,
            fail_count: self.fail_count,
        }
    }

    pub fn with_state(mut self, state: CheckState) -> Self {
        self.status = state.status;
        self.fail_count = state.fail_count;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckHistoryEntry {
    pub check_id: u64,
    pub agent_id: String,
    pub timestamp: DateTime<Utc>,
    pub value: f64,
}

/// A raw result as reported by an agent
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckReport {
    pub check_id: u64,
    pub agent_id: String,
    pub payload: serde_json::Value,
}
