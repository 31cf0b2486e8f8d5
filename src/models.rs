//! Records shared by the dispatcher, the check engine and the alert coordinator
//!
//! These mirror what the persistence layer hands out. Nothing in here talks to
//! the network; behaviour lives in the components that consume them.

use std::fmt;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

/// Default number of minutes without a heartbeat before an agent counts as offline
pub const DEFAULT_OFFLINE_AFTER_MINUTES: u32 = 4;

fn default_offline_after() -> u32 {
    DEFAULT_OFFLINE_AFTER_MINUTES
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Platform {
    Windows,
    Linux,
    Darwin,
}

impl Platform {
    pub fn is_posix(&self) -> bool {
        matches!(self, Platform::Linux | Platform::Darwin)
    }
}

impl fmt::Display for Platform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Platform::Windows => "windows",
            Platform::Linux => "linux",
            Platform::Darwin => "darwin",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MonitoringType {
    Server,
    Workstation,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AgentStatus {
    Online,
    Offline,
}

impl fmt::Display for AgentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AgentStatus::Online => f.write_str("online"),
            AgentStatus::Offline => f.write_str("offline"),
        }
    }
}

/// A managed endpoint
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Agent {
    /// Unique identifier, also used as the agent's bus subject
    pub agent_id: String,

    pub hostname: String,

    pub platform: Platform,

    pub monitoring_type: MonitoringType,

    pub client_id: u64,

    pub site_id: u64,

    /// Policies in effect for this agent (already resolved through site and client)
    #[serde(default)]
    pub policies: Vec<u64>,

    /// Suppresses alert creation; commands still run
    #[serde(default)]
    pub maintenance_mode: bool,

    /// Last heartbeat received
    pub last_seen: Option<DateTime<Utc>>,

    #[serde(default = "default_offline_after")]
    pub offline_after_minutes: u32,
}

impl Agent {
    /// Online/offline as derived from the last heartbeat
    pub fn status(&self, now: DateTime<Utc>) -> AgentStatus {
        let Some(last_seen) = self.last_seen else {
            return AgentStatus::Offline;
        };

        let window = Duration::minutes(i64::from(self.offline_after_minutes));
        if now - last_seen <= window {
            AgentStatus::Online
        } else {
            AgentStatus::Offline
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Info,
    Warning,
    Error,
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Severity::Info => "info",
            Severity::Warning => "warning",
            Severity::Error => "error",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScriptShell {
    Powershell,
    Cmd,
    Python,
    Shell,
}

impl fmt::Display for ScriptShell {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ScriptShell::Powershell => "powershell",
            ScriptShell::Cmd => "cmd",
            ScriptShell::Python => "python",
            ScriptShell::Shell => "shell",
        };
        f.write_str(name)
    }
}

/// Shell a raw command runs in
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CommandShell {
    Cmd,
    Powershell,
    Shell,
    /// Path to an interpreter on the agent; an empty path falls back to the default shell
    Custom(String),
}

impl CommandShell {
    /// The name or path sent to the agent
    pub fn resolve(&self, platform: Platform) -> &str {
        match self {
            CommandShell::Cmd => "cmd",
            CommandShell::Powershell => "powershell",
            CommandShell::Shell => "/bin/bash",
            CommandShell::Custom(path) if !path.trim().is_empty() => path.as_str(),
            CommandShell::Custom(_) if platform.is_posix() => "/bin/bash",
            CommandShell::Custom(_) => "cmd",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Script {
    pub id: u64,
    pub name: String,
    pub shell: ScriptShell,
    pub body: String,
}

/// A custom field definition
///
/// `model` is kept as the raw stored value; it is validated when a value is about
/// to be written (see [`FieldTarget`]).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CustomField {
    pub id: u64,
    pub name: String,
    pub model: String,
}

/// The record a custom field value is attached to
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "model", content = "id", rename_all = "lowercase")]
pub enum FieldTarget {
    Agent(String),
    Client(u64),
    Site(u64),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Note {
    pub id: u64,
    pub agent_id: String,
    pub username: String,
    pub note: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct NewNote {
    pub agent_id: String,
    pub username: String,
    pub note: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PendingActionKind {
    ScheduledReboot,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PendingStatus {
    Pending,
    Completed,
    Failed,
}

/// An operation requested of an agent that completes later
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PendingAction {
    pub id: u64,
    pub agent_id: String,
    pub kind: PendingActionKind,
    pub status: PendingStatus,
    pub details: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct NewPendingAction {
    pub agent_id: String,
    pub kind: PendingActionKind,
    pub details: serde_json::Value,
}

/// Completion report an agent sends once a pending action has run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PendingActionReport {
    pub action_id: u64,
    pub agent_id: String,
    pub succeeded: bool,
    /// Merged into the stored details
    #[serde(default)]
    pub details: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentHistoryKind {
    CmdRun,
    ScriptRun,
}

/// Write-once record of a command or script invocation
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentHistory {
    pub id: u64,
    pub agent_id: String,
    pub kind: AgentHistoryKind,
    pub username: String,
    pub command: Option<String>,
    pub script_id: Option<u64>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct NewAgentHistory {
    pub agent_id: String,
    pub kind: AgentHistoryKind,
    pub username: String,
    pub command: Option<String>,
    pub script_id: Option<u64>,
}

/// Usernames are stored truncated, like the audit trail columns they end up in
pub fn truncate_username(username: &str) -> String {
    username.chars().take(50).collect()
}
