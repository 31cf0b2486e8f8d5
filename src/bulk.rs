//! Fan-out of one action over many agents
//!
//! The orchestrator resolves the target set, submits one [`WorkUnit`] per agent
//! and returns. It never waits for a unit to run.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{info, instrument};

use crate::error::CommandError;
use crate::models::{Agent, MonitoringType, Platform, truncate_username};
use crate::queue::{PatchMode, TaskQueue, WorkAction, WorkUnit};
use crate::storage::Repository;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "target", rename_all = "lowercase")]
pub enum BulkTarget {
    Client { client_id: u64 },
    Site { site_id: u64 },
    Agents { agent_ids: Vec<String> },
    All,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MonitoringFilter {
    #[default]
    All,
    Servers,
    Workstations,
}

impl MonitoringFilter {
    fn matches(&self, monitoring_type: MonitoringType) -> bool {
        match self {
            MonitoringFilter::All => true,
            MonitoringFilter::Servers => monitoring_type == MonitoringType::Server,
            MonitoringFilter::Workstations => monitoring_type == MonitoringType::Workstation,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PlatformFilter {
    #[default]
    All,
    Windows,
    Linux,
}

impl PlatformFilter {
    fn matches(&self, platform: Platform) -> bool {
        match self {
            PlatformFilter::All => true,
            PlatformFilter::Windows => platform == Platform::Windows,
            PlatformFilter::Linux => platform == Platform::Linux,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BulkRequest {
    #[serde(flatten)]
    pub target: BulkTarget,
    #[serde(default)]
    pub monitoring_type: MonitoringFilter,
    #[serde(default)]
    pub platform: PlatformFilter,
    pub action: WorkAction,
    pub username: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BulkSummary {
    pub count: usize,
    pub message: String,
}

/// Scope of a maintenance mode change
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "id", rename_all = "lowercase")]
pub enum MaintenanceScope {
    Client(u64),
    Site(u64),
}

#[derive(Clone)]
pub struct BulkOrchestrator {
    store: Arc<dyn Repository>,
    queue: Arc<dyn TaskQueue>,
}

impl BulkOrchestrator {
    pub fn new(store: Arc<dyn Repository>, queue: Arc<dyn TaskQueue>) -> Self {
        Self { store, queue }
    }

    /// Resolve the agents a request applies to. Patching only reaches agents
    /// that support it.
    pub async fn resolve_targets(&self, request: &BulkRequest) -> Result<Vec<Agent>, CommandError> {
        if let BulkTarget::Agents { agent_ids } = &request.target
            && agent_ids.is_empty()
        {
            return Err(CommandError::InvalidInput(
                "Must select at least 1 agent".to_string(),
            ));
        }

        let agents = self.store.list_agents().await?;
        Ok(agents
            .into_iter()
            .filter(|agent| match &request.target {
                BulkTarget::Client { client_id } => agent.client_id == *client_id,
                BulkTarget::Site { site_id } => agent.site_id == *site_id,
                BulkTarget::Agents { agent_ids } => agent_ids.contains(&agent.agent_id),
                BulkTarget::All => true,
            })
            .filter(|agent| request.monitoring_type.matches(agent.monitoring_type))
            .filter(|agent| request.platform.matches(agent.platform))
            .filter(|agent| {
                !matches!(request.action, WorkAction::Patch { .. }) || !agent.platform.is_posix()
            })
            .collect())
    }

    /// Queue the action for every matching agent
    #[instrument(skip(self, request), fields(username = %request.username))]
    pub async fn execute(&self, request: BulkRequest) -> Result<BulkSummary, CommandError> {
        let agents = self.resolve_targets(&request).await?;
        if agents.is_empty() {
            return Err(CommandError::InvalidInput(
                "No agents where found meeting the selected criteria".to_string(),
            ));
        }

        let message = match &request.action {
            WorkAction::Command { .. } => {
                format!("Command will now be run on {} agents", agents.len())
            }
            WorkAction::Script { script_id, .. } | WorkAction::EmailScriptOutput { script_id, .. } => {
                let script = self.store.get_script(*script_id).await?;
                format!("{} will now be run on {} agents", script.name, agents.len())
            }
            WorkAction::Patch {
                patch_mode: PatchMode::Install,
            } => format!(
                "Pending updates will now be installed on {} agents",
                agents.len()
            ),
            WorkAction::Patch {
                patch_mode: PatchMode::Scan,
            } => format!("Patch status scan will now run on {} agents", agents.len()),
        };

        let username = truncate_username(&request.username);
        info!(
            target: "audit",
            username = %username,
            agents = agents.len(),
            action = ?request.action,
            "bulk action"
        );

        for agent in &agents {
            self.queue
                .submit(WorkUnit {
                    agent_id: agent.agent_id.clone(),
                    action: request.action.clone(),
                    username: username.clone(),
                })
                .await?;
        }

        Ok(BulkSummary {
            count: agents.len(),
            message,
        })
    }

    /// Turn maintenance mode on or off for a client's or a site's agents
    #[instrument(skip(self))]
    pub async fn set_maintenance_mode(
        &self,
        scope: MaintenanceScope,
        enabled: bool,
    ) -> Result<BulkSummary, CommandError> {
        let agent_ids: Vec<String> = self
            .store
            .list_agents()
            .await?
            .into_iter()
            .filter(|agent| match scope {
                MaintenanceScope::Client(client_id) => agent.client_id == client_id,
                MaintenanceScope::Site(site_id) => agent.site_id == site_id,
            })
            .map(|agent| agent.agent_id)
            .collect();

        let count = self.store.set_maintenance_mode(&agent_ids, enabled).await?;
        let message = if count > 0 {
            let action = if enabled { "enabled" } else { "disabled" };
            format!("Maintenance mode has been {action} on {count} agents")
        } else {
            "No agents have been put in maintenance mode".to_string()
        };

        info!(count, enabled, "maintenance mode changed");
        Ok(BulkSummary { count, message })
    }
}
