//! Check result ingestion
//!
//! [`CheckEngine`] is the only writer of check results. It is normally driven
//! through [`crate::actors::CheckEngineHandle`], which serializes ingestion so the
//! result update and the alert decision for a (check, agent) pair happen as one
//! unit.

use std::sync::Arc;

use chrono::{Duration, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument, warn};

use super::error::EngineError;
use super::transition::{AlertAction, CheckState};
use super::{Check, CheckHistoryEntry, CheckReport, CheckResult, NewCheck, SyncStatus};
use crate::alerts::{Alert, AlertCoordinator, AlertKey, AlertRequest};
use crate::checks::CheckOwner;
use crate::models::{Agent, Severity};
use crate::notify::AlertChannels;
use crate::storage::Repository;

/// What a single ingested result changed
#[derive(Debug, Clone)]
pub struct IngestOutcome {
    pub result: CheckResult,
    pub action: AlertAction,
    /// The open alert after an `Open` action; `None` when suppressed or not needed
    pub alert: Option<Alert>,
}

/// Pass/fail outcome of an automated task run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskOutcome {
    pub task_id: u64,
    pub agent_id: String,
    pub task_name: String,
    pub passed: bool,
    pub severity: Severity,
    #[serde(default)]
    pub detail: String,
    #[serde(default)]
    pub alert: AlertChannels,
}

#[derive(Clone)]
pub struct CheckEngine {
    store: Arc<dyn Repository>,
    alerts: AlertCoordinator,
}

impl CheckEngine {
    pub fn new(store: Arc<dyn Repository>, alerts: AlertCoordinator) -> Self {
        Self { store, alerts }
    }

    /// Evaluate one reported result and apply the resulting transition
    ///
    /// Malformed payloads are rejected before anything is written, so the
    /// previous state stays as it was.
    #[instrument(skip(self, report), fields(check_id = report.check_id, agent_id = %report.agent_id))]
    pub async fn ingest(&self, report: CheckReport) -> Result<IngestOutcome, EngineError> {
        let check = self.store.get_check(report.check_id).await?;
        let agent = self.store.get_agent(&report.agent_id).await?;

        if !check.applies_to(&agent) {
            warn!("result for a check the agent does not run");
            return Err(EngineError::InvalidInput(format!(
                "check {} does not apply to agent {}",
                check.id, agent.agent_id
            )));
        }

        let evaluation = match check.kind.evaluate(&report.payload, check.severity) {
            Ok(evaluation) => evaluation,
            Err(e) => {
                warn!("dropping result: {e}");
                return Err(e);
            }
        };

        let previous = self.store.check_result(check.id, &agent.agent_id).await?;
        let expected_version = previous.as_ref().map(|r| r.version);
        let state = previous
            .as_ref()
            .map(CheckResult::state)
            .unwrap_or(CheckState::INITIAL);

        let (next, action) = state.apply(evaluation.passed, check.failures);
        debug!(?state, ?next, ?action, "check transition");

        let now = Utc::now();
        let result = CheckResult {
            severity: evaluation.severity,
            detail: evaluation.detail.clone(),
            last_run: Some(now),
            sync_status: SyncStatus::Synced,
            ..CheckResult::pending(check.id, agent.agent_id.clone())
        }
        .with_state(next);

        let stored = self
            .store
            .swap_check_result(expected_version, result)
            .await?;

        self.store
            .append_check_history(CheckHistoryEntry {
                check_id: check.id,
                agent_id: agent.agent_id.clone(),
                timestamp: now,
                value: evaluation.value,
            })
            .await?;

        let key = AlertKey::Check {
            check_id: check.id,
            agent_id: agent.agent_id.clone(),
        };
        let alert = match action {
            AlertAction::Open => {
                let message = format!(
                    "{} - {} failing: {}",
                    agent.hostname,
                    check.readable_desc(),
                    evaluation.detail
                );
                self.open_alert(&agent, key, evaluation.severity, message, check.alert)
                    .await?
            }
            AlertAction::Resolve => {
                self.alerts.resolve(&key).await?;
                None
            }
            AlertAction::None => None,
        };

        Ok(IngestOutcome {
            result: stored,
            action,
            alert,
        })
    }

    /// Force a check back to passing and resolve its alert
    #[instrument(skip(self))]
    pub async fn reset(&self, check_id: u64, agent_id: &str) -> Result<CheckResult, EngineError> {
        let Some(current) = self.store.check_result(check_id, agent_id).await? else {
            return Err(EngineError::NotFound(format!(
                "result of check {check_id} on {agent_id}"
            )));
        };

        let version = current.version;
        let reset = current.with_state(CheckState::RESET);
        let stored = self.store.swap_check_result(Some(version), reset).await?;

        self.alerts
            .resolve(&AlertKey::Check {
                check_id,
                agent_id: agent_id.to_string(),
            })
            .await?;

        info!("check reset to passing");
        Ok(stored)
    }

    /// Open or resolve the alert of an automated task
    #[instrument(skip(self, outcome), fields(task_id = outcome.task_id, agent_id = %outcome.agent_id))]
    pub async fn ingest_task_outcome(
        &self,
        outcome: TaskOutcome,
    ) -> Result<Option<Alert>, EngineError> {
        let agent = self.store.get_agent(&outcome.agent_id).await?;
        let key = AlertKey::Task {
            task_id: outcome.task_id,
            agent_id: agent.agent_id.clone(),
        };

        if outcome.passed {
            self.alerts.resolve(&key).await?;
            return Ok(None);
        }

        let message = format!(
            "{} - Task {} failed: {}",
            agent.hostname, outcome.task_name, outcome.detail
        );
        self.open_alert(&agent, key, outcome.severity, message, outcome.alert)
            .await
    }

    async fn open_alert(
        &self,
        agent: &Agent,
        key: AlertKey,
        severity: Severity,
        message: String,
        channels: AlertChannels,
    ) -> Result<Option<Alert>, EngineError> {
        if agent.maintenance_mode {
            debug!("agent in maintenance mode, not alerting");
            return Ok(None);
        }

        let alert = self
            .alerts
            .open_or_get(AlertRequest {
                key,
                severity,
                message,
                channels,
            })
            .await?;
        Ok(Some(alert))
    }

    pub async fn create_check(&self, check: NewCheck) -> Result<Check, EngineError> {
        check.validate()?;
        if let CheckOwner::Agent(agent_id) = &check.owner {
            self.store.get_agent(agent_id).await?;
        }

        let check = self.store.insert_check(check).await?;
        info!(check_id = check.id, "created {}", check.readable_desc());
        Ok(check)
    }

    pub async fn update_check(&self, check: Check) -> Result<Check, EngineError> {
        check.validate()?;
        self.store.get_check(check.id).await?;
        Ok(self.store.update_check(check).await?)
    }

    pub async fn delete_check(&self, check_id: u64) -> Result<(), EngineError> {
        self.store.delete_check(check_id).await?;
        info!(check_id, "deleted check");
        Ok(())
    }

    /// History of a check on an agent over the last `days` days
    pub async fn history(
        &self,
        check_id: u64,
        agent_id: &str,
        days: u32,
    ) -> Result<Vec<CheckHistoryEntry>, EngineError> {
        let since = Utc::now() - Duration::days(i64::from(days));
        Ok(self.store.check_history(check_id, agent_id, since).await?)
    }
}
