//! In-memory repository (no persistence)
//!
//! Everything lives behind one mutex, which makes the compare-and-swap and
//! insert-if-absent guarantees trivially atomic. Useful for:
//! - Tests without a database
//! - Running the hub locally against a seeded fleet
//!
//! ## Limitations
//!
//! - **No persistence**: all data is lost on restart
//! - **Single lock**: fine for tests and small fleets, not for production load

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use tokio::sync::Mutex;
use tracing::debug;

use super::backend::Repository;
use super::error::{StoreError, StoreResult};
use crate::alerts::{Alert, AlertKey, NewAlert};
use crate::checks::{Check, CheckHistoryEntry, CheckResult, NewCheck};
use crate::models::{
    Agent, AgentHistory, CustomField, FieldTarget, NewAgentHistory, NewNote, NewPendingAction,
    Note, PendingAction, PendingStatus, Script,
};
use crate::notify::Channel;

#[derive(Default)]
struct Inner {
    next_id: u64,
    agents: HashMap<String, Agent>,
    scripts: HashMap<u64, Script>,
    custom_fields: HashMap<u64, CustomField>,
    field_values: HashMap<(u64, FieldTarget), String>,
    notes: Vec<Note>,
    checks: HashMap<u64, Check>,
    results: HashMap<(u64, String), CheckResult>,
    history: Vec<CheckHistoryEntry>,
    alerts: Vec<Alert>,
    pending_actions: Vec<PendingAction>,
    agent_history: Vec<AgentHistory>,
}

impl Inner {
    fn next_id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }

    fn resolve_alerts_where(&mut self, at: DateTime<Utc>, removed: impl Fn(&AlertKey) -> bool) {
        for alert in self.alerts.iter_mut() {
            if alert.is_open() && removed(&alert.key) {
                alert.resolved_at = Some(at);
            }
        }
    }
}

#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn insert_agent(&self, agent: Agent) {
        let mut inner = self.inner.lock().await;
        inner.agents.insert(agent.agent_id.clone(), agent);
    }

    pub async fn insert_script(&self, script: Script) {
        let mut inner = self.inner.lock().await;
        inner.scripts.insert(script.id, script);
    }

    pub async fn insert_custom_field(&self, field: CustomField) {
        let mut inner = self.inner.lock().await;
        inner.custom_fields.insert(field.id, field);
    }

    /// Every alert ever created, open or resolved
    pub async fn alerts(&self) -> Vec<Alert> {
        self.inner.lock().await.alerts.clone()
    }
}

#[async_trait]
impl Repository for MemoryStore {
    async fn get_agent(&self, agent_id: &str) -> StoreResult<Agent> {
        let inner = self.inner.lock().await;
        inner
            .agents
            .get(agent_id)
            .cloned()
            .ok_or_else(|| StoreError::not_found(format!("agent {agent_id}")))
    }

    async fn list_agents(&self) -> StoreResult<Vec<Agent>> {
        let inner = self.inner.lock().await;
        let mut agents: Vec<Agent> = inner.agents.values().cloned().collect();
        agents.sort_by(|a, b| a.agent_id.cmp(&b.agent_id));
        Ok(agents)
    }

    async fn delete_agent(&self, agent_id: &str) -> StoreResult<()> {
        let mut inner = self.inner.lock().await;
        if inner.agents.remove(agent_id).is_none() {
            return Err(StoreError::not_found(format!("agent {agent_id}")));
        }
        inner.results.retain(|(_, owner), _| owner != agent_id);
        inner.resolve_alerts_where(Utc::now(), |key| key.agent_id() == agent_id);
        debug!("deleted agent {agent_id}");
        Ok(())
    }

    async fn set_maintenance_mode(&self, agent_ids: &[String], enabled: bool) -> StoreResult<usize> {
        let mut inner = self.inner.lock().await;
        let mut updated = 0;
        for agent_id in agent_ids {
            if let Some(agent) = inner.agents.get_mut(agent_id) {
                agent.maintenance_mode = enabled;
                updated += 1;
            }
        }
        Ok(updated)
    }

    async fn get_script(&self, script_id: u64) -> StoreResult<Script> {
        let inner = self.inner.lock().await;
        inner
            .scripts
            .get(&script_id)
            .cloned()
            .ok_or_else(|| StoreError::not_found(format!("script {script_id}")))
    }

    async fn get_custom_field(&self, field_id: u64) -> StoreResult<CustomField> {
        let inner = self.inner.lock().await;
        inner
            .custom_fields
            .get(&field_id)
            .cloned()
            .ok_or_else(|| StoreError::not_found(format!("custom field {field_id}")))
    }

    async fn save_custom_field_value(
        &self,
        field_id: u64,
        target: FieldTarget,
        value: String,
    ) -> StoreResult<()> {
        let mut inner = self.inner.lock().await;
        if !inner.custom_fields.contains_key(&field_id) {
            return Err(StoreError::not_found(format!("custom field {field_id}")));
        }
        inner.field_values.insert((field_id, target), value);
        Ok(())
    }

    async fn custom_field_value(
        &self,
        field_id: u64,
        target: &FieldTarget,
    ) -> StoreResult<Option<String>> {
        let inner = self.inner.lock().await;
        Ok(inner.field_values.get(&(field_id, target.clone())).cloned())
    }

    async fn add_note(&self, note: NewNote) -> StoreResult<Note> {
        let mut inner = self.inner.lock().await;
        let note = Note {
            id: inner.next_id(),
            agent_id: note.agent_id,
            username: note.username,
            note: note.note,
            created_at: Utc::now(),
        };
        inner.notes.push(note.clone());
        Ok(note)
    }

    async fn notes(&self, agent_id: &str) -> StoreResult<Vec<Note>> {
        let inner = self.inner.lock().await;
        Ok(inner
            .notes
            .iter()
            .filter(|n| n.agent_id == agent_id)
            .cloned()
            .collect())
    }

    async fn insert_check(&self, check: NewCheck) -> StoreResult<Check> {
        let mut inner = self.inner.lock().await;
        let check = check.with_id(inner.next_id());
        inner.checks.insert(check.id, check.clone());
        Ok(check)
    }

    async fn get_check(&self, check_id: u64) -> StoreResult<Check> {
        let inner = self.inner.lock().await;
        inner
            .checks
            .get(&check_id)
            .cloned()
            .ok_or_else(|| StoreError::not_found(format!("check {check_id}")))
    }

    async fn update_check(&self, check: Check) -> StoreResult<Check> {
        let mut inner = self.inner.lock().await;
        let Some(slot) = inner.checks.get_mut(&check.id) else {
            return Err(StoreError::not_found(format!("check {}", check.id)));
        };
        *slot = check.clone();
        Ok(check)
    }

    async fn delete_check(&self, check_id: u64) -> StoreResult<()> {
        let mut inner = self.inner.lock().await;
        if inner.checks.remove(&check_id).is_none() {
            return Err(StoreError::not_found(format!("check {check_id}")));
        }
        inner.results.retain(|(id, _), _| *id != check_id);
        inner.history.retain(|entry| entry.check_id != check_id);
        inner.resolve_alerts_where(Utc::now(), |key| {
            matches!(key, AlertKey::Check { check_id: id, .. } if *id == check_id)
        });
        Ok(())
    }

    async fn check_result(&self, check_id: u64, agent_id: &str) -> StoreResult<Option<CheckResult>> {
        let inner = self.inner.lock().await;
        Ok(inner
            .results
            .get(&(check_id, agent_id.to_string()))
            .cloned())
    }

    async fn swap_check_result(
        &self,
        expected_version: Option<u64>,
        mut result: CheckResult,
    ) -> StoreResult<CheckResult> {
        let mut inner = self.inner.lock().await;
        let key = (result.check_id, result.agent_id.clone());
        let current = inner.results.get(&key).map(|r| r.version);

        if current != expected_version {
            return Err(StoreError::Conflict(format!(
                "check {} on {} is at version {current:?}, expected {expected_version:?}",
                result.check_id, result.agent_id
            )));
        }

        result.version = expected_version.map_or(1, |v| v + 1);
        inner.results.insert(key, result.clone());
        Ok(result)
    }

    async fn append_check_history(&self, entry: CheckHistoryEntry) -> StoreResult<()> {
        let mut inner = self.inner.lock().await;
        inner.history.push(entry);
        Ok(())
    }

    async fn check_history(
        &self,
        check_id: u64,
        agent_id: &str,
        since: DateTime<Utc>,
    ) -> StoreResult<Vec<CheckHistoryEntry>> {
        let inner = self.inner.lock().await;
        let mut entries: Vec<CheckHistoryEntry> = inner
            .history
            .iter()
            .filter(|e| e.check_id == check_id && e.agent_id == agent_id && e.timestamp >= since)
            .cloned()
            .collect();
        entries.sort_by_key(|e| e.timestamp);
        Ok(entries)
    }

    async fn insert_alert_if_absent(&self, alert: NewAlert) -> StoreResult<(Alert, bool)> {
        let mut inner = self.inner.lock().await;
        if let Some(existing) = inner
            .alerts
            .iter()
            .find(|a| a.key == alert.key && a.is_open())
        {
            return Ok((existing.clone(), false));
        }

        let created = Alert {
            id: inner.next_id(),
            key: alert.key,
            severity: alert.severity,
            message: alert.message,
            opened_at: Utc::now(),
            resolved_at: None,
            email_sent: None,
            sms_sent: None,
            script_sent: None,
        };
        inner.alerts.push(created.clone());
        Ok((created, true))
    }

    async fn open_alert(&self, key: &AlertKey) -> StoreResult<Option<Alert>> {
        let inner = self.inner.lock().await;
        Ok(inner
            .alerts
            .iter()
            .find(|a| a.key == *key && a.is_open())
            .cloned())
    }

    async fn resolve_alert(
        &self,
        key: &AlertKey,
        at: DateTime<Utc>,
    ) -> StoreResult<Option<Alert>> {
        let mut inner = self.inner.lock().await;
        let Some(alert) = inner
            .alerts
            .iter_mut()
            .find(|a| a.key == *key && a.is_open())
        else {
            return Ok(None);
        };
        alert.resolved_at = Some(at);
        Ok(Some(alert.clone()))
    }

    async fn record_notification(
        &self,
        alert_id: u64,
        channel: Channel,
        previous: Option<DateTime<Utc>>,
        at: DateTime<Utc>,
    ) -> StoreResult<bool> {
        let mut inner = self.inner.lock().await;
        let Some(alert) = inner.alerts.iter_mut().find(|a| a.id == alert_id) else {
            return Err(StoreError::not_found(format!("alert {alert_id}")));
        };
        if alert.last_sent(channel) != previous {
            return Ok(false);
        }
        alert.mark_sent(channel, at);
        Ok(true)
    }

    async fn add_pending_action(&self, action: NewPendingAction) -> StoreResult<PendingAction> {
        let mut inner = self.inner.lock().await;
        let action = PendingAction {
            id: inner.next_id(),
            agent_id: action.agent_id,
            kind: action.kind,
            status: PendingStatus::Pending,
            details: action.details,
            created_at: Utc::now(),
        };
        inner.pending_actions.push(action.clone());
        Ok(action)
    }

    async fn pending_actions(&self, agent_id: &str) -> StoreResult<Vec<PendingAction>> {
        let inner = self.inner.lock().await;
        Ok(inner
            .pending_actions
            .iter()
            .filter(|a| a.agent_id == agent_id)
            .cloned()
            .collect())
    }

    async fn complete_pending_action(
        &self,
        action_id: u64,
        status: PendingStatus,
        details: Option<Value>,
    ) -> StoreResult<PendingAction> {
        let mut inner = self.inner.lock().await;
        let Some(action) = inner.pending_actions.iter_mut().find(|a| a.id == action_id) else {
            return Err(StoreError::not_found(format!("pending action {action_id}")));
        };
        if status == PendingStatus::Pending || action.status != PendingStatus::Pending {
            return Err(StoreError::Conflict(format!(
                "pending action {action_id} cannot go from {:?} to {status:?}",
                action.status
            )));
        }

        action.status = status;
        match (&mut action.details, details) {
            (Value::Object(stored), Some(Value::Object(extra))) => stored.extend(extra),
            (stored, Some(extra)) => *stored = extra,
            (_, None) => {}
        }
        Ok(action.clone())
    }

    async fn add_agent_history(&self, entry: NewAgentHistory) -> StoreResult<AgentHistory> {
        let mut inner = self.inner.lock().await;
        let entry = AgentHistory {
            id: inner.next_id(),
            agent_id: entry.agent_id,
            kind: entry.kind,
            username: entry.username,
            command: entry.command,
            script_id: entry.script_id,
            created_at: Utc::now(),
        };
        inner.agent_history.push(entry.clone());
        Ok(entry)
    }

    async fn agent_history(&self, agent_id: &str) -> StoreResult<Vec<AgentHistory>> {
        let inner = self.inner.lock().await;
        Ok(inner
            .agent_history
            .iter()
            .filter(|h| h.agent_id == agent_id)
            .cloned()
            .collect())
    }
}
