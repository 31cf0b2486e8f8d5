//! Repository trait definition
//!
//! Persistence is owned by the surrounding platform. The control plane only needs
//! the narrow set of reads and writes listed here.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;

use super::error::StoreResult;
use crate::alerts::{Alert, AlertKey, NewAlert};
use crate::checks::{Check, CheckHistoryEntry, CheckResult, NewCheck};
use crate::models::{
    Agent, AgentHistory, CustomField, FieldTarget, NewAgentHistory, NewNote, NewPendingAction,
    Note, PendingAction, PendingStatus, Script,
};
use crate::notify::Channel;

/// Persistence collaborator
///
/// ## Consistency
///
/// These operations carry concurrency guarantees the rest of the crate relies on:
///
/// - [`Repository::swap_check_result`] is a compare-and-swap on the result
///   version, so an update computed from a stale read is rejected with
///   `StoreError::Conflict`.
/// - [`Repository::insert_alert_if_absent`] is atomic: two concurrent callers
///   for the same key end up with the same open alert.
/// - [`Repository::record_notification`] only succeeds for the caller that saw
///   the current send time, so a channel is claimed once per window.
/// - [`Repository::delete_check`] and [`Repository::delete_agent`] resolve the
///   open alerts of the removed keys in the same step.
/// - [`Repository::complete_pending_action`] moves an action out of `pending`
///   once; a second completion is a `StoreError::Conflict`.
///
/// Implementations must be `Send + Sync`; a single instance is shared by the
/// dispatcher, the engine and the orchestrator.
#[async_trait]
pub trait Repository: Send + Sync {
    async fn get_agent(&self, agent_id: &str) -> StoreResult<Agent>;

    async fn list_agents(&self) -> StoreResult<Vec<Agent>>;

    /// Remove an agent along with its check results, resolving its open alerts
    async fn delete_agent(&self, agent_id: &str) -> StoreResult<()>;

    /// Set the maintenance flag on the given agents, returning how many were updated
    async fn set_maintenance_mode(&self, agent_ids: &[String], enabled: bool) -> StoreResult<usize>;

    async fn get_script(&self, script_id: u64) -> StoreResult<Script>;

    async fn get_custom_field(&self, field_id: u64) -> StoreResult<CustomField>;

    async fn save_custom_field_value(
        &self,
        field_id: u64,
        target: FieldTarget,
        value: String,
    ) -> StoreResult<()>;

    async fn custom_field_value(
        &self,
        field_id: u64,
        target: &FieldTarget,
    ) -> StoreResult<Option<String>>;

    async fn add_note(&self, note: NewNote) -> StoreResult<Note>;

    async fn notes(&self, agent_id: &str) -> StoreResult<Vec<Note>>;

    async fn insert_check(&self, check: NewCheck) -> StoreResult<Check>;

    async fn get_check(&self, check_id: u64) -> StoreResult<Check>;

    async fn update_check(&self, check: Check) -> StoreResult<Check>;

    /// Remove a check together with its results and history, resolving its
    /// open alerts
    async fn delete_check(&self, check_id: u64) -> StoreResult<()>;

    async fn check_result(&self, check_id: u64, agent_id: &str) -> StoreResult<Option<CheckResult>>;

    /// Store `result` if the current version matches `expected_version`
    ///
    /// `None` means no result may exist yet. The stored copy, with its new
    /// version, is returned.
    async fn swap_check_result(
        &self,
        expected_version: Option<u64>,
        result: CheckResult,
    ) -> StoreResult<CheckResult>;

    async fn append_check_history(&self, entry: CheckHistoryEntry) -> StoreResult<()>;

    /// History entries newer than `since`, oldest first
    async fn check_history(
        &self,
        check_id: u64,
        agent_id: &str,
        since: DateTime<Utc>,
    ) -> StoreResult<Vec<CheckHistoryEntry>>;

    /// Create an open alert unless one already exists for the key
    ///
    /// Returns the open alert and whether it was created by this call.
    async fn insert_alert_if_absent(&self, alert: NewAlert) -> StoreResult<(Alert, bool)>;

    async fn open_alert(&self, key: &AlertKey) -> StoreResult<Option<Alert>>;

    /// Mark the open alert for the key as resolved, if there is one
    async fn resolve_alert(&self, key: &AlertKey, at: DateTime<Utc>)
    -> StoreResult<Option<Alert>>;

    /// Set the send time of `channel` to `at` if it is still `previous`
    ///
    /// Returns whether the send time was updated.
    async fn record_notification(
        &self,
        alert_id: u64,
        channel: Channel,
        previous: Option<DateTime<Utc>>,
        at: DateTime<Utc>,
    ) -> StoreResult<bool>;

    async fn add_pending_action(&self, action: NewPendingAction) -> StoreResult<PendingAction>;

    async fn pending_actions(&self, agent_id: &str) -> StoreResult<Vec<PendingAction>>;

    /// Move a pending action to `status`, merging `details` into the stored ones
    async fn complete_pending_action(
        &self,
        action_id: u64,
        status: PendingStatus,
        details: Option<Value>,
    ) -> StoreResult<PendingAction>;

    async fn add_agent_history(&self, entry: NewAgentHistory) -> StoreResult<AgentHistory>;

    async fn agent_history(&self, agent_id: &str) -> StoreResult<Vec<AgentHistory>>;
}
