//! Check results flowing through the engine actor into alerts
//!
//! - Consecutive failures before an alert opens
//! - At most one open alert per check and agent
//! - Maintenance mode and manual reset
//! - Task outcomes and deleted checks

use std::time::Duration;

use assert_matches::assert_matches;
use fleetwatch::actors::CheckEngineHandle;
use fleetwatch::alerts::{AlertKey, AlertRequest, NotificationPolicy};
use fleetwatch::checks::{
    AlertAction, CheckKind, CheckOwner, CheckReport, CheckStatus, EngineError, NewCheck,
    TaskOutcome,
};
use fleetwatch::models::{Platform, Severity};
use fleetwatch::notify::{AlertChannels, Channel};
use fleetwatch::storage::Repository;
use serde_json::json;
use tokio::time::timeout;

use crate::helpers::*;

fn cpu_report(check_id: u64, agent_id: &str, percent: f64) -> CheckReport {
    CheckReport {
        check_id,
        agent_id: agent_id.to_string(),
        payload: json!({ "percent": percent }),
    }
}

fn email_only() -> AlertChannels {
    AlertChannels {
        email: true,
        ..AlertChannels::default()
    }
}

#[tokio::test]
async fn test_alert_opens_after_consecutive_failures_and_resolves_on_pass() {
    let store = seeded_store(vec![online_agent("a1", Platform::Linux)]).await;
    let (notifier, mut notifications) = channel_notifier();
    let handle = CheckEngineHandle::spawn(engine(
        store.clone(),
        notifier,
        NotificationPolicy {
            renotify_after: None,
            notify_on_resolve: true,
        },
    ));
    let check = handle
        .create_check(cpu_check("a1", 3, email_only()))
        .await
        .unwrap();

    // below the failure threshold the check stays pending and nobody is told
    for _ in 0..2 {
        let outcome = handle.ingest(cpu_report(check.id, "a1", 95.0)).await.unwrap();
        assert_eq!(outcome.result.status, CheckStatus::Pending);
        assert_eq!(outcome.action, AlertAction::None);
        assert!(outcome.alert.is_none());
    }
    assert!(store.alerts().await.is_empty());

    let outcome = handle.ingest(cpu_report(check.id, "a1", 96.0)).await.unwrap();
    assert_eq!(outcome.result.status, CheckStatus::Failing);
    assert_eq!(outcome.result.fail_count, 3);
    assert_eq!(outcome.action, AlertAction::Open);
    let alert = outcome.alert.unwrap();
    assert_eq!(alert.severity, Severity::Error);
    assert!(alert.message.starts_with("a1-host - "));

    let sent = timeout(Duration::from_secs(1), notifications.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(sent.channel, Channel::Email);

    // a further failure keeps the alert and does not notify again
    let outcome = handle.ingest(cpu_report(check.id, "a1", 97.0)).await.unwrap();
    assert_eq!(outcome.alert.map(|a| a.id), Some(alert.id));
    assert_eq!(store.alerts().await.len(), 1);

    let outcome = handle.ingest(cpu_report(check.id, "a1", 12.0)).await.unwrap();
    assert_eq!(outcome.result.status, CheckStatus::Passing);
    assert_eq!(outcome.result.fail_count, 0);
    assert_eq!(outcome.action, AlertAction::Resolve);

    let alerts = store.alerts().await;
    assert_eq!(alerts.len(), 1);
    assert!(!alerts[0].is_open());

    // resolution notice on the channel that carried the alert
    let resolved = timeout(Duration::from_secs(1), notifications.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(resolved.channel, Channel::Email);
    assert!(notifications.try_recv().is_err());
}

#[tokio::test]
async fn test_concurrent_opens_share_one_alert() {
    let store = seeded_store(vec![online_agent("a1", Platform::Linux)]).await;
    let (notifier, mut notifications) = channel_notifier();
    let alerts = fleetwatch::alerts::AlertCoordinator::new(
        store.clone(),
        notifier,
        NotificationPolicy::default(),
    );

    let key = AlertKey::Check {
        check_id: 1,
        agent_id: "a1".to_string(),
    };
    let mut tasks = Vec::new();
    for i in 0..16 {
        let alerts = alerts.clone();
        let key = key.clone();
        tasks.push(tokio::spawn(async move {
            alerts
                .open_or_get(AlertRequest {
                    key,
                    severity: Severity::Error,
                    message: format!("attempt {i}"),
                    channels: email_only(),
                })
                .await
        }));
    }

    let mut ids = Vec::new();
    for task in tasks {
        ids.push(task.await.unwrap().unwrap().id);
    }
    ids.dedup();
    assert_eq!(ids.len(), 1);
    assert_eq!(store.alerts().await.len(), 1);

    // the creator's notification is the only one
    timeout(Duration::from_secs(1), notifications.recv())
        .await
        .unwrap()
        .unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(notifications.try_recv().is_err());
}

#[tokio::test]
async fn test_maintenance_mode_suppresses_alerts() {
    let mut agent = online_agent("a1", Platform::Linux);
    agent.maintenance_mode = true;
    let store = seeded_store(vec![agent]).await;
    let (notifier, _notifications) = channel_notifier();
    let handle = CheckEngineHandle::spawn(engine(
        store.clone(),
        notifier,
        NotificationPolicy::default(),
    ));
    let check = handle
        .create_check(cpu_check("a1", 1, email_only()))
        .await
        .unwrap();

    let outcome = handle.ingest(cpu_report(check.id, "a1", 99.0)).await.unwrap();

    assert_eq!(outcome.result.status, CheckStatus::Failing);
    assert_eq!(outcome.action, AlertAction::Open);
    assert!(outcome.alert.is_none());
    assert!(store.alerts().await.is_empty());
}

#[tokio::test]
async fn test_reset_resolves_open_alert() {
    let store = seeded_store(vec![online_agent("a1", Platform::Windows)]).await;
    let (notifier, _notifications) = channel_notifier();
    let handle = CheckEngineHandle::spawn(engine(
        store.clone(),
        notifier,
        NotificationPolicy::default(),
    ));
    let check = handle
        .create_check(NewCheck {
            owner: CheckOwner::Agent("a1".to_string()),
            name: Some("Spooler".to_string()),
            kind: CheckKind::WinService {
                service: "Spooler".to_string(),
                pass_if_start_pending: false,
            },
            failures: 1,
            alert: AlertChannels::default(),
            severity: Severity::Error,
        })
        .await
        .unwrap();

    let outcome = handle
        .ingest(CheckReport {
            check_id: check.id,
            agent_id: "a1".to_string(),
            payload: json!({ "status": "stopped" }),
        })
        .await
        .unwrap();
    assert!(outcome.alert.is_some());

    let result = handle.reset(check.id, "a1").await.unwrap();
    assert_eq!(result.status, CheckStatus::Passing);
    assert_eq!(result.fail_count, 0);

    let key = AlertKey::Check {
        check_id: check.id,
        agent_id: "a1".to_string(),
    };
    assert!(store.open_alert(&key).await.unwrap().is_none());
}

#[tokio::test]
async fn test_malformed_result_changes_nothing() {
    let store = seeded_store(vec![online_agent("a1", Platform::Linux)]).await;
    let (notifier, _notifications) = channel_notifier();
    let handle = CheckEngineHandle::spawn(engine(
        store.clone(),
        notifier,
        NotificationPolicy::default(),
    ));
    let check = handle
        .create_check(cpu_check("a1", 1, AlertChannels::default()))
        .await
        .unwrap();

    assert_matches!(
        handle.ingest(cpu_report(check.id, "a1", 150.0)).await,
        Err(EngineError::Malformed(_))
    );
    assert_matches!(
        handle
            .ingest(CheckReport {
                check_id: check.id,
                agent_id: "a1".to_string(),
                payload: json!({ "reachable": true }),
            })
            .await,
        Err(EngineError::Malformed(_))
    );

    assert!(store.check_result(check.id, "a1").await.unwrap().is_none());
    assert!(handle.history(check.id, "a1", 1).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_policy_checks_only_apply_to_members() {
    let mut member = online_agent("a1", Platform::Linux);
    member.policies = vec![7];
    let outsider = online_agent("a2", Platform::Linux);
    let store = seeded_store(vec![member, outsider]).await;
    let (notifier, _notifications) = channel_notifier();
    let handle = CheckEngineHandle::spawn(engine(
        store.clone(),
        notifier,
        NotificationPolicy::default(),
    ));

    let mut definition = cpu_check("a1", 2, AlertChannels::default());
    definition.owner = CheckOwner::Policy(7);
    let check = handle.create_check(definition).await.unwrap();

    let outcome = handle.ingest(cpu_report(check.id, "a1", 20.0)).await.unwrap();
    assert_eq!(outcome.result.status, CheckStatus::Passing);

    assert_matches!(
        handle.ingest(cpu_report(check.id, "a2", 20.0)).await,
        Err(EngineError::InvalidInput(_))
    );
    assert!(store.check_result(check.id, "a2").await.unwrap().is_none());
}

#[tokio::test]
async fn test_deleting_a_check_resolves_its_open_alert() {
    let store = seeded_store(vec![online_agent("a1", Platform::Linux)]).await;
    let (notifier, _notifications) = channel_notifier();
    let handle = CheckEngineHandle::spawn(engine(
        store.clone(),
        notifier,
        NotificationPolicy::default(),
    ));
    let check = handle
        .create_check(cpu_check("a1", 1, email_only()))
        .await
        .unwrap();

    let outcome = handle.ingest(cpu_report(check.id, "a1", 99.0)).await.unwrap();
    assert_eq!(outcome.action, AlertAction::Open);
    let key = AlertKey::Check {
        check_id: check.id,
        agent_id: "a1".to_string(),
    };
    assert!(store.open_alert(&key).await.unwrap().is_some());

    handle.delete_check(check.id).await.unwrap();

    assert!(store.open_alert(&key).await.unwrap().is_none());
    assert!(store.alerts().await.iter().all(|alert| !alert.is_open()));
    assert_matches!(
        handle.reset(check.id, "a1").await,
        Err(EngineError::NotFound(_))
    );
}

fn backup_task(passed: bool) -> TaskOutcome {
    TaskOutcome {
        task_id: 12,
        agent_id: "a1".to_string(),
        task_name: "Nightly Backup".to_string(),
        passed,
        severity: Severity::Error,
        detail: if passed { String::new() } else { "exit code 2".to_string() },
        alert: email_only(),
    }
}

#[tokio::test]
async fn test_task_failure_opens_alert_and_pass_resolves_it() {
    let store = seeded_store(vec![online_agent("a1", Platform::Windows)]).await;
    let (notifier, mut notifications) = channel_notifier();
    let handle = CheckEngineHandle::spawn(engine(
        store.clone(),
        notifier,
        NotificationPolicy::default(),
    ));

    let alert = handle.ingest_task(backup_task(false)).await.unwrap().unwrap();
    assert_eq!(alert.message, "a1-host - Task Nightly Backup failed: exit code 2");
    assert_eq!(alert.severity, Severity::Error);
    assert_eq!(alert.key.agent_id(), "a1");

    let sent = timeout(Duration::from_secs(1), notifications.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(sent.channel, Channel::Email);

    // a repeated failure keeps the same alert
    let again = handle.ingest_task(backup_task(false)).await.unwrap().unwrap();
    assert_eq!(again.id, alert.id);

    assert!(handle.ingest_task(backup_task(true)).await.unwrap().is_none());
    let alerts = store.alerts().await;
    assert_eq!(alerts.len(), 1);
    assert!(!alerts[0].is_open());
}
