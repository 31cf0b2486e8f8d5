//! Bulk actions executed by the worker pool through the dispatcher

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use assert_matches::assert_matches;
use fleetwatch::CommandError;
use fleetwatch::actors::CheckEngineHandle;
use fleetwatch::alerts::NotificationPolicy;
use fleetwatch::bulk::{
    BulkOrchestrator, BulkRequest, BulkTarget, MaintenanceScope, MonitoringFilter, PlatformFilter,
};
use fleetwatch::checks::CheckReport;
use fleetwatch::dispatcher::CommandDispatcher;
use fleetwatch::link::{AgentLink, MemoryTransport};
use fleetwatch::models::{CommandShell, Platform};
use fleetwatch::notify::AlertChannels;
use fleetwatch::queue::{WorkAction, WorkerPool};
use fleetwatch::storage::Repository;
use serde_json::json;
use tokio::time::{sleep, timeout};

use crate::helpers::*;

/// Attach an agent that answers every command and counts them
fn counting_agent(transport: &MemoryTransport, agent_id: &str) -> Arc<AtomicUsize> {
    let seen = Arc::new(AtomicUsize::new(0));
    let counter = seen.clone();
    transport.connect_agent(agent_id).serve(move |_| {
        counter.fetch_add(1, Ordering::SeqCst);
        Some(json!("done"))
    });
    seen
}

async fn wait_for_command(seen: &AtomicUsize) {
    timeout(Duration::from_secs(2), async {
        while seen.load(Ordering::SeqCst) == 0 {
            sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap();
}

#[tokio::test]
async fn test_bulk_command_runs_on_online_agents() {
    let store = seeded_store(vec![
        online_agent("a1", Platform::Linux),
        online_agent("a2", Platform::Linux),
        offline_agent("a3", Platform::Linux),
        online_agent("w1", Platform::Windows),
    ])
    .await;
    let transport = Arc::new(MemoryTransport::new());
    let link = AgentLink::connect(transport.clone(), GRACE).await.unwrap();
    let (notifier, _notifications) = channel_notifier();

    let (pool, receiver) = WorkerPool::new();
    let dispatcher = CommandDispatcher::new(link, store.clone(), Arc::new(pool.clone()), notifier);
    tokio::spawn(receiver.run(Arc::new(dispatcher), 2));
    let orchestrator = BulkOrchestrator::new(store.clone(), Arc::new(pool));

    let a1 = counting_agent(&transport, "a1");
    let a2 = counting_agent(&transport, "a2");
    let a3 = counting_agent(&transport, "a3");
    let w1 = counting_agent(&transport, "w1");

    let summary = orchestrator
        .execute(BulkRequest {
            target: BulkTarget::Client { client_id: 1 },
            monitoring_type: MonitoringFilter::All,
            platform: PlatformFilter::Linux,
            action: WorkAction::Command {
                command: "uptime".to_string(),
                shell: CommandShell::Shell,
                timeout_secs: 5,
                run_on_offline: false,
            },
            username: "tech".to_string(),
        })
        .await
        .unwrap();
    assert_eq!(summary.count, 3);

    wait_for_command(&a1).await;
    wait_for_command(&a2).await;

    assert_eq!(a1.load(Ordering::SeqCst), 1);
    assert_eq!(a2.load(Ordering::SeqCst), 1);
    assert_eq!(a3.load(Ordering::SeqCst), 0);
    assert_eq!(w1.load(Ordering::SeqCst), 0);
    assert!(store.agent_history("a3").await.unwrap().is_empty());
}

#[tokio::test]
async fn test_bulk_without_matching_agents() {
    let store = seeded_store(vec![online_agent("w1", Platform::Windows)]).await;
    let queue = Arc::new(RecordingQueue::default());
    let orchestrator = BulkOrchestrator::new(store, queue.clone());

    let result = orchestrator
        .execute(BulkRequest {
            target: BulkTarget::All,
            monitoring_type: MonitoringFilter::Workstations,
            platform: PlatformFilter::All,
            action: WorkAction::Script {
                script_id: 1,
                args: vec![],
                timeout_secs: 30,
            },
            username: "tech".to_string(),
        })
        .await;

    assert_matches!(result, Err(CommandError::InvalidInput(_)));
    assert!(queue.units.lock().await.is_empty());
}

#[tokio::test]
async fn test_maintenance_mode_silences_checks() {
    let store = seeded_store(vec![
        online_agent("a1", Platform::Linux),
        online_agent("a2", Platform::Linux),
    ])
    .await;
    let orchestrator = BulkOrchestrator::new(store.clone(), Arc::new(RecordingQueue::default()));

    let summary = orchestrator
        .set_maintenance_mode(MaintenanceScope::Site(10), true)
        .await
        .unwrap();
    assert_eq!(summary.count, 2);
    assert_eq!(summary.message, "Maintenance mode has been enabled on 2 agents");

    let (notifier, _notifications) = channel_notifier();
    let handle = CheckEngineHandle::spawn(engine(
        store.clone(),
        notifier,
        NotificationPolicy::default(),
    ));
    let check = handle
        .create_check(cpu_check("a1", 1, AlertChannels::all()))
        .await
        .unwrap();

    let outcome = handle
        .ingest(CheckReport {
            check_id: check.id,
            agent_id: "a1".to_string(),
            payload: json!({ "percent": 99.5 }),
        })
        .await
        .unwrap();
    assert!(outcome.alert.is_none());
    assert!(store.alerts().await.is_empty());
}
