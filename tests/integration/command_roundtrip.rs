//! Dispatcher commands answered by in-process agents

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use assert_matches::assert_matches;
use fleetwatch::CommandError;
use fleetwatch::alerts::{AlertKey, NewAlert};
use fleetwatch::checks::kind::EventLogName;
use fleetwatch::dispatcher::{
    REBOOT_TASK_PREFIX, RawCommandRequest, RecoveryMode, RunScriptRequest, ScriptOutput,
    parse_reboot_time,
};
use fleetwatch::models::{
    AgentHistoryKind, AgentStatus, CommandShell, CustomField, FieldTarget, PendingActionKind,
    PendingActionReport, PendingStatus, Platform, Script, ScriptShell, Severity,
};
use fleetwatch::storage::{Repository, StoreError};
use serde_json::json;
use tokio::time::Instant;
use tokio_test::assert_ok;

use crate::helpers::*;

fn hello_script() -> Script {
    Script {
        id: 4,
        name: "Collect Serial".to_string(),
        shell: ScriptShell::Shell,
        body: "echo hello".to_string(),
    }
}

fn script_request(output: ScriptOutput) -> RunScriptRequest {
    RunScriptRequest {
        script_id: 4,
        args: vec![],
        timeout_secs: 30,
        output,
        username: "tech".to_string(),
    }
}

#[tokio::test]
async fn test_ping_online_agent() {
    let fixture = command_fixture(vec![online_agent("a1", Platform::Linux)]).await;
    fixture
        .transport
        .connect_agent("a1")
        .serve(|cmd| (cmd.func == "ping").then(|| json!("pong")));

    let status = fixture.dispatcher.ping("a1").await.unwrap();
    assert_eq!(status.hostname, "a1-host");
    assert_eq!(status.status, AgentStatus::Online);
}

/// Count pings and answer `pong` from the given attempt on
fn ping_counter(fixture: &CommandFixture, answer_from: Option<usize>) -> Arc<AtomicUsize> {
    let pings = Arc::new(AtomicUsize::new(0));
    let counter = pings.clone();
    fixture.transport.connect_agent("a1").serve(move |cmd| {
        if cmd.func != "ping" {
            return None;
        }
        let attempt = counter.fetch_add(1, Ordering::SeqCst) + 1;
        answer_from
            .is_some_and(|first| attempt >= first)
            .then(|| json!("pong"))
    });
    pings
}

#[tokio::test(start_paused = true)]
async fn test_ping_silent_agent_is_offline_after_three_attempts() {
    let fixture = command_fixture(vec![online_agent("a1", Platform::Linux)]).await;
    let pings = ping_counter(&fixture, None);

    let started = Instant::now();
    let status = fixture.dispatcher.ping("a1").await.unwrap();
    let elapsed = started.elapsed();

    assert_eq!(status.status, AgentStatus::Offline);
    assert_eq!(pings.load(Ordering::SeqCst), 3);

    // three 2s budgets plus grace, with a 0.5s pause between attempts
    let expected = 3 * (Duration::from_secs(2) + GRACE) + 2 * Duration::from_millis(500);
    assert!(elapsed >= expected, "finished after {elapsed:?}");
    assert!(elapsed < expected + Duration::from_millis(50), "finished after {elapsed:?}");
}

#[tokio::test(start_paused = true)]
async fn test_ping_answered_on_second_attempt() {
    let fixture = command_fixture(vec![online_agent("a1", Platform::Linux)]).await;
    let pings = ping_counter(&fixture, Some(2));

    let started = Instant::now();
    let status = fixture.dispatcher.ping("a1").await.unwrap();

    assert_eq!(status.status, AgentStatus::Online);
    assert_eq!(pings.load(Ordering::SeqCst), 2);
    assert!(started.elapsed() >= Duration::from_secs(2) + GRACE + Duration::from_millis(500));
}

#[tokio::test]
async fn test_ping_unknown_agent() {
    let fixture = command_fixture(vec![]).await;

    assert_matches!(
        fixture.dispatcher.ping("ghost").await,
        Err(CommandError::NotFound(_))
    );
}

#[tokio::test]
async fn test_kill_process_returns_agent_message_verbatim() {
    let fixture = command_fixture(vec![online_agent("a1", Platform::Windows)]).await;
    fixture
        .transport
        .connect_agent("a1")
        .serve(|_| Some(json!("Access is denied.")));

    assert_matches!(
        fixture.dispatcher.kill_process("a1", 4242).await,
        Err(CommandError::ApplicationError(message)) if message == "Access is denied."
    );
}

#[tokio::test]
async fn test_kill_process_success() {
    let fixture = command_fixture(vec![online_agent("a1", Platform::Windows)]).await;
    fixture.transport.connect_agent("a1").serve(|cmd| {
        let pid = cmd.payload.as_ref()?.get("procpid")?.as_u64()?;
        Some(if pid == 4242 { json!("ok") } else { json!("no such process") })
    });

    let message = assert_ok!(fixture.dispatcher.kill_process("a1", 4242).await);
    assert_eq!(message, "Process with PID: 4242 was ended successfully");
}

#[tokio::test]
async fn test_run_checks_busy() {
    let fixture = command_fixture(vec![online_agent("a1", Platform::Linux)]).await;
    fixture
        .transport
        .connect_agent("a1")
        .serve(|_| Some(json!("busy")));

    assert_matches!(
        fixture.dispatcher.run_checks_now("a1").await,
        Err(CommandError::Busy(message)) if message == "Checks are already running on a1-host"
    );
}

#[tokio::test]
async fn test_transport_down_is_unreachable() {
    let fixture = command_fixture(vec![online_agent("a1", Platform::Windows)]).await;
    fixture.transport.set_down(true);

    assert_matches!(
        fixture.dispatcher.reboot_now("a1").await,
        Err(CommandError::Unreachable)
    );
    assert_matches!(
        fixture.dispatcher.recover("a1", RecoveryMode::Agent).await,
        Err(CommandError::Unreachable)
    );
}

#[tokio::test]
async fn test_collector_with_invalid_model_sends_nothing() {
    let fixture = command_fixture(vec![online_agent("a1", Platform::Linux)]).await;
    fixture.store.insert_script(hello_script()).await;
    fixture
        .store
        .insert_custom_field(CustomField {
            id: 2,
            name: "Owner".to_string(),
            model: "user".to_string(),
        })
        .await;
    let mut agent = fixture.transport.connect_agent("a1");

    let result = fixture
        .dispatcher
        .run_script(
            "a1",
            script_request(ScriptOutput::Collector {
                custom_field_id: 2,
                save_all_output: false,
            }),
        )
        .await;

    assert_matches!(
        result,
        Err(CommandError::InvalidInput(message)) if message == "Custom Field was invalid"
    );
    assert!(fixture.store.agent_history("a1").await.unwrap().is_empty());
    assert!(
        tokio::time::timeout(std::time::Duration::from_millis(50), agent.recv())
            .await
            .is_err()
    );
}

#[tokio::test]
async fn test_collector_saves_last_line() {
    let fixture = command_fixture(vec![online_agent("a1", Platform::Linux)]).await;
    fixture.store.insert_script(hello_script()).await;
    fixture
        .store
        .insert_custom_field(CustomField {
            id: 2,
            name: "Serial".to_string(),
            model: "agent".to_string(),
        })
        .await;
    fixture
        .transport
        .connect_agent("a1")
        .serve(|cmd| (cmd.func == "runscript").then(|| json!("reading bios\nSN-1234\n")));

    let output = fixture
        .dispatcher
        .run_script(
            "a1",
            script_request(ScriptOutput::Collector {
                custom_field_id: 2,
                save_all_output: false,
            }),
        )
        .await
        .unwrap();
    assert_eq!(output, "reading bios\nSN-1234\n");

    let saved = fixture
        .store
        .custom_field_value(2, &FieldTarget::Agent("a1".to_string()))
        .await
        .unwrap();
    assert_eq!(saved.as_deref(), Some("SN-1234"));

    let history = fixture.store.agent_history("a1").await.unwrap();
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].kind, AgentHistoryKind::ScriptRun);
    assert_eq!(history[0].script_id, Some(4));
}

#[tokio::test]
async fn test_note_output() {
    let fixture = command_fixture(vec![online_agent("a1", Platform::Linux)]).await;
    fixture.store.insert_script(hello_script()).await;
    fixture
        .transport
        .connect_agent("a1")
        .serve(|_| Some(json!("hello")));

    fixture
        .dispatcher
        .run_script("a1", script_request(ScriptOutput::Note))
        .await
        .unwrap();

    let notes = fixture.store.notes("a1").await.unwrap();
    assert_eq!(notes.len(), 1);
    assert_eq!(notes[0].note, "hello");
    assert_eq!(notes[0].username, "tech");
}

#[tokio::test]
async fn test_email_output_is_queued() {
    let fixture = command_fixture(vec![online_agent("a1", Platform::Linux)]).await;
    fixture.store.insert_script(hello_script()).await;

    let message = fixture
        .dispatcher
        .run_script(
            "a1",
            script_request(ScriptOutput::Email {
                recipients: vec!["ops@example.com".to_string()],
            }),
        )
        .await
        .unwrap();
    assert!(message.starts_with("Collect Serial will now be run on a1-host"));

    let units = fixture.queue.units.lock().await;
    assert_eq!(units.len(), 1);
    assert_eq!(units[0].agent_id, "a1");
}

#[tokio::test]
async fn test_email_script_output_notifies() {
    let mut fixture = command_fixture(vec![online_agent("a1", Platform::Linux)]).await;
    fixture.store.insert_script(hello_script()).await;
    fixture
        .transport
        .connect_agent("a1")
        .serve(|_| Some(json!("serial: SN-1234")));

    fixture
        .dispatcher
        .email_script_output("a1", 4, &[], 30, vec!["ops@example.com".to_string()])
        .await
        .unwrap();

    let sent = fixture.notifications.recv().await.unwrap();
    assert_eq!(sent.subject, "a1-host Collect Serial Results");
    assert_eq!(sent.body, "serial: SN-1234");
    assert_eq!(sent.recipients, vec!["ops@example.com".to_string()]);
}

#[tokio::test]
async fn test_raw_shell_resolves_default_shell_and_records_history() {
    let fixture = command_fixture(vec![online_agent("a1", Platform::Linux)]).await;
    fixture.transport.connect_agent("a1").serve(|cmd| {
        let payload = cmd.payload.as_ref()?;
        Some(payload["shell"].clone())
    });

    let output = fixture
        .dispatcher
        .raw_shell(
            "a1",
            RawCommandRequest {
                command: "uptime".to_string(),
                shell: CommandShell::Custom(String::new()),
                timeout_secs: 10,
                username: "x".repeat(80),
            },
        )
        .await
        .unwrap();
    assert_eq!(output, "/bin/bash");

    let history = fixture.store.agent_history("a1").await.unwrap();
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].kind, AgentHistoryKind::CmdRun);
    assert_eq!(history[0].command.as_deref(), Some("uptime"));
    assert_eq!(history[0].username.len(), 50);
}

#[tokio::test]
async fn test_schedule_reboot_not_supported_on_posix() {
    let fixture = command_fixture(vec![online_agent("a1", Platform::Linux)]).await;
    let when = parse_reboot_time("2030-01-01T03:00:00").unwrap();

    assert_matches!(
        fixture.dispatcher.schedule_reboot("a1", when).await,
        Err(CommandError::CapabilityUnsupported(message)) if message == "Not currently implemented for linux"
    );
    assert!(fixture.store.pending_actions("a1").await.unwrap().is_empty());
}

#[tokio::test]
async fn test_schedule_reboot_records_pending_action() {
    let fixture = command_fixture(vec![online_agent("w1", Platform::Windows)]).await;
    fixture
        .transport
        .connect_agent("w1")
        .serve(|cmd| (cmd.func == "schedtask").then(|| json!("ok")));
    let when = parse_reboot_time("2030-01-01T03:00:00").unwrap();

    let scheduled = fixture.dispatcher.schedule_reboot("w1", when).await.unwrap();
    assert!(scheduled.task_name.starts_with(REBOOT_TASK_PREFIX));
    assert_eq!(scheduled.hostname, "w1-host");

    let pending = fixture.store.pending_actions("w1").await.unwrap();
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].kind, PendingActionKind::ScheduledReboot);
    assert_eq!(pending[0].details["taskname"], scheduled.task_name.as_str());
    assert_eq!(pending[0].status, PendingStatus::Pending);
}

async fn scheduled_reboot_fixture() -> (CommandFixture, u64) {
    let fixture = command_fixture(vec![online_agent("w1", Platform::Windows)]).await;
    fixture
        .transport
        .connect_agent("w1")
        .serve(|cmd| (cmd.func == "schedtask").then(|| json!("ok")));
    let when = parse_reboot_time("2030-01-01T03:00:00").unwrap();
    fixture.dispatcher.schedule_reboot("w1", when).await.unwrap();

    let action_id = fixture.store.pending_actions("w1").await.unwrap()[0].id;
    (fixture, action_id)
}

#[tokio::test]
async fn test_reboot_report_completes_pending_action() {
    let (fixture, action_id) = scheduled_reboot_fixture().await;

    let action = fixture
        .dispatcher
        .complete_pending_action(PendingActionReport {
            action_id,
            agent_id: "w1".to_string(),
            succeeded: true,
            details: None,
        })
        .await
        .unwrap();
    assert_eq!(action.status, PendingStatus::Completed);

    let stored = fixture.store.pending_actions("w1").await.unwrap();
    assert_eq!(stored[0].status, PendingStatus::Completed);
    assert!(stored[0].details["taskname"].is_string());

    // a late duplicate report does not reopen or flip the action
    assert_matches!(
        fixture
            .dispatcher
            .complete_pending_action(PendingActionReport {
                action_id,
                agent_id: "w1".to_string(),
                succeeded: false,
                details: None,
            })
            .await,
        Err(CommandError::Storage(StoreError::Conflict(_)))
    );
}

#[tokio::test]
async fn test_failed_reboot_report_marks_action_failed() {
    let (fixture, action_id) = scheduled_reboot_fixture().await;

    let action = fixture
        .dispatcher
        .complete_pending_action(PendingActionReport {
            action_id,
            agent_id: "w1".to_string(),
            succeeded: false,
            details: Some(json!({ "error": "The system cannot find the file specified." })),
        })
        .await
        .unwrap();

    assert_eq!(action.status, PendingStatus::Failed);
    assert_eq!(
        action.details["error"],
        "The system cannot find the file specified."
    );
    assert!(action.details["taskname"].is_string());
}

#[tokio::test]
async fn test_pending_report_from_another_agent_is_rejected() {
    let (fixture, action_id) = scheduled_reboot_fixture().await;

    assert_matches!(
        fixture
            .dispatcher
            .complete_pending_action(PendingActionReport {
                action_id,
                agent_id: "a9".to_string(),
                succeeded: true,
                details: None,
            })
            .await,
        Err(CommandError::NotFound(_))
    );
    let stored = fixture.store.pending_actions("w1").await.unwrap();
    assert_eq!(stored[0].status, PendingStatus::Pending);
}

#[tokio::test]
async fn test_list_processes() {
    let fixture = command_fixture(vec![online_agent("a1", Platform::Linux)]).await;
    fixture.transport.connect_agent("a1").serve(|_| {
        Some(json!([
            { "pid": 1, "name": "init", "username": "root", "cpu_percent": 0.1, "memory_bytes": 4096 },
            { "pid": 77, "name": "sshd" }
        ]))
    });

    let processes = assert_ok!(fixture.dispatcher.list_processes("a1").await);
    assert_eq!(processes.len(), 2);
    assert_eq!(processes[1].name, "sshd");
    assert_eq!(processes[1].memory_bytes, 0);
}

#[tokio::test]
async fn test_mesh_recovery_failure_message() {
    let fixture = command_fixture(vec![online_agent("a1", Platform::Windows)]).await;
    fixture
        .transport
        .connect_agent("a1")
        .serve(|_| Some(json!("service not found")));

    assert_matches!(
        fixture.dispatcher.recover("a1", RecoveryMode::Mesh).await,
        Err(CommandError::ApplicationError(message))
            if message == "Unable to complete recovery: service not found"
    );
}

#[tokio::test]
async fn test_uninstall_removes_agent() {
    let fixture = command_fixture(vec![online_agent("a1", Platform::Windows)]).await;
    let mut agent = fixture.transport.connect_agent("a1");

    let message = fixture.dispatcher.uninstall("a1").await.unwrap();
    assert_eq!(message, "a1-host will now be uninstalled.");

    let envelope = agent.recv().await.unwrap();
    assert_eq!(envelope.command().unwrap().func, "uninstall");
    assert!(envelope.reply_token.is_none());
    assert_matches!(
        fixture.store.get_agent("a1").await,
        Err(StoreError::NotFound(_))
    );
}

#[tokio::test]
async fn test_uninstall_resolves_open_alerts() {
    let fixture = command_fixture(vec![
        online_agent("a1", Platform::Windows),
        online_agent("a2", Platform::Windows),
    ])
    .await;
    let keys = [
        AlertKey::Check {
            check_id: 5,
            agent_id: "a1".to_string(),
        },
        AlertKey::Task {
            task_id: 8,
            agent_id: "a1".to_string(),
        },
        AlertKey::Check {
            check_id: 5,
            agent_id: "a2".to_string(),
        },
    ];
    for key in &keys {
        fixture
            .store
            .insert_alert_if_absent(NewAlert {
                key: key.clone(),
                severity: Severity::Warning,
                message: "failing".to_string(),
            })
            .await
            .unwrap();
    }

    fixture.dispatcher.uninstall("a1").await.unwrap();

    assert!(fixture.store.open_alert(&keys[0]).await.unwrap().is_none());
    assert!(fixture.store.open_alert(&keys[1]).await.unwrap().is_none());
    assert!(fixture.store.open_alert(&keys[2]).await.unwrap().is_some());
}

#[tokio::test]
async fn test_sysinfo_refresh_acknowledged() {
    let fixture = command_fixture(vec![online_agent("a1", Platform::Linux)]).await;
    fixture
        .transport
        .connect_agent("a1")
        .serve(|cmd| (cmd.func == "sysinfo").then(|| json!("ok")));

    assert_ok!(fixture.dispatcher.request_sysinfo_refresh("a1").await);
}

#[tokio::test]
async fn test_security_event_log_gets_longer_timeout() {
    let fixture = command_fixture(vec![online_agent("w1", Platform::Windows)]).await;
    fixture.transport.connect_agent("w1").serve(|cmd| {
        Some(json!({
            "timeout": cmd.timeout,
            "logname": cmd.payload.as_ref()?["logname"].clone(),
            "days": cmd.payload.as_ref()?["days"].clone(),
        }))
    });

    let echoed = fixture
        .dispatcher
        .fetch_event_log("w1", EventLogName::Security, 3)
        .await
        .unwrap();
    assert_eq!(echoed, json!({ "timeout": 180, "logname": "Security", "days": "3" }));

    let echoed = fixture
        .dispatcher
        .fetch_event_log("w1", EventLogName::System, 1)
        .await
        .unwrap();
    assert_eq!(echoed["timeout"], 30);
}

#[tokio::test]
async fn test_patch_commands() {
    let fixture = command_fixture(vec![
        online_agent("a1", Platform::Linux),
        online_agent("w1", Platform::Windows),
    ])
    .await;
    let mut windows = fixture.transport.connect_agent("w1");

    assert_matches!(
        fixture.dispatcher.patch_scan("a1").await,
        Err(CommandError::CapabilityUnsupported(_))
    );

    fixture.dispatcher.install_patches("w1").await.unwrap();
    let envelope = windows.recv().await.unwrap();
    assert_eq!(envelope.command().unwrap().func, "installwinupdates");
}
