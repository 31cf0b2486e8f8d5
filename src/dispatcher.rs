//! Typed commands issued to agents
//!
//! Every operation resolves the agent, builds the command, sends it through the
//! [`AgentLink`] with its own time budget and turns the reply into a typed result.
//! Reply interpretation is shared:
//!
//! - timeout or transport down is always [`CommandError::Unreachable`]
//! - acknowledged commands expect `"ok"`; anything else is returned verbatim as
//!   [`CommandError::ApplicationError`]

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{Datelike, NaiveDateTime, Timelike, Utc};
use rand::Rng;
use rand::distributions::Alphanumeric;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tokio::time::sleep;
use tracing::{debug, info, instrument, warn};

use crate::checks::kind::EventLogName;
use crate::error::CommandError;
use crate::link::{AgentLink, CommandPayload, Reply};
use crate::models::{
    Agent, AgentHistoryKind, AgentStatus, CommandShell, CustomField, FieldTarget,
    NewAgentHistory, NewNote, NewPendingAction, PendingAction, PendingActionKind,
    PendingActionReport, PendingStatus, Script, Severity, truncate_username,
};
use crate::notify::{Channel, Notification, Notifier};
use crate::queue::{PatchMode, TaskQueue, WorkAction, WorkExecutor, WorkUnit};
use crate::storage::Repository;

pub const PING_ATTEMPTS: u32 = 3;
const PING_TIMEOUT: Duration = Duration::from_secs(2);
const PING_RETRY_DELAY: Duration = Duration::from_millis(500);

const PROCESS_LIST_TIMEOUT: Duration = Duration::from_secs(5);
const KILL_PROCESS_TIMEOUT: Duration = Duration::from_secs(15);
const REBOOT_TIMEOUT: Duration = Duration::from_secs(10);
const SYSINFO_TIMEOUT: Duration = Duration::from_secs(20);
const REMOTE_ACCESS_REPAIR_TIMEOUT: Duration = Duration::from_secs(90);
const RUN_CHECKS_TIMEOUT: Duration = Duration::from_secs(15);

const EVENT_LOG_TIMEOUT_SECS: u64 = 30;
const SECURITY_LOG_TIMEOUT_SECS: u64 = 180;

/// Extra seconds the link waits beyond the agent-side timeout
const EVENT_LOG_MARGIN_SECS: u64 = 2;
const RAW_COMMAND_MARGIN_SECS: u64 = 2;
const SCRIPT_MARGIN_SECS: u64 = 3;

pub const REBOOT_TASK_PREFIX: &str = "FleetWatch_SchedReboot_";
const REBOOT_TASK_SUFFIX_LEN: usize = 10;
const REBOOT_EXPIRY_MINUTES: i64 = 5;
const REBOOT_TIME_FORMAT: &str = "%Y-%m-%dT%H:%M:%S";

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PingStatus {
    pub hostname: String,
    pub status: AgentStatus,
}

/// What happens with the output of a script run
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "output", rename_all = "snake_case")]
pub enum ScriptOutput {
    /// Start the script and return right away
    Forget,
    /// Wait for and return the output
    Wait,
    /// Run in the background and email the output
    Email {
        #[serde(default)]
        recipients: Vec<String>,
    },
    /// Save the output to a custom field
    Collector {
        custom_field_id: u64,
        #[serde(default)]
        save_all_output: bool,
    },
    /// Store the output as an agent note
    Note,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunScriptRequest {
    pub script_id: u64,
    #[serde(default)]
    pub args: Vec<String>,
    pub timeout_secs: u64,
    #[serde(flatten)]
    pub output: ScriptOutput,
    pub username: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RawCommandRequest {
    pub command: String,
    pub shell: CommandShell,
    pub timeout_secs: u64,
    pub username: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ScheduledReboot {
    /// Human readable start time
    pub time: String,
    pub hostname: String,
    pub task_name: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessInfo {
    pub pid: u32,
    pub name: String,
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub cpu_percent: f64,
    #[serde(default)]
    pub memory_bytes: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RecoveryMode {
    /// Restart the agent service; runs in the background
    Agent,
    /// Repair the remote access session
    Mesh,
}

/// Parse the start time of a scheduled reboot
pub fn parse_reboot_time(input: &str) -> Result<NaiveDateTime, CommandError> {
    NaiveDateTime::parse_from_str(input, REBOOT_TIME_FORMAT)
        .map_err(|_| CommandError::InvalidInput("Invalid date".to_string()))
}

fn reboot_task_name<R: Rng>(rng: &mut R) -> String {
    let suffix: String = rng
        .sample_iter(&Alphanumeric)
        .filter(u8::is_ascii_alphabetic)
        .take(REBOOT_TASK_SUFFIX_LEN)
        .map(char::from)
        .collect();
    format!("{REBOOT_TASK_PREFIX}{suffix}")
}

fn reboot_task_payload(task_name: &str, start: NaiveDateTime) -> Value {
    let expire = start + chrono::Duration::minutes(REBOOT_EXPIRY_MINUTES);
    json!({
        "type": "schedreboot",
        "enabled": true,
        "delete_expired_task_after": true,
        "start_when_available": false,
        "multiple_instances": 2,
        "trigger": "runonce",
        "name": task_name,
        "start_year": start.year(),
        "start_month": start.month(),
        "start_day": start.day(),
        "start_hour": start.hour(),
        "start_min": start.minute(),
        "expire_year": expire.year(),
        "expire_month": expire.month(),
        "expire_day": expire.day(),
        "expire_hour": expire.hour(),
        "expire_min": expire.minute(),
    })
}

/// Where a collector script writes its value for this agent
fn collector_target(field: &CustomField, agent: &Agent) -> Result<FieldTarget, CommandError> {
    match field.model.as_str() {
        "agent" => Ok(FieldTarget::Agent(agent.agent_id.clone())),
        "client" => Ok(FieldTarget::Client(agent.client_id)),
        "site" => Ok(FieldTarget::Site(agent.site_id)),
        _ => Err(CommandError::InvalidInput(
            "Custom Field was invalid".to_string(),
        )),
    }
}

/// Trimmed output, or only its last line unless everything is kept
fn collector_value(output: &str, save_all_output: bool) -> String {
    let trimmed = output.trim();
    if save_all_output {
        return trimmed.to_string();
    }
    trimmed
        .rsplit('\n')
        .next()
        .unwrap_or_default()
        .trim()
        .to_string()
}

/// `"ok"` or the agent's own message
fn acknowledge(reply: Reply) -> Result<(), CommandError> {
    match reply {
        Reply::Payload(Value::String(answer)) if answer == "ok" => Ok(()),
        Reply::Payload(Value::String(answer)) => Err(CommandError::ApplicationError(answer)),
        Reply::Payload(other) => Err(CommandError::ApplicationError(other.to_string())),
        Reply::Timeout | Reply::TransportDown => Err(CommandError::Unreachable),
        Reply::Error(message) => Err(CommandError::ApplicationError(message)),
    }
}

/// Whatever the agent answered, as JSON
fn payload(reply: Reply) -> Result<Value, CommandError> {
    match reply {
        Reply::Payload(value) => Ok(value),
        Reply::Timeout | Reply::TransportDown => Err(CommandError::Unreachable),
        Reply::Error(message) => Err(CommandError::ApplicationError(message)),
    }
}

/// Whatever the agent answered, as text
fn text(reply: Reply) -> Result<String, CommandError> {
    match payload(reply)? {
        Value::String(output) => Ok(output),
        other => Ok(other.to_string()),
    }
}

fn script_command(script: &Script, args: &[String], timeout_secs: u64) -> CommandPayload {
    CommandPayload::new("runscript")
        .with_timeout(timeout_secs)
        .with_payload(json!({
            "script_id": script.id,
            "code": script.body,
            "shell": script.shell,
            "args": args,
        }))
}

#[derive(Clone)]
pub struct CommandDispatcher {
    link: AgentLink,
    store: Arc<dyn Repository>,
    queue: Arc<dyn TaskQueue>,
    notifier: Arc<dyn Notifier>,
}

impl CommandDispatcher {
    pub fn new(
        link: AgentLink,
        store: Arc<dyn Repository>,
        queue: Arc<dyn TaskQueue>,
        notifier: Arc<dyn Notifier>,
    ) -> Self {
        Self {
            link,
            store,
            queue,
            notifier,
        }
    }

    /// Probe the agent up to three times
    #[instrument(skip(self))]
    pub async fn ping(&self, agent_id: &str) -> Result<PingStatus, CommandError> {
        let agent = self.store.get_agent(agent_id).await?;
        let command = CommandPayload::new("ping");

        let mut status = AgentStatus::Offline;
        for attempt in 0..PING_ATTEMPTS {
            if attempt > 0 {
                sleep(PING_RETRY_DELAY).await;
            }

            let reply = self.link.send(&agent.agent_id, &command, PING_TIMEOUT).await;
            if reply.as_str() == Some("pong") {
                status = AgentStatus::Online;
                break;
            }
            debug!(attempt, "no pong");
        }

        Ok(PingStatus {
            hostname: agent.hostname,
            status,
        })
    }

    /// Run a stored script on the agent
    ///
    /// Returns the output for the waiting modes and a confirmation otherwise.
    #[instrument(skip(self, request), fields(script_id = request.script_id))]
    pub async fn run_script(
        &self,
        agent_id: &str,
        request: RunScriptRequest,
    ) -> Result<String, CommandError> {
        let agent = self.store.get_agent(agent_id).await?;
        let script = self.store.get_script(request.script_id).await?;

        // nothing is sent when the output would have nowhere to go
        let collector = match &request.output {
            ScriptOutput::Collector {
                custom_field_id, ..
            } => {
                let field = self.store.get_custom_field(*custom_field_id).await?;
                Some(collector_target(&field, &agent)?)
            }
            _ => None,
        };

        let username = truncate_username(&request.username);
        info!(
            target: "audit",
            username = %username,
            agent_id = %agent.agent_id,
            hostname = %agent.hostname,
            script = %script.name,
            "script run"
        );

        let history = self
            .store
            .add_agent_history(NewAgentHistory {
                agent_id: agent.agent_id.clone(),
                kind: AgentHistoryKind::ScriptRun,
                username: username.clone(),
                command: None,
                script_id: Some(script.id),
            })
            .await?;

        let command = script_command(&script, &request.args, request.timeout_secs)
            .with_id(history.id);
        let budget = Duration::from_secs(request.timeout_secs + SCRIPT_MARGIN_SECS);
        let started = format!("{} will now be run on {}", script.name, agent.hostname);

        match request.output {
            ScriptOutput::Forget => {
                self.link
                    .publish(&agent.agent_id, &command)
                    .await
                    .map_err(|_| CommandError::Unreachable)?;
                Ok(started)
            }
            ScriptOutput::Wait => text(self.link.send(&agent.agent_id, &command, budget).await),
            ScriptOutput::Email { recipients } => {
                self.queue
                    .submit(WorkUnit {
                        agent_id: agent.agent_id.clone(),
                        action: WorkAction::EmailScriptOutput {
                            script_id: script.id,
                            args: request.args,
                            timeout_secs: request.timeout_secs,
                            recipients,
                        },
                        username,
                    })
                    .await?;
                Ok(format!(
                    "{started}. Results will be emailed when the script finishes"
                ))
            }
            ScriptOutput::Collector {
                custom_field_id,
                save_all_output,
            } => {
                let output = text(self.link.send(&agent.agent_id, &command, budget).await)?;
                if let Some(target) = collector {
                    let value = collector_value(&output, save_all_output);
                    self.store
                        .save_custom_field_value(custom_field_id, target, value)
                        .await?;
                }
                Ok(output)
            }
            ScriptOutput::Note => {
                let output = text(self.link.send(&agent.agent_id, &command, budget).await)?;
                self.store
                    .add_note(NewNote {
                        agent_id: agent.agent_id.clone(),
                        username,
                        note: output.clone(),
                    })
                    .await?;
                Ok(output)
            }
        }
    }

    /// Run a script and mail its output; executed from the task queue
    #[instrument(skip(self, args, recipients))]
    pub async fn email_script_output(
        &self,
        agent_id: &str,
        script_id: u64,
        args: &[String],
        timeout_secs: u64,
        recipients: Vec<String>,
    ) -> Result<(), CommandError> {
        let agent = self.store.get_agent(agent_id).await?;
        let script = self.store.get_script(script_id).await?;

        let command = script_command(&script, args, timeout_secs);
        let budget = Duration::from_secs(timeout_secs + SCRIPT_MARGIN_SECS);
        let output = text(self.link.send(&agent.agent_id, &command, budget).await)?;

        let notification = Notification {
            channel: Channel::Email,
            subject: format!("{} {} Results", agent.hostname, script.name),
            body: output,
            severity: Severity::Info,
            recipients,
        };
        self.notifier
            .send(notification)
            .await
            .map_err(|e| CommandError::ApplicationError(format!("{e:#}")))
    }

    /// Run an arbitrary command in a shell on the agent
    #[instrument(skip(self, request))]
    pub async fn raw_shell(
        &self,
        agent_id: &str,
        request: RawCommandRequest,
    ) -> Result<String, CommandError> {
        let agent = self.store.get_agent(agent_id).await?;
        let shell = request.shell.resolve(agent.platform).to_string();
        let username = truncate_username(&request.username);

        let history = self
            .store
            .add_agent_history(NewAgentHistory {
                agent_id: agent.agent_id.clone(),
                kind: AgentHistoryKind::CmdRun,
                username: username.clone(),
                command: Some(request.command.clone()),
                script_id: None,
            })
            .await?;

        let command = CommandPayload::new("rawcmd")
            .with_timeout(request.timeout_secs)
            .with_payload(json!({
                "command": request.command,
                "shell": shell,
            }))
            .with_id(history.id);

        let budget = Duration::from_secs(request.timeout_secs + RAW_COMMAND_MARGIN_SECS);
        let output = text(self.link.send(&agent.agent_id, &command, budget).await)?;

        info!(
            target: "audit",
            username = %username,
            agent_id = %agent.agent_id,
            hostname = %agent.hostname,
            shell = %shell,
            command = %request.command,
            "raw command"
        );

        Ok(output)
    }

    /// Schedule a one-shot reboot task on a Windows agent
    #[instrument(skip(self))]
    pub async fn schedule_reboot(
        &self,
        agent_id: &str,
        when: NaiveDateTime,
    ) -> Result<ScheduledReboot, CommandError> {
        let agent = self.store.get_agent(agent_id).await?;
        if agent.platform.is_posix() {
            return Err(CommandError::CapabilityUnsupported(format!(
                "Not currently implemented for {}",
                agent.platform
            )));
        }

        let task_name = reboot_task_name(&mut rand::thread_rng());
        let command = CommandPayload::new("schedtask")
            .with_payload(json!({ "schedtaskpayload": reboot_task_payload(&task_name, when) }));

        acknowledge(self.link.send(&agent.agent_id, &command, REBOOT_TIMEOUT).await)?;

        self.store
            .add_pending_action(NewPendingAction {
                agent_id: agent.agent_id.clone(),
                kind: PendingActionKind::ScheduledReboot,
                details: json!({ "taskname": task_name, "time": when.to_string() }),
            })
            .await?;

        info!(task_name, "reboot scheduled");
        Ok(ScheduledReboot {
            time: when.format("%B %d, %Y at %I:%M %p").to_string(),
            hostname: agent.hostname,
            task_name,
        })
    }

    /// Record the agent's report that a pending action has run
    #[instrument(
        skip(self, report),
        fields(action_id = report.action_id, agent_id = %report.agent_id)
    )]
    pub async fn complete_pending_action(
        &self,
        report: PendingActionReport,
    ) -> Result<PendingAction, CommandError> {
        let owned = self
            .store
            .pending_actions(&report.agent_id)
            .await?
            .iter()
            .any(|action| action.id == report.action_id);
        if !owned {
            return Err(CommandError::NotFound(format!(
                "pending action {} for {}",
                report.action_id, report.agent_id
            )));
        }

        let status = if report.succeeded {
            PendingStatus::Completed
        } else {
            PendingStatus::Failed
        };
        let action = self
            .store
            .complete_pending_action(report.action_id, status, report.details)
            .await?;

        info!(status = ?action.status, "pending action finished");
        Ok(action)
    }

    #[instrument(skip(self))]
    pub async fn reboot_now(&self, agent_id: &str) -> Result<(), CommandError> {
        let agent = self.store.get_agent(agent_id).await?;
        let command = CommandPayload::new("rebootnow");
        acknowledge(self.link.send(&agent.agent_id, &command, REBOOT_TIMEOUT).await)
    }

    #[instrument(skip(self))]
    pub async fn kill_process(&self, agent_id: &str, pid: u32) -> Result<String, CommandError> {
        let agent = self.store.get_agent(agent_id).await?;
        let command =
            CommandPayload::new("killproc").with_payload(json!({ "procpid": pid }));

        acknowledge(
            self.link
                .send(&agent.agent_id, &command, KILL_PROCESS_TIMEOUT)
                .await,
        )?;
        Ok(format!("Process with PID: {pid} was ended successfully"))
    }

    #[instrument(skip(self))]
    pub async fn list_processes(&self, agent_id: &str) -> Result<Vec<ProcessInfo>, CommandError> {
        let agent = self.store.get_agent(agent_id).await?;
        let command = CommandPayload::new("procs");
        let reply = payload(
            self.link
                .send(&agent.agent_id, &command, PROCESS_LIST_TIMEOUT)
                .await,
        )?;

        match reply {
            Value::String(message) => Err(CommandError::ApplicationError(message)),
            other => serde_json::from_value(other).map_err(|e| {
                CommandError::ApplicationError(format!("unexpected process list: {e}"))
            }),
        }
    }

    /// Ask the agent to resend its system information
    #[instrument(skip(self))]
    pub async fn request_sysinfo_refresh(&self, agent_id: &str) -> Result<(), CommandError> {
        let agent = self.store.get_agent(agent_id).await?;
        let command = CommandPayload::new("sysinfo");
        acknowledge(self.link.send(&agent.agent_id, &command, SYSINFO_TIMEOUT).await)
    }

    #[instrument(skip(self))]
    pub async fn repair_remote_access_session(
        &self,
        agent_id: &str,
    ) -> Result<String, CommandError> {
        let agent = self.store.get_agent(agent_id).await?;
        let command = CommandPayload::new("recover").with_payload(json!({ "mode": "mesh" }));

        acknowledge(
            self.link
                .send(&agent.agent_id, &command, REMOTE_ACCESS_REPAIR_TIMEOUT)
                .await,
        )?;
        Ok(format!("Repaired mesh agent on {}", agent.hostname))
    }

    #[instrument(skip(self))]
    pub async fn recover(&self, agent_id: &str, mode: RecoveryMode) -> Result<String, CommandError> {
        match mode {
            RecoveryMode::Agent => {
                let agent = self.store.get_agent(agent_id).await?;
                let command =
                    CommandPayload::new("recover").with_payload(json!({ "mode": "tacagent" }));
                self.link
                    .publish(&agent.agent_id, &command)
                    .await
                    .map_err(|_| CommandError::Unreachable)?;
                Ok("Recovery will be attempted shortly".to_string())
            }
            RecoveryMode::Mesh => match self.repair_remote_access_session(agent_id).await {
                Ok(_) => Ok("Successfully completed recovery".to_string()),
                Err(CommandError::ApplicationError(message)) => Err(
                    CommandError::ApplicationError(format!("Unable to complete recovery: {message}")),
                ),
                Err(e) => Err(e),
            },
        }
    }

    /// Fetch recent entries of an event log
    #[instrument(skip(self))]
    pub async fn fetch_event_log(
        &self,
        agent_id: &str,
        log: EventLogName,
        days: u32,
    ) -> Result<Value, CommandError> {
        let agent = self.store.get_agent(agent_id).await?;
        let timeout_secs = match log {
            EventLogName::Security => SECURITY_LOG_TIMEOUT_SECS,
            _ => EVENT_LOG_TIMEOUT_SECS,
        };

        let command = CommandPayload::new("eventlog")
            .with_timeout(timeout_secs)
            .with_payload(json!({ "logname": log, "days": days.to_string() }));
        let budget = Duration::from_secs(timeout_secs + EVENT_LOG_MARGIN_SECS);

        payload(self.link.send(&agent.agent_id, &command, budget).await)
    }

    #[instrument(skip(self))]
    pub async fn run_checks_now(&self, agent_id: &str) -> Result<String, CommandError> {
        let agent = self.store.get_agent(agent_id).await?;
        let command = CommandPayload::new("runchecks");

        let reply = self
            .link
            .send(&agent.agent_id, &command, RUN_CHECKS_TIMEOUT)
            .await;
        match reply.as_str() {
            Some("busy") => Err(CommandError::Busy(format!(
                "Checks are already running on {}",
                agent.hostname
            ))),
            Some("ok") => Ok(format!("Checks will now be re-run on {}", agent.hostname)),
            _ => Err(CommandError::Unreachable),
        }
    }

    /// Tell the agent to uninstall itself and forget about it
    #[instrument(skip(self))]
    pub async fn uninstall(&self, agent_id: &str) -> Result<String, CommandError> {
        let agent = self.store.get_agent(agent_id).await?;
        let command = CommandPayload::new("uninstall");

        // the agent record goes away even if the agent never hears about it
        if let Err(e) = self.link.publish(&agent.agent_id, &command).await {
            warn!("uninstall command not delivered: {e}");
        }

        self.store.delete_agent(&agent.agent_id).await?;
        info!(hostname = %agent.hostname, "agent removed");
        Ok(format!("{} will now be uninstalled.", agent.hostname))
    }

    #[instrument(skip(self))]
    pub async fn patch_scan(&self, agent_id: &str) -> Result<(), CommandError> {
        self.patch(agent_id, "getwinupdates").await
    }

    #[instrument(skip(self))]
    pub async fn install_patches(&self, agent_id: &str) -> Result<(), CommandError> {
        self.patch(agent_id, "installwinupdates").await
    }

    async fn patch(&self, agent_id: &str, func: &str) -> Result<(), CommandError> {
        let agent = self.store.get_agent(agent_id).await?;
        if agent.platform.is_posix() {
            return Err(CommandError::CapabilityUnsupported(format!(
                "Patch management is not available for {}",
                agent.platform
            )));
        }

        self.link
            .publish(&agent.agent_id, &CommandPayload::new(func))
            .await
            .map_err(|_| CommandError::Unreachable)
    }
}

#[async_trait]
impl WorkExecutor for CommandDispatcher {
    async fn execute(&self, unit: WorkUnit) -> anyhow::Result<()> {
        match unit.action {
            WorkAction::Command {
                command,
                shell,
                timeout_secs,
                run_on_offline,
            } => {
                if !run_on_offline {
                    let agent = self.store.get_agent(&unit.agent_id).await?;
                    if agent.status(Utc::now()) == AgentStatus::Offline {
                        debug!(agent_id = %unit.agent_id, "skipping offline agent");
                        return Ok(());
                    }
                }

                self.raw_shell(
                    &unit.agent_id,
                    RawCommandRequest {
                        command,
                        shell,
                        timeout_secs,
                        username: unit.username,
                    },
                )
                .await?;
            }
            WorkAction::Script {
                script_id,
                args,
                timeout_secs,
            } => {
                self.run_script(
                    &unit.agent_id,
                    RunScriptRequest {
                        script_id,
                        args,
                        timeout_secs,
                        output: ScriptOutput::Forget,
                        username: unit.username,
                    },
                )
                .await?;
            }
            WorkAction::Patch { patch_mode } => match patch_mode {
                PatchMode::Install => self.install_patches(&unit.agent_id).await?,
                PatchMode::Scan => self.patch_scan(&unit.agent_id).await?,
            },
            WorkAction::EmailScriptOutput {
                script_id,
                args,
                timeout_secs,
                recipients,
            } => {
                self.email_script_output(&unit.agent_id, script_id, &args, timeout_secs, recipients)
                    .await?;
            }
        }
        Ok(())
    }
}
