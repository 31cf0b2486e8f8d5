//! Deferred execution of per-agent work
//!
//! The orchestrator and the dispatcher hand units of work to a [`TaskQueue`] and
//! return immediately. [`WorkerPool`] is the in-process queue: an unbounded
//! channel drained by a receiver that runs units with bounded concurrency, so
//! submitting never waits on running work. A failing unit is logged and does not
//! affect the others.

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::{Semaphore, mpsc};
use tracing::{debug, error, instrument};
use uuid::Uuid;

use crate::models::CommandShell;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PatchMode {
    Install,
    Scan,
}

/// What to do on one agent
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum WorkAction {
    Command {
        command: String,
        shell: CommandShell,
        timeout_secs: u64,
        /// Also attempt agents that currently look offline
        #[serde(default)]
        run_on_offline: bool,
    },
    Script {
        script_id: u64,
        #[serde(default)]
        args: Vec<String>,
        timeout_secs: u64,
    },
    Patch {
        patch_mode: PatchMode,
    },
    /// Run a script, then mail its output
    EmailScriptOutput {
        script_id: u64,
        #[serde(default)]
        args: Vec<String>,
        timeout_secs: u64,
        /// Empty means the default recipients of the email channel
        #[serde(default)]
        recipients: Vec<String>,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkUnit {
    pub agent_id: String,
    pub action: WorkAction,
    pub username: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct JobHandle {
    pub id: Uuid,
}

#[derive(Debug, Clone, Error)]
pub enum QueueError {
    #[error("task queue is closed")]
    Closed,
}

#[async_trait]
pub trait TaskQueue: Send + Sync {
    async fn submit(&self, unit: WorkUnit) -> Result<JobHandle, QueueError>;
}

/// Runs a unit of work, typically by issuing commands through the link
#[async_trait]
pub trait WorkExecutor: Send + Sync {
    async fn execute(&self, unit: WorkUnit) -> anyhow::Result<()>;
}

/// Submitting side of the in-process queue
#[derive(Clone)]
pub struct WorkerPool {
    sender: mpsc::UnboundedSender<(JobHandle, WorkUnit)>,
}

/// Draining side of the in-process queue
pub struct WorkReceiver {
    receiver: mpsc::UnboundedReceiver<(JobHandle, WorkUnit)>,
}

impl WorkerPool {
    pub fn new() -> (Self, WorkReceiver) {
        let (sender, receiver) = mpsc::unbounded_channel();
        (Self { sender }, WorkReceiver { receiver })
    }
}

#[async_trait]
impl TaskQueue for WorkerPool {
    async fn submit(&self, unit: WorkUnit) -> Result<JobHandle, QueueError> {
        let job = JobHandle { id: Uuid::new_v4() };
        self.sender
            .send((job, unit))
            .map_err(|_| QueueError::Closed)?;
        Ok(job)
    }
}

impl WorkReceiver {
    /// Execute queued units, at most `concurrency` at a time, until every pool
    /// handle is dropped
    #[instrument(skip(self, executor))]
    pub async fn run(mut self, executor: Arc<dyn WorkExecutor>, concurrency: usize) {
        let semaphore = Arc::new(Semaphore::new(concurrency.max(1)));

        while let Some((job, unit)) = self.receiver.recv().await {
            let Ok(permit) = semaphore.clone().acquire_owned().await else {
                break;
            };
            let executor = Arc::clone(&executor);

            tokio::spawn(async move {
                let _permit = permit;
                let agent_id = unit.agent_id.clone();
                match executor.execute(unit).await {
                    Ok(()) => debug!(job_id = %job.id, agent_id, "work unit finished"),
                    Err(e) => error!(job_id = %job.id, agent_id, "work unit failed: {e:#}"),
                }
            });
        }

        debug!("work queue closed");
    }
}
