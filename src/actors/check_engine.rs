//! Single-writer actor around the check engine
//!
//! All ingestion goes through one task, so the read-evaluate-write sequence for a
//! check result never interleaves with another for the same pair.

use tokio::sync::{mpsc, oneshot};
use tracing::{debug, instrument, warn};

use super::messages::{EngineCommand, Reply};
use crate::alerts::Alert;
use crate::checks::{
    Check, CheckEngine, CheckHistoryEntry, CheckReport, CheckResult, EngineError, IngestOutcome,
    NewCheck, TaskOutcome,
};

pub struct CheckEngineActor {
    engine: CheckEngine,
    command_rx: mpsc::Receiver<EngineCommand>,
}

impl CheckEngineActor {
    pub fn new(engine: CheckEngine, command_rx: mpsc::Receiver<EngineCommand>) -> Self {
        Self { engine, command_rx }
    }

    #[instrument(skip(self))]
    pub async fn run(mut self) {
        debug!("starting check engine actor");

        while let Some(cmd) = self.command_rx.recv().await {
            match cmd {
                EngineCommand::Ingest { report, respond_to } => {
                    let result = self.engine.ingest(report).await;
                    answer(respond_to, result);
                }

                EngineCommand::IngestTask {
                    outcome,
                    respond_to,
                } => {
                    let result = self.engine.ingest_task_outcome(outcome).await;
                    answer(respond_to, result);
                }

                EngineCommand::Reset {
                    check_id,
                    agent_id,
                    respond_to,
                } => {
                    let _ = respond_to.send(self.engine.reset(check_id, &agent_id).await);
                }

                EngineCommand::CreateCheck { check, respond_to } => {
                    let _ = respond_to.send(self.engine.create_check(check).await);
                }

                EngineCommand::UpdateCheck { check, respond_to } => {
                    let _ = respond_to.send(self.engine.update_check(check).await);
                }

                EngineCommand::DeleteCheck {
                    check_id,
                    respond_to,
                } => {
                    let _ = respond_to.send(self.engine.delete_check(check_id).await);
                }

                EngineCommand::History {
                    check_id,
                    agent_id,
                    days,
                    respond_to,
                } => {
                    let result = self.engine.history(check_id, &agent_id, days).await;
                    let _ = respond_to.send(result);
                }

                EngineCommand::Shutdown => {
                    debug!("check engine actor shutting down");
                    break;
                }
            }
        }
    }
}

/// Hand the result to a waiting caller, or log failures nobody will see
fn answer<T>(respond_to: Option<Reply<T>>, result: Result<T, EngineError>) {
    match respond_to {
        Some(respond_to) => {
            let _ = respond_to.send(result);
        }
        None => {
            if let Err(e) = result {
                warn!("ingestion failed: {e}");
            }
        }
    }
}

/// Cloneable handle to the check engine actor
#[derive(Clone, Debug)]
pub struct CheckEngineHandle {
    sender: mpsc::Sender<EngineCommand>,
}

impl CheckEngineHandle {
    /// Spawn the actor on the current runtime
    pub fn spawn(engine: CheckEngine) -> Self {
        let (cmd_tx, cmd_rx) = mpsc::channel(256);
        let actor = CheckEngineActor::new(engine, cmd_rx);
        tokio::spawn(actor.run());
        Self { sender: cmd_tx }
    }

    async fn request<T>(
        &self,
        build: impl FnOnce(Reply<T>) -> EngineCommand,
    ) -> Result<T, EngineError> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(build(tx))
            .await
            .map_err(|_| EngineError::Stopped)?;
        rx.await.map_err(|_| EngineError::Stopped)?
    }

    pub async fn ingest(&self, report: CheckReport) -> Result<IngestOutcome, EngineError> {
        self.request(|tx| EngineCommand::Ingest {
            report,
            respond_to: Some(tx),
        })
        .await
    }

    /// Queue a result without waiting for its outcome
    pub async fn submit(&self, report: CheckReport) -> Result<(), EngineError> {
        self.sender
            .send(EngineCommand::Ingest {
                report,
                respond_to: None,
            })
            .await
            .map_err(|_| EngineError::Stopped)
    }

    pub async fn ingest_task(&self, outcome: TaskOutcome) -> Result<Option<Alert>, EngineError> {
        self.request(|tx| EngineCommand::IngestTask {
            outcome,
            respond_to: Some(tx),
        })
        .await
    }

    pub async fn submit_task(&self, outcome: TaskOutcome) -> Result<(), EngineError> {
        self.sender
            .send(EngineCommand::IngestTask {
                outcome,
                respond_to: None,
            })
            .await
            .map_err(|_| EngineError::Stopped)
    }

    pub async fn reset(&self, check_id: u64, agent_id: &str) -> Result<CheckResult, EngineError> {
        let agent_id = agent_id.to_string();
        self.request(|tx| EngineCommand::Reset {
            check_id,
            agent_id,
            respond_to: tx,
        })
        .await
    }

    pub async fn create_check(&self, check: NewCheck) -> Result<Check, EngineError> {
        self.request(|tx| EngineCommand::CreateCheck {
            check,
            respond_to: tx,
        })
        .await
    }

    pub async fn update_check(&self, check: Check) -> Result<Check, EngineError> {
        self.request(|tx| EngineCommand::UpdateCheck {
            check,
            respond_to: tx,
        })
        .await
    }

    pub async fn delete_check(&self, check_id: u64) -> Result<(), EngineError> {
        self.request(|tx| EngineCommand::DeleteCheck {
            check_id,
            respond_to: tx,
        })
        .await
    }

    pub async fn history(
        &self,
        check_id: u64,
        agent_id: &str,
        days: u32,
    ) -> Result<Vec<CheckHistoryEntry>, EngineError> {
        let agent_id = agent_id.to_string();
        self.request(|tx| EngineCommand::History {
            check_id,
            agent_id,
            days,
            respond_to: tx,
        })
        .await
    }

    /// Shutdown the check engine actor
    pub async fn shutdown(&self) {
        let _ = self.sender.send(EngineCommand::Shutdown).await;
    }
}
