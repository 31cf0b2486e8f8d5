//! Message types for actor communication

use tokio::sync::oneshot;

use crate::alerts::Alert;
use crate::checks::{
    Check, CheckHistoryEntry, CheckReport, CheckResult, EngineError, IngestOutcome, NewCheck,
    TaskOutcome,
};

pub type Reply<T> = oneshot::Sender<Result<T, EngineError>>;

/// Commands that can be sent to the CheckEngineActor
#[derive(Debug)]
pub enum EngineCommand {
    /// Evaluate a reported check result
    ///
    /// `respond_to` is `None` for results arriving from the bus, where nobody
    /// waits for the outcome.
    Ingest {
        report: CheckReport,
        respond_to: Option<Reply<IngestOutcome>>,
    },

    /// Open or resolve the alert of an automated task
    IngestTask {
        outcome: TaskOutcome,
        respond_to: Option<Reply<Option<Alert>>>,
    },

    /// Force a check back to passing
    Reset {
        check_id: u64,
        agent_id: String,
        respond_to: Reply<CheckResult>,
    },

    CreateCheck {
        check: NewCheck,
        respond_to: Reply<Check>,
    },

    UpdateCheck {
        check: Check,
        respond_to: Reply<Check>,
    },

    DeleteCheck {
        check_id: u64,
        respond_to: Reply<()>,
    },

    History {
        check_id: u64,
        agent_id: String,
        days: u32,
        respond_to: Reply<Vec<CheckHistoryEntry>>,
    },

    /// Finish the queued commands and stop
    Shutdown,
}
