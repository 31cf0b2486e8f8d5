//! Pass/fail hysteresis for a single (check, agent) pair

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CheckStatus {
    Pending,
    Passing,
    Failing,
}

/// What the alert side has to do after a transition
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AlertAction {
    None,
    /// Open the alert, or refresh the one already open
    Open,
    Resolve,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CheckState {
    pub status: CheckStatus,
    pub fail_count: u32,
}

impl Default for CheckState {
    fn default() -> Self {
        Self::INITIAL
    }
}

impl CheckState {
    pub const INITIAL: CheckState = CheckState {
        status: CheckStatus::Pending,
        fail_count: 0,
    };

    /// State forced by a manual reset
    pub const RESET: CheckState = CheckState {
        status: CheckStatus::Passing,
        fail_count: 0,
    };

    /// Apply one evaluation
    ///
    /// `failures` is the number of consecutive failures required before the check
    /// turns failing; values below 1 are treated as 1.
    pub fn apply(self, passed: bool, failures: u32) -> (CheckState, AlertAction) {
        if passed {
            let action = if self.status == CheckStatus::Failing {
                AlertAction::Resolve
            } else {
                AlertAction::None
            };
            return (Self::RESET, action);
        }

        let fail_count = self.fail_count.saturating_add(1);
        if fail_count >= failures.max(1) {
            let next = CheckState {
                status: CheckStatus::Failing,
                fail_count,
            };
            (next, AlertAction::Open)
        } else {
            let next = CheckState {
                status: self.status,
                fail_count,
            };
            (next, AlertAction::None)
        }
    }
}
