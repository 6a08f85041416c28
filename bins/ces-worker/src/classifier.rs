/// Execution Result Classifier
///
/// **Core Responsibility:**
/// Map how a container ended to a terminal state and failure reason.
///
/// Pure function, no I/O. The deadline is checked before the exit code, so a
/// program that exits 0 after being killed for overrunning still fails.
use ces_common::{ExecutionState, FailureReason};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Classification {
    pub state: ExecutionState,
    pub failure_reason: FailureReason,
}

impl Classification {
    fn completed() -> Self {
        Self {
            state: ExecutionState::Completed,
            failure_reason: FailureReason::None,
        }
    }

    fn failed(failure_reason: FailureReason) -> Self {
        Self {
            state: ExecutionState::Failed,
            failure_reason,
        }
    }
}

pub fn classify(finished_in_time: bool, exit_code: Option<i64>) -> Classification {
    if !finished_in_time {
        return Classification::failed(FailureReason::TimeLimitExceeded);
    }
    match exit_code {
        Some(0) => Classification::completed(),
        Some(_) => Classification::failed(FailureReason::NonZeroExitCode),
        None => Classification::failed(FailureReason::InternalError),
    }
}
