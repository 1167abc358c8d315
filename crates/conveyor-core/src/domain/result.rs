//! Outcome of one work-function invocation.

use serde::{Deserialize, Serialize};

/// Tagged outcome of a single job execution.
///
/// Produced once per invocation; the runner maps it onto the queue:
/// - `Success` -> complete
/// - `Failed` -> abandon with a reason (requeue or deadletter per policy)
/// - `Cancelled` -> abandon without a reason
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobResult {
    Success,
    Failed { reason: String },
    Cancelled,
}

impl JobResult {
    pub fn success() -> Self {
        JobResult::Success
    }

    pub fn failed(reason: impl Into<String>) -> Self {
        JobResult::Failed {
            reason: reason.into(),
        }
    }

    pub fn cancelled() -> Self {
        JobResult::Cancelled
    }

    pub fn is_success(&self) -> bool {
        matches!(self, JobResult::Success)
    }
}
