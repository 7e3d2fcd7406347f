//! Bounded retry policy for failed downloads.

use crate::core::types::{DownloadTask, FailureKind};

/// What to do with a failed download task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryDecision {
    /// Put this new task value back on the download queue.
    Resubmit(DownloadTask),
    /// Record a final error for this task value.
    GiveUp(DownloadTask),
}

/// Decides between resubmission and a final error.
///
/// `error_count` counts failed attempts. A transient failure is retried until
/// the count reaches `error_count_limit`, so a task is attempted at most
/// `error_count_limit` times. Hash mismatches are never retried.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    error_count_limit: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(3)
    }
}

impl RetryPolicy {
    pub fn new(error_count_limit: u32) -> Self {
        Self {
            error_count_limit: error_count_limit.max(1),
        }
    }

    pub fn error_count_limit(&self) -> u32 {
        self.error_count_limit
    }

    /// Decide the fate of `task` after a failure of the given kind.
    pub fn decide(&self, task: &DownloadTask, kind: FailureKind) -> RetryDecision {
        let next = task.retried();
        match kind {
            FailureKind::HashMismatch => RetryDecision::GiveUp(next),
            FailureKind::Transient if next.error_count >= self.error_count_limit => {
                RetryDecision::GiveUp(next)
            }
            FailureKind::Transient => RetryDecision::Resubmit(next),
        }
    }
}
