//! Error taxonomy for the performance layer
//!
//! Three caller-visible failures: admission rejection, deadline expiry, and
//! upstream failure. Pool exhaustion (`Busy`) is deliberately absent; it is
//! a transient capacity signal the queue absorbs, never an error callers see.

use thiserror::Error;

use crate::queue::QueueClass;

pub type PerfResult<T> = Result<T, PerfError>;

#[derive(Debug, Error)]
pub enum PerfError {
    /// Rejected at admission: the named queue's pending list is full.
    #[error("{queue} queue full: {pending}/{max_pending} pending")]
    QueueFull {
        queue: QueueClass,
        pending: usize,
        max_pending: usize,
    },

    /// The caller's deadline elapsed before the work resolved.
    #[error("{queue} request timed out after {deadline_ms}ms")]
    Timeout { queue: QueueClass, deadline_ms: u64 },

    /// The upstream call itself failed.
    #[error("upstream error: {message}")]
    Upstream { message: String },
}

impl PerfError {
    pub fn upstream(message: impl Into<String>) -> Self {
        Self::Upstream {
            message: message.into(),
        }
    }

    /// True for failures caused by this layer's own limits rather than the
    /// upstream service.
    pub fn is_capacity_failure(&self) -> bool {
        matches!(self, Self::QueueFull { .. } | Self::Timeout { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_names_the_queue() {
        let err = PerfError::QueueFull {
            queue: QueueClass::Stt,
            pending: 75,
            max_pending: 75,
        };
        assert_eq!(err.to_string(), "stt queue full: 75/75 pending");

        let err = PerfError::Timeout {
            queue: QueueClass::Llm,
            deadline_ms: 30000,
        };
        assert_eq!(err.to_string(), "llm request timed out after 30000ms");
    }

    #[test]
    fn capacity_failures_exclude_upstream_errors() {
        assert!(PerfError::QueueFull {
            queue: QueueClass::Tts,
            pending: 100,
            max_pending: 100,
        }
        .is_capacity_failure());
        assert!(!PerfError::upstream("synthesis backend 500").is_capacity_failure());
    }
}
