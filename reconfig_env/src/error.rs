//! Error types for the reconfig environment abstraction.

use thiserror::Error;

/// Errors that can occur in the environment abstraction layer.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum EnvError {
    /// The kernel ran out of runnable work before the awaited future finished.
    /// Every remaining task is waiting on an event nobody will notify.
    #[error("Simulation stalled with {pending} task(s) still blocked")]
    Stalled { pending: usize },

    /// The time limit passed to a bounded run was reached first.
    #[error("Time limit of {limit_ns}ns reached before completion")]
    TimeLimit { limit_ns: u128 },
}

impl EnvError {
    /// Creates a stall error.
    pub fn stalled(pending: usize) -> Self {
        Self::Stalled { pending }
    }

    /// Creates a time limit error.
    pub fn time_limit(limit: std::time::Duration) -> Self {
        Self::TimeLimit {
            limit_ns: limit.as_nanos(),
        }
    }
}
