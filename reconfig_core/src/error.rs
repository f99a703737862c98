//! Error types for the reconfiguration engine.

use reconfig_env::TaskId;
use thiserror::Error;

/// Errors raised by a channel call.
///
/// When the call was replayed by a blocking driver object, the error is
/// captured in the replaying task and handed back to the original caller.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CallError {
    /// A single-writer channel saw a write from a second task.
    #[error("Channel '{channel}' has multiple drivers ({first} and {second})")]
    MultipleDrivers {
        channel: String,
        first: TaskId,
        second: TaskId,
    },

    /// The call reached a fallback interface; no channel is connected.
    #[error("Channel unavailable: {0}")]
    Unavailable(String),

    /// Channel specific failure.
    #[error("Channel error: {0}")]
    Channel(String),
}

impl CallError {
    /// Creates a channel error.
    pub fn channel(msg: impl Into<String>) -> Self {
        Self::Channel(msg.into())
    }
}

/// Errors that can occur while reconfiguring.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ReconfigError {
    /// Programming error: wrong state for the requested transition, unit
    /// without a control, operation outside a task, and similar.
    #[error("Invalid usage of unit '{unit}': {reason}")]
    Usage { unit: String, reason: String },

    /// A switch the unit would occupy is held by another unit.
    /// Nothing was changed.
    #[error("Switch '{switch}' requested by '{requested}' is occupied by '{occupant}'")]
    Conflict {
        switch: String,
        requested: String,
        occupant: String,
    },

    /// The unit is already owned by a different control.
    #[error("Unit '{unit}' is already managed by control '{owner}'")]
    ControlConflict { unit: String, owner: String },

    /// Malformed switch binding.
    #[error("Invalid binding on switch '{switch}': {reason}")]
    Binding { switch: String, reason: String },

    /// Error raised by a forwarded call.
    #[error("Call failed: {0}")]
    Call(#[from] CallError),
}

impl ReconfigError {
    /// Creates a usage error.
    pub fn usage(unit: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Usage {
            unit: unit.into(),
            reason: reason.into(),
        }
    }

    /// Creates a binding error.
    pub fn binding(switch: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Binding {
            switch: switch.into(),
            reason: reason.into(),
        }
    }

    /// Returns true for refused operations the caller may retry.
    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::Conflict { .. })
    }
}

/// Result alias used throughout the engine.
pub type Result<T> = std::result::Result<T, ReconfigError>;
