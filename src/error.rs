//! Error taxonomy for the order/shift engine.
//!
//! Every failure is recoverable. Validation and policy errors are raised
//! before any request leaves the terminal, so nothing needs undoing.
//! Conflict and transport errors arrive after an optimistic update has
//! already been applied and must be rolled back by the caller.

use thiserror::Error;

/// Coarse classification used by the UI to pick a notification style.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Validation,
    Conflict,
    Transport,
    Policy,
}

#[derive(Debug, Error)]
pub enum PosError {
    /// Guard failure caught locally (terminal order, unpaid `done`, ...).
    #[error("{0}")]
    Validation(String),

    /// Server rejected the request because of a race with another actor.
    #[error("Conflict: {0}")]
    Conflict(String),

    /// Network failure or timeout; the outcome is unknown.
    #[error("Transport error: {0}")]
    Transport(String),

    /// The order must go through payment confirmation first.
    #[error("{0}")]
    PaymentRequired(String),

    /// Role or shift gate denied the action.
    #[error("Not allowed: {0}")]
    Policy(String),

    #[error("Order not found: {0}")]
    NotFound(String),

    /// A transition for this order is already being submitted.
    #[error("Order {0} is already being updated")]
    InFlight(String),

    #[error("Local storage error: {0}")]
    Storage(String),
}

impl PosError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            PosError::Validation(_) | PosError::PaymentRequired(_) | PosError::InFlight(_) => {
                ErrorKind::Validation
            }
            PosError::Conflict(_) | PosError::NotFound(_) => ErrorKind::Conflict,
            PosError::Transport(_) | PosError::Storage(_) => ErrorKind::Transport,
            PosError::Policy(_) => ErrorKind::Policy,
        }
    }

    /// Whether an optimistic update issued before this error must be undone.
    pub fn requires_rollback(&self) -> bool {
        matches!(self.kind(), ErrorKind::Conflict | ErrorKind::Transport)
    }

    pub(crate) fn validation(msg: impl Into<String>) -> Self {
        PosError::Validation(msg.into())
    }

    pub(crate) fn policy(msg: impl Into<String>) -> Self {
        PosError::Policy(msg.into())
    }
}

impl From<rusqlite::Error> for PosError {
    fn from(err: rusqlite::Error) -> Self {
        PosError::Storage(err.to_string())
    }
}

impl From<serde_json::Error> for PosError {
    fn from(err: serde_json::Error) -> Self {
        PosError::Storage(format!("serialization: {err}"))
    }
}

pub type PosResult<T> = Result<T, PosError>;
