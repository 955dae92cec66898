//! Error types for the generation and comparison core

use thiserror::Error;

use crate::models::SlotStatus;

/// Core error type.
///
/// Cancellation is not an error: an aborted stream is reported through
/// `StreamOutcome::aborted`.
#[derive(Error, Debug)]
pub enum Error {
    /// The request to the model backend failed before or during transport
    #[error("network error: {0}")]
    Network(String),

    /// The backend answered with an explicit error payload or a non-2xx status
    #[error("upstream error: {0}")]
    Upstream(String),

    /// A complete payload could not be interpreted
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Configuration error
    #[error("configuration error: {0}")]
    Config(String),

    /// A generate/regenerate was requested while the slot already has one in flight
    #[error("slot {0} already has a generation in flight")]
    SlotBusy(usize),

    /// The requested operation is not allowed from the slot's current status
    #[error("slot {slot} cannot {operation} while {status}")]
    InvalidTransition {
        slot: usize,
        operation: &'static str,
        status: SlotStatus,
    },

    /// Regenerate was requested before any prompt was recorded for the slot
    #[error("slot {0} has no prompt to regenerate from")]
    MissingPrompt(usize),

    /// Slot index out of range
    #[error("unknown slot {0}")]
    UnknownSlot(usize),

    /// The judge step was requested while a slot is still streaming
    #[error("judging not ready: {0}")]
    JudgeNotReady(String),

    /// A judge call is already in progress
    #[error("judging already in progress")]
    JudgeBusy,

    /// A comparison run is already in progress
    #[error("comparison already running")]
    ComparisonBusy,
}

impl From<reqwest::Error> for Error {
    fn from(err: reqwest::Error) -> Self {
        Error::Network(err.to_string())
    }
}

/// Result type alias
pub type Result<T> = std::result::Result<T, Error>;
