//! Error types for the MicroLoan coordinator

use thiserror::Error;
use uuid::Uuid;

/// Main error type for the coordinator
#[derive(Error, Debug)]
pub enum CoordinatorError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Task {task_id} not found")]
    NotFound { task_id: Uuid },

    #[error("Task {task_id} was modified concurrently")]
    ConcurrentModification { task_id: Uuid },

    #[error("Invalid amount: {0}")]
    InvalidAmount(String),

    #[error("Precondition failed: {0}")]
    PreconditionFailed(String),

    #[error("Settlement of {handle} not observed within {waited_secs}s")]
    SettlementTimeout { handle: String, waited_secs: u64 },

    #[error("Settlement source unavailable for {handle} after {failures} consecutive failures")]
    PollerUnavailable { handle: String, failures: u32 },

    #[error("Operation {handle} failed externally with status {status}")]
    ExternalFailure { handle: String, status: String },

    #[error("Operation {handle} was cancelled externally")]
    Cancelled { handle: String },

    #[error("Wait for {handle} interrupted")]
    Interrupted { handle: String },

    #[error("Invalid state transition from {from} to {to}")]
    InvalidStateTransition { from: String, to: String },

    #[error("Chain connection error: {0}")]
    ChainConnection(String),

    #[error("Contract error: {0}")]
    Contract(String),

    #[error("Wallet error: {0}")]
    Wallet(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl CoordinatorError {
    /// Outcome is ambiguous; the step may be run again and will resume the
    /// persisted operation handle rather than submit a new one.
    pub fn is_retry_safe(&self) -> bool {
        matches!(
            self,
            CoordinatorError::SettlementTimeout { .. }
                | CoordinatorError::PollerUnavailable { .. }
                | CoordinatorError::Interrupted { .. }
                | CoordinatorError::ChainConnection(_)
        )
    }

    /// Errors that definitively end a workflow
    pub fn is_terminal_for_task(&self) -> bool {
        matches!(
            self,
            CoordinatorError::PreconditionFailed(_)
                | CoordinatorError::ExternalFailure { .. }
                | CoordinatorError::Cancelled { .. }
        )
    }

    /// Check if error should trigger an alert
    pub fn should_alert(&self) -> bool {
        matches!(
            self,
            CoordinatorError::PollerUnavailable { .. }
                | CoordinatorError::InvalidStateTransition { .. }
                | CoordinatorError::Wallet(_)
        )
    }
}

/// Result type for coordinator operations
pub type CoordinatorResult<T> = Result<T, CoordinatorError>;
