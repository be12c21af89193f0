//! Error types for settlement-core.

use thiserror::Error;

use crate::types::{AttemptStatus, Reference};

/// Errors raised by the settlement engine and its collaborators.
#[derive(Debug, Error)]
pub enum SettlementError {
    /// The oracle could not be reached or returned garbage.
    #[error("settlement oracle unavailable for {reference}: {reason}")]
    OracleUnavailable { reference: Reference, reason: String },

    /// A single oracle call exceeded its deadline.
    #[error("settlement oracle timed out for {reference} after {timeout_ms}ms")]
    OracleTimeout { reference: Reference, timeout_ms: u64 },

    /// The oracle refused to issue a virtual account.
    #[error("virtual account could not be issued: {0}")]
    AccountUnavailable(String),

    /// The attempt has already reached a terminal state.
    #[error("attempt {reference} already finished as {status}")]
    AttemptFinished {
        reference: Reference,
        status: AttemptStatus,
    },

    /// The attempt was waited on before it was started.
    #[error("attempt {0} has not been started")]
    NotStarted(Reference),

    /// The engine task is gone (dropped or panicked).
    #[error("settlement engine for {0} is no longer running")]
    EngineStopped(Reference),

    /// A reveal operation named a field that was never registered.
    #[error("unknown secret field: {0}")]
    UnknownField(String),

    /// Writing to the clipboard failed.
    #[error("clipboard write failed: {0}")]
    Clipboard(String),

    /// Configuration values are out of range.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// Layered configuration could not be loaded.
    #[error("configuration load failed: {0}")]
    ConfigLoad(#[from] config::ConfigError),
}

impl SettlementError {
    /// Transient errors are retried on the next tick and never surfaced alone.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::OracleUnavailable { .. } | Self::OracleTimeout { .. }
        )
    }
}

/// Result type for settlement operations.
pub type SettlementResult<T> = Result<T, SettlementError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transient_classification() {
        let timeout = SettlementError::OracleTimeout {
            reference: Reference::new("r-1"),
            timeout_ms: 500,
        };
        assert!(timeout.is_transient());
        assert!(timeout.to_string().contains("500ms"));

        let finished = SettlementError::AttemptFinished {
            reference: Reference::new("r-1"),
            status: AttemptStatus::Expired,
        };
        assert!(!finished.is_transient());
        assert!(finished.to_string().contains("expired"));
    }
}
