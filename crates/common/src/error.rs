//! Common error types for BatchCore
//!
//! This module defines all error types used by the batch assembler and the
//! LoRA adapter registry. Every failure is reported synchronously to the
//! immediate caller; none of them leave shared state half-mutated.

use thiserror::Error;

/// Main error type for BatchCore
#[derive(Error, Debug)]
pub enum BatchCoreError {
    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// Malformed request descriptor, bundle or resolution input
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Per-slot adapter ids and per-slot lengths disagree in length
    #[error("Shape mismatch: {ids} adapter ids for {lengths} input lengths")]
    ShapeMismatch { ids: usize, lengths: usize },

    /// Registry is at its configured adapter limit
    #[error("Capacity exceeded: {0}")]
    CapacityExceeded(String),

    /// Removal gave up waiting for outstanding leases
    #[error("Timed out draining LoRA adapter {lora_id}: {outstanding} lease(s) still held")]
    DrainTimeout { lora_id: i64, outstanding: usize },

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Generic internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl BatchCoreError {
    /// Create a configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        BatchCoreError::Config(msg.into())
    }

    /// Create an invalid input error
    pub fn invalid_input(msg: impl Into<String>) -> Self {
        BatchCoreError::InvalidInput(msg.into())
    }

    /// Create a capacity error
    pub fn capacity_exceeded(msg: impl Into<String>) -> Self {
        BatchCoreError::CapacityExceeded(msg.into())
    }

    /// Create an internal error
    pub fn internal(msg: impl Into<String>) -> Self {
        BatchCoreError::Internal(msg.into())
    }

    /// Whether the caller violated a precondition (as opposed to an
    /// operational failure such as a drain timeout).
    pub fn is_precondition(&self) -> bool {
        matches!(
            self,
            BatchCoreError::InvalidInput(_) | BatchCoreError::ShapeMismatch { .. }
        )
    }
}

/// Result type alias for BatchCore operations
pub type Result<T> = std::result::Result<T, BatchCoreError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = BatchCoreError::ShapeMismatch { ids: 4, lengths: 3 };
        assert_eq!(err.to_string(), "Shape mismatch: 4 adapter ids for 3 input lengths");

        let err = BatchCoreError::DrainTimeout { lora_id: 7, outstanding: 2 };
        assert!(err.to_string().contains("adapter 7"));
    }

    #[test]
    fn test_precondition_classification() {
        assert!(BatchCoreError::invalid_input("bad").is_precondition());
        assert!(BatchCoreError::ShapeMismatch { ids: 1, lengths: 2 }.is_precondition());
        assert!(!BatchCoreError::capacity_exceeded("full").is_precondition());
        assert!(!BatchCoreError::DrainTimeout { lora_id: 0, outstanding: 1 }.is_precondition());
    }
}
