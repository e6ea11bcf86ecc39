//! Error types for gate operations.

use std::time::Duration;

use thiserror::Error;

/// Main error type for gate operations.
#[derive(Error, Debug)]
pub enum GateError {
    /// The attempted amount would push the current frame over `frame_limit`.
    #[error("Frame limit exceeded: {current} + {amount} > {limit}")]
    FrameLimit { limit: i64, current: i64, amount: i64 },

    /// The attempted amount would push the window sum over `window_limit`.
    #[error("Window limit exceeded: {current} + {amount} > {limit}")]
    WindowLimit { limit: i64, current: i64, amount: i64 },

    /// A strict-floor decrement would take the current frame below zero.
    #[error("Frame value must stay >= 0: {current} + {amount} < 0")]
    FrameUnderflow { current: i64, amount: i64 },

    /// A strict-floor decrement would take the window sum below zero.
    #[error("Window sum must stay >= 0: {current} + {amount} < 0")]
    WindowUnderflow { current: i64, amount: i64 },

    /// The frame value or the window sum would leave the supported range.
    #[error("Counter out of range: {current} + {amount}")]
    Overflow { current: i64, amount: i64 },

    /// Invalid gate or backend configuration. Raised at construction only.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Network timeout or disconnect talking to the remote store.
    #[error("Backend unavailable: {0}")]
    Transient(String),

    /// Non-transient backend failure.
    #[error("Backend error: {0}")]
    Backend(String),

    /// A snapshot that does not fit the live gate.
    #[error("Snapshot rejected: {0}")]
    Snapshot(String),

    /// A caller-bounded wait for admission elapsed.
    #[error("Timed out waiting for admission after {0:?}")]
    Timeout(Duration),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Snapshot (de)serialization errors
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl GateError {
    /// True for frame or window limit rejections.
    pub fn is_throttling(&self) -> bool {
        matches!(self, GateError::FrameLimit { .. } | GateError::WindowLimit { .. })
    }

    /// True for underflow rejections of strict-floor decrements.
    pub fn is_underflow(&self) -> bool {
        matches!(
            self,
            GateError::FrameUnderflow { .. } | GateError::WindowUnderflow { .. }
        )
    }

    /// True when the failure says nothing about admission and the call may be retried.
    pub fn is_transient(&self) -> bool {
        matches!(self, GateError::Transient(_))
    }
}

/// Result type alias for gate operations.
pub type Result<T> = std::result::Result<T, GateError>;
