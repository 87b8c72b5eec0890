//! Error types for the tracking SDK core.
//!
//! Errors here cover the paths that can legitimately fail: unary RPCs, the
//! transport channel, and stream establishment. Streaming data paths never
//! surface errors to the user; a failed stream transitions its reactor to
//! the finished state and the channel monitor re-establishes it when the
//! transport recovers. Pull reads report absence through
//! [`ResponseState::NoData`](crate::types::ResponseState) rather than an
//! error.

use std::time::Duration;
use thiserror::Error;

/// Result type alias for tracking operations.
pub type Result<T, E = TrackerError> = std::result::Result<T, E>;

/// Main error type for tracking operations.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum TrackerError {
    #[error("RPC '{method}' failed: {reason}")]
    Rpc {
        method: &'static str,
        reason: String,
    },

    #[error("transport channel unavailable: {reason}")]
    Channel { reason: String },

    #[error("stream '{stream}' could not be opened: {reason}")]
    StreamOpen {
        stream: &'static str,
        reason: String,
    },

    #[error("stream '{stream}' ended: {reason}")]
    StreamClosed {
        stream: &'static str,
        reason: String,
    },

    #[error("operation timed out after {duration:?}")]
    Timeout { duration: Duration },

    #[error("client is shut down")]
    ShutDown,
}

impl TrackerError {
    /// Whether retrying the operation may succeed.
    ///
    /// Transport-level failures are retryable: the service may come back
    /// and the channel monitor re-establishes streams on recovery.
    pub fn is_retryable(&self) -> bool {
        match self {
            TrackerError::Rpc { .. } => true,
            TrackerError::Channel { .. } => true,
            TrackerError::StreamOpen { .. } => true,
            TrackerError::StreamClosed { .. } => true,
            TrackerError::Timeout { .. } => true,
            TrackerError::ShutDown => false,
        }
    }

    /// Helper constructor for unary RPC failures.
    pub fn rpc(method: &'static str, reason: impl Into<String>) -> Self {
        TrackerError::Rpc { method, reason: reason.into() }
    }

    /// Helper constructor for channel failures.
    pub fn channel(reason: impl Into<String>) -> Self {
        TrackerError::Channel { reason: reason.into() }
    }

    /// Helper constructor for stream-open failures.
    pub fn stream_open(stream: &'static str, reason: impl Into<String>) -> Self {
        TrackerError::StreamOpen { stream, reason: reason.into() }
    }

    /// Helper constructor for streams terminated by the peer or transport.
    pub fn stream_closed(stream: &'static str, reason: impl Into<String>) -> Self {
        TrackerError::StreamClosed { stream, reason: reason.into() }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_traits() {
        fn assert_send_sync_static<T: Send + Sync + 'static>() {}
        assert_send_sync_static::<TrackerError>();

        let error = TrackerError::rpc("GetTrackingDevices", "unavailable");
        let _: &dyn std::error::Error = &error;
    }

    #[test]
    fn retryability_classification() {
        assert!(TrackerError::channel("down").is_retryable());
        assert!(TrackerError::stream_open("device-data", "refused").is_retryable());
        assert!(!TrackerError::ShutDown.is_retryable());
    }

    #[test]
    fn messages_carry_context() {
        let error = TrackerError::rpc("SetBaseStationMotorRunning", "deadline exceeded");
        let message = error.to_string();
        assert!(message.contains("SetBaseStationMotorRunning"));
        assert!(message.contains("deadline exceeded"));
    }
}
