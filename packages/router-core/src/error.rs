//! Centralized error types for the router core.
//!
//! Follows the error-kind taxonomy of the data-plane error design: most
//! conditions here are *not* meant to propagate as a `Result` out of the
//! real-time path (malformed packets, buffer pressure, under/overrun are
//! counters, never errors) - `RouterError` exists for the control plane:
//! configuration rejection, transport setup failure, and fatal startup
//! conditions.

use thiserror::Error;

/// Trait for error types that provide a machine-readable error code.
pub trait ErrorCode {
    /// Returns a stable, machine-readable error code.
    fn code(&self) -> &'static str;
}

/// Application-wide error type for the router core's control plane.
#[derive(Debug, Error)]
pub enum RouterError {
    /// `apply_state` referenced a sink or path that does not exist, or a
    /// format combination the engine cannot reconcile.
    #[error("configuration rejected: {0}")]
    Configuration(String),

    /// A sink's transport (socket bind, device open) could not be
    /// established.
    #[error("transport setup failed: {0}")]
    Transport(String),

    /// A WebRTC listener could not be negotiated within its deadline.
    #[error("webrtc negotiation failed: {0}")]
    WebRtc(String),

    /// Referenced an id (sink, path, cursor, listener) that is not live.
    #[error("not found: {0}")]
    NotFound(String),

    /// Malformed wire data that could not even be parsed into a packet
    /// (surfaced only for the narrow control-plane APIs that accept raw
    /// bytes directly, e.g. `export_timeshift` replay tooling - receivers
    /// themselves never propagate this, they drop and count).
    #[error("malformed packet: {0}")]
    MalformedPacket(String),

    /// Unrecoverable condition: out of memory, thread spawn failure. The
    /// caller should abort the engine and let the external supervisor
    /// restart it.
    #[error("fatal engine error: {0}")]
    Fatal(String),
}

impl ErrorCode for RouterError {
    fn code(&self) -> &'static str {
        match self {
            Self::Configuration(_) => "configuration_error",
            Self::Transport(_) => "transport_error",
            Self::WebRtc(_) => "webrtc_error",
            Self::NotFound(_) => "not_found",
            Self::MalformedPacket(_) => "malformed_packet",
            Self::Fatal(_) => "fatal_error",
        }
    }
}

/// Convenient `Result` alias for the router core's fallible APIs.
pub type RouterResult<T> = Result<T, RouterError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn configuration_error_has_stable_code() {
        let err = RouterError::Configuration("no such sink".into());
        assert_eq!(err.code(), "configuration_error");
    }

    #[test]
    fn fatal_error_has_stable_code() {
        let err = RouterError::Fatal("oom".into());
        assert_eq!(err.code(), "fatal_error");
    }
}
