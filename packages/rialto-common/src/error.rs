//! Centralized error types for Rialto.
//!
//! Mirrors the error-kind taxonomy from the design's error-handling policy:
//! configuration failures abort construction, transport failures tear down a
//! connection, and the remaining kinds are recoverable and reported to the
//! calling verb without poisoning the channel.

use thiserror::Error;

/// Trait for error types that provide a stable, machine-readable code.
///
/// Useful for logging and for any structured diagnostics a caller wants to
/// key on, without matching on the full `Display` string.
pub trait ErrorCode {
    /// Returns a machine-readable error code.
    fn code(&self) -> &'static str;
}

/// Crate-wide error type for Rialto's client/server core.
#[derive(Debug, Error)]
pub enum RialtoError {
    /// Missing/malformed environment variable or CLI argument. Only ever
    /// returned at startup, and aborts construction of the failing
    /// component.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// Channel disconnected, socket I/O failure, or RPC controller failure.
    /// Tears down the session's connection and fails all pending closures.
    #[error("transport error: {0}")]
    Transport(String),

    /// Metadata parse failure or version mismatch. The affected frame batch
    /// is dropped; the verb that triggered the parse returns failure.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Operation rejected by a session's state machine (e.g. `setPosition`
    /// while IDLE).
    #[error("state error: {0}")]
    State(String),

    /// mmap/fd acquisition failure. Demotes the shared-memory region to
    /// unmapped.
    #[error("resource error: {0}")]
    Resource(String),

    /// `FrameWriter` has no room left in its partition (`NO_SPACE`). The
    /// caller must wait for a new `NeedData` batch.
    #[error("capacity error: no space left in partition")]
    Capacity,
}

impl ErrorCode for RialtoError {
    fn code(&self) -> &'static str {
        match self {
            Self::Configuration(_) => "configuration_error",
            Self::Transport(_) => "transport_error",
            Self::Protocol(_) => "protocol_error",
            Self::State(_) => "state_error",
            Self::Resource(_) => "resource_error",
            Self::Capacity => "capacity_error",
        }
    }
}

impl RialtoError {
    /// Returns `true` for kinds that must not cross session boundaries or
    /// poison the channel (Protocol, State, Capacity per §7 policy).
    #[must_use]
    pub fn is_recoverable(&self) -> bool {
        matches!(self, Self::Protocol(_) | Self::State(_) | Self::Capacity)
    }
}

/// Convenient result alias for Rialto core operations.
pub type RialtoResult<T> = Result<T, RialtoError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn configuration_error_has_stable_code() {
        let err = RialtoError::Configuration("missing RIALTO_SOCKET_FD".into());
        assert_eq!(err.code(), "configuration_error");
        assert!(!err.is_recoverable());
    }

    #[test]
    fn recoverable_kinds_are_marked() {
        assert!(RialtoError::Protocol("bad meta_len".into()).is_recoverable());
        assert!(RialtoError::State("setPosition in IDLE".into()).is_recoverable());
        assert!(RialtoError::Capacity.is_recoverable());
    }

    #[test]
    fn transport_and_resource_are_not_recoverable() {
        assert!(!RialtoError::Transport("disconnected".into()).is_recoverable());
        assert!(!RialtoError::Resource("mmap failed".into()).is_recoverable());
    }
}
