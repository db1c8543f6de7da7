//! Error taxonomy for the handoff protocol.

use std::io;

/// Result alias used throughout the crate.
pub type Result<T, E = HandoffError> = std::result::Result<T, E>;

/// Errors raised while encoding, decoding, relaunching or signalling.
#[derive(Debug, thiserror::Error)]
pub enum HandoffError {
    /// A handoff variable is absent or does not parse as its expected type.
    #[error("Handoff variable {name} is missing or malformed")]
    MissingVariable { name: String },

    /// The inherited descriptor is not a listening socket of the expected kind.
    #[error("Inherited fd {fd} is not a usable listener: {reason}")]
    TypeMismatch { fd: i32, reason: String },

    /// The encoded parent pid is not our actual parent.
    #[error("Handoff parent pid is {encoded} but actual parent is {actual}")]
    ParentMismatch { encoded: u32, actual: u32 },

    /// The executable, working directory or listener address could not be resolved.
    #[error("Failed to resolve {what}: {source}")]
    LookupFailure {
        what: &'static str,
        #[source]
        source: io::Error,
    },

    /// The OS refused to create the child process.
    #[error("Failed to spawn child process: {0}")]
    SpawnFailure(#[source] io::Error),

    /// The termination signal could not be delivered.
    #[error("Failed to signal pid {pid}: {source}")]
    DeliveryError {
        pid: u32,
        #[source]
        source: io::Error,
    },

    /// Installing a signal handler failed.
    #[error("Failed to register {signal} handler: {source}")]
    SignalRegistration {
        signal: &'static str,
        #[source]
        source: io::Error,
    },

    /// The signal source stopped delivering signals.
    #[error("Signal stream closed")]
    SignalStreamClosed,
}

impl HandoffError {
    /// True for the decode errors that mean "this is not a valid restart child".
    ///
    /// Callers should fall back to a cold start (bind a fresh listener) rather
    /// than trust a partial or forged handoff.
    pub fn is_handoff_rejection(&self) -> bool {
        matches!(
            self,
            Self::MissingVariable { .. } | Self::TypeMismatch { .. } | Self::ParentMismatch { .. }
        )
    }

    /// True when a relaunch attempt failed. The listener is unaffected and the
    /// calling process may keep serving.
    pub fn is_relaunch_failure(&self) -> bool {
        matches!(self, Self::LookupFailure { .. } | Self::SpawnFailure(_))
    }

    pub(crate) fn missing(name: &str) -> Self {
        Self::MissingVariable {
            name: name.to_string(),
        }
    }

    pub(crate) fn mismatch(fd: i32, reason: impl Into<String>) -> Self {
        Self::TypeMismatch {
            fd,
            reason: reason.into(),
        }
    }
}
