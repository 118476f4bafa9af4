//! Unified error handling for botherd.
//!
//! Containment policy: errors inside handler code never propagate past the
//! dispatch/scheduler boundary; only configuration and trigger-collision
//! errors at load time may abort startup of the affected unit. User-visible
//! failures stay short and generic, detail goes to the log.

use crate::config::ConfigError;
use crate::store::StoreError;
use crate::transport::TransportError;
use thiserror::Error;

// ============================================================================
// Supervisor errors (network lifecycle)
// ============================================================================

/// Errors from starting or stopping a network session.
#[derive(Debug, Error)]
pub enum SupervisorError {
    /// A session for this network already exists.
    #[error("already connected to network '{0}'")]
    AlreadyActive(String),

    /// No settings file exists for this network.
    #[error("no settings found for network '{0}'")]
    UnknownConfiguration(String),

    /// No session exists for this network.
    #[error("not connected to network '{0}'")]
    UnknownNetwork(String),

    /// Settings exist but could not be read or parsed.
    #[error("invalid settings for network '{network}': {source}")]
    Config {
        network: String,
        #[source]
        source: ConfigError,
    },

    /// The transport failed to establish the connection.
    #[error("failed to connect to network '{network}': {source}")]
    Connect {
        network: String,
        #[source]
        source: TransportError,
    },
}

impl SupervisorError {
    /// Static error code for log labeling.
    #[inline]
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::AlreadyActive(_) => "already_active",
            Self::UnknownConfiguration(_) => "unknown_configuration",
            Self::UnknownNetwork(_) => "unknown_network",
            Self::Config { .. } => "config_error",
            Self::Connect { .. } => "connect_error",
        }
    }
}

// ============================================================================
// Registry errors (handler load)
// ============================================================================

/// Errors that fail the registry load as a whole.
#[derive(Debug, Error)]
pub enum RegistryError {
    /// A handler declared no triggers.
    #[error("handler '{0}' declares no triggers")]
    EmptyTriggers(&'static str),

    /// Two handlers claimed the same trigger. Ambiguous routing is never
    /// silently tolerated, so the whole load fails.
    #[error("trigger '{trigger}' is claimed by both '{first}' and '{second}'")]
    DuplicateTrigger {
        trigger: String,
        first: &'static str,
        second: &'static str,
    },
}

/// Failure of one handler's one-time initialization. Disables that handler;
/// the rest of the load continues.
#[derive(Debug, Error)]
pub enum HandlerLoadError {
    #[error("missing API key '{0}'")]
    MissingApiKey(&'static str),

    #[error("state store: {0}")]
    Store(#[from] StoreError),

    #[error("{0}")]
    Other(String),
}

// ============================================================================
// Handler execution errors
// ============================================================================

/// Errors raised by a handler's execution entry points. Caught at the
/// dispatch/scheduler boundary, never propagated further.
#[derive(Debug, Error)]
pub enum HandlerError {
    /// The originating network has no live session to reply on.
    #[error("no active session for network '{0}'")]
    NoSession(String),

    #[error("transport: {0}")]
    Send(#[from] TransportError),

    #[error("http request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("state store: {0}")]
    Store(#[from] StoreError),

    #[error("{0}")]
    Failed(String),
}

impl HandlerError {
    /// Static error code for log labeling.
    #[inline]
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::NoSession(_) => "no_session",
            Self::Send(_) => "send_error",
            Self::Http(_) => "http_error",
            Self::Store(_) => "store_error",
            Self::Failed(_) => "failed",
        }
    }
}

/// Result type for handler entry points.
pub type HandlerResult = Result<(), HandlerError>;
