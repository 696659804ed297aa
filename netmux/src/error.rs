//! Error types for attachment resolution, delegate execution and transport.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use crate::types::{CniError, Command};

/// Result type alias for netmux operations.
pub type Result<T> = std::result::Result<T, Error>;

/// CNI error code for an invocation of an unknown container.
pub const CNI_CODE_UNKNOWN_CONTAINER: u32 = 3;
/// CNI error code for an I/O failure.
pub const CNI_CODE_IO_FAILURE: u32 = 5;
/// CNI error code for a decoding failure.
pub const CNI_CODE_DECODE_FAILURE: u32 = 6;
/// CNI error code for an invalid network configuration.
pub const CNI_CODE_INVALID_CONFIG: u32 = 7;
/// CNI error code asking the runtime to retry later.
pub const CNI_CODE_TRY_AGAIN_LATER: u32 = 11;

/// Errors that can occur while attaching networks to a sandbox.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    // =========================================================================
    // Resolution Errors
    // =========================================================================
    /// Malformed or contradictory configuration.
    #[error("invalid configuration: {0}")]
    Config(String),

    /// A referenced attachment definition or configuration file does not exist.
    #[error("configuration not found: {0}")]
    ConfigNotFound(String),

    /// The pod referenced a network outside of the namespaces it may use.
    #[error(
        "namespace isolation: pod in namespace '{pod_namespace}' may not reference network '{target_namespace}/{name}'"
    )]
    IsolationViolation {
        pod_namespace: String,
        target_namespace: String,
        name: String,
    },

    /// An attachment requires a device that the pod never claimed.
    #[error("no device of resource class '{class}' is bound to the pod for network '{network}'")]
    DeviceBinding { network: String, class: String },

    // =========================================================================
    // Execution Errors
    // =========================================================================
    /// A delegate plugin failed or produced an unusable result.
    #[error("delegate '{plugin}' {command} failed for interface '{ifname}': {message}")]
    DelegateFailure {
        plugin: String,
        command: Command,
        ifname: String,
        /// CNI error code reported by the delegate, if any.
        code: Option<u32>,
        message: String,
        /// Raw stderr of the delegate process.
        stderr: Option<String>,
    },

    /// Every delegate failed its teardown.
    #[error("teardown failed for all {} delegates: {}", .0.len(), join_errors(.0))]
    TeardownFailed(Vec<Error>),

    /// A delegate names this meta-plugin as its own plugin type.
    #[error("delegate plugin type '{plugin_type}' refers back to this meta-plugin")]
    Recursion { plugin_type: String },

    /// The invocation deadline elapsed.
    #[error("invocation deadline exceeded while {0}")]
    DeadlineExceeded(String),

    // =========================================================================
    // Server Errors
    // =========================================================================
    /// The readiness indicator did not appear in time.
    #[error("readiness indicator {} did not appear within {waited:?}", .path.display())]
    ReadinessTimeout { path: PathBuf, waited: Duration },

    /// Socket unavailable or malformed wire message.
    #[error("transport error: {0}")]
    Transport(String),

    /// Error reported by the server on the far side of the socket.
    #[error("{message}")]
    Remote {
        kind: ErrorKind,
        code: u32,
        message: String,
        details: Option<String>,
    },

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON encoding or decoding error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Wire-level classification of an [`Error`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Config,
    ConfigNotFound,
    IsolationViolation,
    DeviceBinding,
    DelegateFailure,
    Recursion,
    DeadlineExceeded,
    ReadinessTimeout,
    Transport,
    Io,
    Decode,
}

impl ErrorKind {
    /// CNI error code reported to the container runtime for this kind.
    pub fn cni_code(self) -> u32 {
        match self {
            ErrorKind::Config | ErrorKind::ConfigNotFound => CNI_CODE_INVALID_CONFIG,
            ErrorKind::Transport | ErrorKind::Io => CNI_CODE_IO_FAILURE,
            ErrorKind::Decode => CNI_CODE_DECODE_FAILURE,
            ErrorKind::ReadinessTimeout | ErrorKind::DeadlineExceeded => CNI_CODE_TRY_AGAIN_LATER,
            ErrorKind::IsolationViolation => 101,
            ErrorKind::DeviceBinding => 102,
            ErrorKind::DelegateFailure => 103,
            ErrorKind::Recursion => 104,
        }
    }
}

impl Error {
    /// Returns the wire-level kind of this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::Config(_) => ErrorKind::Config,
            Error::ConfigNotFound(_) => ErrorKind::ConfigNotFound,
            Error::IsolationViolation { .. } => ErrorKind::IsolationViolation,
            Error::DeviceBinding { .. } => ErrorKind::DeviceBinding,
            Error::DelegateFailure { .. } | Error::TeardownFailed(_) => ErrorKind::DelegateFailure,
            Error::Recursion { .. } => ErrorKind::Recursion,
            Error::DeadlineExceeded(_) => ErrorKind::DeadlineExceeded,
            Error::ReadinessTimeout { .. } => ErrorKind::ReadinessTimeout,
            Error::Transport(_) => ErrorKind::Transport,
            Error::Remote { kind, .. } => *kind,
            Error::Io(_) => ErrorKind::Io,
            Error::Json(_) => ErrorKind::Decode,
        }
    }

    /// CNI error code for this error. Delegate failures keep the delegate's own code.
    pub fn cni_code(&self) -> u32 {
        match self {
            Error::DelegateFailure { code: Some(code), .. } => *code,
            Error::Remote { code, .. } => *code,
            other => other.kind().cni_code(),
        }
    }

    /// Extra detail for the CNI error body.
    pub fn details(&self) -> Option<String> {
        match self {
            Error::DelegateFailure { stderr, .. } => stderr.clone().filter(|s| !s.trim().is_empty()),
            Error::Remote { details, .. } => details.clone(),
            _ => None,
        }
    }

    /// Converts this error into the CNI error body printed on stdout.
    pub fn to_cni_error(&self, cni_version: &str) -> CniError {
        CniError {
            cni_version: cni_version.to_string(),
            code: self.cni_code(),
            msg: self.to_string(),
            details: self.details(),
        }
    }
}

fn join_errors(errors: &[Error]) -> String {
    errors
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}
