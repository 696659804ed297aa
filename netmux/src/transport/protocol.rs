//! Wire protocol between the shim and the daemon.
//!
//! - **Transport**: Unix domain socket
//! - **Encoding**: JSON
//! - **Framing**: newline-delimited, one request and one response per connection
//!
//! ```text
//! Shim                              Daemon
//!   |  {"command":"ADD",...}\n        |
//!   |-------------------------------->|
//!   |  {"status":"ok",...}\n          |
//!   |<--------------------------------|
//! ```

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{Error, ErrorKind};
use crate::types::{parse_cni_args, Command, InvocationContext};

// =============================================================================
// Constants
// =============================================================================

/// File name of the daemon socket inside the socket directory.
pub const SOCKET_NAME: &str = "netmux.sock";

/// Largest request or response line accepted.
pub const MAX_MESSAGE_BYTES: usize = 4 * 1024 * 1024;

/// Full path of the daemon socket inside `dir`.
pub fn socket_path(dir: &Path) -> PathBuf {
    dir.join(SOCKET_NAME)
}

// =============================================================================
// Request
// =============================================================================

/// One CNI invocation forwarded by the shim.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CniRequest {
    pub command: Command,
    pub container_id: String,
    #[serde(default)]
    pub netns: String,
    #[serde(default)]
    pub ifname: String,
    /// Raw CNI_ARGS string.
    #[serde(default)]
    pub args: String,
    /// Raw CNI_PATH string.
    #[serde(default)]
    pub path: String,
    /// Network configuration read from the shim's stdin.
    #[serde(default)]
    pub stdin: String,
    /// How long the caller is willing to wait.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
}

impl CniRequest {
    pub fn timeout(&self) -> Option<Duration> {
        self.timeout_ms.map(Duration::from_millis)
    }

    /// Builds the daemon-side invocation context, anchoring the deadline at `now`.
    pub fn into_context(self) -> InvocationContext {
        let deadline = self
            .timeout()
            .map(|timeout| tokio::time::Instant::now() + timeout);
        InvocationContext {
            command: self.command,
            container_id: self.container_id,
            netns: self.netns,
            ifname: self.ifname,
            args: parse_cni_args(&self.args),
            path: self.path,
            stdin_data: self.stdin.into_bytes(),
            deadline,
        }
    }

    /// Serializes the request to a JSON line (with newline).
    pub fn to_json_line(&self) -> Result<String, serde_json::Error> {
        let mut json = serde_json::to_string(self)?;
        json.push('\n');
        Ok(json)
    }

    pub fn from_json(s: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(s.trim())
    }
}

// =============================================================================
// Response
// =============================================================================

/// Daemon answer to a [`CniRequest`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum Response {
    /// Success, with the CNI result for ADD and VERSION.
    Ok {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        result: Option<Value>,
    },
    /// Failure.
    Error(ErrorPayload),
}

/// Error payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorPayload {
    pub kind: ErrorKind,
    /// CNI error code the shim reports.
    pub code: u32,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
}

impl Response {
    #[must_use]
    pub fn ok(result: Option<Value>) -> Self {
        Self::Ok { result }
    }

    #[must_use]
    pub fn error(err: &Error) -> Self {
        Self::Error(ErrorPayload {
            kind: err.kind(),
            code: err.cni_code(),
            message: err.to_string(),
            details: err.details(),
        })
    }

    #[must_use]
    pub fn is_ok(&self) -> bool {
        matches!(self, Self::Ok { .. })
    }

    /// Success payload, or the remote error.
    pub fn into_result(self) -> crate::Result<Option<Value>> {
        match self {
            Self::Ok { result } => Ok(result),
            Self::Error(payload) => Err(Error::Remote {
                kind: payload.kind,
                code: payload.code,
                message: payload.message,
                details: payload.details,
            }),
        }
    }

    /// Serializes the response to a JSON line (with newline).
    pub fn to_json_line(&self) -> Result<String, serde_json::Error> {
        let mut json = serde_json::to_string(self)?;
        json.push('\n');
        Ok(json)
    }

    pub fn from_json(s: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(s.trim())
    }
}
