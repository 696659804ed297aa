//! Shim side of the socket.

use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::UnixStream;
use tokio::time::timeout;

use super::protocol::{socket_path, CniRequest, Response, MAX_MESSAGE_BYTES};
use crate::error::{Error, Result};

/// Default bound on a whole request, long enough to cover a readiness wait.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(900);

/// One connection per request: connect, send a line, read a line.
#[derive(Debug, Clone)]
pub struct Client {
    socket_path: PathBuf,
    timeout: Duration,
}

impl Client {
    #[must_use]
    pub fn new(socket_dir: &Path) -> Self {
        Self {
            socket_path: socket_path(socket_dir),
            timeout: DEFAULT_TIMEOUT,
        }
    }

    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }

    /// Sends `request` and returns the daemon's response, success or error.
    pub async fn send(&self, request: &CniRequest) -> Result<Response> {
        let stream = timeout(self.timeout, UnixStream::connect(&self.socket_path))
            .await
            .map_err(|_| {
                Error::Transport(format!(
                    "timed out connecting to {}",
                    self.socket_path.display()
                ))
            })?
            .map_err(|e| {
                Error::Transport(format!(
                    "failed to connect to {}: {}",
                    self.socket_path.display(),
                    e
                ))
            })?;

        let (reader, mut writer) = stream.into_split();
        let mut reader = BufReader::new(reader).take(MAX_MESSAGE_BYTES as u64);

        writer
            .write_all(request.to_json_line()?.as_bytes())
            .await
            .map_err(|e| Error::Transport(format!("failed to send request: {}", e)))?;
        writer.flush().await?;

        let mut line = String::new();
        timeout(self.timeout, reader.read_line(&mut line))
            .await
            .map_err(|_| Error::Transport(format!("no response within {:?}", self.timeout)))?
            .map_err(|e| Error::Transport(format!("failed to read response: {}", e)))?;

        if line.trim().is_empty() {
            return Err(Error::Transport(
                "daemon closed the connection without a response".into(),
            ));
        }

        Response::from_json(&line).map_err(|e| Error::Transport(format!("malformed response: {}", e)))
    }
}
