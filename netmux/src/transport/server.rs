//! Daemon side of the socket.

use nix::sys::stat::{fchmodat, stat, FchmodatFlags, Mode};
use std::fs::DirBuilder;
use std::io::ErrorKind as IoErrorKind;
use std::os::unix::fs::DirBuilderExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::{debug, error, info, info_span, warn, Instrument};
use uuid::Uuid;

use super::protocol::{socket_path, CniRequest, Response, MAX_MESSAGE_BYTES};
use crate::engine::DelegationEngine;
use crate::error::{Error, Result};
use crate::readiness::ReadinessGate;
use crate::types::Command;

/// Makes sure the socket directory exists and only its owner can write to it.
///
/// A missing directory is created with mode 0700. An existing one is accepted
/// unless group or others may write to it.
pub fn filesystem_pre_requirements(dir: &Path) -> Result<()> {
    match std::fs::metadata(dir) {
        Ok(meta) => {
            if !meta.is_dir() {
                return Err(Error::Transport(format!("{} is not a directory", dir.display())));
            }
            let st = stat(dir).map_err(std::io::Error::from)?;
            let mode = Mode::from_bits_truncate(st.st_mode);
            if mode.intersects(Mode::S_IWGRP | Mode::S_IWOTH) {
                return Err(Error::Transport(format!(
                    "socket directory {} is writable by group or others (mode {:o})",
                    dir.display(),
                    st.st_mode & 0o777
                )));
            }
            Ok(())
        }
        Err(err) if err.kind() == IoErrorKind::NotFound => {
            DirBuilder::new().recursive(true).mode(0o700).create(dir)?;
            debug!("Created socket directory {}", dir.display());
            Ok(())
        }
        Err(err) => Err(err.into()),
    }
}

/// Accepts shim connections and runs each request through the engine.
pub struct Server {
    engine: Arc<DelegationEngine>,
    gate: Option<Arc<ReadinessGate>>,
    socket_dir: PathBuf,
}

impl Server {
    pub fn new(engine: Arc<DelegationEngine>, socket_dir: impl Into<PathBuf>) -> Self {
        Self {
            engine,
            gate: None,
            socket_dir: socket_dir.into(),
        }
    }

    /// Holds ADD requests back until the gate opens.
    #[must_use]
    pub fn with_readiness_gate(mut self, gate: Arc<ReadinessGate>) -> Self {
        self.gate = Some(gate);
        self
    }

    pub fn socket_path(&self) -> PathBuf {
        socket_path(&self.socket_dir)
    }

    /// Prepares the socket directory and binds a fresh socket, replacing a stale one.
    pub fn bind(&self) -> Result<UnixListener> {
        filesystem_pre_requirements(&self.socket_dir)?;

        let path = self.socket_path();
        match std::fs::remove_file(&path) {
            Ok(()) => debug!("Removed stale socket {}", path.display()),
            Err(err) if err.kind() == IoErrorKind::NotFound => {}
            Err(err) => return Err(err.into()),
        }

        let listener = UnixListener::bind(&path)?;
        fchmodat(
            None,
            &path,
            Mode::S_IRUSR | Mode::S_IWUSR,
            FchmodatFlags::FollowSymlink,
        )
        .map_err(std::io::Error::from)?;

        info!("Listening on {}", path.display());
        Ok(listener)
    }

    /// Serves until `shutdown` flips to true, then drains in-flight requests.
    pub async fn serve(
        self: Arc<Self>,
        listener: UnixListener,
        mut shutdown: watch::Receiver<bool>,
    ) -> Result<()> {
        let mut in_flight = JoinSet::new();

        loop {
            tokio::select! {
                accepted = listener.accept() => match accepted {
                    Ok((stream, _)) => {
                        let server = Arc::clone(&self);
                        let span = info_span!("request", id = %Uuid::new_v4());
                        in_flight.spawn(
                            async move {
                                if let Err(err) = server.handle_connection(stream).await {
                                    warn!("Connection failed: {}", err);
                                }
                            }
                            .instrument(span),
                        );
                    }
                    Err(err) => warn!("Accept failed: {}", err),
                },
                Some(_) = in_flight.join_next(), if !in_flight.is_empty() => {}
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        info!("Shutting down, {} requests in flight", in_flight.len());
        drop(listener);
        while in_flight.join_next().await.is_some() {}

        let path = self.socket_path();
        if let Err(err) = std::fs::remove_file(&path) {
            if err.kind() != IoErrorKind::NotFound {
                warn!("Failed to remove socket {}: {}", path.display(), err);
            }
        }
        Ok(())
    }

    async fn handle_connection(&self, stream: UnixStream) -> Result<()> {
        let (reader, mut writer) = stream.into_split();
        let mut reader = BufReader::new(reader).take(MAX_MESSAGE_BYTES as u64);

        let mut line = String::new();
        reader.read_line(&mut line).await?;

        let response = match CniRequest::from_json(&line) {
            Ok(request) => self.process(request).await,
            Err(err) => {
                warn!("Malformed request: {}", err);
                Response::error(&Error::Transport(format!("malformed request: {}", err)))
            }
        };

        writer.write_all(response.to_json_line()?.as_bytes()).await?;
        writer.flush().await?;
        writer.shutdown().await?;
        Ok(())
    }

    /// Runs one request to completion.
    pub async fn process(&self, request: CniRequest) -> Response {
        let bound = request.timeout();
        let ctx = request.into_context();
        info!(
            command = %ctx.command,
            container_id = %ctx.container_id,
            netns = %ctx.netns,
            "Handling request"
        );

        if ctx.command == Command::Add {
            if let Some(gate) = &self.gate {
                if let Err(err) = gate.admit(bound).await {
                    error!("{}", err);
                    return Response::error(&err);
                }
            }
        }

        match self.engine.handle(&ctx).await {
            Ok(result) => Response::ok(result),
            Err(err) => {
                error!(command = %ctx.command, container_id = %ctx.container_id, "{}", err);
                Response::error(&err)
            }
        }
    }
}
