//! Delegate plugin execution.
//!
//! A delegate is run through a [`DelegateExecutor`]. [`DelegateDispatcher`]
//! picks the strategy from the resolved plugin type: delegates naming this
//! meta-plugin are refused by [`RecursionGuard`], everything else goes to the
//! direct strategy, normally a [`SubprocessExecutor`].

use async_trait::async_trait;
use serde_json::Value;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::process::Command as Process;
use tracing::{debug, info, warn};

use crate::attachment::ResolvedDelegateConfig;
use crate::error::{Error, Result, CNI_CODE_UNKNOWN_CONTAINER};
use crate::types::{CniError, CniResult, Command, InvocationContext};

/// Messages delegates use to say the attachment is already gone.
const ABSENT_MARKERS: &[&str] = &[
    "not found",
    "no such file",
    "no such device",
    "does not exist",
    "already deleted",
];

/// Runs one delegate for one command.
#[async_trait]
pub trait DelegateExecutor: Send + Sync {
    /// Returns the delegate's result for ADD and `None` for DEL and CHECK.
    async fn execute(
        &self,
        command: Command,
        delegate: &ResolvedDelegateConfig,
        ctx: &InvocationContext,
    ) -> Result<Option<CniResult>>;
}

/// Whether a DEL failure only says the attachment is already absent.
pub fn is_already_absent(err: &Error) -> bool {
    match err {
        Error::DelegateFailure {
            code,
            message,
            stderr,
            ..
        } => {
            if *code == Some(CNI_CODE_UNKNOWN_CONTAINER) {
                return true;
            }
            let mentions_absent = |text: &str| {
                let lower = text.to_lowercase();
                ABSENT_MARKERS.iter().any(|m| lower.contains(m))
            };
            mentions_absent(message.as_str()) || stderr.as_deref().is_some_and(mentions_absent)
        }
        _ => false,
    }
}

/// Selects the execution strategy for a delegate by its plugin type.
pub struct DelegateDispatcher {
    direct: Arc<dyn DelegateExecutor>,
    guard: RecursionGuard,
}

impl DelegateDispatcher {
    /// `self_type` is the plugin type this meta-plugin is installed as.
    pub fn new(direct: Arc<dyn DelegateExecutor>, self_type: impl Into<String>) -> Self {
        Self {
            direct,
            guard: RecursionGuard {
                self_type: self_type.into(),
            },
        }
    }

    fn select(&self, delegate: &ResolvedDelegateConfig) -> &dyn DelegateExecutor {
        if self.guard.matches(delegate) {
            &self.guard
        } else {
            self.direct.as_ref()
        }
    }
}

#[async_trait]
impl DelegateExecutor for DelegateDispatcher {
    async fn execute(
        &self,
        command: Command,
        delegate: &ResolvedDelegateConfig,
        ctx: &InvocationContext,
    ) -> Result<Option<CniResult>> {
        self.select(delegate).execute(command, delegate, ctx).await
    }
}

/// Refuses delegates that would invoke this meta-plugin again.
pub struct RecursionGuard {
    self_type: String,
}

impl RecursionGuard {
    fn matches(&self, delegate: &ResolvedDelegateConfig) -> bool {
        delegate.plugin_types().iter().any(|t| *t == self.self_type)
    }
}

#[async_trait]
impl DelegateExecutor for RecursionGuard {
    async fn execute(
        &self,
        _command: Command,
        _delegate: &ResolvedDelegateConfig,
        _ctx: &InvocationContext,
    ) -> Result<Option<CniResult>> {
        Err(Error::Recursion {
            plugin_type: self.self_type.clone(),
        })
    }
}

/// Runs delegate binaries over the CNI stdin/stdout/environment protocol.
#[derive(Debug, Clone)]
pub struct SubprocessExecutor {
    bin_dirs: Vec<PathBuf>,
    timeout: Option<Duration>,
}

impl SubprocessExecutor {
    pub fn new(bin_dirs: Vec<PathBuf>) -> Self {
        Self {
            bin_dirs,
            timeout: None,
        }
    }

    /// Bounds every single plugin process.
    #[must_use]
    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    /// Locates a plugin binary in CNI_PATH, then in the configured directories.
    fn find_plugin(&self, plugin_type: &str, ctx: &InvocationContext) -> Option<PathBuf> {
        if plugin_type.contains('/') {
            return None;
        }
        ctx.path
            .split(':')
            .filter(|p| !p.is_empty())
            .map(PathBuf::from)
            .chain(self.bin_dirs.iter().cloned())
            .map(|dir| dir.join(plugin_type))
            .find(|candidate| candidate.is_file())
    }

    /// Runs one plugin process and returns its stdout.
    async fn run_plugin(
        &self,
        command: Command,
        plugin_type: &str,
        conf: &Value,
        ifname: &str,
        ctx: &InvocationContext,
    ) -> Result<Vec<u8>> {
        let failure = |code: Option<u32>, message: String, stderr: Option<String>| {
            Error::DelegateFailure {
                plugin: plugin_type.to_string(),
                command,
                ifname: ifname.to_string(),
                code,
                message,
                stderr,
            }
        };

        let binary = self.find_plugin(plugin_type, ctx).ok_or_else(|| {
            failure(
                None,
                format!(
                    "failed to find plugin binary '{}' in {:?}",
                    plugin_type,
                    self.search_path(ctx)
                ),
                None,
            )
        })?;

        let stdin_data = serde_json::to_vec(conf)?;
        debug!(plugin = %plugin_type, ifname = %ifname, "Executing {} {}", command, binary.display());

        let mut child = Process::new(&binary)
            .env("CNI_COMMAND", command.as_str())
            .env("CNI_CONTAINERID", &ctx.container_id)
            .env("CNI_NETNS", &ctx.netns)
            .env("CNI_IFNAME", ifname)
            .env("CNI_ARGS", ctx.cni_args_string())
            .env("CNI_PATH", self.cni_path(ctx))
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| failure(None, format!("failed to start {}: {}", binary.display(), e), None))?;

        if let Some(mut stdin) = child.stdin.take() {
            // plugins may exit without reading their config
            if let Err(err) = stdin.write_all(&stdin_data).await {
                if err.kind() != std::io::ErrorKind::BrokenPipe {
                    return Err(err.into());
                }
            }
        }

        let output = match self.timeout {
            Some(limit) => tokio::time::timeout(limit, child.wait_with_output())
                .await
                .map_err(|_| failure(None, format!("plugin timed out after {:?}", limit), None))??,
            None => child.wait_with_output().await?,
        };

        let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
        let stderr = (!stderr.is_empty()).then_some(stderr);

        if output.status.success() {
            if let Some(text) = &stderr {
                debug!(plugin = %plugin_type, "Plugin stderr: {}", text);
            }
            return Ok(output.stdout);
        }

        let body = serde_json::from_slice::<CniError>(&output.stdout)
            .ok()
            .or_else(|| stderr.as_deref().and_then(|s| serde_json::from_str::<CniError>(s).ok()));
        Err(match body {
            Some(body) => {
                let message = match &body.details {
                    Some(details) if !details.is_empty() => format!("{}: {}", body.msg, details),
                    _ => body.msg,
                };
                failure(Some(body.code), message, stderr)
            }
            None => failure(None, format!("plugin exited with {}", output.status), stderr),
        })
    }

    fn search_path(&self, ctx: &InvocationContext) -> Vec<PathBuf> {
        ctx.path
            .split(':')
            .filter(|p| !p.is_empty())
            .map(PathBuf::from)
            .chain(self.bin_dirs.iter().cloned())
            .collect()
    }

    fn cni_path(&self, ctx: &InvocationContext) -> String {
        self.search_path(ctx)
            .iter()
            .map(|p| p.display().to_string())
            .collect::<Vec<_>>()
            .join(":")
    }

    async fn add(&self, delegate: &ResolvedDelegateConfig, ctx: &InvocationContext) -> Result<CniResult> {
        let mut prev: Option<Value> = None;
        for (plugin_type, mut conf) in plugin_chain(&delegate.config) {
            if let (Some(prev), Some(obj)) = (&prev, conf.as_object_mut()) {
                obj.insert("prevResult".to_string(), prev.clone());
            }
            let stdout = self
                .run_plugin(Command::Add, &plugin_type, &conf, &delegate.ifname, ctx)
                .await?;
            let result: Value = serde_json::from_slice(&stdout).map_err(|e| Error::DelegateFailure {
                plugin: plugin_type.clone(),
                command: Command::Add,
                ifname: delegate.ifname.clone(),
                code: None,
                message: format!("malformed result: {}", e),
                stderr: None,
            })?;
            prev = Some(result);
        }

        let result = prev.unwrap_or(Value::Null);
        serde_json::from_value(result).map_err(|e| Error::DelegateFailure {
            plugin: delegate.plugin_type.clone(),
            command: Command::Add,
            ifname: delegate.ifname.clone(),
            code: None,
            message: format!("malformed result: {}", e),
            stderr: None,
        })
    }

    async fn del(&self, delegate: &ResolvedDelegateConfig, ctx: &InvocationContext) -> Result<()> {
        let mut first_error = None;
        for (plugin_type, conf) in plugin_chain(&delegate.config).into_iter().rev() {
            match self
                .run_plugin(Command::Del, &plugin_type, &conf, &delegate.ifname, ctx)
                .await
            {
                Ok(_) => {}
                Err(err) if is_already_absent(&err) => {
                    debug!(plugin = %plugin_type, ifname = %delegate.ifname, "Attachment already absent: {}", err);
                }
                Err(err) => {
                    warn!(plugin = %plugin_type, ifname = %delegate.ifname, "DEL failed: {}", err);
                    first_error.get_or_insert(err);
                }
            }
        }
        first_error.map_or(Ok(()), Err)
    }

    async fn check(&self, delegate: &ResolvedDelegateConfig, ctx: &InvocationContext) -> Result<()> {
        for (plugin_type, conf) in plugin_chain(&delegate.config) {
            self.run_plugin(Command::Check, &plugin_type, &conf, &delegate.ifname, ctx)
                .await?;
        }
        Ok(())
    }
}

#[async_trait]
impl DelegateExecutor for SubprocessExecutor {
    async fn execute(
        &self,
        command: Command,
        delegate: &ResolvedDelegateConfig,
        ctx: &InvocationContext,
    ) -> Result<Option<CniResult>> {
        match command {
            Command::Add => {
                let result = self.add(delegate, ctx).await?;
                info!(plugin = %delegate.plugin_type, ifname = %delegate.ifname, "Delegate ADD succeeded");
                Ok(Some(result))
            }
            Command::Del => self.del(delegate, ctx).await.map(|_| None),
            Command::Check => self.check(delegate, ctx).await.map(|_| None),
            Command::Version => Err(Error::Config(
                "VERSION is answered locally and never delegated".into(),
            )),
        }
    }
}

/// Splits a configuration into the plugin configs to run, in forward order.
///
/// Plugins of a configuration list inherit the list's `name` and `cniVersion`.
fn plugin_chain(config: &Value) -> Vec<(String, Value)> {
    let plugin_type = |conf: &Value| {
        conf.get("type")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string()
    };

    let Some(plugins) = config.get("plugins").and_then(Value::as_array) else {
        return vec![(plugin_type(config), config.clone())];
    };

    plugins
        .iter()
        .map(|plugin| {
            let mut conf = plugin.clone();
            if let Some(obj) = conf.as_object_mut() {
                for key in ["name", "cniVersion"] {
                    if let Some(value) = config.get(key) {
                        obj.insert(key.to_string(), value.clone());
                    }
                }
            }
            (plugin_type(&conf), conf)
        })
        .collect()
}
