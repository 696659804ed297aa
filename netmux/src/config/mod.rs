use anyhow::Context;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{Error, Result};
use crate::resolver::{DelegateSource, IsolationPolicy};
use crate::types::DEFAULT_CNI_VERSION;

/// Plugin type this meta-plugin is installed under
pub const PLUGIN_TYPE: &str = "netmux";

/// Default directory holding the daemon socket
pub const DEFAULT_SOCKET_DIR: &str = "/run/netmux";

/// Default location of the daemon configuration file
pub const DEFAULT_CONFIG_PATH: &str = "/etc/netmux/daemon.json";

/// Configuration for the netmux daemon
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DaemonConfig {
    /// Directory holding the daemon socket
    pub socket_dir: PathBuf,
    /// Directories searched for delegate plugin binaries
    pub cni_bin_dirs: Vec<PathBuf>,
    /// Directory searched for configuration files by network name
    pub cni_conf_dir: PathBuf,
    /// Root of the on-disk cluster store
    pub store_dir: PathBuf,
    /// Namespace holding the cluster default network definitions
    pub system_namespace: String,
    /// Definition name of the cluster default network
    pub cluster_network: Option<String>,
    /// Definitions attached after the cluster default network
    pub default_networks: Vec<String>,
    /// Confine pods to networks of their own namespace
    pub namespace_isolation: bool,
    /// Namespaces any pod may reference when isolation is on
    pub global_namespaces: Vec<String>,
    /// File whose presence signals the default network is ready
    pub readiness_indicator_file: Option<PathBuf>,
    /// How long to wait for the readiness indicator
    pub readiness_timeout_secs: u64,
    /// Poll interval for the readiness indicator
    pub readiness_poll_interval_ms: u64,
    /// Wait for the readiness indicator before every ADD, not only the first
    pub readiness_check_every_add: bool,
    /// Upper bound for a single delegate process
    pub delegate_timeout_secs: Option<u64>,
    /// CNI version of aggregated results
    pub cni_version: String,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            socket_dir: PathBuf::from(DEFAULT_SOCKET_DIR),
            cni_bin_dirs: vec![PathBuf::from("/opt/cni/bin")],
            cni_conf_dir: PathBuf::from("/etc/cni/net.d"),
            store_dir: PathBuf::from("/var/lib/netmux"),
            system_namespace: "kube-system".to_string(),
            cluster_network: None,
            default_networks: Vec::new(),
            namespace_isolation: false,
            global_namespaces: vec!["default".to_string(), "kube-system".to_string()],
            readiness_indicator_file: None,
            readiness_timeout_secs: 600,
            readiness_poll_interval_ms: 1000,
            readiness_check_every_add: false,
            delegate_timeout_secs: None,
            cni_version: DEFAULT_CNI_VERSION.to_string(),
        }
    }
}

impl DaemonConfig {
    /// Load the daemon configuration from a JSON file
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let bytes = fs::read(path)
            .with_context(|| format!("Failed to read daemon config {}", path.display()))?;
        let config: DaemonConfig = serde_json::from_slice(&bytes)
            .with_context(|| format!("Failed to parse daemon config {}", path.display()))?;

        if config.cni_bin_dirs.is_empty() {
            anyhow::bail!("At least one CNI bin directory is required");
        }
        if config.readiness_poll_interval_ms == 0 {
            anyhow::bail!("Readiness poll interval must be positive");
        }

        Ok(config)
    }

    /// Save configuration to a file
    pub fn save(&self, path: &Path) -> anyhow::Result<()> {
        let json = serde_json::to_string_pretty(self)?;
        fs::write(path, json)
            .with_context(|| format!("Failed to write daemon config {}", path.display()))?;
        Ok(())
    }

    pub fn isolation_policy(&self) -> IsolationPolicy {
        IsolationPolicy::new(self.namespace_isolation, self.global_namespaces.clone())
    }

    /// Cluster default delegates named by this configuration
    pub fn cluster_defaults(&self) -> Vec<DelegateSource> {
        self.cluster_network
            .iter()
            .chain(self.default_networks.iter())
            .cloned()
            .map(DelegateSource::Definition)
            .collect()
    }

    pub fn readiness_timeout(&self) -> Duration {
        Duration::from_secs(self.readiness_timeout_secs)
    }

    pub fn readiness_poll_interval(&self) -> Duration {
        Duration::from_millis(self.readiness_poll_interval_ms)
    }

    pub fn delegate_timeout(&self) -> Option<Duration> {
        self.delegate_timeout_secs.map(Duration::from_secs)
    }
}

/// Network configuration handed to the shim by the container runtime
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetConf {
    /// CNI specification version
    #[serde(rename = "cniVersion", default)]
    pub cni_version: String,
    /// Name of the network
    pub name: String,
    /// Type of CNI plugin
    #[serde(rename = "type")]
    pub plugin_type: String,
    /// Directory holding the daemon socket
    #[serde(rename = "socketDir", default, skip_serializing_if = "Option::is_none")]
    pub socket_dir: Option<PathBuf>,
    /// Inline cluster default delegates
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub delegates: Vec<Value>,
    /// Definition name of the cluster default network
    #[serde(rename = "clusterNetwork", default, skip_serializing_if = "Option::is_none")]
    pub cluster_network: Option<String>,
    /// Definitions attached after the cluster default network
    #[serde(rename = "defaultNetworks", default, skip_serializing_if = "Vec::is_empty")]
    pub default_networks: Vec<String>,
    /// Caller's wait bound for the whole invocation
    #[serde(rename = "timeoutSeconds", default, skip_serializing_if = "Option::is_none")]
    pub timeout_seconds: Option<u64>,
}

impl NetConf {
    /// Parse NetConf from bytes
    pub fn parse(bytes: &[u8]) -> Result<Self> {
        let conf: NetConf = serde_json::from_slice(bytes)
            .map_err(|e| Error::Config(format!("failed to parse network configuration: {}", e)))?;

        if conf.name.is_empty() {
            return Err(Error::Config("network name is required".into()));
        }

        for (idx, delegate) in conf.delegates.iter().enumerate() {
            if delegate.get("type").and_then(Value::as_str).is_none()
                && delegate.get("plugins").is_none()
            {
                return Err(Error::Config(format!("delegate {} has no plugin type", idx)));
            }
        }

        Ok(conf)
    }

    /// Socket directory, falling back to the default
    pub fn socket_dir(&self) -> PathBuf {
        self.socket_dir
            .clone()
            .unwrap_or_else(|| PathBuf::from(DEFAULT_SOCKET_DIR))
    }

    /// Cluster default delegates this configuration names, if any
    pub fn cluster_defaults(&self) -> Option<Vec<DelegateSource>> {
        if !self.delegates.is_empty() {
            return Some(
                self.delegates
                    .iter()
                    .cloned()
                    .map(DelegateSource::Inline)
                    .collect(),
            );
        }
        let cluster_network = self.cluster_network.as_ref()?;
        Some(
            std::iter::once(cluster_network)
                .chain(self.default_networks.iter())
                .cloned()
                .map(DelegateSource::Definition)
                .collect(),
        )
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout_seconds.map(Duration::from_secs)
    }
}
