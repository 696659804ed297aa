use itertools::Itertools;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use tokio::time::Instant;

use crate::cluster::PodRef;
use crate::error::Error;

/// CNI versions this meta-plugin can speak.
pub const SUPPORTED_VERSIONS: &[&str] = &["0.3.0", "0.3.1", "0.4.0", "1.0.0"];

/// Default CNI version for results produced by this meta-plugin.
pub const DEFAULT_CNI_VERSION: &str = "1.0.0";

/// CNI_ARGS key carrying the pod namespace.
pub const ARG_POD_NAMESPACE: &str = "K8S_POD_NAMESPACE";
/// CNI_ARGS key carrying the pod name.
pub const ARG_POD_NAME: &str = "K8S_POD_NAME";
/// CNI_ARGS key carrying the pod UID.
pub const ARG_POD_UID: &str = "K8S_POD_UID";

/// CNI command kind
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Command {
    Add,
    Del,
    Check,
    Version,
}

impl Command {
    /// Value of `CNI_COMMAND` for this command
    pub fn as_str(&self) -> &'static str {
        match self {
            Command::Add => "ADD",
            Command::Del => "DEL",
            Command::Check => "CHECK",
            Command::Version => "VERSION",
        }
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Command {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "ADD" => Ok(Command::Add),
            "DEL" => Ok(Command::Del),
            "CHECK" => Ok(Command::Check),
            "VERSION" => Ok(Command::Version),
            other => Err(Error::Config(format!("unknown CNI command: {}", other))),
        }
    }
}

/// Per-invocation runtime facts. Built once per request and never mutated.
#[derive(Debug, Clone)]
pub struct InvocationContext {
    /// Command kind
    pub command: Command,
    /// Container ID
    pub container_id: String,
    /// Network namespace path
    pub netns: String,
    /// Interface name requested for the primary attachment
    pub ifname: String,
    /// Arguments from CNI_ARGS
    pub args: HashMap<String, String>,
    /// Plugin search path from CNI_PATH
    pub path: String,
    /// Standard input data
    pub stdin_data: Vec<u8>,
    /// Point in time after which the invocation gives up
    pub deadline: Option<Instant>,
}

impl InvocationContext {
    /// Pod identity carried in CNI_ARGS, if the runtime supplied one.
    pub fn pod_ref(&self) -> Option<PodRef> {
        let namespace = self.args.get(ARG_POD_NAMESPACE).filter(|s| !s.is_empty())?;
        let name = self.args.get(ARG_POD_NAME).filter(|s| !s.is_empty())?;
        Some(PodRef {
            namespace: namespace.clone(),
            name: name.clone(),
            uid: self.args.get(ARG_POD_UID).filter(|s| !s.is_empty()).cloned(),
        })
    }

    /// CNI_ARGS re-encoded for a delegate, with keys in a stable order.
    pub fn cni_args_string(&self) -> String {
        self.args
            .iter()
            .sorted()
            .map(|(k, v)| format!("{}={}", k, v))
            .join(";")
    }
}

/// Parse CNI_ARGS string into key-value pairs
pub fn parse_cni_args(args_str: &str) -> HashMap<String, String> {
    let mut args = HashMap::new();

    if !args_str.is_empty() {
        for pair in args_str.split(';') {
            if let Some(idx) = pair.find('=') {
                let key = pair[..idx].to_string();
                let value = pair[idx + 1..].to_string();
                args.insert(key, value);
            }
        }
    }

    args
}

/// Result format shared by CNI 0.3.0 through 1.0.0
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CniResult {
    /// CNI specification version
    #[serde(rename = "cniVersion", default)]
    pub cni_version: String,
    /// Interfaces created
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub interfaces: Option<Vec<Interface>>,
    /// IP configurations
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ips: Option<Vec<IPConfig>>,
    /// Routes to configure
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub routes: Option<Vec<Route>>,
    /// DNS configuration
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dns: Option<DNS>,
}

/// Interface information
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Interface {
    /// Interface name
    pub name: String,
    /// MAC address
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mac: Option<String>,
    /// Sandbox path (network namespace)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sandbox: Option<String>,
}

/// IP configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IPConfig {
    /// Interface index this IP is assigned to
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub interface: Option<usize>,
    /// IP address with prefix length
    pub address: String,
    /// Gateway
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gateway: Option<String>,
}

/// DNS configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DNS {
    /// DNS nameservers
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nameservers: Option<Vec<String>>,
    /// Local domain
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub domain: Option<String>,
    /// DNS search domains
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub search: Option<Vec<String>>,
    /// DNS options
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub options: Option<Vec<String>>,
}

impl DNS {
    /// True when no field carries any value
    pub fn is_empty(&self) -> bool {
        fn blank(v: &Option<Vec<String>>) -> bool {
            v.as_ref().map_or(true, Vec::is_empty)
        }
        blank(&self.nameservers)
            && self.domain.as_deref().map_or(true, str::is_empty)
            && blank(&self.search)
            && blank(&self.options)
    }
}

/// Route configuration
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Route {
    /// Destination CIDR
    pub dst: String,
    /// Gateway for this route
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gw: Option<String>,
}

impl CniResult {
    /// Create a new empty result
    pub fn new(cni_version: &str) -> Self {
        Self {
            cni_version: cni_version.to_string(),
            ..Self::default()
        }
    }

    /// Add an interface to the result and return its index
    pub fn add_interface(&mut self, interface: Interface) -> usize {
        let interfaces = self.interfaces.get_or_insert_with(Vec::new);
        interfaces.push(interface);
        interfaces.len() - 1
    }

    /// Add an IP configuration to the result
    pub fn add_ip(&mut self, ip: IPConfig) {
        self.ips.get_or_insert_with(Vec::new).push(ip);
    }

    /// Add a route to the result
    pub fn add_route(&mut self, route: Route) {
        self.routes.get_or_insert_with(Vec::new).push(route);
    }

    /// Set DNS configuration
    pub fn set_dns(&mut self, dns: DNS) {
        self.dns = Some(dns);
    }

    /// Interfaces as a slice, empty when absent
    pub fn interfaces(&self) -> &[Interface] {
        self.interfaces.as_deref().unwrap_or_default()
    }

    /// IP configurations as a slice, empty when absent
    pub fn ips(&self) -> &[IPConfig] {
        self.ips.as_deref().unwrap_or_default()
    }

    /// Routes as a slice, empty when absent
    pub fn routes(&self) -> &[Route] {
        self.routes.as_deref().unwrap_or_default()
    }

    /// Print result as JSON
    pub fn print(&self) -> anyhow::Result<()> {
        let json = serde_json::to_string_pretty(self)?;
        println!("{}", json);
        Ok(())
    }
}

/// Error body of the CNI process contract
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CniError {
    /// CNI specification version
    #[serde(rename = "cniVersion", default)]
    pub cni_version: String,
    /// Error code
    pub code: u32,
    /// Short message
    #[serde(default)]
    pub msg: String,
    /// Longer description
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
}

/// Answer to the VERSION command
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VersionInfo {
    /// CNI specification version
    #[serde(rename = "cniVersion")]
    pub cni_version: String,
    /// Versions this plugin accepts
    #[serde(rename = "supportedVersions")]
    pub supported_versions: Vec<String>,
}

impl VersionInfo {
    /// Version information for this meta-plugin
    pub fn current() -> Self {
        Self {
            cni_version: DEFAULT_CNI_VERSION.to_string(),
            supported_versions: SUPPORTED_VERSIONS.iter().map(|v| v.to_string()).collect(),
        }
    }
}
