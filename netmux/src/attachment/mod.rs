//! Attachment descriptor model.
//!
//! An [`AttachmentRequest`] is one entry of the pod's declared network list,
//! an [`AttachmentDefinition`] is the cluster-stored record it points at, and a
//! [`ResolvedDelegateConfig`] is the fully materialized configuration handed to
//! exactly one delegate invocation.

pub mod annotation;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;

/// Pod annotation listing the requested networks.
pub const NETWORKS_ANNOTATION: &str = "k8s.v1.cni.cncf.io/networks";
/// Pod annotation the network status is published under.
pub const NETWORK_STATUS_ANNOTATION: &str = "k8s.v1.cni.cncf.io/network-status";
/// Definition annotation naming the device-resource class.
pub const RESOURCE_NAME_ANNOTATION: &str = "k8s.v1.cni.cncf.io/resourceName";

/// Linux limit on interface name length.
pub const MAX_IFNAME_LEN: usize = 15;

/// One requested network attachment.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttachmentRequest {
    /// Name of the attachment definition.
    pub name: String,
    /// Namespace of the definition. Defaults to the pod's namespace.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
    /// Requested interface name inside the sandbox.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub interface: Option<String>,
    /// Requested MAC address.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mac: Option<String>,
    /// Requested IP addresses in CIDR notation.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub ips: Vec<String>,
    /// Gateways for the default route; presence makes this the default-route network.
    #[serde(rename = "default-route", default, skip_serializing_if = "Option::is_none")]
    pub default_route: Option<Vec<String>>,
    /// Extra arguments passed to the delegate under `args.cni`.
    #[serde(rename = "cni-args", default, skip_serializing_if = "Option::is_none")]
    pub cni_args: Option<Map<String, Value>>,
}

impl AttachmentRequest {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn with_namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = Some(namespace.into());
        self
    }

    #[must_use]
    pub fn with_interface(mut self, interface: impl Into<String>) -> Self {
        self.interface = Some(interface.into());
        self
    }

    #[must_use]
    pub fn with_default_route(mut self, gateways: Vec<String>) -> Self {
        self.default_route = Some(gateways);
        self
    }

    /// Whether this request carries an explicit default-route directive.
    pub fn has_default_route(&self) -> bool {
        self.default_route.as_ref().is_some_and(|gws| !gws.is_empty())
    }
}

/// Cluster-stored attachment definition.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AttachmentDefinition {
    pub name: String,
    pub namespace: String,
    /// Inline plugin configuration. Empty means "look for a file named after the definition".
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub config: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub annotations: BTreeMap<String, String>,
}

impl AttachmentDefinition {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            namespace: namespace.into(),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn with_config(mut self, config: impl Into<String>) -> Self {
        self.config = Some(config.into());
        self
    }

    #[must_use]
    pub fn with_resource_class(mut self, class: impl Into<String>) -> Self {
        self.annotations
            .insert(RESOURCE_NAME_ANNOTATION.to_string(), class.into());
        self
    }

    /// Inline configuration, if one is present and non-blank.
    pub fn inline_config(&self) -> Option<&str> {
        self.config.as_deref().filter(|c| !c.trim().is_empty())
    }

    /// Device-resource class this definition binds to.
    pub fn resource_class(&self) -> Option<&str> {
        self.annotations
            .get(RESOURCE_NAME_ANNOTATION)
            .map(String::as_str)
            .filter(|c| !c.is_empty())
    }
}

/// Namespaced reference to an attachment definition.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DefinitionRef {
    pub namespace: String,
    pub name: String,
}

impl std::fmt::Display for DefinitionRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

/// Where a resolved delegate came from.
#[derive(Debug, Clone, PartialEq)]
pub enum Provenance {
    /// Produced from an entry in the pod's network list.
    Requested {
        request: AttachmentRequest,
        definition: DefinitionRef,
    },
    /// The cluster default network, used when the pod declares no list.
    ClusterDefault { definition: Option<DefinitionRef> },
}

/// Fully materialized configuration for one delegate invocation.
#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedDelegateConfig {
    /// Plugin type of the delegate (first plugin for a configuration list).
    pub plugin_type: String,
    /// Complete plugin configuration handed to the delegate on stdin.
    pub config: Value,
    /// Interface name inside the sandbox.
    pub ifname: String,
    /// Position in the delegate list.
    pub ordinal: usize,
    /// Whether this delegate supplies the default route.
    pub default_route: bool,
    /// Device identifier injected from a device-resource binding.
    pub device_id: Option<String>,
    pub provenance: Provenance,
}

impl ResolvedDelegateConfig {
    /// Network name used in logs and status: `namespace/name` or the config's `name`.
    pub fn network_name(&self) -> String {
        match &self.provenance {
            Provenance::Requested { definition, .. }
            | Provenance::ClusterDefault {
                definition: Some(definition),
            } => definition.to_string(),
            Provenance::ClusterDefault { definition: None } => self
                .config
                .get("name")
                .and_then(Value::as_str)
                .unwrap_or(&self.plugin_type)
                .to_string(),
        }
    }

    /// Every plugin type this delegate will execute.
    pub fn plugin_types(&self) -> Vec<&str> {
        match self.config.get("plugins").and_then(Value::as_array) {
            Some(plugins) => plugins
                .iter()
                .filter_map(|p| p.get("type").and_then(Value::as_str))
                .collect(),
            None => vec![self.plugin_type.as_str()],
        }
    }

    /// Gateways for the default route requested by the pod.
    pub fn default_route_gateways(&self) -> &[String] {
        match &self.provenance {
            Provenance::Requested { request, .. } if self.default_route => {
                request.default_route.as_deref().unwrap_or_default()
            }
            _ => &[],
        }
    }

    /// The pod's request for this delegate, if it came from the network list.
    pub fn request(&self) -> Option<&AttachmentRequest> {
        match &self.provenance {
            Provenance::Requested { request, .. } => Some(request),
            Provenance::ClusterDefault { .. } => None,
        }
    }
}

/// Per-network status published on the pod after a successful ADD.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NetworkStatus {
    pub name: String,
    pub interface: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub ips: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mac: Option<String>,
    #[serde(default)]
    pub default: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dns: Option<crate::types::DNS>,
    #[serde(rename = "device-info", default, skip_serializing_if = "Option::is_none")]
    pub device_id: Option<String>,
}
