//! Attachment resolution.
//!
//! Turns the pod's requested networks (or, failing that, the cluster default
//! delegates) into an ordered list of [`ResolvedDelegateConfig`]s. Nothing here
//! touches a delegate; every error surfaces before execution starts.

use serde_json::{Map, Value};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

use crate::attachment::annotation::validate_ifname;
use crate::attachment::{
    AttachmentDefinition, AttachmentRequest, DefinitionRef, Provenance, ResolvedDelegateConfig,
};
use crate::cluster::{ClusterHandle, PodRef};
use crate::error::{Error, Result};
use crate::types::DEFAULT_CNI_VERSION;

/// File extensions considered when falling back to on-disk configuration.
const CONFIG_EXTENSIONS: &[&str] = &["conf", "conflist", "json"];

/// Namespace-isolation policy.
#[derive(Debug, Clone, Default)]
pub struct IsolationPolicy {
    /// Whether pods are confined to their own namespace.
    pub enabled: bool,
    /// Namespaces any pod may reference while isolation is enabled.
    pub global_namespaces: Vec<String>,
}

impl IsolationPolicy {
    pub fn new(enabled: bool, global_namespaces: Vec<String>) -> Self {
        Self {
            enabled,
            global_namespaces,
        }
    }

    /// Rejects references from `pod_namespace` to a foreign, non-global namespace.
    pub fn check(&self, pod_namespace: &str, target_namespace: &str, name: &str) -> Result<()> {
        if !self.enabled
            || target_namespace == pod_namespace
            || self.global_namespaces.iter().any(|ns| ns == target_namespace)
        {
            return Ok(());
        }
        Err(Error::IsolationViolation {
            pod_namespace: pod_namespace.to_string(),
            target_namespace: target_namespace.to_string(),
            name: name.to_string(),
        })
    }
}

/// One entry of the cluster default delegate list.
#[derive(Debug, Clone, PartialEq)]
pub enum DelegateSource {
    /// Plugin configuration given inline.
    Inline(Value),
    /// Attachment definition in the system namespace, by name.
    Definition(String),
}

/// Input to a single resolution.
#[derive(Debug, Clone, Copy)]
pub struct ResolveRequest<'a> {
    /// Namespace of the pod being attached.
    pub pod_namespace: &'a str,
    /// Pod identity, when the runtime supplied one.
    pub pod: Option<&'a PodRef>,
    /// Networks the pod declared. Empty means "use the cluster default".
    pub requests: &'a [AttachmentRequest],
    /// Delegates used when the pod declares no networks.
    pub cluster_defaults: &'a [DelegateSource],
    /// Interface name for the cluster default network.
    pub primary_ifname: &'a str,
}

/// Builds ordered delegate configurations.
#[derive(Debug, Clone)]
pub struct Resolver {
    policy: IsolationPolicy,
    conf_dir: PathBuf,
    system_namespace: String,
    cni_version: String,
}

impl Resolver {
    pub fn new(conf_dir: impl Into<PathBuf>) -> Self {
        Self {
            policy: IsolationPolicy::default(),
            conf_dir: conf_dir.into(),
            system_namespace: "kube-system".to_string(),
            cni_version: DEFAULT_CNI_VERSION.to_string(),
        }
    }

    #[must_use]
    pub fn with_isolation(mut self, policy: IsolationPolicy) -> Self {
        self.policy = policy;
        self
    }

    #[must_use]
    pub fn with_system_namespace(mut self, namespace: impl Into<String>) -> Self {
        self.system_namespace = namespace.into();
        self
    }

    #[must_use]
    pub fn with_cni_version(mut self, version: impl Into<String>) -> Self {
        self.cni_version = version.into();
        self
    }

    /// Resolves the delegate list for one invocation.
    pub async fn resolve(
        &self,
        cluster: &ClusterHandle,
        input: ResolveRequest<'_>,
    ) -> Result<Vec<ResolvedDelegateConfig>> {
        let mut delegates = if input.requests.is_empty() {
            self.resolve_cluster_defaults(cluster, &input).await?
        } else {
            self.resolve_requests(cluster, &input).await?
        };

        let mut seen = HashSet::new();
        for delegate in &delegates {
            validate_ifname(&delegate.ifname)?;
            if !seen.insert(delegate.ifname.as_str()) {
                return Err(Error::Config(format!(
                    "interface name '{}' is used by more than one network",
                    delegate.ifname
                )));
            }
        }

        let default_idx = delegates
            .iter()
            .position(|d| d.request().is_some_and(AttachmentRequest::has_default_route))
            .unwrap_or(0);
        if let Some(delegate) = delegates.get_mut(default_idx) {
            delegate.default_route = true;
        }

        info!(
            "Resolved {} delegates for namespace {}",
            delegates.len(),
            input.pod_namespace
        );
        Ok(delegates)
    }

    async fn resolve_requests(
        &self,
        cluster: &ClusterHandle,
        input: &ResolveRequest<'_>,
    ) -> Result<Vec<ResolvedDelegateConfig>> {
        let mut delegates = Vec::with_capacity(input.requests.len());

        for (ordinal, request) in input.requests.iter().enumerate() {
            let namespace = request.namespace.as_deref().unwrap_or(input.pod_namespace);
            self.policy
                .check(input.pod_namespace, namespace, &request.name)?;

            let def = cluster
                .client()
                .get_attachment_definition(namespace, &request.name)
                .await?
                .ok_or_else(|| {
                    Error::ConfigNotFound(format!(
                        "attachment definition {}/{}",
                        namespace, request.name
                    ))
                })?;

            let mut config = self.load_config(&def).await?;
            let device_id = self.bind_device(cluster, input.pod, &def, &mut config).await?;
            apply_request_overrides(&mut config, request);

            let ifname = request
                .interface
                .clone()
                .unwrap_or_else(|| format!("net{}", ordinal));
            debug!(ordinal, ifname = %ifname, "Resolved network {}/{}", namespace, request.name);

            delegates.push(ResolvedDelegateConfig {
                plugin_type: plugin_type_of(&config)?,
                config,
                ifname,
                ordinal,
                default_route: false,
                device_id,
                provenance: Provenance::Requested {
                    request: request.clone(),
                    definition: DefinitionRef {
                        namespace: def.namespace.clone(),
                        name: def.name.clone(),
                    },
                },
            });
        }
        Ok(delegates)
    }

    async fn resolve_cluster_defaults(
        &self,
        cluster: &ClusterHandle,
        input: &ResolveRequest<'_>,
    ) -> Result<Vec<ResolvedDelegateConfig>> {
        if input.cluster_defaults.is_empty() {
            return Err(Error::Config(
                "pod declares no networks and no cluster default network is configured".into(),
            ));
        }

        let mut delegates = Vec::with_capacity(input.cluster_defaults.len());
        for (ordinal, source) in input.cluster_defaults.iter().enumerate() {
            let (mut config, definition, device_id) = match source {
                DelegateSource::Inline(value) => (value.clone(), None, None),
                DelegateSource::Definition(name) => {
                    let def = cluster
                        .client()
                        .get_attachment_definition(&self.system_namespace, name)
                        .await?
                        .ok_or_else(|| {
                            Error::ConfigNotFound(format!(
                                "cluster default network {}/{}",
                                self.system_namespace, name
                            ))
                        })?;
                    let mut config = self.load_config(&def).await?;
                    let device_id = self.bind_device(cluster, input.pod, &def, &mut config).await?;
                    let definition = DefinitionRef {
                        namespace: def.namespace,
                        name: def.name,
                    };
                    (config, Some(definition), device_id)
                }
            };
            self.fill_defaults(&mut config, None);

            let ifname = if ordinal == 0 && !input.primary_ifname.is_empty() {
                input.primary_ifname.to_string()
            } else {
                format!("net{}", ordinal)
            };

            delegates.push(ResolvedDelegateConfig {
                plugin_type: plugin_type_of(&config)?,
                config,
                ifname,
                ordinal,
                default_route: false,
                device_id,
                provenance: Provenance::ClusterDefault { definition },
            });
        }
        Ok(delegates)
    }

    /// Inline configuration, or the on-disk file named after the definition.
    async fn load_config(&self, def: &AttachmentDefinition) -> Result<Value> {
        let mut config = match def.inline_config() {
            Some(raw) => serde_json::from_str::<Value>(raw).map_err(|e| {
                Error::Config(format!(
                    "attachment definition {}/{} has malformed config: {}",
                    def.namespace, def.name, e
                ))
            })?,
            None => find_config_file(&self.conf_dir, &def.name).await?,
        };
        if !config.is_object() {
            return Err(Error::Config(format!(
                "attachment definition {}/{} config is not a JSON object",
                def.namespace, def.name
            )));
        }
        self.fill_defaults(&mut config, Some(&def.name));
        Ok(config)
    }

    fn fill_defaults(&self, config: &mut Value, name: Option<&str>) {
        if let Some(obj) = config.as_object_mut() {
            obj.entry("cniVersion")
                .or_insert_with(|| Value::String(self.cni_version.clone()));
            if let Some(name) = name {
                obj.entry("name")
                    .or_insert_with(|| Value::String(name.to_string()));
            }
        }
    }

    async fn bind_device(
        &self,
        cluster: &ClusterHandle,
        pod: Option<&PodRef>,
        def: &AttachmentDefinition,
        config: &mut Value,
    ) -> Result<Option<String>> {
        let Some(class) = def.resource_class() else {
            return Ok(None);
        };
        let network = format!("{}/{}", def.namespace, def.name);
        let pod = pod.ok_or_else(|| Error::DeviceBinding {
            network: network.clone(),
            class: class.to_string(),
        })?;

        let device_id = cluster
            .devices()
            .device_for_class(pod, class)
            .await?
            .ok_or_else(|| Error::DeviceBinding {
                network,
                class: class.to_string(),
            })?;

        if let Some(target) = first_plugin_mut(config) {
            target.insert("deviceID".to_string(), Value::String(device_id.clone()));
        }
        debug!(device_id = %device_id, "Bound device of class {} to {}/{}", class, def.namespace, def.name);
        Ok(Some(device_id))
    }
}

/// Scans `conf_dir` for a configuration whose `name` matches.
async fn find_config_file(conf_dir: &Path, name: &str) -> Result<Value> {
    let not_found = || {
        Error::ConfigNotFound(format!(
            "no configuration named '{}' in {}",
            name,
            conf_dir.display()
        ))
    };

    let mut entries = match tokio::fs::read_dir(conf_dir).await {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Err(not_found()),
        Err(e) => return Err(e.into()),
    };

    let mut paths = Vec::new();
    while let Some(entry) = entries.next_entry().await? {
        let path = entry.path();
        let matches_ext = path
            .extension()
            .and_then(|e| e.to_str())
            .is_some_and(|e| CONFIG_EXTENSIONS.contains(&e));
        if matches_ext {
            paths.push(path);
        }
    }
    paths.sort();

    for path in paths {
        let bytes = tokio::fs::read(&path).await?;
        let Ok(config) = serde_json::from_slice::<Value>(&bytes) else {
            debug!("Skipping unparseable config file {}", path.display());
            continue;
        };
        if config.get("name").and_then(Value::as_str) == Some(name) {
            debug!("Using config file {} for network {}", path.display(), name);
            return Ok(config);
        }
    }
    Err(not_found())
}

/// Plugin type of a single config, or of the first plugin of a list.
fn plugin_type_of(config: &Value) -> Result<String> {
    if let Some(plugins) = config.get("plugins") {
        let plugins = plugins
            .as_array()
            .filter(|p| !p.is_empty())
            .ok_or_else(|| Error::Config("configuration list has no plugins".into()))?;
        for plugin in plugins {
            if plugin.get("type").and_then(Value::as_str).is_none() {
                return Err(Error::Config("plugin in configuration list has no type".into()));
            }
        }
        return Ok(plugins[0]["type"].as_str().unwrap_or_default().to_string());
    }

    config
        .get("type")
        .and_then(Value::as_str)
        .filter(|t| !t.is_empty())
        .map(str::to_string)
        .ok_or_else(|| Error::Config("delegate configuration has no plugin type".into()))
}

fn first_plugin_mut(config: &mut Value) -> Option<&mut Map<String, Value>> {
    if config.get("plugins").is_some() {
        config
            .get_mut("plugins")
            .and_then(Value::as_array_mut)
            .and_then(|plugins| plugins.first_mut())
            .and_then(Value::as_object_mut)
    } else {
        config.as_object_mut()
    }
}

fn each_plugin_mut(config: &mut Value) -> Vec<&mut Map<String, Value>> {
    if config.get("plugins").is_some() {
        config
            .get_mut("plugins")
            .and_then(Value::as_array_mut)
            .map(|plugins| plugins.iter_mut().filter_map(Value::as_object_mut).collect())
            .unwrap_or_default()
    } else {
        config.as_object_mut().into_iter().collect()
    }
}

/// Injects the pod's MAC, IP and CNI-argument overrides.
fn apply_request_overrides(config: &mut Value, request: &AttachmentRequest) {
    let has_runtime = request.mac.is_some() || !request.ips.is_empty();
    if !has_runtime && request.cni_args.is_none() {
        return;
    }

    for plugin in each_plugin_mut(config) {
        if has_runtime {
            let runtime = plugin
                .entry("runtimeConfig")
                .or_insert_with(|| Value::Object(Map::new()));
            if let Some(runtime) = runtime.as_object_mut() {
                if let Some(mac) = &request.mac {
                    runtime.insert("mac".to_string(), Value::String(mac.clone()));
                }
                if !request.ips.is_empty() {
                    runtime.insert(
                        "ips".to_string(),
                        Value::Array(request.ips.iter().cloned().map(Value::String).collect()),
                    );
                }
            }
        }

        if let Some(cni_args) = &request.cni_args {
            let args = plugin
                .entry("args")
                .or_insert_with(|| Value::Object(Map::new()));
            if let Some(args) = args.as_object_mut() {
                args.insert("cni".to_string(), Value::Object(cni_args.clone()));
            }
        }
    }
}
