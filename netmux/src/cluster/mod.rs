//! Cluster-facing seams: pod and attachment-definition lookup, device-resource
//! binding, and the synchronized write path for status and events.
//!
//! [`ClusterCache`] is the read-mostly in-process store shared by every
//! concurrent invocation on the daemon. It is seeded from a directory tree
//!
//! ```text
//! <root>/pods/<namespace>/<name>.json
//! <root>/definitions/<namespace>/<name>.json
//! ```
//!
//! When backed by a directory, pods are always re-read from disk so a pod
//! recreated under the same name is never resolved from a stale copy.
//! Definitions are read through on a cache miss.

use async_trait::async_trait;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, RwLock};
use tracing::{debug, info, warn};

use crate::attachment::{AttachmentDefinition, NetworkStatus, NETWORKS_ANNOTATION};
use crate::error::{Error, Result};

/// Identity of a pod as carried in CNI_ARGS.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PodRef {
    pub namespace: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uid: Option<String>,
}

impl std::fmt::Display for PodRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

/// A device claimed by the pod for one resource class.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceClaim {
    pub class: String,
    pub device_id: String,
}

/// The slice of a pod this meta-plugin reads.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PodInfo {
    pub namespace: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uid: Option<String>,
    #[serde(default)]
    pub annotations: BTreeMap<String, String>,
    #[serde(default)]
    pub resource_claims: Vec<ResourceClaim>,
}

impl PodInfo {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn with_networks(mut self, annotation: impl Into<String>) -> Self {
        self.annotations
            .insert(NETWORKS_ANNOTATION.to_string(), annotation.into());
        self
    }

    #[must_use]
    pub fn with_claim(mut self, class: impl Into<String>, device_id: impl Into<String>) -> Self {
        self.resource_claims.push(ResourceClaim {
            class: class.into(),
            device_id: device_id.into(),
        });
        self
    }

    /// Raw network-selection annotation, if any.
    pub fn networks_annotation(&self) -> Option<&str> {
        self.annotations.get(NETWORKS_ANNOTATION).map(String::as_str)
    }

    pub fn pod_ref(&self) -> PodRef {
        PodRef {
            namespace: self.namespace.clone(),
            name: self.name.clone(),
            uid: self.uid.clone(),
        }
    }
}

/// Event recorded against a pod.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClusterEvent {
    pub pod: PodRef,
    pub reason: String,
    pub message: String,
}

/// Read access to pods and attachment definitions, plus status and event writes.
#[async_trait]
pub trait ClusterClient: Send + Sync {
    async fn get_pod(&self, namespace: &str, name: &str) -> Result<Option<PodInfo>>;

    async fn get_attachment_definition(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<AttachmentDefinition>>;

    /// Publishes the network status of a pod. Must be safe under concurrent calls.
    async fn update_network_status(&self, pod: &PodRef, status: Vec<NetworkStatus>) -> Result<()>;

    /// Records an event against a pod. Must be safe under concurrent calls.
    async fn record_event(&self, event: ClusterEvent) -> Result<()>;

    /// Drops everything held for a pod whose networks were torn down.
    async fn forget_pod(&self, pod: &PodRef) -> Result<()>;
}

/// Lookup of devices bound to a pod through its resource claims.
#[async_trait]
pub trait DeviceBinding: Send + Sync {
    /// Returns the device of `class` claimed by the pod, if any.
    async fn device_for_class(&self, pod: &PodRef, class: &str) -> Result<Option<String>>;
}

/// Shared handle to the cluster seams, injected into the resolver per call.
#[derive(Clone)]
pub struct ClusterHandle {
    client: Arc<dyn ClusterClient>,
    devices: Arc<dyn DeviceBinding>,
}

impl ClusterHandle {
    pub fn new(client: Arc<dyn ClusterClient>, devices: Arc<dyn DeviceBinding>) -> Self {
        Self { client, devices }
    }

    /// Uses one cache for both cluster lookups and device binding.
    pub fn from_cache(cache: Arc<ClusterCache>) -> Self {
        Self {
            client: cache.clone(),
            devices: cache,
        }
    }

    pub fn client(&self) -> &dyn ClusterClient {
        self.client.as_ref()
    }

    pub fn devices(&self) -> &dyn DeviceBinding {
        self.devices.as_ref()
    }
}

/// Events kept in memory before the oldest are dropped.
pub const MAX_EVENTS: usize = 1024;

type Key = (String, String);

fn key(namespace: &str, name: &str) -> Key {
    (namespace.to_string(), name.to_string())
}

/// Read-mostly cluster cache shared across concurrent invocations.
#[derive(Debug, Default)]
pub struct ClusterCache {
    root: Option<PathBuf>,
    pods: RwLock<HashMap<Key, PodInfo>>,
    definitions: RwLock<HashMap<Key, AttachmentDefinition>>,
    statuses: Mutex<HashMap<Key, Vec<NetworkStatus>>>,
    events: Mutex<VecDeque<ClusterEvent>>,
}

impl ClusterCache {
    /// Create an empty cache with no backing directory
    pub fn new() -> Self {
        Self::default()
    }

    /// Load every pod and definition found under `root`.
    pub fn load_dir(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        let cache = Self {
            root: Some(root.clone()),
            ..Self::default()
        };

        for pod in read_tree::<PodInfo>(&root.join("pods"))? {
            cache.insert_pod(pod);
        }
        for def in read_tree::<AttachmentDefinition>(&root.join("definitions"))? {
            cache.insert_definition(def);
        }

        info!(
            "Loaded {} pods and {} attachment definitions from {}",
            cache.pods.read().unwrap_or_else(|e| e.into_inner()).len(),
            cache.definitions.read().unwrap_or_else(|e| e.into_inner()).len(),
            root.display()
        );
        Ok(cache)
    }

    pub fn insert_pod(&self, pod: PodInfo) {
        let mut pods = self.pods.write().unwrap_or_else(|e| e.into_inner());
        pods.insert(key(&pod.namespace, &pod.name), pod);
    }

    pub fn remove_pod(&self, namespace: &str, name: &str) {
        let mut pods = self.pods.write().unwrap_or_else(|e| e.into_inner());
        pods.remove(&key(namespace, name));
    }

    pub fn insert_definition(&self, def: AttachmentDefinition) {
        let mut defs = self.definitions.write().unwrap_or_else(|e| e.into_inner());
        defs.insert(key(&def.namespace, &def.name), def);
    }

    /// Last network status published for a pod.
    pub fn network_status(&self, namespace: &str, name: &str) -> Option<Vec<NetworkStatus>> {
        let statuses = self.statuses.lock().unwrap_or_else(|e| e.into_inner());
        statuses.get(&key(namespace, name)).cloned()
    }

    /// The most recent events, oldest first, at most [`MAX_EVENTS`].
    pub fn events(&self) -> Vec<ClusterEvent> {
        let events = self.events.lock().unwrap_or_else(|e| e.into_inner());
        events.iter().cloned().collect()
    }

    /// Whether a pod is currently held in memory.
    pub fn has_pod(&self, namespace: &str, name: &str) -> bool {
        let pods = self.pods.read().unwrap_or_else(|e| e.into_inner());
        pods.contains_key(&key(namespace, name))
    }

    fn status_path(&self, pod: &PodRef) -> Option<PathBuf> {
        self.root.as_ref().map(|root| {
            root.join("status")
                .join(&pod.namespace)
                .join(format!("{}.json", pod.name))
        })
    }

    async fn reload<T: DeserializeOwned>(&self, kind: &str, namespace: &str, name: &str) -> Result<Option<T>> {
        let Some(root) = &self.root else {
            return Ok(None);
        };
        let path = root.join(kind).join(namespace).join(format!("{}.json", name));
        match tokio::fs::read(&path).await {
            Ok(bytes) => {
                debug!("Read {} {}/{} from {}", kind, namespace, name, path.display());
                Ok(Some(serde_json::from_slice(&bytes)?))
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}

#[async_trait]
impl ClusterClient for ClusterCache {
    async fn get_pod(&self, namespace: &str, name: &str) -> Result<Option<PodInfo>> {
        if self.root.is_none() {
            let pods = self.pods.read().unwrap_or_else(|e| e.into_inner());
            return Ok(pods.get(&key(namespace, name)).cloned());
        }

        // the record on disk wins, a pod may have been recreated under the same name
        let loaded: Option<PodInfo> = self.reload("pods", namespace, name).await?;
        match &loaded {
            Some(pod) => {
                let mut pods = self.pods.write().unwrap_or_else(|e| e.into_inner());
                if let Some(old) = pods.get(&key(namespace, name)) {
                    if old.uid != pod.uid {
                        info!("Pod {}/{} was recreated, dropping cached copy", namespace, name);
                    }
                }
                pods.insert(key(namespace, name), pod.clone());
            }
            None => self.remove_pod(namespace, name),
        }
        Ok(loaded)
    }

    async fn get_attachment_definition(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<AttachmentDefinition>> {
        let cached = {
            let defs = self.definitions.read().unwrap_or_else(|e| e.into_inner());
            defs.get(&key(namespace, name)).cloned()
        };
        if cached.is_some() {
            return Ok(cached);
        }

        let loaded: Option<AttachmentDefinition> =
            self.reload("definitions", namespace, name).await?;
        if let Some(def) = &loaded {
            self.insert_definition(def.clone());
        }
        Ok(loaded)
    }

    async fn update_network_status(&self, pod: &PodRef, status: Vec<NetworkStatus>) -> Result<()> {
        if let Some(path) = self.status_path(pod) {
            if let Some(dir) = path.parent() {
                tokio::fs::create_dir_all(dir).await?;
            }
            let body = serde_json::to_vec_pretty(&status)?;
            tokio::fs::write(&path, body).await?;
        }

        let mut statuses = self.statuses.lock().unwrap_or_else(|e| e.into_inner());
        statuses.insert(key(&pod.namespace, &pod.name), status);
        Ok(())
    }

    async fn record_event(&self, event: ClusterEvent) -> Result<()> {
        warn!(pod = %event.pod, reason = %event.reason, "{}", event.message);
        let mut events = self.events.lock().unwrap_or_else(|e| e.into_inner());
        if events.len() == MAX_EVENTS {
            events.pop_front();
        }
        events.push_back(event);
        Ok(())
    }

    async fn forget_pod(&self, pod: &PodRef) -> Result<()> {
        if let Some(path) = self.status_path(pod) {
            match tokio::fs::remove_file(&path).await {
                Ok(()) => debug!("Removed network status {}", path.display()),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
            // only a copy of the record on disk
            self.remove_pod(&pod.namespace, &pod.name);
        }

        let mut statuses = self.statuses.lock().unwrap_or_else(|e| e.into_inner());
        statuses.remove(&key(&pod.namespace, &pod.name));
        Ok(())
    }
}

#[async_trait]
impl DeviceBinding for ClusterCache {
    async fn device_for_class(&self, pod: &PodRef, class: &str) -> Result<Option<String>> {
        let info = self.get_pod(&pod.namespace, &pod.name).await?;
        Ok(info.and_then(|p| {
            p.resource_claims
                .into_iter()
                .find(|claim| claim.class == class)
                .map(|claim| claim.device_id)
        }))
    }
}

/// Reads every `<dir>/<namespace>/<name>.json` record.
fn read_tree<T: DeserializeOwned>(dir: &Path) -> Result<Vec<T>> {
    let mut records = Vec::new();
    if !dir.is_dir() {
        return Ok(records);
    }

    for ns_entry in std::fs::read_dir(dir)? {
        let ns_path = ns_entry?.path();
        if !ns_path.is_dir() {
            continue;
        }
        for entry in std::fs::read_dir(&ns_path)? {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let bytes = std::fs::read(&path)?;
            let record = serde_json::from_slice(&bytes).map_err(|e| {
                Error::Config(format!("malformed cluster record {}: {}", path.display(), e))
            })?;
            records.push(record);
        }
    }
    Ok(records)
}
