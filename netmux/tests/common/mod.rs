#![allow(dead_code)]

use async_trait::async_trait;
use serde_json::json;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use netmux::attachment::{AttachmentDefinition, ResolvedDelegateConfig, NETWORKS_ANNOTATION};
use netmux::cluster::{ClusterCache, ClusterHandle, PodInfo};
use netmux::delegate::DelegateExecutor;
use netmux::engine::DelegationEngine;
use netmux::error::{Error, Result};
use netmux::resolver::{DelegateSource, IsolationPolicy, Resolver};
use netmux::types::{CniResult, Command, IPConfig, Interface, InvocationContext};

pub const POD_NAMESPACE: &str = "team-a";
pub const POD_NAME: &str = "web-0";

/// One recorded delegate call: command, plugin type, interface name.
pub type Call = (Command, String, String);

/// Delegate executor that records every call and fails on demand by plugin type.
#[derive(Default)]
pub struct FakeExecutor {
    calls: Mutex<Vec<Call>>,
    fail_add: HashSet<String>,
    fail_del: HashSet<String>,
    fail_check: HashSet<String>,
    slow_add: HashSet<String>,
    results: HashMap<String, CniResult>,
}

impl FakeExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn failing_add(mut self, plugin_type: &str) -> Self {
        self.fail_add.insert(plugin_type.to_string());
        self
    }

    pub fn failing_del(mut self, plugin_type: &str) -> Self {
        self.fail_del.insert(plugin_type.to_string());
        self
    }

    pub fn failing_check(mut self, plugin_type: &str) -> Self {
        self.fail_check.insert(plugin_type.to_string());
        self
    }

    /// ADD of this type never finishes on its own.
    pub fn hanging_add(mut self, plugin_type: &str) -> Self {
        self.slow_add.insert(plugin_type.to_string());
        self
    }

    pub fn returning(mut self, plugin_type: &str, result: CniResult) -> Self {
        self.results.insert(plugin_type.to_string(), result);
        self
    }

    pub fn calls(&self) -> Vec<Call> {
        self.calls.lock().unwrap().clone()
    }

    pub fn calls_for(&self, command: Command) -> Vec<String> {
        self.calls()
            .into_iter()
            .filter(|(c, _, _)| *c == command)
            .map(|(_, plugin_type, _)| plugin_type)
            .collect()
    }

    fn failure(command: Command, delegate: &ResolvedDelegateConfig) -> Error {
        Error::DelegateFailure {
            plugin: delegate.plugin_type.clone(),
            command,
            ifname: delegate.ifname.clone(),
            code: Some(100),
            message: format!("{} refused", delegate.plugin_type),
            stderr: None,
        }
    }

    fn default_result(delegate: &ResolvedDelegateConfig, ctx: &InvocationContext) -> CniResult {
        let mut result = CniResult::new("1.0.0");
        let idx = result.add_interface(Interface {
            name: delegate.ifname.clone(),
            mac: Some(format!("02:00:00:00:00:{:02x}", delegate.ordinal + 1)),
            sandbox: Some(ctx.netns.clone()),
        });
        result.add_ip(IPConfig {
            interface: Some(idx),
            address: format!("10.{}.0.2/24", delegate.ordinal + 1),
            gateway: Some(format!("10.{}.0.1", delegate.ordinal + 1)),
        });
        result
    }
}

#[async_trait]
impl DelegateExecutor for FakeExecutor {
    async fn execute(
        &self,
        command: Command,
        delegate: &ResolvedDelegateConfig,
        ctx: &InvocationContext,
    ) -> Result<Option<CniResult>> {
        self.calls.lock().unwrap().push((
            command,
            delegate.plugin_type.clone(),
            delegate.ifname.clone(),
        ));

        let plugin_type = delegate.plugin_type.as_str();
        match command {
            Command::Add => {
                if self.slow_add.contains(plugin_type) {
                    tokio::time::sleep(Duration::from_secs(30)).await;
                }
                if self.fail_add.contains(plugin_type) {
                    return Err(Self::failure(command, delegate));
                }
                let result = self
                    .results
                    .get(plugin_type)
                    .cloned()
                    .unwrap_or_else(|| Self::default_result(delegate, ctx));
                Ok(Some(result))
            }
            Command::Del if self.fail_del.contains(plugin_type) => Err(Self::failure(command, delegate)),
            Command::Check if self.fail_check.contains(plugin_type) => {
                Err(Self::failure(command, delegate))
            }
            _ => Ok(None),
        }
    }
}

/// Definition whose inline config runs a single plugin named `plugin_type`.
pub fn definition(namespace: &str, name: &str, plugin_type: &str) -> AttachmentDefinition {
    AttachmentDefinition::new(namespace, name)
        .with_config(json!({"cniVersion": "1.0.0", "type": plugin_type}).to_string())
}

/// Cache holding one pod with `annotation` and definitions `a`, `b`, `c` of types `alpha`, `beta`, `gamma`.
pub fn cluster_with_pod(annotation: Option<&str>) -> Arc<ClusterCache> {
    let cache = ClusterCache::new();
    let mut pod = PodInfo::new(POD_NAMESPACE, POD_NAME);
    if let Some(annotation) = annotation {
        pod = pod.with_networks(annotation);
    }
    assert_eq!(
        pod.annotations.get(NETWORKS_ANNOTATION).map(String::as_str),
        annotation
    );
    cache.insert_pod(pod);
    for (name, plugin_type) in [("a", "alpha"), ("b", "beta"), ("c", "gamma")] {
        cache.insert_definition(definition(POD_NAMESPACE, name, plugin_type));
    }
    cache.insert_definition(definition("kube-system", "cluster-net", "flannel"));
    cache.insert_definition(definition("team-b", "foreign", "foreign"));
    Arc::new(cache)
}

pub fn engine(cache: &Arc<ClusterCache>, executor: Arc<dyn DelegateExecutor>) -> DelegationEngine {
    engine_with_policy(cache, executor, IsolationPolicy::default())
}

pub fn engine_with_policy(
    cache: &Arc<ClusterCache>,
    executor: Arc<dyn DelegateExecutor>,
    policy: IsolationPolicy,
) -> DelegationEngine {
    let resolver = Resolver::new("/nonexistent/net.d").with_isolation(policy);
    DelegationEngine::new(resolver, executor, ClusterHandle::from_cache(Arc::clone(cache)))
        .with_cluster_defaults(vec![DelegateSource::Definition("cluster-net".into())])
}

pub fn ctx(command: Command) -> InvocationContext {
    let mut args = HashMap::new();
    args.insert("K8S_POD_NAMESPACE".to_string(), POD_NAMESPACE.to_string());
    args.insert("K8S_POD_NAME".to_string(), POD_NAME.to_string());
    args.insert("IgnoreUnknown".to_string(), "true".to_string());

    InvocationContext {
        command,
        container_id: "3f1c0a".to_string(),
        netns: "/var/run/netns/3f1c0a".to_string(),
        ifname: "eth0".to_string(),
        args,
        path: "/opt/cni/bin".to_string(),
        stdin_data: json!({"cniVersion": "1.0.0", "name": "netmux-net", "type": "netmux"})
            .to_string()
            .into_bytes(),
        deadline: None,
    }
}
