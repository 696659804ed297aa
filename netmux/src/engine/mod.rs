//! Delegation engine.
//!
//! Drives one invocation through
//! `Idle -> Resolving -> Executing -> Aggregating -> {Succeeded | RollingBack} -> Done`.
//!
//! ADD runs delegates strictly in ordinal order. Every delegate that succeeds
//! is pushed onto a compensation list; when a later delegate fails, that list
//! is unwound in reverse with DEL before the original error is returned. DEL
//! walks all delegates in reverse and only fails when none of them could be
//! torn down. CHECK stops at the first failure and never rolls anything back.

pub mod aggregate;

use serde_json::Value;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

use crate::attachment::annotation::parse_network_selection;
use crate::attachment::{NetworkStatus, ResolvedDelegateConfig};
use crate::cluster::{ClusterEvent, ClusterHandle};
use crate::config::NetConf;
use crate::delegate::DelegateExecutor;
use crate::error::{Error, Result};
use crate::resolver::{DelegateSource, ResolveRequest, Resolver};
use crate::types::{CniResult, Command, InvocationContext, VersionInfo, DEFAULT_CNI_VERSION};

pub use aggregate::aggregate;

/// Namespace assumed for invocations that carry no pod identity.
const FALLBACK_NAMESPACE: &str = "default";

/// Lifecycle of a single invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineState {
    Idle,
    Resolving,
    Executing,
    Aggregating,
    Succeeded,
    RollingBack,
    Done,
}

/// Execution record of one delegate.
#[derive(Debug)]
pub struct DelegateOutcome {
    pub delegate: ResolvedDelegateConfig,
    pub result: Result<Option<CniResult>>,
}

impl DelegateOutcome {
    pub fn succeeded(&self) -> bool {
        self.result.is_ok()
    }
}

/// Per-delegate results of a DEL.
#[derive(Debug, Default)]
pub struct TeardownReport {
    pub outcomes: Vec<DelegateOutcome>,
}

impl TeardownReport {
    pub fn failures(&self) -> impl Iterator<Item = &DelegateOutcome> {
        self.outcomes.iter().filter(|o| !o.succeeded())
    }

    pub fn is_clean(&self) -> bool {
        self.failures().next().is_none()
    }
}

/// State tracker for one invocation.
struct Run<'a> {
    ctx: &'a InvocationContext,
    state: EngineState,
}

impl<'a> Run<'a> {
    fn new(ctx: &'a InvocationContext) -> Self {
        Self {
            ctx,
            state: EngineState::Idle,
        }
    }

    fn advance(&mut self, next: EngineState) {
        debug!(
            container_id = %self.ctx.container_id,
            command = %self.ctx.command,
            "{:?} -> {:?}",
            self.state,
            next
        );
        self.state = next;
    }
}

/// Orchestrates the resolver and executor across the full attachment list.
pub struct DelegationEngine {
    resolver: Resolver,
    executor: Arc<dyn DelegateExecutor>,
    cluster: ClusterHandle,
    cluster_defaults: Vec<DelegateSource>,
    cni_version: String,
}

impl DelegationEngine {
    pub fn new(resolver: Resolver, executor: Arc<dyn DelegateExecutor>, cluster: ClusterHandle) -> Self {
        Self {
            resolver,
            executor,
            cluster,
            cluster_defaults: Vec::new(),
            cni_version: DEFAULT_CNI_VERSION.to_string(),
        }
    }

    /// Delegates used when neither the pod nor the invocation names any.
    #[must_use]
    pub fn with_cluster_defaults(mut self, defaults: Vec<DelegateSource>) -> Self {
        self.cluster_defaults = defaults;
        self
    }

    #[must_use]
    pub fn with_cni_version(mut self, version: impl Into<String>) -> Self {
        self.cni_version = version.into();
        self
    }

    /// Runs the invocation's command and returns its success payload.
    pub async fn handle(&self, ctx: &InvocationContext) -> Result<Option<Value>> {
        match ctx.command {
            Command::Add => Ok(Some(serde_json::to_value(self.add(ctx).await?)?)),
            Command::Del => self.del(ctx).await.map(|_| None),
            Command::Check => self.check(ctx).await.map(|_| None),
            Command::Version => Ok(Some(serde_json::to_value(self.version())?)),
        }
    }

    /// Answered without resolving or touching any delegate.
    pub fn version(&self) -> VersionInfo {
        VersionInfo::current()
    }

    pub async fn add(&self, ctx: &InvocationContext) -> Result<CniResult> {
        let mut run = Run::new(ctx);
        run.advance(EngineState::Resolving);
        let delegates = self.resolve_for(ctx).await?;

        run.advance(EngineState::Executing);
        let mut compensation: Vec<&ResolvedDelegateConfig> = Vec::with_capacity(delegates.len());
        let mut completed: Vec<(ResolvedDelegateConfig, CniResult)> = Vec::with_capacity(delegates.len());

        for delegate in &delegates {
            match self.invoke(Command::Add, delegate, ctx, true).await {
                Ok(result) => {
                    compensation.push(delegate);
                    let result = result.unwrap_or_else(|| CniResult::new(&self.cni_version));
                    completed.push((delegate.clone(), result));
                }
                Err(err) => {
                    error!(
                        container_id = %ctx.container_id,
                        ordinal = delegate.ordinal,
                        "ADD of {} failed: {}",
                        delegate.network_name(),
                        err
                    );
                    run.advance(EngineState::RollingBack);
                    let rollback = self.roll_back(compensation, ctx).await;
                    let leftovers = rollback.iter().filter(|o| !o.succeeded()).count();
                    if leftovers > 0 {
                        warn!(
                            container_id = %ctx.container_id,
                            "{} delegates could not be rolled back",
                            leftovers
                        );
                    }
                    self.record(ctx, "AddFailed", format!("ADD of {} failed: {}", delegate.network_name(), err))
                        .await;
                    run.advance(EngineState::Done);
                    return Err(err);
                }
            }
        }

        run.advance(EngineState::Aggregating);
        let result = aggregate(&self.cni_version, &ctx.netns, &completed);
        self.publish_status(ctx, &completed).await;

        run.advance(EngineState::Succeeded);
        info!(
            container_id = %ctx.container_id,
            "Attached {} networks",
            completed.len()
        );
        run.advance(EngineState::Done);
        Ok(result)
    }

    pub async fn del(&self, ctx: &InvocationContext) -> Result<TeardownReport> {
        let mut run = Run::new(ctx);
        run.advance(EngineState::Resolving);
        let delegates = self.resolve_for(ctx).await?;

        run.advance(EngineState::Executing);
        let mut report = TeardownReport::default();
        for delegate in delegates.iter().rev() {
            let result = self.invoke(Command::Del, delegate, ctx, true).await;
            if let Err(err) = &result {
                warn!(
                    container_id = %ctx.container_id,
                    ordinal = delegate.ordinal,
                    "DEL of {} failed: {}",
                    delegate.network_name(),
                    err
                );
            }
            report.outcomes.push(DelegateOutcome {
                delegate: delegate.clone(),
                result,
            });
        }
        run.advance(EngineState::Done);

        let failed = report.failures().count();
        if failed > 0 && failed == report.outcomes.len() {
            let errors = report
                .outcomes
                .into_iter()
                .filter_map(|o| o.result.err())
                .collect();
            return Err(Error::TeardownFailed(errors));
        }
        if failed > 0 {
            self.record(
                ctx,
                "DelPartiallyFailed",
                format!("{} of {} networks failed teardown", failed, report.outcomes.len()),
            )
            .await;
        }
        if let Some(pod) = ctx.pod_ref() {
            if let Err(err) = self.cluster.client().forget_pod(&pod).await {
                warn!("Failed to clear state for pod {}: {}", pod, err);
            }
        }
        Ok(report)
    }

    pub async fn check(&self, ctx: &InvocationContext) -> Result<()> {
        let mut run = Run::new(ctx);
        run.advance(EngineState::Resolving);
        let delegates = self.resolve_for(ctx).await?;

        run.advance(EngineState::Executing);
        for delegate in &delegates {
            self.invoke(Command::Check, delegate, ctx, true).await?;
        }
        run.advance(EngineState::Done);
        Ok(())
    }

    /// Resolves the delegate list exactly the same way for ADD, DEL and CHECK.
    async fn resolve_for(&self, ctx: &InvocationContext) -> Result<Vec<ResolvedDelegateConfig>> {
        let netconf = if ctx.stdin_data.iter().all(u8::is_ascii_whitespace) {
            None
        } else {
            Some(NetConf::parse(&ctx.stdin_data)?)
        };
        let defaults = netconf
            .as_ref()
            .and_then(NetConf::cluster_defaults)
            .unwrap_or_else(|| self.cluster_defaults.clone());

        let pod_ref = ctx.pod_ref();
        let mut requests = Vec::new();
        if let Some(pod_ref) = &pod_ref {
            let pod = self
                .cluster
                .client()
                .get_pod(&pod_ref.namespace, &pod_ref.name)
                .await?;
            match pod {
                Some(pod) => {
                    if let Some(annotation) = pod.networks_annotation() {
                        requests = parse_network_selection(annotation)?;
                    }
                }
                None if ctx.command == Command::Del => {
                    warn!("Pod {} no longer exists, tearing down cluster default networks only", pod_ref);
                }
                None => return Err(Error::ConfigNotFound(format!("pod {}", pod_ref))),
            }
        }

        let input = ResolveRequest {
            pod_namespace: pod_ref
                .as_ref()
                .map_or(FALLBACK_NAMESPACE, |p| p.namespace.as_str()),
            pod: pod_ref.as_ref(),
            requests: &requests,
            cluster_defaults: &defaults,
            primary_ifname: &ctx.ifname,
        };
        match self.resolver.resolve(&self.cluster, input).await {
            Err(Error::ConfigNotFound(what)) if ctx.command == Command::Del && !requests.is_empty() => {
                warn!("{} is gone, tearing down cluster default networks only", what);
                self.resolver
                    .resolve(&self.cluster, ResolveRequest { requests: &[], ..input })
                    .await
            }
            other => other,
        }
    }

    async fn invoke(
        &self,
        command: Command,
        delegate: &ResolvedDelegateConfig,
        ctx: &InvocationContext,
        bounded: bool,
    ) -> Result<Option<CniResult>> {
        let call = self.executor.execute(command, delegate, ctx);
        match ctx.deadline.filter(|_| bounded) {
            Some(deadline) => tokio::time::timeout_at(deadline, call).await.map_err(|_| {
                Error::DeadlineExceeded(format!("running {} for {}", command, delegate.network_name()))
            })?,
            None => call.await,
        }
    }

    /// Tears down every compensated delegate, last one first.
    async fn roll_back(
        &self,
        mut compensation: Vec<&ResolvedDelegateConfig>,
        ctx: &InvocationContext,
    ) -> Vec<DelegateOutcome> {
        let mut outcomes = Vec::with_capacity(compensation.len());
        while let Some(delegate) = compensation.pop() {
            let result = self.invoke(Command::Del, delegate, ctx, false).await;
            match &result {
                Ok(_) => info!(
                    container_id = %ctx.container_id,
                    ordinal = delegate.ordinal,
                    "Rolled back {}",
                    delegate.network_name()
                ),
                Err(err) => warn!(
                    container_id = %ctx.container_id,
                    ordinal = delegate.ordinal,
                    "Rollback of {} failed: {}",
                    delegate.network_name(),
                    err
                ),
            }
            outcomes.push(DelegateOutcome {
                delegate: delegate.clone(),
                result,
            });
        }
        outcomes
    }

    async fn publish_status(&self, ctx: &InvocationContext, completed: &[(ResolvedDelegateConfig, CniResult)]) {
        let Some(pod) = ctx.pod_ref() else {
            return;
        };
        let status = completed
            .iter()
            .map(|(delegate, result)| NetworkStatus {
                name: delegate.network_name(),
                interface: delegate.ifname.clone(),
                ips: result
                    .ips()
                    .iter()
                    .map(|ip| ip.address.split('/').next().unwrap_or_default().to_string())
                    .collect(),
                mac: result
                    .interfaces()
                    .iter()
                    .find(|i| i.name == delegate.ifname)
                    .and_then(|i| i.mac.clone()),
                default: delegate.default_route,
                dns: result.dns.clone().filter(|dns| !dns.is_empty()),
                device_id: delegate.device_id.clone(),
            })
            .collect();

        if let Err(err) = self.cluster.client().update_network_status(&pod, status).await {
            warn!("Failed to publish network status for {}: {}", pod, err);
        }
    }

    async fn record(&self, ctx: &InvocationContext, reason: &str, message: String) {
        let Some(pod) = ctx.pod_ref() else {
            return;
        };
        let event = ClusterEvent {
            pod,
            reason: reason.to_string(),
            message,
        };
        if let Err(err) = self.cluster.client().record_event(event).await {
            warn!("Failed to record event: {}", err);
        }
    }
}
