mod common;

use serde_json::json;
use std::sync::Arc;
use std::time::Duration;

use common::{cluster_with_pod, ctx, engine, engine_with_policy, FakeExecutor, POD_NAME, POD_NAMESPACE};
use netmux::config::PLUGIN_TYPE;
use netmux::delegate::DelegateDispatcher;
use netmux::engine::aggregate::is_default_destination;
use netmux::error::{Error, ErrorKind};
use netmux::resolver::IsolationPolicy;
use netmux::types::{CniResult, Command, Route};

#[tokio::test]
async fn add_attaches_networks_in_order() {
    let cache = cluster_with_pod(Some("a,b"));
    let executor = Arc::new(FakeExecutor::new());
    let engine = engine(&cache, executor.clone());

    let result = engine.add(&ctx(Command::Add)).await.unwrap();

    assert_eq!(
        executor.calls(),
        vec![
            (Command::Add, "alpha".to_string(), "net0".to_string()),
            (Command::Add, "beta".to_string(), "net1".to_string()),
        ]
    );
    let names: Vec<_> = result.interfaces().iter().map(|i| i.name.as_str()).collect();
    assert_eq!(names, vec!["net0", "net1"]);
    assert_eq!(result.ips()[1].interface, Some(1));
}

#[tokio::test]
async fn failed_add_rolls_back_in_reverse_order() {
    let cache = cluster_with_pod(Some("a,b,c"));
    let executor = Arc::new(FakeExecutor::new().failing_add("gamma"));
    let engine = engine(&cache, executor.clone());

    let err = engine.add(&ctx(Command::Add)).await.unwrap_err();

    assert_eq!(err.kind(), ErrorKind::DelegateFailure);
    assert_eq!(err.cni_code(), 100);
    assert_eq!(executor.calls_for(Command::Add), vec!["alpha", "beta", "gamma"]);
    // the failed delegate is not rolled back, it never succeeded
    assert_eq!(executor.calls_for(Command::Del), vec!["beta", "alpha"]);
    assert!(cache.network_status(POD_NAMESPACE, POD_NAME).is_none());
    assert!(cache.events().iter().any(|e| e.reason == "AddFailed"));
}

#[tokio::test]
async fn explicit_interface_failure_tears_down_exactly_the_earlier_network() {
    let annotation = json!([{"name": "a"}, {"name": "b", "interface": "net1"}]).to_string();
    let cache = cluster_with_pod(Some(&annotation));
    let executor = Arc::new(FakeExecutor::new().failing_add("beta"));
    let engine = engine(&cache, executor.clone());

    let err = engine.add(&ctx(Command::Add)).await.unwrap_err();

    assert!(matches!(&err, Error::DelegateFailure { plugin, .. } if plugin == "beta"));
    assert_eq!(
        executor.calls(),
        vec![
            (Command::Add, "alpha".to_string(), "net0".to_string()),
            (Command::Add, "beta".to_string(), "net1".to_string()),
            (Command::Del, "alpha".to_string(), "net0".to_string()),
        ]
    );
}

#[tokio::test]
async fn rollback_continues_past_failed_teardown() {
    let cache = cluster_with_pod(Some("a,b,c"));
    let executor = Arc::new(FakeExecutor::new().failing_add("gamma").failing_del("beta"));
    let engine = engine(&cache, executor.clone());

    let err = engine.add(&ctx(Command::Add)).await.unwrap_err();

    // the original ADD error is reported, not the teardown error
    assert!(matches!(err, Error::DelegateFailure { command: Command::Add, .. }));
    assert_eq!(executor.calls_for(Command::Del), vec!["beta", "alpha"]);
}

#[tokio::test]
async fn first_delegate_failure_needs_no_rollback() {
    let cache = cluster_with_pod(Some("a,b"));
    let executor = Arc::new(FakeExecutor::new().failing_add("alpha"));
    let engine = engine(&cache, executor.clone());

    assert!(engine.add(&ctx(Command::Add)).await.is_err());
    assert_eq!(executor.calls_for(Command::Add), vec!["alpha"]);
    assert!(executor.calls_for(Command::Del).is_empty());
}

#[tokio::test]
async fn del_runs_in_reverse_and_is_repeatable() {
    let cache = cluster_with_pod(Some("a,b,c"));
    let executor = Arc::new(FakeExecutor::new());
    let engine = engine(&cache, executor.clone());

    let first = engine.del(&ctx(Command::Del)).await.unwrap();
    assert!(first.is_clean());
    let second = engine.del(&ctx(Command::Del)).await.unwrap();
    assert!(second.is_clean());

    assert_eq!(
        executor.calls_for(Command::Del),
        vec!["gamma", "beta", "alpha", "gamma", "beta", "alpha"]
    );
}

#[tokio::test]
async fn del_tolerates_partial_failure() {
    let cache = cluster_with_pod(Some("a,b,c"));
    let executor = Arc::new(FakeExecutor::new().failing_del("beta"));
    let engine = engine(&cache, executor.clone());

    let report = engine.del(&ctx(Command::Del)).await.unwrap();

    assert_eq!(executor.calls_for(Command::Del), vec!["gamma", "beta", "alpha"]);
    let failed: Vec<_> = report.failures().map(|o| o.delegate.plugin_type.as_str()).collect();
    assert_eq!(failed, vec!["beta"]);
    assert!(cache.events().iter().any(|e| e.reason == "DelPartiallyFailed"));
}

#[tokio::test]
async fn del_fails_when_nothing_could_be_torn_down() {
    let cache = cluster_with_pod(Some("a,b"));
    let executor = Arc::new(FakeExecutor::new().failing_del("alpha").failing_del("beta"));
    let engine = engine(&cache, executor.clone());

    match engine.del(&ctx(Command::Del)).await {
        Err(Error::TeardownFailed(errors)) => assert_eq!(errors.len(), 2),
        other => panic!("expected teardown failure, got {:?}", other.map(|r| r.outcomes.len())),
    }
}

#[tokio::test]
async fn del_after_pod_deletion_tears_down_cluster_default() {
    let cache = cluster_with_pod(Some("a,b"));
    cache.remove_pod(POD_NAMESPACE, POD_NAME);
    let executor = Arc::new(FakeExecutor::new());
    let engine = engine(&cache, executor.clone());

    engine.del(&ctx(Command::Del)).await.unwrap();
    assert_eq!(
        executor.calls(),
        vec![(Command::Del, "flannel".to_string(), "eth0".to_string())]
    );
}

#[tokio::test]
async fn add_for_unknown_pod_is_config_not_found() {
    let cache = cluster_with_pod(None);
    cache.remove_pod(POD_NAMESPACE, POD_NAME);
    let executor = Arc::new(FakeExecutor::new());
    let engine = engine(&cache, executor.clone());

    let err = engine.add(&ctx(Command::Add)).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::ConfigNotFound);
    assert!(executor.calls().is_empty());
}

#[tokio::test]
async fn check_stops_at_first_failure() {
    let cache = cluster_with_pod(Some("a,b,c"));
    let executor = Arc::new(FakeExecutor::new().failing_check("beta"));
    let engine = engine(&cache, executor.clone());

    let err = engine.check(&ctx(Command::Check)).await.unwrap_err();

    assert!(matches!(err, Error::DelegateFailure { command: Command::Check, .. }));
    assert_eq!(executor.calls_for(Command::Check), vec!["alpha", "beta"]);
    assert!(executor.calls_for(Command::Del).is_empty());
}

#[tokio::test]
async fn pod_without_networks_gets_cluster_default_on_primary_interface() {
    let cache = cluster_with_pod(None);
    let executor = Arc::new(FakeExecutor::new());
    let engine = engine(&cache, executor.clone());

    let result = engine.add(&ctx(Command::Add)).await.unwrap();

    assert_eq!(
        executor.calls(),
        vec![(Command::Add, "flannel".to_string(), "eth0".to_string())]
    );
    assert_eq!(result.interfaces()[0].name, "eth0");
}

#[tokio::test]
async fn netconf_delegates_override_configured_defaults() {
    let cache = cluster_with_pod(None);
    let executor = Arc::new(FakeExecutor::new());
    let engine = engine(&cache, executor.clone());

    let mut ctx = ctx(Command::Add);
    ctx.stdin_data = json!({
        "name": "node-cni-network",
        "type": "netmux",
        "delegates": [{"name": "weave1", "cniVersion": "0.3.1", "type": "weave-net"}]
    })
    .to_string()
    .into_bytes();

    engine.add(&ctx).await.unwrap();
    assert_eq!(executor.calls_for(Command::Add), vec!["weave-net"]);
}

#[tokio::test]
async fn only_the_requested_delegate_supplies_the_default_route() {
    let annotation = json!([
        {"name": "a"},
        {"name": "b", "default-route": ["10.2.0.1"]}
    ])
    .to_string();
    let cache = cluster_with_pod(Some(&annotation));

    let mut alpha = CniResult::new("1.0.0");
    alpha.add_route(Route { dst: "0.0.0.0/0".into(), gw: Some("10.1.0.1".into()) });
    alpha.add_route(Route { dst: "192.168.0.0/16".into(), gw: Some("10.1.0.1".into()) });
    let executor = Arc::new(FakeExecutor::new().returning("alpha", alpha));
    let engine = engine(&cache, executor.clone());

    let result = engine.add(&ctx(Command::Add)).await.unwrap();

    let defaults: Vec<_> = result
        .routes()
        .iter()
        .filter(|r| is_default_destination(&r.dst))
        .collect();
    assert_eq!(defaults.len(), 1);
    assert_eq!(defaults[0].gw.as_deref(), Some("10.2.0.1"));
    assert!(result.routes().iter().any(|r| r.dst == "192.168.0.0/16"));

    let status = cache.network_status(POD_NAMESPACE, POD_NAME).unwrap();
    let flagged: Vec<_> = status.iter().filter(|s| s.default).map(|s| s.name.as_str()).collect();
    assert_eq!(flagged, vec!["team-a/b"]);
}

#[tokio::test]
async fn requested_gateway_replaces_the_delegates_own_default_route() {
    let annotation = json!([
        {"name": "a"},
        {"name": "b", "default-route": ["10.2.0.1"]}
    ])
    .to_string();
    let cache = cluster_with_pod(Some(&annotation));

    let mut beta = CniResult::new("1.0.0");
    beta.add_route(Route { dst: "0.0.0.0/0".into(), gw: Some("10.2.0.254".into()) });
    beta.add_route(Route { dst: "10.20.0.0/16".into(), gw: Some("10.2.0.254".into()) });
    let executor = Arc::new(FakeExecutor::new().returning("beta", beta));
    let engine = engine(&cache, executor);

    let result = engine.add(&ctx(Command::Add)).await.unwrap();

    let defaults: Vec<_> = result
        .routes()
        .iter()
        .filter(|r| is_default_destination(&r.dst))
        .collect();
    assert_eq!(defaults.len(), 1);
    assert_eq!(defaults[0].gw.as_deref(), Some("10.2.0.1"));
    assert!(result.routes().iter().any(|r| r.dst == "10.20.0.0/16"));
}

#[tokio::test]
async fn del_clears_published_status() {
    let cache = cluster_with_pod(Some("a,b"));
    let executor = Arc::new(FakeExecutor::new());
    let engine = engine(&cache, executor);

    engine.add(&ctx(Command::Add)).await.unwrap();
    assert!(cache.network_status(POD_NAMESPACE, POD_NAME).is_some());

    engine.del(&ctx(Command::Del)).await.unwrap();
    assert!(cache.network_status(POD_NAMESPACE, POD_NAME).is_none());
}

#[tokio::test]
async fn status_is_published_after_add() {
    let cache = cluster_with_pod(Some("a,b"));
    let executor = Arc::new(FakeExecutor::new());
    let engine = engine(&cache, executor);

    engine.add(&ctx(Command::Add)).await.unwrap();

    let status = cache.network_status(POD_NAMESPACE, POD_NAME).unwrap();
    assert_eq!(status.len(), 2);
    assert_eq!(status[0].name, "team-a/a");
    assert_eq!(status[0].interface, "net0");
    assert_eq!(status[0].ips, vec!["10.1.0.2"]);
    assert_eq!(status[0].mac.as_deref(), Some("02:00:00:00:00:01"));
    assert!(status[0].default);
    assert!(!status[1].default);
}

#[tokio::test]
async fn isolation_violation_runs_no_delegate() {
    let cache = cluster_with_pod(Some("a,team-b/foreign"));
    let executor = Arc::new(FakeExecutor::new());
    let policy = IsolationPolicy::new(true, vec!["kube-system".into()]);
    let engine = engine_with_policy(&cache, executor.clone(), policy);

    let err = engine.add(&ctx(Command::Add)).await.unwrap_err();
    assert!(matches!(err, Error::IsolationViolation { .. }));
    assert!(executor.calls().is_empty());
}

#[tokio::test]
async fn deadline_aborts_and_rolls_back() {
    let cache = cluster_with_pod(Some("a,b"));
    let executor = Arc::new(FakeExecutor::new().hanging_add("beta"));
    let engine = engine(&cache, executor.clone());

    let mut ctx = ctx(Command::Add);
    ctx.deadline = Some(tokio::time::Instant::now() + Duration::from_millis(100));

    let err = engine.add(&ctx).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::DeadlineExceeded);
    assert_eq!(executor.calls_for(Command::Del), vec!["alpha"]);
}

#[tokio::test]
async fn delegate_naming_this_plugin_is_refused() {
    let cache = cluster_with_pod(Some("loop"));
    cache.insert_definition(common::definition(POD_NAMESPACE, "loop", PLUGIN_TYPE));
    let fake = Arc::new(FakeExecutor::new());
    let dispatcher = DelegateDispatcher::new(fake.clone(), PLUGIN_TYPE);
    let engine = engine(&cache, Arc::new(dispatcher));

    let err = engine.add(&ctx(Command::Add)).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Recursion);
    assert!(fake.calls().is_empty());
}

#[tokio::test]
async fn version_touches_no_delegate() {
    let cache = cluster_with_pod(Some("a"));
    let executor = Arc::new(FakeExecutor::new());
    let engine = engine(&cache, executor.clone());

    let payload = engine.handle(&ctx(Command::Version)).await.unwrap().unwrap();
    assert!(payload["supportedVersions"].as_array().unwrap().len() >= 1);
    assert!(executor.calls().is_empty());
}
