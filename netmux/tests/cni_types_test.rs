use std::collections::HashMap;
use std::path::PathBuf;

use netmux::attachment::annotation::parse_network_selection;
use netmux::config::{DaemonConfig, NetConf};
use netmux::error::Error;
use netmux::types::{parse_cni_args, CniError, CniResult, Command, IPConfig, Interface, Route, VersionInfo, DNS};

#[test]
fn test_net_conf_parsing() -> Result<(), Box<dyn std::error::Error>> {
    let raw = r#"{
        "cniVersion": "1.0.0",
        "name": "node-cni-network",
        "type": "netmux",
        "clusterNetwork": "flannel",
        "defaultNetworks": ["monitoring"],
        "timeoutSeconds": 30
    }"#;
    let conf = NetConf::parse(raw.as_bytes())?;

    assert_eq!(conf.name, "node-cni-network");
    assert_eq!(conf.plugin_type, "netmux");
    assert_eq!(conf.socket_dir(), PathBuf::from("/run/netmux"));
    assert_eq!(conf.cluster_defaults().map(|d| d.len()), Some(2));
    assert_eq!(conf.timeout().map(|t| t.as_secs()), Some(30));

    Ok(())
}

#[test]
fn test_net_conf_without_name_is_rejected() {
    let err = NetConf::parse(br#"{"type": "netmux", "name": ""}"#).unwrap_err();
    assert_eq!(err.cni_code(), 7);
}

#[test]
fn test_command_parsing() {
    assert_eq!("ADD".parse::<Command>().unwrap(), Command::Add);
    assert_eq!("VERSION".parse::<Command>().unwrap(), Command::Version);
    assert!(matches!("GC".parse::<Command>(), Err(Error::Config(_))));
    assert_eq!(Command::Check.to_string(), "CHECK");
}

#[test]
fn test_cni_args_parsing() {
    let args = parse_cni_args("IgnoreUnknown=1;K8S_POD_NAMESPACE=team-a;K8S_POD_NAME=web-0;broken");
    let expected: HashMap<String, String> = [
        ("IgnoreUnknown", "1"),
        ("K8S_POD_NAMESPACE", "team-a"),
        ("K8S_POD_NAME", "web-0"),
    ]
    .into_iter()
    .map(|(k, v)| (k.to_string(), v.to_string()))
    .collect();
    assert_eq!(args, expected);
    assert!(parse_cni_args("").is_empty());
}

#[test]
fn test_result_serialization() -> Result<(), Box<dyn std::error::Error>> {
    let mut result = CniResult::new("1.0.0");
    let idx = result.add_interface(Interface {
        name: "net0".to_string(),
        mac: Some("02:42:ac:11:00:02".to_string()),
        sandbox: Some("/var/run/netns/test".to_string()),
    });
    result.add_ip(IPConfig {
        interface: Some(idx),
        address: "192.168.1.100/24".to_string(),
        gateway: Some("192.168.1.1".to_string()),
    });
    result.add_route(Route {
        dst: "0.0.0.0/0".to_string(),
        gw: Some("192.168.1.1".to_string()),
    });
    result.set_dns(DNS {
        nameservers: Some(vec!["8.8.8.8".to_string()]),
        ..DNS::default()
    });

    let json = serde_json::to_value(&result)?;
    assert_eq!(json["cniVersion"], "1.0.0");
    assert_eq!(json["interfaces"][0]["name"], "net0");
    assert_eq!(json["ips"][0]["interface"], 0);
    assert_eq!(json["routes"][0]["gw"], "192.168.1.1");
    assert_eq!(json["dns"]["nameservers"][0], "8.8.8.8");
    assert!(json["dns"].get("domain").is_none());

    Ok(())
}

#[test]
fn test_sparse_result_from_delegate() -> Result<(), Box<dyn std::error::Error>> {
    let result: CniResult = serde_json::from_str(r#"{"cniVersion": "0.3.1", "ips": [{"address": "10.0.0.5/24"}]}"#)?;
    assert!(result.interfaces().is_empty());
    assert_eq!(result.ips()[0].interface, None);
    assert!(result.routes().is_empty());
    Ok(())
}

#[test]
fn test_error_body() -> Result<(), Box<dyn std::error::Error>> {
    let err = Error::DelegateFailure {
        plugin: "macvlan".to_string(),
        command: Command::Add,
        ifname: "net1".to_string(),
        code: Some(4),
        message: "master not found".to_string(),
        stderr: Some("link eth9 not found".to_string()),
    };
    let body = err.to_cni_error("1.0.0");
    assert_eq!(body.code, 4);
    assert_eq!(body.details.as_deref(), Some("link eth9 not found"));

    let parsed: CniError = serde_json::from_str(&serde_json::to_string(&body)?)?;
    assert_eq!(parsed, body);

    let timeout = Error::DeadlineExceeded("running ADD".to_string());
    assert_eq!(timeout.to_cni_error("1.0.0").code, 11);
    Ok(())
}

#[test]
fn test_version_info() {
    let info = VersionInfo::current();
    assert!(info.supported_versions.contains(&info.cni_version));
    assert!(info.supported_versions.iter().any(|v| v == "0.3.1"));
}

#[test]
fn test_annotation_forms() -> Result<(), Box<dyn std::error::Error>> {
    let compact = parse_network_selection("a, other/b@storage0")?;
    assert_eq!(compact.len(), 2);
    assert_eq!(compact[1].namespace.as_deref(), Some("other"));
    assert_eq!(compact[1].interface.as_deref(), Some("storage0"));

    let structured = parse_network_selection(
        r#"[{"name": "a", "mac": "02:00:00:00:00:0a", "ips": ["10.1.1.5/24"], "default-route": ["10.1.1.1"]}]"#,
    )?;
    assert!(structured[0].has_default_route());
    assert_eq!(structured[0].ips, vec!["10.1.1.5/24"]);

    assert!(parse_network_selection(r#"[{"name": "a", "ips": ["not-an-ip"]}]"#).is_err());
    assert!(parse_network_selection("a@b@c").is_err());
    Ok(())
}

#[test]
fn test_daemon_config_round_trip() -> Result<(), Box<dyn std::error::Error>> {
    let dir = tempfile::TempDir::new()?;
    let path = dir.path().join("daemon.json");

    let config = DaemonConfig {
        cluster_network: Some("flannel".to_string()),
        namespace_isolation: true,
        ..DaemonConfig::default()
    };
    config.save(&path)?;

    let loaded = DaemonConfig::load(&path)?;
    assert_eq!(loaded.cluster_network.as_deref(), Some("flannel"));
    assert!(loaded.namespace_isolation);
    assert_eq!(loaded.cluster_defaults().len(), 1);

    std::fs::write(&path, r#"{"cni_bin_dirs": []}"#)?;
    assert!(DaemonConfig::load(&path).is_err());
    Ok(())
}
