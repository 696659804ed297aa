//! Parsing of the pod's network-selection annotation.
//!
//! Two forms are accepted and yield identical request lists:
//!
//! ```text
//! macvlan-conf, other-ns/sriov-net@fast0
//! [{"name": "macvlan-conf"}, {"name": "sriov-net", "namespace": "other-ns", "interface": "fast0"}]
//! ```

use std::net::IpAddr;

use ipnetwork::IpNetwork;

use super::{AttachmentRequest, MAX_IFNAME_LEN};
use crate::error::{Error, Result};

/// Parses either annotation form into a list of attachment requests.
pub fn parse_network_selection(annotation: &str) -> Result<Vec<AttachmentRequest>> {
    let trimmed = annotation.trim();
    if trimmed.is_empty() {
        return Ok(Vec::new());
    }

    let requests = if trimmed.starts_with('[') {
        serde_json::from_str::<Vec<AttachmentRequest>>(trimmed)
            .map_err(|e| Error::Config(format!("malformed network selection: {}", e)))?
    } else {
        trimmed
            .split(',')
            .map(str::trim)
            .filter(|item| !item.is_empty())
            .map(parse_compact_item)
            .collect::<Result<Vec<_>>>()?
    };

    for request in &requests {
        validate_request(request)?;
    }
    Ok(requests)
}

/// Parses `[namespace/]name[@ifname]`.
fn parse_compact_item(item: &str) -> Result<AttachmentRequest> {
    let (target, interface) = match item.split_once('@') {
        Some((target, ifname)) => (target, Some(ifname)),
        None => (item, None),
    };
    if interface.is_some_and(|ifname| ifname.contains('@')) {
        return Err(Error::Config(format!(
            "network selection '{}' has more than one '@'",
            item
        )));
    }

    let (namespace, name) = match target.split_once('/') {
        Some((ns, name)) => (Some(ns), name),
        None => (None, target),
    };
    if name.contains('/') {
        return Err(Error::Config(format!(
            "network selection '{}' has more than one '/'",
            item
        )));
    }

    Ok(AttachmentRequest {
        name: name.to_string(),
        namespace: namespace.map(str::to_string),
        interface: interface.map(str::to_string),
        ..AttachmentRequest::default()
    })
}

fn validate_request(request: &AttachmentRequest) -> Result<()> {
    if request.name.is_empty() {
        return Err(Error::Config("network selection with an empty name".into()));
    }
    if request.namespace.as_deref() == Some("") {
        return Err(Error::Config(format!(
            "network selection '{}' has an empty namespace",
            request.name
        )));
    }
    if let Some(ifname) = &request.interface {
        validate_ifname(ifname)?;
    }
    for ip in &request.ips {
        ip.parse::<IpNetwork>()
            .map_err(|e| Error::Config(format!("invalid IP '{}' for '{}': {}", ip, request.name, e)))?;
    }
    for gw in request.default_route.iter().flatten() {
        gw.parse::<IpAddr>().map_err(|e| {
            Error::Config(format!(
                "invalid default-route gateway '{}' for '{}': {}",
                gw, request.name, e
            ))
        })?;
    }
    if let Some(mac) = &request.mac {
        validate_mac(mac)?;
    }
    Ok(())
}

/// Checks an interface name against the kernel's naming rules.
pub fn validate_ifname(ifname: &str) -> Result<()> {
    if ifname.is_empty()
        || ifname.len() > MAX_IFNAME_LEN
        || ifname == "."
        || ifname == ".."
        || ifname.chars().any(|c| c == '/' || c == ':' || c.is_whitespace())
    {
        return Err(Error::Config(format!("invalid interface name '{}'", ifname)));
    }
    Ok(())
}

fn validate_mac(mac: &str) -> Result<()> {
    let octets: Vec<&str> = mac.split(':').collect();
    let valid = octets.len() == 6
        && octets
            .iter()
            .all(|o| o.len() == 2 && o.chars().all(|c| c.is_ascii_hexdigit()));
    if !valid {
        return Err(Error::Config(format!("invalid MAC address '{}'", mac)));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn compact_form_with_namespace_and_interface() {
        let requests = parse_network_selection("a, ns2/b@fast0 ,").unwrap();
        assert_eq!(requests.len(), 2);
        assert_eq!(requests[0], AttachmentRequest::new("a"));
        assert_eq!(
            requests[1],
            AttachmentRequest::new("b")
                .with_namespace("ns2")
                .with_interface("fast0")
        );
    }

    #[test]
    fn compact_form_rejects_nested_namespace() {
        let err = parse_network_selection("a/b/c").unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn long_interface_name_is_rejected() {
        let err = parse_network_selection("a@averyveryverylongname").unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn structured_form_rejects_bad_gateway() {
        let err =
            parse_network_selection(r#"[{"name":"a","default-route":["not-an-ip"]}]"#).unwrap_err();
        assert!(err.to_string().contains("not-an-ip"));
    }

    #[test]
    fn blank_annotation_means_no_requests() {
        assert!(parse_network_selection("  ").unwrap().is_empty());
    }
}
