//! Merging of per-delegate results into one CNI result.

use ipnetwork::IpNetwork;
use std::collections::HashSet;
use std::net::IpAddr;

use crate::attachment::ResolvedDelegateConfig;
use crate::types::{CniResult, IPConfig, Interface, Route, DNS};

const DEFAULT_V4: &str = "0.0.0.0/0";
const DEFAULT_V6: &str = "::/0";

/// Merges delegate results in ordinal order.
///
/// Interfaces are concatenated and IP interface indices rebased onto the merged
/// list. Only the default-route delegate contributes default routes, and its
/// routes are never dropped as duplicates; other delegates' routes are
/// deduplicated against everything already present.
pub fn aggregate(
    cni_version: &str,
    sandbox: &str,
    outcomes: &[(ResolvedDelegateConfig, CniResult)],
) -> CniResult {
    let mut merged = CniResult::new(cni_version);

    let mut seen: HashSet<Route> = outcomes
        .iter()
        .filter(|(delegate, _)| delegate.default_route)
        .flat_map(|(delegate, result)| default_delegate_routes(delegate, result))
        .map(normalize)
        .collect();

    for (delegate, result) in outcomes {
        let offset = merged.interfaces().len();
        let synthesized = result.interfaces().is_empty();
        if synthesized {
            merged.add_interface(Interface {
                name: delegate.ifname.clone(),
                mac: None,
                sandbox: (!sandbox.is_empty()).then(|| sandbox.to_string()),
            });
        } else {
            for interface in result.interfaces() {
                merged.add_interface(interface.clone());
            }
        }
        let count = merged.interfaces().len() - offset;

        for ip in result.ips() {
            let interface = match ip.interface {
                Some(idx) if idx < count => Some(offset + idx),
                _ if synthesized => Some(offset),
                _ => None,
            };
            merged.add_ip(IPConfig {
                interface,
                ..ip.clone()
            });
        }

        if delegate.default_route {
            for route in default_delegate_routes(delegate, result) {
                merged.add_route(route);
            }
        } else {
            for route in result.routes() {
                if is_default_destination(&route.dst) {
                    continue;
                }
                if seen.insert(normalize(route.clone())) {
                    merged.add_route(route.clone());
                }
            }
        }
    }

    if let Some(dns) = pick_dns(outcomes) {
        merged.set_dns(dns);
    }
    merged
}

/// Routes of the default-route delegate. Requested gateways replace the
/// delegate's own default routes.
fn default_delegate_routes(delegate: &ResolvedDelegateConfig, result: &CniResult) -> Vec<Route> {
    let gateways = delegate.default_route_gateways();
    let mut routes: Vec<Route> = result
        .routes()
        .iter()
        .filter(|route| gateways.is_empty() || !is_default_destination(&route.dst))
        .cloned()
        .collect();
    for gw in gateways {
        let dst = match gw.parse::<IpAddr>() {
            Ok(IpAddr::V6(_)) => DEFAULT_V6,
            _ => DEFAULT_V4,
        };
        let route = Route {
            dst: dst.to_string(),
            gw: Some(gw.clone()),
        };
        if !routes.contains(&route) {
            routes.push(route);
        }
    }
    routes
}

fn pick_dns(outcomes: &[(ResolvedDelegateConfig, CniResult)]) -> Option<DNS> {
    let usable = |result: &CniResult| result.dns.clone().filter(|dns| !dns.is_empty());
    outcomes
        .iter()
        .find(|(delegate, _)| delegate.default_route)
        .and_then(|(_, result)| usable(result))
        .or_else(|| outcomes.iter().find_map(|(_, result)| usable(result)))
}

/// Whether `dst` is a 0.0.0.0/0 or ::/0 equivalent.
pub fn is_default_destination(dst: &str) -> bool {
    dst.parse::<IpNetwork>()
        .map(|net| net.prefix() == 0)
        .unwrap_or(false)
}

/// Canonical form of a route for duplicate detection.
fn normalize(route: Route) -> Route {
    let dst = match route.dst.parse::<IpNetwork>() {
        Ok(net) => IpNetwork::new(net.network(), net.prefix())
            .map(|n| n.to_string())
            .unwrap_or(route.dst),
        Err(_) => route.dst,
    };
    let gw = route
        .gw
        .map(|gw| gw.parse::<IpAddr>().map(|ip| ip.to_string()).unwrap_or(gw));
    Route { dst, gw }
}
