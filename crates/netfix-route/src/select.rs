//! Route selection policies
//!
//! A policy turns the routes of one namespace into a [`RoutePlan`]: which
//! default routes to delete and which single default route to install.
//! Exactly one policy is applied per run; mixing them makes consecutive runs
//! undo each other.

use std::fmt;
use std::net::{IpAddr, Ipv4Addr};
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::classify::{is_default_route, is_lan_route, is_namespace_gateway};
use crate::error::RouteError;
use crate::types::{AddressFamily, Route};

/// How the authoritative default route is chosen
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SelectionPolicy {
    /// Rebuild the IPv4 default route from the lowest-index 10.X.0.0/16 LAN
    /// route and drop IPv6 defaults via the reserved ULA gateway.
    #[default]
    LanAware,
    /// Keep the best existing default route per family and delete the rest.
    /// Never adds a route.
    PreferExisting,
}

impl SelectionPolicy {
    /// Plan the mutations for `routes` under this policy.
    pub fn select(&self, routes: &[Route]) -> Selection {
        match self {
            Self::LanAware => plan_lan_aware(routes),
            Self::PreferExisting => plan_prefer_existing(routes),
        }
    }

    /// Name as used in config files and on the command line
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::LanAware => "lan-aware",
            Self::PreferExisting => "prefer-existing",
        }
    }
}

impl fmt::Display for SelectionPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SelectionPolicy {
    type Err = RouteError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "lan-aware" => Ok(Self::LanAware),
            "prefer-existing" => Ok(Self::PreferExisting),
            other => Err(RouteError::UnknownPolicy(other.to_string())),
        }
    }
}

/// Why a namespace needs no reconciliation at all
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    /// No IPv4 10.X.0.0/16 route (single-homed or unrelated namespace)
    NoLanRoute,
    /// No default route of either family
    NoDefaultRoute,
}

impl fmt::Display for SkipReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NoLanRoute => f.write_str("no LAN route"),
            Self::NoDefaultRoute => f.write_str("no default route"),
        }
    }
}

/// Mutations needed to converge, deletions applied before the addition
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RoutePlan {
    /// Independently owned copies of the routes to delete
    pub deletions: Vec<Route>,
    /// Route to add after all deletions
    pub addition: Option<Route>,
}

impl RoutePlan {
    /// True when the namespace already matches the desired state
    pub fn is_empty(&self) -> bool {
        self.deletions.is_empty() && self.addition.is_none()
    }

    /// Number of kernel mutations this plan performs
    pub fn len(&self) -> usize {
        self.deletions.len() + usize::from(self.addition.is_some())
    }
}

/// Outcome of running a policy over a namespace's routes
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Selection {
    /// Nothing to reconcile
    Skip(SkipReason),
    /// Mutations to apply (possibly none)
    Plan(RoutePlan),
}

/// Pick the authoritative LAN route: lowest tie-break field, first seen on
/// ties.
pub fn select_lan_route(routes: &[Route]) -> Option<&Route> {
    routes
        .iter()
        .enumerate()
        .filter(|(_, route)| is_lan_route(route))
        .min_by_key(|(position, route)| (route.tie_break(), *position))
        .map(|(_, route)| route)
}

/// Gateway implied by a LAN route: its network address with the last octet
/// set to 1 (10.5.0.0/16 -> 10.5.0.1).
pub fn lan_gateway(lan: &Route) -> Option<Ipv4Addr> {
    match lan.destination?.network() {
        IpAddr::V4(network) => {
            let mut octets = network.octets();
            octets[3] = 1;
            Some(Ipv4Addr::from(octets))
        }
        IpAddr::V6(_) => None,
    }
}

/// LAN-aware resynthesis.
///
/// Without a LAN route nothing is touched. Otherwise every IPv6 default via
/// the reserved ULA gateway is deleted, and unless the namespace holds exactly
/// one IPv4 default via the implied LAN gateway, all IPv4 defaults are
/// deleted and a single default via that gateway is added in the LAN route's
/// table.
pub fn plan_lan_aware(routes: &[Route]) -> Selection {
    let Some(lan) = select_lan_route(routes) else {
        return Selection::Skip(SkipReason::NoLanRoute);
    };
    let Some(gateway) = lan_gateway(lan).map(IpAddr::V4) else {
        return Selection::Skip(SkipReason::NoLanRoute);
    };

    let mut plan = RoutePlan::default();

    plan.deletions.extend(
        routes
            .iter()
            .filter(|r| r.family == AddressFamily::V6)
            .filter(|r| is_default_route(r) && is_namespace_gateway(r))
            .cloned(),
    );

    let defaults_v4: Vec<&Route> = routes
        .iter()
        .filter(|r| r.family == AddressFamily::V4 && is_default_route(r))
        .collect();

    let converged = matches!(defaults_v4.as_slice(), [only] if only.gateway == Some(gateway));
    if !converged {
        plan.deletions.extend(defaults_v4.into_iter().cloned());
        plan.addition = Some(Route::default_via(gateway, lan.ifindex, lan.table));
    }

    Selection::Plan(plan)
}

/// Best pre-existing default route: non-reserved gateways first, then routes
/// with a gateway, then the highest tie-break field, first seen on ties.
pub fn best_default_route<'a>(defaults: &[&'a Route]) -> Option<&'a Route> {
    let rank = |r: &Route| (!is_namespace_gateway(r), r.gateway.is_some(), r.tie_break());
    defaults.iter().copied().fold(None, |best, candidate| match best {
        Some(current) if rank(candidate) <= rank(current) => Some(current),
        _ => Some(candidate),
    })
}

/// Delete-only policy: per family, keep every default route whose gateway
/// matches the best one and delete the others.
pub fn plan_prefer_existing(routes: &[Route]) -> Selection {
    let mut plan = RoutePlan::default();
    let mut any_default = false;

    for family in AddressFamily::ALL {
        let defaults: Vec<&Route> = routes
            .iter()
            .filter(|r| r.family == family && is_default_route(r))
            .collect();
        let Some(best) = best_default_route(&defaults) else {
            continue;
        };
        any_default = true;
        plan.deletions.extend(
            defaults
                .iter()
                .filter(|r| r.gateway != best.gateway)
                .map(|r| (*r).clone()),
        );
    }

    if any_default {
        Selection::Plan(plan)
    } else {
        Selection::Skip(SkipReason::NoDefaultRoute)
    }
}
