//! Route classification
//!
//! Pure predicates over a single [`Route`]. Prefix checks operate on raw
//! address octets, never on textual forms.

use std::net::IpAddr;

use crate::types::{AddressFamily, Route};

/// First octet of the LAN convention (10.0.0.0/8)
pub const LAN_FIRST_OCTET: u8 = 10;

/// Prefix length of a LAN route (mask 255.255.0.0)
pub const LAN_PREFIX_LEN: u8 = 16;

/// First octet of the reserved IPv4 gateway range 172.16.0.0/12
const NAMESPACE_GW_V4_FIRST: u8 = 172;
/// Second octet bounds of 172.16.0.0/12
const NAMESPACE_GW_V4_SECOND: std::ops::RangeInclusive<u8> = 16..=31;

/// Leading octets of the reserved IPv6 ULA gateway prefix fdd8:2357::/32
pub const NAMESPACE_GW_V6_PREFIX: [u8; 4] = [0xfd, 0xd8, 0x23, 0x57];

/// Role of a route, derived from its own fields
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RouteLabel {
    /// Default route via a regular gateway (or no gateway)
    Default,
    /// IPv4 10.X.0.0/16 route
    Lan,
    /// Default route via a gateway inside the container fabric's reserved range
    NamespaceGateway,
    /// Anything else
    Other,
}

/// True if the route matches every address of its family.
///
/// An absent destination counts as default.
pub fn is_default_route(route: &Route) -> bool {
    let Some(dst) = route.destination else {
        return true;
    };
    match dst.mask() {
        IpAddr::V4(mask) => mask.octets().iter().all(|b| *b == 0),
        IpAddr::V6(mask) => mask.octets().iter().all(|b| *b == 0),
    }
}

/// True if the route's gateway lies in the reserved range for its family.
///
/// A route without a gateway is never a namespace gateway route.
pub fn is_namespace_gateway(route: &Route) -> bool {
    match (route.family, route.gateway) {
        (AddressFamily::V4, Some(IpAddr::V4(gw))) => {
            let octets = gw.octets();
            octets[0] == NAMESPACE_GW_V4_FIRST && NAMESPACE_GW_V4_SECOND.contains(&octets[1])
        }
        (AddressFamily::V6, Some(IpAddr::V6(gw))) => gw.octets()[..4] == NAMESPACE_GW_V6_PREFIX,
        _ => false,
    }
}

/// True for an IPv4 route to a /16 inside 10.0.0.0/8.
pub fn is_lan_route(route: &Route) -> bool {
    if route.family != AddressFamily::V4 {
        return false;
    }
    match route.destination {
        Some(dst) => match (dst.addr(), dst.mask()) {
            (IpAddr::V4(addr), IpAddr::V4(mask)) => {
                addr.octets()[0] == LAN_FIRST_OCTET && mask.octets() == [255, 255, 0, 0]
            }
            _ => false,
        },
        None => false,
    }
}

/// Label a route. Default routes via a reserved gateway are
/// [`RouteLabel::NamespaceGateway`].
pub fn classify(route: &Route) -> RouteLabel {
    if is_default_route(route) {
        if is_namespace_gateway(route) {
            RouteLabel::NamespaceGateway
        } else {
            RouteLabel::Default
        }
    } else if is_lan_route(route) {
        RouteLabel::Lan
    } else {
        RouteLabel::Other
    }
}
