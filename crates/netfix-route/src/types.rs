//! Core types for route reconciliation
//!
//! Routes are transient: they are read from the kernel at the start of a run
//! and never cached across runs.

use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::RouteError;

/// Main routing table id (RT_TABLE_MAIN)
pub const MAIN_TABLE: u32 = 254;

/// RTPROT_BOOT, what `ip route add` installs with
pub const RTPROT_BOOT: u8 = 3;

/// RT_SCOPE_UNIVERSE
pub const RT_SCOPE_UNIVERSE: u8 = 0;

/// RTN_UNICAST
pub const RTN_UNICAST: u8 = 1;

/// Address family of a route
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum AddressFamily {
    /// AF_INET
    V4,
    /// AF_INET6
    V6,
}

impl AddressFamily {
    /// Both families, in enumeration order
    pub const ALL: [Self; 2] = [Self::V4, Self::V6];

    /// Family of an address
    pub fn of(addr: &IpAddr) -> Self {
        match addr {
            IpAddr::V4(_) => Self::V4,
            IpAddr::V6(_) => Self::V6,
        }
    }

    /// Maximum prefix length for this family
    pub fn max_prefix_len(&self) -> u8 {
        match self {
            Self::V4 => 32,
            Self::V6 => 128,
        }
    }
}

impl fmt::Display for AddressFamily {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::V4 => f.write_str("IPv4"),
            Self::V6 => f.write_str("IPv6"),
        }
    }
}

/// Destination network: address plus prefix length
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct IpPrefix {
    addr: IpAddr,
    len: u8,
}

impl IpPrefix {
    /// Create a prefix, rejecting lengths longer than the family allows
    pub fn new(addr: IpAddr, len: u8) -> Option<Self> {
        (len <= AddressFamily::of(&addr).max_prefix_len()).then_some(Self { addr, len })
    }

    /// Address as installed (not necessarily masked)
    pub fn addr(&self) -> IpAddr {
        self.addr
    }

    /// Prefix length in bits
    pub fn len(&self) -> u8 {
        self.len
    }

    /// Address family of the prefix
    pub fn family(&self) -> AddressFamily {
        AddressFamily::of(&self.addr)
    }

    /// Netmask as an address (e.g. 255.255.0.0 for a /16)
    pub fn mask(&self) -> IpAddr {
        match self.addr {
            IpAddr::V4(_) => {
                let bits = u32::MAX.checked_shl(32 - u32::from(self.len)).unwrap_or(0);
                IpAddr::V4(Ipv4Addr::from(bits))
            }
            IpAddr::V6(_) => {
                let bits = u128::MAX.checked_shl(128 - u32::from(self.len)).unwrap_or(0);
                IpAddr::V6(Ipv6Addr::from(bits))
            }
        }
    }

    /// Network address (address with host bits cleared)
    pub fn network(&self) -> IpAddr {
        match (self.addr, self.mask()) {
            (IpAddr::V4(a), IpAddr::V4(m)) => IpAddr::V4(Ipv4Addr::from(u32::from(a) & u32::from(m))),
            (IpAddr::V6(a), IpAddr::V6(m)) => IpAddr::V6(Ipv6Addr::from(u128::from(a) & u128::from(m))),
            (addr, _) => addr,
        }
    }
}

impl fmt::Display for IpPrefix {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.addr, self.len)
    }
}

impl FromStr for IpPrefix {
    type Err = RouteError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (addr, len) = s
            .split_once('/')
            .ok_or_else(|| RouteError::InvalidPrefix(s.to_string()))?;
        let addr: IpAddr = addr
            .parse()
            .map_err(|_| RouteError::InvalidPrefix(s.to_string()))?;
        let len: u8 = len
            .parse()
            .map_err(|_| RouteError::InvalidPrefix(s.to_string()))?;
        Self::new(addr, len).ok_or_else(|| RouteError::InvalidPrefix(s.to_string()))
    }
}

/// Identity of an installed route for deletion purposes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RouteKey {
    pub family: AddressFamily,
    pub destination: Option<IpPrefix>,
    pub gateway: Option<IpAddr>,
    pub ifindex: u32,
    pub table: u32,
}

/// A routing entry as read from (or submitted to) the kernel
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Route {
    /// Address family
    pub family: AddressFamily,
    /// Destination network; `None` when the kernel omitted RTA_DST
    pub destination: Option<IpPrefix>,
    /// Next hop
    pub gateway: Option<IpAddr>,
    /// Output interface index
    pub ifindex: u32,
    /// Routing table id
    pub table: u32,
    /// RTA_PRIORITY
    pub metric: Option<u32>,
    /// rtm_protocol
    pub protocol: u8,
    /// rtm_scope
    pub scope: u8,
    /// rtm_type
    pub kind: u8,
}

impl Route {
    /// Empty unicast route in the main table
    pub fn new(family: AddressFamily) -> Self {
        Self {
            family,
            destination: None,
            gateway: None,
            ifindex: 0,
            table: MAIN_TABLE,
            metric: None,
            protocol: RTPROT_BOOT,
            scope: RT_SCOPE_UNIVERSE,
            kind: RTN_UNICAST,
        }
    }

    /// Default route via `gateway` out of `ifindex` in `table`
    pub fn default_via(gateway: IpAddr, ifindex: u32, table: u32) -> Self {
        Self::new(AddressFamily::of(&gateway))
            .with_gateway(gateway)
            .on_link(ifindex)
            .in_table(table)
    }

    /// Set the destination network
    pub fn with_destination(mut self, destination: IpPrefix) -> Self {
        self.destination = Some(destination);
        self
    }

    /// Set the next hop
    pub fn with_gateway(mut self, gateway: IpAddr) -> Self {
        self.gateway = Some(gateway);
        self
    }

    /// Set the output interface
    pub fn on_link(mut self, ifindex: u32) -> Self {
        self.ifindex = ifindex;
        self
    }

    /// Set the routing table
    pub fn in_table(mut self, table: u32) -> Self {
        self.table = table;
        self
    }

    /// Set the metric
    pub fn with_metric(mut self, metric: u32) -> Self {
        self.metric = Some(metric);
        self
    }

    /// Identity tuple used to match this route against installed state
    pub fn key(&self) -> RouteKey {
        RouteKey {
            family: self.family,
            destination: self.destination,
            gateway: self.gateway,
            ifindex: self.ifindex,
            table: self.table,
        }
    }

    /// Field used to order otherwise equivalent candidates
    #[inline]
    pub fn tie_break(&self) -> u32 {
        self.ifindex
    }
}

impl fmt::Display for Route {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.destination {
            Some(dst) if dst.len() > 0 => write!(f, "{dst}")?,
            _ => f.write_str("default")?,
        }
        if let Some(gw) = &self.gateway {
            write!(f, " via {gw}")?;
        }
        write!(f, " dev #{} table {}", self.ifindex, self.table)?;
        if let Some(metric) = self.metric {
            write!(f, " metric {metric}")?;
        }
        Ok(())
    }
}
