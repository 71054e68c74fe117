//! Netlink route table for the current network namespace
//!
//! One NETLINK_ROUTE socket per table, opened in whatever namespace the
//! calling thread is attached to. Requests are strictly request/response:
//! dumps are read until NLMSG_DONE, mutations until the kernel ACK.
//!
//! A multipath entry (RTA_MULTIPATH) is reported as one [`Route`] per next
//! hop. IPv6 keeps each hop as a separate kernel sibling, so a hop is deleted
//! like any other route. An IPv4 multipath entry is a single kernel route: a
//! hop is removed by replacing the entry with the remaining hops, and the
//! entry is deleted with its last hop.

#[cfg(target_os = "linux")]
mod linux {
    use crate::error::{Result, RouteError};
    use crate::table::{Link, RouteTable};
    use crate::types::{AddressFamily, IpPrefix, Route, RouteKey, MAIN_TABLE};
    use netlink_packet_core::{
        NetlinkHeader, NetlinkMessage, NetlinkPayload, NLM_F_ACK, NLM_F_CREATE, NLM_F_DUMP,
        NLM_F_EXCL, NLM_F_REPLACE, NLM_F_REQUEST,
    };
    use netlink_packet_route::link::{LinkAttribute, LinkMessage};
    use netlink_packet_route::route::{
        RouteAddress, RouteAttribute, RouteMessage, RouteNextHop, RouteProtocol, RouteScope,
        RouteType,
    };
    use netlink_packet_route::{AddressFamily as NlFamily, RouteNetlinkMessage};
    use netlink_sys::{protocols::NETLINK_ROUTE, Socket, SocketAddr};
    use std::collections::HashMap;
    use std::net::IpAddr;
    use std::os::fd::AsRawFd;
    use std::time::Duration;
    use tracing::{debug, instrument, trace, warn};

    /// Default bound on a single kernel round trip
    pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);

    /// rtm_table value when the id is carried in RTA_TABLE
    const RT_TABLE_UNSPEC: u8 = 0;

    /// NLM_F_DUMP is ROOT|MATCH; ROOT alone shares its bit with NLM_F_REPLACE.
    fn is_dump(flags: u16) -> bool {
        flags & NLM_F_DUMP == NLM_F_DUMP
    }

    /// An IPv4 multipath route as dumped, with the hops still installed
    #[derive(Debug, Clone)]
    struct MultipathEntry {
        message: RouteMessage,
        hops: Vec<(RouteKey, RouteNextHop)>,
    }

    impl MultipathEntry {
        fn contains(&self, key: &RouteKey) -> bool {
            self.hops.iter().any(|(hop, _)| hop == key)
        }

        /// Same entry without the hop identified by `key`
        fn without(&self, key: &RouteKey) -> Self {
            Self {
                message: self.message.clone(),
                hops: self
                    .hops
                    .iter()
                    .filter(|(hop, _)| hop != key)
                    .cloned()
                    .collect(),
            }
        }

        /// Request that leaves the kernel holding exactly `self.hops`
        fn update_request(&self) -> (RouteNetlinkMessage, u16) {
            let mut msg = self.message.clone();
            msg.attributes.retain(|attr| {
                matches!(
                    attr,
                    RouteAttribute::Destination(_)
                        | RouteAttribute::Table(_)
                        | RouteAttribute::Priority(_)
                        | RouteAttribute::PrefSource(_)
                )
            });

            if self.hops.is_empty() {
                (RouteNetlinkMessage::DelRoute(msg), NLM_F_REQUEST | NLM_F_ACK)
            } else {
                msg.attributes.push(RouteAttribute::MultiPath(
                    self.hops.iter().map(|(_, hop)| hop.clone()).collect(),
                ));
                (
                    RouteNetlinkMessage::NewRoute(msg),
                    NLM_F_REQUEST | NLM_F_ACK | NLM_F_REPLACE,
                )
            }
        }
    }

    /// Netlink route table
    pub struct NetlinkRouteTable {
        socket: Socket,
        sequence: u32,
        timeout: Duration,
        /// Main table dump per family, dropped on every mutation
        dumped: HashMap<AddressFamily, Vec<Route>>,
        /// IPv4 multipath entries from the last dump, kept in step with deletions
        multipath: Vec<MultipathEntry>,
    }

    impl NetlinkRouteTable {
        /// Open a route socket; every reply must arrive within `timeout`
        #[instrument]
        pub fn with_timeout(timeout: Duration) -> Result<Self> {
            let mut socket = Socket::new(NETLINK_ROUTE)
                .map_err(|e| RouteError::Netlink(format!("Failed to create socket: {}", e)))?;
            socket
                .bind_auto()
                .map_err(|e| RouteError::Netlink(format!("Failed to bind socket: {}", e)))?;
            socket
                .connect(&SocketAddr::new(0, 0))
                .map_err(|e| RouteError::Netlink(format!("Failed to connect socket: {}", e)))?;

            let table = Self {
                socket,
                sequence: 0,
                timeout,
                dumped: HashMap::new(),
                multipath: Vec::new(),
            };
            table.set_recv_timeout()?;
            debug!(?timeout, "Opened route netlink socket");
            Ok(table)
        }

        /// Bound blocking receives with SO_RCVTIMEO
        fn set_recv_timeout(&self) -> Result<()> {
            let fd = self.socket.as_raw_fd();
            let tv = libc::timeval {
                tv_sec: self.timeout.as_secs() as libc::time_t,
                tv_usec: self.timeout.subsec_micros() as libc::suseconds_t,
            };
            let ret = unsafe {
                libc::setsockopt(
                    fd,
                    libc::SOL_SOCKET,
                    libc::SO_RCVTIMEO,
                    &tv as *const _ as *const libc::c_void,
                    std::mem::size_of::<libc::timeval>() as libc::socklen_t,
                )
            };
            if ret < 0 {
                return Err(RouteError::Io(std::io::Error::last_os_error()));
            }
            Ok(())
        }

        /// Send one request and collect the replies that belong to it
        fn request(
            &mut self,
            message: RouteNetlinkMessage,
            flags: u16,
        ) -> Result<Vec<RouteNetlinkMessage>> {
            self.sequence = self.sequence.wrapping_add(1);
            let sequence = self.sequence;
            let dump = is_dump(flags);

            let mut header = NetlinkHeader::default();
            header.flags = flags;
            header.sequence_number = sequence;
            let mut packet = NetlinkMessage::new(header, NetlinkPayload::InnerMessage(message));
            packet.finalize();

            let mut buf = vec![0u8; packet.buffer_len()];
            packet.serialize(&mut buf);

            self.socket
                .send(&buf, 0)
                .map_err(|e| RouteError::Netlink(format!("Failed to send request: {}", e)))?;

            let mut replies = Vec::new();
            loop {
                let (data, _) = self.socket.recv_from_full().map_err(|e| {
                    if matches!(
                        e.kind(),
                        std::io::ErrorKind::WouldBlock | std::io::ErrorKind::TimedOut
                    ) {
                        RouteError::Timeout(self.timeout)
                    } else {
                        RouteError::Netlink(format!("Failed to receive: {}", e))
                    }
                })?;

                let mut offset = 0;
                while offset < data.len() {
                    let msg = NetlinkMessage::<RouteNetlinkMessage>::deserialize(&data[offset..])
                        .map_err(|e| {
                            RouteError::Netlink(format!("Failed to parse message: {}", e))
                        })?;

                    let length = msg.header.length as usize;
                    if length == 0 {
                        break;
                    }
                    // Align to 4 bytes (netlink alignment requirement)
                    offset = (offset + length + 3) & !3;

                    if msg.header.sequence_number != sequence {
                        trace!(
                            expected = sequence,
                            got = msg.header.sequence_number,
                            "Skipping reply to another request"
                        );
                        continue;
                    }

                    match msg.payload {
                        NetlinkPayload::InnerMessage(inner) => replies.push(inner),
                        NetlinkPayload::Done(_) => return Ok(replies),
                        NetlinkPayload::Error(err) => {
                            return match err.code {
                                Some(code) => Err(RouteError::kernel(-code.get())),
                                None if !dump => Ok(replies),
                                None => continue,
                            };
                        }
                        _ => {}
                    }
                }
            }
        }

        /// Dump every route of `family` in the main table
        fn dump_routes(&mut self, family: AddressFamily) -> Result<Vec<Route>> {
            let mut msg = RouteMessage::default();
            msg.header.address_family = to_netlink_family(family);
            let replies = self.request(
                RouteNetlinkMessage::GetRoute(msg),
                NLM_F_REQUEST | NLM_F_DUMP,
            )?;

            if family == AddressFamily::V4 {
                self.multipath.clear();
            }

            let mut routes = Vec::new();
            for reply in &replies {
                let RouteNetlinkMessage::NewRoute(msg) = reply else {
                    continue;
                };
                let parsed: Vec<Route> = parse_routes(msg)
                    .into_iter()
                    .filter(|route| route.table == MAIN_TABLE)
                    .collect();
                if family == AddressFamily::V4 {
                    if let Some(entry) = multipath_entry(msg, &parsed) {
                        trace!(hops = entry.hops.len(), "Tracking IPv4 multipath route");
                        self.multipath.push(entry);
                    }
                }
                routes.extend(parsed);
            }
            Ok(routes)
        }
    }

    impl RouteTable for NetlinkRouteTable {
        #[instrument(skip(self))]
        fn links(&mut self) -> Result<Vec<Link>> {
            let replies = self.request(
                RouteNetlinkMessage::GetLink(LinkMessage::default()),
                NLM_F_REQUEST | NLM_F_DUMP,
            )?;

            let links: Vec<Link> = replies
                .iter()
                .filter_map(|reply| match reply {
                    RouteNetlinkMessage::NewLink(msg) => Some(parse_link(msg)),
                    _ => None,
                })
                .collect();
            debug!(count = links.len(), "Listed links");
            Ok(links)
        }

        #[instrument(skip(self), fields(link = %link.name))]
        fn routes(&mut self, link: &Link, family: AddressFamily) -> Result<Vec<Route>> {
            if !self.dumped.contains_key(&family) {
                let dump = self.dump_routes(family)?;
                self.dumped.insert(family, dump);
            }

            let routes: Vec<Route> = self
                .dumped
                .get(&family)
                .into_iter()
                .flatten()
                .filter(|route| route.ifindex == link.index)
                .cloned()
                .collect();
            trace!(count = routes.len(), %family, "Listed routes");
            Ok(routes)
        }

        #[instrument(skip(self), fields(route = %route))]
        fn delete(&mut self, route: &Route) -> Result<()> {
            self.dumped.clear();

            let key = route.key();
            if let Some(index) = self.multipath.iter().position(|e| e.contains(&key)) {
                let remaining = self.multipath[index].without(&key);
                debug!(remaining = remaining.hops.len(), "Removing hop from multipath route");
                let (message, flags) = remaining.update_request();
                self.request(message, flags)?;
                if remaining.hops.is_empty() {
                    self.multipath.remove(index);
                } else {
                    self.multipath[index] = remaining;
                }
                return Ok(());
            }

            self.request(
                RouteNetlinkMessage::DelRoute(build_route_message(route)),
                NLM_F_REQUEST | NLM_F_ACK,
            )?;
            Ok(())
        }

        #[instrument(skip(self), fields(route = %route))]
        fn add(&mut self, route: &Route) -> Result<()> {
            self.dumped.clear();
            self.request(
                RouteNetlinkMessage::NewRoute(build_route_message(route)),
                NLM_F_REQUEST | NLM_F_ACK | NLM_F_CREATE | NLM_F_EXCL,
            )?;
            Ok(())
        }
    }

    fn to_netlink_family(family: AddressFamily) -> NlFamily {
        match family {
            AddressFamily::V4 => NlFamily::Inet,
            AddressFamily::V6 => NlFamily::Inet6,
        }
    }

    fn parse_link(msg: &LinkMessage) -> Link {
        let name = msg
            .attributes
            .iter()
            .find_map(|attr| match attr {
                LinkAttribute::IfName(name) => Some(name.clone()),
                _ => None,
            })
            .unwrap_or_default();
        Link::new(msg.header.index, name)
    }

    fn route_address_ip(addr: &RouteAddress) -> Option<IpAddr> {
        match addr {
            RouteAddress::Inet(v4) => Some(IpAddr::V4(*v4)),
            RouteAddress::Inet6(v6) => Some(IpAddr::V6(*v6)),
            _ => None,
        }
    }

    fn route_address(addr: IpAddr) -> RouteAddress {
        match addr {
            IpAddr::V4(v4) => RouteAddress::Inet(v4),
            IpAddr::V6(v6) => RouteAddress::Inet6(v6),
        }
    }

    fn next_hops(msg: &RouteMessage) -> Option<&[RouteNextHop]> {
        msg.attributes.iter().find_map(|attr| match attr {
            RouteAttribute::MultiPath(hops) => Some(hops.as_slice()),
            _ => None,
        })
    }

    /// Convert an RTM_NEWROUTE payload into routes, one per next hop
    fn parse_routes(msg: &RouteMessage) -> Vec<Route> {
        let Some(base) = parse_route(msg) else {
            return Vec::new();
        };
        match next_hops(msg) {
            Some(hops) if !hops.is_empty() => {
                hops.iter().map(|hop| hop_route(&base, hop)).collect()
            }
            _ => vec![base],
        }
    }

    fn hop_route(base: &Route, hop: &RouteNextHop) -> Route {
        let mut route = base.clone();
        route.ifindex = hop.interface_index;
        route.gateway = hop.attributes.iter().find_map(|attr| match attr {
            RouteAttribute::Gateway(addr) => route_address_ip(addr),
            _ => None,
        });
        route
    }

    /// Pair each parsed hop with its wire form so it can be removed later
    fn multipath_entry(msg: &RouteMessage, parsed: &[Route]) -> Option<MultipathEntry> {
        let hops = next_hops(msg)?;
        if hops.is_empty() || hops.len() != parsed.len() {
            return None;
        }
        Some(MultipathEntry {
            message: msg.clone(),
            hops: parsed
                .iter()
                .map(Route::key)
                .zip(hops.iter().cloned())
                .collect(),
        })
    }

    /// Convert the entry-level fields of an RTM_NEWROUTE payload
    fn parse_route(msg: &RouteMessage) -> Option<Route> {
        let family = match msg.header.address_family {
            NlFamily::Inet => AddressFamily::V4,
            NlFamily::Inet6 => AddressFamily::V6,
            _ => return None,
        };

        let mut route = Route::new(family);
        route.table = u32::from(msg.header.table);
        route.protocol = u8::from(msg.header.protocol);
        route.scope = u8::from(msg.header.scope);
        route.kind = u8::from(msg.header.kind);

        let mut destination = None;
        for attr in &msg.attributes {
            match attr {
                RouteAttribute::Destination(addr) => destination = route_address_ip(addr),
                RouteAttribute::Gateway(addr) => route.gateway = route_address_ip(addr),
                RouteAttribute::Oif(index) => route.ifindex = *index,
                RouteAttribute::Table(table) => route.table = *table,
                RouteAttribute::Priority(metric) => route.metric = Some(*metric),
                _ => {}
            }
        }

        route.destination = match destination {
            Some(addr) => {
                let prefix = IpPrefix::new(addr, msg.header.destination_prefix_length);
                if prefix.is_none() {
                    warn!(%addr, len = msg.header.destination_prefix_length, "Bad prefix length");
                    return None;
                }
                prefix
            }
            None => None,
        };

        Some(route)
    }

    /// Build the RTM_NEWROUTE/RTM_DELROUTE payload for `route`
    fn build_route_message(route: &Route) -> RouteMessage {
        let mut msg = RouteMessage::default();
        msg.header.address_family = to_netlink_family(route.family);
        msg.header.destination_prefix_length = route.destination.map_or(0, |dst| dst.len());
        msg.header.table = u8::try_from(route.table).unwrap_or(RT_TABLE_UNSPEC);
        msg.header.protocol = RouteProtocol::from(route.protocol);
        msg.header.scope = RouteScope::from(route.scope);
        msg.header.kind = RouteType::from(route.kind);

        if let Some(dst) = route.destination {
            msg.attributes
                .push(RouteAttribute::Destination(route_address(dst.addr())));
        }
        if let Some(gw) = route.gateway {
            msg.attributes.push(RouteAttribute::Gateway(route_address(gw)));
        }
        if route.ifindex != 0 {
            msg.attributes.push(RouteAttribute::Oif(route.ifindex));
        }
        msg.attributes.push(RouteAttribute::Table(route.table));
        if let Some(metric) = route.metric {
            msg.attributes.push(RouteAttribute::Priority(metric));
        }
        msg
    }

}

#[cfg(target_os = "linux")]
pub use linux::*;

/// Mock implementation for non-Linux platforms (development only)
#[cfg(not(target_os = "linux"))]
mod mock {
    use crate::error::Result;
    use crate::table::{Link, RouteTable};
    use crate::types::{AddressFamily, Route};
    use std::time::Duration;

    pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);

    pub struct NetlinkRouteTable;

    impl NetlinkRouteTable {
        pub fn with_timeout(_timeout: Duration) -> Result<Self> {
            Ok(Self)
        }
    }

    impl RouteTable for NetlinkRouteTable {
        fn links(&mut self) -> Result<Vec<Link>> {
            Ok(Vec::new())
        }

        fn routes(&mut self, _link: &Link, _family: AddressFamily) -> Result<Vec<Route>> {
            Ok(Vec::new())
        }

        fn delete(&mut self, _route: &Route) -> Result<()> {
            Ok(())
        }

        fn add(&mut self, _route: &Route) -> Result<()> {
            Ok(())
        }
    }
}

#[cfg(not(target_os = "linux"))]
pub use mock::*;
