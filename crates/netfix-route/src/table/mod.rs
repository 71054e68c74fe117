//! Kernel route table access
//!
//! [`RouteTable`] is the only seam between the reconciler and kernel state.
//! It is synchronous: every call blocks until the kernel has answered.

mod memory;
mod netlink;

pub use memory::{MemoryRouteTable, Mutation};
pub use netlink::{NetlinkRouteTable, DEFAULT_TIMEOUT};

use crate::error::Result;
use crate::types::{AddressFamily, Route};

/// A network link inside the current namespace
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Link {
    /// Interface index
    pub index: u32,
    /// Interface name (IFLA_IFNAME), empty if the kernel did not report one
    pub name: String,
}

impl Link {
    /// Create a link
    pub fn new(index: u32, name: impl Into<String>) -> Self {
        Self {
            index,
            name: name.into(),
        }
    }
}

/// Route table of the network namespace the process is attached to
pub trait RouteTable {
    /// List every link in the namespace
    fn links(&mut self) -> Result<Vec<Link>>;

    /// List the routes of `family` whose output interface is `link`
    fn routes(&mut self, link: &Link, family: AddressFamily) -> Result<Vec<Route>>;

    /// Delete an installed route
    fn delete(&mut self, route: &Route) -> Result<()>;

    /// Install a new route; fails if an identical route exists
    fn add(&mut self, route: &Route) -> Result<()>;
}

impl<T: RouteTable + ?Sized> RouteTable for &mut T {
    fn links(&mut self) -> Result<Vec<Link>> {
        (**self).links()
    }

    fn routes(&mut self, link: &Link, family: AddressFamily) -> Result<Vec<Route>> {
        (**self).routes(link, family)
    }

    fn delete(&mut self, route: &Route) -> Result<()> {
        (**self).delete(route)
    }

    fn add(&mut self, route: &Route) -> Result<()> {
        (**self).add(route)
    }
}
