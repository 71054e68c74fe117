//! In-memory route table
//!
//! Behaves like the kernel for the operations the reconciler uses: deleting
//! a missing route fails with ESRCH, adding a duplicate fails with EEXIST.
//! Every successful mutation is recorded.

use crate::error::{Result, RouteError, RouteOp};
use crate::table::{Link, RouteTable};
use crate::types::{AddressFamily, Route};

/// Mutation applied to a [`MemoryRouteTable`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Mutation {
    /// Route removed
    Deleted(Route),
    /// Route installed
    Added(Route),
}

/// Route table backed by a `Vec`
#[derive(Debug, Clone, Default)]
pub struct MemoryRouteTable {
    links: Vec<Link>,
    routes: Vec<Route>,
    mutations: Vec<Mutation>,
    fail_on: Option<RouteOp>,
    fail_enumeration: bool,
}

impl MemoryRouteTable {
    /// Empty namespace
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a link
    pub fn with_link(mut self, index: u32, name: &str) -> Self {
        self.links.push(Link::new(index, name));
        self
    }

    /// Install a route without recording a mutation
    pub fn with_route(mut self, route: Route) -> Self {
        self.routes.push(route);
        self
    }

    /// Fail the next `op` with EPERM
    pub fn fail_on(mut self, op: RouteOp) -> Self {
        self.fail_on = Some(op);
        self
    }

    /// Fail every link listing
    pub fn fail_enumeration(mut self) -> Self {
        self.fail_enumeration = true;
        self
    }

    /// Currently installed routes
    pub fn installed(&self) -> &[Route] {
        &self.routes
    }

    /// Installed routes of `family` matching `predicate`
    pub fn installed_where(
        &self,
        family: AddressFamily,
        predicate: impl Fn(&Route) -> bool,
    ) -> Vec<&Route> {
        self.routes
            .iter()
            .filter(|r| r.family == family && predicate(*r))
            .collect()
    }

    /// Mutations applied so far
    pub fn mutations(&self) -> &[Mutation] {
        &self.mutations
    }

    /// Forget recorded mutations
    pub fn clear_mutations(&mut self) {
        self.mutations.clear();
    }

    fn injected_failure(&mut self, op: RouteOp) -> Result<()> {
        if self.fail_on == Some(op) {
            self.fail_on = None;
            return Err(RouteError::kernel(libc::EPERM));
        }
        Ok(())
    }
}

impl RouteTable for MemoryRouteTable {
    fn links(&mut self) -> Result<Vec<Link>> {
        if self.fail_enumeration {
            return Err(RouteError::Netlink("link dump refused".into()));
        }
        Ok(self.links.clone())
    }

    fn routes(&mut self, link: &Link, family: AddressFamily) -> Result<Vec<Route>> {
        Ok(self
            .routes
            .iter()
            .filter(|r| r.ifindex == link.index && r.family == family)
            .cloned()
            .collect())
    }

    fn delete(&mut self, route: &Route) -> Result<()> {
        self.injected_failure(RouteOp::Delete)?;
        let key = route.key();
        let position = self
            .routes
            .iter()
            .position(|r| r.key() == key)
            .ok_or_else(|| RouteError::kernel(libc::ESRCH))?;
        let removed = self.routes.remove(position);
        self.mutations.push(Mutation::Deleted(removed));
        Ok(())
    }

    fn add(&mut self, route: &Route) -> Result<()> {
        self.injected_failure(RouteOp::Add)?;
        let key = route.key();
        if self.routes.iter().any(|r| r.key() == key) {
            return Err(RouteError::kernel(libc::EEXIST));
        }
        self.routes.push(route.clone());
        self.mutations.push(Mutation::Added(route.clone()));
        Ok(())
    }
}
