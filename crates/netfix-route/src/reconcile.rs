//! Route Reconciler
//!
//! Runs entirely inside the namespace the process is attached to:
//!
//! ```text
//! Start -> Enumerated -> Classified -> Selected -> Converged
//!    \__________\______________\___________\_____> Failed
//! ```
//!
//! There is no internal retry. Mutations already applied when a later one
//! fails are left in place; the kernel route table is not transactional.

use std::time::Duration;

use tracing::{debug, info, instrument, warn};

use crate::classify::{classify, RouteLabel};
use crate::error::{Result, RouteError, RouteOp};
use crate::select::{Selection, SelectionPolicy, SkipReason};
use crate::table::{NetlinkRouteTable, RouteTable};
use crate::types::{AddressFamily, Route};

/// Reconciler state machine position
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconcileState {
    Start,
    Enumerated,
    Classified,
    Selected,
    /// Terminal: desired state reached (or nothing to do)
    Converged,
    /// Terminal: run aborted with an error
    Failed,
}

/// What a successful run observed and changed
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconcileReport {
    /// Correlation id supplied by the caller
    pub id: String,
    /// Policy applied
    pub policy: SelectionPolicy,
    /// Routes enumerated across both families
    pub routes_seen: usize,
    /// Set when the namespace needed no reconciliation
    pub skipped: Option<SkipReason>,
    /// Routes deleted (or that would be, in a dry run)
    pub deleted: Vec<Route>,
    /// Route added (or that would be, in a dry run)
    pub added: Option<Route>,
    /// True if the kernel was not touched
    pub dry_run: bool,
}

impl ReconcileReport {
    /// Number of kernel mutations performed (or planned)
    pub fn mutations(&self) -> usize {
        self.deleted.len() + usize::from(self.added.is_some())
    }
}

/// Converges the default routes of one namespace
pub struct Reconciler<T> {
    table: T,
    policy: SelectionPolicy,
    dry_run: bool,
    state: ReconcileState,
}

impl<T: RouteTable> Reconciler<T> {
    /// Create a reconciler over `table` applying `policy`
    pub fn new(table: T, policy: SelectionPolicy) -> Self {
        Self {
            table,
            policy,
            dry_run: false,
            state: ReconcileState::Start,
        }
    }

    /// Plan and log mutations without applying them
    pub fn dry_run(mut self, dry_run: bool) -> Self {
        self.dry_run = dry_run;
        self
    }

    /// Current state machine position
    pub fn state(&self) -> ReconcileState {
        self.state
    }

    /// Underlying route table
    pub fn table(&self) -> &T {
        &self.table
    }

    /// Consume the reconciler, returning the route table
    pub fn into_table(self) -> T {
        self.table
    }

    /// Run one reconciliation, logging under `id`
    #[instrument(skip(self), fields(policy = %self.policy))]
    pub fn run(&mut self, id: &str) -> Result<ReconcileReport> {
        self.state = ReconcileState::Start;
        info!("[{id}] Netcheck starting");

        let result = self.converge(id);
        match &result {
            Ok(report) => {
                self.advance(ReconcileState::Converged);
                info!(
                    deleted = report.deleted.len(),
                    added = report.added.is_some(),
                    dry_run = report.dry_run,
                    "[{id}] Netcheck finished successfully"
                );
            }
            Err(e) => {
                self.advance(ReconcileState::Failed);
                warn!(error = %e, "[{id}] Netcheck failed");
            }
        }
        result
    }

    fn advance(&mut self, next: ReconcileState) {
        debug!(from = ?self.state, to = ?next, "Reconciler state change");
        self.state = next;
    }

    fn converge(&mut self, id: &str) -> Result<ReconcileReport> {
        let routes = self.enumerate()?;
        self.advance(ReconcileState::Enumerated);

        for route in &routes {
            let label = classify(route);
            if label != RouteLabel::Other {
                debug!(route = %route, ?label, "[{id}] Classified route");
            }
        }
        self.advance(ReconcileState::Classified);

        let selection = self.policy.select(&routes);
        self.advance(ReconcileState::Selected);

        let mut report = ReconcileReport {
            id: id.to_string(),
            policy: self.policy,
            routes_seen: routes.len(),
            skipped: None,
            deleted: Vec::new(),
            added: None,
            dry_run: self.dry_run,
        };

        let plan = match selection {
            Selection::Skip(reason) => {
                info!(%reason, "[{id}] Nothing to reconcile");
                report.skipped = Some(reason);
                return Ok(report);
            }
            Selection::Plan(plan) => plan,
        };

        if plan.is_empty() {
            info!("[{id}] Default routes already converged");
            return Ok(report);
        }

        for route in plan.deletions {
            info!(route = %route, "[{id}] Deleting Default{}", family_tag(route.family));
            if !self.dry_run {
                self.table
                    .delete(&route)
                    .map_err(|e| RouteError::mutation(RouteOp::Delete, &route, e))?;
            }
            report.deleted.push(route);
        }

        if let Some(route) = plan.addition {
            info!(route = %route, "[{id}] Adding Default{}", family_tag(route.family));
            if !self.dry_run {
                self.table
                    .add(&route)
                    .map_err(|e| RouteError::mutation(RouteOp::Add, &route, e))?;
            }
            report.added = Some(route);
        }

        Ok(report)
    }

    /// Read every route of both families on every link
    fn enumerate(&mut self) -> Result<Vec<Route>> {
        let links = self
            .table
            .links()
            .map_err(|e| RouteError::enumeration("links", e))?;

        let mut routes = Vec::new();
        for link in &links {
            for family in AddressFamily::ALL {
                let found = self.table.routes(link, family).map_err(|e| {
                    RouteError::enumeration(format!("{family} routes on {}", link.name), e)
                })?;
                routes.extend(found);
            }
        }

        debug!(links = links.len(), routes = routes.len(), "Enumerated route table");
        Ok(routes)
    }
}

fn family_tag(family: AddressFamily) -> &'static str {
    match family {
        AddressFamily::V4 => "V4",
        AddressFamily::V6 => "V6",
    }
}

/// Reconcile the namespace the calling thread is currently attached to.
///
/// Opens a fresh netlink socket, so it must be called after any namespace
/// switch. `timeout` bounds each kernel round trip.
pub fn reconcile_current_namespace(
    id: &str,
    policy: SelectionPolicy,
    dry_run: bool,
    timeout: Duration,
) -> Result<ReconcileReport> {
    let table = NetlinkRouteTable::with_timeout(timeout)?;
    Reconciler::new(table, policy).dry_run(dry_run).run(id)
}
