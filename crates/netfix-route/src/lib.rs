//! Default route reconciliation for multi-homed container namespaces
//!
//! When a container joins several networks, the engine installs a default
//! route per network. This crate reads the route table of the namespace the
//! process is attached to, picks the one correct default route and converges
//! the kernel to it.
//!
//! # Architecture
//!
//! ```text
//! ┌────────────────┐     ┌──────────────────┐     ┌──────────────────┐
//! │  RouteTable    │────▶│    Classifier    │────▶│     Selector     │
//! │ (netlink/mem)  │     │ default/LAN/ULA  │     │ SelectionPolicy  │
//! └────────────────┘     └──────────────────┘     └──────────────────┘
//!         ▲                                                │
//!         │                 ┌──────────────────┐           │
//!         └─────────────────│    Reconciler    │◀──────────┘
//!            delete, add    │  (state machine) │  RoutePlan
//!                           └──────────────────┘
//! ```
//!
//! The core never enters a namespace itself; see [`reconcile_current_namespace`].

pub mod classify;
pub mod error;
pub mod reconcile;
pub mod select;
pub mod table;
pub mod types;

pub use classify::{classify, is_default_route, is_lan_route, is_namespace_gateway, RouteLabel};
pub use error::{Result, RouteError, RouteOp};
pub use reconcile::{reconcile_current_namespace, ReconcileReport, ReconcileState, Reconciler};
pub use select::{RoutePlan, Selection, SelectionPolicy, SkipReason};
pub use table::{Link, MemoryRouteTable, Mutation, NetlinkRouteTable, RouteTable, DEFAULT_TIMEOUT};
pub use types::{AddressFamily, IpPrefix, Route, RouteKey, MAIN_TABLE};
