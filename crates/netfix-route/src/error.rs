//! Error types for route reconciliation
//!
//! Classification and selection never fail. Every error originates from
//! kernel I/O: either listing links/routes or mutating the route table.

use std::fmt;
use std::io;
use std::time::Duration;

use thiserror::Error;

/// Route table mutation kind
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RouteOp {
    /// RTM_DELROUTE
    Delete,
    /// RTM_NEWROUTE with NLM_F_CREATE | NLM_F_EXCL
    Add,
}

impl fmt::Display for RouteOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Delete => f.write_str("delete"),
            Self::Add => f.write_str("add"),
        }
    }
}

/// Errors that can occur while reading or converging a route table
#[derive(Debug, Error)]
pub enum RouteError {
    /// Listing links or routes failed; nothing was mutated
    #[error("could not list {what}: {source}")]
    Enumeration {
        /// What was being listed (e.g. "links", "IPv4 routes on eth0")
        what: String,
        /// Underlying failure
        #[source]
        source: Box<RouteError>,
    },

    /// A single delete/add was rejected; earlier mutations stay in place
    #[error("could not {op} route {route}: {source}")]
    Mutation {
        /// Operation that failed
        op: RouteOp,
        /// Route as it was submitted to the kernel
        route: String,
        /// Underlying failure
        #[source]
        source: Box<RouteError>,
    },

    /// Netlink socket or codec failure
    #[error("Netlink error: {0}")]
    Netlink(String),

    /// Kernel answered with a negative errno
    #[error("kernel rejected request: {message} (errno {errno})")]
    Kernel {
        /// Positive errno value
        errno: i32,
        /// strerror text
        message: String,
    },

    /// No reply from the kernel within the receive timeout
    #[error("no reply from kernel within {0:?}")]
    Timeout(Duration),

    /// Malformed "address/len" string
    #[error("invalid prefix '{0}'")]
    InvalidPrefix(String),

    /// Unknown selection policy name
    #[error("unknown selection policy '{0}' (expected 'lan-aware' or 'prefer-existing')")]
    UnknownPolicy(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

impl RouteError {
    /// Wrap an error raised while listing `what`.
    pub fn enumeration(what: impl Into<String>, source: RouteError) -> Self {
        Self::Enumeration {
            what: what.into(),
            source: Box::new(source),
        }
    }

    /// Wrap an error raised while applying `op` to `route`.
    pub fn mutation(op: RouteOp, route: impl fmt::Display, source: RouteError) -> Self {
        Self::Mutation {
            op,
            route: route.to_string(),
            source: Box::new(source),
        }
    }

    /// Build a kernel error from a positive errno.
    pub fn kernel(errno: i32) -> Self {
        Self::Kernel {
            errno,
            message: io::Error::from_raw_os_error(errno).to_string(),
        }
    }

    /// Returns the kernel errno behind this error, if any.
    pub fn errno(&self) -> Option<i32> {
        match self {
            Self::Kernel { errno, .. } => Some(*errno),
            Self::Enumeration { source, .. } | Self::Mutation { source, .. } => source.errno(),
            Self::Io(e) => e.raw_os_error(),
            _ => None,
        }
    }
}

/// Result type alias for route operations
pub type Result<T> = std::result::Result<T, RouteError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mutation_error_display() {
        let err = RouteError::mutation(
            RouteOp::Delete,
            "default via 172.18.0.1 dev #12 table 254",
            RouteError::kernel(libc::ESRCH),
        );
        let text = err.to_string();
        assert!(text.starts_with("could not delete route default via 172.18.0.1"));
        assert!(text.contains("errno 3"));
    }

    #[test]
    fn test_enumeration_error_display() {
        let err = RouteError::enumeration("links", RouteError::Netlink("socket closed".into()));
        assert_eq!(
            err.to_string(),
            "could not list links: Netlink error: socket closed"
        );
    }

    #[test]
    fn test_errno_is_found_through_wrappers() {
        let err = RouteError::mutation(RouteOp::Add, "x", RouteError::kernel(libc::EEXIST));
        assert_eq!(err.errno(), Some(libc::EEXIST));
        assert_eq!(RouteError::Timeout(Duration::from_secs(1)).errno(), None);
    }

    #[test]
    fn test_route_op_display() {
        assert_eq!(RouteOp::Delete.to_string(), "delete");
        assert_eq!(RouteOp::Add.to_string(), "add");
    }
}
