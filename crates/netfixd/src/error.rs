//! Error types for netfixd

use std::path::PathBuf;
use std::process::ExitStatus;
use std::time::Duration;

use netfix_route::RouteError;
use thiserror::Error;

/// Errors raised by the watcher, the namespace trigger and configuration
#[derive(Debug, Error)]
pub enum NetfixError {
    /// Container engine request failed
    #[error("Container runtime error: {0}")]
    Runtime(String),

    /// The engine's event stream ended or broke
    #[error("Container event stream closed: {0}")]
    EventStreamClosed(String),

    /// Reconciliation failed inside the namespace
    #[error("Route reconciliation failed: {0}")]
    Route(#[from] RouteError),

    /// Could not open or enter a network namespace
    #[error("Could not enter network namespace {}: {message}", path.display())]
    Namespace {
        /// Namespace file (e.g. /proc/<pid>/ns/net)
        path: PathBuf,
        /// Underlying failure
        message: String,
    },

    /// The re-executed child exited unsuccessfully
    #[error("Namespace command '{command}' exited with {status}")]
    Reexec {
        /// Command line that was run
        command: String,
        /// Exit status of the child
        status: ExitStatus,
    },

    /// The re-executed child could not be spawned
    #[error("Failed to spawn '{command}': {source}")]
    Spawn {
        /// Command line that was run
        command: String,
        /// Underlying IO error
        #[source]
        source: std::io::Error,
    },

    /// Reconciliation did not finish in time
    #[error("Reconciliation of {id} timed out after {after:?}")]
    Timeout {
        /// Container name
        id: String,
        /// Bound that expired
        after: Duration,
    },

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl NetfixError {
    /// True if this error concerns a single container and must not stop the
    /// watch loop.
    pub fn is_per_container(&self) -> bool {
        matches!(
            self,
            Self::Route(_)
                | Self::Namespace { .. }
                | Self::Reexec { .. }
                | Self::Spawn { .. }
                | Self::Timeout { .. }
                | Self::Runtime(_)
        )
    }
}

impl From<bollard::errors::Error> for NetfixError {
    fn from(e: bollard::errors::Error) -> Self {
        Self::Runtime(e.to_string())
    }
}

/// Result type alias for netfixd operations
pub type Result<T> = std::result::Result<T, NetfixError>;
