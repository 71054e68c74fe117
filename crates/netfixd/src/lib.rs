//! netfixd - container default route repair daemon
//!
//! Watches the container engine for started containers and reconciles the
//! default routes inside each container's network namespace using
//! [`netfix_route`].
//!
//! # Module Structure
//!
//! - [`config`]: TOML configuration (`NetfixConfig`)
//! - [`runtime`]: Container engine abstraction (`ContainerRuntime` trait)
//! - [`docker`]: Docker engine implementation (`DockerRuntime`)
//! - [`trigger`]: Namespace entry (`ReexecTrigger`, `SetnsTrigger`)
//! - [`watcher`]: Event loop (`Watcher`)
//! - [`logging`]: Subscriber setup

pub mod config;
pub mod docker;
pub mod error;
pub mod logging;
pub mod runtime;
pub mod trigger;
pub mod watcher;

pub use config::{EntryMode, LogFormat, NetfixConfig, DEFAULT_CONFIG_PATH};
pub use docker::DockerRuntime;
pub use error::{NetfixError, Result};
pub use logging::init_logging;
pub use runtime::{ContainerRef, ContainerRuntime};
pub use trigger::{NamespaceTarget, NamespaceTrigger, ReexecTrigger, SetnsTrigger};
pub use watcher::{WatchSettings, WatchStats, Watcher};
