//! Configuration file support for netfixd
//!
//! Loads and validates configuration from a TOML file.
//! Default location: /etc/netfix/netfixd.toml

use crate::error::{NetfixError, Result};
use netfix_route::SelectionPolicy;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Default configuration file path
pub const DEFAULT_CONFIG_PATH: &str = "/etc/netfix/netfixd.toml";

/// Log levels accepted in `[logging] level`
const LOG_LEVELS: [&str; 5] = ["trace", "debug", "info", "warn", "error"];

/// Reconciliation settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReconcileConfig {
    /// Default route selection policy
    #[serde(default)]
    pub policy: SelectionPolicy,

    /// Bound on each kernel round trip (netlink receive timeout)
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,

    /// Log planned mutations without applying them
    #[serde(default)]
    pub dry_run: bool,
}

/// How the reconciler gets into a container's network namespace
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntryMode {
    /// Re-execute this binary under `nsenter --net=...`
    #[default]
    Reexec,
    /// Call setns(2) from a dedicated thread
    Setns,
}

impl std::str::FromStr for EntryMode {
    type Err = NetfixError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "reexec" => Ok(Self::Reexec),
            "setns" => Ok(Self::Setns),
            other => Err(NetfixError::Config(format!(
                "unknown namespace mode '{other}' (expected 'reexec' or 'setns')"
            ))),
        }
    }
}

/// Namespace entry settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NamespaceConfig {
    /// Entry mechanism
    #[serde(default)]
    pub mode: EntryMode,

    /// Host root filesystem prefix used to reach /proc (e.g. "/host")
    #[serde(default)]
    pub rootfs: PathBuf,

    /// nsenter binary used by the re-exec mode
    #[serde(default = "default_nsenter_path")]
    pub nsenter_path: PathBuf,
}

/// Event watcher settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WatchConfig {
    /// Reconciliations allowed in flight at once
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent: usize,

    /// Reconcile already running containers at startup
    #[serde(default = "default_initial_scan")]
    pub initial_scan: bool,

    /// Bound on one container's reconciliation end to end
    #[serde(default = "default_trigger_timeout_secs")]
    pub trigger_timeout_secs: u64,
}

/// Log output format
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Compact,
    Json,
}

/// Logging settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Level filter when RUST_LOG is unset
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Output format
    #[serde(default)]
    pub format: LogFormat,
}

/// Complete netfixd configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NetfixConfig {
    #[serde(default)]
    pub reconcile: ReconcileConfig,

    #[serde(default)]
    pub namespace: NamespaceConfig,

    #[serde(default)]
    pub watch: WatchConfig,

    #[serde(default)]
    pub logging: LoggingConfig,
}

// Default functions
fn default_timeout_secs() -> u64 {
    netfix_route::DEFAULT_TIMEOUT.as_secs()
}

fn default_nsenter_path() -> PathBuf {
    PathBuf::from("nsenter")
}

fn default_max_concurrent() -> usize {
    4
}

fn default_initial_scan() -> bool {
    true
}

fn default_trigger_timeout_secs() -> u64 {
    30
}

fn default_log_level() -> String {
    "info".to_string()
}

// Default implementations
impl Default for ReconcileConfig {
    fn default() -> Self {
        Self {
            policy: SelectionPolicy::default(),
            timeout_secs: default_timeout_secs(),
            dry_run: false,
        }
    }
}

impl Default for NamespaceConfig {
    fn default() -> Self {
        Self {
            mode: EntryMode::default(),
            rootfs: PathBuf::new(),
            nsenter_path: default_nsenter_path(),
        }
    }
}

impl Default for WatchConfig {
    fn default() -> Self {
        Self {
            max_concurrent: default_max_concurrent(),
            initial_scan: default_initial_scan(),
            trigger_timeout_secs: default_trigger_timeout_secs(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: LogFormat::default(),
        }
    }
}

impl NetfixConfig {
    /// Read configuration from file. `Ok(None)` means the file does not
    /// exist; the caller decides on defaults and reports it once logging is up.
    pub fn read(path: impl AsRef<Path>) -> Result<Option<Self>> {
        let path = path.as_ref();

        match fs::read_to_string(path) {
            Ok(content) => toml::from_str(&content).map(Some).map_err(|e| {
                NetfixError::Config(format!(
                    "Failed to parse config file {}: {}",
                    path.display(),
                    e
                ))
            }),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(NetfixError::Io(e)),
        }
    }

    /// Kernel round-trip timeout as Duration
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.reconcile.timeout_secs)
    }

    /// Bound on one whole container reconciliation, including namespace entry
    pub fn trigger_timeout(&self) -> Duration {
        Duration::from_secs(self.watch.trigger_timeout_secs)
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if self.reconcile.timeout_secs == 0 {
            return Err(NetfixError::Config("timeout_secs must be > 0".to_string()));
        }

        if self.watch.trigger_timeout_secs < self.reconcile.timeout_secs {
            return Err(NetfixError::Config(
                "trigger_timeout_secs must be >= timeout_secs".to_string(),
            ));
        }

        if self.watch.max_concurrent == 0 {
            return Err(NetfixError::Config(
                "max_concurrent must be > 0".to_string(),
            ));
        }

        if !LOG_LEVELS.contains(&self.logging.level.as_str()) {
            return Err(NetfixError::Config(format!(
                "unknown log level '{}'",
                self.logging.level
            )));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_default_config() {
        let config = NetfixConfig::default();
        assert_eq!(config.reconcile.policy, SelectionPolicy::LanAware);
        assert_eq!(config.reconcile.timeout_secs, 5);
        assert!(!config.reconcile.dry_run);
        assert_eq!(config.namespace.mode, EntryMode::Reexec);
        assert_eq!(config.namespace.nsenter_path, PathBuf::from("nsenter"));
        assert_eq!(config.watch.max_concurrent, 4);
        assert!(config.watch.initial_scan);
        assert_eq!(config.logging.level, "info");
        assert_eq!(config.logging.format, LogFormat::Compact);
    }

    #[test]
    fn test_toml_deserialization() {
        let toml_str = r#"
[reconcile]
policy = "prefer-existing"

[namespace]
mode = "setns"
rootfs = "/host"

[logging]
format = "json"
"#;
        let config: NetfixConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(config.reconcile.policy, SelectionPolicy::PreferExisting);
        assert_eq!(config.namespace.mode, EntryMode::Setns);
        assert_eq!(config.namespace.rootfs, PathBuf::from("/host"));
        assert_eq!(config.logging.format, LogFormat::Json);
        // Unspecified values should use defaults
        assert_eq!(config.reconcile.timeout_secs, 5);
        assert_eq!(config.watch.max_concurrent, 4);
    }

    #[test]
    fn test_unknown_policy_rejected() {
        let toml_str = "[reconcile]\npolicy = \"newest\"\n";
        assert!(toml::from_str::<NetfixConfig>(toml_str).is_err());
    }

    #[test]
    fn test_validate() {
        assert!(NetfixConfig::default().validate().is_ok());

        let mut config = NetfixConfig::default();
        config.reconcile.timeout_secs = 0;
        assert!(config.validate().is_err());

        let mut config = NetfixConfig::default();
        config.watch.max_concurrent = 0;
        assert!(config.validate().is_err());

        let mut config = NetfixConfig::default();
        config.watch.trigger_timeout_secs = 1;
        assert!(config.validate().is_err());

        let mut config = NetfixConfig::default();
        config.logging.level = "loud".into();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_durations() {
        let config = NetfixConfig::default();
        assert_eq!(config.timeout(), Duration::from_secs(5));
        assert_eq!(config.trigger_timeout(), Duration::from_secs(30));
    }

    #[test]
    fn test_entry_mode_parse() {
        assert_eq!("setns".parse::<EntryMode>().unwrap(), EntryMode::Setns);
        assert_eq!("reexec".parse::<EntryMode>().unwrap(), EntryMode::Reexec);
        assert!("fork".parse::<EntryMode>().is_err());
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[watch]\nmax_concurrent = 1").unwrap();
        let config = NetfixConfig::read(file.path()).unwrap().unwrap();
        assert_eq!(config.watch.max_concurrent, 1);
    }

    #[test]
    fn test_load_malformed_file_fails() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[watch\nmax_concurrent = ").unwrap();
        assert!(matches!(
            NetfixConfig::read(file.path()),
            Err(NetfixError::Config(_))
        ));
    }

    #[test]
    fn test_read_nonexistent_file() {
        assert!(NetfixConfig::read("/nonexistent/netfixd.toml")
            .unwrap()
            .is_none());
    }

    #[test]
    fn test_default_timeout_matches_route_table() {
        assert_eq!(
            NetfixConfig::default().timeout(),
            netfix_route::DEFAULT_TIMEOUT
        );
    }
}
