//! Running the reconciler inside a container's network namespace
//!
//! Two entry mechanisms are supported:
//!
//! - [`ReexecTrigger`] re-executes this binary under
//!   `nsenter --net=<rootfs>/proc/<pid>/ns/net <exe> --netcheck <name>`.
//!   The child does the work and its exit status is the result. Policy, dry
//!   run and log level are forwarded so the child behaves like the parent.
//! - [`SetnsTrigger`] moves a dedicated OS thread into the namespace with
//!   setns(2) and reconciles there. The thread exits afterwards, so no other
//!   task ever runs in the container's namespace.

use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use netfix_route::SelectionPolicy;
use tokio::process::Command;
use tracing::{debug, instrument};

use crate::config::NetfixConfig;
use crate::error::{NetfixError, Result};
use crate::runtime::ContainerRef;

/// A container whose namespace should be reconciled
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NamespaceTarget {
    pub container: ContainerRef,
    /// Pid of the container's init process on the host
    pub pid: u32,
}

impl NamespaceTarget {
    pub fn new(container: ContainerRef, pid: u32) -> Self {
        Self { container, pid }
    }

    /// Correlation id for logs
    pub fn name(&self) -> &str {
        &self.container.name
    }

    /// Network namespace file of the init process under `rootfs`
    pub fn ns_path(&self, rootfs: &Path) -> PathBuf {
        netns_path(rootfs, self.pid)
    }
}

/// `<rootfs>/proc/<pid>/ns/net`; an empty rootfs means "/".
pub fn netns_path(rootfs: &Path, pid: u32) -> PathBuf {
    let relative = format!("proc/{pid}/ns/net");
    if rootfs.as_os_str().is_empty() {
        Path::new("/").join(relative)
    } else {
        rootfs.join(relative)
    }
}

/// Runs one reconciliation inside a target's namespace
#[async_trait]
pub trait NamespaceTrigger: Send + Sync {
    async fn trigger(&self, target: &NamespaceTarget) -> Result<()>;
}

/// Re-executes the current binary in the target namespace via nsenter
#[derive(Debug, Clone)]
pub struct ReexecTrigger {
    nsenter: PathBuf,
    exe: PathBuf,
    rootfs: PathBuf,
    policy: SelectionPolicy,
    dry_run: bool,
    log_level: String,
    config_path: Option<PathBuf>,
}

impl ReexecTrigger {
    /// Build from configuration; `exe` is the binary to re-execute.
    pub fn new(config: &NetfixConfig, exe: impl Into<PathBuf>) -> Self {
        Self {
            nsenter: config.namespace.nsenter_path.clone(),
            exe: exe.into(),
            rootfs: config.namespace.rootfs.clone(),
            policy: config.reconcile.policy,
            dry_run: config.reconcile.dry_run,
            log_level: config.logging.level.clone(),
            config_path: None,
        }
    }

    /// Forward `--config <path>` to the child
    pub fn with_config_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.config_path = Some(path.into());
        self
    }

    /// Arguments passed to nsenter
    pub fn command_args(&self, target: &NamespaceTarget) -> Vec<OsString> {
        let mut net = OsString::from("--net=");
        net.push(target.ns_path(&self.rootfs));

        let mut args = vec![
            net,
            self.exe.clone().into_os_string(),
            OsString::from("--netcheck"),
            OsString::from(target.name()),
            OsString::from("--policy"),
            OsString::from(self.policy.as_str()),
            OsString::from("--log-level"),
            OsString::from(&self.log_level),
        ];
        if self.dry_run {
            args.push(OsString::from("--dry-run"));
        }
        if let Some(path) = &self.config_path {
            args.push(OsString::from("--config"));
            args.push(path.clone().into_os_string());
        }
        args
    }

    fn command_line(&self, args: &[OsString]) -> String {
        std::iter::once(self.nsenter.as_os_str())
            .chain(args.iter().map(OsString::as_os_str))
            .map(|s| s.to_string_lossy())
            .collect::<Vec<_>>()
            .join(" ")
    }
}

#[async_trait]
impl NamespaceTrigger for ReexecTrigger {
    #[instrument(skip(self, target), fields(container = %target.name(), pid = target.pid))]
    async fn trigger(&self, target: &NamespaceTarget) -> Result<()> {
        let args = self.command_args(target);
        let command = self.command_line(&args);
        debug!(command = %command, "Re-executing in container namespace");

        // Child output goes straight to ours so its log lines are not lost
        let status = Command::new(&self.nsenter)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::inherit())
            .stderr(Stdio::inherit())
            .kill_on_drop(true)
            .status()
            .await
            .map_err(|e| NetfixError::Spawn {
                command: command.clone(),
                source: e,
            })?;

        if status.success() {
            Ok(())
        } else {
            Err(NetfixError::Reexec { command, status })
        }
    }
}

/// Enters the target namespace on a dedicated thread with setns(2)
#[derive(Debug, Clone)]
pub struct SetnsTrigger {
    rootfs: PathBuf,
    policy: SelectionPolicy,
    dry_run: bool,
    timeout: Duration,
}

impl SetnsTrigger {
    pub fn new(config: &NetfixConfig) -> Self {
        Self {
            rootfs: config.namespace.rootfs.clone(),
            policy: config.reconcile.policy,
            dry_run: config.reconcile.dry_run,
            timeout: config.timeout(),
        }
    }
}

#[async_trait]
impl NamespaceTrigger for SetnsTrigger {
    #[instrument(skip(self, target), fields(container = %target.name(), pid = target.pid))]
    async fn trigger(&self, target: &NamespaceTarget) -> Result<()> {
        let path = target.ns_path(&self.rootfs);
        let name = target.name().to_string();
        let (policy, dry_run, timeout) = (self.policy, self.dry_run, self.timeout);
        let (tx, rx) = tokio::sync::oneshot::channel();

        let thread_path = path.clone();
        std::thread::Builder::new()
            .name(format!("netns-{}", target.pid))
            .spawn(move || {
                let result = enter_and_reconcile(&thread_path, &name, policy, dry_run, timeout);
                let _ = tx.send(result);
            })
            .map_err(|e| NetfixError::Spawn {
                command: format!("setns thread for {}", path.display()),
                source: e,
            })?;

        rx.await.map_err(|_| NetfixError::Namespace {
            path,
            message: "reconcile thread exited without a result".to_string(),
        })?
    }
}

#[cfg(target_os = "linux")]
fn enter_and_reconcile(
    path: &Path,
    name: &str,
    policy: SelectionPolicy,
    dry_run: bool,
    timeout: Duration,
) -> Result<()> {
    use nix::sched::{setns, CloneFlags};

    let namespace_error = |message: String| NetfixError::Namespace {
        path: path.to_path_buf(),
        message,
    };

    let file = std::fs::File::open(path).map_err(|e| namespace_error(e.to_string()))?;
    setns(&file, CloneFlags::CLONE_NEWNET).map_err(|e| namespace_error(e.to_string()))?;

    netfix_route::reconcile_current_namespace(name, policy, dry_run, timeout)?;
    Ok(())
}

#[cfg(not(target_os = "linux"))]
fn enter_and_reconcile(
    path: &Path,
    _name: &str,
    _policy: SelectionPolicy,
    _dry_run: bool,
    _timeout: Duration,
) -> Result<()> {
    Err(NetfixError::Namespace {
        path: path.to_path_buf(),
        message: "setns is only supported on Linux".to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn target() -> NamespaceTarget {
        NamespaceTarget::new(ContainerRef::new("abc", "/web-1"), 4242)
    }

    #[test]
    fn test_netns_path() {
        assert_eq!(
            netns_path(Path::new(""), 42),
            PathBuf::from("/proc/42/ns/net")
        );
        assert_eq!(
            netns_path(Path::new("/host"), 42),
            PathBuf::from("/host/proc/42/ns/net")
        );
    }

    #[test]
    fn test_reexec_command_args() {
        let mut config = NetfixConfig::default();
        config.namespace.rootfs = PathBuf::from("/host");
        let trigger = ReexecTrigger::new(&config, "/usr/bin/netfixd");

        let args: Vec<String> = trigger
            .command_args(&target())
            .into_iter()
            .map(|a| a.to_string_lossy().into_owned())
            .collect();
        assert_eq!(
            args,
            vec![
                "--net=/host/proc/4242/ns/net",
                "/usr/bin/netfixd",
                "--netcheck",
                "web-1",
                "--policy",
                "lan-aware",
                "--log-level",
                "info",
            ]
        );
    }

    #[test]
    fn test_reexec_forwards_settings_to_child() {
        let mut config = NetfixConfig::default();
        config.reconcile.dry_run = true;
        config.reconcile.policy = SelectionPolicy::PreferExisting;
        config.logging.level = "debug".to_string();
        let trigger = ReexecTrigger::new(&config, "/usr/bin/netfixd")
            .with_config_path("/etc/netfix/netfixd.toml");

        let args: Vec<String> = trigger
            .command_args(&target())
            .into_iter()
            .map(|a| a.to_string_lossy().into_owned())
            .collect();
        assert_eq!(&args[4..], &[
            "--policy",
            "prefer-existing",
            "--log-level",
            "debug",
            "--dry-run",
            "--config",
            "/etc/netfix/netfixd.toml",
        ]);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_reexec_exit_status() {
        let mut config = NetfixConfig::default();

        config.namespace.nsenter_path = PathBuf::from("true");
        let ok = ReexecTrigger::new(&config, "/usr/bin/netfixd");
        tokio_test::assert_ok!(ok.trigger(&target()).await);

        config.namespace.nsenter_path = PathBuf::from("false");
        let failing = ReexecTrigger::new(&config, "/usr/bin/netfixd");
        assert!(matches!(
            failing.trigger(&target()).await,
            Err(NetfixError::Reexec { .. })
        ));
    }

    #[tokio::test]
    async fn test_reexec_spawn_failure() {
        let mut config = NetfixConfig::default();
        config.namespace.nsenter_path = PathBuf::from("/nonexistent/nsenter");
        let trigger = ReexecTrigger::new(&config, "/usr/bin/netfixd");

        let err = tokio_test::assert_err!(trigger.trigger(&target()).await);
        assert!(matches!(err, NetfixError::Spawn { .. }));
        assert!(err.is_per_container());
    }

    #[tokio::test]
    async fn test_setns_missing_namespace() {
        let mut config = NetfixConfig::default();
        config.namespace.rootfs = PathBuf::from("/nonexistent-rootfs");
        let trigger = SetnsTrigger::new(&config);

        let err = trigger.trigger(&target()).await.unwrap_err();
        assert!(matches!(err, NetfixError::Namespace { .. }));
    }
}
