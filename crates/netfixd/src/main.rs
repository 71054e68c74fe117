//! netfixd - container default route repair daemon
//!
//! Without flags, watches the container engine and reconciles every running
//! and newly started container. With `--netcheck <ID>`, reconciles the network
//! namespace the process was started in and exits.

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use netfix_route::{reconcile_current_namespace, SelectionPolicy};
use netfixd::{
    init_logging, DockerRuntime, EntryMode, NamespaceTrigger, NetfixConfig, ReexecTrigger,
    SetnsTrigger, WatchSettings, Watcher, DEFAULT_CONFIG_PATH,
};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

/// Command line arguments
#[derive(Debug, Parser)]
#[command(name = "netfixd", version, about)]
struct Cli {
    /// Reconcile the current network namespace only, logging under this id
    #[arg(long, value_name = "ID")]
    netcheck: Option<String>,

    /// Host root filesystem prefix used to locate /proc
    #[arg(long, value_name = "PATH")]
    rootfs: Option<PathBuf>,

    /// Configuration file
    #[arg(long, value_name = "PATH")]
    config: Option<PathBuf>,

    /// Default route selection policy (lan-aware, prefer-existing)
    #[arg(long, value_name = "POLICY")]
    policy: Option<SelectionPolicy>,

    /// Namespace entry mode (reexec, setns)
    #[arg(long, value_name = "MODE")]
    mode: Option<EntryMode>,

    /// Log planned route changes without applying them
    #[arg(long)]
    dry_run: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, value_name = "LEVEL")]
    log_level: Option<String>,
}

/// Effective configuration, resolved before logging is installed
struct Resolved {
    config: NetfixConfig,
    /// Config file that was looked for but does not exist
    missing_file: Option<PathBuf>,
}

impl Cli {
    /// Load the configuration file and apply command line overrides.
    fn resolve_config(&self) -> anyhow::Result<Resolved> {
        let path = self
            .config
            .clone()
            .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_PATH));
        let loaded =
            NetfixConfig::read(&path).with_context(|| format!("loading {}", path.display()))?;
        let missing_file = loaded.is_none().then(|| path.clone());
        let mut config = loaded.unwrap_or_default();

        if let Some(rootfs) = &self.rootfs {
            config.namespace.rootfs = rootfs.clone();
        }
        if let Some(policy) = self.policy {
            config.reconcile.policy = policy;
        }
        if let Some(mode) = self.mode {
            config.namespace.mode = mode;
        }
        if self.dry_run {
            config.reconcile.dry_run = true;
        }
        if let Some(level) = &self.log_level {
            config.logging.level = level.clone();
        }

        config.validate().context("invalid configuration")?;
        Ok(Resolved {
            config,
            missing_file,
        })
    }
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    let Resolved {
        config,
        missing_file,
    } = match cli.resolve_config() {
        Ok(resolved) => resolved,
        Err(e) => {
            eprintln!("netfixd: {e:#}");
            return ExitCode::FAILURE;
        }
    };

    if let Err(e) = init_logging(&config.logging) {
        eprintln!("netfixd: {e}");
        return ExitCode::FAILURE;
    }
    if let Some(path) = &missing_file {
        info!(path = %path.display(), "Config file not found, using defaults");
    }

    let result = match &cli.netcheck {
        Some(id) => netcheck(id, &config),
        None => run_daemon(&cli, config),
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(error = %format!("{e:#}"), "netfixd exiting");
            ExitCode::FAILURE
        }
    }
}

/// Reconcile the namespace this process runs in. No async runtime is needed.
fn netcheck(id: &str, config: &NetfixConfig) -> anyhow::Result<()> {
    reconcile_current_namespace(
        id,
        config.reconcile.policy,
        config.reconcile.dry_run,
        config.timeout(),
    )
    .with_context(|| format!("[{id}] netcheck failed"))?;
    Ok(())
}

fn run_daemon(cli: &Cli, config: NetfixConfig) -> anyhow::Result<()> {
    let runtime = tokio::runtime::Runtime::new().context("starting async runtime")?;
    runtime.block_on(async {
        match config.namespace.mode {
            EntryMode::Reexec => {
                let exe = std::env::current_exe().context("locating own executable")?;
                let mut trigger = ReexecTrigger::new(&config, exe);
                if let Some(path) = &cli.config {
                    trigger = trigger.with_config_path(path);
                }
                watch(config, trigger).await
            }
            EntryMode::Setns => watch(config.clone(), SetnsTrigger::new(&config)).await,
        }
    })
}

async fn watch<T>(config: NetfixConfig, trigger: T) -> anyhow::Result<()>
where
    T: NamespaceTrigger + 'static,
{
    info!(
        policy = %config.reconcile.policy,
        mode = ?config.namespace.mode,
        dry_run = config.reconcile.dry_run,
        "--- Starting netfixd ---"
    );

    let docker = DockerRuntime::connect().context("connecting to container engine")?;
    docker.ping().await.context("container engine not reachable")?;

    let shutdown = CancellationToken::new();
    tokio::spawn(wait_for_signal(shutdown.clone()));

    let watcher = Watcher::new(
        Arc::new(docker),
        Arc::new(trigger),
        WatchSettings::from_config(&config),
    );
    let stats = watcher.run(shutdown).await.context("watch loop stopped")?;

    info!(
        reconciled = stats.reconciled,
        skipped = stats.skipped,
        failed = stats.failed,
        "netfixd stopped"
    );
    Ok(())
}

/// Cancel `shutdown` on SIGINT or SIGTERM.
async fn wait_for_signal(shutdown: CancellationToken) {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        match signal(SignalKind::terminate()) {
            Ok(mut term) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => info!("Received SIGINT"),
                    _ = term.recv() => info!("Received SIGTERM"),
                }
            }
            Err(e) => {
                error!(error = %e, "Could not install SIGTERM handler");
                let _ = tokio::signal::ctrl_c().await;
                info!("Received SIGINT");
            }
        }
    }

    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
        info!("Received SIGINT");
    }

    shutdown.cancel();
}
