//! Container event watcher
//!
//! Subscribes to container start events, reconciles the containers that are
//! already running, then reconciles every container that starts afterwards.
//!
//! ```text
//! engine events ──▶ forwarder task ──mpsc──▶ select! loop ──▶ JoinSet
//!                                               ▲     │       (≤ max_concurrent
//!                                  shutdown ────┘     │        via Semaphore)
//!                                                     ▼
//!                                           in-flight / rerun sets
//! ```
//!
//! A start event for a container that is still being reconciled is coalesced
//! into one follow-up run, so two runs never target the same namespace at once.

use std::collections::{HashMap, HashSet};
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use futures::{FutureExt, StreamExt};
use tokio::sync::{mpsc, Semaphore};
use tokio::task::{self, JoinError, JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::NetfixConfig;
use crate::error::{NetfixError, Result};
use crate::runtime::{ContainerRef, ContainerRuntime};
use crate::trigger::{NamespaceTarget, NamespaceTrigger};

/// Events buffered between the engine stream and the watch loop
const EVENT_BUFFER: usize = 64;

/// Watch loop settings
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WatchSettings {
    pub max_concurrent: usize,
    pub initial_scan: bool,
    pub trigger_timeout: Duration,
}

impl Default for WatchSettings {
    fn default() -> Self {
        Self::from_config(&NetfixConfig::default())
    }
}

impl WatchSettings {
    pub fn from_config(config: &NetfixConfig) -> Self {
        Self {
            max_concurrent: config.watch.max_concurrent.max(1),
            initial_scan: config.watch.initial_scan,
            trigger_timeout: config.trigger_timeout(),
        }
    }
}

/// Counters for one watch loop run
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WatchStats {
    /// Containers whose namespace was reconciled successfully
    pub reconciled: usize,
    /// Containers without a running process
    pub skipped: usize,
    /// Per-container failures
    pub failed: usize,
    /// Start events folded into a pending follow-up run
    pub coalesced: usize,
}

/// Result of checking one container
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CheckOutcome {
    Reconciled,
    NoProcess,
}

type CheckResult = (ContainerRef, Result<CheckOutcome>);

type Joined = std::result::Result<(task::Id, CheckResult), JoinError>;

/// Drives reconciliation from container lifecycle events
pub struct Watcher<R, T> {
    runtime: Arc<R>,
    trigger: Arc<T>,
    settings: WatchSettings,
    permits: Arc<Semaphore>,
}

/// Bookkeeping for in-flight reconciliations
#[derive(Default)]
struct InFlight {
    tasks: JoinSet<CheckResult>,
    running: HashSet<String>,
    /// Container each task works on, so a task that never returns still clears it
    owners: HashMap<task::Id, ContainerRef>,
    rerun: HashMap<String, ContainerRef>,
    stats: WatchStats,
}

impl<R, T> Watcher<R, T>
where
    R: ContainerRuntime + 'static,
    T: NamespaceTrigger + 'static,
{
    pub fn new(runtime: Arc<R>, trigger: Arc<T>, settings: WatchSettings) -> Self {
        let permits = Arc::new(Semaphore::new(settings.max_concurrent.max(1)));
        Self {
            runtime,
            trigger,
            settings,
            permits,
        }
    }

    /// Run until `shutdown` is cancelled or the event stream is lost.
    ///
    /// Returns the run's counters on shutdown. Losing the event stream is an
    /// error; in-flight reconciliations are awaited in both cases.
    pub async fn run(&self, shutdown: CancellationToken) -> Result<WatchStats> {
        // Subscribe before listing so a start between the two is not missed
        let (mut events, forwarder) = self.subscribe();
        let mut inflight = InFlight::default();

        let result = self.watch(&shutdown, &mut events, &mut inflight).await;

        forwarder.abort();
        if !inflight.tasks.is_empty() {
            info!(count = inflight.tasks.len(), "Waiting for in-flight reconciliations");
        }
        while let Some(joined) = inflight.tasks.join_next_with_id().await {
            self.finish(&mut inflight, joined, false);
        }

        result.map(|()| inflight.stats)
    }

    async fn watch(
        &self,
        shutdown: &CancellationToken,
        events: &mut mpsc::Receiver<Result<ContainerRef>>,
        inflight: &mut InFlight,
    ) -> Result<()> {
        if self.settings.initial_scan {
            let running = self.runtime.list_running().await?;
            info!(count = running.len(), "Checking running containers");
            for container in running {
                self.schedule(inflight, container);
            }
        }

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    info!("Shutdown requested, no longer accepting events");
                    return Ok(());
                }
                event = events.recv() => match event {
                    Some(Ok(container)) => {
                        debug!(container = %container, id = %container.id, "Container started");
                        self.schedule(inflight, container);
                    }
                    Some(Err(e)) => {
                        error!(error = %e, "Container event stream failed");
                        return Err(match e {
                            e @ NetfixError::EventStreamClosed(_) => e,
                            other => NetfixError::EventStreamClosed(other.to_string()),
                        });
                    }
                    None => {
                        error!("Container event stream ended");
                        return Err(NetfixError::EventStreamClosed(
                            "event stream ended".to_string(),
                        ));
                    }
                },
                Some(joined) = inflight.tasks.join_next_with_id(), if !inflight.tasks.is_empty() => {
                    self.finish(inflight, joined, true);
                }
            }
        }
    }

    /// Forward engine events into a channel from a dedicated task, so the
    /// subscription is live while the initial scan runs.
    fn subscribe(&self) -> (mpsc::Receiver<Result<ContainerRef>>, JoinHandle<()>) {
        let (tx, rx) = mpsc::channel(EVENT_BUFFER);
        let runtime = Arc::clone(&self.runtime);

        let forwarder = tokio::spawn(async move {
            let mut stream = runtime.start_events();
            while let Some(item) = stream.next().await {
                let failed = item.is_err();
                if tx.send(item).await.is_err() || failed {
                    break;
                }
            }
        });

        (rx, forwarder)
    }

    fn schedule(&self, inflight: &mut InFlight, container: ContainerRef) {
        if inflight.running.contains(&container.id) {
            debug!(container = %container, "Reconciliation in flight, queueing follow-up");
            inflight.rerun.insert(container.id.clone(), container);
            inflight.stats.coalesced += 1;
            return;
        }

        inflight.running.insert(container.id.clone());
        let owner = container.clone();

        let runtime = Arc::clone(&self.runtime);
        let trigger = Arc::clone(&self.trigger);
        let permits = Arc::clone(&self.permits);
        let timeout = self.settings.trigger_timeout;

        let handle = inflight.tasks.spawn(async move {
            // The semaphore is never closed
            let _permit = permits.acquire_owned().await.ok();
            let check = check_container(runtime.as_ref(), trigger.as_ref(), &container, timeout);
            let outcome = AssertUnwindSafe(check)
                .catch_unwind()
                .await
                .unwrap_or_else(|_| {
                    Err(NetfixError::Runtime(
                        "reconciliation task panicked".to_string(),
                    ))
                });
            (container, outcome)
        });
        inflight.owners.insert(handle.id(), owner);
    }

    fn finish(&self, inflight: &mut InFlight, joined: Joined, accepting: bool) {
        let (container, outcome) = match joined {
            Ok((id, done)) => {
                inflight.owners.remove(&id);
                done
            }
            Err(e) => {
                let Some(container) = inflight.owners.remove(&e.id()) else {
                    error!(error = %e, "Reconciliation task did not complete");
                    return;
                };
                error!(container = %container, error = %e, "Reconciliation task did not complete");
                let outcome = Err(NetfixError::Runtime(e.to_string()));
                (container, outcome)
            }
        };

        inflight.running.remove(&container.id);

        match outcome {
            Ok(CheckOutcome::Reconciled) => {
                info!(container = %container, "Container network checked");
                inflight.stats.reconciled += 1;
            }
            Ok(CheckOutcome::NoProcess) => {
                debug!(container = %container, "Container has no running process, skipped");
                inflight.stats.skipped += 1;
            }
            Err(e) => {
                warn!(container = %container, error = %e, "Container network check failed");
                inflight.stats.failed += 1;
            }
        }

        if let Some(next) = inflight.rerun.remove(&container.id) {
            if accepting {
                self.schedule(inflight, next);
            }
        }
    }
}

/// Inspect one container and reconcile its namespace if it has a process.
async fn check_container<R, T>(
    runtime: &R,
    trigger: &T,
    container: &ContainerRef,
    timeout: Duration,
) -> Result<CheckOutcome>
where
    R: ContainerRuntime + ?Sized,
    T: NamespaceTrigger + ?Sized,
{
    info!(container = %container, "Checking container");

    let Some(pid) = runtime.inspect_pid(&container.id).await? else {
        return Ok(CheckOutcome::NoProcess);
    };

    let target = NamespaceTarget::new(container.clone(), pid);
    tokio::time::timeout(timeout, trigger.trigger(&target))
        .await
        .map_err(|_| NetfixError::Timeout {
            id: container.name.clone(),
            after: timeout,
        })??;

    Ok(CheckOutcome::Reconciled)
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use futures::stream::BoxStream;
    use std::sync::Mutex;

    struct StaticRuntime {
        running: Vec<ContainerRef>,
        pids: HashMap<String, u32>,
    }

    #[async_trait]
    impl ContainerRuntime for StaticRuntime {
        async fn list_running(&self) -> Result<Vec<ContainerRef>> {
            Ok(self.running.clone())
        }

        async fn inspect_pid(&self, id: &str) -> Result<Option<u32>> {
            Ok(self.pids.get(id).copied())
        }

        fn start_events(&self) -> BoxStream<'_, Result<ContainerRef>> {
            futures::stream::pending().boxed()
        }
    }

    #[derive(Default)]
    struct Recorder {
        seen: Mutex<Vec<u32>>,
    }

    #[async_trait]
    impl NamespaceTrigger for Recorder {
        async fn trigger(&self, target: &NamespaceTarget) -> Result<()> {
            self.seen.lock().unwrap().push(target.pid);
            Ok(())
        }
    }

    struct Hanging;

    #[async_trait]
    impl NamespaceTrigger for Hanging {
        async fn trigger(&self, _target: &NamespaceTarget) -> Result<()> {
            futures::future::pending::<()>().await;
            Ok(())
        }
    }

    fn runtime() -> StaticRuntime {
        StaticRuntime {
            running: vec![ContainerRef::new("a", "/web"), ContainerRef::new("b", "/exited")],
            pids: HashMap::from([("a".to_string(), 100)]),
        }
    }

    #[tokio::test]
    async fn test_check_container_skips_without_pid() {
        let rt = runtime();
        let trigger = Recorder::default();

        let outcome = check_container(
            &rt,
            &trigger,
            &ContainerRef::new("b", "/exited"),
            Duration::from_secs(1),
        )
        .await
        .unwrap();

        assert_eq!(outcome, CheckOutcome::NoProcess);
        assert!(trigger.seen.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_check_container_times_out() {
        let rt = runtime();

        let err = check_container(
            &rt,
            &Hanging,
            &ContainerRef::new("a", "/web"),
            Duration::from_millis(20),
        )
        .await
        .unwrap_err();

        assert!(matches!(err, NetfixError::Timeout { ref id, .. } if id == "web"));
    }

    #[tokio::test]
    async fn test_initial_scan_then_shutdown() {
        let trigger = Arc::new(Recorder::default());
        let watcher = Watcher::new(Arc::new(runtime()), Arc::clone(&trigger), WatchSettings::default());

        let shutdown = CancellationToken::new();
        let stop = shutdown.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            stop.cancel();
        });

        let stats = watcher.run(shutdown).await.unwrap();
        assert_eq!(stats.reconciled, 1);
        assert_eq!(stats.skipped, 1);
        assert_eq!(*trigger.seen.lock().unwrap(), vec![100]);
    }

    #[tokio::test]
    async fn test_initial_scan_disabled() {
        let trigger = Arc::new(Recorder::default());
        let settings = WatchSettings {
            initial_scan: false,
            ..WatchSettings::default()
        };
        let watcher = Watcher::new(Arc::new(runtime()), Arc::clone(&trigger), settings);

        let shutdown = CancellationToken::new();
        shutdown.cancel();

        let stats = watcher.run(shutdown).await.unwrap();
        assert_eq!(stats, WatchStats::default());
    }

    #[tokio::test]
    async fn test_aborted_task_releases_container() {
        let watcher = Watcher::new(Arc::new(runtime()), Arc::new(Hanging), WatchSettings::default());
        let mut inflight = InFlight::default();
        let web = ContainerRef::new("a", "/web");

        watcher.schedule(&mut inflight, web.clone());
        watcher.schedule(&mut inflight, web.clone());
        assert_eq!(inflight.stats.coalesced, 1);

        inflight.tasks.abort_all();
        let joined = inflight.tasks.join_next_with_id().await.unwrap();
        assert!(joined.as_ref().is_err_and(|e| e.is_cancelled()));
        watcher.finish(&mut inflight, joined, false);

        assert!(inflight.running.is_empty());
        assert!(inflight.owners.is_empty());
        assert!(inflight.rerun.is_empty());
        assert_eq!(inflight.stats.failed, 1);

        // A later start is scheduled, not folded into a run that no longer exists
        watcher.schedule(&mut inflight, web);
        assert_eq!(inflight.stats.coalesced, 1);
        assert!(inflight.running.contains("a"));
        assert_eq!(inflight.tasks.len(), 1);
        inflight.tasks.abort_all();
    }

    #[tokio::test]
    async fn test_aborted_task_reschedules_pending_rerun() {
        let watcher = Watcher::new(Arc::new(runtime()), Arc::new(Hanging), WatchSettings::default());
        let mut inflight = InFlight::default();
        let web = ContainerRef::new("a", "/web");

        watcher.schedule(&mut inflight, web.clone());
        watcher.schedule(&mut inflight, web);
        inflight.tasks.abort_all();
        let joined = inflight.tasks.join_next_with_id().await.unwrap();
        watcher.finish(&mut inflight, joined, true);

        assert!(inflight.rerun.is_empty());
        assert!(inflight.running.contains("a"));
        assert_eq!(inflight.tasks.len(), 1);
        assert_eq!(inflight.owners.len(), 1);
        inflight.tasks.abort_all();
    }
}
