//! Watch loop behaviour against a fake container engine
//!
//! The engine is driven through a channel so each test decides exactly which
//! start events arrive and when. The trigger records the containers it was
//! asked to reconcile instead of entering any namespace.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use futures::stream::{self, BoxStream, StreamExt};
use netfixd::{
    ContainerRef, ContainerRuntime, NamespaceTarget, NamespaceTrigger, NetfixError, Result,
    WatchSettings, WatchStats, Watcher,
};
use pretty_assertions::assert_eq;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

type EventSender = mpsc::UnboundedSender<Result<ContainerRef>>;

struct FakeRuntime {
    running: Vec<ContainerRef>,
    pids: HashMap<String, u32>,
    events: Mutex<Option<mpsc::UnboundedReceiver<Result<ContainerRef>>>>,
}

impl FakeRuntime {
    fn new(running: &[(&str, u32)]) -> (Self, EventSender) {
        let (tx, rx) = mpsc::unbounded_channel();
        let runtime = Self {
            running: running
                .iter()
                .map(|(name, _)| ContainerRef::new(*name, format!("/{name}")))
                .collect(),
            pids: running
                .iter()
                .map(|(name, pid)| (name.to_string(), *pid))
                .collect(),
            events: Mutex::new(Some(rx)),
        };
        (runtime, tx)
    }

    fn with_pid(mut self, id: &str, pid: u32) -> Self {
        self.pids.insert(id.to_string(), pid);
        self
    }
}

#[async_trait]
impl ContainerRuntime for FakeRuntime {
    async fn list_running(&self) -> Result<Vec<ContainerRef>> {
        Ok(self.running.clone())
    }

    async fn inspect_pid(&self, id: &str) -> Result<Option<u32>> {
        Ok(self.pids.get(id).copied())
    }

    fn start_events(&self) -> BoxStream<'_, Result<ContainerRef>> {
        match self.events.lock().unwrap().take() {
            Some(rx) => stream::unfold(rx, |mut rx| async move {
                rx.recv().await.map(|item| (item, rx))
            })
            .boxed(),
            None => stream::pending().boxed(),
        }
    }
}

#[derive(Default)]
struct RecordingTrigger {
    calls: Mutex<Vec<String>>,
    failing: HashSet<String>,
    delay: Duration,
    active: AtomicUsize,
    peak: AtomicUsize,
}

impl RecordingTrigger {
    fn slow(delay: Duration) -> Self {
        Self {
            delay,
            ..Default::default()
        }
    }

    fn failing_for(name: &str) -> Self {
        Self {
            failing: HashSet::from([name.to_string()]),
            ..Default::default()
        }
    }

    fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    fn calls_for(&self, name: &str) -> usize {
        self.calls().iter().filter(|c| *c == name).count()
    }
}

#[async_trait]
impl NamespaceTrigger for RecordingTrigger {
    async fn trigger(&self, target: &NamespaceTarget) -> Result<()> {
        self.calls.lock().unwrap().push(target.name().to_string());
        let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);

        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        self.active.fetch_sub(1, Ordering::SeqCst);

        if self.failing.contains(target.name()) {
            return Err(NetfixError::Namespace {
                path: target.ns_path(std::path::Path::new("")),
                message: "permission denied".to_string(),
            });
        }
        Ok(())
    }
}

fn settings(max_concurrent: usize, initial_scan: bool) -> WatchSettings {
    WatchSettings {
        max_concurrent,
        initial_scan,
        trigger_timeout: Duration::from_secs(5),
    }
}

async fn run_for(
    watcher: Watcher<FakeRuntime, RecordingTrigger>,
    window: Duration,
) -> Result<WatchStats> {
    let shutdown = CancellationToken::new();
    let stop = shutdown.clone();
    tokio::spawn(async move {
        tokio::time::sleep(window).await;
        stop.cancel();
    });
    watcher.run(shutdown).await
}

#[tokio::test]
async fn test_scan_then_events_are_reconciled() {
    let (runtime, events) = FakeRuntime::new(&[("db", 10)]);
    let runtime = runtime.with_pid("web", 20);
    let trigger = Arc::new(RecordingTrigger::default());
    let watcher = Watcher::new(Arc::new(runtime), Arc::clone(&trigger), settings(4, true));

    events.send(Ok(ContainerRef::new("web", "web"))).unwrap();

    let stats = run_for(watcher, Duration::from_millis(200)).await.unwrap();
    assert_eq!(stats.reconciled, 2);
    assert_eq!(trigger.calls_for("db"), 1);
    assert_eq!(trigger.calls_for("web"), 1);
}

#[tokio::test]
async fn test_container_without_process_is_skipped() {
    let (runtime, events) = FakeRuntime::new(&[]);
    let trigger = Arc::new(RecordingTrigger::default());
    let watcher = Watcher::new(Arc::new(runtime), Arc::clone(&trigger), settings(4, true));

    events.send(Ok(ContainerRef::new("gone", "gone"))).unwrap();

    let stats = run_for(watcher, Duration::from_millis(200)).await.unwrap();
    assert_eq!(stats.skipped, 1);
    assert!(trigger.calls().is_empty());
}

#[tokio::test]
async fn test_failure_does_not_stop_loop() {
    let (runtime, events) = FakeRuntime::new(&[("bad", 10)]);
    let runtime = runtime.with_pid("good", 20);
    let trigger = Arc::new(RecordingTrigger::failing_for("bad"));
    let watcher = Watcher::new(Arc::new(runtime), Arc::clone(&trigger), settings(4, true));

    events.send(Ok(ContainerRef::new("good", "good"))).unwrap();

    let stats = run_for(watcher, Duration::from_millis(200)).await.unwrap();
    assert_eq!(stats.failed, 1);
    assert_eq!(stats.reconciled, 1);
    assert_eq!(trigger.calls_for("good"), 1);
}

#[tokio::test]
async fn test_concurrency_is_bounded() {
    let (runtime, _events) = FakeRuntime::new(&[("a", 1), ("b", 2), ("c", 3), ("d", 4)]);
    let trigger = Arc::new(RecordingTrigger::slow(Duration::from_millis(30)));
    let watcher = Watcher::new(Arc::new(runtime), Arc::clone(&trigger), settings(2, true));

    let stats = run_for(watcher, Duration::from_millis(400)).await.unwrap();
    assert_eq!(stats.reconciled, 4);
    assert!(trigger.peak.load(Ordering::SeqCst) <= 2);
}

#[tokio::test]
async fn test_repeated_starts_are_coalesced() {
    let (runtime, events) = FakeRuntime::new(&[]);
    let runtime = runtime.with_pid("web", 20);
    let trigger = Arc::new(RecordingTrigger::slow(Duration::from_millis(200)));
    let watcher = Watcher::new(Arc::new(runtime), Arc::clone(&trigger), settings(4, false));

    let sender = events.clone();
    tokio::spawn(async move {
        sender.send(Ok(ContainerRef::new("web", "web"))).unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        // Both arrive while the first run is still in flight
        sender.send(Ok(ContainerRef::new("web", "web"))).unwrap();
        sender.send(Ok(ContainerRef::new("web", "web"))).unwrap();
    });

    let stats = run_for(watcher, Duration::from_millis(700)).await.unwrap();
    assert_eq!(stats.coalesced, 2);
    assert_eq!(stats.reconciled, 2);
    assert_eq!(trigger.calls_for("web"), 2);
    assert_eq!(trigger.peak.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_shutdown_waits_for_in_flight() {
    let (runtime, _events) = FakeRuntime::new(&[("db", 10)]);
    let trigger = Arc::new(RecordingTrigger::slow(Duration::from_millis(150)));
    let watcher = Watcher::new(Arc::new(runtime), Arc::clone(&trigger), settings(4, true));

    // Cancelled long before the reconciliation finishes
    let stats = run_for(watcher, Duration::from_millis(20)).await.unwrap();
    assert_eq!(stats.reconciled, 1);
}

#[tokio::test]
async fn test_event_stream_end_is_fatal() {
    let (runtime, events) = FakeRuntime::new(&[]);
    let trigger = Arc::new(RecordingTrigger::default());
    let watcher = Watcher::new(Arc::new(runtime), trigger, settings(4, true));

    drop(events);

    let err = watcher.run(CancellationToken::new()).await.unwrap_err();
    assert!(matches!(err, NetfixError::EventStreamClosed(_)));
    assert!(!err.is_per_container());
}

#[tokio::test]
async fn test_event_stream_error_is_fatal() {
    let (runtime, events) = FakeRuntime::new(&[]);
    let trigger = Arc::new(RecordingTrigger::default());
    let watcher = Watcher::new(Arc::new(runtime), trigger, settings(4, true));

    events
        .send(Err(NetfixError::Runtime("connection reset".to_string())))
        .unwrap();

    let err = watcher.run(CancellationToken::new()).await.unwrap_err();
    match err {
        NetfixError::EventStreamClosed(message) => assert!(message.contains("connection reset")),
        other => panic!("unexpected error: {other}"),
    }
}
