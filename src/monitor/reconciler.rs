//! Event reconciler.
//!
//! Merges the daemon's live event stream with periodic snapshots. The loop
//! moves between three states: Syncing (fetch a snapshot, seed the store),
//! Live (consume events), and Degraded (stream lost or gapped; transient
//! bookkeeping on the way back to Syncing). The reconciler is the store's
//! only writer, so every mutation is serialized through this one task.

use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

use super::evaluator::evaluate;
use super::model::{Container, ContainerEvent, ContainerState};
use super::store::{SnapshotStore, Upsert};
use crate::config::MonitorConfig;
use crate::docker::{DaemonClient, DaemonError};
use crate::report::queue::VerdictQueue;

const RETRY_BASE: Duration = Duration::from_millis(500);
const RETRY_CAP: Duration = Duration::from_secs(30);

pub struct Reconciler<C: DaemonClient> {
    client: C,
    store: SnapshotStore,
    queue: Arc<VerdictQueue>,
    heartbeat_timeout: Duration,
    resync_interval: Duration,
    restart_threshold: usize,
    startup_retry_max: u32,
    shutdown: watch::Receiver<bool>,
}

impl<C: DaemonClient> Reconciler<C> {
    pub fn new(
        client: C,
        config: &MonitorConfig,
        queue: Arc<VerdictQueue>,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        Self {
            client,
            store: SnapshotStore::new(config.restart_window(), config.removed_grace_period()),
            queue,
            heartbeat_timeout: config.heartbeat_timeout(),
            resync_interval: config.resync_interval(),
            restart_threshold: config.restart_threshold,
            startup_retry_max: config.startup_retry_max,
            shutdown,
        }
    }

    /// Drive the monitor until shutdown. The only fatal error is failing to
    /// reach the daemon through every startup attempt; everything after that
    /// is recovered by resynchronizing.
    pub async fn run(mut self) -> Result<(), DaemonError> {
        let snapshot = self.startup_snapshot().await?;
        let total = snapshot.len();
        self.store.replace_all(snapshot, Utc::now());
        log::info!("Seeded state store with {total} containers");
        let _ = sd_notify::notify(true, &[sd_notify::NotifyState::Ready]);

        let mut resync_tick = tokio::time::interval(self.resync_interval);
        // Consume the first immediate tick.
        resync_tick.tick().await;

        'outer: loop {
            // Syncing -> Live.
            let mut events = match self.client.subscribe().await {
                Ok(events) => events,
                Err(e) => {
                    log::warn!("Failed to subscribe to daemon events: {e}");
                    if !self.resync_with_retry().await {
                        break 'outer;
                    }
                    continue;
                }
            };
            log::debug!("Event stream open, going live");

            loop {
                let heartbeat = tokio::time::sleep(self.heartbeat_timeout);
                tokio::pin!(heartbeat);

                tokio::select! {
                    maybe_event = events.next_event() => match maybe_event {
                        Some(Ok(event)) => {
                            if self.apply_event(event).await {
                                log::warn!("Sequence gap detected, resynchronizing");
                                break;
                            }
                        }
                        Some(Err(DaemonError::Decode(reason))) => {
                            log::warn!(
                                "Dropping undecodable event: {reason} ({} integrity errors so far)",
                                self.store.integrity_errors()
                            );
                        }
                        Some(Err(e)) => {
                            log::warn!("Event stream failed: {e}, resynchronizing");
                            break;
                        }
                        None => {
                            log::warn!("Event stream closed by the daemon, resynchronizing");
                            break;
                        }
                    },
                    _ = &mut heartbeat => {
                        log::warn!(
                            "No events within {:?}, resynchronizing",
                            self.heartbeat_timeout
                        );
                        break;
                    }
                    _ = resync_tick.tick() => {
                        self.reconcile_pass().await;
                    }
                    _ = self.shutdown.changed() => break 'outer,
                }
            }

            // Degraded -> Syncing: cancel the subscription before asking for
            // a fresh snapshot, then resubscribe on the next turn.
            drop(events);
            if !self.resync_with_retry().await {
                break 'outer;
            }
        }

        log::info!("Reconciler stopped");
        Ok(())
    }

    /// Apply one event through the store and forward any verdict.
    /// Returns true when a sequence gap calls for a resync.
    async fn apply_event(&mut self, event: ContainerEvent) -> bool {
        let container_id = event.container_id.clone();
        match self.store.upsert(&event) {
            Ok(Upsert::Accepted { transition, gap }) => {
                log::debug!(
                    "{}: {} -> {} (seq {})",
                    transition.name,
                    transition.from.as_ref(),
                    transition.to.as_ref(),
                    event.seq
                );
                if let Some(verdict) = evaluate(&transition, self.restart_threshold) {
                    self.queue.push(verdict).await;
                }
                gap
            }
            Ok(Upsert::Duplicate) => {
                log::debug!("Dropping duplicate event for {container_id} (seq {})", event.seq);
                false
            }
            Err(e) => {
                log::warn!(
                    "Integrity error: {e} ({} so far)",
                    self.store.integrity_errors()
                );
                false
            }
        }
    }

    /// Periodic reconciliation while live. Corrects silently-missed events
    /// without emitting verdicts and without touching the subscription.
    async fn reconcile_pass(&mut self) {
        match self.client.snapshot().await {
            Ok(snapshot) => {
                self.store.reconcile(snapshot, Utc::now());
                log::debug!(
                    "Reconciliation pass complete, {} containers tracked",
                    self.store.len()
                );
            }
            // The stream is still live; the heartbeat or gap heuristic
            // covers whatever this pass would have caught.
            Err(e) => log::warn!("Reconciliation snapshot failed: {e}"),
        }
    }

    async fn startup_snapshot(
        &mut self,
    ) -> Result<Vec<(Container, ContainerState)>, DaemonError> {
        let mut delay = RETRY_BASE;
        let mut attempt = 1;
        loop {
            match self.client.snapshot().await {
                Ok(snapshot) => return Ok(snapshot),
                Err(e) if attempt < self.startup_retry_max => {
                    log::warn!(
                        "Startup snapshot failed (attempt {attempt}/{}): {e}, retrying in {delay:?}",
                        self.startup_retry_max
                    );
                    tokio::time::sleep(delay).await;
                    delay = (delay * 2).min(RETRY_CAP);
                    attempt += 1;
                }
                Err(e) => {
                    log::error!(
                        "Cannot reach the daemon after {} attempts, giving up",
                        self.startup_retry_max
                    );
                    return Err(e);
                }
            }
        }
    }

    /// Re-snapshot after stream loss. Retries indefinitely with capped
    /// backoff; only a shutdown signal stops it. Returns false on shutdown.
    async fn resync_with_retry(&mut self) -> bool {
        let mut delay = RETRY_BASE;
        loop {
            if *self.shutdown.borrow() {
                return false;
            }
            match self.client.snapshot().await {
                Ok(snapshot) => {
                    self.store.replace_all(snapshot, Utc::now());
                    log::info!("Resynchronized, {} containers tracked", self.store.len());
                    return true;
                }
                Err(e) => {
                    log::warn!("Snapshot failed during resync: {e}, retrying in {delay:?}");
                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {}
                        _ = self.shutdown.changed() => return false,
                    }
                    delay = (delay * 2).min(RETRY_CAP);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::monitor::model::{
        Container, ContainerState, EventKind, ReasonCode, Severity,
    };
    use crate::docker::EventSource;
    use async_trait::async_trait;
    use std::collections::VecDeque;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicU32, Ordering};

    enum Scripted {
        Event(ContainerEvent),
        /// Pretend the daemon goes quiet forever.
        Stall,
        StreamError,
    }

    struct ScriptedSource {
        script: VecDeque<Scripted>,
    }

    #[async_trait]
    impl EventSource for ScriptedSource {
        async fn next_event(&mut self) -> Option<Result<ContainerEvent, DaemonError>> {
            match self.script.pop_front() {
                Some(Scripted::Event(event)) => Some(Ok(event)),
                Some(Scripted::Stall) | None => {
                    futures_util::future::pending::<()>().await;
                    unreachable!()
                }
                Some(Scripted::StreamError) => Some(Err(DaemonError::Stream(
                    bollard::errors::Error::DockerResponseServerError {
                        status_code: 500,
                        message: "stream broken".to_string(),
                    },
                ))),
            }
        }
    }

    struct FakeDaemon {
        containers: Vec<(Container, ContainerState)>,
        scripts: Mutex<Vec<Vec<Scripted>>>,
        snapshot_calls: AtomicU32,
        subscribe_calls: AtomicU32,
    }

    impl FakeDaemon {
        fn new(containers: Vec<(Container, ContainerState)>, scripts: Vec<Vec<Scripted>>) -> Self {
            Self {
                containers,
                scripts: Mutex::new(scripts),
                snapshot_calls: AtomicU32::new(0),
                subscribe_calls: AtomicU32::new(0),
            }
        }
    }

    #[async_trait]
    impl DaemonClient for Arc<FakeDaemon> {
        async fn snapshot(&self) -> Result<Vec<(Container, ContainerState)>, DaemonError> {
            self.snapshot_calls.fetch_add(1, Ordering::SeqCst);
            Ok(self.containers.clone())
        }

        async fn subscribe(&self) -> Result<Box<dyn EventSource>, DaemonError> {
            self.subscribe_calls.fetch_add(1, Ordering::SeqCst);
            let mut scripts = self.scripts.lock().unwrap();
            let script = if scripts.is_empty() {
                Vec::new()
            } else {
                scripts.remove(0)
            };
            Ok(Box::new(ScriptedSource {
                script: script.into(),
            }))
        }

        async fn sample(
            &self,
            _container: &Container,
        ) -> Result<Option<crate::monitor::model::ResourceSample>, DaemonError> {
            Ok(None)
        }
    }

    fn running(id: &str) -> (Container, ContainerState) {
        (
            Container {
                id: id.to_string(),
                name: format!("{id}-name"),
                image: "nginx:latest".to_string(),
                created_at: Utc::now(),
            },
            ContainerState::Running,
        )
    }

    fn event(id: &str, kind: EventKind, seq: u64, exit_code: Option<i64>) -> ContainerEvent {
        ContainerEvent {
            container_id: id.to_string(),
            name: format!("{id}-name"),
            image: "nginx:latest".to_string(),
            kind,
            at: Utc::now(),
            seq,
            exit_code,
            health: None,
        }
    }

    fn config() -> MonitorConfig {
        MonitorConfig::try_init_from_string("").expect("Failed to build default config")
    }

    fn reconciler(
        daemon: Arc<FakeDaemon>,
        queue: Arc<VerdictQueue>,
    ) -> (Reconciler<Arc<FakeDaemon>>, watch::Sender<bool>) {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let reconciler = Reconciler::new(daemon, &config(), queue, shutdown_rx);
        (reconciler, shutdown_tx)
    }

    #[tokio::test(start_paused = true)]
    async fn test_unexpected_exit_produces_a_critical_verdict() {
        let daemon = Arc::new(FakeDaemon::new(
            vec![running("c1")],
            vec![vec![
                Scripted::Event(event("c1", EventKind::Die, 1, Some(137))),
                Scripted::Stall,
            ]],
        ));
        let queue = Arc::new(VerdictQueue::new(16));
        let (reconciler, shutdown_tx) = reconciler(Arc::clone(&daemon), Arc::clone(&queue));
        let task = tokio::spawn(reconciler.run());

        let verdict = queue.pop().await.expect("Expected a verdict");
        assert_eq!(verdict.container_id, "c1");
        assert_eq!(verdict.severity, Severity::Critical);
        assert_eq!(verdict.reason, ReasonCode::UnexpectedExit);

        shutdown_tx.send(true).unwrap();
        task.await.unwrap().unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_clean_exit_produces_an_info_verdict() {
        let daemon = Arc::new(FakeDaemon::new(
            vec![running("c2")],
            vec![vec![
                Scripted::Event(event("c2", EventKind::Die, 1, Some(0))),
                Scripted::Stall,
            ]],
        ));
        let queue = Arc::new(VerdictQueue::new(16));
        let (reconciler, shutdown_tx) = reconciler(Arc::clone(&daemon), Arc::clone(&queue));
        let task = tokio::spawn(reconciler.run());

        let verdict = queue.pop().await.expect("Expected a verdict");
        assert_eq!(verdict.container_id, "c2");
        assert_eq!(verdict.severity, Severity::Info);
        assert_eq!(verdict.reason, ReasonCode::CleanExit);

        shutdown_tx.send(true).unwrap();
        task.await.unwrap().unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_duplicate_event_never_double_alerts() {
        let dup = event("c1", EventKind::Die, 1, Some(137));
        let daemon = Arc::new(FakeDaemon::new(
            vec![running("c1")],
            vec![vec![
                Scripted::Event(dup.clone()),
                Scripted::Event(dup),
                Scripted::Stall,
            ]],
        ));
        let queue = Arc::new(VerdictQueue::new(16));
        let (reconciler, shutdown_tx) = reconciler(Arc::clone(&daemon), Arc::clone(&queue));
        let task = tokio::spawn(reconciler.run());

        let first = queue.pop().await.expect("Expected a verdict");
        assert_eq!(first.reason, ReasonCode::UnexpectedExit);
        // Let the reconciler chew through the duplicate before checking.
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(queue.try_pop().await.is_none());

        shutdown_tx.send(true).unwrap();
        task.await.unwrap().unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_silent_stream_triggers_a_fresh_snapshot() {
        // Heartbeat default is 30s; a silent stream must force
        // Live -> Degraded -> Syncing with a fresh snapshot and subscription.
        let daemon = Arc::new(FakeDaemon::new(
            vec![running("c1")],
            vec![vec![Scripted::Stall], vec![Scripted::Stall]],
        ));
        let queue = Arc::new(VerdictQueue::new(16));
        let (reconciler, shutdown_tx) = reconciler(Arc::clone(&daemon), Arc::clone(&queue));
        let task = tokio::spawn(reconciler.run());

        tokio::time::sleep(Duration::from_secs(31)).await;
        assert!(daemon.snapshot_calls.load(Ordering::SeqCst) >= 2);
        assert!(daemon.subscribe_calls.load(Ordering::SeqCst) >= 2);

        shutdown_tx.send(true).unwrap();
        task.await.unwrap().unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_sequence_gap_triggers_resync() {
        let daemon = Arc::new(FakeDaemon::new(
            vec![running("c1")],
            vec![
                vec![
                    Scripted::Event(event("c1", EventKind::Start, 1, None)),
                    // seq jumps to 4: events were lost.
                    Scripted::Event(event("c1", EventKind::Start, 4, None)),
                    Scripted::Stall,
                ],
                vec![Scripted::Stall],
            ],
        ));
        let queue = Arc::new(VerdictQueue::new(16));
        let (reconciler, shutdown_tx) = reconciler(Arc::clone(&daemon), Arc::clone(&queue));
        let task = tokio::spawn(reconciler.run());

        tokio::time::sleep(Duration::from_secs(1)).await;
        assert!(daemon.snapshot_calls.load(Ordering::SeqCst) >= 2);
        assert!(daemon.subscribe_calls.load(Ordering::SeqCst) >= 2);

        shutdown_tx.send(true).unwrap();
        task.await.unwrap().unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_stream_error_triggers_resync() {
        let daemon = Arc::new(FakeDaemon::new(
            vec![running("c1")],
            vec![vec![Scripted::StreamError], vec![Scripted::Stall]],
        ));
        let queue = Arc::new(VerdictQueue::new(16));
        let (reconciler, shutdown_tx) = reconciler(Arc::clone(&daemon), Arc::clone(&queue));
        let task = tokio::spawn(reconciler.run());

        tokio::time::sleep(Duration::from_secs(1)).await;
        assert!(daemon.snapshot_calls.load(Ordering::SeqCst) >= 2);

        shutdown_tx.send(true).unwrap();
        task.await.unwrap().unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_restart_loop_alerts_once_on_the_third_restart() {
        let script: Vec<Scripted> = (1..=4)
            .map(|seq| Scripted::Event(event("c1", EventKind::Restart, seq, None)))
            .chain(std::iter::once(Scripted::Stall))
            .collect();
        let daemon = Arc::new(FakeDaemon::new(vec![running("c1")], vec![script]));
        let queue = Arc::new(VerdictQueue::new(16));
        let (reconciler, shutdown_tx) = reconciler(Arc::clone(&daemon), Arc::clone(&queue));
        let task = tokio::spawn(reconciler.run());

        let verdict = queue.pop().await.expect("Expected a verdict");
        assert_eq!(verdict.reason, ReasonCode::RestartLoop);
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(queue.try_pop().await.is_none(), "restart loop alerted twice");

        shutdown_tx.send(true).unwrap();
        task.await.unwrap().unwrap();
    }
}
