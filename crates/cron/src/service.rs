//! Orchestrator: the four loops on independent timers.

use std::{
    collections::BTreeMap,
    sync::{
        Arc, Mutex as StdMutex,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};

use {
    chrono::{DateTime, Utc},
    serde::Serialize,
    tokio::{sync::Mutex, task::JoinHandle},
    tracing::{debug, error, info},
};

#[cfg(feature = "metrics")]
use deckhand_metrics::{counter, gauge, labels, loops as loop_metrics, mirror as mirror_metrics};

use crate::{
    Result,
    backoff::Backoff,
    drain::{DrainLoop, DrainOutcome},
    executor::Executor,
    mirror::{MirrorLoop, MirrorOutcome},
    settings::ServiceConfig,
    store::MirrorStore,
    types::{QueueKind, now_ms},
    watchdog::{Watchdog, WatchdogOutcome},
};

/// The recurring tasks the service runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LoopKind {
    Mirror,
    RunDrain,
    DeleteDrain,
    Watchdog,
}

impl LoopKind {
    pub const ALL: [Self; 4] = [
        Self::Mirror,
        Self::RunDrain,
        Self::DeleteDrain,
        Self::Watchdog,
    ];

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Mirror => "mirror",
            Self::RunDrain => "run_drain",
            Self::DeleteDrain => "delete_drain",
            Self::Watchdog => "watchdog",
        }
    }

    fn drain(queue: QueueKind) -> Self {
        match queue {
            QueueKind::Run => Self::RunDrain,
            QueueKind::Delete => Self::DeleteDrain,
        }
    }
}

impl std::fmt::Display for LoopKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A cycle either ran or was skipped because one was already in flight.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CycleOutcome<T> {
    Completed(T),
    Skipped,
}

impl<T> CycleOutcome<T> {
    #[must_use]
    pub fn completed(self) -> Option<T> {
        match self {
            Self::Completed(value) => Some(value),
            Self::Skipped => None,
        }
    }
}

/// At most one execution of a task at a time.
#[derive(Debug, Default)]
struct SingleFlight {
    busy: AtomicBool,
}

struct FlightGuard<'a>(&'a AtomicBool);

impl SingleFlight {
    fn try_enter(&self) -> Option<FlightGuard<'_>> {
        self.busy
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| FlightGuard(&self.busy))
    }
}

impl Drop for FlightGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// Health of one loop.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct LoopStatus {
    pub last_success_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub consecutive_failures: u32,
}

/// Point-in-time view of the service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ServiceStatus {
    pub running: bool,
    pub project_id: String,
    pub mirror_backoff_secs: u64,
    pub last_fingerprint: Option<String>,
    pub loops: BTreeMap<LoopKind, LoopStatus>,
}

#[derive(Default)]
struct Health {
    last_fingerprint: Option<String>,
    loops: BTreeMap<LoopKind, LoopStatus>,
}

/// Runs the mirror loop, both drain loops and the watchdog.
pub struct CronMirrorService {
    config: ServiceConfig,
    mirror: MirrorLoop,
    run_drain: DrainLoop,
    delete_drain: DrainLoop,
    watchdog: Watchdog,
    flights: BTreeMap<LoopKind, SingleFlight>,
    backoff: StdMutex<Backoff>,
    health: StdMutex<Health>,
    handles: Mutex<Vec<JoinHandle<()>>>,
    running: AtomicBool,
}

impl CronMirrorService {
    pub fn new(
        store: Arc<dyn MirrorStore>,
        executor: Executor,
        config: ServiceConfig,
    ) -> Arc<Self> {
        let drain = |queue| {
            DrainLoop::new(
                queue,
                Arc::clone(&store),
                executor.clone(),
                config.project_id.clone(),
                config.drain_batch_size,
                config.tail_limit,
            )
        };
        let run_drain = drain(QueueKind::Run);
        let delete_drain = drain(QueueKind::Delete);

        Arc::new(Self {
            mirror: MirrorLoop::new(
                Arc::clone(&store),
                executor.clone(),
                config.project_id.clone(),
                config.instructions_limit,
            ),
            run_drain,
            delete_drain,
            watchdog: Watchdog::new(
                Arc::clone(&store),
                config.project_id.clone(),
                config.stuck_after,
                config.watchdog_batch_size,
                config.actor.clone(),
            )
            .with_executor_timeouts(config.timeouts),
            flights: LoopKind::ALL
                .into_iter()
                .map(|kind| (kind, SingleFlight::default()))
                .collect(),
            backoff: StdMutex::new(Backoff::new(
                config.mirror_base_interval,
                config.mirror_max_interval,
            )),
            health: StdMutex::new(Health::default()),
            handles: Mutex::new(Vec::new()),
            running: AtomicBool::new(false),
            config,
        })
    }

    /// Spawn one timer task per loop. Each runs a cycle immediately, then
    /// re-arms only after the cycle has finished.
    pub async fn start(self: &Arc<Self>) {
        let mut handles = self.handles.lock().await;
        if self.running.swap(true, Ordering::SeqCst) {
            debug!("cron mirror service already running");
            return;
        }

        for kind in LoopKind::ALL {
            let svc = Arc::clone(self);
            handles.push(tokio::spawn(async move {
                loop {
                    let delay = svc.tick(kind).await;
                    tokio::time::sleep(delay).await;
                }
            }));
        }
        info!(
            project_id = %self.config.project_id,
            mirror_interval_secs = self.config.mirror_base_interval.as_secs(),
            run_interval_secs = self.config.run_interval.as_secs(),
            delete_interval_secs = self.config.delete_interval.as_secs(),
            watchdog_interval_secs = self.config.watchdog_interval.as_secs(),
            "cron mirror service started"
        );
    }

    /// Abort all timer tasks. A cycle in flight is dropped at its next
    /// suspension point; a running executor child is killed with it.
    pub async fn stop(&self) {
        let mut handles = self.handles.lock().await;
        for handle in handles.drain(..) {
            handle.abort();
        }
        self.running.store(false, Ordering::SeqCst);
        info!("cron mirror service stopped");
    }

    /// Run one cycle of `kind`, log its result, and return the delay until
    /// the next one.
    async fn tick(&self, kind: LoopKind) -> Duration {
        let result = match kind {
            LoopKind::Mirror => self.run_mirror_once().await.map(|o| o.completed().is_some()),
            LoopKind::RunDrain => self
                .run_drain_once(QueueKind::Run)
                .await
                .map(|o| o.completed().is_some()),
            LoopKind::DeleteDrain => self
                .run_drain_once(QueueKind::Delete)
                .await
                .map(|o| o.completed().is_some()),
            LoopKind::Watchdog => self
                .run_watchdog_once()
                .await
                .map(|o| o.completed().is_some()),
        };
        match result {
            Ok(true) => {},
            Ok(false) => debug!(%kind, "previous cycle still running, skipped"),
            Err(e) => error!(%kind, error = %e, "cron loop cycle failed"),
        }
        self.next_delay(kind)
    }

    fn next_delay(&self, kind: LoopKind) -> Duration {
        match kind {
            LoopKind::Mirror => self.mirror_backoff(),
            LoopKind::RunDrain => self.config.run_interval,
            LoopKind::DeleteDrain => self.config.delete_interval,
            LoopKind::Watchdog => self.config.watchdog_interval,
        }
    }

    /// One mirror cycle. Success resets the backoff; failure doubles it.
    pub async fn run_mirror_once(&self) -> Result<CycleOutcome<MirrorOutcome>> {
        let Some(_flight) = self.enter(LoopKind::Mirror) else {
            return Ok(CycleOutcome::Skipped);
        };

        let result = self.mirror.run_cycle().await;
        let delay = {
            let mut backoff = self.backoff.lock().unwrap_or_else(|e| e.into_inner());
            if result.is_ok() {
                backoff.on_success()
            } else {
                backoff.on_failure()
            }
        };
        #[cfg(feature = "metrics")]
        gauge!(mirror_metrics::BACKOFF_SECONDS).set(delay.as_secs_f64());

        match &result {
            Ok(outcome) => {
                self.health().last_fingerprint = Some(outcome.fingerprint.clone());
            },
            Err(_) => info!(
                next_attempt_secs = delay.as_secs(),
                "mirror cycle failed, backing off"
            ),
        }
        self.record(LoopKind::Mirror, &result);
        result.map(CycleOutcome::Completed)
    }

    /// One pass over the run or delete queue.
    pub async fn run_drain_once(&self, queue: QueueKind) -> Result<CycleOutcome<DrainOutcome>> {
        let kind = LoopKind::drain(queue);
        let Some(_flight) = self.enter(kind) else {
            return Ok(CycleOutcome::Skipped);
        };
        let drain = match queue {
            QueueKind::Run => &self.run_drain,
            QueueKind::Delete => &self.delete_drain,
        };
        let result = drain.run_cycle().await;
        self.record(kind, &result);
        result.map(CycleOutcome::Completed)
    }

    /// One watchdog sweep at the current time.
    pub async fn run_watchdog_once(&self) -> Result<CycleOutcome<WatchdogOutcome>> {
        let Some(_flight) = self.enter(LoopKind::Watchdog) else {
            return Ok(CycleOutcome::Skipped);
        };
        let result = self.watchdog.sweep(now_ms()).await;
        self.record(LoopKind::Watchdog, &result);
        result.map(CycleOutcome::Completed)
    }

    #[must_use]
    pub fn mirror_backoff(&self) -> Duration {
        self.backoff
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .current()
    }

    #[must_use]
    pub fn status(&self) -> ServiceStatus {
        let health = self.health();
        ServiceStatus {
            running: self.running.load(Ordering::SeqCst),
            project_id: self.config.project_id.clone(),
            mirror_backoff_secs: self.mirror_backoff().as_secs(),
            last_fingerprint: health.last_fingerprint.clone(),
            loops: LoopKind::ALL
                .into_iter()
                .map(|kind| (kind, health.loops.get(&kind).cloned().unwrap_or_default()))
                .collect(),
        }
    }

    fn enter(&self, kind: LoopKind) -> Option<FlightGuard<'_>> {
        let guard = self.flights.get(&kind).and_then(SingleFlight::try_enter);
        if guard.is_none() {
            #[cfg(feature = "metrics")]
            counter!(loop_metrics::CYCLES_SKIPPED_TOTAL, labels::LOOP => kind.as_str()).increment(1);
        }
        guard
    }

    fn health(&self) -> std::sync::MutexGuard<'_, Health> {
        self.health.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn record<T>(&self, kind: LoopKind, result: &Result<T>) {
        let mut health = self.health();
        let status = health.loops.entry(kind).or_default();
        match result {
            Ok(_) => {
                status.last_success_at = Some(Utc::now());
                status.last_error = None;
                status.consecutive_failures = 0;
            },
            Err(e) => {
                status.last_error = Some(e.to_string());
                status.consecutive_failures = status.consecutive_failures.saturating_add(1);
                #[cfg(feature = "metrics")]
                counter!(loop_metrics::CYCLE_ERRORS_TOTAL, labels::LOOP => kind.as_str())
                    .increment(1);
            },
        }
    }
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use {
        super::*,
        crate::{
            executor::testing::{Reply, ScriptedRunner},
            store_memory::InMemoryStore,
            types::RequestStatus,
        },
        tokio::sync::Notify,
    };

    const ONE_JOB: &str =
        r#"{"jobs":[{"id":"j1","enabled":true,"schedule":{"kind":"cron","expr":"0 * * * *"}}]}"#;

    fn service(
        runner: Arc<ScriptedRunner>,
    ) -> (Arc<InMemoryStore>, Arc<CronMirrorService>) {
        let store = Arc::new(InMemoryStore::new());
        let config = ServiceConfig::for_project("p1");
        let executor = Executor::new(runner, config.timeouts);
        let svc = CronMirrorService::new(store.clone(), executor, config);
        (store, svc)
    }

    #[tokio::test]
    async fn mirror_timeout_doubles_backoff_then_resets() {
        let runner = Arc::new(ScriptedRunner::new());
        runner.reply("cron list", Reply::Timeout);
        let (store, svc) = service(runner.clone());
        assert_eq!(svc.mirror_backoff(), Duration::from_secs(60));

        let mut seen = Vec::new();
        for _ in 0..5 {
            assert!(svc.run_mirror_once().await.is_err());
            seen.push(svc.mirror_backoff().as_secs());
        }
        assert_eq!(seen, vec![120, 240, 480, 600, 600]);
        assert!(store.read_fingerprint("p1").await.unwrap().is_none());
        assert_eq!(store.mirror_writes(), 0);

        let status = svc.status();
        assert_eq!(status.loops[&LoopKind::Mirror].consecutive_failures, 5);
        assert!(status.loops[&LoopKind::Mirror].last_error.is_some());

        runner.reply("cron list", Reply::ok(ONE_JOB));
        let outcome = svc.run_mirror_once().await.unwrap().completed().unwrap();
        assert!(outcome.changed);
        assert_eq!(svc.mirror_backoff(), Duration::from_secs(60));
        let status = svc.status();
        assert_eq!(status.last_fingerprint, Some(outcome.fingerprint));
        assert_eq!(status.loops[&LoopKind::Mirror].consecutive_failures, 0);
        assert!(status.loops[&LoopKind::Mirror].last_success_at.is_some());
    }

    #[tokio::test]
    async fn overlapping_cycle_is_skipped() {
        let gate = Arc::new(Notify::new());
        let runner = Arc::new(ScriptedRunner::gated(Arc::clone(&gate)));
        runner.reply("cron list", Reply::ok(ONE_JOB));
        let (_store, svc) = service(runner.clone());

        let first = {
            let svc = Arc::clone(&svc);
            tokio::spawn(async move { svc.run_mirror_once().await })
        };
        while runner.calls().is_empty() {
            tokio::task::yield_now().await;
        }

        assert_eq!(svc.run_mirror_once().await.unwrap(), CycleOutcome::Skipped);
        // Other loops are independent.
        assert!(matches!(
            svc.run_watchdog_once().await.unwrap(),
            CycleOutcome::Completed(_)
        ));

        gate.notify_one();
        let first = first.await.unwrap().unwrap();
        assert!(first.completed().unwrap().changed);
        assert_eq!(runner.calls().len(), 1);
    }

    #[tokio::test]
    async fn drain_and_watchdog_once() {
        let runner = Arc::new(ScriptedRunner::new());
        runner.reply("cron run", Reply::fail(1, "boom"));
        let (store, svc) = service(runner);

        let run = store.enqueue(QueueKind::Run, "p1", "j1", now_ms()).await.unwrap();
        let stale = store
            .enqueue(QueueKind::Delete, "p1", "j2", now_ms() - 3 * 60_000)
            .await
            .unwrap();

        let watchdog = svc.run_watchdog_once().await.unwrap().completed().unwrap();
        assert_eq!(watchdog.failed, 1);
        let drained = svc
            .run_drain_once(QueueKind::Run)
            .await
            .unwrap()
            .completed()
            .unwrap();
        assert_eq!(drained.failed, 1);
        let deleted = svc
            .run_drain_once(QueueKind::Delete)
            .await
            .unwrap()
            .completed()
            .unwrap();
        assert_eq!(deleted, DrainOutcome::default());

        let run = store.get_request(QueueKind::Run, &run.id).await.unwrap().unwrap();
        assert_eq!(run.status, RequestStatus::Error);
        let stale = store
            .get_request(QueueKind::Delete, &stale.id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stale.status, RequestStatus::Error);
    }

    #[tokio::test]
    async fn start_runs_every_loop_and_stop_halts() {
        let runner = Arc::new(ScriptedRunner::new());
        runner.reply("cron list", Reply::ok(ONE_JOB));
        let (store, svc) = service(runner);
        store.enqueue(QueueKind::Run, "p1", "j1", now_ms()).await.unwrap();

        svc.start().await;
        svc.start().await;
        assert!(svc.status().running);

        let mut attempts = 0;
        loop {
            let status = svc.status();
            if status.loops.values().all(|l| l.last_success_at.is_some()) {
                break;
            }
            attempts += 1;
            assert!(attempts < 200, "loops did not all complete: {status:?}");
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(store.read_fingerprint("p1").await.unwrap().is_some());
        assert!(
            store
                .fetch_queued(QueueKind::Run, "p1", 10)
                .await
                .unwrap()
                .is_empty()
        );

        svc.stop().await;
        assert!(!svc.status().running);
    }
}
