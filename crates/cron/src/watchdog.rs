//! Stuck-request watchdog: force-fail requests nobody claimed in time, and
//! claimed requests whose result was never written.

use std::{sync::Arc, time::Duration};

use {
    serde::Serialize,
    tracing::{info, warn},
};

#[cfg(feature = "metrics")]
use deckhand_metrics::{counter, labels, watchdog as watchdog_metrics};

use crate::{
    Result,
    executor::ExecutorTimeouts,
    store::MirrorStore,
    types::{AuditEvent, CommandRequest, QueueKind, RequestStatus, StuckDiagnostic, duration_ms},
};

/// Tally of one sweep across both queues.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WatchdogOutcome {
    /// Queued requests failed for waiting too long.
    pub failed: usize,
    /// Running requests failed because their result never arrived.
    pub orphaned: usize,
    /// Audit rows that could not be written; the transitions still stand.
    pub audit_failures: usize,
}

pub struct Watchdog {
    store: Arc<dyn MirrorStore>,
    project_id: String,
    stuck_after: Duration,
    batch_size: u32,
    actor: String,
    timeouts: ExecutorTimeouts,
}

impl Watchdog {
    pub fn new(
        store: Arc<dyn MirrorStore>,
        project_id: impl Into<String>,
        stuck_after: Duration,
        batch_size: u32,
        actor: impl Into<String>,
    ) -> Self {
        Self {
            store,
            project_id: project_id.into(),
            stuck_after,
            batch_size,
            actor: actor.into(),
            timeouts: ExecutorTimeouts::default(),
        }
    }

    /// Executor limits used to decide when a `running` request is orphaned.
    #[must_use]
    pub fn with_executor_timeouts(mut self, timeouts: ExecutorTimeouts) -> Self {
        self.timeouts = timeouts;
        self
    }

    /// How long a request may stay `running` on `queue`: the executor's hard
    /// limit plus `stuck_after`.
    fn running_limit(&self, queue: QueueKind) -> Duration {
        self.timeouts.for_queue(queue).saturating_add(self.stuck_after)
    }

    /// Sweep both queues for requests still `queued` at `now_ms - stuck_after`
    /// and requests `running` past their limit.
    pub async fn sweep(&self, now_ms: i64) -> Result<WatchdogOutcome> {
        let cutoff_ms = now_ms.saturating_sub(duration_ms(self.stuck_after));
        let mut outcome = WatchdogOutcome::default();

        for queue in QueueKind::ALL {
            let stale = self
                .store
                .fetch_stale(queue, &self.project_id, cutoff_ms, self.batch_size)
                .await?;

            for request in stale {
                let diagnostic =
                    StuckDiagnostic::new(self.stuck_after, request.requested_at_ms, now_ms);
                let payload = serde_json::to_value(&diagnostic)?;
                if !self
                    .store
                    .force_fail(queue, &request.id, &payload, now_ms)
                    .await?
                {
                    // Claimed by a drain pass between the read and the update.
                    continue;
                }
                outcome.failed += 1;
                warn!(
                    queue = %queue,
                    id = %request.id,
                    job_id = %request.job_id,
                    requested_at = %diagnostic.requested_at,
                    "force-failed stuck cron request"
                );
                #[cfg(feature = "metrics")]
                counter!(watchdog_metrics::REQUESTS_FAILED_TOTAL, labels::QUEUE => queue.as_str())
                    .increment(1);

                let message = format!(
                    "cron {queue} request {} for job {} stuck in queue since {}; marked error",
                    request.id, request.job_id, diagnostic.requested_at
                );
                self.audit(&request, message, &mut outcome).await;
            }

            self.sweep_orphaned(queue, now_ms, &mut outcome).await?;
        }

        if outcome.failed > 0 || outcome.orphaned > 0 {
            info!(
                failed = outcome.failed,
                orphaned = outcome.orphaned,
                "watchdog sweep finished"
            );
        }
        Ok(outcome)
    }

    async fn sweep_orphaned(
        &self,
        queue: QueueKind,
        now_ms: i64,
        outcome: &mut WatchdogOutcome,
    ) -> Result<()> {
        let limit = self.running_limit(queue);
        let started_before_ms = now_ms.saturating_sub(duration_ms(limit));
        let orphaned = self
            .store
            .fetch_orphaned(queue, &self.project_id, started_before_ms, self.batch_size)
            .await?;

        for request in orphaned {
            let started_at_ms = request.started_at_ms.unwrap_or(request.requested_at_ms);
            let diagnostic =
                StuckDiagnostic::orphaned(limit, request.requested_at_ms, started_at_ms, now_ms);
            let payload = serde_json::to_value(&diagnostic)?;
            if !self
                .store
                .complete(queue, &request.id, RequestStatus::Error, &payload, now_ms)
                .await?
            {
                // The drain pass wrote its result after all.
                continue;
            }
            outcome.orphaned += 1;
            warn!(
                queue = %queue,
                id = %request.id,
                job_id = %request.job_id,
                started_at = diagnostic.started_at.as_deref().unwrap_or_default(),
                "force-failed orphaned cron request"
            );
            #[cfg(feature = "metrics")]
            counter!(watchdog_metrics::REQUESTS_FAILED_TOTAL, labels::QUEUE => queue.as_str())
                .increment(1);

            let message = format!(
                "cron {queue} request {} for job {} running since {} with no result; marked error",
                request.id,
                request.job_id,
                diagnostic.started_at.as_deref().unwrap_or_default()
            );
            self.audit(&request, message, outcome).await;
        }
        Ok(())
    }

    async fn audit(
        &self,
        request: &CommandRequest,
        message: String,
        outcome: &mut WatchdogOutcome,
    ) {
        let event = AuditEvent::watchdog(&self.project_id, message, &self.actor);
        if let Err(e) = self.store.record_activity(&event).await {
            warn!(id = %request.id, error = %e, "failed to record watchdog activity");
            #[cfg(feature = "metrics")]
            counter!(watchdog_metrics::AUDIT_FAILURES_TOTAL).increment(1);
            outcome.audit_failures += 1;
        }
    }
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use {super::*, crate::store_memory::InMemoryStore};

    const MINUTE_MS: i64 = 60_000;
    const NOW: i64 = 1_767_225_600_000;

    fn setup() -> (Arc<InMemoryStore>, Watchdog) {
        let store = Arc::new(InMemoryStore::new());
        let watchdog = Watchdog::new(
            store.clone(),
            "p1",
            Duration::from_secs(120),
            25,
            "cron-worker",
        );
        (store, watchdog)
    }

    #[tokio::test]
    async fn stale_queued_request_is_failed_with_diagnostic() {
        let (store, watchdog) = setup();
        let req = store
            .enqueue(QueueKind::Run, "p1", "j1", NOW - 3 * MINUTE_MS)
            .await
            .unwrap();

        let outcome = watchdog.sweep(NOW).await.unwrap();
        assert_eq!(outcome.failed, 1);

        let stored = store.get_request(QueueKind::Run, &req.id).await.unwrap().unwrap();
        assert_eq!(stored.status, RequestStatus::Error);
        let result = stored.result.unwrap();
        assert!(result["error"].as_str().unwrap().contains("stuck"));
        assert_eq!(result["error"], "stuck >120s");
        assert!(result["requestedAt"].is_string());
        assert!(result["detectedAt"].is_string());

        let activities = store.activities();
        assert_eq!(activities.len(), 1);
        assert_eq!(activities[0].event_type, "watchdog");
        assert_eq!(activities[0].actor_agent_key, "cron-worker");
        assert!(activities[0].message.contains(&req.id));
    }

    #[tokio::test]
    async fn fresh_and_claimed_requests_are_left_alone() {
        let (store, watchdog) = setup();
        let fresh = store
            .enqueue(QueueKind::Delete, "p1", "j1", NOW - MINUTE_MS)
            .await
            .unwrap();
        let running = store
            .enqueue(QueueKind::Delete, "p1", "j2", NOW - 10 * MINUTE_MS)
            .await
            .unwrap();
        store
            .claim(QueueKind::Delete, &running.id, NOW - MINUTE_MS)
            .await
            .unwrap();

        let outcome = watchdog.sweep(NOW).await.unwrap();
        assert_eq!(outcome, WatchdogOutcome::default());
        for (id, status) in [
            (&fresh.id, RequestStatus::Queued),
            (&running.id, RequestStatus::Running),
        ] {
            let stored = store.get_request(QueueKind::Delete, id).await.unwrap().unwrap();
            assert_eq!(stored.status, status);
        }
        assert!(store.activities().is_empty());
    }

    #[tokio::test]
    async fn sweeps_both_queues() {
        let (store, watchdog) = setup();
        for queue in QueueKind::ALL {
            store
                .enqueue(queue, "p1", "j1", NOW - 5 * MINUTE_MS)
                .await
                .unwrap();
        }
        assert_eq!(watchdog.sweep(NOW).await.unwrap().failed, 2);
    }

    #[tokio::test]
    async fn audit_failure_does_not_undo_transition() {
        let (store, watchdog) = setup();
        store.set_fail_activity_writes(true);
        let req = store
            .enqueue(QueueKind::Run, "p1", "j1", NOW - 5 * MINUTE_MS)
            .await
            .unwrap();

        let outcome = watchdog.sweep(NOW).await.unwrap();
        assert_eq!(outcome, WatchdogOutcome {
            failed: 1,
            audit_failures: 1,
            ..Default::default()
        });
        let stored = store.get_request(QueueKind::Run, &req.id).await.unwrap().unwrap();
        assert_eq!(stored.status, RequestStatus::Error);
    }

    #[tokio::test]
    async fn unclaimed_request_resolves_within_cutoff_plus_interval() {
        let (store, watchdog) = setup();
        let interval_ms = 30_000;
        let requested = NOW;
        let req = store
            .enqueue(QueueKind::Run, "p1", "j1", requested)
            .await
            .unwrap();

        // Ticks at an arbitrary phase relative to the request.
        let mut tick = requested + 7_000;
        while tick <= requested + 2 * MINUTE_MS + interval_ms {
            watchdog.sweep(tick).await.unwrap();
            tick += interval_ms;
        }

        let stored = store.get_request(QueueKind::Run, &req.id).await.unwrap().unwrap();
        assert_eq!(stored.status, RequestStatus::Error);
        assert!(stored.finished_at_ms.unwrap() <= requested + 2 * MINUTE_MS + interval_ms);
    }

    #[tokio::test]
    async fn batch_size_limits_each_sweep() {
        let store = Arc::new(InMemoryStore::new());
        let watchdog = Watchdog::new(store.clone(), "p1", Duration::from_secs(120), 2, "w");
        for i in 0..3 {
            store
                .enqueue(QueueKind::Run, "p1", &format!("j{i}"), NOW - 5 * MINUTE_MS)
                .await
                .unwrap();
        }
        assert_eq!(watchdog.sweep(NOW).await.unwrap().failed, 2);
        assert_eq!(watchdog.sweep(NOW).await.unwrap().failed, 1);
    }

    #[tokio::test]
    async fn orphaned_running_request_is_failed_after_executor_limit() {
        let (store, watchdog) = setup();
        let watchdog = watchdog.with_executor_timeouts(ExecutorTimeouts {
            run: Duration::from_secs(600),
            ..Default::default()
        });
        let req = store
            .enqueue(QueueKind::Run, "p1", "j1", NOW - 30 * MINUTE_MS)
            .await
            .unwrap();
        let started = NOW - 13 * MINUTE_MS;
        store.claim(QueueKind::Run, &req.id, started).await.unwrap();

        // 13 minutes running is past 10m executor limit + 2m cutoff.
        let outcome = watchdog.sweep(NOW).await.unwrap();
        assert_eq!(outcome.orphaned, 1);
        assert_eq!(outcome.failed, 0);

        let stored = store.get_request(QueueKind::Run, &req.id).await.unwrap().unwrap();
        assert_eq!(stored.status, RequestStatus::Error);
        let result = stored.result.unwrap();
        assert_eq!(result["error"], "running >720s without a result");
        assert!(result["startedAt"].is_string());
        assert!(store.activities()[0].message.contains("no result"));
    }

    #[tokio::test]
    async fn request_with_lost_result_is_eventually_failed() {
        use crate::{
            drain::DrainLoop,
            executor::{
                Executor,
                testing::{Reply, ScriptedRunner},
            },
            types::now_ms,
        };

        let store = Arc::new(InMemoryStore::new());
        let runner = Arc::new(ScriptedRunner::new());
        runner.reply("cron run", Reply::ok("ok"));
        let timeouts = ExecutorTimeouts::default();
        let drain = DrainLoop::new(
            QueueKind::Run,
            store.clone(),
            Executor::new(runner, timeouts),
            "p1",
            5,
            4000,
        );
        let watchdog = Watchdog::new(store.clone(), "p1", Duration::from_secs(120), 25, "w")
            .with_executor_timeouts(timeouts);

        let req = store.enqueue(QueueKind::Run, "p1", "j1", now_ms()).await.unwrap();
        store.fail_next_completes(usize::MAX);
        assert_eq!(drain.run_cycle().await.unwrap().unrecorded, 1);
        store.fail_next_completes(0);

        // Nothing retries a running row; only the watchdog resolves it.
        for _ in 0..3 {
            drain.run_cycle().await.unwrap();
        }
        assert_eq!(watchdog.sweep(now_ms()).await.unwrap().orphaned, 0);

        let later = now_ms() + duration_ms(timeouts.run) + 3 * MINUTE_MS;
        assert_eq!(watchdog.sweep(later).await.unwrap().orphaned, 1);
        let stored = store.get_request(QueueKind::Run, &req.id).await.unwrap().unwrap();
        assert_eq!(stored.status, RequestStatus::Error);
    }

    #[tokio::test]
    async fn huge_cutoff_fails_nothing() {
        let store = Arc::new(InMemoryStore::new());
        let watchdog = Watchdog::new(store.clone(), "p1", Duration::MAX, 25, "w");
        store
            .enqueue(QueueKind::Run, "p1", "j1", NOW - 60 * MINUTE_MS)
            .await
            .unwrap();
        assert_eq!(watchdog.sweep(NOW).await.unwrap(), WatchdogOutcome::default());
    }

    #[tokio::test]
    async fn sub_second_cutoff_is_reported_in_millis() {
        let store = Arc::new(InMemoryStore::new());
        let watchdog = Watchdog::new(store.clone(), "p1", Duration::from_millis(500), 25, "w");
        let req = store.enqueue(QueueKind::Delete, "p1", "j1", NOW - 1_000).await.unwrap();
        watchdog.sweep(NOW).await.unwrap();
        let stored = store.get_request(QueueKind::Delete, &req.id).await.unwrap().unwrap();
        assert_eq!(stored.result.unwrap()["error"], "stuck >500ms");
    }
}
