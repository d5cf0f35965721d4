//! Drain loops: execute queued run/delete requests against the executor.

use std::{
    sync::Arc,
    time::{Duration, Instant},
};

use {
    serde::Serialize,
    serde_json::Value,
    tracing::{debug, error, info, warn},
};

#[cfg(feature = "metrics")]
use deckhand_metrics::{counter, drain as drain_metrics, histogram, labels};

use crate::{
    Result,
    executor::Executor,
    store::MirrorStore,
    types::{CommandRequest, CommandResult, QueueKind, RequestStatus, now_ms, tail_chars},
};

/// Attempts at writing a request's terminal status before leaving it to
/// the watchdog.
const COMPLETE_ATTEMPTS: u32 = 3;
const COMPLETE_RETRY_DELAY: Duration = Duration::from_millis(100);

/// Tally of one drain pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct DrainOutcome {
    pub processed: usize,
    pub succeeded: usize,
    pub failed: usize,
    /// Rows another pass claimed first.
    pub skipped: usize,
    /// Executed requests whose result could not be written; they stay
    /// `running` until the watchdog fails them.
    pub unrecorded: usize,
}

pub struct DrainLoop {
    queue: QueueKind,
    store: Arc<dyn MirrorStore>,
    executor: Executor,
    project_id: String,
    batch_size: u32,
    tail_limit: usize,
}

impl DrainLoop {
    pub fn new(
        queue: QueueKind,
        store: Arc<dyn MirrorStore>,
        executor: Executor,
        project_id: impl Into<String>,
        batch_size: u32,
        tail_limit: usize,
    ) -> Self {
        Self {
            queue,
            store,
            executor,
            project_id: project_id.into(),
            batch_size,
            tail_limit,
        }
    }

    #[must_use]
    pub fn queue(&self) -> QueueKind {
        self.queue
    }

    /// Process up to one batch of queued requests, oldest first, one at a time.
    pub async fn run_cycle(&self) -> Result<DrainOutcome> {
        let pending = self
            .store
            .fetch_queued(self.queue, &self.project_id, self.batch_size)
            .await?;

        let mut outcome = DrainOutcome::default();
        if pending.is_empty() {
            return Ok(outcome);
        }
        debug!(queue = %self.queue, count = pending.len(), "draining cron requests");

        for request in pending {
            if !self.store.claim(self.queue, &request.id, now_ms()).await? {
                debug!(queue = %self.queue, id = %request.id, "request already claimed, skipping");
                #[cfg(feature = "metrics")]
                counter!(drain_metrics::CLAIM_CONFLICTS_TOTAL, labels::QUEUE => self.queue.as_str())
                    .increment(1);
                outcome.skipped += 1;
                continue;
            }

            let status = self.execute(&request).await?;
            outcome.processed += 1;
            match status {
                Some(RequestStatus::Done) => outcome.succeeded += 1,
                Some(_) => outcome.failed += 1,
                None => outcome.unrecorded += 1,
            }
        }

        Ok(outcome)
    }

    /// Run one claimed request and write its terminal status. `None` when
    /// the status could not be written.
    async fn execute(&self, request: &CommandRequest) -> Result<Option<RequestStatus>> {
        info!(queue = %self.queue, id = %request.id, job_id = %request.job_id, "executing cron request");

        let started = Instant::now();
        let (status, result) = match self.executor.execute(self.queue, &request.job_id).await {
            Ok(output) => {
                let status = if output.success() {
                    RequestStatus::Done
                } else {
                    RequestStatus::Error
                };
                (status, CommandResult {
                    job_id: request.job_id.clone(),
                    exit_code: output.exit_code,
                    duration_ms: output.duration.as_millis() as u64,
                    stdout_tail: tail_chars(&output.stdout, self.tail_limit),
                    stderr_tail: tail_chars(&output.stderr, self.tail_limit),
                })
            },
            Err(e) => {
                warn!(queue = %self.queue, id = %request.id, error = %e, "executor command failed");
                (RequestStatus::Error, CommandResult {
                    job_id: request.job_id.clone(),
                    exit_code: None,
                    duration_ms: started.elapsed().as_millis() as u64,
                    stdout_tail: String::new(),
                    stderr_tail: tail_chars(&e.to_string(), self.tail_limit),
                })
            },
        };

        #[cfg(feature = "metrics")]
        {
            counter!(
                drain_metrics::EXECUTIONS_TOTAL,
                labels::QUEUE => self.queue.as_str(),
                labels::STATUS => status.as_str()
            )
            .increment(1);
            histogram!(drain_metrics::EXECUTION_DURATION_SECONDS, labels::QUEUE => self.queue.as_str())
                .record(result.duration_ms as f64 / 1000.0);
        }

        let payload: Value = serde_json::to_value(&result)?;
        let Some(written) = self.complete(request, status, &payload).await else {
            return Ok(None);
        };
        if written {
            info!(
                queue = %self.queue,
                id = %request.id,
                status = %status,
                exit_code = ?result.exit_code,
                duration_ms = result.duration_ms,
                "cron request finished"
            );
        } else {
            warn!(queue = %self.queue, id = %request.id, "request left running state before completion");
        }
        Ok(Some(status))
    }

    /// `store.complete` with bounded retries. `None` once every attempt failed.
    async fn complete(
        &self,
        request: &CommandRequest,
        status: RequestStatus,
        payload: &Value,
    ) -> Option<bool> {
        let mut attempt = 1;
        loop {
            match self
                .store
                .complete(self.queue, &request.id, status, payload, now_ms())
                .await
            {
                Ok(written) => return Some(written),
                Err(e) if attempt < COMPLETE_ATTEMPTS => {
                    warn!(
                        queue = %self.queue,
                        id = %request.id,
                        attempt,
                        error = %e,
                        "failed to record request result, retrying"
                    );
                    tokio::time::sleep(COMPLETE_RETRY_DELAY * attempt).await;
                    attempt += 1;
                },
                Err(e) => {
                    error!(
                        queue = %self.queue,
                        id = %request.id,
                        status = %status,
                        error = %e,
                        "giving up on recording request result; watchdog will fail it"
                    );
                    return None;
                },
            }
        }
    }
}
