//! Mirror loop: copy the executor's job list into the mirror table when it
//! changes.

use std::sync::Arc;

#[cfg(feature = "metrics")]
use std::time::Instant;

use {
    serde::Serialize,
    tracing::{debug, info, warn},
};

#[cfg(feature = "metrics")]
use deckhand_metrics::{counter, gauge, histogram, labels, mirror as mirror_metrics};

use crate::{
    Result,
    executor::Executor,
    fingerprint::fingerprint,
    store::MirrorStore,
    types::{MirrorRow, SENTINEL_JOB_ID},
};

/// What one mirror cycle did.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MirrorOutcome {
    /// `false` when the fingerprint matched and nothing was written.
    pub changed: bool,
    pub fingerprint: String,
    pub job_count: usize,
}

pub struct MirrorLoop {
    store: Arc<dyn MirrorStore>,
    executor: Executor,
    project_id: String,
    instructions_limit: usize,
}

impl MirrorLoop {
    pub fn new(
        store: Arc<dyn MirrorStore>,
        executor: Executor,
        project_id: impl Into<String>,
        instructions_limit: usize,
    ) -> Self {
        Self {
            store,
            executor,
            project_id: project_id.into(),
            instructions_limit,
        }
    }

    /// List, fingerprint and, on change, write job rows then the sentinel.
    ///
    /// Any executor or store error aborts the cycle before the sentinel is
    /// touched, so the next successful cycle rewrites everything.
    pub async fn run_cycle(&self) -> Result<MirrorOutcome> {
        #[cfg(feature = "metrics")]
        let started = Instant::now();

        let result = self.cycle().await;

        #[cfg(feature = "metrics")]
        {
            let outcome = match &result {
                Ok(o) if o.changed => "changed",
                Ok(_) => "unchanged",
                Err(_) => "failed",
            };
            counter!(mirror_metrics::CYCLES_TOTAL, labels::OUTCOME => outcome).increment(1);
            histogram!(mirror_metrics::CYCLE_DURATION_SECONDS)
                .record(started.elapsed().as_secs_f64());
            if let Ok(o) = &result {
                gauge!(mirror_metrics::JOBS_OBSERVED).set(o.job_count as f64);
            }
        }

        result
    }

    async fn cycle(&self) -> Result<MirrorOutcome> {
        let jobs = self.executor.list_jobs().await?;
        let fp = fingerprint(&jobs)?;
        let stored = self.store.read_fingerprint(&self.project_id).await?;

        if stored.as_deref() == Some(fp.as_str()) {
            debug!(fingerprint = %fp, jobs = jobs.len(), "cron jobs unchanged");
            return Ok(MirrorOutcome {
                changed: false,
                fingerprint: fp,
                job_count: jobs.len(),
            });
        }

        let rows: Vec<MirrorRow> = jobs
            .iter()
            .filter(|job| {
                let reserved = job.id == SENTINEL_JOB_ID;
                if reserved {
                    warn!(id = %job.id, "executor job uses the reserved mirror id, skipping");
                }
                !reserved
            })
            .map(|job| MirrorRow::from_job(&self.project_id, job, self.instructions_limit))
            .collect();

        self.store
            .upsert_mirror_rows(&self.project_id, &rows)
            .await?;
        self.store.write_fingerprint(&self.project_id, &fp).await?;

        info!(
            project_id = %self.project_id,
            count = rows.len(),
            fingerprint = %fp,
            previous = stored.as_deref().unwrap_or("none"),
            "mirrored cron jobs"
        );

        Ok(MirrorOutcome {
            changed: true,
            fingerprint: fp,
            job_count: jobs.len(),
        })
    }
}
