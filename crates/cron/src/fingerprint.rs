//! Change detection over the executor's job list.
//!
//! The fingerprint is a 32-bit FNV-1a hash of a sorted, minimal projection of
//! every job. It only answers "did anything observable change since the last
//! mirror write", so collisions cost at most one missed update.

use serde::Serialize;

use crate::types::{ExecutorJob, ExecutorSchedule};

const FNV_OFFSET_BASIS: u32 = 0x811C_9DC5;
const FNV_PRIME: u32 = 0x0100_0193;

/// 32-bit FNV-1a.
#[must_use]
pub fn fnv1a_32(bytes: &[u8]) -> u32 {
    bytes.iter().fold(FNV_OFFSET_BASIS, |hash, b| {
        (hash ^ u32::from(*b)).wrapping_mul(FNV_PRIME)
    })
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct Projection<'a> {
    id: &'a str,
    name: &'a str,
    enabled: bool,
    schedule: &'a ExecutorSchedule,
    next_run_at_ms: Option<i64>,
    last_run_at_ms: Option<i64>,
    last_status: Option<&'a str>,
}

impl<'a> From<&'a ExecutorJob> for Projection<'a> {
    fn from(job: &'a ExecutorJob) -> Self {
        Self {
            id: &job.id,
            name: &job.name,
            enabled: job.enabled,
            schedule: &job.schedule,
            next_run_at_ms: job.state.next_run_at_ms,
            last_run_at_ms: job.state.last_run_at_ms,
            last_status: job.state.last_status.as_deref(),
        }
    }
}

/// Order-independent fingerprint of a job list, as lowercase hex.
pub fn fingerprint(jobs: &[ExecutorJob]) -> crate::Result<String> {
    let mut items = jobs
        .iter()
        .map(|job| Ok((job.id.as_str(), serde_json::to_string(&Projection::from(job))?)))
        .collect::<crate::Result<Vec<_>>>()?;
    // Ties on id (the executor should never report them) fall back to the
    // serialized form so the order is still total.
    items.sort_unstable();

    let mut canonical = String::from("[");
    for (i, (_, item)) in items.iter().enumerate() {
        if i > 0 {
            canonical.push(',');
        }
        canonical.push_str(item);
    }
    canonical.push(']');

    Ok(format!("{:x}", fnv1a_32(canonical.as_bytes())))
}
