//! The mirror store: the relational tables shared with the control API.

use {async_trait::async_trait, serde_json::Value};

use crate::{
    Result,
    types::{AuditEvent, CommandRequest, MirrorRow, QueueKind, RequestStatus},
};

/// Persistence the mirror loop, drain loops and watchdog depend on.
///
/// Every status transition is a conditional single-row update returning
/// whether it applied, so a lost race is visible to the caller instead of
/// silently overwriting another writer.
#[async_trait]
pub trait MirrorStore: Send + Sync {
    /// Fingerprint stored on the project's sentinel row, if any.
    async fn read_fingerprint(&self, project_id: &str) -> Result<Option<String>>;

    /// Upsert every job row in one transaction, keyed by
    /// `(project_id, job_id)`, and drop non-sentinel rows not in `rows`.
    async fn upsert_mirror_rows(&self, project_id: &str, rows: &[MirrorRow]) -> Result<()>;

    /// Upsert the sentinel row with `fingerprint`.
    async fn write_fingerprint(&self, project_id: &str, fingerprint: &str) -> Result<()>;

    /// Job rows of a project ordered by `job_id`, sentinel excluded.
    async fn list_mirror_rows(&self, project_id: &str) -> Result<Vec<MirrorRow>>;

    /// Insert a new `queued` request.
    async fn enqueue(
        &self,
        queue: QueueKind,
        project_id: &str,
        job_id: &str,
        requested_at_ms: i64,
    ) -> Result<CommandRequest>;

    async fn get_request(&self, queue: QueueKind, id: &str) -> Result<Option<CommandRequest>>;

    /// Oldest `queued` requests first.
    async fn fetch_queued(
        &self,
        queue: QueueKind,
        project_id: &str,
        limit: u32,
    ) -> Result<Vec<CommandRequest>>;

    /// `queued → running`. Returns `false` when the row is no longer queued.
    async fn claim(&self, queue: QueueKind, id: &str, now_ms: i64) -> Result<bool>;

    /// `running → done | error` with the result payload. Returns `false`
    /// when the row is not running (terminal rows are never rewritten).
    async fn complete(
        &self,
        queue: QueueKind,
        id: &str,
        status: RequestStatus,
        result: &Value,
        now_ms: i64,
    ) -> Result<bool>;

    /// `queued` requests with `requested_at_ms <= cutoff_ms`, oldest first.
    async fn fetch_stale(
        &self,
        queue: QueueKind,
        project_id: &str,
        cutoff_ms: i64,
        limit: u32,
    ) -> Result<Vec<CommandRequest>>;

    /// `running` requests with `started_at_ms <= started_before_ms`, oldest
    /// claim first. These were claimed but their result was never written.
    async fn fetch_orphaned(
        &self,
        queue: QueueKind,
        project_id: &str,
        started_before_ms: i64,
        limit: u32,
    ) -> Result<Vec<CommandRequest>>;

    /// `queued → error` with a diagnostic. Returns `false` when the row was
    /// claimed (or finished) in the meantime.
    async fn force_fail(
        &self,
        queue: QueueKind,
        id: &str,
        result: &Value,
        now_ms: i64,
    ) -> Result<bool>;

    /// Append to the `activities` audit log.
    async fn record_activity(&self, event: &AuditEvent) -> Result<()>;
}
