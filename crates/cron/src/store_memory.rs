//! In-memory store for testing.

use std::{
    collections::{BTreeMap, HashMap},
    sync::{
        Mutex,
        atomic::{AtomicBool, AtomicUsize, Ordering},
    },
};

use {async_trait::async_trait, serde_json::Value};

use crate::{
    Error, Result,
    store::MirrorStore,
    types::{
        AuditEvent, CommandRequest, MirrorRow, QueueKind, RequestStatus, SENTINEL_JOB_ID, now_ms,
    },
};

/// In-memory store backed by maps. No persistence; used by tests.
///
/// Counts mirror-table writes so callers can assert that an unchanged
/// listing touched nothing, and can be told to fail specific writes.
#[derive(Default)]
pub struct InMemoryStore {
    mirror: Mutex<BTreeMap<(String, String), MirrorRow>>,
    queues: Mutex<HashMap<QueueKind, BTreeMap<String, CommandRequest>>>,
    activities: Mutex<Vec<AuditEvent>>,
    mirror_writes: AtomicUsize,
    fail_mirror_writes: AtomicBool,
    fail_activity_writes: AtomicBool,
    failing_completes: AtomicUsize,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of mirror upserts (job batches and sentinel writes) so far.
    pub fn mirror_writes(&self) -> usize {
        self.mirror_writes.load(Ordering::SeqCst)
    }

    pub fn set_fail_mirror_writes(&self, fail: bool) {
        self.fail_mirror_writes.store(fail, Ordering::SeqCst);
    }

    pub fn set_fail_activity_writes(&self, fail: bool) {
        self.fail_activity_writes.store(fail, Ordering::SeqCst);
    }

    /// Reject the next `n` calls to `complete` with an error.
    pub fn fail_next_completes(&self, n: usize) {
        self.failing_completes.store(n, Ordering::SeqCst);
    }

    pub fn activities(&self) -> Vec<AuditEvent> {
        self.activities
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Insert a request as-is, bypassing `enqueue` (e.g. an already-running row).
    pub fn insert_request(&self, queue: QueueKind, request: CommandRequest) {
        let mut queues = self.queues.lock().unwrap_or_else(|e| e.into_inner());
        queues
            .entry(queue)
            .or_default()
            .insert(request.id.clone(), request);
    }

    fn check_mirror_write(&self) -> Result<()> {
        if self.fail_mirror_writes.load(Ordering::SeqCst) {
            return Err(Error::message("mirror write rejected"));
        }
        self.mirror_writes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn transition(
        &self,
        queue: QueueKind,
        id: &str,
        from: RequestStatus,
        apply: impl FnOnce(&mut CommandRequest),
    ) -> bool {
        let mut queues = self.queues.lock().unwrap_or_else(|e| e.into_inner());
        match queues.get_mut(&queue).and_then(|q| q.get_mut(id)) {
            Some(req) if req.status == from => {
                apply(req);
                true
            },
            _ => false,
        }
    }

    fn select(
        &self,
        queue: QueueKind,
        limit: u32,
        filter: impl Fn(&CommandRequest) -> bool,
    ) -> Vec<CommandRequest> {
        let queues = self.queues.lock().unwrap_or_else(|e| e.into_inner());
        let mut rows: Vec<CommandRequest> = queues
            .get(&queue)
            .map(|q| q.values().filter(|r| filter(r)).cloned().collect())
            .unwrap_or_default();
        rows.sort_by(|a, b| {
            a.requested_at_ms
                .cmp(&b.requested_at_ms)
                .then_with(|| a.id.cmp(&b.id))
        });
        rows.truncate(limit as usize);
        rows
    }
}

#[async_trait]
impl MirrorStore for InMemoryStore {
    async fn read_fingerprint(&self, project_id: &str) -> Result<Option<String>> {
        let mirror = self.mirror.lock().unwrap_or_else(|e| e.into_inner());
        Ok(mirror
            .get(&(project_id.to_string(), SENTINEL_JOB_ID.to_string()))
            .and_then(|row| row.schedule_expr.clone()))
    }

    async fn upsert_mirror_rows(&self, project_id: &str, rows: &[MirrorRow]) -> Result<()> {
        self.check_mirror_write()?;
        let mut mirror = self.mirror.lock().unwrap_or_else(|e| e.into_inner());
        mirror.retain(|(project, job_id), _| {
            project != project_id
                || job_id == SENTINEL_JOB_ID
                || rows.iter().any(|r| &r.job_id == job_id)
        });
        for row in rows {
            mirror.insert((project_id.to_string(), row.job_id.clone()), MirrorRow {
                project_id: project_id.to_string(),
                ..row.clone()
            });
        }
        Ok(())
    }

    async fn write_fingerprint(&self, project_id: &str, fingerprint: &str) -> Result<()> {
        self.check_mirror_write()?;
        let mut mirror = self.mirror.lock().unwrap_or_else(|e| e.into_inner());
        mirror.insert(
            (project_id.to_string(), SENTINEL_JOB_ID.to_string()),
            MirrorRow::sentinel(project_id, fingerprint),
        );
        Ok(())
    }

    async fn list_mirror_rows(&self, project_id: &str) -> Result<Vec<MirrorRow>> {
        let mirror = self.mirror.lock().unwrap_or_else(|e| e.into_inner());
        Ok(mirror
            .values()
            .filter(|row| row.project_id == project_id && !row.is_sentinel())
            .cloned()
            .collect())
    }

    async fn enqueue(
        &self,
        queue: QueueKind,
        project_id: &str,
        job_id: &str,
        requested_at_ms: i64,
    ) -> Result<CommandRequest> {
        let request = CommandRequest {
            id: uuid::Uuid::new_v4().to_string(),
            project_id: project_id.to_string(),
            job_id: job_id.to_string(),
            status: RequestStatus::Queued,
            requested_at_ms,
            started_at_ms: None,
            finished_at_ms: None,
            result: None,
        };
        self.insert_request(queue, request.clone());
        Ok(request)
    }

    async fn get_request(&self, queue: QueueKind, id: &str) -> Result<Option<CommandRequest>> {
        let queues = self.queues.lock().unwrap_or_else(|e| e.into_inner());
        Ok(queues.get(&queue).and_then(|q| q.get(id)).cloned())
    }

    async fn fetch_queued(
        &self,
        queue: QueueKind,
        project_id: &str,
        limit: u32,
    ) -> Result<Vec<CommandRequest>> {
        Ok(self.select(queue, limit, |r| {
            r.project_id == project_id && r.status == RequestStatus::Queued
        }))
    }

    async fn claim(&self, queue: QueueKind, id: &str, now_ms: i64) -> Result<bool> {
        Ok(self.transition(queue, id, RequestStatus::Queued, |req| {
            req.status = RequestStatus::Running;
            req.started_at_ms = Some(now_ms);
        }))
    }

    async fn complete(
        &self,
        queue: QueueKind,
        id: &str,
        status: RequestStatus,
        result: &Value,
        now_ms: i64,
    ) -> Result<bool> {
        if !status.is_terminal() {
            return Err(Error::message(format!(
                "cannot complete a request as {status}"
            )));
        }
        if self
            .failing_completes
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return Err(Error::message("result write rejected"));
        }
        Ok(self.transition(queue, id, RequestStatus::Running, |req| {
            req.status = status;
            req.finished_at_ms = Some(now_ms);
            req.result = Some(result.clone());
        }))
    }

    async fn fetch_stale(
        &self,
        queue: QueueKind,
        project_id: &str,
        cutoff_ms: i64,
        limit: u32,
    ) -> Result<Vec<CommandRequest>> {
        Ok(self.select(queue, limit, |r| {
            r.project_id == project_id
                && r.status == RequestStatus::Queued
                && r.requested_at_ms <= cutoff_ms
        }))
    }

    async fn fetch_orphaned(
        &self,
        queue: QueueKind,
        project_id: &str,
        started_before_ms: i64,
        limit: u32,
    ) -> Result<Vec<CommandRequest>> {
        let mut rows = self.select(queue, u32::MAX, |r| {
            r.project_id == project_id
                && r.status == RequestStatus::Running
                && r.started_at_ms.is_some_and(|at| at <= started_before_ms)
        });
        rows.sort_by(|a, b| {
            a.started_at_ms
                .cmp(&b.started_at_ms)
                .then_with(|| a.id.cmp(&b.id))
        });
        rows.truncate(limit as usize);
        Ok(rows)
    }

    async fn force_fail(
        &self,
        queue: QueueKind,
        id: &str,
        result: &Value,
        now_ms: i64,
    ) -> Result<bool> {
        Ok(self.transition(queue, id, RequestStatus::Queued, |req| {
            req.status = RequestStatus::Error;
            req.finished_at_ms = Some(now_ms);
            req.result = Some(result.clone());
        }))
    }

    async fn record_activity(&self, event: &AuditEvent) -> Result<()> {
        if self.fail_activity_writes.load(Ordering::SeqCst) {
            return Err(Error::message("activity write rejected"));
        }
        self.activities
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(event.clone());
        Ok(())
    }
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use {super::*, serde_json::json};

    fn row(job_id: &str) -> MirrorRow {
        MirrorRow {
            project_id: "p1".into(),
            job_id: job_id.into(),
            name: job_id.into(),
            schedule_kind: "cron".into(),
            schedule_expr: Some("0 * * * *".into()),
            tz: None,
            enabled: true,
            next_run_at: None,
            last_run_at: None,
            last_status: None,
            last_duration_ms: None,
            instructions: None,
        }
    }

    #[tokio::test]
    async fn upsert_prunes_missing_jobs_but_keeps_sentinel() {
        let store = InMemoryStore::new();
        store
            .upsert_mirror_rows("p1", &[row("a"), row("b")])
            .await
            .unwrap();
        store.write_fingerprint("p1", "abc").await.unwrap();
        store.upsert_mirror_rows("p1", &[row("b")]).await.unwrap();

        let rows = store.list_mirror_rows("p1").await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].job_id, "b");
        assert_eq!(
            store.read_fingerprint("p1").await.unwrap().as_deref(),
            Some("abc")
        );
        assert_eq!(store.mirror_writes(), 3);
    }

    #[tokio::test]
    async fn projects_are_isolated() {
        let store = InMemoryStore::new();
        store.upsert_mirror_rows("p1", &[row("a")]).await.unwrap();
        store.upsert_mirror_rows("p2", &[]).await.unwrap();
        assert_eq!(store.list_mirror_rows("p1").await.unwrap().len(), 1);
        assert!(store.read_fingerprint("p2").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn terminal_status_is_absorbing() {
        let store = InMemoryStore::new();
        let req = store.enqueue(QueueKind::Run, "p1", "j1", 1).await.unwrap();

        assert!(
            !store
                .complete(QueueKind::Run, &req.id, RequestStatus::Done, &json!({}), 2)
                .await
                .unwrap()
        );
        assert!(store.claim(QueueKind::Run, &req.id, 2).await.unwrap());
        assert!(!store.claim(QueueKind::Run, &req.id, 3).await.unwrap());
        assert!(
            store
                .complete(QueueKind::Run, &req.id, RequestStatus::Done, &json!({"n": 1}), 4)
                .await
                .unwrap()
        );
        assert!(
            !store
                .complete(QueueKind::Run, &req.id, RequestStatus::Error, &json!({"n": 2}), 5)
                .await
                .unwrap()
        );
        assert!(
            !store
                .force_fail(QueueKind::Run, &req.id, &json!({}), 6)
                .await
                .unwrap()
        );

        let stored = store.get_request(QueueKind::Run, &req.id).await.unwrap().unwrap();
        assert_eq!(stored.status, RequestStatus::Done);
        assert_eq!(stored.result, Some(json!({"n": 1})));
        assert_eq!(stored.finished_at_ms, Some(4));
    }

    #[tokio::test]
    async fn injected_complete_failures_run_out() {
        let store = InMemoryStore::new();
        let req = store.enqueue(QueueKind::Run, "p1", "j1", 1).await.unwrap();
        store.claim(QueueKind::Run, &req.id, 2).await.unwrap();
        store.fail_next_completes(1);

        for expect_written in [None, Some(true)] {
            let written = store
                .complete(QueueKind::Run, &req.id, RequestStatus::Done, &json!({}), 3)
                .await
                .ok();
            assert_eq!(written, expect_written);
        }
    }

    #[tokio::test]
    async fn fetch_queued_is_fifo_and_limited() {
        let store = InMemoryStore::new();
        for (job, at) in [("late", 30), ("early", 10), ("mid", 20)] {
            store.enqueue(QueueKind::Delete, "p1", job, at).await.unwrap();
        }
        store.enqueue(QueueKind::Run, "p1", "other-queue", 0).await.unwrap();

        let rows = store.fetch_queued(QueueKind::Delete, "p1", 2).await.unwrap();
        let jobs: Vec<_> = rows.iter().map(|r| r.job_id.as_str()).collect();
        assert_eq!(jobs, vec!["early", "mid"]);
    }
}
