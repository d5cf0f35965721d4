//! SQLite-backed mirror store using sqlx.

use std::collections::HashSet;

use {
    async_trait::async_trait,
    chrono::{DateTime, SecondsFormat, Utc},
    serde_json::Value,
    sqlx::{
        Row, SqlitePool,
        sqlite::{SqlitePoolOptions, SqliteRow},
    },
    tracing::debug,
};

use crate::{
    Error, Result,
    store::MirrorStore,
    types::{
        AuditEvent, CommandRequest, MirrorRow, QueueKind, RequestStatus, SENTINEL_JOB_ID, now_ms,
    },
};

const REQUEST_COLUMNS: &str =
    "id, project_id, job_id, status, requested_at_ms, started_at_ms, finished_at_ms, result";

const MIRROR_COLUMNS: &str = "project_id, job_id, name, schedule_kind, schedule_expr, tz, enabled, \
                              next_run_at, last_run_at, last_status, last_duration_ms, instructions";

/// SQLite-backed persistence for the mirror table, command queues and
/// activity log.
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    /// Create a new store with its own connection pool and run migrations.
    ///
    /// For a pool shared with other tables, use [`SqliteStore::with_pool`]
    /// after calling [`crate::run_migrations`].
    pub async fn connect(database_url: &str, max_connections: u32) -> Result<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections.max(1))
            .connect(database_url)
            .await?;

        crate::run_migrations(&pool).await?;

        Ok(Self { pool })
    }

    /// Create a store using an existing pool (migrations must already be run).
    pub fn with_pool(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    async fn upsert_row(
        conn: &mut sqlx::SqliteConnection,
        project_id: &str,
        row: &MirrorRow,
        updated_at: &str,
    ) -> Result<()> {
        sqlx::query(&format!(
            "INSERT INTO cron_mirror ({MIRROR_COLUMNS}, updated_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
             ON CONFLICT(project_id, job_id) DO UPDATE SET
                name = excluded.name,
                schedule_kind = excluded.schedule_kind,
                schedule_expr = excluded.schedule_expr,
                tz = excluded.tz,
                enabled = excluded.enabled,
                next_run_at = excluded.next_run_at,
                last_run_at = excluded.last_run_at,
                last_status = excluded.last_status,
                last_duration_ms = excluded.last_duration_ms,
                instructions = excluded.instructions,
                updated_at = excluded.updated_at"
        ))
        .bind(project_id)
        .bind(&row.job_id)
        .bind(&row.name)
        .bind(&row.schedule_kind)
        .bind(&row.schedule_expr)
        .bind(&row.tz)
        .bind(i64::from(row.enabled))
        .bind(row.next_run_at.map(rfc3339))
        .bind(row.last_run_at.map(rfc3339))
        .bind(&row.last_status)
        .bind(row.last_duration_ms)
        .bind(&row.instructions)
        .bind(updated_at)
        .execute(conn)
        .await?;
        Ok(())
    }
}

fn rfc3339(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Millis, true)
}

fn parse_ts(value: Option<String>) -> Result<Option<DateTime<Utc>>> {
    let Some(s) = value else {
        return Ok(None);
    };
    Ok(Some(DateTime::parse_from_rfc3339(&s)?.with_timezone(&Utc)))
}

fn mirror_row(row: &SqliteRow) -> Result<MirrorRow> {
    Ok(MirrorRow {
        project_id: row.try_get("project_id")?,
        job_id: row.try_get("job_id")?,
        name: row.try_get("name")?,
        schedule_kind: row.try_get("schedule_kind")?,
        schedule_expr: row.try_get("schedule_expr")?,
        tz: row.try_get("tz")?,
        enabled: row.try_get::<i64, _>("enabled")? != 0,
        next_run_at: parse_ts(row.try_get("next_run_at")?)?,
        last_run_at: parse_ts(row.try_get("last_run_at")?)?,
        last_status: row.try_get("last_status")?,
        last_duration_ms: row.try_get("last_duration_ms")?,
        instructions: row.try_get("instructions")?,
    })
}

fn request_row(row: &SqliteRow) -> Result<CommandRequest> {
    let status: String = row.try_get("status")?;
    let result: Option<String> = row.try_get("result")?;
    Ok(CommandRequest {
        id: row.try_get("id")?,
        project_id: row.try_get("project_id")?,
        job_id: row.try_get("job_id")?,
        status: status.parse()?,
        requested_at_ms: row.try_get("requested_at_ms")?,
        started_at_ms: row.try_get("started_at_ms")?,
        finished_at_ms: row.try_get("finished_at_ms")?,
        result: result
            .as_deref()
            .map(serde_json::from_str::<Value>)
            .transpose()?,
    })
}

#[async_trait]
impl MirrorStore for SqliteStore {
    async fn read_fingerprint(&self, project_id: &str) -> Result<Option<String>> {
        let row = sqlx::query(
            "SELECT schedule_expr FROM cron_mirror WHERE project_id = ? AND job_id = ?",
        )
        .bind(project_id)
        .bind(SENTINEL_JOB_ID)
        .fetch_optional(&self.pool)
        .await?;
        Ok(match row {
            Some(row) => row.try_get("schedule_expr")?,
            None => None,
        })
    }

    async fn upsert_mirror_rows(&self, project_id: &str, rows: &[MirrorRow]) -> Result<()> {
        let updated_at = rfc3339(Utc::now());
        let mut tx = self.pool.begin().await?;

        let existing: Vec<String> = sqlx::query_scalar(
            "SELECT job_id FROM cron_mirror WHERE project_id = ? AND job_id != ?",
        )
        .bind(project_id)
        .bind(SENTINEL_JOB_ID)
        .fetch_all(&mut *tx)
        .await?;
        let listed: HashSet<&str> = rows.iter().map(|r| r.job_id.as_str()).collect();
        for job_id in existing.iter().filter(|id| !listed.contains(id.as_str())) {
            sqlx::query("DELETE FROM cron_mirror WHERE project_id = ? AND job_id = ?")
                .bind(project_id)
                .bind(job_id)
                .execute(&mut *tx)
                .await?;
            debug!(project_id, job_id = %job_id, "pruned mirror row");
        }

        for row in rows {
            Self::upsert_row(&mut tx, project_id, row, &updated_at).await?;
        }

        tx.commit().await?;
        Ok(())
    }

    async fn write_fingerprint(&self, project_id: &str, fingerprint: &str) -> Result<()> {
        let mut conn = self.pool.acquire().await?;
        Self::upsert_row(
            &mut conn,
            project_id,
            &MirrorRow::sentinel(project_id, fingerprint),
            &rfc3339(Utc::now()),
        )
        .await
    }

    async fn list_mirror_rows(&self, project_id: &str) -> Result<Vec<MirrorRow>> {
        let rows = sqlx::query(&format!(
            "SELECT {MIRROR_COLUMNS} FROM cron_mirror
             WHERE project_id = ? AND job_id != ?
             ORDER BY job_id"
        ))
        .bind(project_id)
        .bind(SENTINEL_JOB_ID)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(mirror_row).collect()
    }

    async fn enqueue(
        &self,
        queue: QueueKind,
        project_id: &str,
        job_id: &str,
        requested_at_ms: i64,
    ) -> Result<CommandRequest> {
        let id = uuid::Uuid::new_v4().to_string();
        sqlx::query(&format!(
            "INSERT INTO {} (id, project_id, job_id, status, requested_at_ms)
             VALUES (?, ?, ?, 'queued', ?)",
            queue.table()
        ))
        .bind(&id)
        .bind(project_id)
        .bind(job_id)
        .bind(requested_at_ms)
        .execute(&self.pool)
        .await?;

        Ok(CommandRequest {
            id,
            project_id: project_id.to_string(),
            job_id: job_id.to_string(),
            status: RequestStatus::Queued,
            requested_at_ms,
            started_at_ms: None,
            finished_at_ms: None,
            result: None,
        })
    }

    async fn get_request(&self, queue: QueueKind, id: &str) -> Result<Option<CommandRequest>> {
        let row = sqlx::query(&format!(
            "SELECT {REQUEST_COLUMNS} FROM {} WHERE id = ?",
            queue.table()
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(request_row).transpose()
    }

    async fn fetch_queued(
        &self,
        queue: QueueKind,
        project_id: &str,
        limit: u32,
    ) -> Result<Vec<CommandRequest>> {
        let rows = sqlx::query(&format!(
            "SELECT {REQUEST_COLUMNS} FROM {}
             WHERE project_id = ? AND status = 'queued'
             ORDER BY requested_at_ms ASC, id ASC
             LIMIT ?",
            queue.table()
        ))
        .bind(project_id)
        .bind(i64::from(limit))
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(request_row).collect()
    }

    async fn claim(&self, queue: QueueKind, id: &str, now_ms: i64) -> Result<bool> {
        let result = sqlx::query(&format!(
            "UPDATE {} SET status = 'running', started_at_ms = ?
             WHERE id = ? AND status = 'queued'",
            queue.table()
        ))
        .bind(now_ms)
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
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
        let outcome = sqlx::query(&format!(
            "UPDATE {} SET status = ?, finished_at_ms = ?, result = ?
             WHERE id = ? AND status = 'running'",
            queue.table()
        ))
        .bind(status.as_str())
        .bind(now_ms)
        .bind(serde_json::to_string(result)?)
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(outcome.rows_affected() == 1)
    }

    async fn fetch_stale(
        &self,
        queue: QueueKind,
        project_id: &str,
        cutoff_ms: i64,
        limit: u32,
    ) -> Result<Vec<CommandRequest>> {
        let rows = sqlx::query(&format!(
            "SELECT {REQUEST_COLUMNS} FROM {}
             WHERE project_id = ? AND status = 'queued' AND requested_at_ms <= ?
             ORDER BY requested_at_ms ASC, id ASC
             LIMIT ?",
            queue.table()
        ))
        .bind(project_id)
        .bind(cutoff_ms)
        .bind(i64::from(limit))
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(request_row).collect()
    }

    async fn fetch_orphaned(
        &self,
        queue: QueueKind,
        project_id: &str,
        started_before_ms: i64,
        limit: u32,
    ) -> Result<Vec<CommandRequest>> {
        let rows = sqlx::query(&format!(
            "SELECT {REQUEST_COLUMNS} FROM {}
             WHERE project_id = ? AND status = 'running' AND started_at_ms <= ?
             ORDER BY started_at_ms ASC, id ASC
             LIMIT ?",
            queue.table()
        ))
        .bind(project_id)
        .bind(started_before_ms)
        .bind(i64::from(limit))
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(request_row).collect()
    }

    async fn force_fail(
        &self,
        queue: QueueKind,
        id: &str,
        result: &Value,
        now_ms: i64,
    ) -> Result<bool> {
        let outcome = sqlx::query(&format!(
            "UPDATE {} SET status = 'error', finished_at_ms = ?, result = ?
             WHERE id = ? AND status = 'queued'",
            queue.table()
        ))
        .bind(now_ms)
        .bind(serde_json::to_string(result)?)
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(outcome.rows_affected() == 1)
    }

    async fn record_activity(&self, event: &AuditEvent) -> Result<()> {
        sqlx::query(
            "INSERT INTO activities (project_id, type, message, actor_agent_key, created_at_ms)
             VALUES (?, ?, ?, ?, ?)",
        )
        .bind(&event.project_id)
        .bind(&event.event_type)
        .bind(&event.message)
        .bind(&event.actor_agent_key)
        .bind(now_ms())
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use {
        super::*,
        crate::types::{ExecutorJob, ExecutorJobState, ExecutorSchedule},
        serde_json::json,
    };

    async fn make_store() -> SqliteStore {
        SqliteStore::connect("sqlite::memory:", 1).await.unwrap()
    }

    fn row(job_id: &str, enabled: bool) -> MirrorRow {
        let job = ExecutorJob {
            id: job_id.into(),
            name: format!("job {job_id}"),
            enabled,
            schedule: ExecutorSchedule::Cron {
                expr: "0 * * * *".into(),
                tz: Some("UTC".into()),
            },
            state: ExecutorJobState {
                next_run_at_ms: Some(1_767_225_600_000),
                last_run_at_ms: None,
                last_status: Some("ok".into()),
                last_duration_ms: Some(42),
            },
            instructions: Some("ping".into()),
        };
        MirrorRow::from_job("p1", &job, 2000)
    }

    #[tokio::test]
    async fn mirror_rows_roundtrip_and_upsert() {
        let store = make_store().await;
        store
            .upsert_mirror_rows("p1", &[row("a", true), row("b", true)])
            .await
            .unwrap();
        store
            .upsert_mirror_rows("p1", &[row("a", false), row("b", true)])
            .await
            .unwrap();

        let rows = store.list_mirror_rows("p1").await.unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0], row("a", false));
        assert_eq!(
            rows[1].next_run_at.unwrap().timestamp_millis(),
            1_767_225_600_000
        );
    }

    #[tokio::test]
    async fn upsert_prunes_jobs_gone_from_listing() {
        let store = make_store().await;
        store
            .upsert_mirror_rows("p1", &[row("a", true), row("b", true)])
            .await
            .unwrap();
        store.write_fingerprint("p1", "cafe").await.unwrap();
        store
            .upsert_mirror_rows("p1", &[row("b", true)])
            .await
            .unwrap();

        let ids: Vec<_> = store
            .list_mirror_rows("p1")
            .await
            .unwrap()
            .into_iter()
            .map(|r| r.job_id)
            .collect();
        assert_eq!(ids, vec!["b"]);
        assert_eq!(
            store.read_fingerprint("p1").await.unwrap().as_deref(),
            Some("cafe")
        );
    }

    #[tokio::test]
    async fn sentinel_upsert_keeps_one_row() {
        let store = make_store().await;
        assert!(store.read_fingerprint("p1").await.unwrap().is_none());
        store.write_fingerprint("p1", "1").await.unwrap();
        store.write_fingerprint("p1", "2").await.unwrap();

        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM cron_mirror WHERE project_id = 'p1' AND job_id = ?",
        )
        .bind(SENTINEL_JOB_ID)
        .fetch_one(store.pool())
        .await
        .unwrap();
        assert_eq!(count, 1);
        assert_eq!(
            store.read_fingerprint("p1").await.unwrap().as_deref(),
            Some("2")
        );
        assert!(store.list_mirror_rows("p1").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn request_lifecycle_is_forward_only() {
        let store = make_store().await;
        let req = store.enqueue(QueueKind::Run, "p1", "j1", 100).await.unwrap();

        assert!(store.claim(QueueKind::Run, &req.id, 200).await.unwrap());
        assert!(!store.claim(QueueKind::Run, &req.id, 201).await.unwrap());
        assert!(
            !store
                .force_fail(QueueKind::Run, &req.id, &json!({"error": "stuck"}), 202)
                .await
                .unwrap()
        );
        assert!(
            store
                .complete(
                    QueueKind::Run,
                    &req.id,
                    RequestStatus::Done,
                    &json!({"exitCode": 0}),
                    300
                )
                .await
                .unwrap()
        );
        assert!(
            !store
                .complete(
                    QueueKind::Run,
                    &req.id,
                    RequestStatus::Error,
                    &json!({"exitCode": 1}),
                    400
                )
                .await
                .unwrap()
        );

        let stored = store
            .get_request(QueueKind::Run, &req.id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stored.status, RequestStatus::Done);
        assert_eq!(stored.started_at_ms, Some(200));
        assert_eq!(stored.finished_at_ms, Some(300));
        assert_eq!(stored.result, Some(json!({"exitCode": 0})));
    }

    #[tokio::test]
    async fn complete_rejects_non_terminal_status() {
        let store = make_store().await;
        let req = store.enqueue(QueueKind::Run, "p1", "j1", 1).await.unwrap();
        store.claim(QueueKind::Run, &req.id, 2).await.unwrap();
        assert!(
            store
                .complete(QueueKind::Run, &req.id, RequestStatus::Queued, &json!({}), 3)
                .await
                .is_err()
        );
    }

    #[tokio::test]
    async fn queues_are_separate_tables() {
        let store = make_store().await;
        store.enqueue(QueueKind::Run, "p1", "r", 1).await.unwrap();
        store.enqueue(QueueKind::Delete, "p1", "d", 1).await.unwrap();

        let run = store.fetch_queued(QueueKind::Run, "p1", 10).await.unwrap();
        let delete = store.fetch_queued(QueueKind::Delete, "p1", 10).await.unwrap();
        assert_eq!(run.len(), 1);
        assert_eq!(run[0].job_id, "r");
        assert_eq!(delete[0].job_id, "d");
    }

    #[tokio::test]
    async fn fetch_queued_orders_oldest_first() {
        let store = make_store().await;
        for (job, at) in [("c", 3), ("a", 1), ("b", 2)] {
            store.enqueue(QueueKind::Run, "p1", job, at).await.unwrap();
        }
        store.enqueue(QueueKind::Run, "p2", "x", 0).await.unwrap();

        let jobs: Vec<_> = store
            .fetch_queued(QueueKind::Run, "p1", 2)
            .await
            .unwrap()
            .into_iter()
            .map(|r| r.job_id)
            .collect();
        assert_eq!(jobs, vec!["a", "b"]);
    }

    #[tokio::test]
    async fn fetch_stale_honors_cutoff_and_status() {
        let store = make_store().await;
        let old = store.enqueue(QueueKind::Delete, "p1", "old", 1_000).await.unwrap();
        store.enqueue(QueueKind::Delete, "p1", "fresh", 9_000).await.unwrap();
        let claimed = store.enqueue(QueueKind::Delete, "p1", "claimed", 500).await.unwrap();
        store.claim(QueueKind::Delete, &claimed.id, 600).await.unwrap();

        let stale = store
            .fetch_stale(QueueKind::Delete, "p1", 5_000, 25)
            .await
            .unwrap();
        assert_eq!(stale.len(), 1);
        assert_eq!(stale[0].id, old.id);

        assert!(
            store
                .force_fail(QueueKind::Delete, &old.id, &json!({"error": "stuck"}), 10_000)
                .await
                .unwrap()
        );
        let stored = store
            .get_request(QueueKind::Delete, &old.id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stored.status, RequestStatus::Error);
    }

    #[tokio::test]
    async fn fetch_orphaned_selects_old_running_rows() {
        let store = make_store().await;
        let old = store.enqueue(QueueKind::Run, "p1", "old", 100).await.unwrap();
        store.claim(QueueKind::Run, &old.id, 1_000).await.unwrap();
        let recent = store.enqueue(QueueKind::Run, "p1", "recent", 200).await.unwrap();
        store.claim(QueueKind::Run, &recent.id, 9_000).await.unwrap();
        store.enqueue(QueueKind::Run, "p1", "queued", 50).await.unwrap();

        let orphaned = store
            .fetch_orphaned(QueueKind::Run, "p1", 5_000, 25)
            .await
            .unwrap();
        assert_eq!(orphaned.len(), 1);
        assert_eq!(orphaned[0].id, old.id);
        assert!(
            store
                .fetch_orphaned(QueueKind::Run, "p2", 5_000, 25)
                .await
                .unwrap()
                .is_empty()
        );

        assert!(
            store
                .complete(QueueKind::Run, &old.id, RequestStatus::Error, &json!({"error": "x"}), 10_000)
                .await
                .unwrap()
        );
        assert!(
            store
                .fetch_orphaned(QueueKind::Run, "p1", 5_000, 25)
                .await
                .unwrap()
                .is_empty()
        );
    }

    #[tokio::test]
    async fn records_activity() {
        let store = make_store().await;
        store
            .record_activity(&AuditEvent::watchdog("p1", "stuck".into(), "cron-worker"))
            .await
            .unwrap();
        let (kind, actor): (String, String) =
            sqlx::query_as("SELECT type, actor_agent_key FROM activities WHERE project_id = 'p1'")
                .fetch_one(store.pool())
                .await
                .unwrap();
        assert_eq!(kind, "watchdog");
        assert_eq!(actor, "cron-worker");
    }
}
