//! Core data types: executor jobs, mirror rows, queue requests, audit events.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use {
    chrono::{DateTime, SecondsFormat, Utc},
    serde::{Deserialize, Serialize, Serializer},
    serde_json::{Value, json},
};

use crate::ExecutorOutputError;

/// Reserved `job_id` of the row that stores the last-seen fingerprint.
pub const SENTINEL_JOB_ID: &str = "__mirror_state__";

/// `schedule_kind` written on the sentinel row.
pub const SENTINEL_SCHEDULE_KIND: &str = "mirror_state";

/// Current time as epoch milliseconds.
pub fn now_ms() -> i64 {
    duration_ms(
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default(),
    )
}

/// `d` in milliseconds, saturating at `i64::MAX`.
pub(crate) fn duration_ms(d: Duration) -> i64 {
    i64::try_from(d.as_millis()).unwrap_or(i64::MAX)
}

/// `"500ms"` below one second, whole seconds otherwise.
fn render_cutoff(d: Duration) -> String {
    if d < Duration::from_secs(1) {
        format!("{}ms", d.as_millis())
    } else {
        format!("{}s", d.as_secs())
    }
}

/// Render epoch millis as an RFC 3339 UTC timestamp.
pub(crate) fn ms_to_rfc3339(ms: i64) -> String {
    DateTime::from_timestamp_millis(ms)
        .unwrap_or_default()
        .to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// Keep at most `max_chars` characters from the start of `s`.
pub fn truncate_chars(s: &str, max_chars: usize) -> String {
    match s.char_indices().nth(max_chars) {
        Some((idx, _)) => s[..idx].to_string(),
        None => s.to_string(),
    }
}

/// Keep at most `max_chars` characters from the end of `s`.
pub fn tail_chars(s: &str, max_chars: usize) -> String {
    let total = s.chars().count();
    if total <= max_chars {
        return s.to_string();
    }
    match s.char_indices().nth(total - max_chars) {
        Some((idx, _)) => s[idx..].to_string(),
        None => String::new(),
    }
}

// ── Executor side ───────────────────────────────────────────────────────────

/// How the executor schedules a job.
#[derive(Debug, Clone, PartialEq)]
pub enum ExecutorSchedule {
    /// Cron expression, optionally in an IANA timezone.
    Cron { expr: String, tz: Option<String> },
    /// Fixed interval in milliseconds.
    Every { every_ms: u64 },
    /// Any other kind the executor reports, kept verbatim.
    Other { kind: String, raw: Value },
}

impl ExecutorSchedule {
    /// Validate a raw `schedule` object from the executor.
    pub fn from_value(value: &Value) -> Result<Self, String> {
        let obj = value
            .as_object()
            .ok_or_else(|| "schedule must be an object".to_string())?;
        let kind = obj
            .get("kind")
            .and_then(Value::as_str)
            .ok_or_else(|| "schedule.kind must be a string".to_string())?;

        match kind {
            "cron" => {
                let expr = obj
                    .get("expr")
                    .and_then(Value::as_str)
                    .filter(|s| !s.trim().is_empty())
                    .ok_or_else(|| "cron schedule is missing `expr`".to_string())?;
                let tz = match obj.get("tz") {
                    None | Some(Value::Null) => None,
                    Some(Value::String(tz)) => Some(tz.clone()),
                    Some(_) => return Err("schedule.tz must be a string".into()),
                };
                Ok(Self::Cron {
                    expr: expr.to_string(),
                    tz,
                })
            },
            "every" => {
                let every_ms = obj
                    .get("everyMs")
                    .and_then(Value::as_u64)
                    .ok_or_else(|| {
                        "every schedule needs a non-negative integer `everyMs`".to_string()
                    })?;
                Ok(Self::Every { every_ms })
            },
            other => Ok(Self::Other {
                kind: other.to_string(),
                raw: value.clone(),
            }),
        }
    }

    /// Normalized JSON form, used for fingerprinting.
    #[must_use]
    pub fn to_value(&self) -> Value {
        match self {
            Self::Cron { expr, tz } => json!({ "kind": "cron", "expr": expr, "tz": tz }),
            Self::Every { every_ms } => json!({ "kind": "every", "everyMs": every_ms }),
            Self::Other { raw, .. } => raw.clone(),
        }
    }

    #[must_use]
    pub fn kind(&self) -> &str {
        match self {
            Self::Cron { .. } => "cron",
            Self::Every { .. } => "every",
            Self::Other { kind, .. } => kind,
        }
    }

    /// Value stored in `schedule_expr`: the expression, or the interval in ms.
    #[must_use]
    pub fn expr(&self) -> Option<String> {
        match self {
            Self::Cron { expr, .. } => Some(expr.clone()),
            Self::Every { every_ms } => Some(every_ms.to_string()),
            Self::Other { raw, .. } => raw
                .get("expr")
                .or_else(|| raw.get("at"))
                .and_then(Value::as_str)
                .map(str::to_string),
        }
    }

    #[must_use]
    pub fn tz(&self) -> Option<&str> {
        match self {
            Self::Cron { tz, .. } => tz.as_deref(),
            _ => None,
        }
    }
}

impl Serialize for ExecutorSchedule {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.to_value().serialize(serializer)
    }
}

/// Runtime state the executor reports for a job.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutorJobState {
    #[serde(default)]
    pub next_run_at_ms: Option<i64>,
    #[serde(default)]
    pub last_run_at_ms: Option<i64>,
    #[serde(default)]
    pub last_status: Option<String>,
    #[serde(default)]
    pub last_duration_ms: Option<i64>,
}

/// A job as listed by `cron list --all --json`, validated.
#[derive(Debug, Clone, PartialEq)]
pub struct ExecutorJob {
    pub id: String,
    pub name: String,
    pub enabled: bool,
    pub schedule: ExecutorSchedule,
    pub state: ExecutorJobState,
    pub instructions: Option<String>,
}

#[derive(Deserialize)]
struct RawJob {
    id: Option<String>,
    name: Option<String>,
    #[serde(default)]
    enabled: bool,
    schedule: Option<Value>,
    #[serde(default)]
    state: Option<ExecutorJobState>,
    #[serde(default)]
    payload: Option<Value>,
}

impl ExecutorJob {
    fn from_raw(index: usize, value: Value) -> Result<Self, ExecutorOutputError> {
        let invalid = |id: Option<String>, reason: String| ExecutorOutputError::InvalidJob {
            index,
            id,
            reason,
        };

        let raw: RawJob =
            serde_json::from_value(value).map_err(|e| invalid(None, e.to_string()))?;

        let id = raw
            .id
            .filter(|id| !id.trim().is_empty())
            .ok_or_else(|| invalid(None, "missing `id`".into()))?;

        let schedule_value = raw
            .schedule
            .ok_or_else(|| invalid(Some(id.clone()), "missing `schedule`".into()))?;
        let schedule = ExecutorSchedule::from_value(&schedule_value)
            .map_err(|reason| invalid(Some(id.clone()), reason))?;

        let instructions = raw.payload.as_ref().and_then(|p| {
            p.get("message")
                .or_else(|| p.get("text"))
                .and_then(Value::as_str)
                .map(str::to_string)
        });

        Ok(Self {
            name: raw.name.unwrap_or_else(|| id.clone()),
            id,
            enabled: raw.enabled,
            schedule,
            state: raw.state.unwrap_or_default(),
            instructions,
        })
    }
}

/// Parse the stdout of `cron list --all --json`.
///
/// Accepts `{"jobs": [...]}` or a bare array. Any job that does not match the
/// expected shape rejects the whole listing.
pub fn parse_job_list(stdout: &str) -> Result<Vec<ExecutorJob>, ExecutorOutputError> {
    let value: Value = serde_json::from_str(stdout.trim()).map_err(ExecutorOutputError::NotJson)?;

    let items = match value {
        Value::Array(items) => items,
        Value::Object(mut obj) => match obj.remove("jobs") {
            Some(Value::Array(items)) => items,
            Some(Value::Null) | None => {
                return Err(ExecutorOutputError::UnexpectedShape {
                    found: "an object without `jobs`",
                });
            },
            Some(_) => {
                return Err(ExecutorOutputError::UnexpectedShape {
                    found: "a non-array `jobs` field",
                });
            },
        },
        Value::Null => return Err(ExecutorOutputError::UnexpectedShape { found: "null" }),
        Value::Bool(_) => return Err(ExecutorOutputError::UnexpectedShape { found: "a boolean" }),
        Value::Number(_) => return Err(ExecutorOutputError::UnexpectedShape { found: "a number" }),
        Value::String(_) => return Err(ExecutorOutputError::UnexpectedShape { found: "a string" }),
    };

    items
        .into_iter()
        .enumerate()
        .map(|(index, item)| ExecutorJob::from_raw(index, item))
        .collect()
}

// ── Mirror side ─────────────────────────────────────────────────────────────

/// One row of the `cron_mirror` table.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MirrorRow {
    pub project_id: String,
    pub job_id: String,
    pub name: String,
    pub schedule_kind: String,
    pub schedule_expr: Option<String>,
    pub tz: Option<String>,
    pub enabled: bool,
    pub next_run_at: Option<DateTime<Utc>>,
    pub last_run_at: Option<DateTime<Utc>>,
    pub last_status: Option<String>,
    pub last_duration_ms: Option<i64>,
    pub instructions: Option<String>,
}

impl MirrorRow {
    /// Shape an executor job into its mirror row.
    #[must_use]
    pub fn from_job(project_id: &str, job: &ExecutorJob, instructions_limit: usize) -> Self {
        Self {
            project_id: project_id.to_string(),
            job_id: job.id.clone(),
            name: job.name.clone(),
            schedule_kind: job.schedule.kind().to_string(),
            schedule_expr: job.schedule.expr(),
            tz: job.schedule.tz().map(str::to_string),
            enabled: job.enabled,
            next_run_at: job
                .state
                .next_run_at_ms
                .and_then(DateTime::from_timestamp_millis),
            last_run_at: job
                .state
                .last_run_at_ms
                .and_then(DateTime::from_timestamp_millis),
            last_status: job.state.last_status.clone(),
            last_duration_ms: job.state.last_duration_ms,
            instructions: job
                .instructions
                .as_deref()
                .map(|s| truncate_chars(s, instructions_limit)),
        }
    }

    /// The per-project row whose `schedule_expr` holds the fingerprint.
    #[must_use]
    pub fn sentinel(project_id: &str, fingerprint: &str) -> Self {
        Self {
            project_id: project_id.to_string(),
            job_id: SENTINEL_JOB_ID.to_string(),
            name: "mirror state".to_string(),
            schedule_kind: SENTINEL_SCHEDULE_KIND.to_string(),
            schedule_expr: Some(fingerprint.to_string()),
            tz: None,
            enabled: false,
            next_run_at: None,
            last_run_at: None,
            last_status: None,
            last_duration_ms: None,
            instructions: None,
        }
    }

    #[must_use]
    pub fn is_sentinel(&self) -> bool {
        self.job_id == SENTINEL_JOB_ID
    }
}

// ── Command queues ──────────────────────────────────────────────────────────

/// The two command queues drained against the executor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum QueueKind {
    Run,
    Delete,
}

impl QueueKind {
    pub const ALL: [Self; 2] = [Self::Run, Self::Delete];

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Run => "run",
            Self::Delete => "delete",
        }
    }

    #[must_use]
    pub fn table(self) -> &'static str {
        match self {
            Self::Run => "cron_run_requests",
            Self::Delete => "cron_delete_requests",
        }
    }
}

impl std::fmt::Display for QueueKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lifecycle of a queued command: `queued → running → done | error`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RequestStatus {
    Queued,
    Running,
    Done,
    Error,
}

impl RequestStatus {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Running => "running",
            Self::Done => "done",
            Self::Error => "error",
        }
    }

    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Done | Self::Error)
    }
}

impl std::str::FromStr for RequestStatus {
    type Err = crate::Error;

    fn from_str(s: &str) -> crate::Result<Self> {
        match s {
            "queued" => Ok(Self::Queued),
            "running" => Ok(Self::Running),
            "done" => Ok(Self::Done),
            "error" => Ok(Self::Error),
            other => Err(crate::Error::message(format!(
                "unknown request status: {other}"
            ))),
        }
    }
}

impl std::fmt::Display for RequestStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A row of `cron_run_requests` or `cron_delete_requests`.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CommandRequest {
    pub id: String,
    pub project_id: String,
    pub job_id: String,
    pub status: RequestStatus,
    pub requested_at_ms: i64,
    pub started_at_ms: Option<i64>,
    pub finished_at_ms: Option<i64>,
    pub result: Option<Value>,
}

/// `result` written when the executor command finished (or failed to).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommandResult {
    pub job_id: String,
    pub exit_code: Option<i32>,
    pub duration_ms: u64,
    pub stdout_tail: String,
    pub stderr_tail: String,
}

/// `result` written when the watchdog force-fails an abandoned request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StuckDiagnostic {
    pub error: String,
    pub requested_at: String,
    /// Set when the request was claimed but never completed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<String>,
    pub detected_at: String,
}

impl StuckDiagnostic {
    #[must_use]
    pub fn new(stuck_after: Duration, requested_at_ms: i64, detected_at_ms: i64) -> Self {
        Self {
            error: format!("stuck >{}", render_cutoff(stuck_after)),
            requested_at: ms_to_rfc3339(requested_at_ms),
            started_at: None,
            detected_at: ms_to_rfc3339(detected_at_ms),
        }
    }

    /// A request left `running` longer than `limit` with no result written.
    #[must_use]
    pub fn orphaned(
        limit: Duration,
        requested_at_ms: i64,
        started_at_ms: i64,
        detected_at_ms: i64,
    ) -> Self {
        Self {
            error: format!("running >{} without a result", render_cutoff(limit)),
            requested_at: ms_to_rfc3339(requested_at_ms),
            started_at: Some(ms_to_rfc3339(started_at_ms)),
            detected_at: ms_to_rfc3339(detected_at_ms),
        }
    }
}

/// Append-only row of the `activities` audit log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AuditEvent {
    pub project_id: String,
    #[serde(rename = "type")]
    pub event_type: String,
    pub message: String,
    pub actor_agent_key: String,
}

impl AuditEvent {
    #[must_use]
    pub fn watchdog(project_id: &str, message: String, actor: &str) -> Self {
        Self {
            project_id: project_id.to_string(),
            event_type: "watchdog".to_string(),
            message,
            actor_agent_key: actor.to_string(),
        }
    }
}
