//! Config schema types (store, executor, loop cadences, metrics).

use std::time::Duration;

use {
    secrecy::{ExposeSecret, Secret},
    serde::{Deserialize, Serialize},
};

use crate::duration::parse_field;

/// Root configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct DeckhandConfig {
    pub store: StoreConfig,
    pub executor: ExecutorConfig,
    pub mirror: MirrorConfig,
    pub drain: DrainConfig,
    pub watchdog: WatchdogConfig,
    pub metrics: MetricsConfig,
}

/// Connection to the mirror database shared with the control API.
#[derive(Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// sqlx connection URL, e.g. `sqlite://deckhand.db?mode=rwc`. Required.
    #[serde(
        default,
        serialize_with = "serialize_option_secret",
        skip_serializing_if = "Option::is_none"
    )]
    pub database_url: Option<Secret<String>>,
    /// Logical project whose rows this worker owns. Required.
    pub project_id: Option<String>,
    /// Connection pool size.
    pub max_connections: u32,
}

impl std::fmt::Debug for StoreConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StoreConfig")
            .field(
                "database_url",
                &self.database_url.as_ref().map(|_| "[REDACTED]"),
            )
            .field("project_id", &self.project_id)
            .field("max_connections", &self.max_connections)
            .finish()
    }
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            database_url: None,
            project_id: None,
            max_connections: 5,
        }
    }
}

impl StoreConfig {
    /// The database URL, or an error when it is unset or blank.
    pub fn require_database_url(&self) -> crate::Result<&str> {
        self.database_url
            .as_ref()
            .map(|s| s.expose_secret().as_str())
            .filter(|s| !s.trim().is_empty())
            .ok_or(crate::Error::MissingSetting {
                field: "store.database_url",
            })
    }

    /// The project id, or an error when it is unset or blank.
    pub fn require_project_id(&self) -> crate::Result<&str> {
        self.project_id
            .as_deref()
            .filter(|s| !s.trim().is_empty())
            .ok_or(crate::Error::MissingSetting {
                field: "store.project_id",
            })
    }
}

/// The external cron daemon reached through its CLI.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutorConfig {
    /// Executable invoked for every cron subcommand.
    pub binary: String,
    /// Arguments placed before the `cron ...` subcommand (e.g. a profile flag).
    pub base_args: Vec<String>,
    /// Timeout for `cron list --all --json`.
    pub list_timeout: String,
    /// Timeout for `cron run <id> --force`.
    pub run_timeout: String,
    /// Timeout for `cron rm <id>`.
    pub delete_timeout: String,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            binary: "openclaw".into(),
            base_args: Vec::new(),
            list_timeout: "20s".into(),
            run_timeout: "10m".into(),
            delete_timeout: "60s".into(),
        }
    }
}

impl ExecutorConfig {
    pub fn list_timeout(&self) -> crate::Result<Duration> {
        parse_field("executor.list_timeout", &self.list_timeout)
    }

    pub fn run_timeout(&self) -> crate::Result<Duration> {
        parse_field("executor.run_timeout", &self.run_timeout)
    }

    pub fn delete_timeout(&self) -> crate::Result<Duration> {
        parse_field("executor.delete_timeout", &self.delete_timeout)
    }
}

/// Mirror loop cadence and row shaping.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MirrorConfig {
    /// Interval after a successful cycle; backoff resets to this value.
    pub base_interval: String,
    /// Ceiling for the doubling backoff after failed cycles.
    pub max_interval: String,
    /// Maximum characters of job instructions copied into the mirror.
    pub instructions_limit: usize,
}

impl Default for MirrorConfig {
    fn default() -> Self {
        Self {
            base_interval: "60s".into(),
            max_interval: "10m".into(),
            instructions_limit: 2000,
        }
    }
}

impl MirrorConfig {
    pub fn base_interval(&self) -> crate::Result<Duration> {
        parse_field("mirror.base_interval", &self.base_interval)
    }

    pub fn max_interval(&self) -> crate::Result<Duration> {
        parse_field("mirror.max_interval", &self.max_interval)
    }
}

/// Run/delete queue drain cadence.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DrainConfig {
    pub run_interval: String,
    pub delete_interval: String,
    /// Queued rows fetched per tick.
    pub batch_size: u32,
    /// Characters of stdout/stderr kept in a request's result.
    pub tail_limit: usize,
}

impl Default for DrainConfig {
    fn default() -> Self {
        Self {
            run_interval: "10s".into(),
            delete_interval: "10s".into(),
            batch_size: 5,
            tail_limit: 4000,
        }
    }
}

impl DrainConfig {
    pub fn run_interval(&self) -> crate::Result<Duration> {
        parse_field("drain.run_interval", &self.run_interval)
    }

    pub fn delete_interval(&self) -> crate::Result<Duration> {
        parse_field("drain.delete_interval", &self.delete_interval)
    }
}

/// Stuck-request watchdog.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WatchdogConfig {
    pub interval: String,
    /// Age after which a still-queued request is force-failed.
    pub stuck_after: String,
    /// Stale rows handled per queue per tick.
    pub batch_size: u32,
    /// `actor_agent_key` written on audit activities.
    pub actor: String,
}

impl Default for WatchdogConfig {
    fn default() -> Self {
        Self {
            interval: "30s".into(),
            stuck_after: "2m".into(),
            batch_size: 25,
            actor: "cron-worker".into(),
        }
    }
}

impl WatchdogConfig {
    pub fn interval(&self) -> crate::Result<Duration> {
        parse_field("watchdog.interval", &self.interval)
    }

    pub fn stuck_after(&self) -> crate::Result<Duration> {
        parse_field("watchdog.stuck_after", &self.stuck_after)
    }
}

/// Metrics and observability configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MetricsConfig {
    /// Whether metrics collection is enabled.
    pub enabled: bool,
    /// Address for the Prometheus scrape listener, e.g. `127.0.0.1:9464`.
    /// No listener is started when unset.
    pub listen: Option<String>,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            listen: None,
        }
    }
}

// ── Serde helpers for Secret<String> ────────────────────────────────────────

fn serialize_option_secret<S: serde::Serializer>(
    secret: &Option<Secret<String>>,
    serializer: S,
) -> Result<S::Ok, S::Error> {
    match secret {
        Some(s) => serializer.serialize_some(s.expose_secret()),
        None => serializer.serialize_none(),
    }
}
