//! Resolved worker settings: config strings parsed into typed values.

use std::time::Duration;

use deckhand_config::DeckhandConfig;

use crate::{Result, executor::ExecutorTimeouts};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceConfig {
    pub project_id: String,
    pub timeouts: ExecutorTimeouts,
    pub mirror_base_interval: Duration,
    pub mirror_max_interval: Duration,
    pub instructions_limit: usize,
    pub run_interval: Duration,
    pub delete_interval: Duration,
    pub drain_batch_size: u32,
    pub tail_limit: usize,
    pub watchdog_interval: Duration,
    pub stuck_after: Duration,
    pub watchdog_batch_size: u32,
    pub actor: String,
}

impl ServiceConfig {
    /// Defaults for `project_id`.
    pub fn for_project(project_id: impl Into<String>) -> Self {
        Self {
            project_id: project_id.into(),
            timeouts: ExecutorTimeouts::default(),
            mirror_base_interval: Duration::from_secs(60),
            mirror_max_interval: Duration::from_secs(600),
            instructions_limit: 2000,
            run_interval: Duration::from_secs(10),
            delete_interval: Duration::from_secs(10),
            drain_batch_size: 5,
            tail_limit: 4000,
            watchdog_interval: Duration::from_secs(30),
            stuck_after: Duration::from_secs(120),
            watchdog_batch_size: 25,
            actor: "cron-worker".into(),
        }
    }

    /// Resolve the loaded config. Fails when the project id is missing or a
    /// duration does not parse.
    pub fn from_config(config: &DeckhandConfig) -> Result<Self> {
        Ok(Self {
            project_id: config.store.require_project_id()?.to_string(),
            timeouts: ExecutorTimeouts::from_config(&config.executor)?,
            mirror_base_interval: config.mirror.base_interval()?,
            mirror_max_interval: config.mirror.max_interval()?,
            instructions_limit: config.mirror.instructions_limit,
            run_interval: config.drain.run_interval()?,
            delete_interval: config.drain.delete_interval()?,
            drain_batch_size: config.drain.batch_size.max(1),
            tail_limit: config.drain.tail_limit,
            watchdog_interval: config.watchdog.interval()?,
            stuck_after: config.watchdog.stuck_after()?,
            watchdog_batch_size: config.watchdog.batch_size.max(1),
            actor: config.watchdog.actor.clone(),
        })
    }
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_agree_with_config_defaults() {
        let mut config = DeckhandConfig::default();
        config.store.project_id = Some("p1".into());
        assert_eq!(
            ServiceConfig::from_config(&config).unwrap(),
            ServiceConfig::for_project("p1")
        );
    }

    #[test]
    fn missing_project_is_error() {
        assert!(ServiceConfig::from_config(&DeckhandConfig::default()).is_err());
    }

    #[test]
    fn bad_duration_is_error() {
        let mut config = DeckhandConfig::default();
        config.store.project_id = Some("p1".into());
        config.watchdog.stuck_after = "soon".into();
        let err = ServiceConfig::from_config(&config).unwrap_err();
        assert!(err.to_string().contains("watchdog.stuck_after"), "{err}");
    }
}
