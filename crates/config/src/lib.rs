//! Configuration loading, validation, and env substitution for deckhand.
//!
//! Config files: `deckhand.toml`, `deckhand.yaml`, or `deckhand.json`
//! Searched in `./` then `~/.config/deckhand/`.
//!
//! Supports `${ENV_VAR}` and `${ENV_VAR:-fallback}` substitution in all
//! string values.

pub mod duration;
pub mod env_subst;
pub mod error;
pub mod loader;
pub mod schema;
pub mod validate;

pub use {
    duration::parse_duration_ms,
    error::{Error, Result},
    loader::{
        apply_env_overrides, config_dir, discover_and_load, find_config_file, load_config,
    },
    schema::{
        DeckhandConfig, DrainConfig, ExecutorConfig, MetricsConfig, MirrorConfig, StoreConfig,
        WatchdogConfig,
    },
    validate::{Diagnostic, Severity, ValidationResult},
};
