//! Configuration validation.
//!
//! Reports unknown keys (with typo suggestions), missing connection settings,
//! unparseable durations, and cadence combinations that break the worker's
//! liveness guarantees.

use std::{collections::HashMap, path::Path, time::Duration};

use crate::{
    Error,
    env_subst::substitute_env,
    loader::{apply_env_overrides, load_config},
    schema::DeckhandConfig,
};

/// Severity level for a diagnostic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Severity {
    Error,
    Warning,
    Info,
}

impl std::fmt::Display for Severity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Error => write!(f, "error"),
            Self::Warning => write!(f, "warning"),
            Self::Info => write!(f, "info"),
        }
    }
}

/// A single validation diagnostic.
#[derive(Debug, Clone)]
pub struct Diagnostic {
    pub severity: Severity,
    /// Category: "syntax", "unknown-field", "missing", "duration", "cadence"
    pub category: &'static str,
    /// Dotted path, e.g. "watchdog.stuck_after"
    pub path: String,
    pub message: String,
}

/// Result of validating a configuration.
#[derive(Debug, Clone, Default)]
pub struct ValidationResult {
    pub diagnostics: Vec<Diagnostic>,
}

impl ValidationResult {
    /// Returns `true` if any diagnostic is an error.
    #[must_use]
    pub fn has_errors(&self) -> bool {
        self.diagnostics
            .iter()
            .any(|d| d.severity == Severity::Error)
    }

    /// Count diagnostics by severity.
    #[must_use]
    pub fn count(&self, severity: Severity) -> usize {
        self.diagnostics
            .iter()
            .filter(|d| d.severity == severity)
            .count()
    }

    fn push(
        &mut self,
        severity: Severity,
        category: &'static str,
        path: impl Into<String>,
        message: impl Into<String>,
    ) {
        self.diagnostics.push(Diagnostic {
            severity,
            category,
            path: path.into(),
            message: message.into(),
        });
    }
}

/// Known keys per section, mirroring `schema.rs`.
fn known_sections() -> HashMap<&'static str, &'static [&'static str]> {
    HashMap::from([
        (
            "store",
            &["database_url", "project_id", "max_connections"][..],
        ),
        (
            "executor",
            &[
                "binary",
                "base_args",
                "list_timeout",
                "run_timeout",
                "delete_timeout",
            ][..],
        ),
        (
            "mirror",
            &["base_interval", "max_interval", "instructions_limit"][..],
        ),
        (
            "drain",
            &["run_interval", "delete_interval", "batch_size", "tail_limit"][..],
        ),
        (
            "watchdog",
            &["interval", "stuck_after", "batch_size", "actor"][..],
        ),
        ("metrics", &["enabled", "listen"][..]),
    ])
}

/// Validate a config file the way the worker loads it: `${VAR}` placeholders
/// substituted and environment overrides applied before the semantic checks.
///
/// Unknown-key checks only run for TOML files.
pub fn validate_file(path: &Path) -> crate::Result<ValidationResult> {
    let lookup = |name: &str| std::env::var(name).ok();
    let is_toml = path
        .extension()
        .and_then(|e| e.to_str())
        .is_none_or(|e| e == "toml");
    if !is_toml {
        let mut config = load_config(path)?;
        apply_env_overrides(&mut config, lookup);
        return Ok(validate_config(&config));
    }

    let raw = std::fs::read_to_string(path).map_err(|source| Error::Read {
        path: path.to_path_buf(),
        source,
    })?;
    Ok(validate_toml_with(&substitute_env(&raw), lookup))
}

/// Validate raw TOML text: syntax, unknown keys, then the parsed config.
#[must_use]
pub fn validate_toml_str(toml_str: &str) -> ValidationResult {
    validate_toml_with(toml_str, |_| None)
}

fn validate_toml_with(toml_str: &str, lookup: impl Fn(&str) -> Option<String>) -> ValidationResult {
    let mut result = ValidationResult::default();

    let value: toml::Value = match toml::from_str(toml_str) {
        Ok(v) => v,
        Err(e) => {
            result.push(
                Severity::Error,
                "syntax",
                "",
                format!("TOML syntax error: {e}"),
            );
            return result;
        },
    };

    check_unknown_fields(&value, &mut result);

    match toml::from_str::<DeckhandConfig>(toml_str) {
        Ok(mut config) => {
            apply_env_overrides(&mut config, lookup);
            result
                .diagnostics
                .extend(validate_config(&config).diagnostics);
        },
        Err(e) => result.push(Severity::Error, "type-error", "", format!("type error: {e}")),
    }

    result
}

/// Validate an already-loaded config (file values plus env overrides).
#[must_use]
pub fn validate_config(config: &DeckhandConfig) -> ValidationResult {
    let mut result = ValidationResult::default();

    if let Err(e) = config.store.require_database_url() {
        result.push(
            Severity::Error,
            "missing",
            "store.database_url",
            format!("{e} (set it in the config file or DECKHAND_DATABASE_URL)"),
        );
    }
    if let Err(e) = config.store.require_project_id() {
        result.push(
            Severity::Error,
            "missing",
            "store.project_id",
            format!("{e} (set it in the config file or DECKHAND_PROJECT_ID)"),
        );
    }

    let durations = [
        ("executor.list_timeout", config.executor.list_timeout()),
        ("executor.run_timeout", config.executor.run_timeout()),
        ("executor.delete_timeout", config.executor.delete_timeout()),
        ("mirror.base_interval", config.mirror.base_interval()),
        ("mirror.max_interval", config.mirror.max_interval()),
        ("drain.run_interval", config.drain.run_interval()),
        ("drain.delete_interval", config.drain.delete_interval()),
        ("watchdog.interval", config.watchdog.interval()),
        ("watchdog.stuck_after", config.watchdog.stuck_after()),
    ];
    for (path, parsed) in &durations {
        if let Err(e) = parsed {
            result.push(Severity::Error, "duration", *path, e.to_string());
        }
    }

    if let (Ok(base), Ok(max)) = (config.mirror.base_interval(), config.mirror.max_interval())
        && max < base
    {
        result.push(
            Severity::Warning,
            "cadence",
            "mirror.max_interval",
            format!(
                "backoff ceiling ({}) is below the base interval ({}); backoff will never grow",
                config.mirror.max_interval, config.mirror.base_interval
            ),
        );
    }

    if let (Ok(stuck), Ok(drain)) = (config.watchdog.stuck_after(), config.drain.run_interval())
        && stuck <= drain
    {
        result.push(
            Severity::Warning,
            "cadence",
            "watchdog.stuck_after",
            "stuck cutoff is not longer than the drain interval; healthy requests may be force-failed",
        );
    }

    if config.drain.batch_size == 0 {
        result.push(
            Severity::Error,
            "cadence",
            "drain.batch_size",
            "batch size must be at least 1",
        );
    }
    if config.watchdog.batch_size == 0 {
        result.push(
            Severity::Error,
            "cadence",
            "watchdog.batch_size",
            "batch size must be at least 1",
        );
    }

    if config.executor.binary.trim().is_empty() {
        result.push(
            Severity::Error,
            "missing",
            "executor.binary",
            "executor binary must not be empty",
        );
    }

    if config
        .executor
        .run_timeout()
        .is_ok_and(|t| t > Duration::from_secs(3600))
    {
        result.push(
            Severity::Info,
            "cadence",
            "executor.run_timeout",
            "run timeout above one hour keeps the run queue blocked for that long",
        );
    }

    result
}

fn check_unknown_fields(value: &toml::Value, result: &mut ValidationResult) {
    let Some(table) = value.as_table() else {
        return;
    };
    let sections = known_sections();
    let section_names: Vec<&str> = sections.keys().copied().collect();

    for (key, child) in table {
        let Some(fields) = sections.get(key.as_str()) else {
            let msg = match suggest(key, &section_names, 3) {
                Some(s) => format!("unknown field at top level (did you mean \"{s}\"?)"),
                None => "unknown field at top level".to_string(),
            };
            result.push(Severity::Error, "unknown-field", key.clone(), msg);
            continue;
        };
        let Some(child_table) = child.as_table() else {
            continue;
        };
        for field in child_table.keys() {
            if fields.contains(&field.as_str()) {
                continue;
            }
            let msg = match suggest(field, fields, 3) {
                Some(s) => format!("unknown field (did you mean \"{s}\"?)"),
                None => "unknown field".to_string(),
            };
            result.push(
                Severity::Error,
                "unknown-field",
                format!("{key}.{field}"),
                msg,
            );
        }
    }
}

/// Compute the Levenshtein edit distance between two strings.
fn levenshtein(a: &str, b: &str) -> usize {
    let b_len = b.chars().count();
    let mut prev: Vec<usize> = (0..=b_len).collect();
    let mut curr = vec![0; b_len + 1];

    for (i, ca) in a.chars().enumerate() {
        curr[0] = i + 1;
        for (j, cb) in b.chars().enumerate() {
            let cost = usize::from(ca != cb);
            curr[j + 1] = (prev[j] + cost).min(prev[j + 1] + 1).min(curr[j] + 1);
        }
        std::mem::swap(&mut prev, &mut curr);
    }
    prev[b_len]
}

fn suggest<'a>(needle: &str, candidates: &[&'a str], max_distance: usize) -> Option<&'a str> {
    candidates
        .iter()
        .map(|c| (*c, levenshtein(needle, c)))
        .filter(|(_, d)| *d > 0 && *d <= max_distance)
        .min_by_key(|(_, d)| *d)
        .map(|(c, _)| c)
}
