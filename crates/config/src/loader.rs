use std::path::{Path, PathBuf};

use {secrecy::Secret, tracing::debug};

use crate::{Error, Result, env_subst::substitute_env, schema::DeckhandConfig};

/// Standard config file names, checked in order.
const CONFIG_FILENAMES: &[&str] = &[
    "deckhand.toml",
    "deckhand.yaml",
    "deckhand.yml",
    "deckhand.json",
];

/// Environment variable overriding `store.database_url`.
pub const DATABASE_URL_ENV: &str = "DECKHAND_DATABASE_URL";
/// Environment variable overriding `store.project_id`.
pub const PROJECT_ID_ENV: &str = "DECKHAND_PROJECT_ID";

/// Load config from the given path (any supported format).
pub fn load_config(path: &Path) -> Result<DeckhandConfig> {
    let raw = std::fs::read_to_string(path).map_err(|source| Error::Read {
        path: path.to_path_buf(),
        source,
    })?;
    let raw = substitute_env(&raw);
    parse_config(&raw, path)
}

/// Discover and load config from standard locations, then apply env
/// overrides.
///
/// Search order:
/// 1. `./deckhand.{toml,yaml,yml,json}` (project-local)
/// 2. `~/.config/deckhand/deckhand.{toml,yaml,yml,json}` (user-global)
///
/// Uses `DeckhandConfig::default()` when no file is found. A file that
/// exists but cannot be read or parsed is an error.
pub fn discover_and_load() -> Result<DeckhandConfig> {
    load_or_default(find_config_file().as_deref(), |name| std::env::var(name).ok())
}

fn load_or_default(
    path: Option<&Path>,
    lookup: impl Fn(&str) -> Option<String>,
) -> Result<DeckhandConfig> {
    let mut config = match path {
        Some(path) => {
            debug!(path = %path.display(), "loading config");
            load_config(path)?
        },
        None => {
            debug!("no config file found, using defaults");
            DeckhandConfig::default()
        },
    };
    apply_env_overrides(&mut config, lookup);
    Ok(config)
}

/// Overlay connection settings from the environment.
///
/// Deployments usually inject the database URL as a secret rather than
/// writing it into a file, so the environment wins over the file.
pub fn apply_env_overrides(config: &mut DeckhandConfig, lookup: impl Fn(&str) -> Option<String>) {
    if let Some(url) = lookup(DATABASE_URL_ENV).filter(|v| !v.trim().is_empty()) {
        config.store.database_url = Some(Secret::new(url));
    }
    if let Some(project) = lookup(PROJECT_ID_ENV).filter(|v| !v.trim().is_empty()) {
        config.store.project_id = Some(project);
    }
}

/// Find the first config file in standard locations.
pub fn find_config_file() -> Option<PathBuf> {
    CONFIG_FILENAMES
        .iter()
        .map(PathBuf::from)
        .find(|p| p.exists())
        .or_else(|| {
            let dir = config_dir()?;
            CONFIG_FILENAMES
                .iter()
                .map(|name| dir.join(name))
                .find(|p| p.exists())
        })
}

/// Returns the user-global config directory (`~/.config/deckhand/`).
pub fn config_dir() -> Option<PathBuf> {
    directories::ProjectDirs::from("", "", "deckhand").map(|d| d.config_dir().to_path_buf())
}

fn parse_config(raw: &str, path: &Path) -> Result<DeckhandConfig> {
    let ext = path.extension().and_then(|e| e.to_str()).unwrap_or("toml");

    match ext {
        "toml" => Ok(toml::from_str(raw)?),
        "yaml" | "yml" => Ok(serde_yaml::from_str(raw)?),
        "json" => Ok(serde_json::from_str(raw)?),
        _ => Err(Error::UnsupportedFormat {
            extension: ext.to_string(),
        }),
    }
}
