use std::path::PathBuf;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error(transparent)]
    Toml(#[from] toml::de::Error),

    #[error(transparent)]
    Yaml(#[from] serde_yaml::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error("unsupported config format: .{extension}")]
    UnsupportedFormat { extension: String },

    #[error("invalid duration for {field}: {message}")]
    InvalidDuration { field: String, message: String },

    #[error("missing required setting: {field}")]
    MissingSetting { field: &'static str },
}

impl Error {
    #[must_use]
    pub fn invalid_duration(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self::InvalidDuration {
            field: field.into(),
            message: message.into(),
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
