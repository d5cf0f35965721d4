use std::time::Duration;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Sqlx(#[from] sqlx::Error),

    #[error(transparent)]
    Migrate(#[from] sqlx::migrate::MigrateError),

    #[error(transparent)]
    ChronoParse(#[from] chrono::ParseError),

    #[error(transparent)]
    Config(#[from] deckhand_config::Error),

    #[error(transparent)]
    ExecutorOutput(#[from] ExecutorOutputError),

    #[error("failed to spawn `{command}`: {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },

    #[error("`{command}` timed out after {}s", timeout.as_secs())]
    Timeout { command: String, timeout: Duration },

    #[error("`{command}` exited with {}: {stderr_tail}", exit_code.map_or_else(|| "signal".to_string(), |c| c.to_string()))]
    CommandFailed {
        command: String,
        exit_code: Option<i32>,
        stderr_tail: String,
    },

    #[error("{message}")]
    Message { message: String },
}

impl Error {
    #[must_use]
    pub fn message(message: impl Into<String>) -> Self {
        Self::Message {
            message: message.into(),
        }
    }

    /// Whether the failure came from the executor rather than the store.
    #[must_use]
    pub fn is_executor_failure(&self) -> bool {
        matches!(
            self,
            Self::Spawn { .. }
                | Self::Timeout { .. }
                | Self::CommandFailed { .. }
                | Self::ExecutorOutput(_)
        )
    }
}

/// The executor printed something that is not a valid job listing.
#[derive(Debug, Error)]
pub enum ExecutorOutputError {
    #[error("job listing is not valid JSON: {0}")]
    NotJson(#[source] serde_json::Error),

    #[error("job listing must be an array or an object with a `jobs` array, got {found}")]
    UnexpectedShape { found: &'static str },

    #[error("job #{index}{}: {reason}", id.as_deref().map(|id| format!(" ({id})")).unwrap_or_default())]
    InvalidJob {
        index: usize,
        id: Option<String>,
        reason: String,
    },
}

pub type Result<T> = std::result::Result<T, Error>;
