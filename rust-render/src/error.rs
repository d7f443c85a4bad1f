//! Application-wide error types.

use std::path::{Path, PathBuf};

use thiserror::Error;

/// Application-wide result type.
pub type Result<T> = std::result::Result<T, Error>;

/// Application-wide error type.
#[derive(Error, Debug)]
pub enum Error {
    #[error("Database error: {0}")]
    DatabaseSqlx(#[from] sqlx::Error),

    #[error("Migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("IO error while {op} '{}': {source}", path.display())]
    IoPath {
        op: &'static str,
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid project: {0}")]
    InvalidProject(String),

    #[error("Asset not found: {asset}")]
    AssetNotFound { asset: String },

    #[error("Failed to spawn encoder: {0}")]
    EncoderSpawn(String),

    #[error("Encoder error: {0}")]
    Encoder(String),

    #[error("Export bridge error on '{method}': {message}")]
    Bridge { method: String, message: String },

    #[error("Render error: {0}")]
    Render(String),

    #[error("Timed out: {0}")]
    Timeout(String),

    #[error("Job cancelled")]
    Cancelled,

    #[error("Queue is draining; new jobs are not accepted")]
    QueueDraining,

    #[error("Invalid state transition: cannot transition from {from} to {to}")]
    InvalidStateTransition { from: String, to: String },

    #[error("Entity not found: {entity_type} with id {id}")]
    NotFound { entity_type: String, id: String },

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("{0}")]
    Other(String),
}

impl Error {
    pub fn not_found(entity_type: impl Into<String>, id: impl Into<String>) -> Self {
        Self::NotFound {
            entity_type: entity_type.into(),
            id: id.into(),
        }
    }

    pub fn invalid_project(msg: impl Into<String>) -> Self {
        Self::InvalidProject(msg.into())
    }

    pub fn config(msg: impl Into<String>) -> Self {
        Self::Configuration(msg.into())
    }

    pub fn bridge(method: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Bridge {
            method: method.into(),
            message: message.into(),
        }
    }

    pub fn io_path(op: &'static str, path: &Path, source: std::io::Error) -> Self {
        Self::IoPath {
            op,
            path: path.to_path_buf(),
            source,
        }
    }

    /// Whether the queue may run the job again after this error.
    ///
    /// Invalid input and cancellation are final; everything else is
    /// attempted again until the job's attempt limit is reached.
    pub fn is_retryable(&self) -> bool {
        !matches!(
            self,
            Self::InvalidProject(_)
                | Self::AssetNotFound { .. }
                | Self::Cancelled
        )
    }

    /// Whether this error is a deliberate cancellation rather than a fault.
    pub fn is_cancellation(&self) -> bool {
        matches!(self, Self::Cancelled)
    }

    /// Coarse, caller-facing failure reason.
    ///
    /// Encoder diagnostics and IO details stay in the logs; status readers
    /// only see the category (and the offending asset for invalid input).
    pub fn failure_reason(&self) -> String {
        match self {
            Self::InvalidProject(msg) => format!("invalid project: {}", msg),
            Self::AssetNotFound { asset } => format!("invalid project: asset not found: {}", asset),
            Self::Cancelled => "cancelled".to_string(),
            Self::Timeout(what) => format!("timed out: {}", what),
            Self::Bridge { method, .. } => format!("export failed during '{}'", method),
            Self::Encoder(_) | Self::EncoderSpawn(_) => "encoder failed".to_string(),
            Self::Render(_) => "rendering failed".to_string(),
            Self::DatabaseSqlx(_) | Self::Migration(_) => "queue backend error".to_string(),
            Self::Io(_) | Self::IoPath { .. } => "filesystem error".to_string(),
            _ => "internal error".to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_invalid_input_is_not_retried() {
        assert!(!Error::invalid_project("fps must be positive").is_retryable());
        assert!(
            !Error::AssetNotFound {
                asset: "logo.png".to_string()
            }
            .is_retryable()
        );
        assert!(!Error::Cancelled.is_retryable());
    }

    #[test]
    fn test_infra_and_bridge_errors_are_retried() {
        assert!(Error::EncoderSpawn("EAGAIN".to_string()).is_retryable());
        assert!(Error::Timeout("job".to_string()).is_retryable());
        assert!(Error::bridge("handleFrame", "encoder exited").is_retryable());
    }

    #[test]
    fn test_internal_serde_errors_are_retried() {
        let err = Error::from(serde_json::from_str::<u64>("{").unwrap_err());
        assert!(err.is_retryable());
        assert_eq!(err.failure_reason(), "internal error");
    }

    #[test]
    fn test_failure_reason_hides_encoder_details() {
        let err = Error::Encoder("ffmpeg exited with status 1: [libx264] broken pipe".to_string());
        assert_eq!(err.failure_reason(), "encoder failed");

        let err = Error::bridge("end", "encoder exited with status 1");
        assert_eq!(err.failure_reason(), "export failed during 'end'");
    }

    #[test]
    fn test_failure_reason_names_missing_asset() {
        let err = Error::AssetNotFound {
            asset: "intro.png".to_string(),
        };
        assert!(err.failure_reason().contains("intro.png"));
    }
}
