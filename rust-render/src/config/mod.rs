//! Service configuration loaded from the environment.
//!
//! Values are read after `dotenvy::dotenv()` so a local `.env` file can
//! provide them. Every setting has a default suitable for a single-host
//! deployment.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::str::FromStr;

use crate::export::ExportConfig;
use crate::pipeline::{JobQueueConfig, WorkerPoolConfig};
use crate::{Error, Result};

/// Default SQLite database URL.
pub const DEFAULT_DATABASE_URL: &str = "sqlite:rust-render.db?mode=rwc";

/// Top-level configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    /// SQLite database URL for the durable job store.
    pub database_url: String,
    /// Parent directory for per-job workspaces.
    pub workspace_root: PathBuf,
    /// Directory receiving finished artifacts.
    pub artifact_dir: PathBuf,
    /// Directory relative asset references are resolved against.
    pub asset_root: PathBuf,
    /// Optional directory for rolling log files.
    pub log_dir: Option<PathBuf>,
    /// Queue settings.
    pub queue: JobQueueConfig,
    /// Worker pool settings.
    pub workers: WorkerPoolConfig,
    /// Export bridge settings.
    pub export: ExportConfig,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            database_url: DEFAULT_DATABASE_URL.to_string(),
            workspace_root: std::env::temp_dir(),
            artifact_dir: PathBuf::from("artifacts"),
            asset_root: PathBuf::from("assets"),
            log_dir: None,
            queue: JobQueueConfig::default(),
            workers: WorkerPoolConfig::default(),
            export: ExportConfig::default(),
        }
    }
}

impl AppConfig {
    /// Build the configuration from process environment variables.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build the configuration from an arbitrary key lookup.
    ///
    /// Unset keys keep their defaults; set but unparsable keys are errors.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(url) = lookup("DATABASE_URL") {
            config.database_url = url;
        }
        if let Some(dir) = lookup("RENDER_WORKSPACE_ROOT") {
            config.workspace_root = PathBuf::from(dir);
        }
        if let Some(dir) = lookup("RENDER_ARTIFACT_DIR") {
            config.artifact_dir = PathBuf::from(dir);
        }
        if let Some(dir) = lookup("RENDER_ASSET_ROOT") {
            config.asset_root = PathBuf::from(dir);
        }
        if let Some(dir) = lookup("RENDER_LOG_DIR") {
            config.log_dir = Some(PathBuf::from(dir));
        }
        if let Some(path) = lookup("RENDER_FFMPEG_PATH") {
            config.export.ffmpeg_path = path;
        }

        if let Some(v) = parse_var(&lookup, "RENDER_MAX_WORKERS")? {
            config.workers.max_workers = v;
        }
        if let Some(v) = parse_var(&lookup, "RENDER_JOB_TIMEOUT_SECS")? {
            config.workers.job_timeout_secs = v;
        }
        if let Some(v) = parse_var(&lookup, "RENDER_POLL_INTERVAL_MS")? {
            config.workers.poll_interval_ms = v;
            config.queue.poll_interval_ms = v;
        }
        if let Some(v) = parse_var(&lookup, "RENDER_MAX_ATTEMPTS")? {
            config.queue.max_attempts = v;
        }
        if let Some(v) = parse_var(&lookup, "RENDER_ACK_TIMEOUT_MS")? {
            config.export.ack_timeout_ms = v;
        }

        config.validate()?;
        Ok(config)
    }

    /// Reject values the services cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.workers.max_workers == 0 {
            return Err(Error::config("RENDER_MAX_WORKERS must be at least 1"));
        }
        if self.queue.max_attempts == 0 {
            return Err(Error::config("RENDER_MAX_ATTEMPTS must be at least 1"));
        }
        if self.workers.job_timeout_secs == 0 {
            return Err(Error::config("RENDER_JOB_TIMEOUT_SECS must be at least 1"));
        }
        if self.export.ack_timeout_ms == 0 {
            return Err(Error::config("RENDER_ACK_TIMEOUT_MS must be at least 1"));
        }
        Ok(())
    }
}

fn parse_var<F, T>(lookup: &F, key: &str) -> Result<Option<T>>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match lookup(key) {
        None => Ok(None),
        Some(raw) => raw
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|e| Error::config(format!("{} has invalid value '{}': {}", key, raw, e))),
    }
}
