//! Render job database models.

use serde::{Deserialize, Serialize};
use sqlx::FromRow;

use crate::database::now_rfc3339;

/// Render job row.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct JobDbModel {
    pub id: String,
    /// Producer-supplied job name.
    pub name: String,
    /// Status: QUEUED, ACTIVE, COMPLETED, FAILED
    pub status: String,
    /// JSON project specification.
    pub payload: String,
    pub priority: i64,
    pub attempts_made: i64,
    pub max_attempts: i64,
    /// JSON artifact reference, set on completion.
    pub result: Option<String>,
    pub failure_reason: Option<String>,
    /// Claim lease; an ACTIVE row past this instant belongs to a dead worker.
    pub lease_expires_at: Option<String>,
    pub created_at: String,
    pub started_at: Option<String>,
    pub finished_at: Option<String>,
    pub updated_at: String,
}

impl JobDbModel {
    pub fn new(
        name: impl Into<String>,
        payload: impl Into<String>,
        priority: i64,
        max_attempts: i64,
    ) -> Self {
        let now = now_rfc3339();
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            name: name.into(),
            status: JobStatus::Queued.as_str().to_string(),
            payload: payload.into(),
            priority,
            attempts_made: 0,
            max_attempts,
            result: None,
            failure_reason: None,
            lease_expires_at: None,
            created_at: now.clone(),
            started_at: None,
            finished_at: None,
            updated_at: now,
        }
    }
}

/// Job status values.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, strum::Display, strum::EnumString,
)]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    /// Waiting to be claimed by a worker.
    Queued,
    /// Claimed by exactly one worker.
    Active,
    /// Finished with an artifact.
    Completed,
    /// Finished without an artifact; not retried further.
    Failed,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Queued => "QUEUED",
            Self::Active => "ACTIVE",
            Self::Completed => "COMPLETED",
            Self::Failed => "FAILED",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "QUEUED" => Some(Self::Queued),
            "ACTIVE" => Some(Self::Active),
            "COMPLETED" => Some(Self::Completed),
            "FAILED" => Some(Self::Failed),
            _ => None,
        }
    }

    /// Check if this is a terminal status.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

/// Job counts grouped by status.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobCounts {
    pub queued: u64,
    pub active: u64,
    pub completed: u64,
    pub failed: u64,
}
