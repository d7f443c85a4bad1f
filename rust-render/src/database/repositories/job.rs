//! Render job repository.

use async_trait::async_trait;
use sqlx::SqlitePool;

use crate::database::models::{JobCounts, JobDbModel, JobStatus};
use crate::database::{now_rfc3339, to_rfc3339};
use crate::{Error, Result};

/// Key of the queue-wide drain flag in `queue_meta`.
const PAUSED_KEY: &str = "paused";

/// Job repository trait.
#[async_trait]
pub trait JobRepository: Send + Sync {
    async fn create_job(&self, job: &JobDbModel) -> Result<()>;
    async fn get_job(&self, id: &str) -> Result<JobDbModel>;
    async fn list_jobs(&self, status: Option<JobStatus>) -> Result<Vec<JobDbModel>>;

    /// Atomically claim the next runnable job.
    ///
    /// Runnable means QUEUED, or ACTIVE with an expired lease (its worker
    /// died). The claim bumps `attempts_made` and sets a new lease.
    async fn claim_next_job(&self, lease_secs: i64) -> Result<Option<JobDbModel>>;

    /// ACTIVE -> COMPLETED. Returns `false` if the job was not active.
    async fn mark_completed(&self, id: &str, result: &str) -> Result<bool>;
    /// QUEUED/ACTIVE -> FAILED. Returns `false` if the job was already terminal.
    async fn mark_failed(&self, id: &str, reason: &str) -> Result<bool>;
    /// ACTIVE -> QUEUED, keeping `reason` as the last failure.
    async fn requeue(&self, id: &str, reason: &str) -> Result<bool>;
    /// Return ACTIVE jobs whose lease is gone or expired to QUEUED. Jobs
    /// under a live lease belong to a running worker and are left alone.
    async fn reset_expired_jobs(&self) -> Result<u64>;
    /// Delete every QUEUED job, returning the deleted ids.
    async fn delete_queued_jobs(&self) -> Result<Vec<String>>;
    async fn count_by_status(&self) -> Result<JobCounts>;
    /// ACTIVE jobs whose lease has not expired, i.e. held by a live worker.
    async fn count_in_flight(&self) -> Result<u64>;

    async fn set_paused(&self, paused: bool) -> Result<()>;
    async fn is_paused(&self) -> Result<bool>;
}

/// SQLx implementation of JobRepository.
pub struct SqlxJobRepository {
    pool: SqlitePool,
}

impl SqlxJobRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl JobRepository for SqlxJobRepository {
    async fn create_job(&self, job: &JobDbModel) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO render_job (
                id, name, status, payload, priority, attempts_made, max_attempts,
                result, failure_reason, lease_expires_at,
                created_at, started_at, finished_at, updated_at
            )
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&job.id)
        .bind(&job.name)
        .bind(&job.status)
        .bind(&job.payload)
        .bind(job.priority)
        .bind(job.attempts_made)
        .bind(job.max_attempts)
        .bind(&job.result)
        .bind(&job.failure_reason)
        .bind(&job.lease_expires_at)
        .bind(&job.created_at)
        .bind(&job.started_at)
        .bind(&job.finished_at)
        .bind(&job.updated_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_job(&self, id: &str) -> Result<JobDbModel> {
        sqlx::query_as::<_, JobDbModel>("SELECT * FROM render_job WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| Error::not_found("Job", id))
    }

    async fn list_jobs(&self, status: Option<JobStatus>) -> Result<Vec<JobDbModel>> {
        let jobs = match status {
            Some(status) => {
                sqlx::query_as::<_, JobDbModel>(
                    "SELECT * FROM render_job WHERE status = ? ORDER BY created_at",
                )
                .bind(status.as_str())
                .fetch_all(&self.pool)
                .await?
            }
            None => {
                sqlx::query_as::<_, JobDbModel>("SELECT * FROM render_job ORDER BY created_at")
                    .fetch_all(&self.pool)
                    .await?
            }
        };
        Ok(jobs)
    }

    async fn claim_next_job(&self, lease_secs: i64) -> Result<Option<JobDbModel>> {
        let now = chrono::Utc::now();
        let now_str = to_rfc3339(now);
        let lease = to_rfc3339(now + chrono::Duration::seconds(lease_secs));

        // Single statement: the subquery and the conditional update run under
        // one write lock, so two workers can never claim the same row.
        let job = sqlx::query_as::<_, JobDbModel>(
            r#"
            UPDATE render_job SET
                status = 'ACTIVE',
                attempts_made = attempts_made + 1,
                started_at = ?1,
                lease_expires_at = ?2,
                updated_at = ?1
            WHERE id = (
                SELECT id FROM render_job
                WHERE status = 'QUEUED'
                   OR (status = 'ACTIVE' AND lease_expires_at IS NOT NULL AND lease_expires_at < ?1)
                ORDER BY priority DESC, created_at ASC
                LIMIT 1
            )
            RETURNING *
            "#,
        )
        .bind(&now_str)
        .bind(&lease)
        .fetch_optional(&self.pool)
        .await?;
        Ok(job)
    }

    async fn mark_completed(&self, id: &str, result: &str) -> Result<bool> {
        let now = now_rfc3339();
        let done = sqlx::query(
            r#"
            UPDATE render_job SET
                status = 'COMPLETED',
                result = ?,
                failure_reason = NULL,
                lease_expires_at = NULL,
                finished_at = ?,
                updated_at = ?
            WHERE id = ? AND status = 'ACTIVE'
            "#,
        )
        .bind(result)
        .bind(&now)
        .bind(&now)
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(done.rows_affected() == 1)
    }

    async fn mark_failed(&self, id: &str, reason: &str) -> Result<bool> {
        let now = now_rfc3339();
        let done = sqlx::query(
            r#"
            UPDATE render_job SET
                status = 'FAILED',
                failure_reason = ?,
                lease_expires_at = NULL,
                finished_at = ?,
                updated_at = ?
            WHERE id = ? AND status IN ('QUEUED', 'ACTIVE')
            "#,
        )
        .bind(reason)
        .bind(&now)
        .bind(&now)
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(done.rows_affected() == 1)
    }

    async fn requeue(&self, id: &str, reason: &str) -> Result<bool> {
        let now = now_rfc3339();
        let done = sqlx::query(
            r#"
            UPDATE render_job SET
                status = 'QUEUED',
                failure_reason = ?,
                lease_expires_at = NULL,
                updated_at = ?
            WHERE id = ? AND status = 'ACTIVE'
            "#,
        )
        .bind(reason)
        .bind(&now)
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(done.rows_affected() == 1)
    }

    async fn reset_expired_jobs(&self) -> Result<u64> {
        let now = now_rfc3339();
        let result = sqlx::query(
            r#"
            UPDATE render_job SET
                status = 'QUEUED',
                lease_expires_at = NULL,
                updated_at = ?1
            WHERE status = 'ACTIVE'
              AND (lease_expires_at IS NULL OR lease_expires_at < ?1)
            "#,
        )
        .bind(&now)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    async fn delete_queued_jobs(&self) -> Result<Vec<String>> {
        let rows: Vec<(String,)> =
            sqlx::query_as("DELETE FROM render_job WHERE status = 'QUEUED' RETURNING id")
                .fetch_all(&self.pool)
                .await?;
        Ok(rows.into_iter().map(|(id,)| id).collect())
    }

    async fn count_by_status(&self) -> Result<JobCounts> {
        let rows: Vec<(String, i64)> =
            sqlx::query_as("SELECT status, COUNT(*) FROM render_job GROUP BY status")
                .fetch_all(&self.pool)
                .await?;

        let mut counts = JobCounts::default();
        for (status, count) in rows {
            let count = count.max(0) as u64;
            match JobStatus::parse(&status) {
                Some(JobStatus::Queued) => counts.queued = count,
                Some(JobStatus::Active) => counts.active = count,
                Some(JobStatus::Completed) => counts.completed = count,
                Some(JobStatus::Failed) => counts.failed = count,
                None => tracing::warn!(status = %status, "Unknown job status in store"),
            }
        }
        Ok(counts)
    }

    async fn count_in_flight(&self) -> Result<u64> {
        let (count,): (i64,) = sqlx::query_as(
            r#"
            SELECT COUNT(*) FROM render_job
            WHERE status = 'ACTIVE'
              AND (lease_expires_at IS NULL OR lease_expires_at >= ?)
            "#,
        )
        .bind(now_rfc3339())
        .fetch_one(&self.pool)
        .await?;
        Ok(count.max(0) as u64)
    }

    async fn set_paused(&self, paused: bool) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO queue_meta (key, value, updated_at) VALUES (?, ?, ?)
            ON CONFLICT(key) DO UPDATE SET value = excluded.value, updated_at = excluded.updated_at
            "#,
        )
        .bind(PAUSED_KEY)
        .bind(if paused { "1" } else { "0" })
        .bind(now_rfc3339())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn is_paused(&self) -> Result<bool> {
        let value: Option<(String,)> = sqlx::query_as("SELECT value FROM queue_meta WHERE key = ?")
            .bind(PAUSED_KEY)
            .fetch_optional(&self.pool)
            .await?;
        Ok(matches!(value, Some((v,)) if v == "1"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::test_pool;

    async fn setup() -> (tempfile::TempDir, SqlxJobRepository) {
        let dir = tempfile::TempDir::new().unwrap();
        let pool = test_pool(&dir).await;
        (dir, SqlxJobRepository::new(pool))
    }

    #[tokio::test]
    async fn test_claim_prefers_priority_then_age() {
        let (_dir, repo) = setup().await;
        let low = JobDbModel::new("low", "{}", 0, 3);
        repo.create_job(&low).await.unwrap();
        let high = JobDbModel::new("high", "{}", 10, 3);
        repo.create_job(&high).await.unwrap();

        let claimed = repo.claim_next_job(60).await.unwrap().unwrap();
        assert_eq!(claimed.id, high.id);
        assert_eq!(claimed.status, "ACTIVE");
        assert_eq!(claimed.attempts_made, 1);
        assert!(claimed.lease_expires_at.is_some());

        let claimed = repo.claim_next_job(60).await.unwrap().unwrap();
        assert_eq!(claimed.id, low.id);

        assert!(repo.claim_next_job(60).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_expired_lease_is_reclaimed() {
        let (_dir, repo) = setup().await;
        let job = JobDbModel::new("render", "{}", 0, 3);
        repo.create_job(&job).await.unwrap();

        // A negative lease is already expired when the next worker looks.
        let first = repo.claim_next_job(-10).await.unwrap().unwrap();
        let second = repo.claim_next_job(60).await.unwrap().unwrap();

        assert_eq!(first.id, second.id);
        assert_eq!(second.attempts_made, 2);
        assert!(repo.claim_next_job(60).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_terminal_transitions_are_conditional() {
        let (_dir, repo) = setup().await;
        let job = JobDbModel::new("render", "{}", 0, 3);
        repo.create_job(&job).await.unwrap();

        // Not active yet: completion must not apply.
        assert!(!repo.mark_completed(&job.id, "{}").await.unwrap());

        repo.claim_next_job(60).await.unwrap().unwrap();
        assert!(repo.mark_completed(&job.id, r#"{"location":"/a.mp4"}"#).await.unwrap());
        assert!(!repo.mark_failed(&job.id, "late failure").await.unwrap());

        let stored = repo.get_job(&job.id).await.unwrap();
        assert_eq!(stored.status, "COMPLETED");
        assert!(stored.finished_at.is_some());
        assert!(stored.lease_expires_at.is_none());
    }

    #[tokio::test]
    async fn test_delete_queued_leaves_active_jobs() {
        let (_dir, repo) = setup().await;
        let active = JobDbModel::new("a", "{}", 5, 3);
        repo.create_job(&active).await.unwrap();
        repo.claim_next_job(60).await.unwrap().unwrap();
        let queued = JobDbModel::new("q", "{}", 0, 3);
        repo.create_job(&queued).await.unwrap();

        let deleted = repo.delete_queued_jobs().await.unwrap();

        assert_eq!(deleted, vec![queued.id.clone()]);
        assert_eq!(repo.get_job(&active.id).await.unwrap().status, "ACTIVE");
        assert!(matches!(
            repo.get_job(&queued.id).await,
            Err(Error::NotFound { .. })
        ));
    }

    #[tokio::test]
    async fn test_reset_only_touches_expired_leases() {
        let (_dir, repo) = setup().await;
        repo.create_job(&JobDbModel::new("dead", "{}", 0, 3))
            .await
            .unwrap();
        let dead = repo.claim_next_job(-10).await.unwrap().unwrap();
        // Outranks the expired row, so the next claim takes it.
        repo.create_job(&JobDbModel::new("live", "{}", 10, 3))
            .await
            .unwrap();
        let live = repo.claim_next_job(60).await.unwrap().unwrap();
        assert_ne!(live.id, dead.id);
        repo.create_job(&JobDbModel::new("waiting", "{}", 0, 3))
            .await
            .unwrap();

        let counts = repo.count_by_status().await.unwrap();
        assert_eq!(counts.active, 2);
        assert_eq!(counts.queued, 1);

        assert_eq!(repo.reset_expired_jobs().await.unwrap(), 1);
        assert_eq!(repo.get_job(&dead.id).await.unwrap().status, "QUEUED");
        assert_eq!(repo.get_job(&live.id).await.unwrap().status, "ACTIVE");
        let counts = repo.count_by_status().await.unwrap();
        assert_eq!(counts.active, 1);
        assert_eq!(counts.queued, 2);
    }

    #[tokio::test]
    async fn test_in_flight_ignores_expired_leases() {
        let (_dir, repo) = setup().await;
        repo.create_job(&JobDbModel::new("dead", "{}", 0, 3))
            .await
            .unwrap();
        repo.create_job(&JobDbModel::new("live", "{}", 0, 3))
            .await
            .unwrap();

        repo.claim_next_job(-10).await.unwrap().unwrap();
        assert_eq!(repo.count_in_flight().await.unwrap(), 0);

        // The next claim takes whichever row is first; both end up leased.
        repo.claim_next_job(60).await.unwrap().unwrap();
        repo.claim_next_job(60).await.unwrap().unwrap();
        assert_eq!(repo.count_in_flight().await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_paused_flag_round_trip() {
        let (_dir, repo) = setup().await;
        assert!(!repo.is_paused().await.unwrap());
        repo.set_paused(true).await.unwrap();
        assert!(repo.is_paused().await.unwrap());
        repo.set_paused(false).await.unwrap();
        assert!(!repo.is_paused().await.unwrap());
    }
}
