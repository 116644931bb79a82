use crate::error::StoreError;
use crate::progress::{ProgressRecord, ProgressStore};
use crate::store::{
    apply_acknowledge_cancel, apply_cancel, apply_complete, apply_failure, apply_reclaim,
    check_owner, validate, JobFailure, JobStore, Lease, QueueStats, ReclaimOutcome, Reclaimed,
    StoreSettings,
};
use crate::{chrono_duration, AnalysisJob, JobId, JobRequest, JobStatus};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::{Executor, PgConnection};
use std::time::Duration;
use tracing::{debug, instrument};

/// PostgreSQL backed job store.
#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
    settings: StoreSettings,
}

impl PgStore {
    #[instrument(name = "db.connect", skip_all)]
    pub async fn connect(url: &str, settings: StoreSettings) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new().max_connections(5).connect(url).await?;

        (&pool).execute(include_str!("setup.sql")).await?;

        Ok(PgStore { pool, settings })
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    async fn lock_job(conn: &mut PgConnection, job_id: JobId) -> Result<AnalysisJob, StoreError> {
        sqlx::query_as::<_, AnalysisJob>("SELECT * FROM analysis_jobs WHERE job_id = $1 FOR UPDATE")
            .bind(job_id)
            .fetch_optional(conn)
            .await?
            .ok_or(StoreError::NotFound(job_id))
    }

    async fn write_back(
        conn: &mut PgConnection,
        job: &AnalysisJob,
        requeue: bool,
    ) -> Result<(), StoreError> {
        sqlx::query(
            "UPDATE analysis_jobs \
                SET status = $2, \
                attempt_count = $3, \
                lease_owner = $4, \
                lease_expires_at = $5, \
                cancel_requested = $6, \
                run_at = $7, \
                started_at = $8, \
                completed_at = $9, \
                error_kind = $10, \
                error_message = $11, \
                seq = CASE WHEN $12 THEN nextval('analysis_jobs_seq') ELSE seq END \
            WHERE job_id = $1",
        )
        .bind(job.job_id)
        .bind(job.status)
        .bind(job.attempt_count)
        .bind(&job.lease_owner)
        .bind(job.lease_expires_at)
        .bind(job.cancel_requested)
        .bind(job.run_at)
        .bind(job.started_at)
        .bind(job.completed_at)
        .bind(job.error_kind)
        .bind(&job.error_message)
        .bind(requeue)
        .execute(conn)
        .await?;
        Ok(())
    }

    /// Locks one job row, applies `f`, and writes the result back in the
    /// same transaction. `f` returns its result and whether the job re-entered
    /// the queue (and so needs a fresh FIFO position).
    async fn mutate<T, F>(&self, job_id: JobId, f: F) -> Result<T, StoreError>
    where
        T: Send,
        F: FnOnce(&mut AnalysisJob, DateTime<Utc>) -> Result<(T, bool), StoreError> + Send,
    {
        let mut tx = self.pool.begin().await?;
        let mut job = Self::lock_job(&mut tx, job_id).await?;
        let (result, requeue) = f(&mut job, Utc::now())?;
        Self::write_back(&mut tx, &job, requeue).await?;
        tx.commit().await?;
        Ok(result)
    }
}

#[async_trait]
impl JobStore for PgStore {
    #[instrument(name = "db.enqueue", skip_all, fields(dedup_key = %request.dedup_key))]
    async fn enqueue(&self, request: JobRequest) -> Result<JobId, StoreError> {
        validate(&request)?;
        let job = AnalysisJob::from_request(request, self.settings.default_max_attempts);

        // The active job for this key may finish between the insert and the
        // lookup, so try a few times before giving up.
        for _ in 0..3 {
            let inserted: Option<JobId> = sqlx::query_scalar(
                "INSERT INTO analysis_jobs \
                (job_id, dedup_key, subject_type, subject_ids, priority, status, max_attempts, run_at, created_at) \
                VALUES ($1, $2, $3, $4, $5, 'queued', $6, $7, $7) \
                ON CONFLICT (dedup_key) WHERE status IN ('queued', 'in_progress') DO NOTHING \
                RETURNING job_id",
            )
            .bind(job.job_id)
            .bind(&job.dedup_key)
            .bind(job.subject_type)
            .bind(&job.subject_ids)
            .bind(job.priority)
            .bind(job.max_attempts)
            .bind(job.created_at)
            .fetch_optional(&self.pool)
            .await?;

            if let Some(job_id) = inserted {
                return Ok(job_id);
            }

            let existing: Option<JobId> = sqlx::query_scalar(
                "SELECT job_id FROM analysis_jobs \
                WHERE dedup_key = $1 AND status IN ('queued', 'in_progress')",
            )
            .bind(&job.dedup_key)
            .fetch_optional(&self.pool)
            .await?;

            if let Some(job_id) = existing {
                debug!(job_id = %job_id, "Duplicate enqueue");
                return Ok(job_id);
            }
        }

        Err(StoreError::Unavailable(format!(
            "could not settle dedup key {}",
            job.dedup_key
        )))
    }

    #[instrument(name = "db.dequeue", skip_all, fields(owner = %owner))]
    async fn dequeue(&self, owner: &str) -> Result<Option<AnalysisJob>, StoreError> {
        let now = Utc::now();
        let expires_at = now + chrono_duration(self.settings.lease_duration);

        Ok(sqlx::query_as::<_, AnalysisJob>(
            "WITH next AS ( \
                SELECT job_id FROM analysis_jobs \
                WHERE status = 'queued' AND run_at <= $2 \
                ORDER BY priority ASC, seq ASC \
                FOR UPDATE SKIP LOCKED \
                LIMIT 1 \
            ) \
            UPDATE analysis_jobs j \
                SET status = 'in_progress', \
                lease_owner = $1, \
                lease_expires_at = $3, \
                started_at = COALESCE(j.started_at, $2) \
            FROM next \
            WHERE j.job_id = next.job_id \
            RETURNING j.*",
        )
        .bind(owner)
        .bind(now)
        .bind(expires_at)
        .fetch_optional(&self.pool)
        .await?)
    }

    async fn renew_lease(&self, job_id: JobId, owner: &str) -> Result<Lease, StoreError> {
        let expires_at = Utc::now() + chrono_duration(self.settings.lease_duration);
        let renewed: Option<(bool,)> = sqlx::query_as(
            "UPDATE analysis_jobs \
                SET lease_expires_at = $3 \
            WHERE job_id = $1 AND lease_owner = $2 AND status = 'in_progress' \
            RETURNING cancel_requested",
        )
        .bind(job_id)
        .bind(owner)
        .bind(expires_at)
        .fetch_optional(&self.pool)
        .await?;

        match renewed {
            Some((cancel_requested,)) => Ok(Lease {
                expires_at,
                cancel_requested,
            }),
            None => match self.get(job_id).await? {
                None => Err(StoreError::NotFound(job_id)),
                Some(_) => Err(StoreError::NotOwner {
                    job_id,
                    owner: owner.to_string(),
                }),
            },
        }
    }

    #[instrument(name = "db.complete", skip_all, fields(job_id = %job_id))]
    async fn complete(&self, job_id: JobId, owner: &str) -> Result<(), StoreError> {
        self.mutate(job_id, |job, now| {
            check_owner(job, owner)?;
            apply_complete(job, now);
            Ok(((), false))
        })
        .await
    }

    #[instrument(name = "db.fail", skip_all, fields(job_id = %job_id, error = %failure.message))]
    async fn fail(
        &self,
        job_id: JobId,
        owner: &str,
        failure: JobFailure,
    ) -> Result<JobStatus, StoreError> {
        let backoff = self.settings.backoff.clone();
        self.mutate(job_id, move |job, now| {
            check_owner(job, owner)?;
            let requeued = apply_failure(job, &failure, &backoff, now);
            Ok((job.status, requeued))
        })
        .await
    }

    async fn cancel(&self, job_id: JobId) -> Result<JobStatus, StoreError> {
        self.mutate(job_id, |job, now| Ok((apply_cancel(job, now)?, false)))
            .await
    }

    async fn acknowledge_cancel(&self, job_id: JobId, owner: &str) -> Result<(), StoreError> {
        self.mutate(job_id, |job, now| {
            check_owner(job, owner)?;
            apply_acknowledge_cancel(job, now)?;
            Ok(((), false))
        })
        .await
    }

    #[instrument(name = "db.reclaim_expired", skip_all)]
    async fn reclaim_expired(&self) -> Result<Vec<Reclaimed>, StoreError> {
        let now = Utc::now();
        let mut tx = self.pool.begin().await?;

        let expired = sqlx::query_as::<_, AnalysisJob>(
            "SELECT * FROM analysis_jobs \
            WHERE status = 'in_progress' \
                AND (lease_expires_at IS NULL OR lease_expires_at <= $1) \
            FOR UPDATE SKIP LOCKED",
        )
        .bind(now)
        .fetch_all(&mut *tx)
        .await?;

        let mut reclaimed = Vec::with_capacity(expired.len());
        for mut job in expired {
            let outcome = apply_reclaim(&mut job, &self.settings.backoff, now);
            let requeue = matches!(outcome, ReclaimOutcome::Requeued { .. });
            Self::write_back(&mut tx, &job, requeue).await?;
            reclaimed.push(Reclaimed {
                job_id: job.job_id,
                outcome,
            });
        }

        tx.commit().await?;
        Ok(reclaimed)
    }

    async fn get(&self, job_id: JobId) -> Result<Option<AnalysisJob>, StoreError> {
        Ok(
            sqlx::query_as::<_, AnalysisJob>("SELECT * FROM analysis_jobs WHERE job_id = $1")
                .bind(job_id)
                .fetch_optional(&self.pool)
                .await?,
        )
    }

    async fn stats(&self) -> Result<QueueStats, StoreError> {
        let rows: Vec<(JobStatus, i64)> =
            sqlx::query_as("SELECT status, COUNT(*) FROM analysis_jobs GROUP BY status")
                .fetch_all(&self.pool)
                .await?;

        let mut stats = QueueStats::default();
        for (status, count) in rows {
            stats.add(status, count.max(0) as u64);
        }
        Ok(stats)
    }

    async fn purge_terminal(
        &self,
        finished_retention: Duration,
        cancelled_retention: Duration,
    ) -> Result<usize, StoreError> {
        let now = Utc::now();
        let result = sqlx::query(
            "DELETE FROM analysis_jobs \
            WHERE (status IN ('completed', 'failed') AND completed_at <= $1) \
                OR (status = 'cancelled' AND completed_at <= $2)",
        )
        .bind(now - chrono_duration(finished_retention))
        .bind(now - chrono_duration(cancelled_retention))
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() as usize)
    }
}

/// Progress snapshots in `analysis_progress`, next to the jobs they describe.
#[derive(Clone)]
pub struct PgProgressStore {
    pool: PgPool,
}

impl PgProgressStore {
    /// Shares the job store's pool, whose connect already created the table.
    pub fn new(pool: PgPool) -> Self {
        PgProgressStore { pool }
    }
}

#[derive(sqlx::FromRow)]
struct ProgressRow {
    job_id: JobId,
    percent_complete: f32,
    current_item: Option<String>,
    message: String,
    updated_at: DateTime<Utc>,
    eta_seconds: Option<i64>,
    total_items: i32,
    completed_items: i32,
    terminal: bool,
    expires_at: Option<DateTime<Utc>>,
}

impl From<ProgressRow> for ProgressRecord {
    fn from(row: ProgressRow) -> Self {
        ProgressRecord {
            job_id: row.job_id,
            percent_complete: row.percent_complete,
            current_item: row.current_item,
            message: row.message,
            updated_at: row.updated_at,
            eta_seconds: row.eta_seconds.map(|s| s.max(0) as u64),
            total_items: row.total_items.max(0) as usize,
            completed_items: row.completed_items.max(0) as usize,
            terminal: row.terminal,
            expires_at: row.expires_at,
        }
    }
}

fn clamp_i32(n: usize) -> i32 {
    i32::try_from(n).unwrap_or(i32::MAX)
}

#[async_trait]
impl ProgressStore for PgProgressStore {
    #[instrument(name = "db.progress.append", skip_all, fields(job_id = %record.job_id))]
    async fn append(&self, record: &ProgressRecord) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO analysis_progress \
                (job_id, percent_complete, current_item, message, updated_at, \
                 eta_seconds, total_items, completed_items, terminal, expires_at) \
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)",
        )
        .bind(record.job_id)
        .bind(record.percent_complete)
        .bind(&record.current_item)
        .bind(&record.message)
        .bind(record.updated_at)
        .bind(record.eta_seconds.map(|s| i64::try_from(s).unwrap_or(i64::MAX)))
        .bind(clamp_i32(record.total_items))
        .bind(clamp_i32(record.completed_items))
        .bind(record.terminal)
        .bind(record.expires_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn latest(&self, job_id: JobId) -> Result<Option<ProgressRecord>, StoreError> {
        let row = sqlx::query_as::<_, ProgressRow>(
            "SELECT job_id, percent_complete, current_item, message, updated_at, \
                eta_seconds, total_items, completed_items, terminal, expires_at \
            FROM analysis_progress WHERE job_id = $1 \
            ORDER BY seq DESC LIMIT 1",
        )
        .bind(job_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(ProgressRecord::from))
    }

    #[instrument(name = "db.progress.purge", skip_all)]
    async fn purge_expired(&self, now: DateTime<Utc>) -> Result<usize, StoreError> {
        let expired: Vec<(JobId,)> = sqlx::query_as(
            "DELETE FROM analysis_progress \
            WHERE job_id IN ( \
                SELECT job_id FROM analysis_progress \
                WHERE terminal AND expires_at <= $1) \
            RETURNING job_id",
        )
        .bind(now)
        .fetch_all(&self.pool)
        .await?;

        let mut jobs: Vec<JobId> = expired.into_iter().map(|(job_id,)| job_id).collect();
        jobs.sort_unstable();
        jobs.dedup();
        debug!(jobs = jobs.len(), "Purged progress");
        Ok(jobs.len())
    }
}
