//! SQLite job store implementation.
//!
//! Job mutations load the record and check its status inside a writer
//! transaction, so a terminal record cannot be modified by a late progress
//! report or log line.

use chrono::Utc;
use serde_json::Value;
use sqlx::{Row, SqliteConnection};
use strand_core::repository::job::{JobStore, ensure_mutable};
use strand_types::error::RepositoryError;
use strand_types::job::{JobError, JobLog, JobRecord, JobStatus};
use strand_types::queue::{QueueJob, QueueJobStatus, QueueJobStep, QueueStepStatus};
use uuid::Uuid;

use super::pool::DatabasePool;
use super::{format_datetime, parse_datetime, parse_json, parse_uuid, query_error, to_json};

/// SQLite-backed implementation of `JobStore`.
#[derive(Clone)]
pub struct SqliteJobStore {
    pool: DatabasePool,
}

impl SqliteJobStore {
    pub fn new(pool: DatabasePool) -> Self {
        Self { pool }
    }
}

// ---------------------------------------------------------------------------
// Internal row types
// ---------------------------------------------------------------------------

struct JobRow {
    id: String,
    worker_id: String,
    status: String,
    input: String,
    output: Option<String>,
    error: Option<String>,
    progress: i64,
    logs: String,
    metadata: String,
    webhook_url: Option<String>,
    created_at: String,
    updated_at: String,
    started_at: Option<String>,
    finished_at: Option<String>,
}

impl JobRow {
    fn from_row(row: &sqlx::sqlite::SqliteRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            id: row.try_get("id")?,
            worker_id: row.try_get("worker_id")?,
            status: row.try_get("status")?,
            input: row.try_get("input")?,
            output: row.try_get("output")?,
            error: row.try_get("error")?,
            progress: row.try_get("progress")?,
            logs: row.try_get("logs")?,
            metadata: row.try_get("metadata")?,
            webhook_url: row.try_get("webhook_url")?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
            started_at: row.try_get("started_at")?,
            finished_at: row.try_get("finished_at")?,
        })
    }

    fn into_record(self) -> Result<JobRecord, RepositoryError> {
        Ok(JobRecord {
            id: parse_uuid(&self.id)?,
            worker_id: self.worker_id,
            status: self.status.parse().map_err(RepositoryError::Query)?,
            input: parse_json(&self.input, "job input")?,
            output: self
                .output
                .as_deref()
                .map(|s| parse_json::<Value>(s, "job output"))
                .transpose()?,
            error: self
                .error
                .as_deref()
                .map(|s| parse_json::<JobError>(s, "job error"))
                .transpose()?,
            progress: self.progress.clamp(0, 100) as u8,
            logs: parse_json::<Vec<JobLog>>(&self.logs, "job logs")?,
            metadata: parse_json(&self.metadata, "job metadata")?,
            webhook_url: self.webhook_url,
            created_at: parse_datetime(&self.created_at)?,
            updated_at: parse_datetime(&self.updated_at)?,
            started_at: self.started_at.as_deref().map(parse_datetime).transpose()?,
            finished_at: self.finished_at.as_deref().map(parse_datetime).transpose()?,
        })
    }
}

struct QueueJobRow {
    id: String,
    queue_id: String,
    status: String,
    initial_input: String,
    steps: String,
    created_at: String,
    updated_at: String,
    finished_at: Option<String>,
}

impl QueueJobRow {
    fn from_row(row: &sqlx::sqlite::SqliteRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            id: row.try_get("id")?,
            queue_id: row.try_get("queue_id")?,
            status: row.try_get("status")?,
            initial_input: row.try_get("initial_input")?,
            steps: row.try_get("steps")?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
            finished_at: row.try_get("finished_at")?,
        })
    }

    fn into_queue_job(self) -> Result<QueueJob, RepositoryError> {
        Ok(QueueJob {
            id: parse_uuid(&self.id)?,
            queue_id: self.queue_id,
            status: self.status.parse().map_err(RepositoryError::Query)?,
            initial_input: parse_json(&self.initial_input, "queue initial input")?,
            steps: parse_json::<Vec<QueueJobStep>>(&self.steps, "queue steps")?,
            created_at: parse_datetime(&self.created_at)?,
            updated_at: parse_datetime(&self.updated_at)?,
            finished_at: self.finished_at.as_deref().map(parse_datetime).transpose()?,
        })
    }
}

async fn load_job(conn: &mut SqliteConnection, id: &Uuid) -> Result<JobRecord, RepositoryError> {
    let row = sqlx::query("SELECT * FROM jobs WHERE id = ?")
        .bind(id.to_string())
        .fetch_optional(conn)
        .await
        .map_err(query_error)?
        .ok_or(RepositoryError::NotFound)?;

    JobRow::from_row(&row).map_err(query_error)?.into_record()
}

// ---------------------------------------------------------------------------
// JobStore impl
// ---------------------------------------------------------------------------

impl JobStore for SqliteJobStore {
    async fn create_job(&self, job: &JobRecord) -> Result<(), RepositoryError> {
        sqlx::query(
            r#"INSERT INTO jobs
               (id, worker_id, status, input, output, error, progress, logs, metadata,
                webhook_url, created_at, updated_at, started_at, finished_at)
               VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)"#,
        )
        .bind(job.id.to_string())
        .bind(&job.worker_id)
        .bind(job.status.as_str())
        .bind(to_json(&job.input)?)
        .bind(job.output.as_ref().map(to_json).transpose()?)
        .bind(job.error.as_ref().map(to_json).transpose()?)
        .bind(job.progress as i64)
        .bind(to_json(&job.logs)?)
        .bind(to_json(&job.metadata)?)
        .bind(&job.webhook_url)
        .bind(format_datetime(&job.created_at))
        .bind(format_datetime(&job.updated_at))
        .bind(job.started_at.as_ref().map(format_datetime))
        .bind(job.finished_at.as_ref().map(format_datetime))
        .execute(&self.pool.writer)
        .await
        .map_err(|e| {
            if let sqlx::Error::Database(ref db_err) = e {
                if db_err.message().contains("UNIQUE") {
                    return RepositoryError::Conflict(format!("job {} already exists", job.id));
                }
            }
            RepositoryError::Query(e.to_string())
        })?;

        Ok(())
    }

    async fn get_job(&self, id: &Uuid) -> Result<Option<JobRecord>, RepositoryError> {
        let row = sqlx::query("SELECT * FROM jobs WHERE id = ?")
            .bind(id.to_string())
            .fetch_optional(&self.pool.reader)
            .await
            .map_err(query_error)?;

        match row {
            Some(row) => {
                let r = JobRow::from_row(&row).map_err(query_error)?;
                Ok(Some(r.into_record()?))
            }
            None => Ok(None),
        }
    }

    async fn list_jobs(
        &self,
        worker_id: Option<&str>,
        limit: u32,
    ) -> Result<Vec<JobRecord>, RepositoryError> {
        let rows = sqlx::query(
            "SELECT * FROM jobs WHERE (? IS NULL OR worker_id = ?) ORDER BY created_at DESC, id DESC LIMIT ?",
        )
        .bind(worker_id)
        .bind(worker_id)
        .bind(limit as i64)
        .fetch_all(&self.pool.reader)
        .await
        .map_err(query_error)?;

        let mut jobs = Vec::with_capacity(rows.len());
        for row in &rows {
            let r = JobRow::from_row(row).map_err(query_error)?;
            jobs.push(r.into_record()?);
        }
        Ok(jobs)
    }

    async fn mark_running(&self, id: &Uuid) -> Result<JobRecord, RepositoryError> {
        let mut tx = self.pool.writer.begin().await.map_err(query_error)?;

        let mut job = load_job(&mut tx, id).await?;
        if job.status != JobStatus::Queued {
            return Err(RepositoryError::Conflict(format!(
                "job {id} is {}, expected queued",
                job.status
            )));
        }
        let now = Utc::now();
        sqlx::query("UPDATE jobs SET status = ?, started_at = ?, updated_at = ? WHERE id = ?")
            .bind(JobStatus::Running.as_str())
            .bind(format_datetime(&now))
            .bind(format_datetime(&now))
            .bind(id.to_string())
            .execute(&mut *tx)
            .await
            .map_err(query_error)?;

        tx.commit().await.map_err(query_error)?;
        job.status = JobStatus::Running;
        job.started_at = Some(now);
        job.updated_at = now;
        Ok(job)
    }

    async fn update_progress(&self, id: &Uuid, progress: u8) -> Result<(), RepositoryError> {
        let mut tx = self.pool.writer.begin().await.map_err(query_error)?;

        let job = load_job(&mut tx, id).await?;
        ensure_mutable(&job)?;
        sqlx::query("UPDATE jobs SET progress = ?, updated_at = ? WHERE id = ?")
            .bind(progress.min(100) as i64)
            .bind(format_datetime(&Utc::now()))
            .bind(id.to_string())
            .execute(&mut *tx)
            .await
            .map_err(query_error)?;

        tx.commit().await.map_err(query_error)?;
        Ok(())
    }

    async fn append_log(&self, id: &Uuid, message: &str) -> Result<(), RepositoryError> {
        let mut tx = self.pool.writer.begin().await.map_err(query_error)?;

        let mut job = load_job(&mut tx, id).await?;
        ensure_mutable(&job)?;
        let now = Utc::now();
        job.logs.push(JobLog {
            at: now,
            message: message.to_string(),
        });
        sqlx::query("UPDATE jobs SET logs = ?, updated_at = ? WHERE id = ?")
            .bind(to_json(&job.logs)?)
            .bind(format_datetime(&now))
            .bind(id.to_string())
            .execute(&mut *tx)
            .await
            .map_err(query_error)?;

        tx.commit().await.map_err(query_error)?;
        Ok(())
    }

    async fn complete_job(&self, id: &Uuid, output: &Value) -> Result<JobRecord, RepositoryError> {
        let mut tx = self.pool.writer.begin().await.map_err(query_error)?;

        let mut job = load_job(&mut tx, id).await?;
        ensure_mutable(&job)?;
        let now = Utc::now();
        sqlx::query(
            "UPDATE jobs SET status = ?, output = ?, progress = 100, updated_at = ?, finished_at = ? WHERE id = ?",
        )
        .bind(JobStatus::Success.as_str())
        .bind(to_json(output)?)
        .bind(format_datetime(&now))
        .bind(format_datetime(&now))
        .bind(id.to_string())
        .execute(&mut *tx)
        .await
        .map_err(query_error)?;

        tx.commit().await.map_err(query_error)?;
        job.status = JobStatus::Success;
        job.output = Some(output.clone());
        job.progress = 100;
        job.updated_at = now;
        job.finished_at = Some(now);
        Ok(job)
    }

    async fn fail_job(&self, id: &Uuid, error: &JobError) -> Result<JobRecord, RepositoryError> {
        let mut tx = self.pool.writer.begin().await.map_err(query_error)?;

        let mut job = load_job(&mut tx, id).await?;
        ensure_mutable(&job)?;
        let now = Utc::now();
        sqlx::query(
            "UPDATE jobs SET status = ?, error = ?, updated_at = ?, finished_at = ? WHERE id = ?",
        )
        .bind(JobStatus::Error.as_str())
        .bind(to_json(error)?)
        .bind(format_datetime(&now))
        .bind(format_datetime(&now))
        .bind(id.to_string())
        .execute(&mut *tx)
        .await
        .map_err(query_error)?;

        tx.commit().await.map_err(query_error)?;
        job.status = JobStatus::Error;
        job.error = Some(error.clone());
        job.updated_at = now;
        job.finished_at = Some(now);
        Ok(job)
    }

    async fn create_queue_job(&self, queue_job: &QueueJob) -> Result<(), RepositoryError> {
        sqlx::query(
            r#"INSERT INTO queue_jobs
               (id, queue_id, status, initial_input, steps, created_at, updated_at, finished_at)
               VALUES (?, ?, ?, ?, ?, ?, ?, ?)"#,
        )
        .bind(queue_job.id.to_string())
        .bind(&queue_job.queue_id)
        .bind(queue_job.status.as_str())
        .bind(to_json(&queue_job.initial_input)?)
        .bind(to_json(&queue_job.steps)?)
        .bind(format_datetime(&queue_job.created_at))
        .bind(format_datetime(&queue_job.updated_at))
        .bind(queue_job.finished_at.as_ref().map(format_datetime))
        .execute(&self.pool.writer)
        .await
        .map_err(query_error)?;

        Ok(())
    }

    async fn get_queue_job(&self, id: &Uuid) -> Result<Option<QueueJob>, RepositoryError> {
        let row = sqlx::query("SELECT * FROM queue_jobs WHERE id = ?")
            .bind(id.to_string())
            .fetch_optional(&self.pool.reader)
            .await
            .map_err(query_error)?;

        match row {
            Some(row) => {
                let r = QueueJobRow::from_row(&row).map_err(query_error)?;
                Ok(Some(r.into_queue_job()?))
            }
            None => Ok(None),
        }
    }

    async fn update_queue_step(
        &self,
        id: &Uuid,
        index: usize,
        job_id: Option<Uuid>,
        status: QueueStepStatus,
    ) -> Result<(), RepositoryError> {
        let mut tx = self.pool.writer.begin().await.map_err(query_error)?;

        let steps: Option<(String,)> = sqlx::query_as("SELECT steps FROM queue_jobs WHERE id = ?")
            .bind(id.to_string())
            .fetch_optional(&mut *tx)
            .await
            .map_err(query_error)?;
        let Some((steps,)) = steps else {
            return Err(RepositoryError::NotFound);
        };
        let mut steps: Vec<QueueJobStep> = parse_json(&steps, "queue steps")?;
        let step = steps.get_mut(index).ok_or(RepositoryError::NotFound)?;
        if job_id.is_some() {
            step.job_id = job_id;
        }
        if !(status == QueueStepStatus::Dispatched && step.status.is_finished()) {
            step.status = status;
        }

        sqlx::query("UPDATE queue_jobs SET steps = ?, updated_at = ? WHERE id = ?")
            .bind(to_json(&steps)?)
            .bind(format_datetime(&Utc::now()))
            .bind(id.to_string())
            .execute(&mut *tx)
            .await
            .map_err(query_error)?;

        tx.commit().await.map_err(query_error)?;
        Ok(())
    }

    async fn set_queue_job_status(
        &self,
        id: &Uuid,
        status: QueueJobStatus,
    ) -> Result<(), RepositoryError> {
        let now = Utc::now();
        let finished_at = status.is_terminal().then(|| format_datetime(&now));
        let result = sqlx::query(
            "UPDATE queue_jobs SET status = ?, updated_at = ?, finished_at = COALESCE(?, finished_at) WHERE id = ?",
        )
        .bind(status.as_str())
        .bind(format_datetime(&now))
        .bind(finished_at)
        .bind(id.to_string())
        .execute(&self.pool.writer)
        .await
        .map_err(query_error)?;

        if result.rows_affected() == 0 {
            return Err(RepositoryError::NotFound);
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sqlite::pool::test_pool;
    use serde_json::json;
    use strand_types::queue::{OnFailure, QueueConfig, QueueStep};

    async fn store_with_job() -> (SqliteJobStore, JobRecord) {
        let store = SqliteJobStore::new(test_pool().await);
        let job = JobRecord::queued(
            Uuid::now_v7(),
            "resize",
            json!({"w": 10}),
            json!({"tag": "a"}),
            Some("http://localhost/hook".to_string()),
        );
        store.create_job(&job).await.unwrap();
        (store, job)
    }

    #[tokio::test]
    async fn job_lifecycle_round_trip() {
        let (store, job) = store_with_job().await;

        let running = store.mark_running(&job.id).await.unwrap();
        assert_eq!(running.status, JobStatus::Running);
        assert!(running.started_at.is_some());

        store.update_progress(&job.id, 40).await.unwrap();
        store.append_log(&job.id, "halfway").await.unwrap();
        store.append_log(&job.id, "almost").await.unwrap();

        let done = store.complete_job(&job.id, &json!({"ok": true})).await.unwrap();
        assert_eq!(done.progress, 100);

        let loaded = store.get_job(&job.id).await.unwrap().unwrap();
        assert_eq!(loaded.status, JobStatus::Success);
        assert_eq!(loaded.output, Some(json!({"ok": true})));
        assert_eq!(loaded.progress, 100);
        let messages: Vec<&str> = loaded.logs.iter().map(|l| l.message.as_str()).collect();
        assert_eq!(messages, vec!["halfway", "almost"]);
        assert_eq!(loaded.metadata, json!({"tag": "a"}));
        assert_eq!(loaded.webhook_url.as_deref(), Some("http://localhost/hook"));
        assert!(loaded.finished_at.is_some());
    }

    #[tokio::test]
    async fn terminal_job_rejects_mutation() {
        let (store, job) = store_with_job().await;
        store.mark_running(&job.id).await.unwrap();
        store
            .fail_job(&job.id, &JobError::named("Boom", "exploded"))
            .await
            .unwrap();

        for err in [
            store.update_progress(&job.id, 10).await.unwrap_err(),
            store.append_log(&job.id, "late").await.unwrap_err(),
            store.complete_job(&job.id, &json!(1)).await.map(|_| ()).unwrap_err(),
        ] {
            assert!(matches!(err, RepositoryError::Conflict(_)));
        }

        let loaded = store.get_job(&job.id).await.unwrap().unwrap();
        assert_eq!(loaded.status, JobStatus::Error);
        assert_eq!(loaded.error.unwrap().name.as_deref(), Some("Boom"));
        assert!(loaded.logs.is_empty());
    }

    #[tokio::test]
    async fn mark_running_requires_queued() {
        let (store, job) = store_with_job().await;
        store.mark_running(&job.id).await.unwrap();
        let err = store.mark_running(&job.id).await.unwrap_err();
        assert!(matches!(err, RepositoryError::Conflict(_)));
        assert!(matches!(
            store.mark_running(&Uuid::now_v7()).await.unwrap_err(),
            RepositoryError::NotFound
        ));
    }

    #[tokio::test]
    async fn duplicate_job_is_a_conflict() {
        let (store, job) = store_with_job().await;
        let err = store.create_job(&job).await.unwrap_err();
        assert!(matches!(err, RepositoryError::Conflict(_)));
    }

    #[tokio::test]
    async fn list_jobs_filters_by_worker() {
        let (store, _) = store_with_job().await;
        let other = JobRecord::queued(Uuid::now_v7(), "echo", json!({}), json!({}), None);
        store.create_job(&other).await.unwrap();

        assert_eq!(store.list_jobs(None, 10).await.unwrap().len(), 2);
        let echo = store.list_jobs(Some("echo"), 10).await.unwrap();
        assert_eq!(echo.len(), 1);
        assert_eq!(echo[0].id, other.id);
        assert_eq!(store.list_jobs(None, 1).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn queue_step_updates_keep_finished_status() {
        let store = SqliteJobStore::new(test_pool().await);
        let config = QueueConfig {
            id: "ingest".to_string(),
            steps: vec![QueueStep::new("a"), QueueStep::new("b")],
            schedule: None,
            on_failure: OnFailure::Continue,
        };
        let queue_job = QueueJob::start(Uuid::now_v7(), &config, json!({"value": 5}));
        store.create_queue_job(&queue_job).await.unwrap();

        let job_id = Uuid::now_v7();
        store
            .update_queue_step(&queue_job.id, 0, Some(job_id), QueueStepStatus::Success)
            .await
            .unwrap();
        store
            .update_queue_step(&queue_job.id, 0, None, QueueStepStatus::Dispatched)
            .await
            .unwrap();
        store
            .set_queue_job_status(&queue_job.id, QueueJobStatus::Partial)
            .await
            .unwrap();

        let loaded = store.get_queue_job(&queue_job.id).await.unwrap().unwrap();
        assert_eq!(loaded.steps[0].status, QueueStepStatus::Success);
        assert_eq!(loaded.steps[0].job_id, Some(job_id));
        assert_eq!(loaded.steps[1].status, QueueStepStatus::Pending);
        assert_eq!(loaded.status, QueueJobStatus::Partial);
        assert_eq!(loaded.initial_input, json!({"value": 5}));
        assert!(loaded.finished_at.is_some());

        assert!(matches!(
            store
                .update_queue_step(&queue_job.id, 5, None, QueueStepStatus::Error)
                .await
                .unwrap_err(),
            RepositoryError::NotFound
        ));
    }
}
