//! SQLite workflow store implementation.
//!
//! Implements `WorkflowStore` from `strand-core` using sqlx with split
//! read/write pools. History payloads, signal payloads and timer kinds are
//! stored as JSON text. Appends and claims run on the single writer
//! connection, which serializes them across concurrent resumptions.

use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::Row;
use strand_core::repository::workflow::{WorkflowStore, check_append_sequence};
use strand_types::error::RepositoryError;
use strand_types::workflow::{
    EventPayload, HistoryEvent, InstanceStatus, Signal, StatusUpdate, Timer, TimerKind,
    WorkflowInstance,
};
use uuid::Uuid;

use super::pool::DatabasePool;
use super::{format_datetime, parse_datetime, parse_json, parse_uuid, query_error, to_json};

/// SQLite-backed implementation of `WorkflowStore`.
#[derive(Clone)]
pub struct SqliteWorkflowStore {
    pool: DatabasePool,
}

impl SqliteWorkflowStore {
    pub fn new(pool: DatabasePool) -> Self {
        Self { pool }
    }
}

// ---------------------------------------------------------------------------
// Internal row types
// ---------------------------------------------------------------------------

struct InstanceRow {
    id: String,
    workflow_id: String,
    version: String,
    status: String,
    input: String,
    result: Option<String>,
    error: Option<String>,
    waiting_for_event: Option<String>,
    wait_token: Option<String>,
    cancel_reason: Option<String>,
    created_at: String,
    updated_at: String,
    completed_at: Option<String>,
}

impl InstanceRow {
    fn from_row(row: &sqlx::sqlite::SqliteRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            id: row.try_get("id")?,
            workflow_id: row.try_get("workflow_id")?,
            version: row.try_get("version")?,
            status: row.try_get("status")?,
            input: row.try_get("input")?,
            result: row.try_get("result")?,
            error: row.try_get("error")?,
            waiting_for_event: row.try_get("waiting_for_event")?,
            wait_token: row.try_get("wait_token")?,
            cancel_reason: row.try_get("cancel_reason")?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
            completed_at: row.try_get("completed_at")?,
        })
    }

    fn into_instance(self) -> Result<WorkflowInstance, RepositoryError> {
        Ok(WorkflowInstance {
            id: parse_uuid(&self.id)?,
            workflow_id: self.workflow_id,
            version: self.version,
            status: self.status.parse().map_err(RepositoryError::Query)?,
            input: parse_json(&self.input, "instance input")?,
            result: self
                .result
                .as_deref()
                .map(|s| parse_json::<Value>(s, "instance result"))
                .transpose()?,
            error: self.error,
            waiting_for_event: self.waiting_for_event,
            wait_token: self.wait_token,
            cancel_reason: self.cancel_reason,
            created_at: parse_datetime(&self.created_at)?,
            updated_at: parse_datetime(&self.updated_at)?,
            completed_at: self
                .completed_at
                .as_deref()
                .map(parse_datetime)
                .transpose()?,
        })
    }
}

fn event_from_row(row: &sqlx::sqlite::SqliteRow) -> Result<HistoryEvent, RepositoryError> {
    let instance_id: String = row.try_get("instance_id").map_err(query_error)?;
    let sequence: i64 = row.try_get("sequence").map_err(query_error)?;
    let payload: String = row.try_get("payload").map_err(query_error)?;
    let recorded_at: String = row.try_get("recorded_at").map_err(query_error)?;
    Ok(HistoryEvent {
        instance_id: parse_uuid(&instance_id)?,
        sequence: sequence as u64,
        recorded_at: parse_datetime(&recorded_at)?,
        payload: parse_json::<EventPayload>(&payload, "history payload")?,
    })
}

fn signal_from_row(row: &sqlx::sqlite::SqliteRow) -> Result<Signal, RepositoryError> {
    let id: String = row.try_get("id").map_err(query_error)?;
    let instance_id: String = row.try_get("instance_id").map_err(query_error)?;
    let payload: String = row.try_get("payload").map_err(query_error)?;
    let processed: i64 = row.try_get("processed").map_err(query_error)?;
    let created_at: String = row.try_get("created_at").map_err(query_error)?;
    Ok(Signal {
        id: parse_uuid(&id)?,
        instance_id: parse_uuid(&instance_id)?,
        event_name: row.try_get("event_name").map_err(query_error)?,
        token: row.try_get("token").map_err(query_error)?,
        payload: parse_json(&payload, "signal payload")?,
        processed: processed != 0,
        created_at: parse_datetime(&created_at)?,
    })
}

fn timer_from_row(row: &sqlx::sqlite::SqliteRow) -> Result<Timer, RepositoryError> {
    let id: String = row.try_get("id").map_err(query_error)?;
    let instance_id: String = row.try_get("instance_id").map_err(query_error)?;
    let op: i64 = row.try_get("op").map_err(query_error)?;
    let kind: String = row.try_get("kind").map_err(query_error)?;
    let fire_at: String = row.try_get("fire_at").map_err(query_error)?;
    Ok(Timer {
        id: parse_uuid(&id)?,
        instance_id: parse_uuid(&instance_id)?,
        op: op as u32,
        kind: parse_json::<TimerKind>(&kind, "timer kind")?,
        fire_at: parse_datetime(&fire_at)?,
    })
}

fn unique_violation(e: sqlx::Error, message: impl FnOnce() -> String) -> RepositoryError {
    if let sqlx::Error::Database(ref db_err) = e {
        if db_err.message().contains("UNIQUE") {
            return RepositoryError::Conflict(message());
        }
    }
    RepositoryError::Query(e.to_string())
}

const TERMINAL_STATUSES: &str = "('completed', 'failed', 'cancelled')";

// ---------------------------------------------------------------------------
// WorkflowStore impl
// ---------------------------------------------------------------------------

impl WorkflowStore for SqliteWorkflowStore {
    async fn create_instance(&self, instance: &WorkflowInstance) -> Result<(), RepositoryError> {
        sqlx::query(
            r#"INSERT INTO workflow_instances
               (id, workflow_id, version, status, input, result, error, waiting_for_event,
                wait_token, cancel_reason, created_at, updated_at, completed_at)
               VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)"#,
        )
        .bind(instance.id.to_string())
        .bind(&instance.workflow_id)
        .bind(&instance.version)
        .bind(instance.status.as_str())
        .bind(to_json(&instance.input)?)
        .bind(instance.result.as_ref().map(to_json).transpose()?)
        .bind(&instance.error)
        .bind(&instance.waiting_for_event)
        .bind(&instance.wait_token)
        .bind(&instance.cancel_reason)
        .bind(format_datetime(&instance.created_at))
        .bind(format_datetime(&instance.updated_at))
        .bind(instance.completed_at.as_ref().map(format_datetime))
        .execute(&self.pool.writer)
        .await
        .map_err(|e| unique_violation(e, || format!("instance {} already exists", instance.id)))?;

        Ok(())
    }

    async fn get_instance(&self, id: &Uuid) -> Result<Option<WorkflowInstance>, RepositoryError> {
        let row = sqlx::query("SELECT * FROM workflow_instances WHERE id = ?")
            .bind(id.to_string())
            .fetch_optional(&self.pool.reader)
            .await
            .map_err(query_error)?;

        match row {
            Some(row) => {
                let r = InstanceRow::from_row(&row).map_err(query_error)?;
                Ok(Some(r.into_instance()?))
            }
            None => Ok(None),
        }
    }

    async fn list_instances(
        &self,
        status: Option<InstanceStatus>,
        limit: u32,
    ) -> Result<Vec<WorkflowInstance>, RepositoryError> {
        let status = status.map(|s| s.as_str());
        let rows = sqlx::query(
            "SELECT * FROM workflow_instances WHERE (? IS NULL OR status = ?) ORDER BY created_at DESC, id DESC LIMIT ?",
        )
        .bind(status)
        .bind(status)
        .bind(limit as i64)
        .fetch_all(&self.pool.reader)
        .await
        .map_err(query_error)?;

        let mut instances = Vec::with_capacity(rows.len());
        for row in &rows {
            let r = InstanceRow::from_row(row).map_err(query_error)?;
            instances.push(r.into_instance()?);
        }
        Ok(instances)
    }

    async fn update_instance_status(
        &self,
        id: &Uuid,
        status: InstanceStatus,
        update: &StatusUpdate,
    ) -> Result<(), RepositoryError> {
        let now = Utc::now();
        let completed_at = status.is_terminal().then(|| format_datetime(&now));

        let result = sqlx::query(
            r#"UPDATE workflow_instances SET
                 status = ?,
                 updated_at = ?,
                 waiting_for_event = ?,
                 wait_token = ?,
                 result = COALESCE(?, result),
                 error = COALESCE(?, error),
                 cancel_reason = COALESCE(?, cancel_reason),
                 completed_at = COALESCE(?, completed_at)
               WHERE id = ?"#,
        )
        .bind(status.as_str())
        .bind(format_datetime(&now))
        .bind(&update.waiting_for_event)
        .bind(&update.wait_token)
        .bind(update.result.as_ref().map(to_json).transpose()?)
        .bind(&update.error)
        .bind(&update.cancel_reason)
        .bind(completed_at)
        .bind(id.to_string())
        .execute(&self.pool.writer)
        .await
        .map_err(query_error)?;

        if result.rows_affected() == 0 {
            return Err(RepositoryError::NotFound);
        }
        Ok(())
    }

    async fn transition_status(
        &self,
        id: &Uuid,
        from: &[InstanceStatus],
        to: InstanceStatus,
    ) -> Result<bool, RepositoryError> {
        if from.is_empty() {
            return Ok(false);
        }
        let placeholders = vec!["?"; from.len()].join(", ");
        let sql = format!(
            "UPDATE workflow_instances SET status = ?, updated_at = ? WHERE id = ? AND status IN ({placeholders})"
        );
        let mut query = sqlx::query(&sql)
            .bind(to.as_str())
            .bind(format_datetime(&Utc::now()))
            .bind(id.to_string());
        for status in from {
            query = query.bind(status.as_str());
        }
        let result = query
            .execute(&self.pool.writer)
            .await
            .map_err(query_error)?;

        Ok(result.rows_affected() > 0)
    }

    async fn request_cancel(&self, id: &Uuid, reason: &str) -> Result<bool, RepositoryError> {
        let mut tx = self.pool.writer.begin().await.map_err(query_error)?;

        let exists = sqlx::query("SELECT 1 FROM workflow_instances WHERE id = ?")
            .bind(id.to_string())
            .fetch_optional(&mut *tx)
            .await
            .map_err(query_error)?;
        if exists.is_none() {
            return Err(RepositoryError::NotFound);
        }

        let sql = format!(
            "UPDATE workflow_instances SET cancel_reason = ?, updated_at = ? WHERE id = ? AND status NOT IN {TERMINAL_STATUSES}"
        );
        let result = sqlx::query(&sql)
            .bind(reason)
            .bind(format_datetime(&Utc::now()))
            .bind(id.to_string())
            .execute(&mut *tx)
            .await
            .map_err(query_error)?;

        tx.commit().await.map_err(query_error)?;
        Ok(result.rows_affected() > 0)
    }

    async fn get_events(&self, instance_id: &Uuid) -> Result<Vec<HistoryEvent>, RepositoryError> {
        let rows = sqlx::query(
            "SELECT instance_id, sequence, payload, recorded_at FROM workflow_events WHERE instance_id = ? ORDER BY sequence ASC",
        )
        .bind(instance_id.to_string())
        .fetch_all(&self.pool.reader)
        .await
        .map_err(query_error)?;

        rows.iter().map(event_from_row).collect()
    }

    async fn append_events(
        &self,
        instance_id: &Uuid,
        events: &[HistoryEvent],
    ) -> Result<(), RepositoryError> {
        if events.is_empty() {
            return Ok(());
        }
        let mut tx = self.pool.writer.begin().await.map_err(query_error)?;

        let (last,): (i64,) = sqlx::query_as(
            "SELECT COALESCE(MAX(sequence), 0) FROM workflow_events WHERE instance_id = ?",
        )
        .bind(instance_id.to_string())
        .fetch_one(&mut *tx)
        .await
        .map_err(query_error)?;
        check_append_sequence(last as u64, events)?;

        for event in events {
            sqlx::query(
                r#"INSERT INTO workflow_events (instance_id, sequence, event_type, payload, recorded_at)
                   VALUES (?, ?, ?, ?, ?)"#,
            )
            .bind(instance_id.to_string())
            .bind(event.sequence as i64)
            .bind(event.event_type().as_str())
            .bind(to_json(&event.payload)?)
            .bind(format_datetime(&event.recorded_at))
            .execute(&mut *tx)
            .await
            .map_err(|e| {
                unique_violation(e, || {
                    format!("sequence {} already recorded for {instance_id}", event.sequence)
                })
            })?;
        }

        tx.commit().await.map_err(query_error)?;
        Ok(())
    }

    async fn save_signal(&self, signal: &Signal) -> Result<(), RepositoryError> {
        sqlx::query(
            r#"INSERT INTO workflow_signals (id, instance_id, event_name, token, payload, processed, created_at)
               VALUES (?, ?, ?, ?, ?, ?, ?)"#,
        )
        .bind(signal.id.to_string())
        .bind(signal.instance_id.to_string())
        .bind(&signal.event_name)
        .bind(&signal.token)
        .bind(to_json(&signal.payload)?)
        .bind(signal.processed as i64)
        .bind(format_datetime(&signal.created_at))
        .execute(&self.pool.writer)
        .await
        .map_err(query_error)?;

        Ok(())
    }

    async fn get_pending_signals(
        &self,
        instance_id: &Uuid,
        event_name: &str,
    ) -> Result<Vec<Signal>, RepositoryError> {
        let rows = sqlx::query(
            "SELECT * FROM workflow_signals WHERE instance_id = ? AND event_name = ? AND processed = 0 ORDER BY created_at ASC, id ASC",
        )
        .bind(instance_id.to_string())
        .bind(event_name)
        .fetch_all(&self.pool.reader)
        .await
        .map_err(query_error)?;

        rows.iter().map(signal_from_row).collect()
    }

    async fn mark_signal_processed(&self, signal_id: &Uuid) -> Result<bool, RepositoryError> {
        let mut tx = self.pool.writer.begin().await.map_err(query_error)?;

        let processed: Option<(i64,)> =
            sqlx::query_as("SELECT processed FROM workflow_signals WHERE id = ?")
                .bind(signal_id.to_string())
                .fetch_optional(&mut *tx)
                .await
                .map_err(query_error)?;
        let Some((processed,)) = processed else {
            return Err(RepositoryError::NotFound);
        };
        if processed != 0 {
            return Ok(false);
        }

        sqlx::query("UPDATE workflow_signals SET processed = 1 WHERE id = ?")
            .bind(signal_id.to_string())
            .execute(&mut *tx)
            .await
            .map_err(query_error)?;

        tx.commit().await.map_err(query_error)?;
        Ok(true)
    }

    async fn find_waiting_instance(
        &self,
        event_name: Option<&str>,
        token: Option<&str>,
    ) -> Result<Option<WorkflowInstance>, RepositoryError> {
        if event_name.is_none() && token.is_none() {
            return Ok(None);
        }
        let row = sqlx::query(
            r#"SELECT * FROM workflow_instances
               WHERE status = 'suspended'
                 AND (? IS NULL OR waiting_for_event = ?)
                 AND (? IS NULL OR wait_token = ?)
               ORDER BY created_at ASC, id ASC
               LIMIT 1"#,
        )
        .bind(event_name)
        .bind(event_name)
        .bind(token)
        .bind(token)
        .fetch_optional(&self.pool.reader)
        .await
        .map_err(query_error)?;

        match row {
            Some(row) => {
                let r = InstanceRow::from_row(&row).map_err(query_error)?;
                Ok(Some(r.into_instance()?))
            }
            None => Ok(None),
        }
    }

    async fn create_timer(&self, timer: &Timer) -> Result<(), RepositoryError> {
        sqlx::query(
            "INSERT INTO workflow_timers (id, instance_id, op, kind, fire_at) VALUES (?, ?, ?, ?, ?)",
        )
        .bind(timer.id.to_string())
        .bind(timer.instance_id.to_string())
        .bind(timer.op as i64)
        .bind(to_json(&timer.kind)?)
        .bind(format_datetime(&timer.fire_at))
        .execute(&self.pool.writer)
        .await
        .map_err(query_error)?;

        Ok(())
    }

    async fn get_due_timers(
        &self,
        now: DateTime<Utc>,
        limit: u32,
    ) -> Result<Vec<Timer>, RepositoryError> {
        let rows = sqlx::query(
            "SELECT * FROM workflow_timers WHERE fire_at <= ? ORDER BY fire_at ASC, id ASC LIMIT ?",
        )
        .bind(format_datetime(&now))
        .bind(limit as i64)
        .fetch_all(&self.pool.reader)
        .await
        .map_err(query_error)?;

        rows.iter().map(timer_from_row).collect()
    }

    async fn delete_timer(&self, timer_id: &Uuid) -> Result<bool, RepositoryError> {
        let result = sqlx::query("DELETE FROM workflow_timers WHERE id = ?")
            .bind(timer_id.to_string())
            .execute(&self.pool.writer)
            .await
            .map_err(query_error)?;

        Ok(result.rows_affected() > 0)
    }

    async fn delete_timers_for_instance(&self, instance_id: &Uuid) -> Result<u64, RepositoryError> {
        let result = sqlx::query("DELETE FROM workflow_timers WHERE instance_id = ?")
            .bind(instance_id.to_string())
            .execute(&self.pool.writer)
            .await
            .map_err(query_error)?;

        Ok(result.rows_affected())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
