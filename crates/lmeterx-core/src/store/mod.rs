use chrono::Utc;
use sqlx::mysql::{MySqlPoolOptions, MySqlRow};
use sqlx::{MySqlPool, Row};
use uuid::Uuid;

use crate::engine::{FinalSummary, RealtimeRow};
use crate::error::EngineError;
use crate::task::{ApiType, ChatType, LoadProfile, StreamMode, Task, TaskStatus};

/// Thin wrapper around a `sqlx::MySqlPool`. Every Task Runner and the
/// Dispatcher each own one `Store`, built once at process startup from
/// `Configuration::database_url`.
#[derive(Clone)]
pub struct Store {
    pool: MySqlPool,
}

impl Store {
    pub async fn connect(database_url: &str) -> Result<Self, EngineError> {
        let pool = MySqlPoolOptions::new()
            .max_connections(10)
            .connect(database_url)
            .await?;
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &MySqlPool {
        &self.pool
    }

    pub async fn fetch_task(&self, id: Uuid) -> Result<Task, EngineError> {
        let row = sqlx::query(
            "SELECT id, name, created_by, created_at, status, api_type, chat_type, \
             stream_mode, model, target_url, headers, cookies, request_payload, \
             field_mapping, dataset_path, load_profile, spawn_rate, duration_secs, \
             cert_config, locked_by, pid, error_message \
             FROM tasks WHERE id = ? AND is_deleted = 0",
        )
        .bind(id.to_string())
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| EngineError::TaskNotFound(id.to_string()))?;

        row_to_task(&row)
    }

    /// Atomically claims the oldest `CREATED` task for this dispatcher,
    /// using `SELECT ... FOR UPDATE` as the fencing mechanism: only one
    /// transaction can hold the row lock at a time, so two dispatcher
    /// processes racing on the same poll tick never both claim it.
    pub async fn claim_pending_task(&self, dispatcher_id: &str) -> Result<Option<Task>, EngineError> {
        let mut tx = self.pool.begin().await?;

        let row = sqlx::query(
            "SELECT id FROM tasks WHERE status = 'CREATED' AND is_deleted = 0 \
             ORDER BY created_at ASC LIMIT 1 FOR UPDATE",
        )
        .fetch_optional(&mut *tx)
        .await?;

        let Some(row) = row else {
            tx.commit().await?;
            return Ok(None);
        };
        let id: String = row.try_get("id")?;

        sqlx::query("UPDATE tasks SET status = 'LOCKED', locked_by = ?, locked_at = ? WHERE id = ?")
            .bind(dispatcher_id)
            .bind(Utc::now())
            .bind(&id)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;

        let uuid = Uuid::parse_str(&id).map_err(|e| EngineError::Internal(e.to_string()))?;
        Ok(Some(self.fetch_task(uuid).await?))
    }

    pub async fn update_task_status(
        &self,
        id: Uuid,
        status: TaskStatus,
        error_message: Option<&str>,
    ) -> Result<(), EngineError> {
        sqlx::query("UPDATE tasks SET status = ?, error_message = ? WHERE id = ?")
            .bind(status.to_string())
            .bind(error_message)
            .bind(id.to_string())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Lightweight status-only read, polled by a running Task Runner to
    /// detect an operator-requested `STOPPING` without re-fetching the
    /// whole task row.
    pub async fn fetch_status(&self, id: Uuid) -> Result<TaskStatus, EngineError> {
        let row = sqlx::query("SELECT status FROM tasks WHERE id = ?")
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| EngineError::TaskNotFound(id.to_string()))?;
        let status: String = row.try_get("status")?;
        parse_task_status(&status)
    }

    pub async fn record_pid(&self, id: Uuid, pid: u32) -> Result<(), EngineError> {
        sqlx::query("UPDATE tasks SET pid = ? WHERE id = ?")
            .bind(pid)
            .bind(id.to_string())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn insert_realtime_row(&self, row: &RealtimeRow) -> Result<(), EngineError> {
        sqlx::query(
            "INSERT INTO common_task_realtime_metrics \
             (task_id, timestamp, current_users, current_rps, current_fail_per_sec, \
              avg_response_ms, min_response_ms, max_response_ms, median_response_ms, \
              p95_response_ms, total_requests, total_failures) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(row.task_id.to_string())
        .bind(row.timestamp)
        .bind(row.current_users as i64)
        .bind(row.current_rps)
        .bind(row.current_fail_per_sec)
        .bind(row.avg_response_ms)
        .bind(row.min_response_ms as i64)
        .bind(row.max_response_ms as i64)
        .bind(row.median_response_ms as i64)
        .bind(row.p95_response_ms as i64)
        .bind(row.total_requests as i64)
        .bind(row.total_failures as i64)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn insert_final_summary(&self, summary: &FinalSummary) -> Result<(), EngineError> {
        let labels_json = serde_json::to_string(&summary.labels)?;
        sqlx::query(
            "INSERT INTO task_results \
             (task_id, duration_secs, total_requests, total_failures, success_rate, rps, \
              completion_tps, total_tps, tokens_estimated, events_dropped, labels) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(summary.task_id.to_string())
        .bind(summary.duration_secs)
        .bind(summary.total_requests as i64)
        .bind(summary.total_failures as i64)
        .bind(summary.success_rate)
        .bind(summary.rps)
        .bind(summary.completion_tps)
        .bind(summary.total_tps)
        .bind(summary.tokens_estimated)
        .bind(summary.events_dropped as i64)
        .bind(labels_json)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Resets any task left `LOCKED`/`RUNNING` by a dispatcher that crashed
    /// before marking it terminal. Safe to call on every dispatcher
    /// startup; a task already terminal is untouched by the `WHERE` clause.
    pub async fn recover_orphans(&self) -> Result<u64, EngineError> {
        let result = sqlx::query(
            "UPDATE tasks SET status = 'FAILED', error_message = 'DISPATCHER_RESTART' \
             WHERE status IN ('LOCKED', 'RUNNING')",
        )
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }
}

fn parse_json_column<T: serde::de::DeserializeOwned>(row: &MySqlRow, column: &str) -> Result<T, EngineError> {
    let raw: String = row.try_get(column)?;
    serde_json::from_str(&raw).map_err(EngineError::from)
}

fn row_to_task(row: &MySqlRow) -> Result<Task, EngineError> {
    let id: String = row.try_get("id")?;
    let status: String = row.try_get("status")?;
    let api_type: String = row.try_get("api_type")?;
    let chat_type: String = row.try_get("chat_type")?;
    let stream_mode: String = row.try_get("stream_mode")?;

    Ok(Task {
        id: Uuid::parse_str(&id).map_err(|e| EngineError::Internal(e.to_string()))?,
        name: row.try_get("name")?,
        created_by: row.try_get("created_by")?,
        created_at: row.try_get("created_at")?,
        status: parse_task_status(&status)?,
        api_type: parse_api_type(&api_type)?,
        chat_type: if chat_type == "multi_modal" {
            ChatType::MultiModal
        } else {
            ChatType::TextOnly
        },
        stream_mode: if stream_mode == "streaming" {
            StreamMode::Streaming
        } else {
            StreamMode::NonStreaming
        },
        model: row.try_get("model")?,
        target_url: row.try_get("target_url")?,
        headers: parse_json_column(row, "headers").unwrap_or_default(),
        cookies: parse_json_column(row, "cookies").unwrap_or_default(),
        request_payload: parse_json_column(row, "request_payload")?,
        field_mapping: parse_json_column(row, "field_mapping").unwrap_or(serde_json::Value::Null),
        dataset_path: row.try_get("dataset_path")?,
        load_profile: parse_json_column(row, "load_profile")?,
        spawn_rate: row.try_get("spawn_rate")?,
        duration: std::time::Duration::from_secs({
            let secs: i64 = row.try_get("duration_secs")?;
            secs.max(0) as u64
        }),
        cert_config: parse_json_column(row, "cert_config").ok(),
        locked_by: row.try_get("locked_by")?,
        pid: row
            .try_get::<Option<i64>, _>("pid")?
            .map(|pid| pid as u32),
        error_message: row.try_get("error_message")?,
    })
}

fn parse_task_status(raw: &str) -> Result<TaskStatus, EngineError> {
    Ok(match raw {
        "CREATED" => TaskStatus::Created,
        "LOCKED" => TaskStatus::Locked,
        "RUNNING" => TaskStatus::Running,
        "STOPPING" => TaskStatus::Stopping,
        "STOPPED" => TaskStatus::Stopped,
        "COMPLETED" => TaskStatus::Completed,
        "FAILED_REQUESTS" => TaskStatus::FailedRequests,
        "FAILED" => TaskStatus::Failed,
        other => return Err(EngineError::Internal(format!("unknown task status: {other}"))),
    })
}

fn parse_api_type(raw: &str) -> Result<ApiType, EngineError> {
    Ok(match raw {
        "openai_chat" => ApiType::OpenaiChat,
        "claude_chat" => ApiType::ClaudeChat,
        "embeddings" => ApiType::Embeddings,
        "custom_chat" => ApiType::CustomChat,
        "generic" => ApiType::Generic,
        other => return Err(EngineError::Internal(format!("unknown api_type: {other}"))),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_task_status_known_values() {
        assert_eq!(parse_task_status("CREATED").unwrap(), TaskStatus::Created);
        assert_eq!(parse_task_status("FAILED_REQUESTS").unwrap(), TaskStatus::FailedRequests);
        assert_eq!(parse_task_status("STOPPED").unwrap(), TaskStatus::Stopped);
    }

    #[test]
    fn parse_task_status_unknown_is_error() {
        assert!(parse_task_status("NOT_A_STATUS").is_err());
    }

    #[test]
    fn parse_api_type_known_values() {
        assert_eq!(parse_api_type("openai_chat").unwrap(), ApiType::OpenaiChat);
        assert_eq!(parse_api_type("generic").unwrap(), ApiType::Generic);
    }

    #[test]
    fn parse_api_type_unknown_is_error() {
        assert!(parse_api_type("smtp").is_err());
    }
}
