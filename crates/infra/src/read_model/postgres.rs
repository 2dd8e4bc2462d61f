//! Postgres-backed stores.
//!
//! Queries run on worker threads (not on the runtime), so each store captures a
//! `tokio::runtime::Handle` at construction and blocks on it per call.
//!
//! Tables:
//! - `plugin_runs` (run records; `plugin_run_id` is the correlation id)
//! - `briefings`
//! - `user_plugin_configs` joined with `plugins` (schedule entries)

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde_json::Value as JsonValue;
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Row};
use tokio::runtime::Handle;
use tracing::instrument;

use firstsip_core::{
    Briefing, CorrelationId, EntityId, OwnerId, RunRecord, RunStatus, ScheduleEntry, Settings,
    TargetId,
};

use super::briefings::{BriefingStore, BriefingStoreError};
use super::runs::{RunStore, RunStoreError};
use crate::scheduler::source::{ScheduleSource, SourceError};

fn as_i64(id: u64) -> i64 {
    id as i64
}

/// Output travels as text; the column is jsonb, so the text is stored as a JSON string.
fn output_to_json(output: &Option<String>) -> Option<JsonValue> {
    output.clone().map(JsonValue::String)
}

/// Rows written by other tools may hold structured JSON; it comes back serialized.
fn output_from_json(value: Option<JsonValue>) -> Option<String> {
    value.map(|v| match v {
        JsonValue::String(s) => s,
        other => other.to_string(),
    })
}

pub struct PostgresRunStore {
    pool: Arc<PgPool>,
    handle: Handle,
}

impl PostgresRunStore {
    pub fn new(pool: PgPool, handle: Handle) -> Self {
        Self {
            pool: Arc::new(pool),
            handle,
        }
    }

    fn row_to_run(row: &PgRow) -> Result<RunRecord, RunStoreError> {
        let storage = |e: sqlx::Error| RunStoreError::Storage(e.to_string());
        let correlation_id: String = row.try_get("plugin_run_id").map_err(storage)?;
        let status: String = row.try_get("status").map_err(storage)?;

        Ok(RunRecord {
            correlation_id: correlation_id
                .parse::<CorrelationId>()
                .map_err(|e| RunStoreError::Storage(e.to_string()))?,
            owner_id: OwnerId::new(row.try_get::<i64, _>("user_id").map_err(storage)? as u64),
            target_id: TargetId::new(row.try_get::<i64, _>("plugin_id").map_err(storage)? as u64),
            status: status
                .parse::<RunStatus>()
                .map_err(|e| RunStoreError::Storage(e.to_string()))?,
            input: row
                .try_get::<Option<JsonValue>, _>("input")
                .map_err(storage)?
                .unwrap_or(JsonValue::Null),
            output: output_from_json(row.try_get("output").map_err(storage)?),
            error: row
                .try_get::<Option<String>, _>("error_message")
                .map_err(storage)?
                .filter(|e| !e.is_empty()),
            started_at: row.try_get("started_at").map_err(storage)?,
            completed_at: row.try_get("completed_at").map_err(storage)?,
        })
    }
}

impl RunStore for PostgresRunStore {
    #[instrument(skip(self, run), fields(correlation_id = %run.correlation_id), err)]
    fn create(&self, run: &RunRecord) -> Result<(), RunStoreError> {
        let pool = self.pool.clone();
        let result = self.handle.block_on(async {
            sqlx::query(
                r#"
                INSERT INTO plugin_runs (
                    plugin_run_id, user_id, plugin_id, status, input, started_at,
                    created_at, updated_at
                )
                VALUES ($1, $2, $3, $4, $5, $6, NOW(), NOW())
                ON CONFLICT (plugin_run_id) DO NOTHING
                "#,
            )
            .bind(run.correlation_id.as_str())
            .bind(as_i64(run.owner_id.get()))
            .bind(as_i64(run.target_id.get()))
            .bind(run.status.as_str())
            .bind(&run.input)
            .bind(run.started_at)
            .execute(&*pool)
            .await
        });

        match result {
            Ok(done) if done.rows_affected() == 0 => {
                Err(RunStoreError::AlreadyExists(run.correlation_id.clone()))
            }
            Ok(_) => Ok(()),
            Err(e) => Err(RunStoreError::Storage(e.to_string())),
        }
    }

    fn get(&self, correlation_id: &CorrelationId) -> Result<Option<RunRecord>, RunStoreError> {
        let pool = self.pool.clone();
        let row = self
            .handle
            .block_on(async {
                sqlx::query(
                    r#"
                    SELECT plugin_run_id, user_id, plugin_id, status, input, output,
                           error_message, started_at, completed_at
                    FROM plugin_runs
                    WHERE plugin_run_id = $1 AND deleted_at IS NULL
                    "#,
                )
                .bind(correlation_id.as_str())
                .fetch_optional(&*pool)
                .await
            })
            .map_err(|e| RunStoreError::Storage(e.to_string()))?;

        row.as_ref().map(Self::row_to_run).transpose()
    }

    #[instrument(skip(self, run), fields(correlation_id = %run.correlation_id, status = %run.status), err)]
    fn save_if_not_terminal(&self, run: &RunRecord) -> Result<bool, RunStoreError> {
        let pool = self.pool.clone();
        let output = output_to_json(&run.output);

        let updated = self
            .handle
            .block_on(async {
                sqlx::query(
                    r#"
                    UPDATE plugin_runs
                    SET status = $2, output = $3, error_message = $4,
                        started_at = $5, completed_at = $6, updated_at = NOW()
                    WHERE plugin_run_id = $1
                      AND deleted_at IS NULL
                      AND status NOT IN ('completed', 'failed')
                    "#,
                )
                .bind(run.correlation_id.as_str())
                .bind(run.status.as_str())
                .bind(output)
                .bind(run.error.as_deref())
                .bind(run.started_at)
                .bind(run.completed_at)
                .execute(&*pool)
                .await
            })
            .map_err(|e| RunStoreError::Storage(e.to_string()))?;

        if updated.rows_affected() > 0 {
            return Ok(true);
        }
        // Nothing written: the row is either terminal or missing.
        match self.get(&run.correlation_id)? {
            Some(_) => Ok(false),
            None => Err(RunStoreError::NotFound(run.correlation_id.clone())),
        }
    }
}

pub struct PostgresBriefingStore {
    pool: Arc<PgPool>,
    handle: Handle,
}

impl PostgresBriefingStore {
    pub fn new(pool: PgPool, handle: Handle) -> Self {
        Self {
            pool: Arc::new(pool),
            handle,
        }
    }
}

impl BriefingStore for PostgresBriefingStore {
    fn get(&self, id: EntityId) -> Result<Option<Briefing>, BriefingStoreError> {
        let pool = self.pool.clone();
        let storage = |e: sqlx::Error| BriefingStoreError::Storage(e.to_string());

        let row = self
            .handle
            .block_on(async {
                sqlx::query(
                    r#"
                    SELECT id, user_id, status, content, error_message, generated_at
                    FROM briefings
                    WHERE id = $1 AND deleted_at IS NULL
                    "#,
                )
                .bind(as_i64(id.get()))
                .fetch_optional(&*pool)
                .await
            })
            .map_err(storage)?;

        let Some(row) = row else {
            return Ok(None);
        };
        let status: String = row.try_get("status").map_err(storage)?;
        Ok(Some(Briefing {
            id,
            owner_id: OwnerId::new(row.try_get::<i64, _>("user_id").map_err(storage)? as u64),
            status: status
                .parse::<RunStatus>()
                .map_err(|e| BriefingStoreError::Storage(e.to_string()))?,
            content: row.try_get("content").map_err(storage)?,
            error: row
                .try_get::<Option<String>, _>("error_message")
                .map_err(storage)?
                .filter(|e| !e.is_empty()),
            generated_at: row.try_get::<Option<DateTime<Utc>>, _>("generated_at").map_err(storage)?,
        }))
    }

    #[instrument(skip(self, briefing), fields(briefing_id = %briefing.id, status = %briefing.status), err)]
    fn save(&self, briefing: &Briefing) -> Result<(), BriefingStoreError> {
        let pool = self.pool.clone();
        let updated = self
            .handle
            .block_on(async {
                sqlx::query(
                    r#"
                    UPDATE briefings
                    SET status = $2, content = $3, error_message = $4,
                        generated_at = $5, updated_at = NOW()
                    WHERE id = $1 AND deleted_at IS NULL
                    "#,
                )
                .bind(as_i64(briefing.id.get()))
                .bind(briefing.status.as_str())
                .bind(&briefing.content)
                .bind(briefing.error.as_deref())
                .bind(briefing.generated_at)
                .execute(&*pool)
                .await
            })
            .map_err(|e| BriefingStoreError::Storage(e.to_string()))?;

        if updated.rows_affected() == 0 {
            return Err(BriefingStoreError::NotFound(briefing.id));
        }
        Ok(())
    }
}

/// Schedule entries from `user_plugin_configs` joined with enabled `plugins`.
pub struct PostgresScheduleSource {
    pool: Arc<PgPool>,
    handle: Handle,
}

impl PostgresScheduleSource {
    pub fn new(pool: PgPool, handle: Handle) -> Self {
        Self {
            pool: Arc::new(pool),
            handle,
        }
    }
}

impl ScheduleSource for PostgresScheduleSource {
    #[instrument(skip(self), err)]
    fn load_schedulable(&self) -> Result<Vec<ScheduleEntry>, SourceError> {
        let pool = self.pool.clone();
        let storage = |e: sqlx::Error| SourceError::Storage(e.to_string());

        let rows = self
            .handle
            .block_on(async {
                sqlx::query(
                    r#"
                    SELECT upc.user_id, upc.plugin_id, p.name AS plugin_name,
                           upc.cron_expression, upc.timezone, upc.settings
                    FROM user_plugin_configs upc
                    JOIN plugins p ON p.id = upc.plugin_id AND p.deleted_at IS NULL
                    WHERE upc.enabled = TRUE
                      AND upc.deleted_at IS NULL
                      AND upc.cron_expression IS NOT NULL
                      AND upc.cron_expression <> ''
                    "#,
                )
                .fetch_all(&*pool)
                .await
            })
            .map_err(storage)?;

        rows.iter()
            .map(|row| {
                let settings = match row.try_get::<Option<JsonValue>, _>("settings").map_err(storage)? {
                    Some(JsonValue::Object(map)) => map,
                    _ => Settings::new(),
                };
                Ok(ScheduleEntry {
                    owner_id: OwnerId::new(row.try_get::<i64, _>("user_id").map_err(storage)? as u64),
                    target_id: TargetId::new(row.try_get::<i64, _>("plugin_id").map_err(storage)? as u64),
                    target_name: row.try_get("plugin_name").map_err(storage)?,
                    cron_expr: row
                        .try_get::<Option<String>, _>("cron_expression")
                        .map_err(storage)?
                        .unwrap_or_default(),
                    timezone: row
                        .try_get::<Option<String>, _>("timezone")
                        .map_err(storage)?
                        .unwrap_or_default(),
                    enabled: true,
                    settings,
                })
            })
            .collect()
    }
}
