use chrono::{DateTime, Utc};
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::Error as SqlxError;
use std::time::Duration;
use tracing::{error, info};

use crate::db::store::{SessionStore, StoreError, StoreFuture};
use crate::models::{SessionPatch, SessionRecord, SessionStatus, UsageMetric};

const SCHEMA_SQL: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS collab_sessions (
        id TEXT PRIMARY KEY,
        status TEXT,
        scheduled_end_time TIMESTAMPTZ,
        extension_count INTEGER NOT NULL DEFAULT 0,
        ended_at TIMESTAMPTZ,
        ended_by TEXT,
        end_reason TEXT,
        code TEXT,
        language TEXT,
        updated_at TIMESTAMPTZ NOT NULL DEFAULT now()
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS user_usage_metrics (
        user_id TEXT NOT NULL,
        metric TEXT NOT NULL,
        value BIGINT NOT NULL DEFAULT 0,
        updated_at TIMESTAMPTZ NOT NULL DEFAULT now(),
        PRIMARY KEY (user_id, metric)
    )
    "#,
];

/// Session Row from database
#[derive(Debug, Clone, sqlx::FromRow)]
struct SessionRow {
    id: String,
    status: Option<String>,
    scheduled_end_time: Option<DateTime<Utc>>,
    extension_count: i32,
    ended_at: Option<DateTime<Utc>>,
    ended_by: Option<String>,
    end_reason: Option<String>,
    code: Option<String>,
    language: Option<String>,
    updated_at: DateTime<Utc>,
}

impl TryFrom<SessionRow> for SessionRecord {
    type Error = StoreError;

    fn try_from(row: SessionRow) -> Result<Self, Self::Error> {
        let status = match row.status.as_deref() {
            Some(raw) => Some(
                SessionStatus::parse(raw)
                    .ok_or_else(|| StoreError::Corrupt(format!("unknown session status '{}'", raw)))?,
            ),
            None => None,
        };
        Ok(SessionRecord {
            id: row.id,
            status,
            scheduled_end_time: row.scheduled_end_time,
            extension_count: row.extension_count,
            ended_at: row.ended_at,
            ended_by: row.ended_by,
            end_reason: row.end_reason,
            code: row.code,
            language: row.language,
            updated_at: Some(row.updated_at),
        })
    }
}

/// Postgres backed session store
pub struct PgSessionStore {
    pool: PgPool,
}

impl PgSessionStore {
    /// Create a new database connection pool
    pub async fn connect(database_url: &str) -> Result<Self, SqlxError> {
        info!("Connecting to database...");

        let pool = PgPoolOptions::new()
            .max_connections(20)
            .min_connections(2)
            .acquire_timeout(Duration::from_secs(30))
            .idle_timeout(Duration::from_secs(600))
            .max_lifetime(Duration::from_secs(1800))
            .connect(database_url)
            .await?;

        info!("Database connection pool created successfully");

        Ok(Self { pool })
    }

    /// Create the session and metric tables when missing
    pub async fn ensure_schema(&self) -> Result<(), SqlxError> {
        for statement in SCHEMA_SQL {
            sqlx::query(statement).execute(&self.pool).await?;
        }
        info!("Session schema ready");
        Ok(())
    }

    async fn fetch_session(&self, session_id: &str) -> Result<Option<SessionRecord>, StoreError> {
        let row = sqlx::query_as::<_, SessionRow>(
            r#"
            SELECT id, status, scheduled_end_time, extension_count, ended_at,
                   ended_by, end_reason, code, language, updated_at
            FROM collab_sessions
            WHERE id = $1
            "#,
        )
        .bind(session_id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(SessionRecord::try_from).transpose()
    }

    async fn upsert_session(&self, session_id: &str, patch: SessionPatch) -> Result<(), StoreError> {
        // NULL parameters keep the stored column
        let query_sql = r#"
            INSERT INTO collab_sessions
                (id, status, scheduled_end_time, extension_count, ended_at, ended_by, end_reason, code, language, updated_at)
            VALUES ($1, $2, $3, COALESCE($4, 0), $5, $6, $7, $8, $9, now())
            ON CONFLICT (id) DO UPDATE SET
                status = COALESCE($2, collab_sessions.status),
                scheduled_end_time = COALESCE($3, collab_sessions.scheduled_end_time),
                extension_count = COALESCE($4, collab_sessions.extension_count),
                ended_at = COALESCE($5, collab_sessions.ended_at),
                ended_by = COALESCE($6, collab_sessions.ended_by),
                end_reason = COALESCE($7, collab_sessions.end_reason),
                code = COALESCE($8, collab_sessions.code),
                language = COALESCE($9, collab_sessions.language),
                updated_at = now()
        "#;

        let result = sqlx::query(query_sql)
            .bind(session_id)
            .bind(patch.status.map(|s| s.as_str()))
            .bind(patch.scheduled_end_time)
            .bind(patch.extension_count)
            .bind(patch.ended_at)
            .bind(patch.ended_by)
            .bind(patch.end_reason)
            .bind(patch.code)
            .bind(patch.language)
            .execute(&self.pool)
            .await;

        if let Err(e) = result {
            error!(
                "Failed to upsert session {}: {}. Pool state: {} idle, {} total",
                session_id,
                e,
                self.pool.num_idle(),
                self.pool.size()
            );
            return Err(e.into());
        }
        Ok(())
    }

    async fn add_metric(&self, user_id: &str, metric: UsageMetric, amount: i64) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO user_usage_metrics (user_id, metric, value, updated_at)
            VALUES ($1, $2, $3, now())
            ON CONFLICT (user_id, metric) DO UPDATE SET
                value = user_usage_metrics.value + EXCLUDED.value,
                updated_at = now()
            "#,
        )
        .bind(user_id)
        .bind(metric.as_str())
        .bind(amount)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

impl SessionStore for PgSessionStore {
    fn kind(&self) -> &'static str {
        "postgres"
    }

    fn get_session<'a>(&'a self, session_id: &'a str) -> StoreFuture<'a, Option<SessionRecord>> {
        Box::pin(self.fetch_session(session_id))
    }

    fn update_session<'a>(&'a self, session_id: &'a str, patch: SessionPatch) -> StoreFuture<'a, ()> {
        Box::pin(self.upsert_session(session_id, patch))
    }

    fn increment_user_metric<'a>(
        &'a self,
        user_id: &'a str,
        metric: UsageMetric,
        amount: i64,
    ) -> StoreFuture<'a, ()> {
        Box::pin(self.add_metric(user_id, metric, amount))
    }
}
