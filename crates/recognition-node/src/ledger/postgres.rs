use crate::sources::{InsertOutcome, LedgerStore};
use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use common::attendance::AttendanceRecord;
use sqlx::{PgPool, Row};

/// Postgres ledger. The `(identity_id, day)` primary key of the `attendance`
/// table is the authoritative dedup guard across nodes.
#[derive(Clone)]
pub struct PgLedgerStore {
    pool: PgPool,
}

impl PgLedgerStore {
    pub async fn connect(database_url: &str) -> Result<Self> {
        let pool = PgPool::connect(database_url)
            .await
            .context("failed to connect to database")?;

        sqlx::migrate!("./migrations")
            .run(&pool)
            .await
            .context("failed to run migrations")?;

        Ok(Self { pool })
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

fn is_unique_violation(err: &sqlx::Error) -> bool {
    matches!(err, sqlx::Error::Database(db) if db.code().as_deref() == Some("23505"))
}

#[async_trait]
impl LedgerStore for PgLedgerStore {
    async fn has_record(&self, identity_id: &str, day: NaiveDate) -> Result<bool> {
        let row = sqlx::query("SELECT 1 FROM attendance WHERE identity_id = $1 AND day = $2")
            .bind(identity_id)
            .bind(day)
            .fetch_optional(&self.pool)
            .await
            .context("failed to look up attendance")?;
        Ok(row.is_some())
    }

    async fn insert_record(&self, record: &AttendanceRecord) -> Result<InsertOutcome> {
        let result = sqlx::query(
            r#"
            INSERT INTO attendance (identity_id, day, recorded_at, camera_id, confidence, status)
            VALUES ($1, $2, $3, $4, $5, 'present')
            ON CONFLICT (identity_id, day) DO NOTHING
            "#,
        )
        .bind(&record.identity_id)
        .bind(record.day)
        .bind(record.recorded_at)
        .bind(&record.camera_id)
        .bind(record.confidence)
        .execute(&self.pool)
        .await;

        match result {
            Ok(done) if done.rows_affected() == 0 => Ok(InsertOutcome::Duplicate),
            Ok(_) => Ok(InsertOutcome::Inserted),
            Err(e) if is_unique_violation(&e) => Ok(InsertOutcome::Duplicate),
            Err(e) => Err(e).context("failed to insert attendance"),
        }
    }

    async fn list_day(&self, day: NaiveDate) -> Result<Vec<AttendanceRecord>> {
        let rows = sqlx::query(
            r#"
            SELECT identity_id, day, recorded_at, camera_id, confidence
            FROM attendance
            WHERE day = $1
            ORDER BY recorded_at
            "#,
        )
        .bind(day)
        .fetch_all(&self.pool)
        .await
        .context("failed to list attendance")?;

        rows.iter()
            .map(|row| -> Result<AttendanceRecord> {
                Ok(AttendanceRecord {
                    identity_id: row.try_get("identity_id")?,
                    day: row.try_get::<NaiveDate, _>("day")?,
                    recorded_at: row.try_get::<DateTime<Utc>, _>("recorded_at")?,
                    camera_id: row.try_get("camera_id")?,
                    confidence: row.try_get("confidence")?,
                })
            })
            .collect()
    }

    async fn health_check(&self) -> Result<bool> {
        sqlx::query("SELECT 1")
            .execute(&self.pool)
            .await
            .context("database health check failed")?;
        Ok(true)
    }
}
