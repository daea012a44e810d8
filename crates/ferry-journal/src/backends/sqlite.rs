//! SQLite backend implementation
//!
//! Provides persistent storage using SQLite with WAL mode for concurrency.
//! This is the default backend.

use crate::{Execution, ExecutionId, ExecutionStatus, StepJournal, StepRecord};
use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions, SqliteRow};
use sqlx::{migrate::MigrateDatabase, Row};
use std::str::FromStr;
use uuid::Uuid;

/// SQLite-backed step journal
pub struct SqliteJournal {
    pool: SqlitePool,
}

impl SqliteJournal {
    /// Open or create a SQLite database at the specified path
    ///
    /// Automatically runs migrations to set up the schema.
    pub async fn open(path: &str) -> Result<Self> {
        let db_url = if path.starts_with("sqlite://") {
            path.to_string()
        } else {
            format!("sqlite://{}", path)
        };

        if !sqlx::Sqlite::database_exists(&db_url).await.unwrap_or(false) {
            sqlx::Sqlite::create_database(&db_url)
                .await
                .context("Failed to create database")?;
        }

        // WAL lets concurrent part steps record while readers replay
        let options = SqliteConnectOptions::from_str(&db_url)?
            .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal)
            .foreign_keys(true)
            .create_if_missing(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await
            .context("Failed to connect to database")?;

        sqlx::migrate!("./migrations")
            .run(&pool)
            .await
            .context("Failed to run migrations")?;

        Ok(Self { pool })
    }

    /// Get the underlying pool (for advanced usage)
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

fn parse_timestamp(value: &str) -> Result<DateTime<Utc>> {
    Ok(DateTime::parse_from_rfc3339(value)
        .with_context(|| format!("Invalid timestamp: {}", value))?
        .with_timezone(&Utc))
}

fn parse_id(value: &str) -> Result<ExecutionId> {
    Uuid::parse_str(value).with_context(|| format!("Invalid execution id: {}", value))
}

fn row_to_execution(row: &SqliteRow) -> Result<Execution> {
    let id: String = row.try_get("id")?;
    let status: String = row.try_get("status")?;
    let created_at: String = row.try_get("created_at")?;
    let updated_at: String = row.try_get("updated_at")?;

    Ok(Execution {
        id: parse_id(&id)?,
        key: row.try_get("key")?,
        status: ExecutionStatus::from_str(&status)?,
        error: row.try_get("error")?,
        created_at: parse_timestamp(&created_at)?,
        updated_at: parse_timestamp(&updated_at)?,
    })
}

fn row_to_step(row: &SqliteRow) -> Result<StepRecord> {
    let execution_id: String = row.try_get("execution_id")?;
    let recorded_at: String = row.try_get("recorded_at")?;

    Ok(StepRecord {
        execution_id: parse_id(&execution_id)?,
        step: row.try_get("step")?,
        output: row.try_get("output")?,
        recorded_at: parse_timestamp(&recorded_at)?,
    })
}

#[async_trait]
impl StepJournal for SqliteJournal {
    async fn create_execution(&self, key: &str) -> Result<ExecutionId> {
        let execution = Execution::new(key);

        sqlx::query(
            "INSERT INTO executions (id, key, status, error, created_at, updated_at)
             VALUES (?, ?, ?, NULL, ?, ?)",
        )
        .bind(execution.id.to_string())
        .bind(&execution.key)
        .bind(execution.status.to_string())
        .bind(execution.created_at.to_rfc3339())
        .bind(execution.updated_at.to_rfc3339())
        .execute(&self.pool)
        .await
        .context("Failed to create execution")?;

        Ok(execution.id)
    }

    async fn get_execution(&self, id: ExecutionId) -> Result<Option<Execution>> {
        let row = sqlx::query(
            "SELECT id, key, status, error, created_at, updated_at FROM executions WHERE id = ?",
        )
        .bind(id.to_string())
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(r) => Ok(Some(row_to_execution(&r)?)),
            None => Ok(None),
        }
    }

    async fn set_status(
        &self,
        id: ExecutionId,
        status: ExecutionStatus,
        error: Option<String>,
    ) -> Result<()> {
        let result = sqlx::query(
            "UPDATE executions SET status = ?, error = ?, updated_at = ? WHERE id = ?",
        )
        .bind(status.to_string())
        .bind(error)
        .bind(Utc::now().to_rfc3339())
        .bind(id.to_string())
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(anyhow::anyhow!("Execution not found: {}", id));
        }
        Ok(())
    }

    async fn terminate(&self, id: ExecutionId) -> Result<bool> {
        // Single statement so a concurrent completion cannot be overwritten
        let result = sqlx::query(
            "UPDATE executions SET status = 'terminated', updated_at = ?
             WHERE id = ? AND status IN ('queued', 'running')",
        )
        .bind(Utc::now().to_rfc3339())
        .bind(id.to_string())
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 1 {
            return Ok(true);
        }

        match self.get_execution(id).await? {
            Some(_) => Ok(false),
            None => Err(anyhow::anyhow!("Execution not found: {}", id)),
        }
    }

    async fn load_step(&self, id: ExecutionId, step: &str) -> Result<Option<StepRecord>> {
        let row = sqlx::query(
            "SELECT execution_id, step, output, recorded_at FROM steps
             WHERE execution_id = ? AND step = ?",
        )
        .bind(id.to_string())
        .bind(step)
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(r) => Ok(Some(row_to_step(&r)?)),
            None => Ok(None),
        }
    }

    async fn record_step(&self, id: ExecutionId, step: &str, output: &str) -> Result<()> {
        sqlx::query(
            "INSERT INTO steps (execution_id, step, output, recorded_at) VALUES (?, ?, ?, ?)
             ON CONFLICT (execution_id, step) DO NOTHING",
        )
        .bind(id.to_string())
        .bind(step)
        .bind(output)
        .bind(Utc::now().to_rfc3339())
        .execute(&self.pool)
        .await
        .with_context(|| format!("Failed to record step {} of {}", step, id))?;

        Ok(())
    }

    async fn list_steps(&self, id: ExecutionId) -> Result<Vec<StepRecord>> {
        let rows = sqlx::query(
            "SELECT execution_id, step, output, recorded_at FROM steps
             WHERE execution_id = ?
             ORDER BY step ASC",
        )
        .bind(id.to_string())
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(row_to_step).collect()
    }

    async fn delete_execution(&self, id: ExecutionId) -> Result<()> {
        let mut tx = self.pool.begin().await?;

        sqlx::query("DELETE FROM steps WHERE execution_id = ?")
            .bind(id.to_string())
            .execute(&mut *tx)
            .await?;

        sqlx::query("DELETE FROM executions WHERE id = ?")
            .bind(id.to_string())
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(())
    }
}
