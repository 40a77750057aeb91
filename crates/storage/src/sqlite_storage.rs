//! SQLite storage backend.
//!
//! The ledger table is unique on `event_id` and indexed by
//! `(student_id, section_id)`; snapshots are keyed by `(student_id,
//! course_id)`. This is the recommended backend for production use.

use async_trait::async_trait;
use coursetrack_core::{
    Course, CourseId, EventId, ProgressEvent, ProgressSnapshot, SectionId, StudentId,
    SyncQueueEntry,
};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::Row;
use std::path::Path;
use tracing::debug;

use super::trait_::{CourseStore, InsertOutcome, LedgerStore, QueueStore, Result, StorageError};

fn sql_err(e: sqlx::Error) -> StorageError {
    StorageError::Other(e.to_string())
}

/// SQLite storage implementation.
#[derive(Clone)]
pub struct SqliteStorage {
    /// Database connection pool
    pool: sqlx::SqlitePool,
}

impl SqliteStorage {
    /// Open (creating if missing) a database file.
    pub async fn new_from_path(path: &Path) -> Result<Self> {
        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true);
        let pool = SqlitePoolOptions::new()
            .connect_with(options)
            .await
            .map_err(sql_err)?;

        let storage = Self { pool };
        storage.init_schema().await?;

        Ok(storage)
    }

    /// Create an in-memory SQLite storage for testing.
    ///
    /// Limited to a single connection; every `:memory:` connection would
    /// otherwise see its own empty database.
    pub async fn in_memory() -> Result<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .map_err(sql_err)?;

        let storage = Self { pool };
        storage.init_schema().await?;

        Ok(storage)
    }

    /// Initialize the database schema.
    async fn init_schema(&self) -> Result<()> {
        let statements = [
            "CREATE TABLE IF NOT EXISTS ledger (
                seq INTEGER PRIMARY KEY AUTOINCREMENT,
                event_id TEXT NOT NULL UNIQUE,
                student_id TEXT NOT NULL,
                section_id TEXT NOT NULL,
                data TEXT NOT NULL,
                server_timestamp TEXT
            )",
            "CREATE INDEX IF NOT EXISTS idx_ledger_student_section
                ON ledger(student_id, section_id)",
            "CREATE TABLE IF NOT EXISTS snapshots (
                student_id TEXT NOT NULL,
                course_id TEXT NOT NULL,
                data TEXT NOT NULL,
                version INTEGER NOT NULL,
                updated_at TEXT NOT NULL,
                PRIMARY KEY (student_id, course_id)
            )",
            "CREATE TABLE IF NOT EXISTS courses (
                course_id TEXT PRIMARY KEY,
                version INTEGER NOT NULL,
                data TEXT NOT NULL
            )",
            "CREATE TABLE IF NOT EXISTS sync_queue (
                position INTEGER PRIMARY KEY,
                event_id TEXT NOT NULL UNIQUE,
                data TEXT NOT NULL
            )",
        ];

        for statement in statements {
            sqlx::query(statement)
                .execute(&self.pool)
                .await
                .map_err(sql_err)?;
        }

        Ok(())
    }

    fn decode<T: serde::de::DeserializeOwned>(row: &sqlx::sqlite::SqliteRow) -> Result<T> {
        let data: String = row.try_get("data").map_err(sql_err)?;
        Ok(serde_json::from_str(&data)?)
    }
}

#[async_trait]
impl LedgerStore for SqliteStorage {
    async fn insert_event(&self, event: &ProgressEvent) -> Result<InsertOutcome> {
        let data = serde_json::to_string(event)?;

        let result = sqlx::query(
            "INSERT OR IGNORE INTO ledger (event_id, student_id, section_id, data, server_timestamp)
            VALUES (?, ?, ?, ?, ?)",
        )
        .bind(event.event_id.to_string())
        .bind(event.student_id.as_str())
        .bind(event.section_id.as_str())
        .bind(data)
        .bind(event.server_timestamp.map(|t| t.to_rfc3339()))
        .execute(&self.pool)
        .await
        .map_err(sql_err)?;

        if result.rows_affected() == 1 {
            Ok(InsertOutcome::Inserted)
        } else {
            debug!(event_id = %event.event_id, "Ledger row already present");
            Ok(InsertOutcome::AlreadyPresent)
        }
    }

    async fn load_event(&self, id: EventId) -> Result<Option<ProgressEvent>> {
        let row = sqlx::query("SELECT data FROM ledger WHERE event_id = ?")
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await
            .map_err(sql_err)?;

        row.as_ref().map(Self::decode).transpose()
    }

    async fn list_student_events(&self, student: &StudentId) -> Result<Vec<ProgressEvent>> {
        let rows = sqlx::query("SELECT data FROM ledger WHERE student_id = ? ORDER BY seq")
            .bind(student.as_str())
            .fetch_all(&self.pool)
            .await
            .map_err(sql_err)?;

        rows.iter().map(Self::decode).collect()
    }

    async fn list_section_events(
        &self,
        student: &StudentId,
        section: &SectionId,
    ) -> Result<Vec<ProgressEvent>> {
        let rows = sqlx::query(
            "SELECT data FROM ledger WHERE student_id = ? AND section_id = ? ORDER BY seq",
        )
        .bind(student.as_str())
        .bind(section.as_str())
        .fetch_all(&self.pool)
        .await
        .map_err(sql_err)?;

        rows.iter().map(Self::decode).collect()
    }

    async fn save_snapshot(&self, snapshot: &ProgressSnapshot) -> Result<()> {
        let data = serde_json::to_string(snapshot)?;

        sqlx::query(
            "INSERT OR REPLACE INTO snapshots (student_id, course_id, data, version, updated_at)
            VALUES (?, ?, ?, ?, ?)",
        )
        .bind(snapshot.student_id.as_str())
        .bind(snapshot.course_id.as_str())
        .bind(data)
        .bind(snapshot.version as i64)
        .bind(chrono::Utc::now().to_rfc3339())
        .execute(&self.pool)
        .await
        .map_err(sql_err)?;

        Ok(())
    }

    async fn load_snapshot(
        &self,
        student: &StudentId,
        course: &CourseId,
    ) -> Result<Option<ProgressSnapshot>> {
        let row = sqlx::query("SELECT data FROM snapshots WHERE student_id = ? AND course_id = ?")
            .bind(student.as_str())
            .bind(course.as_str())
            .fetch_optional(&self.pool)
            .await
            .map_err(sql_err)?;

        row.as_ref().map(Self::decode).transpose()
    }

    async fn delete_snapshot(&self, student: &StudentId, course: &CourseId) -> Result<()> {
        sqlx::query("DELETE FROM snapshots WHERE student_id = ? AND course_id = ?")
            .bind(student.as_str())
            .bind(course.as_str())
            .execute(&self.pool)
            .await
            .map_err(sql_err)?;

        Ok(())
    }

    async fn health_check(&self) -> bool {
        sqlx::query("SELECT 1").fetch_one(&self.pool).await.is_ok()
    }
}

#[async_trait]
impl CourseStore for SqliteStorage {
    async fn save_course(&self, course: &Course) -> Result<()> {
        let data = serde_json::to_string(course)?;

        sqlx::query("INSERT OR REPLACE INTO courses (course_id, version, data) VALUES (?, ?, ?)")
            .bind(course.id.as_str())
            .bind(course.version as i64)
            .bind(data)
            .execute(&self.pool)
            .await
            .map_err(sql_err)?;

        Ok(())
    }

    async fn load_course(&self, id: &CourseId) -> Result<Option<Course>> {
        let row = sqlx::query("SELECT data FROM courses WHERE course_id = ?")
            .bind(id.as_str())
            .fetch_optional(&self.pool)
            .await
            .map_err(sql_err)?;

        row.as_ref().map(Self::decode).transpose()
    }

    async fn list_courses(&self) -> Result<Vec<Course>> {
        let rows = sqlx::query("SELECT data FROM courses ORDER BY course_id")
            .fetch_all(&self.pool)
            .await
            .map_err(sql_err)?;

        rows.iter().map(Self::decode).collect()
    }
}

#[async_trait]
impl QueueStore for SqliteStorage {
    async fn save_queue(&self, entries: &[SyncQueueEntry]) -> Result<()> {
        let mut tx = self.pool.begin().await.map_err(sql_err)?;

        sqlx::query("DELETE FROM sync_queue")
            .execute(&mut *tx)
            .await
            .map_err(sql_err)?;

        for (position, entry) in entries.iter().enumerate() {
            sqlx::query("INSERT INTO sync_queue (position, event_id, data) VALUES (?, ?, ?)")
                .bind(position as i64)
                .bind(entry.event_id().to_string())
                .bind(serde_json::to_string(entry)?)
                .execute(&mut *tx)
                .await
                .map_err(sql_err)?;
        }

        tx.commit().await.map_err(sql_err)?;
        Ok(())
    }

    async fn load_queue(&self) -> Result<Vec<SyncQueueEntry>> {
        let rows = sqlx::query("SELECT data FROM sync_queue ORDER BY position")
            .fetch_all(&self.pool)
            .await
            .map_err(sql_err)?;

        rows.iter().map(Self::decode).collect()
    }
}
