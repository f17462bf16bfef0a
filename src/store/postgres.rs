//! Postgres-backed document store.
//!
//! Plain `query_as` with binds (no compile-time checked macros), one pool
//! shared by every hub. Cascade deletes flow from rooms → files →
//! file_versions, so deleting a room on the facade revokes everything the
//! hub could still reference.

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use uuid::Uuid;

use super::{DocumentStore, File, FileVersion, StoreError, VERSION_RING};

const SCHEMA: &[&str] = &[
    "CREATE TABLE IF NOT EXISTS users (
        id UUID PRIMARY KEY,
        username TEXT NOT NULL UNIQUE
    )",
    "CREATE TABLE IF NOT EXISTS rooms (
        id UUID PRIMARY KEY,
        name TEXT NOT NULL,
        owner_id UUID NOT NULL REFERENCES users(id),
        invite_code TEXT NOT NULL UNIQUE,
        created_at TIMESTAMPTZ NOT NULL DEFAULT now()
    )",
    "CREATE TABLE IF NOT EXISTS room_members (
        room_id UUID NOT NULL REFERENCES rooms(id) ON DELETE CASCADE,
        user_id UUID NOT NULL REFERENCES users(id) ON DELETE CASCADE,
        PRIMARY KEY (room_id, user_id)
    )",
    "CREATE TABLE IF NOT EXISTS files (
        id UUID PRIMARY KEY,
        room_id UUID NOT NULL REFERENCES rooms(id) ON DELETE CASCADE,
        name TEXT NOT NULL,
        content TEXT NOT NULL DEFAULT '',
        language TEXT NOT NULL DEFAULT 'plaintext',
        created_at TIMESTAMPTZ NOT NULL,
        updated_at TIMESTAMPTZ NOT NULL,
        UNIQUE (room_id, name)
    )",
    "CREATE TABLE IF NOT EXISTS file_versions (
        id UUID PRIMARY KEY,
        file_id UUID NOT NULL REFERENCES files(id) ON DELETE CASCADE,
        content TEXT NOT NULL,
        user_id UUID NOT NULL,
        created_at TIMESTAMPTZ NOT NULL,
        UNIQUE (file_id, created_at)
    )",
    "CREATE INDEX IF NOT EXISTS idx_file_versions_recent
        ON file_versions (file_id, created_at DESC)",
];

type FileRow = (
    Uuid,
    Uuid,
    String,
    String,
    String,
    DateTime<Utc>,
    DateTime<Utc>,
);

fn file_from_row(row: FileRow) -> File {
    File {
        id: row.0,
        room_id: row.1,
        name: row.2,
        content: row.3,
        language: row.4,
        created_at: row.5,
        updated_at: row.6,
    }
}

fn map_err(e: sqlx::Error) -> StoreError {
    match e {
        sqlx::Error::RowNotFound => StoreError::NotFound,
        sqlx::Error::Database(db) if db.is_unique_violation() => StoreError::Conflict,
        sqlx::Error::Io(io) => StoreError::Transient(io.to_string()),
        sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed => {
            StoreError::Transient(e.to_string())
        }
        other => StoreError::Fatal(other.to_string()),
    }
}

/// Postgres store over a shared pool.
pub struct PostgresStore {
    pool: PgPool,
}

impl PostgresStore {
    /// Connect and run the idempotent schema migration.
    pub async fn connect(url: &str) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(10)
            .min_connections(1)
            .acquire_timeout(std::time::Duration::from_secs(5))
            .connect(url)
            .await
            .map_err(map_err)?;
        let store = Self { pool };
        store.migrate().await?;
        Ok(store)
    }

    async fn migrate(&self) -> Result<(), StoreError> {
        for statement in SCHEMA {
            sqlx::query(statement)
                .execute(&self.pool)
                .await
                .map_err(map_err)?;
        }
        Ok(())
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[async_trait]
impl DocumentStore for PostgresStore {
    async fn load_file(&self, file_id: Uuid) -> Result<File, StoreError> {
        let row: FileRow = sqlx::query_as(
            "SELECT id, room_id, name, content, language, created_at, updated_at
             FROM files WHERE id = $1",
        )
        .bind(file_id)
        .fetch_one(&self.pool)
        .await
        .map_err(map_err)?;
        Ok(file_from_row(row))
    }

    async fn save_content(&self, file_id: Uuid, content: &str) -> Result<(), StoreError> {
        let result = sqlx::query(
            "UPDATE files SET content = $1, updated_at = $2 WHERE id = $3",
        )
        .bind(content)
        .bind(Utc::now())
        .bind(file_id)
        .execute(&self.pool)
        .await
        .map_err(map_err)?;
        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound);
        }
        Ok(())
    }

    async fn append_version(
        &self,
        file_id: Uuid,
        prior_content: &str,
        user_id: Uuid,
    ) -> Result<(), StoreError> {
        // Second-granularity stamp + ON CONFLICT DO NOTHING makes a retried
        // append land on the same row instead of duplicating it.
        let stamp = Utc
            .timestamp_opt(Utc::now().timestamp(), 0)
            .single()
            .unwrap_or_else(Utc::now);
        sqlx::query(
            "INSERT INTO file_versions (id, file_id, content, user_id, created_at)
             VALUES ($1, $2, $3, $4, $5)
             ON CONFLICT (file_id, created_at) DO NOTHING",
        )
        .bind(Uuid::new_v4())
        .bind(file_id)
        .bind(prior_content)
        .bind(user_id)
        .bind(stamp)
        .execute(&self.pool)
        .await
        .map_err(map_err)?;
        Ok(())
    }

    async fn list_versions(&self, file_id: Uuid) -> Result<Vec<FileVersion>, StoreError> {
        let rows: Vec<(Uuid, Uuid, String, Uuid, DateTime<Utc>)> = sqlx::query_as(
            "SELECT id, file_id, content, user_id, created_at
             FROM file_versions WHERE file_id = $1
             ORDER BY created_at DESC LIMIT $2",
        )
        .bind(file_id)
        .bind(VERSION_RING)
        .fetch_all(&self.pool)
        .await
        .map_err(map_err)?;
        Ok(rows
            .into_iter()
            .map(|(id, file_id, content, user_id, created_at)| FileVersion {
                id,
                file_id,
                content,
                user_id,
                created_at,
            })
            .collect())
    }

    async fn list_files(&self, room_id: Uuid) -> Result<Vec<File>, StoreError> {
        let rows: Vec<FileRow> = sqlx::query_as(
            "SELECT id, room_id, name, content, language, created_at, updated_at
             FROM files WHERE room_id = $1 ORDER BY name",
        )
        .bind(room_id)
        .fetch_all(&self.pool)
        .await
        .map_err(map_err)?;
        Ok(rows.into_iter().map(file_from_row).collect())
    }

    async fn create_file(
        &self,
        room_id: Uuid,
        name: &str,
        language: &str,
    ) -> Result<File, StoreError> {
        let now = Utc::now();
        let row: FileRow = sqlx::query_as(
            "INSERT INTO files (id, room_id, name, content, language, created_at, updated_at)
             VALUES ($1, $2, $3, '', $4, $5, $5)
             RETURNING id, room_id, name, content, language, created_at, updated_at",
        )
        .bind(Uuid::new_v4())
        .bind(room_id)
        .bind(name)
        .bind(language)
        .bind(now)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| match map_err(e) {
            // Unknown room trips the FK, not a unique constraint.
            StoreError::Fatal(msg) if msg.contains("foreign key") => StoreError::NotFound,
            other => other,
        })?;
        Ok(file_from_row(row))
    }

    async fn delete_file(&self, file_id: Uuid) -> Result<(), StoreError> {
        let result = sqlx::query("DELETE FROM files WHERE id = $1")
            .bind(file_id)
            .execute(&self.pool)
            .await
            .map_err(map_err)?;
        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound);
        }
        Ok(())
    }

    async fn room_member(&self, room_id: Uuid, user_id: Uuid) -> Result<bool, StoreError> {
        let row: (bool,) = sqlx::query_as(
            "SELECT EXISTS(SELECT 1 FROM room_members WHERE room_id = $1 AND user_id = $2)",
        )
        .bind(room_id)
        .bind(user_id)
        .fetch_one(&self.pool)
        .await
        .map_err(map_err)?;
        Ok(row.0)
    }
}
