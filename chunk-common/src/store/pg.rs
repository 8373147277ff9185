use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::stream::{BoxStream, StreamExt, TryStreamExt};
use serde::{Deserialize, Serialize};
use sqlx::postgres::{PgPool, PgPoolOptions};

use crate::file_queue::{NewQueueEntry, QueueEntry};
use crate::registry::{ChunkRecord, NewChunkRecord, RangeQuery};
use crate::store::{
    ChunkStore, FileQueueStore, LockStore, StoreError, StoreResult, StudyDirectory,
};

// A pool config object, designed to be passable across API boundaries
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct PoolConfig {
    pub db_url: String,
    pub max_connections: Option<u32>,         // Default to 10
    pub min_connections: Option<u32>,         // Default to 1
    pub acquire_timeout_seconds: Option<u64>, // Default to 30
    pub max_lifetime_seconds: Option<u64>,    // Default to 300
    pub idle_timeout_seconds: Option<u64>,    // Default to 60
}

impl PoolConfig {
    pub async fn connect(&self) -> Result<PgPool, sqlx::Error> {
        PgPoolOptions::new()
            .max_connections(self.max_connections.unwrap_or(10))
            .min_connections(self.min_connections.unwrap_or(1))
            .max_lifetime(Duration::from_secs(
                self.max_lifetime_seconds.unwrap_or(300),
            ))
            .idle_timeout(Duration::from_secs(self.idle_timeout_seconds.unwrap_or(60)))
            .acquire_timeout(Duration::from_secs(
                self.acquire_timeout_seconds.unwrap_or(30),
            ))
            .connect(&self.db_url)
            .await
    }
}

const CHUNK_COLUMNS: &str = "id, is_chunkable, chunk_path, chunk_hash, data_type, time_bin, study_id, participant_id, survey_id, created_at, last_updated";

/// Every store trait implemented on top of PostgreSQL tables.
#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub async fn new(config: &PoolConfig) -> StoreResult<Self> {
        let pool = config
            .connect()
            .await
            .map_err(|error| StoreError::PoolCreationError { error })?;

        Ok(Self { pool })
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn run_migrations(&self) -> StoreResult<()> {
        sqlx::migrate!("../migrations")
            .run(&self.pool)
            .await
            .map_err(|error| StoreError::MigrationError { error })
    }
}

fn query_error(command: &str) -> impl Fn(sqlx::Error) -> StoreError + '_ {
    move |error| StoreError::QueryError {
        command: command.to_owned(),
        error,
    }
}

#[async_trait]
impl ChunkStore for PgStore {
    async fn insert_chunk(&self, chunk: NewChunkRecord) -> StoreResult<ChunkRecord> {
        let query = format!(
            r#"
INSERT INTO chunk_registry
    (is_chunkable, chunk_path, chunk_hash, data_type, time_bin, study_id, participant_id, survey_id)
VALUES
    ($1, $2, $3, $4, $5, $6, $7, $8)
RETURNING {CHUNK_COLUMNS}
            "#
        );

        sqlx::query_as::<_, ChunkRecord>(&query)
            .bind(chunk.is_chunkable)
            .bind(&chunk.chunk_path)
            .bind(&chunk.chunk_hash)
            .bind(&chunk.data_type)
            .bind(chunk.time_bin)
            .bind(chunk.study_id)
            .bind(chunk.participant_id)
            .bind(chunk.survey_id)
            .fetch_one(&self.pool)
            .await
            .map_err(query_error("INSERT"))
    }

    async fn update_chunk_hash(&self, id: i64, chunk_hash: &str) -> StoreResult<DateTime<Utc>> {
        let last_updated: Option<DateTime<Utc>> = sqlx::query_scalar(
            r#"
UPDATE chunk_registry
SET chunk_hash = $2, last_updated = NOW()
WHERE id = $1
RETURNING last_updated
            "#,
        )
        .bind(id)
        .bind(chunk_hash)
        .fetch_optional(&self.pool)
        .await
        .map_err(query_error("UPDATE"))?;

        last_updated.ok_or(StoreError::ChunkNotFound(id))
    }

    async fn find_chunk_by_path(&self, chunk_path: &str) -> StoreResult<Option<ChunkRecord>> {
        let query = format!(
            "SELECT {CHUNK_COLUMNS} FROM chunk_registry WHERE chunk_path = $1 ORDER BY id LIMIT 1"
        );

        sqlx::query_as::<_, ChunkRecord>(&query)
            .bind(chunk_path)
            .fetch_optional(&self.pool)
            .await
            .map_err(query_error("SELECT"))
    }

    fn chunks_in_range<'a>(
        &'a self,
        query: RangeQuery,
    ) -> BoxStream<'a, StoreResult<ChunkRecord>> {
        // NULL parameters disable their filter, so one statement covers every combination.
        sqlx::query_as::<_, ChunkRecord>(
            r#"
SELECT
    id, is_chunkable, chunk_path, chunk_hash, data_type, time_bin, study_id, participant_id,
    survey_id, created_at, last_updated
FROM
    chunk_registry
WHERE
    study_id = $1
    AND (
        $2::TEXT[] IS NULL
        OR participant_id IN (SELECT id FROM participants WHERE patient_id = ANY($2))
    )
    AND ($3::TEXT[] IS NULL OR data_type = ANY($3))
    AND ($4::TIMESTAMPTZ IS NULL OR time_bin >= $4)
    AND ($5::TIMESTAMPTZ IS NULL OR time_bin <= $5)
            "#,
        )
        .bind(query.study_id)
        .bind(query.patient_ids)
        .bind(query.data_types)
        .bind(query.start)
        .bind(query.end)
        .fetch(&self.pool)
        .map_err(query_error("SELECT"))
        .boxed()
    }
}

#[async_trait]
impl LockStore for PgStore {
    async fn insert_lock_if_absent(
        &self,
        lock_time: DateTime<Utc>,
    ) -> StoreResult<Option<DateTime<Utc>>> {
        sqlx::query_scalar(
            r#"
INSERT INTO file_process_lock (id, lock_time)
VALUES (1, $1)
ON CONFLICT (id) DO NOTHING
RETURNING lock_time
            "#,
        )
        .bind(lock_time)
        .fetch_optional(&self.pool)
        .await
        .map_err(query_error("INSERT"))
    }

    async fn delete_lock(&self) -> StoreResult<u64> {
        let result = sqlx::query("DELETE FROM file_process_lock")
            .execute(&self.pool)
            .await
            .map_err(query_error("DELETE"))?;

        Ok(result.rows_affected())
    }

    async fn current_lock_time(&self) -> StoreResult<Option<DateTime<Utc>>> {
        sqlx::query_scalar("SELECT lock_time FROM file_process_lock WHERE id = 1")
            .fetch_optional(&self.pool)
            .await
            .map_err(query_error("SELECT"))
    }
}

#[async_trait]
impl FileQueueStore for PgStore {
    async fn insert_file(&self, entry: NewQueueEntry) -> StoreResult<QueueEntry> {
        sqlx::query_as::<_, QueueEntry>(
            r#"
INSERT INTO files_to_process
    (file_path, study_id, participant_id)
VALUES
    ($1, $2, $3)
RETURNING id, file_path, study_id, participant_id, created_at
            "#,
        )
        .bind(&entry.file_path)
        .bind(entry.study_id)
        .bind(entry.participant_id)
        .fetch_one(&self.pool)
        .await
        .map_err(query_error("INSERT"))
    }

    async fn pending_files(&self, limit: i64) -> StoreResult<Vec<QueueEntry>> {
        sqlx::query_as::<_, QueueEntry>(
            r#"
SELECT id, file_path, study_id, participant_id, created_at
FROM files_to_process
ORDER BY id
LIMIT $1
            "#,
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .map_err(query_error("SELECT"))
    }

    async fn delete_file(&self, id: i64) -> StoreResult<()> {
        let result = sqlx::query("DELETE FROM files_to_process WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(query_error("DELETE"))?;

        if result.rows_affected() == 0 {
            return Err(StoreError::QueueEntryNotFound(id));
        }
        Ok(())
    }
}

#[async_trait]
impl StudyDirectory for PgStore {
    async fn study_pk(&self, object_id: &str) -> StoreResult<Option<i64>> {
        sqlx::query_scalar("SELECT id FROM studies WHERE object_id = $1")
            .bind(object_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(query_error("SELECT"))
    }
}
