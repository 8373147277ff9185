//! Persistence seams for the registry, the processing lock and the file queue.
//!
//! The services in this crate only check invariants and shape records; everything that touches
//! storage goes through these traits, so the same rules apply whether the backing store is
//! PostgreSQL or the in-memory tables used in tests.
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::stream::BoxStream;
use thiserror::Error;

use crate::file_queue::{NewQueueEntry, QueueEntry};
use crate::registry::{ChunkRecord, NewChunkRecord, RangeQuery};

mod memory;
mod pg;

pub use memory::MemoryStore;
pub use pg::{PgStore, PoolConfig};

/// Enumeration of errors for storage operations.
/// Errors can originate from sqlx and are wrapped by us to provide additional context.
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("pool creation failed with: {error}")]
    PoolCreationError { error: sqlx::Error },
    #[error("{command} query failed with: {error}")]
    QueryError { command: String, error: sqlx::Error },
    #[error("migrations failed with: {error}")]
    MigrationError { error: sqlx::migrate::MigrateError },
    #[error("no chunk with id {0} exists")]
    ChunkNotFound(i64),
    #[error("no queued file with id {0} exists")]
    QueueEntryNotFound(i64),
}

pub type StoreResult<T> = std::result::Result<T, StoreError>;

#[async_trait]
pub trait ChunkStore: Send + Sync {
    async fn insert_chunk(&self, chunk: NewChunkRecord) -> StoreResult<ChunkRecord>;

    /// Persist a new hash for an existing chunk, returning the new `last_updated` stamp.
    async fn update_chunk_hash(&self, id: i64, chunk_hash: &str) -> StoreResult<DateTime<Utc>>;

    async fn find_chunk_by_path(&self, chunk_path: &str) -> StoreResult<Option<ChunkRecord>>;

    fn chunks_in_range<'a>(
        &'a self,
        query: RangeQuery,
    ) -> BoxStream<'a, StoreResult<ChunkRecord>>;
}

#[async_trait]
pub trait LockStore: Send + Sync {
    /// Insert the lock row stamped with `lock_time` unless one already exists.
    /// This must be a single atomic operation: `Some` means this caller now holds the lock.
    async fn insert_lock_if_absent(
        &self,
        lock_time: DateTime<Utc>,
    ) -> StoreResult<Option<DateTime<Utc>>>;

    async fn delete_lock(&self) -> StoreResult<u64>;

    async fn current_lock_time(&self) -> StoreResult<Option<DateTime<Utc>>>;
}

#[async_trait]
pub trait FileQueueStore: Send + Sync {
    async fn insert_file(&self, entry: NewQueueEntry) -> StoreResult<QueueEntry>;

    async fn pending_files(&self, limit: i64) -> StoreResult<Vec<QueueEntry>>;

    async fn delete_file(&self, id: i64) -> StoreResult<()>;
}

/// Resolves public study identifiers to internal primary keys.
#[async_trait]
pub trait StudyDirectory: Send + Sync {
    async fn study_pk(&self, object_id: &str) -> StoreResult<Option<i64>>;
}
