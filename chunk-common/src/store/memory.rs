use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::stream::{self, BoxStream, StreamExt};

use crate::file_queue::{NewQueueEntry, QueueEntry};
use crate::registry::{ChunkRecord, NewChunkRecord, RangeQuery};
use crate::store::{
    ChunkStore, FileQueueStore, LockStore, StoreError, StoreResult, StudyDirectory,
};

#[derive(Default)]
struct Tables {
    chunks: BTreeMap<i64, ChunkRecord>,
    files: BTreeMap<i64, QueueEntry>,
    studies: BTreeMap<String, i64>,
    // Participant primary key to (study primary key, public patient id).
    participants: BTreeMap<i64, (i64, String)>,
    lock_time: Option<DateTime<Utc>>,
    next_id: i64,
}

impl Tables {
    fn next_id(&mut self) -> i64 {
        self.next_id += 1;
        self.next_id
    }
}

/// In-process tables implementing every store trait. Clones share the same tables, which makes
/// it stand in for a database shared by several services within one process.
#[derive(Clone, Default)]
pub struct MemoryStore {
    tables: Arc<Mutex<Tables>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    // A poisoned mutex only means another thread panicked mid-operation; every operation
    // below leaves the tables consistent before it can panic.
    fn tables(&self) -> MutexGuard<'_, Tables> {
        match self.tables.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Register a study, returning its primary key.
    pub fn add_study(&self, object_id: &str) -> i64 {
        let mut tables = self.tables();
        if let Some(pk) = tables.studies.get(object_id) {
            return *pk;
        }
        let pk = tables.next_id();
        tables.studies.insert(object_id.to_owned(), pk);
        pk
    }

    /// Register a participant of a study by public id, returning its primary key.
    pub fn add_participant(&self, study_pk: i64, patient_id: &str) -> i64 {
        let mut tables = self.tables();
        if let Some((pk, _)) = tables
            .participants
            .iter()
            .find(|(_, (_, id))| id == patient_id)
        {
            return *pk;
        }
        let pk = tables.next_id();
        tables
            .participants
            .insert(pk, (study_pk, patient_id.to_owned()));
        pk
    }

    pub fn chunk_count(&self) -> usize {
        self.tables().chunks.len()
    }

    pub fn lock_count(&self) -> usize {
        usize::from(self.tables().lock_time.is_some())
    }
}

#[async_trait]
impl ChunkStore for MemoryStore {
    async fn insert_chunk(&self, chunk: NewChunkRecord) -> StoreResult<ChunkRecord> {
        let mut tables = self.tables();
        let now = Utc::now();
        let record = ChunkRecord {
            id: tables.next_id(),
            is_chunkable: chunk.is_chunkable,
            chunk_path: chunk.chunk_path,
            chunk_hash: chunk.chunk_hash,
            data_type: chunk.data_type,
            time_bin: chunk.time_bin,
            study_id: chunk.study_id,
            participant_id: chunk.participant_id,
            survey_id: chunk.survey_id,
            created_at: now,
            last_updated: now,
        };
        tables.chunks.insert(record.id, record.clone());
        Ok(record)
    }

    async fn update_chunk_hash(&self, id: i64, chunk_hash: &str) -> StoreResult<DateTime<Utc>> {
        let mut tables = self.tables();
        let record = tables
            .chunks
            .get_mut(&id)
            .ok_or(StoreError::ChunkNotFound(id))?;
        record.chunk_hash = chunk_hash.to_owned();
        record.last_updated = Utc::now();
        Ok(record.last_updated)
    }

    async fn find_chunk_by_path(&self, chunk_path: &str) -> StoreResult<Option<ChunkRecord>> {
        Ok(self
            .tables()
            .chunks
            .values()
            .find(|record| record.chunk_path == chunk_path)
            .cloned())
    }

    fn chunks_in_range<'a>(
        &'a self,
        query: RangeQuery,
    ) -> BoxStream<'a, StoreResult<ChunkRecord>> {
        let tables = self.tables();
        let matching: Vec<StoreResult<ChunkRecord>> = tables
            .chunks
            .values()
            .filter(|record| {
                let patient_id = tables
                    .participants
                    .get(&record.participant_id)
                    .map(|(_, patient_id)| patient_id.as_str());
                query.matches(record, patient_id)
            })
            .cloned()
            .map(Ok)
            .collect();

        stream::iter(matching).boxed()
    }
}

#[async_trait]
impl LockStore for MemoryStore {
    async fn insert_lock_if_absent(
        &self,
        lock_time: DateTime<Utc>,
    ) -> StoreResult<Option<DateTime<Utc>>> {
        let mut tables = self.tables();
        if tables.lock_time.is_some() {
            return Ok(None);
        }
        tables.lock_time = Some(lock_time);
        Ok(Some(lock_time))
    }

    async fn delete_lock(&self) -> StoreResult<u64> {
        Ok(u64::from(self.tables().lock_time.take().is_some()))
    }

    async fn current_lock_time(&self) -> StoreResult<Option<DateTime<Utc>>> {
        Ok(self.tables().lock_time)
    }
}

#[async_trait]
impl FileQueueStore for MemoryStore {
    async fn insert_file(&self, entry: NewQueueEntry) -> StoreResult<QueueEntry> {
        let mut tables = self.tables();
        let entry = QueueEntry {
            id: tables.next_id(),
            file_path: entry.file_path,
            study_id: entry.study_id,
            participant_id: entry.participant_id,
            created_at: Utc::now(),
        };
        tables.files.insert(entry.id, entry.clone());
        Ok(entry)
    }

    async fn pending_files(&self, limit: i64) -> StoreResult<Vec<QueueEntry>> {
        let limit = usize::try_from(limit).unwrap_or(0);
        Ok(self.tables().files.values().take(limit).cloned().collect())
    }

    async fn delete_file(&self, id: i64) -> StoreResult<()> {
        self.tables()
            .files
            .remove(&id)
            .map(|_| ())
            .ok_or(StoreError::QueueEntryNotFound(id))
    }
}

#[async_trait]
impl StudyDirectory for MemoryStore {
    async fn study_pk(&self, object_id: &str) -> StoreResult<Option<i64>> {
        Ok(self.tables().studies.get(object_id).copied())
    }
}
