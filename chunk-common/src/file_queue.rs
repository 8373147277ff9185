use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;
use tracing::debug;

use crate::store::{FileQueueStore, StoreError, StudyDirectory};

pub const MAX_FILE_PATH_LENGTH: usize = 256;

/// Enumeration of errors for FileQueue operations.
#[derive(Error, Debug)]
pub enum QueueError {
    #[error("no study with object id {0} exists")]
    StudyNotFound(String),
    #[error("file path is {0} characters long, the maximum is 256")]
    FilePathTooLong(usize),
    #[error(transparent)]
    StoreError(#[from] StoreError),
}

/// A raw file waiting to be chunked.
#[derive(Debug, Clone, PartialEq, Serialize, sqlx::FromRow)]
pub struct QueueEntry {
    pub id: i64,
    /// Always starts with the owning study's object id.
    pub file_path: String,
    pub study_id: i64,
    pub participant_id: i64,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct NewQueueEntry {
    pub file_path: String,
    pub study_id: i64,
    pub participant_id: i64,
}

/// Prefix `file_path` with the study object id, unless it already is.
pub fn normalize_file_path(file_path: &str, study_object_id: &str) -> String {
    if file_path.starts_with(study_object_id) {
        file_path.to_owned()
    } else {
        format!("{study_object_id}/{file_path}")
    }
}

/// Append-only queue of raw files pending chunking.
#[derive(Clone)]
pub struct FileQueue<S> {
    store: S,
}

impl<S: FileQueueStore + StudyDirectory> FileQueue<S> {
    pub fn new(store: S) -> Self {
        Self { store }
    }

    /// Queue a raw file uploaded for a study, so every stored path names the study it belongs to.
    pub async fn enqueue(
        &self,
        file_path: &str,
        study_object_id: &str,
        participant_id: i64,
    ) -> Result<QueueEntry, QueueError> {
        let file_path = normalize_file_path(file_path, study_object_id);
        let length = file_path.chars().count();
        if length > MAX_FILE_PATH_LENGTH {
            return Err(QueueError::FilePathTooLong(length));
        }

        let study_id = self
            .store
            .study_pk(study_object_id)
            .await?
            .ok_or_else(|| QueueError::StudyNotFound(study_object_id.to_owned()))?;

        let entry = self
            .store
            .insert_file(NewQueueEntry {
                file_path,
                study_id,
                participant_id,
            })
            .await?;

        metrics::counter!("file_queue_enqueued_total").increment(1);
        debug!(entry_id = entry.id, file_path = %entry.file_path, "queued file for processing");

        Ok(entry)
    }

    /// The oldest `limit` files still waiting to be processed.
    pub async fn pending(&self, limit: i64) -> Result<Vec<QueueEntry>, QueueError> {
        Ok(self.store.pending_files(limit).await?)
    }

    /// Drop a processed file from the queue.
    pub async fn remove(&self, entry: &QueueEntry) -> Result<(), QueueError> {
        Ok(self.store.delete_file(entry.id).await?)
    }
}
