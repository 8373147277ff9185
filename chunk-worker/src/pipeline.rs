use std::num::NonZeroU32;
use std::time;

use bytes::{Bytes, BytesMut};
use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use tokio::sync::Mutex;
use tracing::{error, info, warn};

use chunk_common::classifier::{Chunkability, StreamCatalog};
use chunk_common::file_queue::{FileQueue, QueueEntry};
use chunk_common::lock::{Acquisition, LockError, ProcessingLock};
use chunk_common::metrics::timing_guard;
use chunk_common::registry::{ChunkRegistry, NewChunk};
use chunk_common::store::{ChunkStore, FileQueueStore, LockStore, StudyDirectory};

use crate::blob::{BlobError, BlobStore};
use crate::error::PipelineError;

/// Prefix of every chunk path in blob storage.
pub const CHUNKS_FOLDER: &str = "CHUNKED_DATA";

/// Everything the pipeline needs from its backing store.
pub trait PipelineStore:
    ChunkStore + LockStore + FileQueueStore + StudyDirectory + Clone + 'static
{
}

impl<T> PipelineStore for T where
    T: ChunkStore + LockStore + FileQueueStore + StudyDirectory + Clone + 'static
{
}

/// A raw upload path: `{study}/{participant}/{data_type}/[...]/{timestamp_ms}.{extension}`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawFile {
    pub study_object_id: String,
    pub participant: String,
    pub data_type: String,
    pub timestamp: DateTime<Utc>,
}

impl RawFile {
    pub fn parse(file_path: &str) -> Result<Self, PipelineError> {
        let invalid = || PipelineError::InvalidFilePath(file_path.to_owned());

        let segments: Vec<&str> = file_path.split('/').collect();
        if segments.len() < 4 || segments.iter().any(|segment| segment.is_empty()) {
            return Err(invalid());
        }

        let file_name = segments[segments.len() - 1];
        let stem = file_name
            .split_once('.')
            .map_or(file_name, |(stem, _)| stem);
        let timestamp = stem
            .parse::<i64>()
            .ok()
            .and_then(DateTime::from_timestamp_millis)
            .ok_or_else(invalid)?;

        Ok(Self {
            study_object_id: segments[0].to_owned(),
            participant: segments[1].to_owned(),
            data_type: segments[2].to_owned(),
            timestamp,
        })
    }

    /// Index of the time bucket this file's data falls in.
    pub fn bucket(&self, quantum: NonZeroU32) -> i64 {
        self.timestamp
            .timestamp()
            .div_euclid(i64::from(quantum.get()))
    }

    pub fn chunk_path(&self, quantum: NonZeroU32) -> String {
        let bucket_start = self.bucket(quantum) * i64::from(quantum.get());
        format!(
            "{CHUNKS_FOLDER}/{}/{}/{}/{bucket_start}.csv",
            self.study_object_id, self.participant, self.data_type
        )
    }
}

/// Drop the first line of `appended` when it repeats the header `existing` starts with.
fn strip_repeated_header(existing: &[u8], appended: Bytes) -> Bytes {
    let header_end = match existing.iter().position(|b| *b == b'\n') {
        Some(position) => position + 1,
        None => return appended,
    };

    if appended.starts_with(&existing[..header_end]) {
        appended.slice(header_end..)
    } else {
        appended
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileOutcome {
    /// Written to a new chunk.
    Chunked,
    /// Appended to an existing chunk, which was rehashed.
    Merged,
    /// Registered as-is, without hashing.
    Unchunked,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RunSummary {
    pub chunked: u64,
    pub merged: u64,
    pub unchunked: u64,
    pub failed: u64,
}

impl RunSummary {
    fn record(&mut self, outcome: FileOutcome) {
        match outcome {
            FileOutcome::Chunked => self.chunked += 1,
            FileOutcome::Merged => self.merged += 1,
            FileOutcome::Unchunked => self.unchunked += 1,
        }
    }

    pub fn processed(&self) -> u64 {
        self.chunked + self.merged + self.unchunked
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunOutcome {
    /// Another run holds the processing lock.
    Skipped,
    Completed(RunSummary),
}

// Shown on the liveness endpoint.
#[derive(Debug, Clone, Default, Serialize)]
pub struct PipelineStatus {
    pub runs: u64,
    pub skipped_runs: u64,
    pub last_run_started: Option<DateTime<Utc>>,
    pub last_run_finished: Option<DateTime<Utc>>,
    pub last_summary: Option<RunSummary>,
    pub last_error: Option<String>,
    pub last_error_time: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LockState {
    pub locked: bool,
    pub lock_time: Option<DateTime<Utc>>,
    pub age_seconds: Option<i64>,
}

#[derive(Debug, Clone)]
pub struct PipelineSettings {
    pub quantum: NonZeroU32,
    pub batch_size: i64,
    pub stale_lock_warning: Duration,
}

/// Turns queued raw files into registered chunks, one run at a time across every worker.
pub struct ChunkPipeline<S, B> {
    registry: ChunkRegistry<S>,
    lock: ProcessingLock<S>,
    queue: FileQueue<S>,
    blobs: B,
    batch_size: i64,
    stale_lock_warning: Duration,
    status: Mutex<PipelineStatus>,
}

impl<S: PipelineStore, B: BlobStore> ChunkPipeline<S, B> {
    pub fn new(store: S, blobs: B, catalog: StreamCatalog, settings: PipelineSettings) -> Self {
        Self {
            registry: ChunkRegistry::new(store.clone(), catalog, settings.quantum),
            lock: ProcessingLock::new(store.clone()),
            queue: FileQueue::new(store),
            blobs,
            batch_size: settings.batch_size,
            stale_lock_warning: settings.stale_lock_warning,
            status: Mutex::new(PipelineStatus::default()),
        }
    }

    pub fn registry(&self) -> &ChunkRegistry<S> {
        &self.registry
    }

    pub fn queue(&self) -> &FileQueue<S> {
        &self.queue
    }

    pub async fn status(&self) -> PipelineStatus {
        self.status.lock().await.clone()
    }

    pub async fn lock_state(&self) -> Result<LockState, LockError> {
        let lock_time = self.lock.lock_time().await?;

        Ok(LockState {
            locked: lock_time.is_some(),
            lock_time,
            age_seconds: lock_time.map(|time| (Utc::now() - time).num_seconds()),
        })
    }

    /// Run the pipeline on a fixed interval until the task is dropped. Failed runs are logged and
    /// retried on the next tick.
    pub async fn run(&self, interval: time::Duration) {
        let mut interval = tokio::time::interval(interval);

        loop {
            interval.tick().await;
            if let Err(error) = self.run_once().await {
                error!("chunking run failed: {}", error);
            }
        }
    }

    /// Process one batch of queued files while holding the processing lock. The lock is released
    /// whether or not the batch succeeds.
    pub async fn run_once(&self) -> Result<RunOutcome, PipelineError> {
        let started = Utc::now();

        match self.lock.try_acquire().await? {
            Acquisition::Acquired { .. } => {}
            Acquisition::AlreadyHeld => {
                self.report_held_lock().await?;
                metrics::counter!("chunk_pipeline_runs_total", "outcome" => "skipped").increment(1);
                self.status.lock().await.skipped_runs += 1;
                return Ok(RunOutcome::Skipped);
            }
        }

        let result = {
            let _timing = timing_guard("chunk_pipeline_run_duration_seconds");
            self.process_batch().await
        };
        let released = self.lock.release().await;

        let mut status = self.status.lock().await;
        status.runs += 1;
        status.last_run_started = Some(started);
        status.last_run_finished = Some(Utc::now());

        let error = match (result, released) {
            (Ok(summary), Ok(())) => {
                metrics::counter!("chunk_pipeline_runs_total", "outcome" => "completed")
                    .increment(1);
                status.last_summary = Some(summary.clone());
                return Ok(RunOutcome::Completed(summary));
            }
            (Err(error), Ok(())) => error,
            (Ok(_), Err(release_error)) => release_error.into(),
            (Err(error), Err(release_error)) => {
                error!(
                    "failed to release processing lock after a failed run ({}): {}",
                    error, release_error
                );
                error
            }
        };

        metrics::counter!("chunk_pipeline_runs_total", "outcome" => "failed").increment(1);
        status.last_error = Some(error.to_string());
        status.last_error_time = Some(Utc::now());
        Err(error)
    }

    async fn report_held_lock(&self) -> Result<(), PipelineError> {
        match self.lock.age().await {
            Ok(age) => {
                metrics::gauge!("processing_lock_age_seconds").set(age.num_seconds() as f64);
                if age > self.stale_lock_warning {
                    warn!(
                        age_seconds = age.num_seconds(),
                        "processing lock has been held for longer than expected, its holder may have crashed"
                    );
                } else {
                    info!(
                        age_seconds = age.num_seconds(),
                        "processing lock is held by another run, skipping"
                    );
                }
                Ok(())
            }
            // Released between our attempt and this check.
            Err(LockError::NoActiveLock) => {
                info!("processing lock is held by another run, skipping");
                Ok(())
            }
            Err(error) => Err(error.into()),
        }
    }

    async fn process_batch(&self) -> Result<RunSummary, PipelineError> {
        let pending = self.queue.pending(self.batch_size).await?;
        let mut summary = RunSummary::default();

        info!(files = pending.len(), "processing queued files");

        for entry in pending {
            match self.process_file(&entry).await {
                Ok(outcome) => {
                    self.queue.remove(&entry).await?;
                    summary.record(outcome);
                    metrics::counter!("chunk_pipeline_files_total", "outcome" => "processed")
                        .increment(1);
                }
                Err(error) => {
                    // Data type mismatches mean the queue and the registry disagree on the
                    // stream configuration. The file stays queued.
                    error!(
                        entry_id = entry.id,
                        file_path = %entry.file_path,
                        "failed to process queued file: {}",
                        error
                    );
                    summary.failed += 1;
                    metrics::counter!("chunk_pipeline_files_total", "outcome" => "failed")
                        .increment(1);
                }
            }
        }

        info!(
            chunked = summary.chunked,
            merged = summary.merged,
            unchunked = summary.unchunked,
            failed = summary.failed,
            "finished processing queued files"
        );

        Ok(summary)
    }

    async fn process_file(&self, entry: &QueueEntry) -> Result<FileOutcome, PipelineError> {
        let raw = RawFile::parse(&entry.file_path)?;

        match self.registry.catalog().classify(&raw.data_type)? {
            Chunkability::Chunkable => {
                let content = self.blobs.get(&entry.file_path).await?;
                self.add_to_chunk(entry, &raw, content).await
            }
            Chunkability::Unchunkable => {
                if !self.blobs.exists(&entry.file_path).await? {
                    return Err(BlobError::NotFound(entry.file_path.clone()).into());
                }
                // Registered by an earlier run that failed to dequeue the file.
                if self.registry.find_by_path(&entry.file_path).await?.is_some() {
                    info!(file_path = %entry.file_path, "file is already registered");
                    return Ok(FileOutcome::Unchunked);
                }
                self.registry
                    .register_unchunked_at(
                        NewChunk::new(
                            &raw.data_type,
                            raw.timestamp.timestamp() as f64,
                            &entry.file_path,
                            entry.study_id,
                            entry.participant_id,
                        ),
                        raw.timestamp,
                    )
                    .await?;
                Ok(FileOutcome::Unchunked)
            }
        }
    }

    async fn add_to_chunk(
        &self,
        entry: &QueueEntry,
        raw: &RawFile,
        content: Bytes,
    ) -> Result<FileOutcome, PipelineError> {
        let quantum = self.registry.quantum();
        let chunk_path = raw.chunk_path(quantum);

        let Some(mut record) = self.registry.find_by_path(&chunk_path).await? else {
            self.blobs.put(&chunk_path, content.clone()).await?;
            self.registry
                .register_chunked(
                    NewChunk::new(
                        &raw.data_type,
                        raw.bucket(quantum) as f64,
                        &chunk_path,
                        entry.study_id,
                        entry.participant_id,
                    ),
                    &content,
                )
                .await?;
            return Ok(FileOutcome::Chunked);
        };

        let existing = self.blobs.get(&chunk_path).await?;
        let appended = strip_repeated_header(&existing, content);

        // An earlier run appended these rows but failed to dequeue the file. Rehash in case it
        // also failed to record the hash.
        if existing.ends_with(&appended[..]) {
            info!(
                chunk_path = %chunk_path,
                file_path = %entry.file_path,
                "file content is already part of its chunk"
            );
            self.registry.update_hash(&mut record, &existing).await?;
            return Ok(FileOutcome::Merged);
        }

        let separator: &[u8] = if existing.is_empty() || existing.ends_with(b"\n") {
            b""
        } else {
            b"\n"
        };

        let mut merged = BytesMut::with_capacity(existing.len() + separator.len() + appended.len());
        merged.extend_from_slice(&existing);
        merged.extend_from_slice(separator);
        merged.extend_from_slice(&appended);
        self.blobs.put(&chunk_path, merged.freeze()).await?;

        let rehashed = self
            .registry
            .update_hash_streamed(&mut record, [&existing[..], separator, &appended[..]])
            .await;
        if let Err(error) = rehashed {
            // Put back the content the registered hash describes, so a retry appends once.
            if let Err(restore_error) = self.blobs.put(&chunk_path, existing).await {
                error!(
                    chunk_path = %chunk_path,
                    "failed to restore chunk after a failed rehash: {}",
                    restore_error
                );
            }
            return Err(error.into());
        }

        Ok(FileOutcome::Merged)
    }
}
