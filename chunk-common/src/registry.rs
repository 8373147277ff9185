use std::num::NonZeroU32;

use chrono::{DateTime, Utc};
use futures::stream::{BoxStream, StreamExt, TryStreamExt};
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, warn};

use crate::classifier::{Chunkability, ClassifierError, StreamCatalog};
use crate::hashing::{HashProvider, Md5Base64};
use crate::store::{ChunkStore, StoreError};

/// Storage field widths every backend must honor.
pub const MAX_CHUNK_PATH_LENGTH: usize = 256;
pub const MAX_CHUNK_HASH_LENGTH: usize = 25;

/// Default width of a chunk's time bucket: one hour.
pub const DEFAULT_CHUNK_TIMESLICE_QUANTUM: u32 = 3600;

/// Enumeration of errors for ChunkRegistry operations.
#[derive(Error, Debug)]
pub enum RegistryError {
    #[error("{0} is not a chunkable data stream and cannot be registered as chunked data")]
    UnchunkableDataType(String),
    #[error("{0} is a chunkable data stream and cannot be registered as unchunked data")]
    ChunkableDataType(String),
    #[error(transparent)]
    ClassifierError(#[from] ClassifierError),
    #[error("chunk path is {0} characters long, the maximum is 256")]
    ChunkPathTooLong(usize),
    #[error("chunk hash is {0} characters long, the maximum is 25")]
    ChunkHashTooLong(usize),
    #[error("{0} cannot be converted into a time bin")]
    InvalidTimeBin(f64),
    #[error(transparent)]
    StoreError(#[from] StoreError),
}

/// A registered chunk as persisted in the registry.
#[derive(Debug, Clone, PartialEq, Serialize, sqlx::FromRow)]
pub struct ChunkRecord {
    pub id: i64,
    pub is_chunkable: bool,
    pub chunk_path: String,
    /// Empty for unchunkable records.
    pub chunk_hash: String,
    pub data_type: String,
    pub time_bin: DateTime<Utc>,
    pub study_id: i64,
    pub participant_id: i64,
    pub survey_id: Option<i64>,
    pub created_at: DateTime<Utc>,
    pub last_updated: DateTime<Utc>,
}

/// A fully validated record, ready to be inserted by a `ChunkStore`.
/// Only the registry builds these.
#[derive(Debug, Clone, PartialEq)]
pub struct NewChunkRecord {
    pub is_chunkable: bool,
    pub chunk_path: String,
    pub chunk_hash: String,
    pub data_type: String,
    pub time_bin: DateTime<Utc>,
    pub study_id: i64,
    pub participant_id: i64,
    pub survey_id: Option<i64>,
}

/// What a caller knows about a chunk it wants registered.
#[derive(Debug, Clone, PartialEq)]
pub struct NewChunk {
    pub data_type: String,
    /// For chunked data, the bucket index (seconds divided by the quantum). For unchunked data,
    /// seconds since the epoch.
    pub time_bin: f64,
    pub chunk_path: String,
    pub study_id: i64,
    pub participant_id: i64,
    pub survey_id: Option<i64>,
}

impl NewChunk {
    pub fn new(
        data_type: &str,
        time_bin: f64,
        chunk_path: &str,
        study_id: i64,
        participant_id: i64,
    ) -> Self {
        Self {
            data_type: data_type.to_owned(),
            time_bin,
            chunk_path: chunk_path.to_owned(),
            study_id,
            participant_id,
            survey_id: None,
        }
    }

    pub fn survey(mut self, survey_id: i64) -> Self {
        self.survey_id = Some(survey_id);
        self
    }
}

/// Filters for `ChunkRegistry::get_range`. Every filter is optional and they all apply together.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RangeQuery {
    pub study_id: i64,
    /// Public participant ids (`patient_id`), not primary keys.
    pub patient_ids: Option<Vec<String>>,
    pub data_types: Option<Vec<String>>,
    /// Inclusive lower bound on `time_bin`.
    pub start: Option<DateTime<Utc>>,
    /// Inclusive upper bound on `time_bin`.
    pub end: Option<DateTime<Utc>>,
}

impl RangeQuery {
    pub fn new(study_id: i64) -> Self {
        Self {
            study_id,
            ..Default::default()
        }
    }

    pub fn participants(mut self, patient_ids: Vec<String>) -> Self {
        self.patient_ids = Some(patient_ids);
        self
    }

    pub fn data_types(mut self, data_types: Vec<String>) -> Self {
        self.data_types = Some(data_types);
        self
    }

    pub fn start(mut self, start: DateTime<Utc>) -> Self {
        self.start = Some(start);
        self
    }

    pub fn end(mut self, end: DateTime<Utc>) -> Self {
        self.end = Some(end);
        self
    }

    /// An empty participant or data type list filters nothing out, same as passing none.
    pub fn normalized(mut self) -> Self {
        if self.patient_ids.as_ref().is_some_and(Vec::is_empty) {
            self.patient_ids = None;
        }
        if self.data_types.as_ref().is_some_and(Vec::is_empty) {
            self.data_types = None;
        }
        self
    }

    /// `patient_id` is the public id of the record's participant, if it has one on file.
    pub fn matches(&self, record: &ChunkRecord, patient_id: Option<&str>) -> bool {
        record.study_id == self.study_id
            && self.patient_ids.as_ref().map_or(true, |ids| {
                patient_id.is_some_and(|patient_id| ids.iter().any(|id| id == patient_id))
            })
            && self
                .data_types
                .as_ref()
                .map_or(true, |types| types.contains(&record.data_type))
            && self.start.map_or(true, |start| record.time_bin >= start)
            && self.end.map_or(true, |end| record.time_bin <= end)
    }
}

/// Start of the bucket a chunk falls in: `floor(time_bin) * quantum` seconds since the epoch.
pub fn bucket_start(time_bin: f64, quantum: NonZeroU32) -> Option<DateTime<Utc>> {
    if !time_bin.is_finite() {
        return None;
    }

    let seconds = (time_bin.floor() as i64).checked_mul(i64::from(quantum.get()))?;
    DateTime::from_timestamp(seconds, 0)
}

/// Seconds since the epoch, keeping any fractional part as sub-second precision.
pub fn raw_timestamp(seconds: f64) -> Option<DateTime<Utc>> {
    if !seconds.is_finite() {
        return None;
    }

    let whole = seconds.floor();
    let nanos = (((seconds - whole) * 1e9).round() as u32).min(999_999_999);
    DateTime::from_timestamp(whole as i64, nanos)
}

/// The catalog of chunks produced from raw device files.
///
/// Every precondition (stream classification, field widths, time bin conversion, hashing) is
/// checked before the store is touched, so a failed registration never leaves a record behind.
#[derive(Clone)]
pub struct ChunkRegistry<S, H = Md5Base64> {
    store: S,
    catalog: StreamCatalog,
    hash_provider: H,
    quantum: NonZeroU32,
}

impl<S: ChunkStore> ChunkRegistry<S, Md5Base64> {
    pub fn new(store: S, catalog: StreamCatalog, quantum: NonZeroU32) -> Self {
        Self::with_hash_provider(store, catalog, Md5Base64, quantum)
    }
}

impl<S: ChunkStore, H: HashProvider> ChunkRegistry<S, H> {
    pub fn with_hash_provider(
        store: S,
        catalog: StreamCatalog,
        hash_provider: H,
        quantum: NonZeroU32,
    ) -> Self {
        Self {
            store,
            catalog,
            hash_provider,
            quantum,
        }
    }

    pub fn catalog(&self) -> &StreamCatalog {
        &self.catalog
    }

    pub fn quantum(&self) -> NonZeroU32 {
        self.quantum
    }

    pub fn hash_provider(&self) -> &H {
        &self.hash_provider
    }

    /// Register a chunk of a chunkable stream, hashing its content.
    pub async fn register_chunked(
        &self,
        chunk: NewChunk,
        content: &[u8],
    ) -> Result<ChunkRecord, RegistryError> {
        let time_bin = self.check_chunked(&chunk)?;
        let chunk_hash = checked_hash(self.hash_provider.hash(content))?;

        self.insert(chunk, true, chunk_hash, time_bin).await
    }

    /// Same as `register_chunked`, with content supplied as successive fragments.
    pub async fn register_chunked_streamed<I, B>(
        &self,
        chunk: NewChunk,
        fragments: I,
    ) -> Result<ChunkRecord, RegistryError>
    where
        I: IntoIterator<Item = B>,
        B: AsRef<[u8]>,
    {
        let time_bin = self.check_chunked(&chunk)?;
        let chunk_hash = checked_hash(self.hash_provider.hash_streamed(fragments))?;

        self.insert(chunk, true, chunk_hash, time_bin).await
    }

    /// Register a file of an unchunkable stream as-is: no hash and no bucket alignment.
    pub async fn register_unchunked(&self, chunk: NewChunk) -> Result<ChunkRecord, RegistryError> {
        let time_bin =
            raw_timestamp(chunk.time_bin).ok_or(RegistryError::InvalidTimeBin(chunk.time_bin))?;

        self.register_unchunked_at(chunk, time_bin).await
    }

    /// Same as `register_unchunked`, for callers that know the exact time of the file.
    /// `chunk.time_bin` is not consulted.
    pub async fn register_unchunked_at(
        &self,
        chunk: NewChunk,
        time_bin: DateTime<Utc>,
    ) -> Result<ChunkRecord, RegistryError> {
        match self.catalog.classify(&chunk.data_type)? {
            Chunkability::Unchunkable => {}
            Chunkability::Chunkable => {
                warn!(
                    data_type = %chunk.data_type,
                    "refusing unchunked registration of a chunkable data stream"
                );
                return Err(RegistryError::ChunkableDataType(chunk.data_type));
            }
        }
        check_chunk_path(&chunk.chunk_path)?;

        self.insert(chunk, false, String::new(), time_bin).await
    }

    /// Lazily stream the chunks of a study matching every filter in `query`, in no particular order.
    pub fn get_range(
        &self,
        query: RangeQuery,
    ) -> BoxStream<'_, Result<ChunkRecord, RegistryError>> {
        self.store
            .chunks_in_range(query.normalized())
            .map_err(RegistryError::from)
            .boxed()
    }

    pub async fn find_by_path(
        &self,
        chunk_path: &str,
    ) -> Result<Option<ChunkRecord>, RegistryError> {
        Ok(self.store.find_chunk_by_path(chunk_path).await?)
    }

    /// Recompute and persist the hash of an existing chunk, e.g. after content was appended to it.
    pub async fn update_hash(
        &self,
        record: &mut ChunkRecord,
        content: &[u8],
    ) -> Result<(), RegistryError> {
        check_rehashable(record)?;
        let chunk_hash = checked_hash(self.hash_provider.hash(content))?;

        self.persist_hash(record, chunk_hash).await
    }

    /// Same as `update_hash`, for content too large to be held in one buffer.
    pub async fn update_hash_streamed<I, B>(
        &self,
        record: &mut ChunkRecord,
        fragments: I,
    ) -> Result<(), RegistryError>
    where
        I: IntoIterator<Item = B>,
        B: AsRef<[u8]>,
    {
        check_rehashable(record)?;
        let chunk_hash = checked_hash(self.hash_provider.hash_streamed(fragments))?;

        self.persist_hash(record, chunk_hash).await
    }

    fn check_chunked(&self, chunk: &NewChunk) -> Result<DateTime<Utc>, RegistryError> {
        match self.catalog.classify(&chunk.data_type)? {
            Chunkability::Chunkable => {}
            Chunkability::Unchunkable => {
                warn!(
                    data_type = %chunk.data_type,
                    "refusing chunked registration of an unchunkable data stream"
                );
                return Err(RegistryError::UnchunkableDataType(chunk.data_type.clone()));
            }
        }
        check_chunk_path(&chunk.chunk_path)?;

        bucket_start(chunk.time_bin, self.quantum)
            .ok_or(RegistryError::InvalidTimeBin(chunk.time_bin))
    }

    async fn insert(
        &self,
        chunk: NewChunk,
        is_chunkable: bool,
        chunk_hash: String,
        time_bin: DateTime<Utc>,
    ) -> Result<ChunkRecord, RegistryError> {
        let record = self
            .store
            .insert_chunk(NewChunkRecord {
                is_chunkable,
                chunk_path: chunk.chunk_path,
                chunk_hash,
                data_type: chunk.data_type,
                time_bin,
                study_id: chunk.study_id,
                participant_id: chunk.participant_id,
                survey_id: chunk.survey_id,
            })
            .await?;

        let labels = [("chunkable", is_chunkable.to_string())];
        metrics::counter!("chunk_registry_registered_total", &labels).increment(1);
        debug!(
            chunk_id = record.id,
            chunk_path = %record.chunk_path,
            data_type = %record.data_type,
            time_bin = %record.time_bin,
            "registered chunk"
        );

        Ok(record)
    }

    async fn persist_hash(
        &self,
        record: &mut ChunkRecord,
        chunk_hash: String,
    ) -> Result<(), RegistryError> {
        let last_updated = self.store.update_chunk_hash(record.id, &chunk_hash).await?;
        record.chunk_hash = chunk_hash;
        record.last_updated = last_updated;

        metrics::counter!("chunk_registry_rehashed_total").increment(1);

        Ok(())
    }
}

fn check_chunk_path(chunk_path: &str) -> Result<(), RegistryError> {
    let length = chunk_path.chars().count();
    if length > MAX_CHUNK_PATH_LENGTH {
        return Err(RegistryError::ChunkPathTooLong(length));
    }
    Ok(())
}

fn checked_hash(chunk_hash: String) -> Result<String, RegistryError> {
    let length = chunk_hash.chars().count();
    if length > MAX_CHUNK_HASH_LENGTH {
        return Err(RegistryError::ChunkHashTooLong(length));
    }
    Ok(chunk_hash)
}

// An unchunkable record must keep an empty hash.
fn check_rehashable(record: &ChunkRecord) -> Result<(), RegistryError> {
    if record.is_chunkable {
        Ok(())
    } else {
        Err(RegistryError::UnchunkableDataType(record.data_type.clone()))
    }
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;

    use super::*;
    use crate::classifier::{ALL_DATA_STREAMS, CHUNKABLE_DATA_STREAMS};
    use crate::hashing::ContentHasher;
    use crate::store::MemoryStore;

    const HOUR: NonZeroU32 = match NonZeroU32::new(3600) {
        Some(quantum) => quantum,
        None => panic!("quantum must be non-zero"),
    };

    fn registry() -> (MemoryStore, ChunkRegistry<MemoryStore>) {
        let store = MemoryStore::new();
        let registry = ChunkRegistry::new(store.clone(), StreamCatalog::default(), HOUR);
        (store, registry)
    }

    async fn all_chunks(registry: &ChunkRegistry<MemoryStore>, study_id: i64) -> Vec<ChunkRecord> {
        let mut records: Vec<ChunkRecord> = registry
            .get_range(RangeQuery::new(study_id))
            .try_collect()
            .await
            .expect("failed to read range");
        records.sort_by_key(|record| record.id);
        records
    }

    #[tokio::test]
    async fn test_register_chunked() {
        let (_, registry) = registry();

        let record = registry
            .register_chunked(
                NewChunk::new("accelerometer", 1000.0, "/chunks/x", 1, 2),
                b"data",
            )
            .await
            .expect("failed to register chunk");

        assert!(record.is_chunkable);
        assert_eq!(record.chunk_hash, Md5Base64.hash(b"data"));
        assert_eq!(
            record.time_bin,
            DateTime::from_timestamp(1000 * 3600, 0).unwrap()
        );
        assert_eq!(record.chunk_path, "/chunks/x");
        assert_eq!(record.study_id, 1);
        assert_eq!(record.participant_id, 2);
        assert_eq!(record.survey_id, None);
    }

    #[tokio::test]
    async fn test_chunked_time_bin_is_floored() {
        let (_, registry) = registry();

        let record = registry
            .register_chunked(NewChunk::new("gps", 12.99, "/chunks/gps", 1, 2), b"x")
            .await
            .expect("failed to register chunk");
        assert_eq!(record.time_bin, Utc.timestamp_opt(12 * 3600, 0).unwrap());

        let record = registry
            .register_chunked(NewChunk::new("gps", -0.5, "/chunks/gps-early", 1, 2), b"x")
            .await
            .expect("failed to register chunk");
        assert_eq!(record.time_bin, Utc.timestamp_opt(-3600, 0).unwrap());
    }

    #[tokio::test]
    async fn test_every_unchunkable_type_is_refused_chunked_registration() {
        let (store, registry) = registry();

        let unchunkable = ALL_DATA_STREAMS
            .iter()
            .filter(|name| !CHUNKABLE_DATA_STREAMS.contains(name));

        for data_type in unchunkable {
            let result = registry
                .register_chunked(NewChunk::new(data_type, 1.0, "/chunks/x", 1, 2), b"data")
                .await;

            assert!(
                matches!(result, Err(RegistryError::UnchunkableDataType(ref name)) if name == data_type)
            );
        }

        assert_eq!(store.chunk_count(), 0);
    }

    #[tokio::test]
    async fn test_every_chunkable_type_is_refused_unchunked_registration() {
        let (store, registry) = registry();

        for data_type in CHUNKABLE_DATA_STREAMS {
            let result = registry
                .register_unchunked(NewChunk::new(data_type, 1.0, "raw/x.csv", 1, 2))
                .await;

            assert!(
                matches!(result, Err(RegistryError::ChunkableDataType(ref name)) if name == data_type)
            );
        }

        assert_eq!(store.chunk_count(), 0);
    }

    #[tokio::test]
    async fn test_unknown_type_is_refused() {
        let (store, registry) = registry();

        let chunked = registry
            .register_chunked(NewChunk::new("barometer", 1.0, "/chunks/x", 1, 2), b"data")
            .await;
        let unchunked = registry
            .register_unchunked(NewChunk::new("barometer", 1.0, "raw/x.csv", 1, 2))
            .await;

        assert!(matches!(
            chunked,
            Err(RegistryError::ClassifierError(ClassifierError::UnknownDataType(_)))
        ));
        assert!(matches!(
            unchunked,
            Err(RegistryError::ClassifierError(ClassifierError::UnknownDataType(_)))
        ));
        assert_eq!(store.chunk_count(), 0);
    }

    #[tokio::test]
    async fn test_register_unchunked() {
        let (_, registry) = registry();

        let record = registry
            .register_unchunked(
                NewChunk::new("survey_answers", 1524857988.5, "abc/p1/survey_answers/1.csv", 1, 2)
                    .survey(9),
            )
            .await
            .expect("failed to register unchunked file");

        assert!(!record.is_chunkable);
        assert_eq!(record.chunk_hash, "");
        assert_eq!(
            record.time_bin,
            Utc.timestamp_opt(1524857988, 500_000_000).unwrap()
        );
        assert_eq!(record.survey_id, Some(9));
    }

    #[tokio::test]
    async fn test_register_unchunked_at_exact_time() {
        let (_, registry) = registry();
        let time = DateTime::from_timestamp_millis(1524857988384).unwrap();

        let record = registry
            .register_unchunked_at(
                NewChunk::new("audio_recordings", f64::NAN, "abc/p1/audio_recordings/1.mp4", 1, 2),
                time,
            )
            .await
            .expect("failed to register unchunked file");
        assert_eq!(record.time_bin.timestamp_millis(), 1524857988384);

        let result = registry
            .register_unchunked_at(NewChunk::new("gps", 0.0, "raw/x.csv", 1, 2), time)
            .await;
        assert!(matches!(result, Err(RegistryError::ChunkableDataType(_))));
    }

    #[tokio::test]
    async fn test_field_widths_are_enforced() {
        let (store, registry) = registry();
        let long_path = "c".repeat(MAX_CHUNK_PATH_LENGTH + 1);

        let result = registry
            .register_chunked(NewChunk::new("gps", 1.0, &long_path, 1, 2), b"data")
            .await;
        assert!(matches!(result, Err(RegistryError::ChunkPathTooLong(257))));

        let result = registry
            .register_unchunked(NewChunk::new("image_survey", 1.0, &long_path, 1, 2))
            .await;
        assert!(matches!(result, Err(RegistryError::ChunkPathTooLong(257))));

        assert_eq!(store.chunk_count(), 0);
    }

    struct WideHash;

    struct WideHasher(usize);

    impl ContentHasher for WideHasher {
        fn update(&mut self, fragment: &[u8]) {
            self.0 += fragment.len();
        }

        fn finish(self) -> String {
            format!("{:0>30}", self.0)
        }
    }

    impl HashProvider for WideHash {
        type Hasher = WideHasher;

        fn hasher(&self) -> Self::Hasher {
            WideHasher(0)
        }
    }

    #[tokio::test]
    async fn test_overlong_hash_creates_no_record() {
        let store = MemoryStore::new();
        let registry = ChunkRegistry::with_hash_provider(
            store.clone(),
            StreamCatalog::default(),
            WideHash,
            HOUR,
        );

        let result = registry
            .register_chunked(NewChunk::new("gps", 1.0, "/chunks/x", 1, 2), b"data")
            .await;

        assert!(matches!(result, Err(RegistryError::ChunkHashTooLong(30))));
        assert_eq!(store.chunk_count(), 0);
    }

    #[tokio::test]
    async fn test_invalid_time_bin_creates_no_record() {
        let (store, registry) = registry();

        let result = registry
            .register_chunked(NewChunk::new("gps", f64::NAN, "/chunks/x", 1, 2), b"data")
            .await;
        assert!(matches!(result, Err(RegistryError::InvalidTimeBin(_))));

        let result = registry
            .register_chunked(NewChunk::new("gps", 1e300, "/chunks/x", 1, 2), b"data")
            .await;
        assert!(matches!(result, Err(RegistryError::InvalidTimeBin(_))));

        assert_eq!(store.chunk_count(), 0);
    }

    #[tokio::test]
    async fn test_get_range() {
        let (store, registry) = registry();
        let study = store.add_study("5873fe38644ad7557b168e43");
        let other_study = store.add_study("55d231c197013e3a1c9b8c30");
        let alice = store.add_participant(study, "a1ice000");
        let bob = store.add_participant(study, "b0b00000");
        let carol = store.add_participant(study, "car01000");

        for (data_type, bin, study, participant) in [
            ("gps", 1.0, study, alice),
            ("gps", 2.0, study, bob),
            ("wifi", 3.0, study, alice),
            ("gps", 4.0, study, carol),
            ("gps", 2.0, other_study, alice),
        ] {
            let path = format!("/chunks/{study}/{participant}/{data_type}/{bin}");
            registry
                .register_chunked(NewChunk::new(data_type, bin, &path, study, participant), b"x")
                .await
                .expect("failed to register chunk");
        }

        let t0 = Utc.timestamp_opt(2 * 3600, 0).unwrap();
        let t1 = Utc.timestamp_opt(3 * 3600, 0).unwrap();

        let bounded: Vec<ChunkRecord> = registry
            .get_range(RangeQuery::new(study).start(t0).end(t1))
            .try_collect()
            .await
            .unwrap();
        assert_eq!(bounded.len(), 2);
        assert!(bounded
            .iter()
            .all(|r| r.study_id == study && r.time_bin >= t0 && r.time_bin <= t1));

        let filtered: Vec<ChunkRecord> = registry
            .get_range(
                RangeQuery::new(study)
                    .participants(vec!["a1ice000".to_owned(), "car01000".to_owned()])
                    .data_types(vec!["gps".to_owned()]),
            )
            .try_collect()
            .await
            .unwrap();
        let mut bins: Vec<i64> = filtered.iter().map(|r| r.time_bin.timestamp()).collect();
        bins.sort();
        assert_eq!(bins, vec![3600, 4 * 3600]);

        // Ids that match nobody filter everything out, including unknown participants' chunks.
        let unknown: Vec<ChunkRecord> = registry
            .get_range(RangeQuery::new(study).participants(vec!["nobody00".to_owned()]))
            .try_collect()
            .await
            .unwrap();
        assert!(unknown.is_empty());

        let empty_filters: Vec<ChunkRecord> = registry
            .get_range(RangeQuery::new(study).participants(vec![]).data_types(vec![]))
            .try_collect()
            .await
            .unwrap();
        assert_eq!(empty_filters.len(), 4);

        assert_eq!(all_chunks(&registry, other_study).await.len(), 1);
        assert!(all_chunks(&registry, other_study + 100).await.is_empty());
    }

    #[tokio::test]
    async fn test_update_hash() {
        let (_, registry) = registry();

        let mut record = registry
            .register_chunked(NewChunk::new("gps", 1.0, "/chunks/x", 1, 2), b"first")
            .await
            .unwrap();

        registry
            .update_hash(&mut record, b"first,second")
            .await
            .expect("failed to update hash");
        assert_eq!(record.chunk_hash, Md5Base64.hash(b"first,second"));

        registry
            .update_hash_streamed(&mut record, [b"first".as_slice(), b",second", b",third"])
            .await
            .expect("failed to update hash");
        assert_eq!(record.chunk_hash, Md5Base64.hash(b"first,second,third"));

        let stored = all_chunks(&registry, 1).await;
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0].chunk_hash, record.chunk_hash);
    }

    #[tokio::test]
    async fn test_streamed_registration_matches_buffered() {
        let (_, registry) = registry();

        let buffered = registry
            .register_chunked(NewChunk::new("gyro", 5.0, "/chunks/a", 1, 2), b"abcdef")
            .await
            .unwrap();
        let streamed = registry
            .register_chunked_streamed(
                NewChunk::new("gyro", 5.0, "/chunks/b", 1, 2),
                [b"ab".as_slice(), b"cd", b"ef"],
            )
            .await
            .unwrap();

        assert_eq!(buffered.chunk_hash, streamed.chunk_hash);
        assert_eq!(buffered.time_bin, streamed.time_bin);
    }

    #[tokio::test]
    async fn test_unchunked_record_cannot_be_rehashed() {
        let (_, registry) = registry();

        let mut record = registry
            .register_unchunked(NewChunk::new("audio_recordings", 1.0, "raw/a.mp4", 1, 2))
            .await
            .unwrap();

        let result = registry.update_hash(&mut record, b"audio").await;

        assert!(matches!(result, Err(RegistryError::UnchunkableDataType(_))));
        assert_eq!(record.chunk_hash, "");
        assert_eq!(all_chunks(&registry, 1).await[0].chunk_hash, "");
    }

    #[tokio::test]
    async fn test_find_by_path() {
        let (_, registry) = registry();

        let record = registry
            .register_chunked(NewChunk::new("gps", 1.0, "/chunks/x", 1, 2), b"x")
            .await
            .unwrap();

        assert_eq!(registry.find_by_path("/chunks/x").await.unwrap(), Some(record));
        assert_eq!(registry.find_by_path("/chunks/y").await.unwrap(), None);
    }
}
