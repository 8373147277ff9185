use std::collections::BTreeSet;

use thiserror::Error;

/// Data streams recognized by the platform, as sent by the mobile clients.
pub const ALL_DATA_STREAMS: &[&str] = &[
    "accelerometer",
    "bluetooth",
    "calls",
    "gps",
    "identifiers",
    "app_log",
    "ios_log",
    "power_state",
    "survey_answers",
    "survey_timings",
    "texts",
    "audio_recordings",
    "wifi",
    "proximity",
    "gyro",
    "magnetometer",
    "devicemotion",
    "reachability",
    "image_survey",
];

/// Streams whose files are merged into time-bucketed, hashed chunks.
pub const CHUNKABLE_DATA_STREAMS: &[&str] = &[
    "accelerometer",
    "bluetooth",
    "calls",
    "gps",
    "identifiers",
    "app_log",
    "ios_log",
    "power_state",
    "survey_timings",
    "texts",
    "wifi",
    "proximity",
    "gyro",
    "magnetometer",
    "devicemotion",
    "reachability",
];

/// Width of the registry's `data_type` column.
pub const MAX_DATA_TYPE_LENGTH: usize = 32;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum ClassifierError {
    #[error("{0} is not a recognized data stream")]
    UnknownDataType(String),
    #[error("chunkable data stream {0} is not part of the recognized data streams")]
    UnknownChunkableType(String),
    #[error("the set of recognized data streams cannot be empty")]
    EmptyStreamUniverse,
    #[error("data stream name {0} is longer than 32 characters")]
    StreamNameTooLong(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Chunkability {
    Chunkable,
    Unchunkable,
}

/// The closed set of data streams and which of them are chunkable.
///
/// Construction validates the chunkable set against the universe, so a catalog that exists is
/// always consistent and every lookup afterwards is a plain membership check.
#[derive(Debug, Clone)]
pub struct StreamCatalog {
    streams: BTreeSet<String>,
    chunkable: BTreeSet<String>,
}

impl StreamCatalog {
    pub fn new<A, C, S, T>(all_streams: A, chunkable: C) -> Result<Self, ClassifierError>
    where
        A: IntoIterator<Item = S>,
        C: IntoIterator<Item = T>,
        S: Into<String>,
        T: Into<String>,
    {
        let streams: BTreeSet<String> = all_streams.into_iter().map(Into::into).collect();
        if streams.is_empty() {
            return Err(ClassifierError::EmptyStreamUniverse);
        }
        if let Some(long) = streams
            .iter()
            .find(|name| name.chars().count() > MAX_DATA_TYPE_LENGTH)
        {
            return Err(ClassifierError::StreamNameTooLong(long.to_owned()));
        }

        let chunkable: BTreeSet<String> = chunkable.into_iter().map(Into::into).collect();
        if let Some(unknown) = chunkable.iter().find(|name| !streams.contains(*name)) {
            return Err(ClassifierError::UnknownChunkableType(unknown.to_owned()));
        }

        Ok(Self { streams, chunkable })
    }

    pub fn classify(&self, data_type: &str) -> Result<Chunkability, ClassifierError> {
        if !self.streams.contains(data_type) {
            return Err(ClassifierError::UnknownDataType(data_type.to_owned()));
        }

        if self.chunkable.contains(data_type) {
            Ok(Chunkability::Chunkable)
        } else {
            Ok(Chunkability::Unchunkable)
        }
    }

    pub fn streams(&self) -> impl Iterator<Item = &str> {
        self.streams.iter().map(String::as_str)
    }

    pub fn chunkable_streams(&self) -> impl Iterator<Item = &str> {
        self.chunkable.iter().map(String::as_str)
    }
}

impl Default for StreamCatalog {
    fn default() -> Self {
        Self {
            streams: ALL_DATA_STREAMS.iter().map(|s| s.to_string()).collect(),
            chunkable: CHUNKABLE_DATA_STREAMS.iter().map(|s| s.to_string()).collect(),
        }
    }
}
