use chunk_common::classifier::ClassifierError;
use chunk_common::file_queue::QueueError;
use chunk_common::lock::LockError;
use chunk_common::registry::RegistryError;
use thiserror::Error;

use crate::blob::BlobError;

/// Enumeration of errors related to chunking queued files.
#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("{0} is not a raw data file path")]
    InvalidFilePath(String),
    #[error("the processing lock could not be managed: {0}")]
    LockError(#[from] LockError),
    #[error("the file queue could not be read: {0}")]
    QueueError(#[from] QueueError),
    #[error("the chunk could not be registered: {0}")]
    RegistryError(#[from] RegistryError),
    #[error(transparent)]
    ClassifierError(#[from] ClassifierError),
    #[error(transparent)]
    BlobError(#[from] BlobError),
}
