pub mod classifier;
pub mod file_queue;
pub mod hashing;
pub mod lock;
pub mod metrics;
pub mod registry;
pub mod store;
