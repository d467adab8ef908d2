//! Storage layer for CipherScope.
//!
//! SQLite persistence for jobs and feature vectors using the Repository
//! pattern. Models are stored by the registry as JSON files instead.

// SQL strings don't need hash-less raw strings
#![allow(clippy::needless_raw_string_hashes)]

pub mod database;
pub mod error;
pub mod repositories;

pub use database::{Database, SharedDatabase};
pub use error::{StorageError, StorageResult};
pub use repositories::{
    FeatureVectorRepository, JobRepository, SqliteFeatureStore, SqliteFeatureVectorRepository,
    SqliteJobRepository,
};
