//! Repository implementations for data persistence.
//!
//! Jobs are stored as a JSON record plus a few indexed columns; feature
//! vectors are keyed by dataset fingerprint.

use crate::jobs::{Job, JobId};
use crate::storage::database::{Database, SharedDatabase};
use crate::storage::error::{StorageError, StorageResult};
use chrono::Utc;
use cipherscope_training::{DatasetId, FeatureStore, FeatureVector};
use rusqlite::{OptionalExtension, Row, params};
use std::sync::{Arc, PoisonError};
use tracing::{debug, warn};

// ============================================================================
// Row Parsing Helpers
// ============================================================================

/// Parses a JSON field from a row into a deserializable type.
fn parse_json_field<T>(row: &Row, idx: usize, column_name: &str) -> rusqlite::Result<T>
where
    T: serde::de::DeserializeOwned,
{
    let json_str: String = row.get(idx)?;
    serde_json::from_str(&json_str).map_err(|_| {
        rusqlite::Error::InvalidColumnType(idx, column_name.to_string(), rusqlite::types::Type::Text)
    })
}

fn not_found_error(table: &str, id: &str) -> StorageError {
    StorageError::NotFound(format!("{table} with id {id} not found"))
}

const TERMINAL_STATES: &str = "('completed', 'failed', 'cancelled')";

// ============================================================================
// Repository Traits
// ============================================================================

/// Repository trait for job records.
pub trait JobRepository {
    /// Inserts a job or replaces the stored record.
    fn upsert(&mut self, job: &Job) -> StorageResult<()>;

    /// Retrieves a job by ID.
    fn get_by_id(&self, id: &JobId) -> StorageResult<Job>;

    /// Retrieves all jobs, newest first.
    fn get_all(&self) -> StorageResult<Vec<Job>>;

    /// Retrieves jobs that have not reached a terminal state.
    fn get_unfinished(&self) -> StorageResult<Vec<Job>>;
}

/// Repository trait for cached feature vectors.
pub trait FeatureVectorRepository {
    fn get(&self, fingerprint: &DatasetId) -> StorageResult<Option<FeatureVector>>;

    fn put(&mut self, fingerprint: &DatasetId, vector: &FeatureVector) -> StorageResult<()>;
}

// ============================================================================
// SQLite Job Repository
// ============================================================================

/// SQLite implementation of JobRepository.
pub struct SqliteJobRepository<'a> {
    db: &'a mut Database,
}

impl<'a> SqliteJobRepository<'a> {
    /// Creates a new SQLite job repository.
    pub fn new(db: &'a mut Database) -> Self {
        Self { db }
    }

    fn query(&self, sql: &str) -> StorageResult<Vec<Job>> {
        let mut stmt = self.db.conn().prepare(sql)?;
        let jobs = stmt
            .query_map([], |row| parse_json_field::<Job>(row, 0, "record_json"))?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(jobs)
    }
}

impl JobRepository for SqliteJobRepository<'_> {
    fn upsert(&mut self, job: &Job) -> StorageResult<()> {
        let record_json = serde_json::to_string(&job.persistable())?;
        self.db.conn_mut().execute(
            r#"
            INSERT INTO jobs (id, kind, state, owner, record_json, created_at, updated_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
            ON CONFLICT(id) DO UPDATE SET
                state = excluded.state,
                record_json = excluded.record_json,
                updated_at = excluded.updated_at
            "#,
            params![
                job.id.0,
                job.kind.as_str(),
                job.state.as_str(),
                job.owner,
                record_json,
                job.created_at.to_rfc3339(),
                job.updated_at.to_rfc3339()
            ],
        )?;
        debug!(job_id = %job.id, state = %job.state, "Persisted job");
        Ok(())
    }

    fn get_by_id(&self, id: &JobId) -> StorageResult<Job> {
        let mut stmt = self.db.conn().prepare("SELECT record_json FROM jobs WHERE id = ?1")?;
        let mut rows = stmt.query_map(params![id.0], |row| parse_json_field::<Job>(row, 0, "record_json"))?;
        match rows.next() {
            Some(Ok(job)) => Ok(job),
            Some(Err(e)) => Err(e.into()),
            None => Err(not_found_error("jobs", &id.0)),
        }
    }

    fn get_all(&self) -> StorageResult<Vec<Job>> {
        self.query("SELECT record_json FROM jobs ORDER BY created_at DESC")
    }

    fn get_unfinished(&self) -> StorageResult<Vec<Job>> {
        self.query(&format!("SELECT record_json FROM jobs WHERE state NOT IN {TERMINAL_STATES} ORDER BY created_at"))
    }
}

// ============================================================================
// SQLite Feature Vector Repository
// ============================================================================

/// SQLite implementation of FeatureVectorRepository.
pub struct SqliteFeatureVectorRepository<'a> {
    db: &'a mut Database,
}

impl<'a> SqliteFeatureVectorRepository<'a> {
    pub fn new(db: &'a mut Database) -> Self {
        Self { db }
    }
}

impl FeatureVectorRepository for SqliteFeatureVectorRepository<'_> {
    fn get(&self, fingerprint: &DatasetId) -> StorageResult<Option<FeatureVector>> {
        let vector = self
            .db
            .conn()
            .query_row(
                "SELECT vector_json FROM feature_vectors WHERE fingerprint = ?1",
                params![fingerprint.0],
                |row| parse_json_field::<FeatureVector>(row, 0, "vector_json"),
            )
            .optional()?;
        Ok(vector)
    }

    fn put(&mut self, fingerprint: &DatasetId, vector: &FeatureVector) -> StorageResult<()> {
        let vector_json = serde_json::to_string(vector)?;
        self.db.conn_mut().execute(
            "INSERT OR REPLACE INTO feature_vectors (fingerprint, version, vector_json, created_at) VALUES (?1, ?2, ?3, ?4)",
            params![fingerprint.0, vector.version, vector_json, Utc::now().to_rfc3339()],
        )?;
        Ok(())
    }
}

/// Durable [`FeatureStore`] backed by the `feature_vectors` table.
///
/// Storage errors degrade to cache misses.
pub struct SqliteFeatureStore {
    db: SharedDatabase,
}

impl SqliteFeatureStore {
    #[must_use]
    pub fn new(db: SharedDatabase) -> Self {
        Self { db }
    }
}

impl FeatureStore for SqliteFeatureStore {
    fn get(&self, id: &DatasetId) -> Option<Arc<FeatureVector>> {
        let mut db = self.db.lock().unwrap_or_else(PoisonError::into_inner);
        match SqliteFeatureVectorRepository::new(&mut db).get(id) {
            Ok(hit) => hit.filter(FeatureVector::is_current_layout).map(Arc::new),
            Err(e) => {
                warn!(dataset_id = %id, error = %e, "Feature vector lookup failed");
                None
            }
        }
    }

    fn put(&self, id: &DatasetId, vector: Arc<FeatureVector>) {
        let mut db = self.db.lock().unwrap_or_else(PoisonError::into_inner);
        if let Err(e) = SqliteFeatureVectorRepository::new(&mut db).put(id, &vector) {
            warn!(dataset_id = %id, error = %e, "Feature vector write failed");
        }
    }
}
