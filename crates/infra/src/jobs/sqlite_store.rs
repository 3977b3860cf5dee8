//! SQLite-backed job store.
//!
//! Job records live in a single `job_spec` table whose `seq` column is the
//! durable submission order. The store is synchronous: it owns a
//! current-thread tokio runtime and blocks on each query. Writers are
//! serialized by a process-local mutex so every mutation is one
//! transaction at a time.
//!
//! ## Schema
//!
//! | column | type | notes |
//! |--------|------|-------|
//! | `seq` | INTEGER PK AUTOINCREMENT | never reused, so FIFO survives deletes |
//! | `id` | TEXT UNIQUE | `JobId` |
//! | `constraints` | TEXT | JSON array of constraint keys |
//! | `lifespan_ms` | INTEGER NULL | NULL = immortal |
//! | `created_at`, `next_run_at` | TEXT | RFC 3339 |

use std::path::Path;
use std::str::FromStr;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, Utc};
use sqlx::sqlite::{
    SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions, SqliteRow,
    SqliteSynchronous,
};
use sqlx::Row;
use tokio::runtime::Runtime;
use tracing::instrument;

use super::store::{JobStore, JobStoreError, MigrationMarkerStore};
use super::types::{JobDescriptor, JobId, JobState};

const SCHEMA: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS job_spec (
        seq                 INTEGER PRIMARY KEY AUTOINCREMENT,
        id                  TEXT NOT NULL UNIQUE,
        factory_key         TEXT NOT NULL,
        queue_key           TEXT NULL,
        serialized_data     BLOB NULL,
        constraints         TEXT NOT NULL,
        max_attempts        INTEGER NULL,
        lifespan_ms         INTEGER NULL,
        max_instances       INTEGER NULL,
        created_at          TEXT NOT NULL,
        attempt_count       INTEGER NOT NULL DEFAULT 0,
        next_run_at         TEXT NULL,
        state               TEXT NOT NULL
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS migration_marker (
        id          INTEGER PRIMARY KEY CHECK (id = 1),
        version     INTEGER NOT NULL
    )
    "#,
];

const SELECT_COLUMNS: &str = r#"
    SELECT seq, id, factory_key, queue_key, serialized_data, constraints,
           max_attempts, lifespan_ms, max_instances, created_at,
           attempt_count, next_run_at, state
    FROM job_spec
"#;

/// SQLite job store.
pub struct SqliteJobStore {
    runtime: Runtime,
    pool: SqlitePool,
    write_lock: Mutex<()>,
}

impl std::fmt::Debug for SqliteJobStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqliteJobStore").finish_non_exhaustive()
    }
}

impl SqliteJobStore {
    /// Open (creating if needed) the job database at `path`.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, JobStoreError> {
        let options = SqliteConnectOptions::new()
            .filename(path.as_ref())
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Full);
        Self::connect(options)
    }

    /// Private in-memory database (lost on drop).
    pub fn in_memory() -> Result<Self, JobStoreError> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")
            .map_err(|e| map_sqlx_error("in_memory", e))?;
        Self::connect(options)
    }

    fn connect(options: SqliteConnectOptions) -> Result<Self, JobStoreError> {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .map_err(|e| JobStoreError::Storage(format!("failed to build runtime: {e}")))?;

        // One long-lived connection: keeps `:memory:` databases alive and
        // makes the pool itself the single writer.
        let pool = runtime.block_on(async {
            let pool = SqlitePoolOptions::new()
                .max_connections(1)
                .idle_timeout(None)
                .max_lifetime(None)
                .connect_with(options)
                .await
                .map_err(|e| map_sqlx_error("connect", e))?;

            for statement in SCHEMA {
                sqlx::query(statement)
                    .execute(&pool)
                    .await
                    .map_err(|e| map_sqlx_error("create_schema", e))?;
            }

            Ok::<_, JobStoreError>(pool)
        })?;

        Ok(Self {
            runtime,
            pool,
            write_lock: Mutex::new(()),
        })
    }

    fn lock(&self) -> Result<MutexGuard<'_, ()>, JobStoreError> {
        self.write_lock
            .lock()
            .map_err(|_| JobStoreError::Storage("job store write lock poisoned".to_string()))
    }
}

impl Drop for SqliteJobStore {
    fn drop(&mut self) {
        self.runtime.block_on(self.pool.close());
    }
}

impl JobStore for SqliteJobStore {
    #[instrument(skip(self, descriptor), fields(job_id = %descriptor.id, factory_key = %descriptor.factory_key), err)]
    fn insert(&self, mut descriptor: JobDescriptor) -> Result<JobDescriptor, JobStoreError> {
        let _guard = self.lock()?;
        let constraints = serde_json::to_string(&descriptor.constraints)
            .map_err(|e| JobStoreError::Corrupt(e.to_string()))?;

        let result = self.runtime.block_on(async {
            sqlx::query(
                r#"
                INSERT INTO job_spec (
                    id, factory_key, queue_key, serialized_data, constraints,
                    max_attempts, lifespan_ms, max_instances, created_at,
                    attempt_count, next_run_at, state
                )
                VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)
                "#,
            )
            .bind(descriptor.id.to_string())
            .bind(&descriptor.factory_key)
            .bind(descriptor.queue_key.as_deref())
            .bind(descriptor.serialized_data.as_deref())
            .bind(&constraints)
            .bind(descriptor.max_attempts.map(i64::from))
            .bind(descriptor.lifespan.map(|d| d.as_millis() as i64))
            .bind(descriptor.max_instances_for_factory.map(|n| n as i64))
            .bind(descriptor.created_at.to_rfc3339())
            .bind(i64::from(descriptor.attempt_count))
            .bind(descriptor.next_run_at.map(|t| t.to_rfc3339()))
            .bind(descriptor.state.as_str())
            .execute(&self.pool)
            .await
        });

        match result {
            Ok(done) => {
                descriptor.sequence = done.last_insert_rowid() as u64;
                Ok(descriptor)
            }
            Err(sqlx::Error::Database(db_err)) if db_err.is_unique_violation() => {
                Err(JobStoreError::AlreadyExists(descriptor.id))
            }
            Err(e) => Err(map_sqlx_error("insert", e)),
        }
    }

    #[instrument(skip(self), fields(job_id = %id), err)]
    fn remove(&self, id: JobId) -> Result<bool, JobStoreError> {
        let _guard = self.lock()?;
        let done = self
            .runtime
            .block_on(
                sqlx::query("DELETE FROM job_spec WHERE id = ?1")
                    .bind(id.to_string())
                    .execute(&self.pool),
            )
            .map_err(|e| map_sqlx_error("remove", e))?;
        Ok(done.rows_affected() > 0)
    }

    fn get(&self, id: JobId) -> Result<Option<JobDescriptor>, JobStoreError> {
        let query = format!("{SELECT_COLUMNS} WHERE id = ?1");
        let row = self
            .runtime
            .block_on(
                sqlx::query(&query)
                    .bind(id.to_string())
                    .fetch_optional(&self.pool),
            )
            .map_err(|e| map_sqlx_error("get", e))?;
        row.as_ref().map(descriptor_from_row).transpose()
    }

    fn all(&self) -> Result<Vec<JobDescriptor>, JobStoreError> {
        let query = format!("{SELECT_COLUMNS} ORDER BY seq ASC");
        let rows = self
            .runtime
            .block_on(sqlx::query(&query).fetch_all(&self.pool))
            .map_err(|e| map_sqlx_error("all", e))?;
        rows.iter().map(descriptor_from_row).collect()
    }

    #[instrument(skip(self), fields(job_id = %id), err)]
    fn update_attempt(
        &self,
        id: JobId,
        attempt_count: u32,
        next_run_at: Option<DateTime<Utc>>,
    ) -> Result<(), JobStoreError> {
        let _guard = self.lock()?;
        let done = self
            .runtime
            .block_on(
                sqlx::query(
                    r#"
                    UPDATE job_spec
                    SET attempt_count = ?2, next_run_at = ?3, state = ?4
                    WHERE id = ?1
                    "#,
                )
                .bind(id.to_string())
                .bind(i64::from(attempt_count))
                .bind(next_run_at.map(|t| t.to_rfc3339()))
                .bind(JobState::RetryPending.as_str())
                .execute(&self.pool),
            )
            .map_err(|e| map_sqlx_error("update_attempt", e))?;

        if done.rows_affected() == 0 {
            return Err(JobStoreError::NotFound(id));
        }
        Ok(())
    }

    fn mark_running(&self, id: JobId) -> Result<bool, JobStoreError> {
        let _guard = self.lock()?;
        let done = self
            .runtime
            .block_on(
                sqlx::query("UPDATE job_spec SET state = ?2 WHERE id = ?1 AND state != ?2")
                    .bind(id.to_string())
                    .bind(JobState::Running.as_str())
                    .execute(&self.pool),
            )
            .map_err(|e| map_sqlx_error("mark_running", e))?;
        Ok(done.rows_affected() == 1)
    }

    #[instrument(skip(self), fields(job_id = %id), err)]
    fn remove_pending(&self, id: JobId) -> Result<bool, JobStoreError> {
        let _guard = self.lock()?;
        let done = self
            .runtime
            .block_on(
                sqlx::query("DELETE FROM job_spec WHERE id = ?1 AND state != ?2")
                    .bind(id.to_string())
                    .bind(JobState::Running.as_str())
                    .execute(&self.pool),
            )
            .map_err(|e| map_sqlx_error("remove_pending", e))?;
        Ok(done.rows_affected() > 0)
    }

    #[instrument(skip(self), err)]
    fn reset_running(&self) -> Result<usize, JobStoreError> {
        let _guard = self.lock()?;
        let done = self
            .runtime
            .block_on(
                sqlx::query("UPDATE job_spec SET state = ?1 WHERE state = ?2")
                    .bind(JobState::Pending.as_str())
                    .bind(JobState::Running.as_str())
                    .execute(&self.pool),
            )
            .map_err(|e| map_sqlx_error("reset_running", e))?;
        Ok(done.rows_affected() as usize)
    }
}

impl MigrationMarkerStore for SqliteJobStore {
    fn version(&self) -> Result<u32, JobStoreError> {
        let row = self
            .runtime
            .block_on(
                sqlx::query("SELECT version FROM migration_marker WHERE id = 1")
                    .fetch_optional(&self.pool),
            )
            .map_err(|e| map_sqlx_error("migration_version", e))?;

        match row {
            Some(row) => {
                let version: i64 = row
                    .try_get("version")
                    .map_err(|e| JobStoreError::Corrupt(e.to_string()))?;
                u32::try_from(version)
                    .map_err(|_| JobStoreError::Corrupt(format!("invalid migration version {version}")))
            }
            None => Ok(0),
        }
    }

    #[instrument(skip(self), err)]
    fn set_version(&self, version: u32) -> Result<(), JobStoreError> {
        let _guard = self.lock()?;
        self.runtime
            .block_on(
                sqlx::query(
                    r#"
                    INSERT INTO migration_marker (id, version) VALUES (1, ?1)
                    ON CONFLICT (id) DO UPDATE SET version = excluded.version
                    "#,
                )
                .bind(i64::from(version))
                .execute(&self.pool),
            )
            .map_err(|e| map_sqlx_error("set_migration_version", e))?;
        Ok(())
    }
}

fn descriptor_from_row(row: &SqliteRow) -> Result<JobDescriptor, JobStoreError> {
    fn column<'r, T>(row: &'r SqliteRow, name: &str) -> Result<T, JobStoreError>
    where
        T: sqlx::Decode<'r, sqlx::Sqlite> + sqlx::Type<sqlx::Sqlite>,
    {
        row.try_get(name)
            .map_err(|e| JobStoreError::Corrupt(format!("column {name}: {e}")))
    }

    fn timestamp(value: &str) -> Result<DateTime<Utc>, JobStoreError> {
        DateTime::parse_from_rfc3339(value)
            .map(|t| t.with_timezone(&Utc))
            .map_err(|e| JobStoreError::Corrupt(format!("timestamp {value}: {e}")))
    }

    let id: String = column(row, "id")?;
    let constraints: String = column(row, "constraints")?;
    let created_at: String = column(row, "created_at")?;
    let next_run_at: Option<String> = column(row, "next_run_at")?;
    let state: String = column(row, "state")?;
    let seq: i64 = column(row, "seq")?;
    let attempt_count: i64 = column(row, "attempt_count")?;
    let max_attempts: Option<i64> = column(row, "max_attempts")?;
    let lifespan_ms: Option<i64> = column(row, "lifespan_ms")?;
    let max_instances: Option<i64> = column(row, "max_instances")?;

    Ok(JobDescriptor {
        id: JobId::from_str(&id).map_err(|e| JobStoreError::Corrupt(format!("id {id}: {e}")))?,
        factory_key: column(row, "factory_key")?,
        queue_key: column(row, "queue_key")?,
        serialized_data: column(row, "serialized_data")?,
        constraints: serde_json::from_str(&constraints)
            .map_err(|e| JobStoreError::Corrupt(format!("constraints: {e}")))?,
        max_attempts: max_attempts.map(|n| n.max(0) as u32),
        lifespan: lifespan_ms.map(|ms| Duration::from_millis(ms.max(0) as u64)),
        max_instances_for_factory: max_instances.map(|n| n.max(0) as usize),
        created_at: timestamp(&created_at)?,
        attempt_count: attempt_count.max(0) as u32,
        next_run_at: next_run_at.as_deref().map(timestamp).transpose()?,
        sequence: seq as u64,
        state: JobState::from_str(&state).map_err(JobStoreError::Corrupt)?,
    })
}

fn map_sqlx_error(operation: &str, err: sqlx::Error) -> JobStoreError {
    match err {
        sqlx::Error::Database(db_err) => {
            JobStoreError::Storage(format!("database error in {operation}: {}", db_err.message()))
        }
        sqlx::Error::PoolClosed => {
            JobStoreError::Storage(format!("connection pool closed in {operation}"))
        }
        other => JobStoreError::Storage(format!("sqlite error in {operation}: {other}")),
    }
}
