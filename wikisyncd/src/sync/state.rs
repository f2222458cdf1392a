use std::path::Path;

use serde::{Deserialize, Serialize};
use sqlx::sqlite::{SqliteConnectOptions, SqliteRow};
use sqlx::{Row, SqlitePool, migrate::Migrator};
use thiserror::Error;

static MIGRATOR: Migrator = sqlx::migrate!("./migrations");

#[derive(Debug, Error)]
pub enum StateError {
    #[error("database error: {0}")]
    Sqlx(#[from] sqlx::Error),
    #[error("migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("failure list is not valid JSON: {0}")]
    Json(#[from] serde_json::Error),
    #[error("invalid run outcome: {0}")]
    InvalidOutcome(String),
}

/// One promoted version of one tracked file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LocalFileRecord {
    pub name: String,
    pub version_id: i64,
    pub digest: Option<String>,
    pub etag: Option<String>,
    pub size: i64,
    pub remote_modified: Option<i64>,
    pub downloaded_at: i64,
    pub unpacked_at: i64,
    pub artifact_name: String,
    pub artifact_size: i64,
    pub artifact_digest: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LatestRecord {
    pub name: String,
    pub version_id: i64,
    pub promoted_at: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunOutcome {
    Succeeded,
    /// Some files failed or were deferred; the others were promoted.
    PartialFailure,
    SkippedInsufficientResources,
    Failed,
    Cancelled,
}

impl RunOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunOutcome::Succeeded => "succeeded",
            RunOutcome::PartialFailure => "partial_failure",
            RunOutcome::SkippedInsufficientResources => "skipped_insufficient_resources",
            RunOutcome::Failed => "failed",
            RunOutcome::Cancelled => "cancelled",
        }
    }

    fn parse(value: &str) -> Result<Self, StateError> {
        match value {
            "succeeded" => Ok(RunOutcome::Succeeded),
            "partial_failure" => Ok(RunOutcome::PartialFailure),
            "skipped_insufficient_resources" => Ok(RunOutcome::SkippedInsufficientResources),
            "failed" => Ok(RunOutcome::Failed),
            "cancelled" => Ok(RunOutcome::Cancelled),
            other => Err(StateError::InvalidOutcome(other.to_string())),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    TransferInterrupted,
    TransferAborted,
    IntegrityMismatch,
    UnpackCorrupt,
    InsufficientResources,
    Cancelled,
    /// Local filesystem failure while staging the file.
    Storage,
    Promotion,
}

impl FailureKind {
    /// Deferred files are not failures: they are picked up by the next run.
    pub fn is_deferral(&self) -> bool {
        matches!(
            self,
            FailureKind::TransferAborted | FailureKind::InsufficientResources | FailureKind::Cancelled
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileFailure {
    pub name: String,
    pub kind: FailureKind,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunRecord {
    pub id: i64,
    pub started_at: i64,
    pub finished_at: i64,
    pub outcome: RunOutcome,
    pub files_planned: u32,
    pub files_transferred: u32,
    pub files_failed: u32,
    pub files_deferred: u32,
    pub bytes_transferred: i64,
    pub error: Option<String>,
    pub failures: Vec<FileFailure>,
}

impl RunRecord {
    pub fn started(started_at: i64) -> Self {
        Self {
            id: 0,
            started_at,
            finished_at: started_at,
            outcome: RunOutcome::Succeeded,
            files_planned: 0,
            files_transferred: 0,
            files_failed: 0,
            files_deferred: 0,
            bytes_transferred: 0,
            error: None,
            failures: Vec::new(),
        }
    }

    pub fn record_failure(&mut self, failure: FileFailure) {
        if failure.kind.is_deferral() {
            self.files_deferred += 1;
        } else {
            self.files_failed += 1;
        }
        self.failures.push(failure);
    }
}

#[derive(Clone)]
pub struct StateStore {
    pool: SqlitePool,
}

const RECORD_COLUMNS: &str = "name, version_id, digest, etag, size, remote_modified, downloaded_at, unpacked_at, artifact_name, artifact_size, artifact_digest";

impl StateStore {
    pub fn from_pool(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn new(database_url: &str) -> Result<Self, StateError> {
        let pool = SqlitePool::connect(database_url).await?;
        let store = Self { pool };
        store.init().await?;
        Ok(store)
    }

    pub async fn open(db_path: &Path) -> Result<Self, StateError> {
        if let Some(parent) = db_path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let options = SqliteConnectOptions::new()
            .filename(db_path)
            .create_if_missing(true);
        let pool = SqlitePool::connect_with(options).await?;
        let store = Self { pool };
        store.init().await?;
        Ok(store)
    }

    pub async fn init(&self) -> Result<(), StateError> {
        MIGRATOR.run(&self.pool).await?;
        Ok(())
    }

    /// Records a promoted version and makes it the latest one in a single transaction.
    pub async fn commit_promotion(
        &self,
        record: &LocalFileRecord,
        promoted_at: i64,
    ) -> Result<(), StateError> {
        let mut tx = self.pool.begin().await?;
        sqlx::query(
            "
            INSERT INTO file_records (
                name,
                version_id,
                digest,
                etag,
                size,
                remote_modified,
                downloaded_at,
                unpacked_at,
                artifact_name,
                artifact_size,
                artifact_digest
            )
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)
            ON CONFLICT(name, version_id) DO UPDATE SET
                digest = excluded.digest,
                etag = excluded.etag,
                size = excluded.size,
                remote_modified = excluded.remote_modified,
                downloaded_at = excluded.downloaded_at,
                unpacked_at = excluded.unpacked_at,
                artifact_name = excluded.artifact_name,
                artifact_size = excluded.artifact_size,
                artifact_digest = excluded.artifact_digest;
            ",
        )
        .bind(&record.name)
        .bind(record.version_id)
        .bind(&record.digest)
        .bind(&record.etag)
        .bind(record.size)
        .bind(record.remote_modified)
        .bind(record.downloaded_at)
        .bind(record.unpacked_at)
        .bind(&record.artifact_name)
        .bind(record.artifact_size)
        .bind(&record.artifact_digest)
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            "
            INSERT INTO latest (name, version_id, promoted_at)
            VALUES (?1, ?2, ?3)
            ON CONFLICT(name) DO UPDATE SET
                version_id = excluded.version_id,
                promoted_at = excluded.promoted_at;
            ",
        )
        .bind(&record.name)
        .bind(record.version_id)
        .bind(promoted_at)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(())
    }

    pub async fn get_record(
        &self,
        name: &str,
        version_id: i64,
    ) -> Result<Option<LocalFileRecord>, StateError> {
        let row = sqlx::query(&format!(
            "SELECT {RECORD_COLUMNS} FROM file_records WHERE name = ?1 AND version_id = ?2"
        ))
        .bind(name)
        .bind(version_id)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(record_from_row).transpose()
    }

    /// All recorded versions of `name`, newest first.
    pub async fn list_records(&self, name: &str) -> Result<Vec<LocalFileRecord>, StateError> {
        let rows = sqlx::query(&format!(
            "SELECT {RECORD_COLUMNS} FROM file_records WHERE name = ?1 ORDER BY version_id DESC"
        ))
        .bind(name)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(record_from_row).collect()
    }

    pub async fn tracked_names(&self) -> Result<Vec<String>, StateError> {
        let rows = sqlx::query("SELECT DISTINCT name FROM file_records ORDER BY name ASC")
            .fetch_all(&self.pool)
            .await?;
        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            out.push(row.try_get("name")?);
        }
        Ok(out)
    }

    pub async fn max_version_id(&self, name: &str) -> Result<Option<i64>, StateError> {
        let row = sqlx::query("SELECT MAX(version_id) AS max_id FROM file_records WHERE name = ?1")
            .bind(name)
            .fetch_one(&self.pool)
            .await?;
        Ok(row.try_get("max_id")?)
    }

    pub async fn get_latest(&self, name: &str) -> Result<Option<LatestRecord>, StateError> {
        let row = sqlx::query("SELECT name, version_id, promoted_at FROM latest WHERE name = ?1")
            .bind(name)
            .fetch_optional(&self.pool)
            .await?;
        let Some(row) = row else {
            return Ok(None);
        };
        Ok(Some(LatestRecord {
            name: row.try_get("name")?,
            version_id: row.try_get("version_id")?,
            promoted_at: row.try_get("promoted_at")?,
        }))
    }

    /// Latest pointer of every file joined with the record it resolves to.
    pub async fn latest_records(&self) -> Result<Vec<(LatestRecord, LocalFileRecord)>, StateError> {
        let rows = sqlx::query(
            "SELECT l.promoted_at, r.name, r.version_id, r.digest, r.etag, r.size, r.remote_modified,
                    r.downloaded_at, r.unpacked_at, r.artifact_name, r.artifact_size, r.artifact_digest
             FROM latest l
             JOIN file_records r ON r.name = l.name AND r.version_id = l.version_id
             ORDER BY l.name ASC",
        )
        .fetch_all(&self.pool)
        .await?;

        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            let record = record_from_row(&row)?;
            out.push((
                LatestRecord {
                    name: record.name.clone(),
                    version_id: record.version_id,
                    promoted_at: row.try_get("promoted_at")?,
                },
                record,
            ));
        }
        Ok(out)
    }

    /// Fails on the latest version: the `latest` table references it.
    pub async fn delete_record(&self, name: &str, version_id: i64) -> Result<(), StateError> {
        sqlx::query("DELETE FROM file_records WHERE name = ?1 AND version_id = ?2")
            .bind(name)
            .bind(version_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn insert_run(&self, run: &RunRecord) -> Result<i64, StateError> {
        let failures = serde_json::to_string(&run.failures)?;
        let result = sqlx::query(
            "
            INSERT INTO runs (
                started_at,
                finished_at,
                outcome,
                files_planned,
                files_transferred,
                files_failed,
                files_deferred,
                bytes_transferred,
                error,
                failures
            )
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
            ",
        )
        .bind(run.started_at)
        .bind(run.finished_at)
        .bind(run.outcome.as_str())
        .bind(i64::from(run.files_planned))
        .bind(i64::from(run.files_transferred))
        .bind(i64::from(run.files_failed))
        .bind(i64::from(run.files_deferred))
        .bind(run.bytes_transferred)
        .bind(&run.error)
        .bind(failures)
        .execute(&self.pool)
        .await?;
        Ok(result.last_insert_rowid())
    }

    pub async fn last_run(&self) -> Result<Option<RunRecord>, StateError> {
        Ok(self.recent_runs(1).await?.into_iter().next())
    }

    pub async fn recent_runs(&self, limit: u32) -> Result<Vec<RunRecord>, StateError> {
        let rows = sqlx::query(
            "SELECT id, started_at, finished_at, outcome, files_planned, files_transferred,
                    files_failed, files_deferred, bytes_transferred, error, failures
             FROM runs
             ORDER BY id DESC
             LIMIT ?1",
        )
        .bind(i64::from(limit))
        .fetch_all(&self.pool)
        .await?;

        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            let outcome: String = row.try_get("outcome")?;
            let failures: String = row.try_get("failures")?;
            out.push(RunRecord {
                id: row.try_get("id")?,
                started_at: row.try_get("started_at")?,
                finished_at: row.try_get("finished_at")?,
                outcome: RunOutcome::parse(&outcome)?,
                files_planned: count(&row, "files_planned")?,
                files_transferred: count(&row, "files_transferred")?,
                files_failed: count(&row, "files_failed")?,
                files_deferred: count(&row, "files_deferred")?,
                bytes_transferred: row.try_get("bytes_transferred")?,
                error: row.try_get("error")?,
                failures: serde_json::from_str(&failures)?,
            });
        }
        Ok(out)
    }
}

fn record_from_row(row: &SqliteRow) -> Result<LocalFileRecord, StateError> {
    Ok(LocalFileRecord {
        name: row.try_get("name")?,
        version_id: row.try_get("version_id")?,
        digest: row.try_get("digest")?,
        etag: row.try_get("etag")?,
        size: row.try_get("size")?,
        remote_modified: row.try_get("remote_modified")?,
        downloaded_at: row.try_get("downloaded_at")?,
        unpacked_at: row.try_get("unpacked_at")?,
        artifact_name: row.try_get("artifact_name")?,
        artifact_size: row.try_get("artifact_size")?,
        artifact_digest: row.try_get("artifact_digest")?,
    })
}

fn count(row: &SqliteRow, column: &str) -> Result<u32, StateError> {
    let value: i64 = row.try_get(column)?;
    Ok(u32::try_from(value.max(0)).unwrap_or(u32::MAX))
}

#[cfg(test)]
#[path = "state_tests.rs"]
mod tests;
