//! Local attendance and gallery storage.
//!
//! The local database is the source of truth for "was attendance already
//! marked today" and owns every record's sync status. Uniqueness of
//! (student, class, date) is enforced by a UNIQUE constraint so concurrent
//! writers cannot both commit a mark for the same key.

use crate::record::{AttendanceRecord, AttendanceStatus, AttendanceSummary, SyncStatus, DATE_FORMAT};
use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use rollcall_core::{Embedding, GalleryEntry};
use rusqlite::{params, OptionalExtension, Row};
use std::path::Path;
use thiserror::Error;
use tokio_rusqlite::Connection;

const SCHEMA: &str = include_str!("schema.sql");

const PRAGMAS: &str = "PRAGMA journal_mode = WAL;
     PRAGMA synchronous = NORMAL;
     PRAGMA busy_timeout = 5000;";

const RECORD_COLUMNS: &str = "id, student_id, class_id, attendance_date, timestamp_ms, \
     status, confidence, device_id, sync_status";

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("sqlite: {0}")]
    Sqlite(#[from] tokio_rusqlite::Error),
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
    #[error("corrupt row: {0}")]
    Corrupt(String),
}

/// Result of inserting an attendance record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertOutcome {
    Inserted,
    /// A record for the same (student, class, date) already exists.
    Duplicate,
}

/// Attendance persistence primitives the reconciler and scheduler depend on.
#[async_trait]
pub trait LocalStore: Send + Sync {
    async fn find(
        &self,
        student_id: &str,
        class_id: &str,
        date: NaiveDate,
    ) -> Result<Option<AttendanceRecord>, StoreError>;

    async fn get(&self, id: &str) -> Result<Option<AttendanceRecord>, StoreError>;

    /// Atomically insert, reporting a uniqueness violation as `Duplicate`.
    async fn insert(&self, record: &AttendanceRecord) -> Result<InsertOutcome, StoreError>;

    /// Set the sync status. A `Synced` record never changes again; returns
    /// whether a row was updated.
    async fn update_sync_status(&self, id: &str, status: SyncStatus) -> Result<bool, StoreError>;

    /// Up to `limit` pending records, oldest first.
    async fn pending(&self, limit: usize) -> Result<Vec<AttendanceRecord>, StoreError>;

    /// A student's records, newest first.
    async fn student_history(
        &self,
        student_id: &str,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<AttendanceRecord>, StoreError>;

    /// All records of a class on one date, oldest first.
    async fn class_attendance(
        &self,
        class_id: &str,
        date: NaiveDate,
    ) -> Result<Vec<AttendanceRecord>, StoreError>;

    async fn summary(&self, student_id: &str) -> Result<AttendanceSummary, StoreError>;

    /// Delete synced records older than `cutoff`. Pending records are kept.
    async fn delete_synced_before(&self, cutoff: DateTime<Utc>) -> Result<usize, StoreError>;
}

/// Registered face embeddings of enrolled students.
#[async_trait]
pub trait GalleryStore: Send + Sync {
    async fn register_embedding(
        &self,
        student_id: &str,
        embedding: &Embedding,
    ) -> Result<GalleryEntry, StoreError>;

    /// Entries of active students, in registration order.
    async fn load_gallery(&self) -> Result<Vec<GalleryEntry>, StoreError>;

    /// Exclude a student's entries from matching. Returns the number of entries affected.
    async fn deactivate_student(&self, student_id: &str) -> Result<usize, StoreError>;
}

/// Row as stored, before parsing dates and enums.
struct RawRecord {
    id: String,
    student_id: String,
    class_id: String,
    date: String,
    timestamp_ms: i64,
    status: String,
    confidence: f64,
    device_id: String,
    sync_status: String,
}

fn raw_from_row(row: &Row<'_>) -> rusqlite::Result<RawRecord> {
    Ok(RawRecord {
        id: row.get(0)?,
        student_id: row.get(1)?,
        class_id: row.get(2)?,
        date: row.get(3)?,
        timestamp_ms: row.get(4)?,
        status: row.get(5)?,
        confidence: row.get(6)?,
        device_id: row.get(7)?,
        sync_status: row.get(8)?,
    })
}

impl RawRecord {
    fn into_record(self) -> Result<AttendanceRecord, StoreError> {
        let date = NaiveDate::parse_from_str(&self.date, DATE_FORMAT)
            .map_err(|e| StoreError::Corrupt(format!("record {}: date {:?}: {e}", self.id, self.date)))?;
        let status = self
            .status
            .parse::<AttendanceStatus>()
            .map_err(|e| StoreError::Corrupt(format!("record {}: {e}", self.id)))?;
        let sync_status = self
            .sync_status
            .parse::<SyncStatus>()
            .map_err(|e| StoreError::Corrupt(format!("record {}: {e}", self.id)))?;

        Ok(AttendanceRecord {
            timestamp: from_millis(self.timestamp_ms)?,
            id: self.id,
            student_id: self.student_id,
            class_id: self.class_id,
            date,
            status,
            confidence: self.confidence as f32,
            device_id: self.device_id,
            sync_status,
        })
    }
}

fn into_records(raws: Vec<RawRecord>) -> Result<Vec<AttendanceRecord>, StoreError> {
    raws.into_iter().map(RawRecord::into_record).collect()
}

fn from_millis(ms: i64) -> Result<DateTime<Utc>, StoreError> {
    DateTime::from_timestamp_millis(ms)
        .ok_or_else(|| StoreError::Corrupt(format!("timestamp out of range: {ms}")))
}

fn is_unique_violation(err: &rusqlite::Error) -> bool {
    matches!(
        err,
        rusqlite::Error::SqliteFailure(e, _)
            if e.extended_code == rusqlite::ffi::SQLITE_CONSTRAINT_UNIQUE
    )
}

/// SQLite-backed store. Cheap to clone; all clones share one connection
/// thread, which serializes writes.
#[derive(Clone)]
pub struct SqliteStore {
    conn: Connection,
}

impl SqliteStore {
    /// Open (or create) the database file, creating parent directories.
    pub async fn open(path: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }
        let conn = Connection::open(path).await?;
        let store = Self::init(conn).await?;
        tracing::info!(path = %path.display(), "attendance database opened");
        Ok(store)
    }

    pub async fn open_in_memory() -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory().await?;
        Self::init(conn).await
    }

    async fn init(conn: Connection) -> Result<Self, StoreError> {
        conn.call(|conn| {
            conn.execute_batch(PRAGMAS)?;
            conn.execute_batch(SCHEMA)?;
            Ok(())
        })
        .await?;
        tracing::debug!("attendance schema initialized");
        Ok(Self { conn })
    }

    /// Close the connection. Other clones fail with `ConnectionClosed` afterwards.
    pub async fn close(self) -> Result<(), StoreError> {
        self.conn.close().await?;
        tracing::info!("attendance database closed");
        Ok(())
    }

    async fn query_records(
        &self,
        sql: String,
        args: Vec<rusqlite::types::Value>,
    ) -> Result<Vec<AttendanceRecord>, StoreError> {
        let raws = self
            .conn
            .call(move |conn| {
                let mut stmt = conn.prepare(&sql)?;
                let rows = stmt
                    .query_map(rusqlite::params_from_iter(args), raw_from_row)?
                    .collect::<rusqlite::Result<Vec<_>>>()?;
                Ok(rows)
            })
            .await?;
        into_records(raws)
    }
}

fn text(s: &str) -> rusqlite::types::Value {
    rusqlite::types::Value::Text(s.to_owned())
}

fn int(n: usize) -> rusqlite::types::Value {
    rusqlite::types::Value::Integer(i64::try_from(n).unwrap_or(i64::MAX))
}

#[async_trait]
impl LocalStore for SqliteStore {
    async fn find(
        &self,
        student_id: &str,
        class_id: &str,
        date: NaiveDate,
    ) -> Result<Option<AttendanceRecord>, StoreError> {
        let sql = format!(
            "SELECT {RECORD_COLUMNS} FROM attendance \
             WHERE student_id = ?1 AND class_id = ?2 AND attendance_date = ?3"
        );
        let args = vec![
            text(student_id),
            text(class_id),
            text(&date.format(DATE_FORMAT).to_string()),
        ];
        Ok(self.query_records(sql, args).await?.into_iter().next())
    }

    async fn get(&self, id: &str) -> Result<Option<AttendanceRecord>, StoreError> {
        let id = id.to_owned();
        let raw = self
            .conn
            .call(move |conn| {
                let raw = conn
                    .query_row(
                        &format!("SELECT {RECORD_COLUMNS} FROM attendance WHERE id = ?1"),
                        params![id],
                        raw_from_row,
                    )
                    .optional()?;
                Ok(raw)
            })
            .await?;
        raw.map(RawRecord::into_record).transpose()
    }

    async fn insert(&self, record: &AttendanceRecord) -> Result<InsertOutcome, StoreError> {
        let r = record.clone();
        let outcome = self
            .conn
            .call(move |conn| {
                let result = conn.execute(
                    "INSERT INTO attendance (id, student_id, class_id, attendance_date, \
                     timestamp_ms, status, confidence, device_id, sync_status) \
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
                    params![
                        r.id,
                        r.student_id,
                        r.class_id,
                        r.date.format(DATE_FORMAT).to_string(),
                        r.timestamp.timestamp_millis(),
                        r.status.as_str(),
                        r.confidence as f64,
                        r.device_id,
                        r.sync_status.as_str(),
                    ],
                );
                match result {
                    Ok(_) => Ok(InsertOutcome::Inserted),
                    Err(e) if is_unique_violation(&e) => Ok(InsertOutcome::Duplicate),
                    Err(e) => Err(e.into()),
                }
            })
            .await?;
        Ok(outcome)
    }

    async fn update_sync_status(&self, id: &str, status: SyncStatus) -> Result<bool, StoreError> {
        let id = id.to_owned();
        let changed = self
            .conn
            .call(move |conn| {
                let n = conn.execute(
                    "UPDATE attendance SET sync_status = ?2 WHERE id = ?1 AND sync_status != 'synced'",
                    params![id, status.as_str()],
                )?;
                Ok(n)
            })
            .await?;
        Ok(changed > 0)
    }

    async fn pending(&self, limit: usize) -> Result<Vec<AttendanceRecord>, StoreError> {
        let sql = format!(
            "SELECT {RECORD_COLUMNS} FROM attendance WHERE sync_status = 'pending' \
             ORDER BY timestamp_ms ASC, id ASC LIMIT ?1"
        );
        self.query_records(sql, vec![int(limit)]).await
    }

    async fn student_history(
        &self,
        student_id: &str,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<AttendanceRecord>, StoreError> {
        let sql = format!(
            "SELECT {RECORD_COLUMNS} FROM attendance WHERE student_id = ?1 \
             ORDER BY timestamp_ms DESC LIMIT ?2 OFFSET ?3"
        );
        self.query_records(sql, vec![text(student_id), int(limit), int(offset)])
            .await
    }

    async fn class_attendance(
        &self,
        class_id: &str,
        date: NaiveDate,
    ) -> Result<Vec<AttendanceRecord>, StoreError> {
        let sql = format!(
            "SELECT {RECORD_COLUMNS} FROM attendance WHERE class_id = ?1 AND attendance_date = ?2 \
             ORDER BY timestamp_ms ASC"
        );
        let args = vec![text(class_id), text(&date.format(DATE_FORMAT).to_string())];
        self.query_records(sql, args).await
    }

    async fn summary(&self, student_id: &str) -> Result<AttendanceSummary, StoreError> {
        let student_id = student_id.to_owned();
        let counts = self
            .conn
            .call(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT status, COUNT(*) FROM attendance WHERE student_id = ?1 GROUP BY status",
                )?;
                let rows = stmt
                    .query_map(params![student_id], |row| {
                        Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
                    })?
                    .collect::<rusqlite::Result<Vec<_>>>()?;
                Ok(rows)
            })
            .await?;

        let (mut present, mut late, mut absent, mut leave) = (0u32, 0u32, 0u32, 0u32);
        for (status, count) in counts {
            let count = u32::try_from(count).unwrap_or(u32::MAX);
            match status.parse::<AttendanceStatus>().map_err(StoreError::Corrupt)? {
                AttendanceStatus::Present => present = count,
                AttendanceStatus::Late => late = count,
                AttendanceStatus::Absent => absent = count,
                AttendanceStatus::Leave => leave = count,
            }
        }
        Ok(AttendanceSummary::from_counts(present, late, absent, leave))
    }

    async fn delete_synced_before(&self, cutoff: DateTime<Utc>) -> Result<usize, StoreError> {
        let cutoff_ms = cutoff.timestamp_millis();
        let deleted = self
            .conn
            .call(move |conn| {
                let n = conn.execute(
                    "DELETE FROM attendance WHERE sync_status = 'synced' AND timestamp_ms < ?1",
                    params![cutoff_ms],
                )?;
                Ok(n)
            })
            .await?;
        Ok(deleted)
    }
}

#[async_trait]
impl GalleryStore for SqliteStore {
    async fn register_embedding(
        &self,
        student_id: &str,
        embedding: &Embedding,
    ) -> Result<GalleryEntry, StoreError> {
        let registered_at = from_millis(Utc::now().timestamp_millis())?;
        let ms = registered_at.timestamp_millis();
        let sid = student_id.to_owned();
        let bytes = embedding.to_le_bytes();
        let version = embedding.model_version.clone();

        self.conn
            .call(move |conn| {
                conn.execute(
                    "INSERT INTO gallery (student_id, embedding, model_version, registered_at_ms) \
                     VALUES (?1, ?2, ?3, ?4)",
                    params![sid, bytes, version, ms],
                )?;
                Ok(())
            })
            .await?;

        tracing::info!(student_id, dim = embedding.dim(), "gallery embedding registered");
        Ok(GalleryEntry {
            student_id: student_id.to_owned(),
            embedding: embedding.clone(),
            registered_at,
        })
    }

    async fn load_gallery(&self) -> Result<Vec<GalleryEntry>, StoreError> {
        let rows = self
            .conn
            .call(|conn| {
                let mut stmt = conn.prepare(
                    "SELECT student_id, embedding, model_version, registered_at_ms \
                     FROM gallery WHERE active = 1 ORDER BY id ASC",
                )?;
                let rows = stmt
                    .query_map([], |row| {
                        Ok((
                            row.get::<_, String>(0)?,
                            row.get::<_, Vec<u8>>(1)?,
                            row.get::<_, Option<String>>(2)?,
                            row.get::<_, i64>(3)?,
                        ))
                    })?
                    .collect::<rusqlite::Result<Vec<_>>>()?;
                Ok(rows)
            })
            .await?;

        rows.into_iter()
            .map(|(student_id, blob, model_version, ms)| {
                let mut embedding = Embedding::from_le_bytes(&blob).ok_or_else(|| {
                    StoreError::Corrupt(format!(
                        "gallery embedding for {student_id}: {} bytes",
                        blob.len()
                    ))
                })?;
                embedding.model_version = model_version;
                Ok(GalleryEntry {
                    student_id,
                    embedding,
                    registered_at: from_millis(ms)?,
                })
            })
            .collect()
    }

    async fn deactivate_student(&self, student_id: &str) -> Result<usize, StoreError> {
        let sid = student_id.to_owned();
        let n = self
            .conn
            .call(move |conn| {
                let n = conn.execute(
                    "UPDATE gallery SET active = 0 WHERE student_id = ?1 AND active = 1",
                    params![sid],
                )?;
                Ok(n)
            })
            .await?;
        tracing::info!(student_id, entries = n, "student deactivated");
        Ok(n)
    }
}
