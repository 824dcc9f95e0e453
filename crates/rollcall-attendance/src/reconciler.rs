//! Attendance reconciler: at-most-one mark per (student, class, day).
//!
//! Marking commits to the local store first; the remote write that follows
//! is best-effort and its failure only leaves the record pending for the
//! sync scheduler.

use crate::clock::Clock;
use crate::record::{AttendanceRecord, AttendanceStatus, AttendanceSummary, SyncStatus};
use crate::remote::{put_with_timeout, RemoteStore};
use crate::retry::{retry_with_backoff, RetryPolicy};
use crate::store::{InsertOutcome, LocalStore, StoreError};
use chrono::{NaiveDate, Utc};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

/// Characters that cannot appear in a remote path segment. Control
/// characters are rejected as well.
const FORBIDDEN_KEY_CHARS: &[char] = &['/', '.', '#', '$', '[', ']', '?'];

#[derive(Error, Debug)]
pub enum AttendanceError {
    #[error("attendance already marked for student {student_id} in class {class_id} on {date}")]
    Duplicate {
        student_id: String,
        class_id: String,
        date: NaiveDate,
    },
    #[error("local persistence failed: {0}")]
    Persistence(#[from] StoreError),
    #[error("invalid input: {0}")]
    InvalidInput(String),
}

#[derive(Debug, Clone)]
pub struct ReconcilerOptions {
    /// Recorded on every mark made by this device.
    pub device_id: String,
    /// Upper bound on each remote write attempt.
    pub remote_timeout: Duration,
    /// Attempts for the immediate remote write after a local commit.
    pub immediate_retry: RetryPolicy,
}

impl Default for ReconcilerOptions {
    fn default() -> Self {
        Self {
            device_id: "unknown-device".to_string(),
            remote_timeout: Duration::from_secs(15),
            immediate_retry: RetryPolicy::once(),
        }
    }
}

pub struct Reconciler {
    store: Arc<dyn LocalStore>,
    remote: Arc<dyn RemoteStore>,
    clock: Arc<dyn Clock>,
    options: ReconcilerOptions,
}

impl Reconciler {
    pub fn new(
        store: Arc<dyn LocalStore>,
        remote: Arc<dyn RemoteStore>,
        clock: Arc<dyn Clock>,
        options: ReconcilerOptions,
    ) -> Self {
        Self {
            store,
            remote,
            clock,
            options,
        }
    }

    /// Record `student_id` as present in `class_id` for today.
    ///
    /// Fails with [`AttendanceError::Duplicate`] if a mark already exists for
    /// today's local date, and with [`AttendanceError::Persistence`] if the
    /// local write fails. Remote failures are logged and swallowed; the
    /// returned record says whether the immediate write got through.
    pub async fn mark_attendance(
        &self,
        student_id: &str,
        class_id: &str,
        confidence: f32,
    ) -> Result<AttendanceRecord, AttendanceError> {
        validate_key("student_id", student_id)?;
        validate_key("class_id", class_id)?;
        if !confidence.is_finite() {
            return Err(AttendanceError::InvalidInput(format!(
                "confidence must be finite, got {confidence}"
            )));
        }

        let now = self.clock.now();
        let date = now.date_naive();

        if self.store.find(student_id, class_id, date).await?.is_some() {
            tracing::info!(student_id, class_id, %date, "attendance already marked today");
            return Err(duplicate(student_id, class_id, date));
        }

        let mut record = AttendanceRecord {
            id: uuid::Uuid::new_v4().to_string(),
            student_id: student_id.to_owned(),
            class_id: class_id.to_owned(),
            timestamp: now.with_timezone(&Utc),
            date,
            status: AttendanceStatus::Present,
            confidence,
            device_id: self.options.device_id.clone(),
            sync_status: SyncStatus::Pending,
        };

        // The constraint is authoritative: a concurrent mark may have
        // committed between the lookup above and this insert.
        if self.store.insert(&record).await? == InsertOutcome::Duplicate {
            tracing::info!(student_id, class_id, %date, "concurrent mark won the race");
            return Err(duplicate(student_id, class_id, date));
        }

        tracing::info!(
            record_id = %record.id,
            student_id,
            class_id,
            %date,
            confidence,
            "attendance marked"
        );

        if self.push_immediately(&record).await {
            record.sync_status = SyncStatus::Synced;
        }

        Ok(record)
    }

    /// Best-effort remote write of a freshly committed record.
    async fn push_immediately(&self, record: &AttendanceRecord) -> bool {
        let path = record.remote_path();
        let value = record.to_remote_value();
        let (remote, path_ref, value_ref) = (self.remote.as_ref(), path.as_str(), &value);
        let timeout = self.options.remote_timeout;

        let pushed = retry_with_backoff(&self.options.immediate_retry, "immediate sync", move || {
            put_with_timeout(remote, path_ref, value_ref, timeout)
        })
        .await;

        if let Err(e) = pushed {
            tracing::warn!(
                record_id = %record.id,
                path = %path,
                error = %e,
                "immediate remote write failed; left pending"
            );
            return false;
        }

        match self.store.update_sync_status(&record.id, SyncStatus::Synced).await {
            Ok(_) => true,
            Err(e) => {
                tracing::warn!(
                    record_id = %record.id,
                    error = %e,
                    "remote write succeeded but local sync status update failed"
                );
                false
            }
        }
    }

    pub async fn student_history(
        &self,
        student_id: &str,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<AttendanceRecord>, AttendanceError> {
        Ok(self.store.student_history(student_id, limit, offset).await?)
    }

    pub async fn class_attendance(
        &self,
        class_id: &str,
        date: NaiveDate,
    ) -> Result<Vec<AttendanceRecord>, AttendanceError> {
        Ok(self.store.class_attendance(class_id, date).await?)
    }

    pub async fn summary(&self, student_id: &str) -> Result<AttendanceSummary, AttendanceError> {
        Ok(self.store.summary(student_id).await?)
    }
}

fn duplicate(student_id: &str, class_id: &str, date: NaiveDate) -> AttendanceError {
    AttendanceError::Duplicate {
        student_id: student_id.to_owned(),
        class_id: class_id.to_owned(),
        date,
    }
}

fn validate_key(name: &str, value: &str) -> Result<(), AttendanceError> {
    if value.trim().is_empty() {
        return Err(AttendanceError::InvalidInput(format!("{name} is empty")));
    }
    if value.contains(FORBIDDEN_KEY_CHARS) || value.chars().any(char::is_control) {
        return Err(AttendanceError::InvalidInput(format!(
            "{name} {value:?} contains a reserved path character"
        )));
    }
    Ok(())
}
