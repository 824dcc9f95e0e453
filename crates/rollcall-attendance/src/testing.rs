//! Shared fakes for unit tests.

use crate::clock::Clock;
use crate::record::{AttendanceRecord, AttendanceStatus, AttendanceSummary, SyncStatus};
use crate::remote::{RemoteError, RemoteStore};
use crate::store::{InsertOutcome, LocalStore, SqliteStore, StoreError};
use async_trait::async_trait;
use chrono::{DateTime, Local, NaiveDate, TimeZone, Utc};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Mutex;
use std::time::Duration;

pub fn record_on(id: &str, student: &str, class: &str, date: NaiveDate, hour: u32) -> AttendanceRecord {
    AttendanceRecord {
        id: id.into(),
        student_id: student.into(),
        class_id: class.into(),
        timestamp: date.and_hms_opt(hour, 0, 0).unwrap().and_utc(),
        date,
        status: AttendanceStatus::Present,
        confidence: 0.9,
        device_id: "test-device".into(),
        sync_status: SyncStatus::Pending,
    }
}

/// Settable local clock.
pub struct FixedClock(Mutex<DateTime<Local>>);

impl FixedClock {
    pub fn at(y: i32, m: u32, d: u32, h: u32) -> Self {
        Self(Mutex::new(Local.with_ymd_and_hms(y, m, d, h, 0, 0).single().unwrap()))
    }

    pub fn set(&self, y: i32, m: u32, d: u32, h: u32) {
        *self.0.lock().unwrap() = Local.with_ymd_and_hms(y, m, d, h, 0, 0).single().unwrap();
    }
}

impl Clock for FixedClock {
    fn now(&self) -> DateTime<Local> {
        *self.0.lock().unwrap()
    }
}

/// In-memory remote that records every call and fails chosen paths.
#[derive(Default)]
pub struct FakeRemote {
    calls: Mutex<Vec<String>>,
    failing: Mutex<HashSet<String>>,
    fail_all: AtomicBool,
    delay: Mutex<Option<Duration>>,
    values: Mutex<HashMap<String, serde_json::Value>>,
}

impl FakeRemote {
    pub fn fail_path(&self, path: &str) {
        self.failing.lock().unwrap().insert(path.to_owned());
    }

    pub fn heal_path(&self, path: &str) {
        self.failing.lock().unwrap().remove(path);
    }

    pub fn set_fail_all(&self, fail: bool) {
        self.fail_all.store(fail, Ordering::SeqCst);
    }

    pub fn set_delay(&self, delay: Duration) {
        *self.delay.lock().unwrap() = Some(delay);
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    pub fn stored(&self, path: &str) -> Option<serde_json::Value> {
        self.values.lock().unwrap().get(path).cloned()
    }
}

#[async_trait]
impl RemoteStore for FakeRemote {
    async fn put(&self, path: &str, value: &serde_json::Value) -> Result<(), RemoteError> {
        self.calls.lock().unwrap().push(path.to_owned());

        let delay = *self.delay.lock().unwrap();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let fail = self.fail_all.load(Ordering::SeqCst) || self.failing.lock().unwrap().contains(path);
        if fail {
            return Err(RemoteError::Rejected {
                status: 503,
                body: "unavailable".into(),
            });
        }

        self.values.lock().unwrap().insert(path.to_owned(), value.clone());
        Ok(())
    }
}

/// SQLite store that can be told to fail `pending` or `insert`.
#[derive(Clone)]
pub struct FlakyStore {
    inner: SqliteStore,
    pending_failures: std::sync::Arc<AtomicU32>,
    fail_inserts: std::sync::Arc<AtomicBool>,
}

impl FlakyStore {
    pub fn new(inner: SqliteStore) -> Self {
        Self {
            inner,
            pending_failures: Default::default(),
            fail_inserts: Default::default(),
        }
    }

    /// Fail the next `n` calls to `pending`.
    pub fn fail_pending(&self, n: u32) {
        self.pending_failures.store(n, Ordering::SeqCst);
    }

    pub fn set_fail_inserts(&self, fail: bool) {
        self.fail_inserts.store(fail, Ordering::SeqCst);
    }

    fn unavailable() -> StoreError {
        StoreError::Sqlite(tokio_rusqlite::Error::ConnectionClosed)
    }
}

#[async_trait]
impl LocalStore for FlakyStore {
    async fn find(
        &self,
        student_id: &str,
        class_id: &str,
        date: NaiveDate,
    ) -> Result<Option<AttendanceRecord>, StoreError> {
        self.inner.find(student_id, class_id, date).await
    }

    async fn get(&self, id: &str) -> Result<Option<AttendanceRecord>, StoreError> {
        self.inner.get(id).await
    }

    async fn insert(&self, record: &AttendanceRecord) -> Result<InsertOutcome, StoreError> {
        if self.fail_inserts.load(Ordering::SeqCst) {
            return Err(Self::unavailable());
        }
        self.inner.insert(record).await
    }

    async fn update_sync_status(&self, id: &str, status: SyncStatus) -> Result<bool, StoreError> {
        self.inner.update_sync_status(id, status).await
    }

    async fn pending(&self, limit: usize) -> Result<Vec<AttendanceRecord>, StoreError> {
        let remaining = self.pending_failures.load(Ordering::SeqCst);
        if remaining > 0 {
            self.pending_failures.store(remaining - 1, Ordering::SeqCst);
            return Err(Self::unavailable());
        }
        self.inner.pending(limit).await
    }

    async fn student_history(
        &self,
        student_id: &str,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<AttendanceRecord>, StoreError> {
        self.inner.student_history(student_id, limit, offset).await
    }

    async fn class_attendance(
        &self,
        class_id: &str,
        date: NaiveDate,
    ) -> Result<Vec<AttendanceRecord>, StoreError> {
        self.inner.class_attendance(class_id, date).await
    }

    async fn summary(&self, student_id: &str) -> Result<AttendanceSummary, StoreError> {
        self.inner.summary(student_id).await
    }

    async fn delete_synced_before(&self, cutoff: DateTime<Utc>) -> Result<usize, StoreError> {
        self.inner.delete_synced_before(cutoff).await
    }
}
