//! rollcall-attendance — Attendance marking and remote synchronization.
//!
//! A successful face match becomes at most one attendance record per
//! student, class and local calendar day. Records are committed to a local
//! SQLite database first and mirrored to a remote key-value store later.

pub mod clock;
pub mod engine;
pub mod reconciler;
pub mod record;
pub mod remote;
pub mod retry;
pub mod scheduler;
pub mod store;

#[cfg(test)]
mod testing;

pub use clock::{Clock, SystemClock};
pub use engine::{spawn_embedder, CheckIn, CheckInOutcome, EmbedderHandle, EngineError};
pub use reconciler::{AttendanceError, Reconciler, ReconcilerOptions};
pub use record::{AttendanceRecord, AttendanceStatus, AttendanceSummary, SyncStatus};
pub use remote::{HttpRemoteStore, RemoteError, RemoteStore};
pub use retry::RetryPolicy;
pub use scheduler::{FlushReport, SyncError, SyncHandle, SyncOptions, SyncScheduler};
pub use store::{GalleryStore, InsertOutcome, LocalStore, SqliteStore, StoreError};
