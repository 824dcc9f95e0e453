use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Root of the remote attendance tree.
pub const ATTENDANCE_PATH: &str = "attendance";

/// Calendar-date format used in storage and remote paths.
pub const DATE_FORMAT: &str = "%Y-%m-%d";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AttendanceStatus {
    Present,
    Late,
    Absent,
    Leave,
}

impl AttendanceStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Present => "PRESENT",
            Self::Late => "LATE",
            Self::Absent => "ABSENT",
            Self::Leave => "LEAVE",
        }
    }
}

impl fmt::Display for AttendanceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AttendanceStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "PRESENT" => Ok(Self::Present),
            "LATE" => Ok(Self::Late),
            "ABSENT" => Ok(Self::Absent),
            "LEAVE" => Ok(Self::Leave),
            other => Err(format!("unknown attendance status: {other}")),
        }
    }
}

/// Whether the remote mirror has acknowledged a record. `Synced` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncStatus {
    Pending,
    Synced,
}

impl SyncStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Synced => "synced",
        }
    }
}

impl FromStr for SyncStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "synced" => Ok(Self::Synced),
            other => Err(format!("unknown sync status: {other}")),
        }
    }
}

/// One attendance mark. At most one exists per (student, class, date).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttendanceRecord {
    pub id: String,
    pub student_id: String,
    pub class_id: String,
    pub timestamp: DateTime<Utc>,
    /// Local calendar date at marking time.
    pub date: NaiveDate,
    pub status: AttendanceStatus,
    pub confidence: f32,
    pub device_id: String,
    pub sync_status: SyncStatus,
}

impl AttendanceRecord {
    /// Remote key: `attendance/{classId}/{date}/{studentId}`.
    pub fn remote_path(&self) -> String {
        format!(
            "{ATTENDANCE_PATH}/{}/{}/{}",
            self.class_id,
            self.date.format(DATE_FORMAT),
            self.student_id
        )
    }

    /// JSON document written to the remote store. Sync status is local-only.
    pub fn to_remote_value(&self) -> serde_json::Value {
        serde_json::json!({
            "id": self.id,
            "studentId": self.student_id,
            "classId": self.class_id,
            "timestamp": self.timestamp.timestamp_millis(),
            "status": self.status.as_str(),
            "confidence": self.confidence,
            "deviceId": self.device_id,
        })
    }
}

/// Per-status totals for one student.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AttendanceSummary {
    pub total_present: u32,
    pub total_late: u32,
    pub total_absent: u32,
    pub total_leave: u32,
    /// (present + late) / total * 100; 0 when there are no records.
    pub attendance_percentage: f32,
}

impl AttendanceSummary {
    pub fn from_counts(present: u32, late: u32, absent: u32, leave: u32) -> Self {
        let total = present + late + absent + leave;
        let attendance_percentage = if total == 0 {
            0.0
        } else {
            (present + late) as f32 / total as f32 * 100.0
        };
        Self {
            total_present: present,
            total_late: late,
            total_absent: absent,
            total_leave: leave,
            attendance_percentage,
        }
    }

    pub fn total(&self) -> u32 {
        self.total_present + self.total_late + self.total_absent + self.total_leave
    }
}
