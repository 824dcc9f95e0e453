use anyhow::{bail, Result};
use rollcall_attendance::{RetryPolicy, SyncOptions};
use std::path::PathBuf;
use std::time::Duration;

/// Daemon configuration, loaded from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    /// Path to the SQLite attendance database.
    pub db_path: PathBuf,
    /// Base URL of the remote attendance store (required).
    pub remote_url: Option<String>,
    /// Auth token appended to remote writes.
    pub remote_auth: Option<String>,
    /// Timeout in seconds for a single remote write.
    pub remote_timeout_secs: u64,
    /// Seconds between scheduled sync cycles.
    pub sync_interval_secs: u64,
    /// Pending records pushed per cycle.
    pub sync_batch_limit: usize,
    /// Attempts per cycle when the local batch read fails.
    pub sync_max_attempts: u32,
    /// Synced records older than this many days are deleted. 0 disables the sweep.
    pub retention_days: u64,
}

impl Config {
    /// Load configuration from `ROLLCALL_*` environment variables with defaults.
    pub fn from_env() -> Self {
        Self::from_vars(|key| std::env::var(key).ok())
    }

    fn from_vars(var: impl Fn(&str) -> Option<String>) -> Self {
        let data_dir = var("XDG_DATA_HOME")
            .map(PathBuf::from)
            .unwrap_or_else(|| {
                let home = var("HOME").unwrap_or_else(|| "/tmp".to_string());
                PathBuf::from(home).join(".local/share")
            })
            .join("rollcall");

        let db_path = var("ROLLCALL_DB_PATH")
            .map(PathBuf::from)
            .unwrap_or_else(|| data_dir.join("attendance.db"));

        Self {
            db_path,
            remote_url: var("ROLLCALL_REMOTE_URL").filter(|v| !v.trim().is_empty()),
            remote_auth: var("ROLLCALL_REMOTE_AUTH").filter(|v| !v.is_empty()),
            remote_timeout_secs: parse_or(&var, "ROLLCALL_REMOTE_TIMEOUT_SECS", 15),
            sync_interval_secs: parse_or(&var, "ROLLCALL_SYNC_INTERVAL_SECS", 900),
            sync_batch_limit: parse_or(&var, "ROLLCALL_SYNC_BATCH_LIMIT", 50),
            sync_max_attempts: parse_or(&var, "ROLLCALL_SYNC_MAX_ATTEMPTS", 3),
            retention_days: parse_or(&var, "ROLLCALL_RETENTION_DAYS", 365),
        }
    }

    /// Reject settings the daemon cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.remote_url.is_none() {
            bail!("ROLLCALL_REMOTE_URL must be set");
        }
        if self.remote_timeout_secs == 0 {
            bail!("ROLLCALL_REMOTE_TIMEOUT_SECS must be positive");
        }
        if self.sync_interval_secs == 0 {
            bail!("ROLLCALL_SYNC_INTERVAL_SECS must be positive");
        }
        if self.sync_batch_limit == 0 {
            bail!("ROLLCALL_SYNC_BATCH_LIMIT must be positive");
        }
        if self.sync_max_attempts == 0 {
            bail!("ROLLCALL_SYNC_MAX_ATTEMPTS must be positive");
        }
        Ok(())
    }

    pub fn remote_timeout(&self) -> Duration {
        Duration::from_secs(self.remote_timeout_secs)
    }

    pub fn sync_interval(&self) -> Duration {
        Duration::from_secs(self.sync_interval_secs)
    }

    /// `None` when the retention sweep is disabled.
    pub fn retention(&self) -> Option<Duration> {
        (self.retention_days > 0).then(|| Duration::from_secs(self.retention_days * 86_400))
    }

    pub fn sync_options(&self) -> SyncOptions {
        SyncOptions {
            batch_limit: self.sync_batch_limit,
            remote_timeout: self.remote_timeout(),
            retry: RetryPolicy {
                max_attempts: self.sync_max_attempts,
                ..RetryPolicy::default()
            },
        }
    }
}

fn parse_or<T: std::str::FromStr>(var: &impl Fn(&str) -> Option<String>, key: &str, default: T) -> T {
    var(key).and_then(|v| v.trim().parse().ok()).unwrap_or(default)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn config(pairs: &[(&str, &str)]) -> Config {
        let vars: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Config::from_vars(|key| vars.get(key).cloned())
    }

    #[test]
    fn test_defaults() {
        let c = config(&[("HOME", "/home/t")]);
        assert_eq!(c.db_path, PathBuf::from("/home/t/.local/share/rollcall/attendance.db"));
        assert_eq!(c.remote_timeout(), Duration::from_secs(15));
        assert_eq!(c.sync_interval(), Duration::from_secs(900));
        assert_eq!(c.sync_batch_limit, 50);
        assert_eq!(c.sync_options().retry.max_attempts, 3);
        assert_eq!(c.retention(), Some(Duration::from_secs(365 * 86_400)));
        assert!(c.validate().is_err(), "remote url is required");
    }

    #[test]
    fn test_overrides() {
        let c = config(&[
            ("XDG_DATA_HOME", "/data"),
            ("ROLLCALL_REMOTE_URL", "https://db.example.com"),
            ("ROLLCALL_SYNC_BATCH_LIMIT", " 20 "),
            ("ROLLCALL_RETENTION_DAYS", "0"),
            ("ROLLCALL_SYNC_MAX_ATTEMPTS", "not-a-number"),
        ]);
        assert_eq!(c.db_path, PathBuf::from("/data/rollcall/attendance.db"));
        assert_eq!(c.sync_batch_limit, 20);
        assert_eq!(c.retention(), None);
        assert_eq!(c.sync_max_attempts, 3);
        assert!(c.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_zero_batch() {
        let c = config(&[
            ("ROLLCALL_REMOTE_URL", "https://db.example.com"),
            ("ROLLCALL_SYNC_BATCH_LIMIT", "0"),
        ]);
        assert!(c.validate().is_err());
    }
}
