use std::fmt;
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use fs2::FileExt;
use serde::{Deserialize, Serialize};

use crate::error::TakoError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LockOperation {
    Deploy,
    Rollback,
    Destroy,
}

impl fmt::Display for LockOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            LockOperation::Deploy => "deploy",
            LockOperation::Rollback => "rollback",
            LockOperation::Destroy => "destroy",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct LockHolder {
    pid: u32,
    operation: LockOperation,
    user: String,
    since: DateTime<Utc>,
}

/// Advisory lock at `.tako/.lock` serializing state-changing operations per
/// project. Concurrent operators fail fast with `StateLocked`; the same
/// process may re-enter for the same operation.
pub struct StateLock {
    // None for a re-entrant acquisition; the original guard owns the flock.
    file: Option<File>,
}

impl StateLock {
    pub fn lock_path(tako_dir: &Path) -> PathBuf {
        tako_dir.join(".lock")
    }

    pub fn acquire(tako_dir: &Path, operation: LockOperation) -> Result<Self> {
        std::fs::create_dir_all(tako_dir)
            .with_context(|| format!("Failed to create {}", tako_dir.display()))?;
        let path = Self::lock_path(tako_dir);

        let mut file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(false)
            .open(&path)
            .with_context(|| format!("Failed to open lock file {}", path.display()))?;

        if file.try_lock_exclusive().is_err() {
            let mut content = String::new();
            let _ = file.read_to_string(&mut content);

            if let Ok(holder) = serde_json::from_str::<LockHolder>(content.trim()) {
                if holder.pid == std::process::id() && holder.operation == operation {
                    // Same process, same operation: re-entry is allowed and
                    // the original guard keeps ownership.
                    return Ok(Self { file: None });
                }
                return Err(TakoError::StateLocked {
                    holder: format!("{} (pid {}, {})", holder.user, holder.pid, holder.operation),
                    since: holder.since,
                }
                .into());
            }

            return Err(TakoError::StateLocked {
                holder: "unknown process".to_string(),
                since: Utc::now(),
            }
            .into());
        }

        let holder = LockHolder {
            pid: std::process::id(),
            operation,
            user: std::env::var("USER").unwrap_or_else(|_| "unknown".to_string()),
            since: Utc::now(),
        };

        file.set_len(0)?;
        file.seek(SeekFrom::Start(0))?;
        file.write_all(serde_json::to_string(&holder)?.as_bytes())?;
        file.flush()?;

        Ok(Self { file: Some(file) })
    }
}

impl Drop for StateLock {
    fn drop(&mut self) {
        if let Some(file) = self.file.take() {
            // Clear stale holder info before the flock is released with the
            // descriptor.
            let _ = file.set_len(0);
            let _ = fs2::FileExt::unlock(&file);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lock_excludes_other_operations_in_flight() {
        let dir = tempfile::tempdir().unwrap();
        let _guard = StateLock::acquire(dir.path(), LockOperation::Deploy).unwrap();

        // A different operation from the same pid must not re-enter.
        let err = StateLock::acquire(dir.path(), LockOperation::Destroy).unwrap_err();
        let locked = err.downcast_ref::<TakoError>().unwrap();
        assert!(matches!(locked, TakoError::StateLocked { .. }));
    }

    #[test]
    fn same_pid_same_operation_reenters() {
        let dir = tempfile::tempdir().unwrap();
        let _guard = StateLock::acquire(dir.path(), LockOperation::Deploy).unwrap();
        let reentered = StateLock::acquire(dir.path(), LockOperation::Deploy);
        assert!(reentered.is_ok());
    }

    #[test]
    fn released_lock_can_be_reacquired() {
        let dir = tempfile::tempdir().unwrap();
        drop(StateLock::acquire(dir.path(), LockOperation::Deploy).unwrap());
        assert!(StateLock::acquire(dir.path(), LockOperation::Rollback).is_ok());
    }

    #[test]
    fn holder_metadata_names_the_operation() {
        let dir = tempfile::tempdir().unwrap();
        let _guard = StateLock::acquire(dir.path(), LockOperation::Rollback).unwrap();

        let err = StateLock::acquire(dir.path(), LockOperation::Deploy).unwrap_err();
        assert!(err.to_string().contains("rollback"));
    }
}
