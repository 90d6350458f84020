//! Online backup with integrity verification and retention.
//!
//! The copy uses the SQLite backup API page-by-page (100 pages per step with
//! a brief pause between steps), reading through its own source connection so
//! producers and workers keep running on the main handle.

use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{DateTime, Utc};
use rusqlite::backup::Backup;
use rusqlite::Connection;
use thiserror::Error;

use crate::store::SqliteQueue;

const BACKUP_PREFIX: &str = "queue_backup_";
const PAGES_PER_STEP: std::os::raw::c_int = 100;
const PAUSE_BETWEEN_STEPS: Duration = Duration::from_millis(100);

/// Backup failures.
#[derive(Debug, Error)]
pub enum BackupError {
    #[error("backup file not found: {path}")]
    NotFound { path: String },

    #[error("backup failed: {message}")]
    Failed { message: String },

    #[error("backup integrity check failed: {}", details.join(", "))]
    Verification { details: Vec<String> },

    #[error("backup io error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<rusqlite::Error> for BackupError {
    fn from(error: rusqlite::Error) -> Self {
        BackupError::Failed {
            message: error.to_string(),
        }
    }
}

/// Metadata for one backup file.
#[derive(Debug, Clone)]
pub struct BackupInfo {
    pub path: PathBuf,
    pub size_bytes: u64,
    pub created_at: DateTime<Utc>,
}

impl BackupInfo {
    fn from_path(path: PathBuf) -> Result<Self, BackupError> {
        let metadata = std::fs::metadata(&path)?;
        let created_at = metadata
            .modified()
            .map(DateTime::<Utc>::from)
            .unwrap_or_else(|_| Utc::now());
        Ok(Self {
            path,
            size_bytes: metadata.len(),
            created_at,
        })
    }
}

/// Backup manager for a queue database.
pub struct QueueBackup {
    db_path: PathBuf,
    backup_dir: PathBuf,
}

impl QueueBackup {
    /// Backups go to a `backups/` directory next to the database file.
    pub fn new(queue: &SqliteQueue) -> Self {
        let db_path = queue.path().to_path_buf();
        let backup_dir = db_path
            .parent()
            .map(|parent| parent.join("backups"))
            .unwrap_or_else(|| PathBuf::from("backups"));
        Self {
            db_path,
            backup_dir,
        }
    }

    /// Use an explicit backup directory.
    pub fn with_dir(queue: &SqliteQueue, backup_dir: impl Into<PathBuf>) -> Self {
        Self {
            db_path: queue.path().to_path_buf(),
            backup_dir: backup_dir.into(),
        }
    }

    pub fn backup_dir(&self) -> &Path {
        &self.backup_dir
    }

    /// Create a verified backup. Returns its path.
    ///
    /// The copy proceeds in small page batches, yielding between batches so
    /// concurrent writers make progress. A backup that fails its integrity
    /// check is deleted and reported as an error.
    pub fn create_backup(&self, name: Option<&str>) -> Result<PathBuf, BackupError> {
        std::fs::create_dir_all(&self.backup_dir)?;
        let backup_path = self.backup_dir.join(generate_backup_name(name));

        let result = self.copy_pages(&backup_path).and_then(|()| {
            self.verify_backup(&backup_path)?;
            Ok(())
        });

        if let Err(e) = result {
            let _ = std::fs::remove_file(&backup_path);
            return Err(e);
        }

        tracing::info!(path = %backup_path.display(), "backup created");
        Ok(backup_path)
    }

    fn copy_pages(&self, backup_path: &Path) -> Result<(), BackupError> {
        // A dedicated source connection: the main handle stays free for
        // claims and transitions while pages stream out under WAL.
        let source = Connection::open(&self.db_path)?;
        let mut destination = Connection::open(backup_path)?;
        let backup = Backup::new(&source, &mut destination)?;
        backup.run_to_completion(PAGES_PER_STEP, PAUSE_BETWEEN_STEPS, None)?;
        Ok(())
    }

    /// Run an integrity check against a backup file.
    pub fn verify_backup(&self, backup_path: &Path) -> Result<(), BackupError> {
        if !backup_path.exists() {
            return Err(BackupError::NotFound {
                path: backup_path.display().to_string(),
            });
        }

        let conn = Connection::open(backup_path)?;
        let mut statement = conn.prepare("PRAGMA integrity_check")?;
        let messages = statement
            .query_map([], |row| row.get::<_, String>(0))?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        if messages.len() == 1 && messages[0] == "ok" {
            Ok(())
        } else {
            Err(BackupError::Verification { details: messages })
        }
    }

    /// Restore a verified backup over `target` (the live database path by
    /// default). The queue connection must be closed first; restoring under
    /// a live handle is undefined.
    pub fn restore_backup(
        &self,
        backup_path: &Path,
        target: Option<&Path>,
    ) -> Result<(), BackupError> {
        self.verify_backup(backup_path)?;
        let target = target.unwrap_or(&self.db_path);
        std::fs::copy(backup_path, target)?;
        tracing::warn!(
            backup = %backup_path.display(),
            target = %target.display(),
            "database restored from backup"
        );
        Ok(())
    }

    /// All backups, newest first.
    pub fn list_backups(&self) -> Result<Vec<BackupInfo>, BackupError> {
        let mut backups = Vec::new();
        let entries = match std::fs::read_dir(&self.backup_dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(backups),
            Err(e) => return Err(e.into()),
        };

        for entry in entries {
            let path = entry?.path();
            let name = path
                .file_name()
                .and_then(|n| n.to_str())
                .unwrap_or_default();
            if name.starts_with(BACKUP_PREFIX) && name.ends_with(".db") {
                backups.push(BackupInfo::from_path(path)?);
            }
        }

        backups.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(backups)
    }

    /// The most recent backup, if any.
    pub fn latest_backup(&self) -> Result<Option<BackupInfo>, BackupError> {
        Ok(self.list_backups()?.into_iter().next())
    }

    /// Keep the newest `keep_count` backups, delete the rest. Returns how
    /// many were deleted. Individual delete failures are skipped.
    pub fn cleanup_old_backups(&self, keep_count: usize) -> Result<usize, BackupError> {
        let backups = self.list_backups()?;
        if backups.len() <= keep_count {
            return Ok(0);
        }

        let mut deleted = 0;
        for backup in &backups[keep_count..] {
            match std::fs::remove_file(&backup.path) {
                Ok(()) => deleted += 1,
                Err(e) => {
                    tracing::warn!(path = %backup.path.display(), error = %e, "failed to delete backup");
                }
            }
        }
        Ok(deleted)
    }
}

fn generate_backup_name(name: Option<&str>) -> String {
    let timestamp = Utc::now().format("%Y%m%d_%H%M%S");
    match name {
        Some(name) => format!("{BACKUP_PREFIX}{name}_{timestamp}.db"),
        None => format!("{BACKUP_PREFIX}{timestamp}.db"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use prismq_core::NewTask;
    use serde_json::json;

    fn open_queue() -> (tempfile::TempDir, SqliteQueue) {
        let dir = tempfile::tempdir().unwrap();
        let queue = SqliteQueue::open(dir.path().join("queue.db")).unwrap();
        (dir, queue)
    }

    #[test]
    fn test_backup_and_verify_round_trip() {
        let (_dir, queue) = open_queue();
        for i in 0..20 {
            queue
                .enqueue(&NewTask::new("t", json!({ "i": i })))
                .unwrap();
        }

        let backup = QueueBackup::new(&queue);
        let path = backup.create_backup(None).unwrap();
        assert!(path.exists());
        assert!(path
            .file_name()
            .unwrap()
            .to_str()
            .unwrap()
            .starts_with(BACKUP_PREFIX));
        backup.verify_backup(&path).unwrap();

        // The copy contains the data.
        let copy = Connection::open(&path).unwrap();
        let count: i64 = copy
            .query_row("SELECT COUNT(*) FROM task_queue", [], |row| row.get(0))
            .unwrap();
        assert_eq!(count, 20);
    }

    #[test]
    fn test_named_backup_carries_name() {
        let (_dir, queue) = open_queue();
        let backup = QueueBackup::new(&queue);
        let path = backup.create_backup(Some("nightly")).unwrap();
        assert!(path
            .file_name()
            .unwrap()
            .to_str()
            .unwrap()
            .starts_with("queue_backup_nightly_"));
    }

    #[test]
    fn test_backup_runs_while_queue_is_in_use() {
        let (_dir, queue) = open_queue();
        queue.enqueue(&NewTask::new("t", json!({}))).unwrap();

        let backup = QueueBackup::new(&queue);
        let path = backup.create_backup(None).unwrap();

        // The live queue keeps accepting writes during and after the backup.
        queue.enqueue(&NewTask::new("t", json!({}))).unwrap();
        backup.verify_backup(&path).unwrap();
    }

    #[test]
    fn test_list_and_cleanup_retention() {
        let (_dir, queue) = open_queue();
        let backup = QueueBackup::new(&queue);

        // Distinct names sidestep the one-second timestamp resolution.
        for i in 0..4 {
            backup.create_backup(Some(&format!("b{i}"))).unwrap();
        }
        assert_eq!(backup.list_backups().unwrap().len(), 4);

        let deleted = backup.cleanup_old_backups(2).unwrap();
        assert_eq!(deleted, 2);
        assert_eq!(backup.list_backups().unwrap().len(), 2);

        assert!(backup.latest_backup().unwrap().is_some());
        assert_eq!(backup.cleanup_old_backups(10).unwrap(), 0);
    }

    #[test]
    fn test_verify_missing_backup_fails() {
        let (_dir, queue) = open_queue();
        let backup = QueueBackup::new(&queue);
        assert!(matches!(
            backup.verify_backup(Path::new("/nonexistent/backup.db")),
            Err(BackupError::NotFound { .. })
        ));
    }

    #[test]
    fn test_restore_backup_replaces_target() {
        let (dir, queue) = open_queue();
        queue.enqueue(&NewTask::new("t", json!({}))).unwrap();

        let backup = QueueBackup::new(&queue);
        let path = backup.create_backup(None).unwrap();

        let restore_target = dir.path().join("restored.db");
        backup.restore_backup(&path, Some(&restore_target)).unwrap();

        let restored = Connection::open(&restore_target).unwrap();
        let count: i64 = restored
            .query_row("SELECT COUNT(*) FROM task_queue", [], |row| row.get(0))
            .unwrap();
        assert_eq!(count, 1);
    }
}
