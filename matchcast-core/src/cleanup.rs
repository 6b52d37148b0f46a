use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use thiserror::Error;
use tracing::{info, warn};

use crate::config::PipelineConfig;

#[derive(Debug, Error)]
pub enum JanitorError {
    #[error("failed to list {path}: {source}")]
    List {
        source: std::io::Error,
        path: PathBuf,
    },
}

pub type JanitorResult<T> = std::result::Result<T, JanitorError>;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub removed: Vec<PathBuf>,
    pub kept: usize,
    pub failed: usize,
}

/// Removes session directories and final artifacts older than the
/// retention window.
#[derive(Debug, Clone)]
pub struct SessionJanitor {
    sessions_dir: PathBuf,
    final_dir: PathBuf,
    retention: Duration,
    dry_run: bool,
}

impl SessionJanitor {
    pub fn new(sessions_dir: PathBuf, final_dir: PathBuf, retention: Duration) -> Self {
        Self {
            sessions_dir,
            final_dir,
            retention,
            dry_run: false,
        }
    }

    pub fn from_config(config: &PipelineConfig) -> Self {
        Self::new(
            config.sessions_dir(),
            config.final_dir(),
            config.cleanup.retention(),
        )
    }

    pub fn with_retention(mut self, retention: Duration) -> Self {
        self.retention = retention;
        self
    }

    pub fn dry_run(mut self, dry_run: bool) -> Self {
        self.dry_run = dry_run;
        self
    }

    pub fn sweep(&self) -> JanitorResult<SweepReport> {
        self.sweep_at(SystemTime::now())
    }

    pub fn sweep_at(&self, now: SystemTime) -> JanitorResult<SweepReport> {
        let mut report = SweepReport::default();
        self.sweep_dir(&self.sessions_dir, now, &mut report, |path| path.is_dir())?;
        self.sweep_dir(&self.final_dir, now, &mut report, |path| {
            path.is_file()
                && path
                    .file_name()
                    .map(|name| name.to_string_lossy().starts_with("commentary_"))
                    .unwrap_or(false)
        })?;
        info!(
            removed = report.removed.len(),
            kept = report.kept,
            failed = report.failed,
            dry_run = self.dry_run,
            "session sweep finished"
        );
        Ok(report)
    }

    fn sweep_dir<F>(
        &self,
        dir: &Path,
        now: SystemTime,
        report: &mut SweepReport,
        eligible: F,
    ) -> JanitorResult<()>
    where
        F: Fn(&Path) -> bool,
    {
        if !dir.exists() {
            return Ok(());
        }
        let entries = std::fs::read_dir(dir).map_err(|source| JanitorError::List {
            source,
            path: dir.to_path_buf(),
        })?;
        let mut paths: Vec<PathBuf> = entries.flatten().map(|entry| entry.path()).collect();
        paths.sort();
        for path in paths {
            if !eligible(&path) {
                continue;
            }
            let modified = match std::fs::metadata(&path).and_then(|meta| meta.modified()) {
                Ok(modified) => modified,
                Err(err) => {
                    warn!(path = %path.display(), error = %err, "failed to read session metadata");
                    report.failed += 1;
                    continue;
                }
            };
            if now.duration_since(modified).unwrap_or(Duration::ZERO) <= self.retention {
                report.kept += 1;
                continue;
            }
            if self.dry_run {
                report.removed.push(path);
                continue;
            }
            let removal = if path.is_dir() {
                std::fs::remove_dir_all(&path)
            } else {
                std::fs::remove_file(&path)
            };
            match removal {
                Ok(()) => report.removed.push(path),
                Err(err) => {
                    warn!(path = %path.display(), error = %err, "failed to remove expired session");
                    report.failed += 1;
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn layout() -> (tempfile::TempDir, SessionJanitor) {
        let dir = tempdir().unwrap();
        let sessions = dir.path().join("streaming");
        let finals = dir.path().join("generated");
        std::fs::create_dir_all(sessions.join("20260101_000000_aaaaaaaa")).unwrap();
        std::fs::write(
            sessions.join("20260101_000000_aaaaaaaa/segment_0000.mp4"),
            b"x",
        )
        .unwrap();
        std::fs::create_dir_all(&finals).unwrap();
        std::fs::write(finals.join("commentary_20260101_000000_aaaaaaaa.mp4"), b"x").unwrap();
        std::fs::write(finals.join("keep-me.txt"), b"x").unwrap();
        let janitor = SessionJanitor::new(sessions, finals, Duration::from_secs(3600));
        (dir, janitor)
    }

    #[test]
    fn fresh_sessions_are_kept() {
        let (_dir, janitor) = layout();
        let report = janitor.sweep().unwrap();
        assert!(report.removed.is_empty());
        assert_eq!(report.kept, 2);
    }

    #[test]
    fn expired_sessions_are_removed() {
        let (dir, janitor) = layout();
        let later = SystemTime::now() + Duration::from_secs(7200);
        let report = janitor.sweep_at(later).unwrap();
        assert_eq!(report.removed.len(), 2);
        assert!(!dir.path().join("streaming/20260101_000000_aaaaaaaa").exists());
        assert!(dir.path().join("generated/keep-me.txt").exists());
    }

    #[test]
    fn dry_run_leaves_files_in_place() {
        let (dir, janitor) = layout();
        let later = SystemTime::now() + Duration::from_secs(7200);
        let report = janitor.dry_run(true).sweep_at(later).unwrap();
        assert_eq!(report.removed.len(), 2);
        assert!(dir.path().join("streaming/20260101_000000_aaaaaaaa").exists());
    }

    #[test]
    fn missing_directories_are_ignored() {
        let janitor = SessionJanitor::new(
            PathBuf::from("/nonexistent/streaming"),
            PathBuf::from("/nonexistent/generated"),
            Duration::from_secs(1),
        );
        assert_eq!(janitor.sweep().unwrap(), SweepReport::default());
    }
}
