//! Working-directory cleanup after a job reaches a terminal state.
//!
//! Cleanup never reports back to the orchestrator: failures are logged and
//! counted, and the job record is left untouched.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use tracing::{info, warn};

use vsum_models::CleanupRequest;

use crate::metrics;

/// Result of one cleanup run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CleanupOutcome {
    Removed,
    /// Directory was already gone
    AlreadyAbsent,
    /// Removal failed; the error was logged
    Failed,
    /// Request pointed outside the configured work root
    Rejected,
    /// A newer attempt owns the directory; nothing was removed
    Superseded,
}

/// Removes per-job working directories.
#[derive(Debug, Clone)]
pub struct CleanupTask {
    work_root: PathBuf,
}

impl CleanupTask {
    pub fn new(work_root: impl Into<PathBuf>) -> Self {
        Self {
            work_root: work_root.into(),
        }
    }

    pub fn work_root(&self) -> &Path {
        &self.work_root
    }

    /// Remove the request's working directory.
    pub async fn run(&self, request: &CleanupRequest) -> CleanupOutcome {
        let dir = &request.work_dir;

        // Never remove anything outside the work root (or the root itself)
        let escapes = dir
            .components()
            .any(|c| matches!(c, std::path::Component::ParentDir));
        if escapes || !dir.starts_with(&self.work_root) || dir == &self.work_root {
            warn!(
                job_id = %request.job_id,
                work_dir = %dir.display(),
                "Refusing to clean up directory outside work root"
            );
            metrics::record_cleanup("rejected");
            return CleanupOutcome::Rejected;
        }

        match tokio::fs::remove_dir_all(dir).await {
            Ok(()) => {
                info!(job_id = %request.job_id, work_dir = %dir.display(), "Removed working directory");
                metrics::record_cleanup("removed");
                CleanupOutcome::Removed
            }
            Err(e) if e.kind() == ErrorKind::NotFound => {
                metrics::record_cleanup("absent");
                CleanupOutcome::AlreadyAbsent
            }
            Err(e) => {
                warn!(
                    job_id = %request.job_id,
                    work_dir = %dir.display(),
                    "Failed to remove working directory: {}", e
                );
                metrics::record_cleanup("error");
                CleanupOutcome::Failed
            }
        }
    }
}
