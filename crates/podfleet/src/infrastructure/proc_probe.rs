//! Counts the processes holding a file open by scanning `/proc/<pid>/fd`.

use std::path::Path;
use std::path::PathBuf;

use error_stack::Report;
use tokio::fs;
use tracing::trace;

use crate::domain::keepalive::KeepaliveError;
use crate::domain::keepalive::ReaderProbe;

pub struct ProcReaderProbe {
    proc_root: PathBuf,
}

impl ProcReaderProbe {
    pub fn new() -> Self {
        Self::with_root("/proc")
    }

    pub fn with_root(proc_root: impl Into<PathBuf>) -> Self {
        Self {
            proc_root: proc_root.into(),
        }
    }
}

impl Default for ProcReaderProbe {
    fn default() -> Self {
        Self::new()
    }
}

/// Whether any descriptor in `fd_dir` points at `target`. Processes that exit
/// mid-scan or belong to other users are skipped.
async fn holds_open(fd_dir: &Path, target: &Path) -> bool {
    let Ok(mut fds) = fs::read_dir(fd_dir).await else {
        return false;
    };
    while let Ok(Some(fd)) = fds.next_entry().await {
        if let Ok(link) = fs::read_link(fd.path()).await {
            if link == target {
                return true;
            }
        }
    }
    false
}

#[async_trait::async_trait]
impl ReaderProbe for ProcReaderProbe {
    async fn count_readers(&self, path: &Path) -> Result<usize, Report<KeepaliveError>> {
        let probe_error = || KeepaliveError::Probe {
            path: path.display().to_string(),
        };
        let target = fs::canonicalize(path)
            .await
            .map_err(|e| Report::new(probe_error()).attach_printable(e.to_string()))?;
        let mut proc_dir = fs::read_dir(&self.proc_root).await.map_err(|e| {
            Report::new(probe_error())
                .attach_printable(format!("Cannot read {}: {e}", self.proc_root.display()))
        })?;

        let mut readers = 0;
        loop {
            let entry = proc_dir.next_entry().await.map_err(|e| {
                Report::new(probe_error()).attach_printable(format!("Cannot read proc entry: {e}"))
            })?;
            let Some(entry) = entry else {
                break;
            };
            let is_pid = entry
                .file_name()
                .to_str()
                .is_some_and(|name| name.parse::<u32>().is_ok());
            if is_pid && holds_open(&entry.path().join("fd"), &target).await {
                readers += 1;
            }
        }

        trace!(path = %path.display(), readers, "counted readers");
        Ok(readers)
    }
}
