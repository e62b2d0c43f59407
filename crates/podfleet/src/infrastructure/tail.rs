//! Passive `tail -f` readers kept open on task log files.

use std::path::Path;
use std::process::Stdio;
use std::time::Duration;

use error_stack::Report;
use tokio::process::Child;
use tokio::process::Command;
use tracing::debug;
use tracing::warn;

use crate::domain::keepalive::KeepaliveError;
use crate::domain::keepalive::WatcherHandle;
use crate::domain::keepalive::WatcherSpawner;

/// Upper bound on reaping a killed reader.
const REAP_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Default, Clone, Copy)]
pub struct TailSpawner;

#[derive(Debug)]
pub struct TailHandle {
    child: Child,
    path: String,
}

#[async_trait::async_trait]
impl WatcherSpawner for TailSpawner {
    type Handle = TailHandle;

    async fn spawn(&self, path: &Path) -> Result<TailHandle, Report<KeepaliveError>> {
        let child = Command::new("tail")
            .arg("-f")
            .arg("-n")
            .arg("0")
            .arg(path)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                Report::new(KeepaliveError::Spawn {
                    path: path.display().to_string(),
                })
                .attach_printable(e.to_string())
            })?;
        debug!(path = %path.display(), pid = ?child.id(), "reader started");

        Ok(TailHandle {
            child,
            path: path.display().to_string(),
        })
    }
}

#[async_trait::async_trait]
impl WatcherHandle for TailHandle {
    fn has_exited(&mut self) -> bool {
        match self.child.try_wait() {
            Ok(status) => status.is_some(),
            Err(e) => {
                warn!(path = %self.path, "failed to poll reader: {e}");
                false
            }
        }
    }

    async fn terminate(&mut self) -> Result<(), Report<KeepaliveError>> {
        if self.has_exited() {
            return Ok(());
        }
        let terminate_error = || KeepaliveError::Terminate {
            path: self.path.clone(),
        };

        self.child
            .start_kill()
            .map_err(|e| Report::new(terminate_error()).attach_printable(e.to_string()))?;
        match tokio::time::timeout(REAP_TIMEOUT, self.child.wait()).await {
            Ok(Ok(status)) => {
                debug!(path = %self.path, %status, "reader stopped");
                Ok(())
            }
            Ok(Err(e)) => Err(Report::new(terminate_error()).attach_printable(e.to_string())),
            Err(_) => Err(Report::new(terminate_error())
                .attach_printable(format!("not reaped within {REAP_TIMEOUT:?}"))),
        }
    }
}
