//! In-pod liveness guard tying the pod's lifetime to active log consumption.
//!
//! The monitor discovers task log files, keeps one passive tail reader per
//! file and releases a reader once nobody but the reader itself holds the file
//! open. It never exits on its own; deleting the pod is the only way to end it.

pub mod monitor;

use core::error::Error;
use std::path::Path;
use std::time::Duration;

use derive_more::Display;
use error_stack::Report;

pub use monitor::CycleReport;
pub use monitor::KeepaliveMonitor;
pub use monitor::LogWatch;

#[derive(Debug, Display)]
pub enum KeepaliveError {
    #[display("invalid log pattern `{pattern}`")]
    Pattern { pattern: String },
    #[display("failed to start a reader for {path}")]
    Spawn { path: String },
    #[display("failed to count readers of {path}")]
    Probe { path: String },
    #[display("failed to stop the reader of {path}")]
    Terminate { path: String },
    #[display("failed to write readiness marker {path}")]
    ReadyMarker { path: String },
    #[display("failed to install signal handlers")]
    Signals,
}

impl Error for KeepaliveError {}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeepaliveConfig {
    /// Glob matching task log files.
    pub log_pattern: String,
    pub poll_interval: Duration,
    /// Consecutive polls below `min_readers` before a reader is released.
    pub grace_polls: u32,
    /// Our own tail reader plus the writer.
    pub min_readers: usize,
}

impl KeepaliveConfig {
    pub fn new(log_pattern: impl Into<String>) -> Self {
        Self {
            log_pattern: log_pattern.into(),
            poll_interval: Duration::from_secs(5),
            grace_polls: 1,
            min_readers: 2,
        }
    }
}

/// Counts processes holding an open handle on a file.
#[async_trait::async_trait]
pub trait ReaderProbe: Send + Sync {
    async fn count_readers(&self, path: &Path) -> Result<usize, Report<KeepaliveError>>;
}

/// Starts the passive reader kept open on a log file.
#[async_trait::async_trait]
pub trait WatcherSpawner: Send + Sync {
    type Handle: WatcherHandle;

    async fn spawn(&self, path: &Path) -> Result<Self::Handle, Report<KeepaliveError>>;
}

#[async_trait::async_trait]
pub trait WatcherHandle: Send {
    /// Whether the reader already exited by itself.
    fn has_exited(&mut self) -> bool;

    async fn terminate(&mut self) -> Result<(), Report<KeepaliveError>>;
}
