use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;

use crate::domain::keepalive::KeepaliveConfig;

#[derive(Parser, Clone, Debug)]
pub struct KeepaliveArgs {
    #[arg(
        long,
        env = "PODFLEET_LOG_PATTERN",
        help = "Glob matching the task log files to watch, e.g. /root/podfleet_logs/*/tasks/*.log"
    )]
    pub log_pattern: String,

    #[arg(
        long,
        value_hint = clap::ValueHint::FilePath,
        help = "File written once the monitor is running"
    )]
    pub ready_file: Option<PathBuf>,

    #[arg(long, default_value = "5", help = "Seconds between polls")]
    pub poll_interval_secs: u64,

    #[arg(
        long,
        default_value = "1",
        help = "Consecutive polls a file may go unread before its reader is released"
    )]
    pub grace_polls: u32,
}

impl KeepaliveArgs {
    pub fn monitor_config(&self) -> KeepaliveConfig {
        KeepaliveConfig {
            poll_interval: Duration::from_secs(self.poll_interval_secs.max(1)),
            grace_polls: self.grace_polls.max(1),
            ..KeepaliveConfig::new(self.log_pattern.clone())
        }
    }
}
