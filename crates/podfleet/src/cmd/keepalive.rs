use std::path::Path;

use anyhow::Result;
use error_stack::Report;
use tokio::fs;
use tracing::info;

use crate::config::KeepaliveArgs;
use crate::domain::keepalive::KeepaliveError;
use crate::domain::keepalive::KeepaliveMonitor;
use crate::infrastructure::proc_probe::ProcReaderProbe;
use crate::infrastructure::signals;
use crate::infrastructure::tail::TailSpawner;

/// Runs for the lifetime of the pod. Never returns `Ok`.
pub async fn run_keepalive(args: KeepaliveArgs) -> Result<()> {
    let _signals = signals::ignore_termination().map_err(|e| anyhow::anyhow!("{e:?}"))?;

    let config = args.monitor_config();
    info!(
        pattern = %config.log_pattern,
        poll_interval = ?config.poll_interval,
        grace_polls = config.grace_polls,
        "Starting keepalive monitor"
    );
    let monitor = KeepaliveMonitor::new(config, ProcReaderProbe::new(), TailSpawner)
        .map_err(|e| anyhow::anyhow!("{e:?}"))?;

    if let Some(ready_file) = &args.ready_file {
        write_ready_marker(ready_file)
            .await
            .map_err(|e| anyhow::anyhow!("{e:?}"))?;
    }

    match monitor.run().await {}
}

async fn write_ready_marker(path: &Path) -> Result<(), Report<KeepaliveError>> {
    let marker_error = |e: std::io::Error| {
        Report::new(KeepaliveError::ReadyMarker {
            path: path.display().to_string(),
        })
        .attach_printable(e.to_string())
    };
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).await.map_err(marker_error)?;
    }
    fs::write(path, format!("{}\n", std::process::id()))
        .await
        .map_err(marker_error)
}
