//! Termination signals are logged and otherwise ignored inside node pods;
//! deleting the pod is the only way to stop the keepalive process.

use error_stack::Report;
use tokio::signal::unix::signal;
use tokio::signal::unix::SignalKind;
use tokio::task::JoinHandle;
use tracing::warn;

use crate::domain::keepalive::KeepaliveError;

/// Install handlers for SIGTERM, SIGINT and SIGHUP and log each delivery.
///
/// Installing a handler replaces the default disposition, so the process
/// survives these signals for as long as the returned task runs.
pub fn ignore_termination() -> Result<JoinHandle<()>, Report<KeepaliveError>> {
    let install = |kind: SignalKind| {
        signal(kind).map_err(|e| Report::new(KeepaliveError::Signals).attach_printable(e.to_string()))
    };
    let mut terminate = install(SignalKind::terminate())?;
    let mut interrupt = install(SignalKind::interrupt())?;
    let mut hangup = install(SignalKind::hangup())?;

    Ok(tokio::spawn(async move {
        loop {
            let name = tokio::select! {
                Some(()) = terminate.recv() => "SIGTERM",
                Some(()) = interrupt.recv() => "SIGINT",
                Some(()) = hangup.recv() => "SIGHUP",
                else => break,
            };
            warn!(signal = name, "ignoring termination signal; delete the pod to stop");
        }
    }))
}
