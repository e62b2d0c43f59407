use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tokio::signal::unix::signal;
use tokio::signal::unix::SignalKind;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::error;
use tracing::info;
use tracing::warn;

use crate::config::SubmitArgs;
use crate::config::WatchJobsArgs;
use crate::domain::jobs::JobController;
use crate::infrastructure::k8s::JobEventWatcher;
use crate::infrastructure::k8s::KubeClusterApi;

const EVENT_BUFFER: usize = 256;

pub async fn run_submit(args: SubmitArgs) -> Result<()> {
    let api = super::connect(&args.kube, None).await?;
    let mut controller = JobController::new(api.clone(), args.controller.policy());

    let pod_name = controller
        .submit(args.job_request())
        .await
        .map_err(|e| anyhow::anyhow!("{e:?}"))?;
    println!("job {} queued as pod {pod_name}", args.name);

    if !args.watch {
        return Ok(());
    }
    follow(&mut controller, &api, &args.namespace, args.controller.resync()).await
}

pub async fn run_watch_jobs(args: WatchJobsArgs) -> Result<()> {
    let api = super::connect(&args.kube, None).await?;
    let mut controller = JobController::new(api.clone(), args.controller.policy());

    let adopted = controller
        .adopt(&args.namespace)
        .await
        .map_err(|e| anyhow::anyhow!("{e:?}"))?;
    info!(namespace = %args.namespace, jobs = adopted, "Following existing jobs");
    if adopted == 0 {
        println!("no active jobs in namespace {}", args.namespace);
        return Ok(());
    }
    follow(&mut controller, &api, &args.namespace, args.controller.resync()).await
}

/// Feed watch events into the controller until every job is final or the
/// process is asked to stop, then print where each job ended up.
async fn follow(
    controller: &mut JobController<KubeClusterApi>,
    api: &Arc<KubeClusterApi>,
    namespace: &str,
    resync: Duration,
) -> Result<()> {
    let token = CancellationToken::new();
    let (sender, receiver) = mpsc::channel(EVENT_BUFFER);

    let watcher = JobEventWatcher::new(api.client().clone(), namespace);
    let watcher_token = token.clone();
    let watcher_task = tokio::spawn(async move {
        if let Err(e) = watcher.run(sender, watcher_token).await {
            error!("Job event watcher failed: {e:?}");
        }
    });

    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sigint = signal(SignalKind::interrupt())?;
    let signal_token = token.clone();
    tokio::spawn(async move {
        tokio::select! {
            _ = sigterm.recv() => info!("Received SIGTERM, stopping"),
            _ = sigint.recv() => info!("Received SIGINT, stopping"),
            _ = signal_token.cancelled() => return,
        }
        signal_token.cancel();
    });

    let result = controller.run(receiver, resync, token.clone()).await;
    token.cancel();
    if timeout(Duration::from_secs(5), watcher_task).await.is_err() {
        warn!("Job event watcher did not stop in time");
    }

    for job in controller.jobs() {
        println!(
            "{:<40} {:<10} attempts={} preemptions={}",
            job.request.name,
            job.status,
            job.attempts.len(),
            job.preemptions()
        );
    }
    result.map_err(|e| anyhow::anyhow!("{e:?}"))
}
