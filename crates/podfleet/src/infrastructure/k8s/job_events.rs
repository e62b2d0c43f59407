use std::time::Duration;

use error_stack::Report;
use futures::stream;
use futures::StreamExt;
use futures::TryStreamExt;
use k8s_openapi::api::core::v1::Pod;
use kube::runtime::watcher;
use kube::runtime::watcher::Config;
use kube::runtime::watcher::Event;
use kube::Api;
use kube::Client;
use tokio::select;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use tracing::error;
use tracing::info;
use tracing::warn;

use super::crds::Workload;
use crate::domain::cluster_api::KubernetesError;
use crate::domain::jobs::JobEvent;
use crate::domain::labels;

/// Watches job pods and their workloads and forwards [`JobEvent`]s.
///
/// Watch events are a fast path only. Deletions missed while the stream is
/// reconnecting are picked up by the job controller's periodic resync.
pub struct JobEventWatcher {
    client: Client,
    namespace: String,
}

impl JobEventWatcher {
    pub fn new(client: Client, namespace: impl Into<String>) -> Self {
        Self {
            client,
            namespace: namespace.into(),
        }
    }

    /// Watch until cancelled or until the receiving side is dropped,
    /// reconnecting after stream failures.
    #[tracing::instrument(skip(self, sender, cancellation_token), fields(namespace = %self.namespace))]
    pub async fn run(
        &self,
        sender: mpsc::Sender<JobEvent>,
        cancellation_token: CancellationToken,
    ) -> Result<(), Report<KubernetesError>> {
        info!("Starting job event watcher");
        loop {
            select! {
                _ = cancellation_token.cancelled() => {
                    info!("Job event watcher shutdown requested");
                    break;
                }
                result = self.watch(&sender) => {
                    if sender.is_closed() {
                        debug!("event receiver dropped, stopping watcher");
                        break;
                    }
                    match result {
                        Ok(()) => warn!("Job watch stream ended unexpectedly, restarting..."),
                        Err(e) => {
                            error!("Job watch failed: {e:?}");
                            tokio::time::sleep(Duration::from_secs(5)).await;
                        }
                    }
                }
            }
        }
        Ok(())
    }

    async fn watch(&self, sender: &mpsc::Sender<JobEvent>) -> Result<(), Report<KubernetesError>> {
        let pods: Api<Pod> = Api::namespaced(self.client.clone(), &self.namespace);
        let workloads: Api<Workload> = Api::namespaced(self.client.clone(), &self.namespace);

        let pod_stream = watcher(pods, Config::default().labels(&labels::job_selector()))
            .map_ok(pod_events)
            .boxed();
        let workload_stream = watcher(workloads, Config::default())
            .map_ok(workload_events)
            .boxed();
        let mut events = stream::select(pod_stream, workload_stream);

        while let Some(batch) = events.next().await {
            let batch = batch.map_err(|e| {
                Report::new(KubernetesError::WatchFailed {
                    object: format!("jobs in {}", self.namespace),
                    message: format!("Watch stream error: {e}"),
                })
            })?;
            for event in batch {
                if sender.send(event).await.is_err() {
                    return Ok(());
                }
            }
        }
        Ok(())
    }
}

fn pod_events(event: Event<Pod>) -> Vec<JobEvent> {
    match event {
        Event::Applied(pod) => JobEvent::from_pod(&pod).into_iter().collect(),
        Event::Deleted(pod) => pod
            .metadata
            .name
            .map(|pod_name| JobEvent::PodGone { pod_name })
            .into_iter()
            .collect(),
        Event::Restarted(pods) => pods.iter().filter_map(JobEvent::from_pod).collect(),
    }
}

fn workload_events(event: Event<Workload>) -> Vec<JobEvent> {
    let observed = |workload: &Workload| {
        let record = workload.admission_record()?;
        if record.preempted {
            return Some(JobEvent::Evicted {
                pod_name: record.pod_name,
            });
        }
        (record.admitted && !record.finished).then(|| JobEvent::Admitted {
            pod_name: record.pod_name.clone(),
            record,
        })
    };
    match event {
        Event::Applied(workload) => observed(&workload).into_iter().collect(),
        Event::Deleted(_) => Vec::new(),
        Event::Restarted(workloads) => workloads.iter().filter_map(observed).collect(),
    }
}
