//! Realizes the head Service and node pods of a rendered cluster.
//!
//! Pods are create-if-absent and never mutated in place. An existing pod is
//! matched against the desired one through the spec-hash annotation; a
//! mismatch needs an explicit delete and recreate.

use std::sync::Arc;
use std::time::Duration;

use error_stack::Report;
use futures::future::try_join_all;
use k8s_openapi::api::core::v1::Pod;
use tokio::time::Instant;
use tracing::debug;
use tracing::info;
use tracing::warn;

use crate::domain::cluster_api::ClusterApi;
use crate::domain::cluster_api::KubernetesError;
use crate::domain::cluster_spec::head_pod_name;
use crate::domain::cluster_spec::NodeRole;
use crate::domain::error::ProvisionError;
use crate::domain::labels;
use crate::domain::objects::ManagedObject;
use crate::domain::objects::ObjectKey;
use crate::domain::objects::ObjectKind;
use crate::domain::pod_state::PodPhase;
use crate::domain::pod_state::PodRecord;
use crate::domain::pod_state::PodTracker;
use crate::domain::render::RenderedCluster;
use crate::domain::retry::RetryPolicy;

const DEFAULT_READINESS_POLL: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PodAction {
    Created,
    Reused,
    Recreated,
}

pub struct NodePodController<A> {
    api: Arc<A>,
    retry: RetryPolicy,
    readiness_poll: Duration,
    recreate_on_drift: bool,
}

impl<A: ClusterApi> NodePodController<A> {
    pub fn new(api: Arc<A>, retry: RetryPolicy) -> Self {
        Self {
            api,
            retry,
            readiness_poll: DEFAULT_READINESS_POLL,
            recreate_on_drift: false,
        }
    }

    /// Delete and recreate pods whose spec changed instead of failing.
    pub fn with_recreate(mut self, recreate: bool) -> Self {
        self.recreate_on_drift = recreate;
        self
    }

    pub fn with_readiness_poll(mut self, interval: Duration) -> Self {
        self.readiness_poll = interval;
        self
    }

    /// Bring up the head Service, the head pod and the workers, then wait
    /// until every pod is ready.
    ///
    /// # Errors
    ///
    /// - [`ProvisionError::ImmutablePod`] when an existing pod has a different spec
    /// - [`ProvisionError::PodLost`] when a pod is preempted or terminates while waiting
    /// - [`ProvisionError::Timeout`] when the cluster is not ready within the provisioning timeout
    /// - [`ProvisionError::Permission`] when the identity may not manage pods
    #[tracing::instrument(skip(self, rendered), fields(cluster = %rendered.cluster_name, workers = rendered.worker_count))]
    pub async fn realize(
        &self,
        rendered: &RenderedCluster,
    ) -> Result<Vec<PodRecord>, Report<ProvisionError>> {
        let started = Instant::now();
        self.ensure_service(rendered).await?;

        let pods = rendered.pods();
        let (head, workers) = pods.split_first().ok_or_else(|| {
            Report::new(ProvisionError::Api {
                operation: "render cluster pods".to_string(),
            })
        })?;

        // The Service selects the head; it goes first so the endpoint exists
        // as early as possible.
        let action = self.ensure_pod(&head.1).await?;
        debug!(pod = %head_pod_name(&rendered.cluster_name), ?action, "head pod realized");

        let actions = try_join_all(workers.iter().map(|(_, pod)| self.ensure_pod(pod))).await?;
        debug!(?actions, "worker pods realized");

        let records = self.wait_ready(rendered, &pods, started).await?;
        info!(pods = records.len(), elapsed = ?started.elapsed(), "cluster is ready");
        Ok(records)
    }

    async fn ensure_service(&self, rendered: &RenderedCluster) -> Result<(), Report<ProvisionError>> {
        let desired = ManagedObject::Service(rendered.head_service.clone());
        let key = desired.key();
        let existing = self
            .retry
            .run(&format!("get {key}"), || self.api.get_object(&key))
            .await?;

        match existing {
            None => self.create(&desired, false).await,
            Some(current) if current.same_content(&desired) => Ok(()),
            Some(_) => {
                self.retry
                    .run(&format!("patch {key}"), || self.api.patch_object(&desired))
                    .await
            }
        }
    }

    async fn ensure_pod(&self, pod: &Pod) -> Result<PodAction, Report<ProvisionError>> {
        let desired = ManagedObject::Pod(pod.clone());
        let key = desired.key();
        let existing = self
            .retry
            .run(&format!("get {key}"), || self.api.get_object(&key))
            .await?;

        let Some(current) = existing else {
            self.create(&desired, false).await?;
            return Ok(PodAction::Created);
        };

        let ManagedObject::Pod(current_pod) = &current else {
            return Err(Report::new(ProvisionError::Api {
                operation: format!("get {key}"),
            }));
        };
        let gone = PodPhase::observe(current_pod).is_terminal();

        if !gone && current.same_content(&desired) {
            return Ok(PodAction::Reused);
        }
        if !gone && !self.recreate_on_drift {
            return Err(Report::new(ProvisionError::ImmutablePod {
                pod: key.name.clone(),
            })
            .attach_printable("rerun with --recreate to replace it"));
        }

        warn!(pod = %key.name, finished = gone, "replacing existing pod");
        self.retry
            .run(&format!("delete {key}"), || self.api.delete_object(&key))
            .await?;
        self.create(&desired, true).await?;
        Ok(PodAction::Recreated)
    }

    /// Create an object. While a deleted pod of the same name is still
    /// terminating, `AlreadyExists` is retried like any transient failure.
    async fn create(
        &self,
        desired: &ManagedObject,
        replacing: bool,
    ) -> Result<(), Report<ProvisionError>> {
        let key = desired.key();
        self.retry
            .run(&format!("create {key}"), move || async move {
                match self.api.create_object(desired).await {
                    Err(report) if report.current_context().is_already_exists() && replacing => {
                        Err(report.change_context(KubernetesError::Transient {
                            object: desired.key().to_string(),
                            message: "previous pod still terminating".to_string(),
                        }))
                    }
                    Err(report) if report.current_context().is_already_exists() => Ok(()),
                    other => other,
                }
            })
            .await
    }

    async fn wait_ready(
        &self,
        rendered: &RenderedCluster,
        pods: &[(NodeRole, Pod)],
        started: Instant,
    ) -> Result<Vec<PodRecord>, Report<ProvisionError>> {
        let expected = pods
            .iter()
            .filter_map(|(role, pod)| pod.metadata.name.clone().map(|name| (name, *role)));
        let mut tracker = PodTracker::new(&rendered.cluster_name, expected);
        let deadline = self.retry.deadline(started);
        let selector = labels::cluster_selector(&rendered.cluster_name);

        loop {
            let listed = self
                .retry
                .run("list cluster pods", || {
                    self.api.list_pods(&rendered.namespace, &selector)
                })
                .await?;
            tracker.observe(&listed);

            if let Some(lost) = tracker.lost() {
                return Err(Report::new(ProvisionError::PodLost {
                    pod: lost.name.clone(),
                    phase: lost.phase,
                }));
            }
            if tracker.all_ready() {
                return Ok(tracker.records());
            }
            if deadline.is_some_and(|deadline| Instant::now() + self.readiness_poll > deadline) {
                let pending: Vec<_> = tracker
                    .records()
                    .into_iter()
                    .filter(|record| record.phase != PodPhase::Running)
                    .map(|record| record.name)
                    .collect();
                return Err(Report::new(ProvisionError::Timeout {
                    operation: "wait for cluster pods".to_string(),
                    timeout: self.retry.timeout.as_duration().unwrap_or_default(),
                })
                .attach_printable(format!("pods not running: {pending:?}")));
            }
            tokio::time::sleep(self.readiness_poll).await;
        }
    }

    /// Pod records of a cluster, head first.
    pub async fn status(
        &self,
        namespace: &str,
        cluster: &str,
    ) -> Result<Vec<PodRecord>, Report<ProvisionError>> {
        let selector = labels::cluster_selector(cluster);
        let pods = self
            .retry
            .run("list cluster pods", || self.api.list_pods(namespace, &selector))
            .await?;
        let mut records: Vec<_> = pods.iter().filter_map(PodRecord::from_pod).collect();
        records.sort_by(|a, b| (a.role, &a.name).cmp(&(b.role, &b.name)));
        Ok(records)
    }

    /// Delete the pods and the head Service of a cluster. The RBAC set stays:
    /// other clusters in the namespace share it.
    #[tracing::instrument(skip(self))]
    pub async fn teardown(
        &self,
        namespace: &str,
        cluster: &str,
    ) -> Result<usize, Report<ProvisionError>> {
        let selector = labels::cluster_selector(cluster);
        let pods = self
            .retry
            .run("list cluster pods", || self.api.list_pods(namespace, &selector))
            .await?;

        let keys: Vec<_> = pods
            .iter()
            .filter_map(|pod| pod.metadata.name.as_deref())
            .map(|name| ObjectKey::pod(namespace, name))
            .collect();
        try_join_all(keys.iter().map(|key| async move {
            self.retry
                .run(&format!("delete {key}"), || self.api.delete_object(key))
                .await
        }))
        .await?;

        let service = ObjectKey::namespaced(ObjectKind::Service, namespace, &head_pod_name(cluster));
        self.retry
            .run(&format!("delete {service}"), || self.api.delete_object(&service))
            .await?;

        info!(pods = keys.len(), "cluster torn down");
        Ok(keys.len())
    }
}

#[cfg(test)]
mod tests {
    use similar_asserts::assert_eq;

    use super::*;
    use crate::config::ClusterConfig;
    use crate::domain::cluster_spec::ClusterSpec;
    use crate::domain::cluster_spec::ProvisionTimeout;
    use crate::domain::mock::FakeCluster;
    use crate::domain::rbac::RbacBootstrapper;
    use crate::domain::render::render;

    fn rendered_named(name: &str, num_nodes: u32, image: &str) -> RenderedCluster {
        let config: ClusterConfig = serde_yaml::from_str(&format!(
            r#"
name: {name}
numNodes: {num_nodes}
image: {image}
resources: {{ cpus: 2, memory: 4 }}
"#
        ))
        .unwrap();
        render(&ClusterSpec::from_config(config).unwrap()).unwrap()
    }

    fn rendered(num_nodes: u32, image: &str) -> RenderedCluster {
        rendered_named("demo", num_nodes, image)
    }

    fn controller(api: &Arc<FakeCluster>, timeout: ProvisionTimeout) -> NodePodController<FakeCluster> {
        NodePodController::new(api.clone(), RetryPolicy::new(timeout))
            .with_readiness_poll(Duration::from_millis(500))
    }

    fn bounded() -> ProvisionTimeout {
        ProvisionTimeout::Bounded(Duration::from_secs(10))
    }

    #[test_log::test(tokio::test(start_paused = true))]
    async fn realizes_one_head_and_all_workers() {
        let api = Arc::new(FakeCluster::new());

        for workers in [0u32, 1, 4] {
            let rendered = rendered_named(&format!("demo{workers}"), workers + 1, "ubuntu:22.04");

            let records = controller(&api, bounded()).realize(&rendered).await.unwrap();

            let heads = records.iter().filter(|r| r.role == NodeRole::Head).count();
            let worker_pods = records.iter().filter(|r| r.role == NodeRole::Worker).count();
            assert_eq!((heads, worker_pods), (1, workers as usize));
            assert!(records.iter().all(|r| r.phase == PodPhase::Running));
        }

        assert_eq!(api.object_count(ObjectKind::Pod), 1 + 2 + 5);
        assert_eq!(api.object_count(ObjectKind::Service), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn head_service_selects_only_the_head() {
        let api = Arc::new(FakeCluster::new());
        let rendered = rendered(3, "ubuntu:22.04");
        controller(&api, bounded()).realize(&rendered).await.unwrap();

        let selector = rendered
            .head_service
            .spec
            .as_ref()
            .and_then(|spec| spec.selector.clone())
            .unwrap();
        let selected: Vec<_> = api
            .pods("default")
            .into_iter()
            .filter(|pod| {
                let labels = pod.metadata.labels.clone().unwrap_or_default();
                selector.iter().all(|(k, v)| labels.get(k) == Some(v))
            })
            .filter_map(|pod| pod.metadata.name)
            .collect();
        assert_eq!(selected, vec!["demo-head".to_string()]);
    }

    #[tokio::test(start_paused = true)]
    async fn realizing_twice_reuses_pods() {
        let api = Arc::new(FakeCluster::new());
        let rendered = rendered(3, "ubuntu:22.04");

        controller(&api, bounded()).realize(&rendered).await.unwrap();
        controller(&api, bounded()).realize(&rendered).await.unwrap();

        assert_eq!(api.calls_matching("create Pod"), 3);
        assert_eq!(api.calls_matching("delete"), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn changed_pod_spec_is_not_patched_in_place() {
        let api = Arc::new(FakeCluster::new());
        controller(&api, bounded())
            .realize(&rendered(2, "ubuntu:22.04"))
            .await
            .unwrap();

        let changed = rendered(2, "ubuntu:24.04");
        let err = controller(&api, bounded()).realize(&changed).await.unwrap_err();
        assert_eq!(
            err.current_context(),
            &ProvisionError::ImmutablePod {
                pod: "demo-head".to_string()
            }
        );
        assert_eq!(api.calls_matching("patch Pod"), 0);

        controller(&api, bounded())
            .with_recreate(true)
            .realize(&changed)
            .await
            .unwrap();
        assert_eq!(api.calls_matching("delete Pod"), 2);
        let head = api.pod("default", "demo-head").unwrap();
        assert_eq!(
            head.spec.unwrap().containers[0].image.as_deref(),
            Some("ubuntu:24.04")
        );
    }

    #[tokio::test(start_paused = true)]
    async fn pods_that_never_become_ready_time_out() {
        let api = Arc::new(FakeCluster::new());
        api.hold_pending();

        let err = controller(&api, ProvisionTimeout::Bounded(Duration::from_secs(5)))
            .realize(&rendered(2, "ubuntu:22.04"))
            .await
            .unwrap_err();

        assert!(matches!(
            err.current_context(),
            ProvisionError::Timeout { .. }
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn pod_deleted_while_waiting_is_lost() {
        let api = Arc::new(FakeCluster::new());
        api.hold_pending();
        let controller = controller(&api, ProvisionTimeout::Unbounded);
        let rendered = rendered(2, "ubuntu:22.04");

        let (result, ()) = tokio::join!(controller.realize(&rendered), async {
            tokio::time::sleep(Duration::from_secs(3)).await;
            api.remove_pod("default", "demo-worker1");
        });

        let err = result.unwrap_err();
        assert_eq!(
            err.current_context(),
            &ProvisionError::PodLost {
                pod: "demo-worker1".to_string(),
                phase: PodPhase::Preempted,
            }
        );
    }

    #[tokio::test(start_paused = true)]
    async fn status_lists_head_first() {
        let api = Arc::new(FakeCluster::new());
        let controller = controller(&api, bounded());
        controller.realize(&rendered(3, "ubuntu:22.04")).await.unwrap();

        let names: Vec<_> = controller
            .status("default", "demo")
            .await
            .unwrap()
            .into_iter()
            .map(|record| record.name)
            .collect();
        assert_eq!(names, vec!["demo-head", "demo-worker1", "demo-worker2"]);
    }

    #[tokio::test(start_paused = true)]
    async fn teardown_keeps_rbac() {
        let api = Arc::new(FakeCluster::new());
        let rendered = rendered(3, "ubuntu:22.04");
        RbacBootstrapper::new(api.clone(), RetryPolicy::new(bounded()))
            .bootstrap(&rendered)
            .await
            .unwrap();
        let controller = controller(&api, bounded());
        controller.realize(&rendered).await.unwrap();

        let deleted = controller.teardown("default", "demo").await.unwrap();

        assert_eq!(deleted, 3);
        assert_eq!(api.object_count(ObjectKind::Pod), 0);
        assert_eq!(api.object_count(ObjectKind::Service), 0);
        assert_eq!(api.object_count(ObjectKind::Role), 3);
        assert_eq!(api.object_count(ObjectKind::ServiceAccount), 1);
    }
}
