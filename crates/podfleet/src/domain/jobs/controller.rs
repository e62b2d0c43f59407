use std::collections::BTreeMap;
use std::collections::HashMap;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use error_stack::Report;
use error_stack::ResultExt;
use tokio::select;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use tracing::error;
use tracing::info;
use tracing::warn;

use super::types::AttemptState;
use super::types::JobAttempt;
use super::types::JobEvent;
use super::types::JobRequest;
use super::types::JobStatus;
use super::types::JobTransition;
use super::types::ResubmitPolicy;
use super::types::TrackedJob;
use crate::domain::cluster_api::ClusterApi;
use crate::domain::cluster_api::KubernetesError;
use crate::domain::error::SubmissionError;
use crate::domain::labels;
use crate::domain::objects::ManagedObject;

/// Submits jobs to the queue and keeps every job alive across preemptions.
///
/// The controller is the single owner of its job table. Events may arrive
/// from a watch, from [`JobController::poll_events`] or both; each event is
/// applied at most once per pod and events about superseded attempts are
/// ignored, so duplicates and reordering never cause a second resubmission.
pub struct JobController<A> {
    api: Arc<A>,
    policy: ResubmitPolicy,
    jobs: BTreeMap<String, TrackedJob>,
    /// Attempt pods of every job that is not final yet, mapped to the job.
    pods: HashMap<String, String>,
    handled: HashSet<(&'static str, String)>,
}

impl<A: ClusterApi> JobController<A> {
    pub fn new(api: Arc<A>, policy: ResubmitPolicy) -> Self {
        Self {
            api,
            policy,
            jobs: BTreeMap::new(),
            pods: HashMap::new(),
            handled: HashSet::new(),
        }
    }

    pub fn jobs(&self) -> impl Iterator<Item = &TrackedJob> {
        self.jobs.values()
    }

    pub fn job(&self, name: &str) -> Option<&TrackedJob> {
        self.jobs.get(name)
    }

    /// Queue a new job. Returns the name of its first pod.
    ///
    /// # Errors
    ///
    /// - [`SubmissionError::QueueNotFound`] / [`SubmissionError::PriorityClassNotFound`] when the queue objects are missing
    /// - [`SubmissionError::DuplicateJob`] when a job of that name is still active
    /// - [`SubmissionError::CreateFailed`] when the pod cannot be created
    #[tracing::instrument(skip(self, request), fields(job = %request.name, queue = %request.queue_name))]
    pub async fn submit(&mut self, request: JobRequest) -> Result<String, Report<SubmissionError>> {
        request.validate()?;
        if self
            .jobs
            .get(&request.name)
            .is_some_and(|job| !job.status.is_final())
        {
            return Err(Report::new(SubmissionError::DuplicateJob {
                job: request.name.clone(),
            }));
        }

        let create_failed = || SubmissionError::CreateFailed {
            job: request.name.clone(),
        };
        let queue_exists = self
            .api
            .local_queue_exists(&request.namespace, &request.queue_name)
            .await
            .change_context_lazy(create_failed)?;
        if !queue_exists {
            return Err(Report::new(SubmissionError::QueueNotFound {
                queue: request.queue_name.clone(),
                namespace: request.namespace.clone(),
            }));
        }
        let class_exists = self
            .api
            .priority_class_exists(&request.priority_class)
            .await
            .change_context_lazy(create_failed)?;
        if !class_exists {
            return Err(Report::new(SubmissionError::PriorityClassNotFound {
                priority_class: request.priority_class.clone(),
            }));
        }

        let pod_name = self
            .create_attempt(&request, 1)
            .await
            .change_context_lazy(create_failed)?;
        info!(pod = %pod_name, "job submitted");

        self.track(request, pod_name.clone(), 1);
        Ok(pod_name)
    }

    /// Pick up jobs submitted by earlier processes from their pods. For each
    /// job only the newest attempt is tracked.
    ///
    /// # Errors
    ///
    /// Fails when the pods of the namespace cannot be listed.
    pub async fn adopt(&mut self, namespace: &str) -> Result<usize, Report<KubernetesError>> {
        let pods = self.api.list_pods(namespace, &labels::job_selector()).await?;

        let mut newest: BTreeMap<String, (JobRequest, u32, String)> = BTreeMap::new();
        for pod in &pods {
            let (Some(name), Some((request, attempt))) =
                (pod.metadata.name.clone(), JobRequest::from_pod(pod))
            else {
                continue;
            };
            // finished pods of older attempts still map to the job
            self.pods.insert(name.clone(), request.name.clone());
            match newest.get(&request.name) {
                Some((_, known, _)) if *known >= attempt => {}
                _ => {
                    newest.insert(request.name.clone(), (request, attempt, name));
                }
            }
        }

        let mut adopted = 0;
        for (job, (request, attempt, pod_name)) in newest {
            if self.jobs.contains_key(&job) {
                continue;
            }
            debug!(%job, pod = %pod_name, attempt, "adopting job");
            self.track(request, pod_name, attempt);
            adopted += 1;
        }
        Ok(adopted)
    }

    /// Apply one event.
    ///
    /// # Errors
    ///
    /// - [`SubmissionError::ResubmissionFailed`] when a preempted job cannot be queued again;
    ///   the event is forgotten so a later delivery retries the resubmission
    pub async fn handle(
        &mut self,
        event: JobEvent,
    ) -> Result<Option<JobTransition>, Report<SubmissionError>> {
        let pod_name = event.pod_name().to_string();
        let Some(job_name) = self.pods.get(&pod_name).cloned() else {
            debug!(pod = %pod_name, "event for a pod we did not create");
            return Ok(None);
        };
        let Some(job) = self.jobs.get_mut(&job_name) else {
            return Ok(None);
        };
        let Some(attempt) = job.attempts.last_mut() else {
            return Ok(None);
        };
        if attempt.pod_name != pod_name || job.status.is_final() {
            debug!(job = %job_name, pod = %pod_name, "stale event");
            return Ok(None);
        }
        let identity = event.identity();
        if !self.handled.insert(identity.clone()) {
            debug!(job = %job_name, pod = %pod_name, "duplicate event");
            return Ok(None);
        }

        let transition = match event {
            JobEvent::Admitted { record, .. } => {
                if attempt.state != AttemptState::Queued {
                    return Ok(None);
                }
                attempt.state = AttemptState::Admitted;
                attempt.admission = Some(record);
                job.status = JobStatus::Admitted;
                JobTransition::Admitted {
                    job: job_name.clone(),
                    pod_name,
                }
            }
            JobEvent::PodFinished {
                succeeded: false, ..
            } => {
                let namespace = job.request.namespace.clone();
                if self.failed_by_eviction(&namespace, &pod_name).await {
                    self.resubmit_once(&job_name, &pod_name, &identity).await?
                } else {
                    self.finish(&job_name, false)
                }
            }
            JobEvent::PodFinished { succeeded, .. } => self.finish(&job_name, succeeded),
            JobEvent::Evicted { .. } => self.resubmit_once(&job_name, &pod_name, &identity).await?,
            JobEvent::PodGone { .. } => {
                let was_admitted = attempt.state == AttemptState::Admitted;
                let namespace = job.request.namespace.clone();
                if was_admitted || self.evicted(&namespace, &pod_name).await {
                    self.resubmit_once(&job_name, &pod_name, &identity).await?
                } else {
                    if let Some(job) = self.jobs.get_mut(&job_name) {
                        job.status = JobStatus::Cancelled;
                    }
                    info!(job = %job_name, pod = %pod_name, "pod removed before admission, job cancelled");
                    JobTransition::Cancelled {
                        job: job_name.clone(),
                        pod_name,
                    }
                }
            }
        };
        if self.jobs.get(&job_name).is_some_and(|job| job.status.is_final()) {
            self.forget(&job_name);
        }
        info!(?transition, "job transition");
        Ok(Some(transition))
    }

    /// The queue's record tells whether a pod that vanished before we saw it
    /// admitted had been admitted or evicted in the meantime. An explicit
    /// eviction wins over a finished workload.
    async fn evicted(&self, namespace: &str, pod_name: &str) -> bool {
        match self.api.find_workload(namespace, pod_name).await {
            Ok(Some(record)) => record.preempted || (record.admitted && !record.finished),
            Ok(None) => false,
            Err(e) => {
                warn!(pod = %pod_name, error = ?e, "failed to read workload, treating pod as preempted");
                true
            }
        }
    }

    /// A failed pod without an eviction condition may still have been
    /// preempted; only the queue knows.
    async fn failed_by_eviction(&self, namespace: &str, pod_name: &str) -> bool {
        match self.api.find_workload(namespace, pod_name).await {
            Ok(record) => record.is_some_and(|record| record.preempted),
            Err(e) => {
                warn!(pod = %pod_name, error = ?e, "failed to read workload, treating failed pod as preempted");
                true
            }
        }
    }

    fn finish(&mut self, job_name: &str, succeeded: bool) -> JobTransition {
        if let Some(job) = self.jobs.get_mut(job_name) {
            if let Some(attempt) = job.attempts.last_mut() {
                attempt.state = AttemptState::Finished;
            }
            job.status = if succeeded {
                JobStatus::Succeeded
            } else {
                JobStatus::Failed
            };
        }
        JobTransition::Completed {
            job: job_name.to_string(),
            succeeded,
        }
    }

    /// Resubmit, forgetting the event on failure so that a later delivery of
    /// it retries.
    async fn resubmit_once(
        &mut self,
        job_name: &str,
        pod_name: &str,
        identity: &(&'static str, String),
    ) -> Result<JobTransition, Report<SubmissionError>> {
        match self.resubmit(job_name, pod_name).await {
            Ok(transition) => Ok(transition),
            Err(report) => {
                self.handled.remove(identity);
                Err(report)
            }
        }
    }

    /// Drop the bookkeeping of a job that reached a final status. Events
    /// about its pods are unknown afterwards and ignored.
    fn forget(&mut self, job_name: &str) {
        let pods: HashSet<String> = self
            .pods
            .iter()
            .filter(|(_, job)| job.as_str() == job_name)
            .map(|(pod, _)| pod.clone())
            .collect();
        self.pods.retain(|pod, _| !pods.contains(pod));
        self.handled.retain(|(_, pod)| !pods.contains(pod));
    }

    async fn resubmit(
        &mut self,
        job_name: &str,
        preempted_pod: &str,
    ) -> Result<JobTransition, Report<SubmissionError>> {
        let Some(job) = self.jobs.get(job_name) else {
            return Err(Report::new(SubmissionError::ResubmissionFailed {
                job: job_name.to_string(),
            }));
        };
        let number = job.attempts.len() as u32 + 1;

        if self.policy.max_attempts.is_some_and(|max| number > max) {
            warn!(job = %job_name, attempts = number - 1, "preempted too often, giving up");
            if let Some(job) = self.jobs.get_mut(job_name) {
                job.status = JobStatus::GaveUp;
            }
            return Ok(JobTransition::GaveUp {
                job: job_name.to_string(),
                attempts: number - 1,
            });
        }

        let request = job.request.clone();
        let resubmitted_pod = self
            .create_attempt(&request, number)
            .await
            .change_context_lazy(|| SubmissionError::ResubmissionFailed {
                job: job_name.to_string(),
            })?;
        warn!(job = %job_name, preempted = %preempted_pod, resubmitted = %resubmitted_pod, attempt = number, "job preempted, resubmitted");

        self.pods.insert(resubmitted_pod.clone(), job_name.to_string());
        if let Some(job) = self.jobs.get_mut(job_name) {
            job.status = JobStatus::Queued;
            job.attempts.push(JobAttempt {
                pod_name: resubmitted_pod.clone(),
                number,
                state: AttemptState::Queued,
                admission: None,
            });
        }
        Ok(JobTransition::Preempted {
            job: job_name.to_string(),
            preempted_pod: preempted_pod.to_string(),
            resubmitted_pod,
        })
    }

    /// Derive events for the current attempt of every active job by reading
    /// pods and workloads.
    ///
    /// # Errors
    ///
    /// Fails on the first API error; nothing is applied.
    pub async fn poll_events(&self) -> Result<Vec<JobEvent>, Report<KubernetesError>> {
        let mut events = Vec::new();
        for job in self.jobs.values().filter(|job| !job.status.is_final()) {
            let Some(attempt) = job.current() else {
                continue;
            };
            let namespace = &job.request.namespace;
            let pod_name = attempt.pod_name.clone();

            let Some(pod) = self.api.get_pod(namespace, &pod_name).await? else {
                events.push(JobEvent::PodGone { pod_name });
                continue;
            };
            if let Some(event) = JobEvent::from_pod(&pod) {
                events.push(event);
                continue;
            }
            if attempt.state == AttemptState::Queued {
                if let Some(record) = self.api.find_workload(namespace, &pod_name).await? {
                    if record.admitted {
                        events.push(JobEvent::Admitted { pod_name, record });
                    }
                }
            }
        }
        Ok(events)
    }

    /// Poll once and apply the resulting events.
    ///
    /// # Errors
    ///
    /// - [`SubmissionError::ResubmissionFailed`] when a preempted job cannot be queued again
    pub async fn reconcile_once(&mut self) -> Result<Vec<JobTransition>, Report<SubmissionError>> {
        let events = match self.poll_events().await {
            Ok(events) => events,
            Err(e) => {
                warn!(error = ?e, "failed to poll job state, retrying on the next cycle");
                return Ok(Vec::new());
            }
        };

        let mut transitions = Vec::new();
        for event in events {
            if let Some(transition) = self.handle(event).await? {
                transitions.push(transition);
            }
        }
        Ok(transitions)
    }

    /// Consume watch events and resync periodically until `token` is
    /// cancelled or every tracked job reached a final status.
    ///
    /// # Errors
    ///
    /// - [`SubmissionError::ResubmissionFailed`] when a preempted job cannot be queued again
    pub async fn run(
        &mut self,
        mut events: mpsc::Receiver<JobEvent>,
        resync: Duration,
        token: CancellationToken,
    ) -> Result<(), Report<SubmissionError>> {
        let mut interval = tokio::time::interval(resync);
        info!(jobs = self.jobs.len(), ?resync, "job controller started");

        loop {
            select! {
                biased;
                Some(event) = events.recv() => {
                    if let Err(e) = self.handle(event).await {
                        error!(error = ?e, "failed to handle job event");
                        return Err(e);
                    }
                }
                _ = interval.tick() => {
                    self.reconcile_once().await?;
                }
                _ = token.cancelled() => {
                    info!("job controller cancelled");
                    return Ok(());
                }
            }

            if !self.jobs.is_empty() && self.jobs.values().all(|job| job.status.is_final()) {
                info!("every job reached a final status");
                return Ok(());
            }
        }
    }

    async fn create_attempt(
        &self,
        request: &JobRequest,
        number: u32,
    ) -> Result<String, Report<KubernetesError>> {
        let suffix = uuid::Uuid::new_v4().simple().to_string();
        let pod_name = format!("{}-{}", request.name, &suffix[..8]);
        let pod = request.to_pod(&pod_name, number);
        self.api.create_object(&ManagedObject::Pod(pod)).await?;
        Ok(pod_name)
    }

    fn track(&mut self, request: JobRequest, pod_name: String, number: u32) {
        self.pods.insert(pod_name.clone(), request.name.clone());
        self.jobs.insert(
            request.name.clone(),
            TrackedJob {
                request,
                status: JobStatus::Queued,
                attempts: vec![JobAttempt {
                    pod_name,
                    number,
                    state: AttemptState::Queued,
                    admission: None,
                }],
            },
        );
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use similar_asserts::assert_eq;

    use super::*;
    use crate::config::ClusterConfig;
    use crate::domain::cluster_spec::ClusterSpec;
    use crate::domain::mock::grants_of;
    use crate::domain::mock::FakeCluster;
    use crate::domain::mock::HIGH_PRIORITY;
    use crate::domain::mock::LOW_PRIORITY;
    use crate::domain::mock::USER_QUEUE;
    use crate::domain::objects::ObjectKind;
    use crate::domain::render::render;

    const NS: &str = "default";

    fn job(name: &str, priority_class: &str, cpus: f64) -> JobRequest {
        JobRequest {
            name: name.to_string(),
            namespace: NS.to_string(),
            queue_name: USER_QUEUE.to_string(),
            priority_class: priority_class.to_string(),
            image: "python:3.11".to_string(),
            command: vec!["python".to_string(), "train.py".to_string()],
            cpus,
            memory_gb: 4.0,
            labels: BTreeMap::from([("team".to_string(), "data".to_string())]),
        }
    }

    fn controller(api: &Arc<FakeCluster>) -> JobController<FakeCluster> {
        JobController::new(api.clone(), ResubmitPolicy::default())
    }

    fn labels_of(api: &FakeCluster, pod: &str) -> BTreeMap<String, String> {
        api.pod(NS, pod).unwrap().metadata.labels.unwrap()
    }

    #[tokio::test]
    async fn missing_queue_objects_are_submission_errors() {
        let api = Arc::new(FakeCluster::with_kueue());
        let mut controller = controller(&api);

        let mut request = job("train", LOW_PRIORITY, 1.0);
        request.queue_name = "no-such-queue".to_string();
        let err = controller.submit(request).await.unwrap_err();
        assert_eq!(
            err.current_context(),
            &SubmissionError::QueueNotFound {
                queue: "no-such-queue".to_string(),
                namespace: NS.to_string(),
            }
        );

        let err = controller
            .submit(job("train", "urgent", 1.0))
            .await
            .unwrap_err();
        assert_eq!(
            err.current_context(),
            &SubmissionError::PriorityClassNotFound {
                priority_class: "urgent".to_string()
            }
        );
        assert_eq!(api.calls_matching("create Pod"), 0);
    }

    #[tokio::test]
    async fn active_job_names_are_unique() {
        let api = Arc::new(FakeCluster::with_kueue());
        let mut controller = controller(&api);
        controller.submit(job("train", LOW_PRIORITY, 1.0)).await.unwrap();

        let err = controller
            .submit(job("train", LOW_PRIORITY, 1.0))
            .await
            .unwrap_err();
        assert!(matches!(
            err.current_context(),
            SubmissionError::DuplicateJob { .. }
        ));
    }

    #[test_log::test(tokio::test)]
    async fn preempted_job_is_resubmitted_exactly_once() {
        let api = Arc::new(FakeCluster::with_kueue());
        let mut controller = controller(&api);
        let first = controller.submit(job("train", LOW_PRIORITY, 2.0)).await.unwrap();
        let original_labels = labels_of(&api, &first);

        api.admit_cycle();
        let transitions = controller.reconcile_once().await.unwrap();
        assert!(matches!(transitions[..], [JobTransition::Admitted { .. }]));

        // evicted by someone else while admitted
        api.remove_pod(NS, &first);
        let transitions = controller.reconcile_once().await.unwrap();
        let [JobTransition::Preempted {
            preempted_pod,
            resubmitted_pod,
            ..
        }] = &transitions[..]
        else {
            panic!("expected one preemption, got {transitions:?}");
        };
        assert_eq!(preempted_pod, &first);
        assert_ne!(resubmitted_pod, &first);
        assert_eq!(labels_of(&api, resubmitted_pod), original_labels);

        // repeated and stale deliveries change nothing
        let again = controller
            .handle(JobEvent::PodGone {
                pod_name: first.clone(),
            })
            .await
            .unwrap();
        assert_eq!(again, None);
        assert!(controller.reconcile_once().await.unwrap().is_empty());

        assert_eq!(api.calls_matching("create Pod"), 2);
        let job = controller.job("train").unwrap();
        assert_eq!(job.attempts.len(), 2);
        assert_eq!(job.status, JobStatus::Queued);
    }

    #[test_log::test(tokio::test)]
    async fn pod_failed_by_eviction_is_resubmitted() {
        let api = Arc::new(FakeCluster::with_kueue());
        let mut controller = controller(&api);
        let first = controller.submit(job("train", LOW_PRIORITY, 2.0)).await.unwrap();
        api.admit_cycle();
        controller.reconcile_once().await.unwrap();

        // fails with a disruption condition, deletion still in progress
        api.evict_pod(NS, &first);
        let transitions = controller.reconcile_once().await.unwrap();
        assert!(matches!(
            &transitions[..],
            [JobTransition::Preempted { preempted_pod, .. }] if preempted_pod == &first
        ));

        api.remove_pod(NS, &first);
        assert!(controller.reconcile_once().await.unwrap().is_empty());
        let late = controller
            .handle(JobEvent::PodGone {
                pod_name: first.clone(),
            })
            .await
            .unwrap();
        assert_eq!(late, None);

        assert_eq!(api.calls_matching("create Pod"), 2);
        let job = controller.job("train").unwrap();
        assert_eq!(job.status, JobStatus::Queued);
        assert_eq!(job.attempts.len(), 2);
    }

    #[tokio::test]
    async fn failure_reported_by_a_watch_checks_the_workload() {
        let api = Arc::new(FakeCluster::with_kueue());
        let mut controller = controller(&api);
        let pod = controller.submit(job("train", LOW_PRIORITY, 2.0)).await.unwrap();
        api.admit_cycle();
        controller.reconcile_once().await.unwrap();

        api.update_workload(NS, &pod, |record| {
            record.admitted = false;
            record.preempted = true;
        });
        let transition = controller
            .handle(JobEvent::PodFinished {
                pod_name: pod.clone(),
                succeeded: false,
            })
            .await
            .unwrap();

        assert!(matches!(transition, Some(JobTransition::Preempted { .. })));
        assert_eq!(controller.job("train").unwrap().status, JobStatus::Queued);
    }

    #[tokio::test]
    async fn genuine_failure_completes_the_job() {
        let api = Arc::new(FakeCluster::with_kueue());
        let mut controller = controller(&api);
        let pod = controller.submit(job("train", LOW_PRIORITY, 2.0)).await.unwrap();
        api.admit_cycle();
        controller.reconcile_once().await.unwrap();

        api.complete_pod(NS, &pod, false);
        assert_eq!(
            controller.reconcile_once().await.unwrap(),
            vec![JobTransition::Completed {
                job: "train".to_string(),
                succeeded: false,
            }]
        );
        assert_eq!(api.calls_matching("create Pod"), 1);
    }

    #[tokio::test]
    async fn eviction_wins_over_a_finished_workload() {
        let api = Arc::new(FakeCluster::with_kueue());
        let mut controller = controller(&api);
        let pod = controller.submit(job("train", LOW_PRIORITY, 2.0)).await.unwrap();

        api.update_workload(NS, &pod, |record| {
            record.preempted = true;
            record.finished = true;
        });
        let transition = controller
            .handle(JobEvent::PodGone { pod_name: pod })
            .await
            .unwrap();

        assert!(matches!(transition, Some(JobTransition::Preempted { .. })));
    }

    #[tokio::test]
    async fn finished_jobs_release_their_event_history() {
        let api = Arc::new(FakeCluster::with_kueue());
        let mut controller = controller(&api);
        let pod = controller.submit(job("train", LOW_PRIORITY, 2.0)).await.unwrap();
        api.admit_cycle();
        controller.reconcile_once().await.unwrap();
        assert!(!controller.handled.is_empty());

        api.complete_pod(NS, &pod, true);
        controller.reconcile_once().await.unwrap();

        assert!(controller.handled.is_empty());
        assert!(controller.pods.is_empty());
        let again = controller
            .handle(JobEvent::PodFinished {
                pod_name: pod,
                succeeded: true,
            })
            .await
            .unwrap();
        assert_eq!(again, None);
        assert_eq!(controller.job("train").unwrap().status, JobStatus::Succeeded);
    }

    #[tokio::test]
    async fn cluster_service_account_can_submit_jobs() {
        let config: ClusterConfig = serde_yaml::from_str(
            r#"
name: demo
image: ubuntu:22.04
resources: { cpus: 1, memory: 2 }
"#,
        )
        .unwrap();
        let rendered = render(&ClusterSpec::from_config(config).unwrap()).unwrap();
        let api = Arc::new(FakeCluster::with_kueue());
        api.act_as(grants_of(&rendered));
        let mut controller = controller(&api);

        let pod = controller.submit(job("train", LOW_PRIORITY, 1.0)).await.unwrap();
        api.admit_cycle();

        assert_eq!(
            controller.reconcile_once().await.unwrap(),
            vec![JobTransition::Admitted {
                job: "train".to_string(),
                pod_name: pod,
            }]
        );
    }

    #[tokio::test]
    async fn duplicate_admission_events_are_ignored() {
        let api = Arc::new(FakeCluster::with_kueue());
        let mut controller = controller(&api);
        let pod = controller.submit(job("train", LOW_PRIORITY, 2.0)).await.unwrap();
        api.admit_cycle();

        let events = controller.poll_events().await.unwrap();
        assert_eq!(events.len(), 1);
        let first = controller.handle(events[0].clone()).await.unwrap();
        let second = controller.handle(events[0].clone()).await.unwrap();

        assert_eq!(
            first,
            Some(JobTransition::Admitted {
                job: "train".to_string(),
                pod_name: pod,
            })
        );
        assert_eq!(second, None);
    }

    #[tokio::test]
    async fn pod_deleted_before_admission_cancels_the_job() {
        let api = Arc::new(FakeCluster::with_kueue());
        let mut controller = controller(&api);
        let pod = controller.submit(job("train", LOW_PRIORITY, 2.0)).await.unwrap();

        api.remove_pod(NS, &pod);
        let transitions = controller.reconcile_once().await.unwrap();

        assert_eq!(
            transitions,
            vec![JobTransition::Cancelled {
                job: "train".to_string(),
                pod_name: pod,
            }]
        );
        assert_eq!(api.calls_matching("create Pod"), 1);
    }

    #[tokio::test]
    async fn eviction_seen_only_through_the_workload_counts_as_preemption() {
        let api = Arc::new(FakeCluster::with_kueue());
        let mut controller = controller(&api);
        let low = controller.submit(job("low", LOW_PRIORITY, 8.0)).await.unwrap();
        api.admit_cycle();
        // admission of `low` is never observed before the eviction
        controller.submit(job("high", HIGH_PRIORITY, 8.0)).await.unwrap();
        api.admit_cycle();

        let transitions = controller.reconcile_once().await.unwrap();

        assert!(transitions.iter().any(|t| matches!(
            t,
            JobTransition::Preempted { preempted_pod, .. } if preempted_pod == &low
        )));
    }

    #[tokio::test]
    async fn second_job_waits_for_quota() {
        let api = Arc::new(FakeCluster::with_kueue());
        let mut controller = controller(&api);
        let first = controller.submit(job("first", LOW_PRIORITY, 6.0)).await.unwrap();
        let second = controller.submit(job("second", LOW_PRIORITY, 6.0)).await.unwrap();

        api.admit_cycle();
        let transitions = controller.reconcile_once().await.unwrap();
        assert_eq!(
            transitions,
            vec![JobTransition::Admitted {
                job: "first".to_string(),
                pod_name: first.clone(),
            }]
        );
        assert_eq!(api.pending_order(NS), vec![second.clone()]);
        assert_eq!(controller.job("second").unwrap().status, JobStatus::Queued);

        api.complete_pod(NS, &first, true);
        api.admit_cycle();
        let transitions = controller.reconcile_once().await.unwrap();
        assert_eq!(
            transitions,
            vec![
                JobTransition::Completed {
                    job: "first".to_string(),
                    succeeded: true,
                },
                JobTransition::Admitted {
                    job: "second".to_string(),
                    pod_name: second,
                },
            ]
        );
    }

    #[test_log::test(tokio::test)]
    async fn preempted_job_goes_to_the_back_of_the_queue() {
        let api = Arc::new(FakeCluster::with_kueue());
        let mut controller = controller(&api);

        let low = controller.submit(job("low", LOW_PRIORITY, 8.0)).await.unwrap();
        api.admit_cycle();
        controller.reconcile_once().await.unwrap();
        assert_eq!(controller.job("low").unwrap().status, JobStatus::Admitted);

        let waiting = controller.submit(job("waiting", LOW_PRIORITY, 8.0)).await.unwrap();
        let high = controller.submit(job("high", HIGH_PRIORITY, 8.0)).await.unwrap();
        api.admit_cycle();
        assert!(api.pod(NS, &low).is_none());
        assert!(api.workload(NS, &high).unwrap().admitted);

        let transitions = controller.reconcile_once().await.unwrap();
        let resubmitted = transitions
            .iter()
            .find_map(|t| match t {
                JobTransition::Preempted {
                    job,
                    resubmitted_pod,
                    ..
                } if job == "low" => Some(resubmitted_pod.clone()),
                _ => None,
            })
            .unwrap();
        assert!(transitions.contains(&JobTransition::Admitted {
            job: "high".to_string(),
            pod_name: high.clone(),
        }));

        api.admit_cycle();
        assert_eq!(api.pending_order(NS), vec![waiting.clone(), resubmitted.clone()]);
        assert_eq!(
            labels_of(&api, &resubmitted)[labels::PRIORITY_CLASS_LABEL],
            LOW_PRIORITY
        );

        api.complete_pod(NS, &high, true);
        api.admit_cycle();
        assert_eq!(api.pending_order(NS), vec![resubmitted]);
        assert!(api.workload(NS, &waiting).unwrap().admitted);
    }

    #[tokio::test]
    async fn resubmission_cap_gives_up() {
        let api = Arc::new(FakeCluster::with_kueue());
        let mut controller = JobController::new(
            api.clone(),
            ResubmitPolicy {
                max_attempts: Some(1),
            },
        );
        let pod = controller.submit(job("train", LOW_PRIORITY, 2.0)).await.unwrap();
        api.admit_cycle();
        controller.reconcile_once().await.unwrap();

        api.remove_pod(NS, &pod);
        let transitions = controller.reconcile_once().await.unwrap();

        assert_eq!(
            transitions,
            vec![JobTransition::GaveUp {
                job: "train".to_string(),
                attempts: 1,
            }]
        );
        assert_eq!(api.calls_matching("create Pod"), 1);
    }

    #[tokio::test]
    async fn failed_resubmission_surfaces_and_is_retried() {
        let api = Arc::new(FakeCluster::with_kueue());
        let mut controller = controller(&api);
        let pod = controller.submit(job("train", LOW_PRIORITY, 2.0)).await.unwrap();
        api.admit_cycle();
        controller.reconcile_once().await.unwrap();

        api.remove_pod(NS, &pod);
        api.fail_next_creates(1);
        let err = controller.reconcile_once().await.unwrap_err();
        assert_eq!(
            err.current_context(),
            &SubmissionError::ResubmissionFailed {
                job: "train".to_string()
            }
        );

        let transitions = controller.reconcile_once().await.unwrap();
        assert!(matches!(transitions[..], [JobTransition::Preempted { .. }]));
        assert_eq!(api.object_count(ObjectKind::Pod), 1);
    }

    #[tokio::test]
    async fn adopts_jobs_from_existing_pods() {
        let api = Arc::new(FakeCluster::with_kueue());
        let pod = controller(&api)
            .submit(job("train", LOW_PRIORITY, 2.0))
            .await
            .unwrap();

        let mut watcher = controller(&api);
        assert_eq!(watcher.adopt(NS).await.unwrap(), 1);
        assert_eq!(watcher.job("train").unwrap().request, job("train", LOW_PRIORITY, 2.0));

        api.admit_cycle();
        assert_eq!(
            watcher.reconcile_once().await.unwrap(),
            vec![JobTransition::Admitted {
                job: "train".to_string(),
                pod_name: pod,
            }]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn run_applies_channel_events_until_cancelled() {
        let api = Arc::new(FakeCluster::with_kueue());
        let mut controller = controller(&api);
        let pod = controller.submit(job("train", LOW_PRIORITY, 2.0)).await.unwrap();
        api.admit_cycle();

        let (tx, rx) = mpsc::channel(8);
        let record = api.workload(NS, &pod).unwrap();
        for _ in 0..3 {
            tx.send(JobEvent::Admitted {
                pod_name: pod.clone(),
                record: record.clone(),
            })
            .await
            .unwrap();
        }
        drop(tx);
        let token = CancellationToken::new();
        token.cancel();

        controller
            .run(rx, Duration::from_secs(10), token)
            .await
            .unwrap();

        let job = controller.job("train").unwrap();
        assert_eq!(job.status, JobStatus::Admitted);
        assert_eq!(job.attempts[0].admission.as_ref(), Some(&record));
    }
}
