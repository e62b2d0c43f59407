use std::collections::BTreeMap;

use error_stack::Report;
use k8s_openapi::api::core::v1::Container;
use k8s_openapi::api::core::v1::Pod;
use k8s_openapi::api::core::v1::PodSpec;
use k8s_openapi::api::core::v1::ResourceRequirements;
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;

use crate::domain::cluster_api::QueueAdmissionRecord;
use crate::domain::error::SubmissionError;
use crate::domain::labels;
use crate::domain::pod_state::PodPhase;

/// Pod names get a `-xxxxxxxx` suffix per attempt.
const MAX_JOB_NAME_LEN: usize = 54;
const JOB_CONTAINER: &str = "job";

/// A job to run through the queue. Every attempt is created from this
/// request, so all attempts carry identical labels and resources.
#[derive(Debug, Clone, PartialEq)]
pub struct JobRequest {
    pub name: String,
    pub namespace: String,
    pub queue_name: String,
    pub priority_class: String,
    pub image: String,
    pub command: Vec<String>,
    pub cpus: f64,
    pub memory_gb: f64,
    /// Extra labels copied onto every attempt.
    pub labels: BTreeMap<String, String>,
}

impl JobRequest {
    /// # Errors
    ///
    /// - [`SubmissionError::InvalidJob`] for names, images or sizes the API would reject
    pub fn validate(&self) -> Result<(), Report<SubmissionError>> {
        let invalid = |message: String| {
            Report::new(SubmissionError::InvalidJob {
                job: self.name.clone(),
                message,
            })
        };

        let name_ok = !self.name.is_empty()
            && self.name.len() <= MAX_JOB_NAME_LEN
            && self
                .name
                .chars()
                .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-')
            && !self.name.starts_with('-')
            && !self.name.ends_with('-');
        if !name_ok {
            return Err(invalid(format!(
                "name must be a lowercase DNS label of at most {MAX_JOB_NAME_LEN} characters"
            )));
        }
        if self.image.trim().is_empty() {
            return Err(invalid("image must not be empty".to_string()));
        }
        if !(self.cpus.is_finite() && self.cpus > 0.0) {
            return Err(invalid(format!("cpus must be positive, got {}", self.cpus)));
        }
        if !(self.memory_gb.is_finite() && self.memory_gb > 0.0) {
            return Err(invalid(format!(
                "memory must be positive, got {}",
                self.memory_gb
            )));
        }
        Ok(())
    }

    /// Labels shared by every attempt of this job.
    pub fn pod_labels(&self) -> BTreeMap<String, String> {
        let mut pod_labels = self.labels.clone();
        pod_labels.insert(
            labels::MANAGED_BY_LABEL.to_string(),
            labels::MANAGED_BY_VALUE.to_string(),
        );
        pod_labels.insert(labels::JOB_LABEL.to_string(), self.name.clone());
        pod_labels.insert(labels::QUEUE_NAME_LABEL.to_string(), self.queue_name.clone());
        pod_labels.insert(
            labels::PRIORITY_CLASS_LABEL.to_string(),
            self.priority_class.clone(),
        );
        pod_labels
    }

    pub fn to_pod(&self, pod_name: &str, attempt: u32) -> Pod {
        let amounts = BTreeMap::from([
            ("cpu".to_string(), Quantity(self.cpus.to_string())),
            ("memory".to_string(), Quantity(format!("{}G", self.memory_gb))),
        ]);
        Pod {
            metadata: ObjectMeta {
                name: Some(pod_name.to_string()),
                namespace: Some(self.namespace.clone()),
                labels: Some(self.pod_labels()),
                annotations: Some(BTreeMap::from([(
                    labels::ATTEMPT_ANNOTATION.to_string(),
                    attempt.to_string(),
                )])),
                ..Default::default()
            },
            spec: Some(PodSpec {
                restart_policy: Some("Never".to_string()),
                containers: vec![Container {
                    name: JOB_CONTAINER.to_string(),
                    image: Some(self.image.clone()),
                    command: (!self.command.is_empty()).then(|| self.command.clone()),
                    resources: Some(ResourceRequirements {
                        requests: Some(amounts.clone()),
                        limits: Some(amounts),
                        ..Default::default()
                    }),
                    ..Default::default()
                }],
                ..Default::default()
            }),
            status: None,
        }
    }

    /// Rebuild the request from one of its attempt pods, together with the
    /// attempt number.
    pub fn from_pod(pod: &Pod) -> Option<(Self, u32)> {
        let metadata = &pod.metadata;
        let mut extra = metadata.labels.clone()?;
        let name = extra.remove(labels::JOB_LABEL)?;
        let queue_name = extra.remove(labels::QUEUE_NAME_LABEL)?;
        let priority_class = extra.remove(labels::PRIORITY_CLASS_LABEL)?;
        extra.remove(labels::MANAGED_BY_LABEL);

        let container = pod.spec.as_ref()?.containers.first()?;
        let requests = container.resources.as_ref()?.requests.as_ref()?;
        let cpus = requests.get("cpu")?.0.parse().ok()?;
        let memory_gb = requests.get("memory")?.0.trim_end_matches('G').parse().ok()?;
        let attempt = metadata
            .annotations
            .as_ref()
            .and_then(|annotations| annotations.get(labels::ATTEMPT_ANNOTATION))
            .and_then(|value| value.parse().ok())
            .unwrap_or(1);

        Some((
            Self {
                name,
                namespace: metadata.namespace.clone()?,
                queue_name,
                priority_class,
                image: container.image.clone()?,
                command: container.command.clone().unwrap_or_default(),
                cpus,
                memory_gb,
                labels: extra,
            },
            attempt,
        ))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttemptState {
    Queued,
    Admitted,
    Finished,
}

/// One pod created for a job. Attempts are never revived: a preempted attempt
/// is followed by a new one with a new pod name.
#[derive(Debug, Clone, PartialEq)]
pub struct JobAttempt {
    pub pod_name: String,
    pub number: u32,
    pub state: AttemptState,
    pub admission: Option<QueueAdmissionRecord>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, derive_more::Display)]
pub enum JobStatus {
    #[display("Queued")]
    Queued,
    #[display("Admitted")]
    Admitted,
    #[display("Succeeded")]
    Succeeded,
    #[display("Failed")]
    Failed,
    #[display("Cancelled")]
    Cancelled,
    /// Preempted more often than the resubmission policy allows.
    #[display("GaveUp")]
    GaveUp,
}

impl JobStatus {
    pub fn is_final(self) -> bool {
        !matches!(self, JobStatus::Queued | JobStatus::Admitted)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct TrackedJob {
    pub request: JobRequest,
    pub status: JobStatus,
    pub attempts: Vec<JobAttempt>,
}

impl TrackedJob {
    pub fn current(&self) -> Option<&JobAttempt> {
        self.attempts.last()
    }

    pub fn preemptions(&self) -> usize {
        self.attempts.len().saturating_sub(1)
    }
}

/// Observation about one attempt pod. Delivered at least once, possibly
/// repeated or out of order.
#[derive(Debug, Clone, PartialEq)]
pub enum JobEvent {
    /// The workload of the pod was bound to a resource flavor.
    Admitted {
        pod_name: String,
        record: QueueAdmissionRecord,
    },
    PodGone {
        pod_name: String,
    },
    /// The pod was evicted to make room, possibly while it still exists.
    Evicted {
        pod_name: String,
    },
    PodFinished {
        pod_name: String,
        succeeded: bool,
    },
}

impl JobEvent {
    pub fn pod_name(&self) -> &str {
        match self {
            JobEvent::Admitted { pod_name, .. }
            | JobEvent::PodGone { pod_name }
            | JobEvent::Evicted { pod_name }
            | JobEvent::PodFinished { pod_name, .. } => pod_name,
        }
    }

    /// Event implied by the current state of a pod, if any. A pod that failed
    /// because it was evicted is reported as evicted, not as finished.
    pub fn from_pod(pod: &Pod) -> Option<JobEvent> {
        let pod_name = pod.metadata.name.clone()?;
        match PodPhase::observe(pod) {
            PodPhase::Preempted => Some(JobEvent::Evicted { pod_name }),
            PodPhase::Terminated => match pod.status.as_ref()?.phase.as_deref()? {
                "Succeeded" => Some(JobEvent::PodFinished {
                    pod_name,
                    succeeded: true,
                }),
                "Failed" => Some(JobEvent::PodFinished {
                    pod_name,
                    succeeded: false,
                }),
                _ => None,
            },
            PodPhase::Pending | PodPhase::Running => None,
        }
    }

    /// Identity used to drop repeated deliveries.
    pub(crate) fn identity(&self) -> (&'static str, String) {
        let kind = match self {
            JobEvent::Admitted { .. } => "admitted",
            // an eviction and the deletion that follows end the same attempt
            JobEvent::PodGone { .. } | JobEvent::Evicted { .. } => "gone",
            JobEvent::PodFinished { .. } => "finished",
        };
        (kind, self.pod_name().to_string())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum JobTransition {
    Admitted {
        job: String,
        pod_name: String,
    },
    Completed {
        job: String,
        succeeded: bool,
    },
    /// The admitted attempt was evicted and a new attempt was queued.
    Preempted {
        job: String,
        preempted_pod: String,
        resubmitted_pod: String,
    },
    /// The pod was deleted before the queue admitted it.
    Cancelled {
        job: String,
        pod_name: String,
    },
    GaveUp {
        job: String,
        attempts: u32,
    },
}

/// How preempted jobs are resubmitted.
///
/// Resubmissions keep the original priority class, so they queue behind
/// everything already waiting at that priority. A job that keeps being
/// preempted by higher priority work can starve; `max_attempts` bounds how
/// long that goes on.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ResubmitPolicy {
    /// Total attempts including the first submission. `None` is unlimited.
    pub max_attempts: Option<u32>,
}
