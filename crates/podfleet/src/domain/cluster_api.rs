//! The seam between the controllers and the Kubernetes API server.
//!
//! Controllers only talk to [`ClusterApi`]; the production implementation is
//! [`KubeClusterApi`](crate::infrastructure::k8s::KubeClusterApi), tests use an
//! in-memory fake.

use core::error::Error;

use chrono::DateTime;
use chrono::Utc;
use derive_more::Display;
use error_stack::Report;
use k8s_openapi::api::core::v1::Pod;

use crate::domain::objects::ManagedObject;
use crate::domain::objects::ObjectKey;

/// Errors that can occur during Kubernetes operations.
#[derive(Debug, Clone, PartialEq, Eq, Display)]
pub enum KubernetesError {
    #[display("Failed to connect to Kubernetes API: {message}")]
    ConnectionFailed { message: String },
    #[display("{object} not found")]
    NotFound { object: String },
    #[display("{object} already exists")]
    AlreadyExists { object: String },
    #[display("Forbidden to access {object}: {message}")]
    Forbidden { object: String, message: String },
    #[display("Transient API failure on {object}: {message}")]
    Transient { object: String, message: String },
    #[display("API rejected request on {object}: {message}")]
    Rejected { object: String, message: String },
    #[display("Failed to watch {object}: {message}")]
    WatchFailed { object: String, message: String },
}

impl Error for KubernetesError {}

impl KubernetesError {
    /// Congestion, timeouts and lost connections; worth another attempt.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            KubernetesError::Transient { .. }
                | KubernetesError::ConnectionFailed { .. }
                | KubernetesError::WatchFailed { .. }
        )
    }

    pub fn is_forbidden(&self) -> bool {
        matches!(self, KubernetesError::Forbidden { .. })
    }

    pub fn is_already_exists(&self) -> bool {
        matches!(self, KubernetesError::AlreadyExists { .. })
    }

    /// Map an HTTP status returned by the API server.
    pub fn from_status(code: u16, object: impl Into<String>, message: impl Into<String>) -> Self {
        let object = object.into();
        let message = message.into();
        match code {
            401 | 403 => KubernetesError::Forbidden { object, message },
            404 => KubernetesError::NotFound { object },
            409 => KubernetesError::AlreadyExists { object },
            408 | 425 | 429 | 500 | 502 | 503 | 504 => KubernetesError::Transient { object, message },
            _ => KubernetesError::Rejected { object, message },
        }
    }
}

/// The queue's view of one workload, read from its tracking object.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueAdmissionRecord {
    /// Name of the workload tracking object.
    pub workload: String,
    /// Pod the workload was created for.
    pub pod_name: String,
    pub queue_name: Option<String>,
    pub priority_class: Option<String>,
    /// Bound to a resource flavor of a cluster queue.
    pub admitted: bool,
    pub admitted_at: Option<DateTime<Utc>>,
    pub flavor: Option<String>,
    pub finished: bool,
    /// The queue evicted the workload to make room for another one.
    pub preempted: bool,
}

#[async_trait::async_trait]
pub trait ClusterApi: Send + Sync {
    async fn get_object(&self, key: &ObjectKey)
        -> Result<Option<ManagedObject>, Report<KubernetesError>>;

    /// Create an object; an existing object yields [`KubernetesError::AlreadyExists`].
    async fn create_object(&self, object: &ManagedObject) -> Result<(), Report<KubernetesError>>;

    /// Server-side apply of the desired object.
    async fn patch_object(&self, object: &ManagedObject) -> Result<(), Report<KubernetesError>>;

    /// Delete an object. Deleting a missing object succeeds.
    async fn delete_object(&self, key: &ObjectKey) -> Result<(), Report<KubernetesError>>;

    async fn list_pods(
        &self,
        namespace: &str,
        label_selector: &str,
    ) -> Result<Vec<Pod>, Report<KubernetesError>>;

    /// Look up the workload the queue created for a pod.
    async fn find_workload(
        &self,
        namespace: &str,
        pod_name: &str,
    ) -> Result<Option<QueueAdmissionRecord>, Report<KubernetesError>>;

    async fn local_queue_exists(
        &self,
        namespace: &str,
        queue: &str,
    ) -> Result<bool, Report<KubernetesError>>;

    async fn priority_class_exists(&self, name: &str) -> Result<bool, Report<KubernetesError>>;

    async fn get_pod(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<Pod>, Report<KubernetesError>> {
        match self.get_object(&ObjectKey::pod(namespace, name)).await? {
            Some(ManagedObject::Pod(pod)) => Ok(Some(pod)),
            _ => Ok(None),
        }
    }
}
