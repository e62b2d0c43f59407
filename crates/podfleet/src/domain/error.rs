//! Error taxonomy shared by the provisioning and job components.
//!
//! - [`ValidationError`]: the cluster description is unusable, nothing was created
//! - [`PermissionError`]: the caller's identity cannot manage the required objects
//! - [`ProvisionError`]: realization failed (permission, timeout, immutability, lost pods)
//! - [`SubmissionError`]: a job cannot be queued, never retried
//!
//! Preemption is not an error; it is reported as
//! [`JobTransition::Preempted`](crate::domain::jobs::JobTransition::Preempted).

use core::error::Error;
use std::time::Duration;

use derive_more::Display;

use crate::domain::pod_state::PodPhase;

#[derive(Debug, Clone, PartialEq, Eq, Display)]
pub enum ValidationError {
    #[display("invalid value for `{field}`: {message}")]
    InvalidField { field: &'static str, message: String },
    #[display("accelerators requested with flavor `{flavor}`, but no such resource flavor is declared")]
    UnknownResourceFlavor { flavor: String },
    #[display("FUSE is required, but no FUSE device manager integration is configured")]
    FuseDeviceManagerMissing,
}

impl Error for ValidationError {}

impl ValidationError {
    pub(crate) fn invalid(field: &'static str, message: impl Into<String>) -> Self {
        Self::InvalidField {
            field,
            message: message.into(),
        }
    }
}

/// The bootstrapping identity lacks a privilege. Requires operator action.
#[derive(Debug, Clone, PartialEq, Eq, Display)]
#[display("permission denied while trying to {operation}: {message}")]
pub struct PermissionError {
    pub operation: String,
    pub message: String,
}

impl Error for PermissionError {}

#[derive(Debug, Clone, PartialEq, Eq, Display)]
pub enum ProvisionError {
    #[display("{_0}")]
    Permission(PermissionError),
    #[display("{operation} did not succeed within {timeout:?}")]
    Timeout { operation: String, timeout: Duration },
    #[display("pod {pod} already exists with a different spec; pods are immutable, delete and recreate it")]
    ImmutablePod { pod: String },
    #[display("{binding} is bound to a different role; roleRef is immutable, delete the binding and retry")]
    ImmutableRoleRef { binding: String },
    #[display("pod {pod} left the cluster while provisioning ({phase})")]
    PodLost { pod: String, phase: PodPhase },
    #[display("kubernetes API rejected {operation}")]
    Api { operation: String },
}

impl Error for ProvisionError {}

impl ProvisionError {
    /// Whether an operator has to intervene before a retry can succeed.
    pub fn requires_operator(&self) -> bool {
        matches!(
            self,
            Self::Permission(_) | Self::ImmutablePod { .. } | Self::ImmutableRoleRef { .. }
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Display)]
pub enum SubmissionError {
    #[display("local queue `{queue}` does not exist in namespace `{namespace}`")]
    QueueNotFound { queue: String, namespace: String },
    #[display("workload priority class `{priority_class}` does not exist")]
    PriorityClassNotFound { priority_class: String },
    #[display("job `{job}` is invalid: {message}")]
    InvalidJob { job: String, message: String },
    #[display("job `{job}` is already tracked")]
    DuplicateJob { job: String },
    #[display("failed to create pod for job `{job}`")]
    CreateFailed { job: String },
    #[display("failed to resubmit preempted job `{job}`")]
    ResubmissionFailed { job: String },
}

impl Error for SubmissionError {}
