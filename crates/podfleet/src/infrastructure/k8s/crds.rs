//! Read-only views of the queue's custom resources (`kueue.x-k8s.io/v1beta1`).
//!
//! Only the fields podfleet inspects are declared; everything else the API
//! server returns is ignored on deserialization.

use chrono::DateTime;
use chrono::Utc;
use kube::CustomResource;
use schemars::JsonSchema;
use serde::Deserialize;
use serde::Serialize;

use crate::domain::cluster_api::QueueAdmissionRecord;
use crate::domain::labels::QUEUE_NAME_LABEL;

pub const KUEUE_GROUP: &str = "kueue.x-k8s.io";
pub const KUEUE_VERSION: &str = "v1beta1";

/// Tracking object the queue creates for every queued pod.
#[derive(CustomResource, Clone, Debug, Default, Deserialize, JsonSchema, Serialize)]
#[kube(
    group = "kueue.x-k8s.io",
    version = "v1beta1",
    kind = "Workload",
    namespaced,
    status = "WorkloadStatus"
)]
#[serde(rename_all = "camelCase")]
pub struct WorkloadSpec {
    #[serde(default)]
    pub queue_name: Option<String>,
    #[serde(default)]
    pub priority_class_name: Option<String>,
    #[serde(default)]
    pub priority: Option<i32>,
}

#[derive(Debug, Clone, Default, Deserialize, JsonSchema, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct WorkloadStatus {
    #[serde(default)]
    pub admission: Option<Admission>,
    #[serde(default)]
    pub conditions: Vec<WorkloadCondition>,
}

#[derive(Debug, Clone, Default, Deserialize, JsonSchema, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Admission {
    pub cluster_queue: String,
    #[serde(default)]
    pub pod_set_assignments: Vec<PodSetAssignment>,
}

#[derive(Debug, Clone, Default, Deserialize, JsonSchema, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PodSetAssignment {
    pub name: String,
    /// Resource name to flavor name.
    #[serde(default)]
    pub flavors: std::collections::BTreeMap<String, String>,
}

#[derive(Debug, Clone, Default, Deserialize, JsonSchema, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct WorkloadCondition {
    #[serde(rename = "type")]
    pub type_: String,
    pub status: String,
    #[serde(default)]
    pub reason: Option<String>,
    #[serde(default)]
    pub last_transition_time: Option<String>,
}

impl Workload {
    fn condition(&self, type_: &str) -> Option<&WorkloadCondition> {
        self.status
            .as_ref()?
            .conditions
            .iter()
            .find(|condition| condition.type_ == type_ && condition.status == "True")
    }

    /// Name of the pod this workload was created for.
    pub fn owner_pod(&self) -> Option<&str> {
        self.metadata
            .owner_references
            .as_ref()?
            .iter()
            .find(|owner| owner.kind == "Pod")
            .map(|owner| owner.name.as_str())
    }

    pub fn admission_record(&self) -> Option<QueueAdmissionRecord> {
        let pod_name = self.owner_pod()?.to_string();
        let admitted = self.condition("Admitted");
        let evicted = self
            .condition("Evicted")
            .is_some_and(|condition| condition.reason.as_deref() == Some("Preempted"));

        let flavor = self
            .status
            .as_ref()
            .and_then(|status| status.admission.as_ref())
            .and_then(|admission| admission.pod_set_assignments.first())
            .and_then(|assignment| assignment.flavors.values().next().cloned());
        let queue_name = self.spec.queue_name.clone().or_else(|| {
            self.metadata
                .labels
                .as_ref()
                .and_then(|labels| labels.get(QUEUE_NAME_LABEL).cloned())
        });

        Some(QueueAdmissionRecord {
            workload: self.metadata.name.clone().unwrap_or_default(),
            pod_name,
            queue_name,
            priority_class: self.spec.priority_class_name.clone(),
            admitted: admitted.is_some(),
            admitted_at: admitted
                .and_then(|condition| condition.last_transition_time.as_deref())
                .and_then(|time| DateTime::parse_from_rfc3339(time).ok())
                .map(|time| time.with_timezone(&Utc)),
            flavor,
            finished: self.condition("Finished").is_some(),
            preempted: evicted || self.condition("Preempted").is_some(),
        })
    }
}
