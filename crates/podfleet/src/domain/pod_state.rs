//! Pod lifecycle as seen by the controllers.
//!
//! `Pending -> Running -> {Preempted | Terminated}`. The last two phases are
//! terminal: a preempted pod is replaced by a new submission, never revived.

use std::collections::BTreeMap;

use derive_more::Display;
use k8s_openapi::api::core::v1::Pod;

use crate::domain::cluster_spec::NodeRole;
use crate::domain::labels::CLUSTER_LABEL;
use crate::domain::labels::NODE_ROLE_LABEL;

/// Pod conditions set when a pod is evicted to make room for other work.
const PREEMPTION_CONDITIONS: [&str; 2] = ["DisruptionTarget", "TerminationTarget"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display)]
pub enum PodPhase {
    #[display("Pending")]
    Pending,
    #[display("Running")]
    Running,
    #[display("Preempted")]
    Preempted,
    #[display("Terminated")]
    Terminated,
}

impl PodPhase {
    pub fn is_terminal(self) -> bool {
        matches!(self, PodPhase::Preempted | PodPhase::Terminated)
    }

    /// Apply an observed phase to the current one.
    ///
    /// Terminal phases never change and a running pod never goes back to
    /// pending, so stale or reordered observations are harmless.
    pub fn advance(self, observed: PodPhase) -> PodPhase {
        match (self, observed) {
            (current, _) if current.is_terminal() => current,
            (PodPhase::Running, PodPhase::Pending) => PodPhase::Running,
            (_, observed) => observed,
        }
    }

    /// Classify a pod object as returned by the API server.
    ///
    /// A pod that failed while carrying a disruption condition, or while
    /// being deleted, was evicted: it is `Preempted`, not `Terminated`.
    pub fn observe(pod: &Pod) -> PodPhase {
        let status = pod.status.as_ref();
        let preempted = status
            .and_then(|status| status.conditions.as_ref())
            .is_some_and(|conditions| {
                conditions.iter().any(|condition| {
                    PREEMPTION_CONDITIONS.contains(&condition.type_.as_str())
                        && condition.status == "True"
                })
            });
        let phase = status.and_then(|status| status.phase.as_deref());
        let deleting = pod.metadata.deletion_timestamp.is_some();

        match phase {
            Some("Succeeded") => PodPhase::Terminated,
            _ if preempted => PodPhase::Preempted,
            Some("Failed") if deleting => PodPhase::Preempted,
            Some("Failed") => PodPhase::Terminated,
            _ if deleting => PodPhase::Terminated,
            Some("Running") => PodPhase::Running,
            _ => PodPhase::Pending,
        }
    }
}

pub fn is_ready(pod: &Pod) -> bool {
    pod.status
        .as_ref()
        .and_then(|status| status.conditions.as_ref())
        .is_some_and(|conditions| {
            conditions
                .iter()
                .any(|condition| condition.type_ == "Ready" && condition.status == "True")
        })
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PodRecord {
    pub name: String,
    pub role: NodeRole,
    pub phase: PodPhase,
    pub cluster: String,
}

impl PodRecord {
    /// Build a record from a pod carrying podfleet labels. Pods without a
    /// role or cluster label are not cluster nodes.
    pub fn from_pod(pod: &Pod) -> Option<Self> {
        let labels = pod.metadata.labels.as_ref()?;
        let role = NodeRole::from_label(labels.get(NODE_ROLE_LABEL)?)?;
        Some(Self {
            name: pod.metadata.name.clone()?,
            role,
            phase: PodPhase::observe(pod),
            cluster: labels.get(CLUSTER_LABEL)?.clone(),
        })
    }
}

#[derive(Debug, Clone)]
struct TrackedPod {
    record: PodRecord,
    ready: bool,
    seen: bool,
}

/// Follows the expected pods of one cluster across repeated list calls.
#[derive(Debug, Clone)]
pub struct PodTracker {
    pods: BTreeMap<String, TrackedPod>,
}

impl PodTracker {
    pub fn new(cluster: &str, expected: impl IntoIterator<Item = (String, NodeRole)>) -> Self {
        let pods = expected
            .into_iter()
            .map(|(name, role)| {
                let record = PodRecord {
                    name: name.clone(),
                    role,
                    phase: PodPhase::Pending,
                    cluster: cluster.to_string(),
                };
                (
                    name,
                    TrackedPod {
                        record,
                        ready: false,
                        seen: false,
                    },
                )
            })
            .collect();
        Self { pods }
    }

    /// Fold one listing into the tracked state. A pod that was seen before and
    /// is missing now was deleted from outside: it counts as preempted.
    pub fn observe(&mut self, listed: &[Pod]) {
        let listed: BTreeMap<&str, &Pod> = listed
            .iter()
            .filter_map(|pod| pod.metadata.name.as_deref().map(|name| (name, pod)))
            .collect();

        for (name, tracked) in &mut self.pods {
            match listed.get(name.as_str()) {
                Some(pod) => {
                    tracked.seen = true;
                    tracked.record.phase = tracked.record.phase.advance(PodPhase::observe(pod));
                    tracked.ready = tracked.record.phase == PodPhase::Running && is_ready(pod);
                }
                None if tracked.seen => {
                    tracked.record.phase = tracked.record.phase.advance(PodPhase::Preempted);
                    tracked.ready = false;
                }
                None => {}
            }
        }
    }

    pub fn all_ready(&self) -> bool {
        self.pods.values().all(|tracked| tracked.ready)
    }

    /// First pod that reached a terminal phase.
    pub fn lost(&self) -> Option<&PodRecord> {
        self.pods
            .values()
            .map(|tracked| &tracked.record)
            .find(|record| record.phase.is_terminal())
    }

    pub fn records(&self) -> Vec<PodRecord> {
        self.pods.values().map(|tracked| tracked.record.clone()).collect()
    }
}
