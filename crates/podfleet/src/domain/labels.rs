//! Label and annotation keys placed on every object podfleet manages.

use std::collections::BTreeMap;

use crate::domain::cluster_spec::NodeRole;

pub const MANAGED_BY_LABEL: &str = "podfleet.dev/managed-by";
pub const MANAGED_BY_VALUE: &str = "podfleet";
/// Groups every object belonging to one cluster.
pub const CLUSTER_LABEL: &str = "podfleet.dev/cluster";
pub const NODE_ROLE_LABEL: &str = "podfleet.dev/node-role";
/// Carries the pod name; the head Service selects on it.
pub const COMPONENT_LABEL: &str = "podfleet.dev/component";
pub const JOB_LABEL: &str = "podfleet.dev/job";

/// Recognized by the queue's admission webhook.
pub const QUEUE_NAME_LABEL: &str = "kueue.x-k8s.io/queue-name";
pub const PRIORITY_CLASS_LABEL: &str = "kueue.x-k8s.io/priority-class";

pub const SPEC_HASH_ANNOTATION: &str = "podfleet.dev/spec-hash";
pub const ATTEMPT_ANNOTATION: &str = "podfleet.dev/attempt";

/// Ownership + grouping labels.
pub fn cluster_labels(cluster: &str) -> BTreeMap<String, String> {
    BTreeMap::from([
        (MANAGED_BY_LABEL.to_string(), MANAGED_BY_VALUE.to_string()),
        (CLUSTER_LABEL.to_string(), cluster.to_string()),
    ])
}

pub fn node_labels(cluster: &str, role: NodeRole, pod_name: &str) -> BTreeMap<String, String> {
    let mut labels = cluster_labels(cluster);
    labels.insert(NODE_ROLE_LABEL.to_string(), role.as_label().to_string());
    labels.insert(COMPONENT_LABEL.to_string(), pod_name.to_string());
    labels
}

pub fn cluster_selector(cluster: &str) -> String {
    format!("{MANAGED_BY_LABEL}={MANAGED_BY_VALUE},{CLUSTER_LABEL}={cluster}")
}

pub fn job_selector() -> String {
    format!("{MANAGED_BY_LABEL}={MANAGED_BY_VALUE},{JOB_LABEL}")
}
