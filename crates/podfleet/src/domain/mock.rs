//! In-memory [`ClusterApi`] for controller and scenario tests.
//!
//! Besides storing objects, the fake plays a tiny admission controller: pods
//! carrying a queue label stay `Pending` until [`FakeCluster::admit_cycle`]
//! admits them against a CPU quota, highest priority first, preempting lower
//! priority admitted pods when that makes room. It can also act as an
//! identity holding only a given set of RBAC rules.

use std::collections::BTreeMap;
use std::collections::BTreeSet;
use std::sync::Mutex;

use chrono::Utc;
use error_stack::Report;
use k8s_openapi::api::core::v1::Pod;
use k8s_openapi::api::core::v1::PodCondition;
use k8s_openapi::api::core::v1::PodStatus;
use k8s_openapi::api::rbac::v1::PolicyRule;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;

use super::cluster_api::ClusterApi;
use super::cluster_api::KubernetesError;
use super::cluster_api::QueueAdmissionRecord;
use super::labels::PRIORITY_CLASS_LABEL;
use super::labels::QUEUE_NAME_LABEL;
use super::objects::ManagedObject;
use super::objects::ObjectKey;
use super::objects::ObjectKind;
use super::render::RenderedCluster;

pub const LOW_PRIORITY: &str = "low-priority";
pub const HIGH_PRIORITY: &str = "high-priority";
pub const USER_QUEUE: &str = "user-queue";

const KUEUE_GROUP: &str = "kueue.x-k8s.io";

/// A rule held by the calling identity. A grant without a namespace applies
/// everywhere, like a ClusterRole bound through a ClusterRoleBinding.
#[derive(Debug, Clone)]
pub struct Grant {
    pub namespace: Option<String>,
    pub rule: PolicyRule,
}

impl Grant {
    fn allows(&self, verb: &str, group: &str, resource: &str, namespace: Option<&str>) -> bool {
        if let Some(granted) = &self.namespace {
            if namespace != Some(granted.as_str()) {
                return false;
            }
        }
        let matches = |values: &[String], wanted: &str| {
            values.iter().any(|value| value == "*" || value == wanted)
        };
        matches(&self.rule.verbs, verb)
            && self
                .rule
                .api_groups
                .as_deref()
                .is_some_and(|groups| matches(groups, group))
            && self
                .rule
                .resources
                .as_deref()
                .is_some_and(|resources| matches(resources, resource))
    }
}

/// Rules the service account of `rendered` ends up with once bootstrapped.
pub fn grants_of(rendered: &RenderedCluster) -> Vec<Grant> {
    let mut grants = Vec::new();
    for binding in &rendered.role_bindings {
        let namespace = binding.metadata.namespace.clone();
        let role = rendered.roles.iter().find(|role| {
            role.metadata.name.as_deref() == Some(binding.role_ref.name.as_str())
                && role.metadata.namespace == namespace
        });
        for rule in role.and_then(|role| role.rules.clone()).unwrap_or_default() {
            grants.push(Grant {
                namespace: namespace.clone(),
                rule,
            });
        }
    }
    if rendered.cluster_role.metadata.name.as_deref()
        == Some(rendered.cluster_role_binding.role_ref.name.as_str())
    {
        for rule in rendered.cluster_role.rules.clone().unwrap_or_default() {
            grants.push(Grant {
                namespace: None,
                rule,
            });
        }
    }
    grants
}

fn api_resource(kind: ObjectKind) -> (&'static str, &'static str) {
    match kind {
        ObjectKind::ServiceAccount => ("", "serviceaccounts"),
        ObjectKind::Role => ("rbac.authorization.k8s.io", "roles"),
        ObjectKind::RoleBinding => ("rbac.authorization.k8s.io", "rolebindings"),
        ObjectKind::ClusterRole => ("rbac.authorization.k8s.io", "clusterroles"),
        ObjectKind::ClusterRoleBinding => ("rbac.authorization.k8s.io", "clusterrolebindings"),
        ObjectKind::Service => ("", "services"),
        ObjectKind::Pod => ("", "pods"),
    }
}

struct FakeWorkload {
    record: QueueAdmissionRecord,
    priority: i32,
    cpus: f64,
    seq: u64,
}

#[derive(Default)]
struct State {
    objects: BTreeMap<ObjectKey, ManagedObject>,
    forbidden: BTreeSet<ObjectKind>,
    /// `None` means unrestricted.
    grants: Option<Vec<Grant>>,
    transient_creates: u32,
    hold_pending: bool,
    queues: BTreeSet<(String, String)>,
    priority_classes: BTreeMap<String, i32>,
    /// (namespace, pod name) -> workload
    workloads: BTreeMap<(String, String), FakeWorkload>,
    cpu_quota: f64,
    next_seq: u64,
    calls: Vec<String>,
}

pub struct FakeCluster {
    state: Mutex<State>,
}

impl FakeCluster {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(State::default()),
        }
    }

    /// A cluster with `user-queue` in `default`, the two priority classes and
    /// a 9 CPU quota.
    pub fn with_kueue() -> Self {
        Self::new()
            .with_queue("default", USER_QUEUE)
            .with_priority_class(LOW_PRIORITY, 100)
            .with_priority_class(HIGH_PRIORITY, 1000)
            .with_cpu_quota(9.0)
    }

    pub fn with_queue(self, namespace: &str, queue: &str) -> Self {
        self.state
            .lock()
            .unwrap()
            .queues
            .insert((namespace.to_string(), queue.to_string()));
        self
    }

    pub fn with_priority_class(self, name: &str, value: i32) -> Self {
        self.state
            .lock()
            .unwrap()
            .priority_classes
            .insert(name.to_string(), value);
        self
    }

    pub fn with_cpu_quota(self, cpus: f64) -> Self {
        self.state.lock().unwrap().cpu_quota = cpus;
        self
    }

    /// Creates and patches of `kind` fail with 403.
    pub fn forbid(&self, kind: ObjectKind) {
        self.state.lock().unwrap().forbidden.insert(kind);
    }

    /// From now on every call is checked against `grants` only.
    pub fn act_as(&self, grants: Vec<Grant>) {
        self.state.lock().unwrap().grants = Some(grants);
    }

    /// The next `count` create calls fail with a transient error.
    pub fn fail_next_creates(&self, count: u32) {
        self.state.lock().unwrap().transient_creates = count;
    }

    /// Pods without queue labels stay pending instead of becoming ready.
    pub fn hold_pending(&self) {
        self.state.lock().unwrap().hold_pending = true;
    }

    /// Number of recorded calls starting with `prefix`, e.g. `"create Pod"`.
    pub fn calls_matching(&self, prefix: &str) -> usize {
        self.state
            .lock()
            .unwrap()
            .calls
            .iter()
            .filter(|call| call.starts_with(prefix))
            .count()
    }

    pub fn object_count(&self, kind: ObjectKind) -> usize {
        self.state
            .lock()
            .unwrap()
            .objects
            .keys()
            .filter(|key| key.kind == kind)
            .count()
    }

    pub fn object(&self, key: &ObjectKey) -> Option<ManagedObject> {
        self.state.lock().unwrap().objects.get(key).cloned()
    }

    /// Store an object directly, bypassing call recording and failures.
    pub fn insert(&self, object: ManagedObject) {
        self.state
            .lock()
            .unwrap()
            .objects
            .insert(object.key(), object);
    }

    pub fn pods(&self, namespace: &str) -> Vec<Pod> {
        pods_in(&self.state.lock().unwrap(), namespace)
    }

    pub fn pod(&self, namespace: &str, name: &str) -> Option<Pod> {
        match self.object(&ObjectKey::pod(namespace, name)) {
            Some(ManagedObject::Pod(pod)) => Some(pod),
            _ => None,
        }
    }

    pub fn workload(&self, namespace: &str, pod: &str) -> Option<QueueAdmissionRecord> {
        self.state
            .lock()
            .unwrap()
            .workloads
            .get(&(namespace.to_string(), pod.to_string()))
            .map(|workload| workload.record.clone())
    }

    /// Names of queued, not yet admitted pods in admission order.
    pub fn pending_order(&self, namespace: &str) -> Vec<String> {
        let state = self.state.lock().unwrap();
        let mut pending: Vec<_> = state
            .workloads
            .iter()
            .filter(|((ns, _), workload)| ns == namespace && is_waiting(workload))
            .map(|(_, workload)| workload)
            .collect();
        pending.sort_by_key(|workload| (-workload.priority, workload.seq));
        pending
            .into_iter()
            .map(|workload| workload.record.pod_name.clone())
            .collect()
    }

    /// Deleted by someone other than the controllers; the workload goes too.
    pub fn remove_pod(&self, namespace: &str, name: &str) {
        let mut state = self.state.lock().unwrap();
        state.objects.remove(&ObjectKey::pod(namespace, name));
        state
            .workloads
            .remove(&(namespace.to_string(), name.to_string()));
    }

    /// Evicted to make room: the pod fails with a disruption condition and is
    /// marked for deletion, but stays listed until [`FakeCluster::remove_pod`].
    /// Its workload records the preemption.
    pub fn evict_pod(&self, namespace: &str, name: &str) {
        let mut state = self.state.lock().unwrap();
        if let Some(ManagedObject::Pod(pod)) = state.objects.get_mut(&ObjectKey::pod(namespace, name))
        {
            pod.metadata.deletion_timestamp = Some(Time(Utc::now()));
            pod.status = Some(PodStatus {
                phase: Some("Failed".to_string()),
                conditions: Some(vec![PodCondition {
                    type_: "DisruptionTarget".to_string(),
                    status: "True".to_string(),
                    reason: Some("PreemptionByScheduler".to_string()),
                    ..Default::default()
                }]),
                ..Default::default()
            });
        }
        if let Some(workload) = state
            .workloads
            .get_mut(&(namespace.to_string(), name.to_string()))
        {
            workload.record.admitted = false;
            workload.record.preempted = true;
        }
    }

    /// Edit the queue's record of a pod in place.
    pub fn update_workload(
        &self,
        namespace: &str,
        pod: &str,
        update: impl FnOnce(&mut QueueAdmissionRecord),
    ) {
        if let Some(workload) = self
            .state
            .lock()
            .unwrap()
            .workloads
            .get_mut(&(namespace.to_string(), pod.to_string()))
        {
            update(&mut workload.record);
        }
    }

    /// Let the workload of a pod finish and release its quota.
    pub fn complete_pod(&self, namespace: &str, name: &str, succeeded: bool) {
        let mut state = self.state.lock().unwrap();
        if let Some(ManagedObject::Pod(pod)) = state.objects.get_mut(&ObjectKey::pod(namespace, name))
        {
            pod.status = Some(PodStatus {
                phase: Some(if succeeded { "Succeeded" } else { "Failed" }.to_string()),
                ..Default::default()
            });
        }
        if let Some(workload) = state
            .workloads
            .get_mut(&(namespace.to_string(), name.to_string()))
        {
            workload.record.finished = true;
        }
    }

    /// Run one admission pass over every queued workload.
    pub fn admit_cycle(&self) {
        let mut state = self.state.lock().unwrap();

        let mut waiting: Vec<(String, String)> = state
            .workloads
            .iter()
            .filter(|(_, workload)| is_waiting(workload))
            .map(|(key, _)| key.clone())
            .collect();
        waiting.sort_by_key(|key| {
            let workload = &state.workloads[key];
            (-workload.priority, workload.seq)
        });

        for key in waiting {
            let (cpus, priority) = {
                let workload = &state.workloads[&key];
                (workload.cpus, workload.priority)
            };

            if used_cpus(&state) + cpus > state.cpu_quota {
                let mut victims: Vec<(String, String)> = state
                    .workloads
                    .iter()
                    .filter(|(_, w)| is_running(w) && w.priority < priority)
                    .map(|(key, _)| key.clone())
                    .collect();
                victims.sort_by_key(|key| {
                    let workload = &state.workloads[key];
                    (workload.priority, std::cmp::Reverse(workload.seq))
                });

                let mut freed = 0.0;
                let mut chosen = Vec::new();
                for victim in victims {
                    if used_cpus(&state) - freed + cpus <= state.cpu_quota {
                        break;
                    }
                    freed += state.workloads[&victim].cpus;
                    chosen.push(victim);
                }
                if used_cpus(&state) - freed + cpus > state.cpu_quota {
                    continue;
                }
                for (namespace, pod) in chosen {
                    state.objects.remove(&ObjectKey::pod(&namespace, &pod));
                    if let Some(workload) = state.workloads.get_mut(&(namespace, pod)) {
                        workload.record.admitted = false;
                        workload.record.preempted = true;
                    }
                }
            }

            if let Some(workload) = state.workloads.get_mut(&key) {
                workload.record.admitted = true;
                workload.record.admitted_at = Some(Utc::now());
                workload.record.flavor = Some("default-flavor".to_string());
            }
            if let Some(ManagedObject::Pod(pod)) = state.objects.get_mut(&ObjectKey::pod(&key.0, &key.1)) {
                pod.status = Some(ready_status());
            }
        }
    }
}

impl Default for FakeCluster {
    fn default() -> Self {
        Self::new()
    }
}

fn is_waiting(workload: &FakeWorkload) -> bool {
    !workload.record.admitted && !workload.record.preempted && !workload.record.finished
}

fn is_running(workload: &FakeWorkload) -> bool {
    workload.record.admitted && !workload.record.finished
}

fn used_cpus(state: &State) -> f64 {
    state
        .workloads
        .values()
        .filter(|workload| is_running(workload))
        .map(|workload| workload.cpus)
        .sum()
}

fn ready_status() -> PodStatus {
    PodStatus {
        phase: Some("Running".to_string()),
        conditions: Some(vec![PodCondition {
            type_: "Ready".to_string(),
            status: "True".to_string(),
            ..Default::default()
        }]),
        ..Default::default()
    }
}

fn pending_status() -> PodStatus {
    PodStatus {
        phase: Some("Pending".to_string()),
        ..Default::default()
    }
}

fn pod_cpus(pod: &Pod) -> f64 {
    pod.spec
        .iter()
        .flat_map(|spec| spec.containers.iter())
        .filter_map(|container| container.resources.as_ref()?.requests.as_ref()?.get("cpu"))
        .filter_map(|quantity| quantity.0.parse::<f64>().ok())
        .sum()
}

fn pods_in(state: &State, namespace: &str) -> Vec<Pod> {
    state
        .objects
        .values()
        .filter_map(|object| match object {
            ManagedObject::Pod(pod) if pod.metadata.namespace.as_deref() == Some(namespace) => {
                Some(pod.clone())
            }
            _ => None,
        })
        .collect()
}

/// Supports `key=value` and bare `key` terms joined by commas.
fn matches_selector(pod: &Pod, selector: &str) -> bool {
    let labels = pod.metadata.labels.clone().unwrap_or_default();
    selector
        .split(',')
        .filter(|term| !term.is_empty())
        .all(|term| match term.split_once('=') {
            Some((key, value)) => labels.get(key).map(String::as_str) == Some(value),
            None => labels.contains_key(term),
        })
}

fn forbidden(key: &ObjectKey) -> Report<KubernetesError> {
    Report::new(KubernetesError::Forbidden {
        object: key.to_string(),
        message: "the fake identity lacks this verb".to_string(),
    })
}

fn authorize(
    state: &State,
    verb: &str,
    (group, resource): (&str, &str),
    namespace: Option<&str>,
    object: &str,
) -> Result<(), Report<KubernetesError>> {
    let Some(grants) = &state.grants else {
        return Ok(());
    };
    if grants
        .iter()
        .any(|grant| grant.allows(verb, group, resource, namespace))
    {
        return Ok(());
    }
    Err(Report::new(KubernetesError::Forbidden {
        object: object.to_string(),
        message: format!("cannot {verb} resource \"{resource}\" in API group \"{group}\""),
    }))
}

fn authorize_key(state: &State, verb: &str, key: &ObjectKey) -> Result<(), Report<KubernetesError>> {
    authorize(
        state,
        verb,
        api_resource(key.kind),
        key.namespace.as_deref(),
        &key.to_string(),
    )
}

#[async_trait::async_trait]
impl ClusterApi for FakeCluster {
    async fn get_object(
        &self,
        key: &ObjectKey,
    ) -> Result<Option<ManagedObject>, Report<KubernetesError>> {
        let mut state = self.state.lock().unwrap();
        state.calls.push(format!("get {key}"));
        authorize_key(&state, "get", key)?;
        Ok(state.objects.get(key).cloned())
    }

    async fn create_object(&self, object: &ManagedObject) -> Result<(), Report<KubernetesError>> {
        let mut state = self.state.lock().unwrap();
        let key = object.key();
        state.calls.push(format!("create {key}"));
        authorize_key(&state, "create", &key)?;

        if state.forbidden.contains(&key.kind) {
            return Err(forbidden(&key));
        }
        if state.transient_creates > 0 {
            state.transient_creates -= 1;
            return Err(Report::new(KubernetesError::Transient {
                object: key.to_string(),
                message: "too many requests".to_string(),
            }));
        }
        if state.objects.contains_key(&key) {
            return Err(Report::new(KubernetesError::AlreadyExists {
                object: key.to_string(),
            }));
        }

        let mut object = object.clone();
        if let ManagedObject::Pod(pod) = &mut object {
            let labels = pod.metadata.labels.clone().unwrap_or_default();
            match labels.get(QUEUE_NAME_LABEL) {
                Some(queue) => {
                    let namespace = key.namespace.clone().unwrap_or_default();
                    let priority_class = labels.get(PRIORITY_CLASS_LABEL).cloned();
                    let priority = priority_class
                        .as_ref()
                        .and_then(|class| state.priority_classes.get(class).copied())
                        .unwrap_or_default();
                    let seq = state.next_seq;
                    state.next_seq += 1;
                    state.workloads.insert(
                        (namespace, key.name.clone()),
                        FakeWorkload {
                            record: QueueAdmissionRecord {
                                workload: format!("pod-{}", key.name),
                                pod_name: key.name.clone(),
                                queue_name: Some(queue.clone()),
                                priority_class,
                                admitted: false,
                                admitted_at: None,
                                flavor: None,
                                finished: false,
                                preempted: false,
                            },
                            priority,
                            cpus: pod_cpus(pod),
                            seq,
                        },
                    );
                    pod.status = Some(pending_status());
                }
                None if state.hold_pending => pod.status = Some(pending_status()),
                None => pod.status = Some(ready_status()),
            }
        }
        state.objects.insert(key, object);
        Ok(())
    }

    async fn patch_object(&self, object: &ManagedObject) -> Result<(), Report<KubernetesError>> {
        let mut state = self.state.lock().unwrap();
        let key = object.key();
        state.calls.push(format!("patch {key}"));
        authorize_key(&state, "patch", &key)?;
        if state.forbidden.contains(&key.kind) {
            return Err(forbidden(&key));
        }
        state.objects.insert(key, object.clone());
        Ok(())
    }

    async fn delete_object(&self, key: &ObjectKey) -> Result<(), Report<KubernetesError>> {
        let mut state = self.state.lock().unwrap();
        state.calls.push(format!("delete {key}"));
        authorize_key(&state, "delete", key)?;
        state.objects.remove(key);
        if key.kind == ObjectKind::Pod {
            let namespace = key.namespace.clone().unwrap_or_default();
            state.workloads.remove(&(namespace, key.name.clone()));
        }
        Ok(())
    }

    async fn list_pods(
        &self,
        namespace: &str,
        label_selector: &str,
    ) -> Result<Vec<Pod>, Report<KubernetesError>> {
        let mut state = self.state.lock().unwrap();
        state.calls.push(format!("list Pod {namespace}"));
        authorize(&state, "list", ("", "pods"), Some(namespace), "pods")?;
        Ok(pods_in(&state, namespace)
            .into_iter()
            .filter(|pod| matches_selector(pod, label_selector))
            .collect())
    }

    async fn find_workload(
        &self,
        namespace: &str,
        pod_name: &str,
    ) -> Result<Option<QueueAdmissionRecord>, Report<KubernetesError>> {
        authorize(
            &self.state.lock().unwrap(),
            "list",
            (KUEUE_GROUP, "workloads"),
            Some(namespace),
            "workloads",
        )?;
        Ok(self.workload(namespace, pod_name))
    }

    async fn local_queue_exists(
        &self,
        namespace: &str,
        queue: &str,
    ) -> Result<bool, Report<KubernetesError>> {
        let state = self.state.lock().unwrap();
        authorize(&state, "get", (KUEUE_GROUP, "localqueues"), Some(namespace), queue)?;
        Ok(state
            .queues
            .contains(&(namespace.to_string(), queue.to_string())))
    }

    async fn priority_class_exists(&self, name: &str) -> Result<bool, Report<KubernetesError>> {
        let state = self.state.lock().unwrap();
        authorize(&state, "get", (KUEUE_GROUP, "workloadpriorityclasses"), None, name)?;
        Ok(state.priority_classes.contains_key(name))
    }
}
