//! Turns a [`ClusterSpec`] into the Kubernetes objects that realize it.
//!
//! Rendering is a pure function: the same spec always yields the same
//! objects, and every optional security control (FUSE capability, device
//! request, tolerations) is either rendered completely or rejected with a
//! [`ValidationError`].

use std::collections::BTreeMap;

use error_stack::Report;
use k8s_openapi::api::core::v1::Affinity;
use k8s_openapi::api::core::v1::Capabilities;
use k8s_openapi::api::core::v1::Container;
use k8s_openapi::api::core::v1::ContainerPort;
use k8s_openapi::api::core::v1::EmptyDirVolumeSource;
use k8s_openapi::api::core::v1::EnvVar;
use k8s_openapi::api::core::v1::EnvVarSource;
use k8s_openapi::api::core::v1::ExecAction;
use k8s_openapi::api::core::v1::ObjectFieldSelector;
use k8s_openapi::api::core::v1::Pod;
use k8s_openapi::api::core::v1::PodAffinityTerm;
use k8s_openapi::api::core::v1::PodAntiAffinity;
use k8s_openapi::api::core::v1::PodSpec;
use k8s_openapi::api::core::v1::Probe;
use k8s_openapi::api::core::v1::ResourceRequirements;
use k8s_openapi::api::core::v1::SecurityContext;
use k8s_openapi::api::core::v1::Service;
use k8s_openapi::api::core::v1::ServicePort;
use k8s_openapi::api::core::v1::ServiceAccount;
use k8s_openapi::api::core::v1::ServiceSpec;
use k8s_openapi::api::core::v1::Toleration;
use k8s_openapi::api::core::v1::Volume;
use k8s_openapi::api::core::v1::VolumeMount;
use k8s_openapi::api::core::v1::WeightedPodAffinityTerm;
use k8s_openapi::api::rbac::v1::ClusterRole;
use k8s_openapi::api::rbac::v1::ClusterRoleBinding;
use k8s_openapi::api::rbac::v1::PolicyRule;
use k8s_openapi::api::rbac::v1::Role;
use k8s_openapi::api::rbac::v1::RoleBinding;
use k8s_openapi::api::rbac::v1::RoleRef;
use k8s_openapi::api::rbac::v1::Subject;
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelector;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;

use crate::domain::cluster_spec::head_pod_name;
use crate::domain::cluster_spec::worker_pod_name;
use crate::domain::cluster_spec::ClusterSpec;
use crate::domain::cluster_spec::NetworkingMode;
use crate::domain::cluster_spec::NodeResources;
use crate::domain::cluster_spec::NodeRole;
use crate::domain::error::ValidationError;
use crate::domain::labels;
use crate::domain::objects::ManagedObject;

const RBAC_API_GROUP: &str = "rbac.authorization.k8s.io";
const KUEUE_API_GROUP: &str = "kueue.x-k8s.io";
const RUNTIME_PORT_NAME: &str = "runtime";
const SETUP_LOG: &str = "/tmp/podfleet/setup.log";
const CONTAINER_NAME: &str = "podfleet";
const SHM_VOLUME: &str = "dshm";

/// Marker written by the keepalive monitor once it runs.
pub const READY_MARKER: &str = "/tmp/podfleet/keepalive.ready";
/// Task logs the keepalive monitor watches, relative to `$HOME`.
pub const TASK_LOG_PATTERN: &str = "podfleet_logs/*/tasks/*.log";

/// Every object needed to bring up one cluster.
#[derive(Debug, Clone, PartialEq)]
pub struct RenderedCluster {
    pub cluster_name: String,
    pub namespace: String,
    pub service_account: ServiceAccount,
    pub roles: Vec<Role>,
    pub role_bindings: Vec<RoleBinding>,
    pub cluster_role: ClusterRole,
    pub cluster_role_binding: ClusterRoleBinding,
    pub head_service: Service,
    pub head_template: Pod,
    pub worker_template: Pod,
    pub worker_count: u32,
}

impl RenderedCluster {
    /// Account, roles and bindings in creation order (subjects before bindings).
    pub fn rbac_objects(&self) -> Vec<ManagedObject> {
        let mut objects = vec![ManagedObject::ServiceAccount(self.service_account.clone())];
        objects.extend(self.roles.iter().cloned().map(ManagedObject::Role));
        objects.extend(self.role_bindings.iter().cloned().map(ManagedObject::RoleBinding));
        objects.push(ManagedObject::ClusterRole(self.cluster_role.clone()));
        objects.push(ManagedObject::ClusterRoleBinding(
            self.cluster_role_binding.clone(),
        ));
        objects
    }

    /// Concrete pods: the head followed by `worker_count` workers.
    pub fn pods(&self) -> Vec<(NodeRole, Pod)> {
        let mut pods = vec![(
            NodeRole::Head,
            instantiate(
                &self.head_template,
                &self.cluster_name,
                NodeRole::Head,
                &head_pod_name(&self.cluster_name),
            ),
        )];
        pods.extend((1..=self.worker_count).map(|index| {
            (
                NodeRole::Worker,
                instantiate(
                    &self.worker_template,
                    &self.cluster_name,
                    NodeRole::Worker,
                    &worker_pod_name(&self.cluster_name, index),
                ),
            )
        }));
        pods
    }
}

/// Render all objects for a cluster.
///
/// # Errors
///
/// - [`ValidationError::UnknownResourceFlavor`] if accelerators reference an undeclared flavor
/// - [`ValidationError::FuseDeviceManagerMissing`] if FUSE is required without a device manager
pub fn render(spec: &ClusterSpec) -> Result<RenderedCluster, Report<ValidationError>> {
    let pod_settings = PodSettings::resolve(spec)?;

    let rbac = RbacNames::new(spec);
    let head_name = head_pod_name(&spec.name);

    Ok(RenderedCluster {
        cluster_name: spec.name.clone(),
        namespace: spec.namespace.clone(),
        service_account: ServiceAccount {
            metadata: metadata(spec, &spec.service_account, Some(&spec.namespace)),
            ..Default::default()
        },
        roles: vec![
            Role {
                metadata: metadata(spec, &rbac.namespace_role, Some(&spec.namespace)),
                rules: Some(vec![rule(&["*"], &["*"], &["*"])]),
            },
            Role {
                metadata: metadata(
                    spec,
                    &rbac.system_role,
                    Some(&spec.integrations.system_namespace),
                ),
                rules: Some(vec![
                    rule(
                        &["", "apps"],
                        &["pods", "configmaps", "services", "daemonsets"],
                        &["create", "get", "list", "patch", "watch"],
                    ),
                    // a launch from inside a pod checks these before reusing them
                    rule(&[RBAC_API_GROUP], &["roles", "rolebindings"], &["get"]),
                ]),
            },
            Role {
                metadata: metadata(
                    spec,
                    &rbac.ingress_role,
                    Some(&spec.integrations.ingress_namespace),
                ),
                rules: Some(vec![
                    rule(&[""], &["services"], &["get", "list", "watch", "patch"]),
                    rule(&[RBAC_API_GROUP], &["roles", "rolebindings"], &["get"]),
                ]),
            },
        ],
        role_bindings: vec![
            role_binding(spec, &rbac.namespace_role, &spec.namespace),
            role_binding(spec, &rbac.system_role, &spec.integrations.system_namespace),
            role_binding(spec, &rbac.ingress_role, &spec.integrations.ingress_namespace),
        ],
        cluster_role: ClusterRole {
            metadata: metadata(spec, &rbac.cluster_role, None),
            rules: Some(vec![
                rule(&[""], &["nodes"], &["get", "list", "watch"]),
                rule(&["node.k8s.io"], &["runtimeclasses"], &["get", "list", "watch"]),
                rule(
                    &[RBAC_API_GROUP],
                    &["clusterroles", "clusterrolebindings"],
                    &["get"],
                ),
                rule(&[KUEUE_API_GROUP], &["workloadpriorityclasses"], &["get", "list"]),
            ]),
            aggregation_rule: None,
        },
        cluster_role_binding: ClusterRoleBinding {
            metadata: metadata(spec, &format!("{}-binding", rbac.cluster_role), None),
            role_ref: RoleRef {
                api_group: RBAC_API_GROUP.to_string(),
                kind: "ClusterRole".to_string(),
                name: rbac.cluster_role.clone(),
            },
            subjects: Some(vec![service_account_subject(spec)]),
        },
        head_service: head_service(spec, &head_name),
        head_template: pod_template(spec, NodeRole::Head, &pod_settings),
        worker_template: pod_template(spec, NodeRole::Worker, &pod_settings),
        worker_count: spec.worker_count(),
    })
}

struct RbacNames {
    namespace_role: String,
    system_role: String,
    ingress_role: String,
    cluster_role: String,
}

impl RbacNames {
    fn new(spec: &ClusterSpec) -> Self {
        let account = &spec.service_account;
        Self {
            namespace_role: format!("{account}-role"),
            system_role: format!("{account}-system-role"),
            ingress_role: format!("{account}-ingress-role"),
            // cluster scoped, so the namespace keeps accounts of different namespaces apart
            cluster_role: format!("{}-{account}-cluster-role", spec.namespace),
        }
    }
}

/// Scheduling and device settings derived (and validated) once per render.
struct PodSettings {
    node_selector: BTreeMap<String, String>,
    tolerations: Vec<Toleration>,
    accelerator_resource: Option<(String, u32)>,
    fuse_resource: Option<String>,
}

impl PodSettings {
    fn resolve(spec: &ClusterSpec) -> Result<Self, Report<ValidationError>> {
        let mut node_selector = BTreeMap::new();
        let mut tolerations = Vec::new();

        let accelerator_resource = match spec.accelerator_flavor()? {
            Some((request, flavor)) => {
                node_selector.insert(flavor.selector_key.clone(), flavor.selector_value.clone());
                tolerations.push(Toleration {
                    key: Some(flavor.resource_name.clone()),
                    operator: Some("Exists".to_string()),
                    effect: Some("NoSchedule".to_string()),
                    ..Default::default()
                });
                Some((flavor.resource_name.clone(), request.count))
            }
            None => None,
        };

        if let Some(spot) = &spec.spot {
            node_selector.insert(spot.selector_key.clone(), spot.selector_value.clone());
            tolerations.push(Toleration {
                key: Some(spot.selector_key.clone()),
                operator: Some("Equal".to_string()),
                value: Some(spot.selector_value.clone()),
                effect: Some(spot.toleration_effect.as_str().to_string()),
                ..Default::default()
            });
        }

        let fuse_resource = spec
            .fuse_device_manager()?
            .map(|manager| manager.resource_name.clone());

        Ok(Self {
            node_selector,
            tolerations,
            accelerator_resource,
            fuse_resource,
        })
    }
}

fn metadata(spec: &ClusterSpec, name: &str, namespace: Option<&str>) -> ObjectMeta {
    ObjectMeta {
        name: Some(name.to_string()),
        namespace: namespace.map(str::to_string),
        labels: Some(labels::cluster_labels(&spec.name)),
        ..Default::default()
    }
}

fn rule(api_groups: &[&str], resources: &[&str], verbs: &[&str]) -> PolicyRule {
    let owned = |values: &[&str]| values.iter().map(|v| v.to_string()).collect::<Vec<_>>();
    PolicyRule {
        api_groups: Some(owned(api_groups)),
        resources: Some(owned(resources)),
        verbs: owned(verbs),
        ..Default::default()
    }
}

fn service_account_subject(spec: &ClusterSpec) -> Subject {
    Subject {
        kind: "ServiceAccount".to_string(),
        name: spec.service_account.clone(),
        namespace: Some(spec.namespace.clone()),
        api_group: None,
    }
}

fn role_binding(spec: &ClusterSpec, role: &str, namespace: &str) -> RoleBinding {
    RoleBinding {
        metadata: metadata(spec, &format!("{role}-binding"), Some(namespace)),
        role_ref: RoleRef {
            api_group: RBAC_API_GROUP.to_string(),
            kind: "Role".to_string(),
            name: role.to_string(),
        },
        subjects: Some(vec![service_account_subject(spec)]),
    }
}

fn head_service(spec: &ClusterSpec, head_name: &str) -> Service {
    let service_type = match spec.networking {
        NetworkingMode::PortForward => "ClusterIP",
        NetworkingMode::Direct => "NodePort",
    };
    Service {
        metadata: metadata(spec, head_name, Some(&spec.namespace)),
        spec: Some(ServiceSpec {
            type_: Some(service_type.to_string()),
            selector: Some(BTreeMap::from([(
                labels::COMPONENT_LABEL.to_string(),
                head_name.to_string(),
            )])),
            ports: Some(
                head_ports(spec)
                    .into_iter()
                    .map(|(name, port)| ServicePort {
                        name: Some(name),
                        port: i32::from(port),
                        target_port: Some(IntOrString::Int(i32::from(port))),
                        protocol: Some("TCP".to_string()),
                        ..Default::default()
                    })
                    .collect(),
            ),
            ..Default::default()
        }),
        status: None,
    }
}

fn resource_block(
    resources: &NodeResources,
    settings: &PodSettings,
) -> ResourceRequirements {
    let mut amounts = BTreeMap::from([
        ("cpu".to_string(), Quantity(format_amount(resources.cpus))),
        (
            "memory".to_string(),
            Quantity(format!("{}G", format_amount(resources.memory_gb))),
        ),
    ]);
    if let Some((resource, count)) = &settings.accelerator_resource {
        amounts.insert(resource.clone(), Quantity(count.to_string()));
    }
    if let Some(resource) = &settings.fuse_resource {
        amounts.insert(resource.clone(), Quantity("1".to_string()));
    }
    ResourceRequirements {
        requests: Some(amounts.clone()),
        limits: Some(amounts),
        ..Default::default()
    }
}

fn format_amount(value: f64) -> String {
    if value.fract() == 0.0 {
        format!("{}", value as u64)
    } else {
        format!("{value}")
    }
}

/// Ports the head Service exposes: the configured head ports plus the
/// runtime port workers join on.
fn head_ports(spec: &ClusterSpec) -> Vec<(String, u16)> {
    let mut ports: Vec<_> = spec
        .head_ports
        .iter()
        .map(|port| (port.name.clone(), port.port))
        .collect();
    let runtime = &spec.runtime;
    if runtime.enabled() && !ports.iter().any(|(_, port)| *port == runtime.port) {
        ports.push((RUNTIME_PORT_NAME.to_string(), runtime.port));
    }
    ports
}

/// DNS name of the head Service inside the cluster network.
fn head_address(spec: &ClusterSpec) -> String {
    format!("{}.{}.svc", spec.head_pod_name(), spec.namespace)
}

/// Container entrypoint. sshd and the keepalive monitor must be up before the
/// readiness probe passes. Package installation and the runtime start run
/// detached and never delay readiness; each step is retried with a growing
/// pause. Workers wait until the head Service resolves before joining.
fn startup_script(spec: &ClusterSpec, role: NodeRole) -> String {
    let runtime = &spec.runtime;
    let mut steps = Vec::new();
    if !spec.setup_packages.is_empty() {
        steps.push("export DEBIAN_FRONTEND=noninteractive".to_string());
        steps.push("retry apt-get update".to_string());
        steps.push(format!(
            "retry apt-get install -y {}",
            spec.setup_packages.join(" ")
        ));
    }
    if runtime.enabled() {
        match role {
            NodeRole::Head => steps.push(format!(
                "retry {} --head --port={}",
                runtime.command.trim(),
                runtime.port
            )),
            NodeRole::Worker => {
                let address = head_address(spec);
                steps.push(format!(
                    "until getent hosts {address} > /dev/null; do sleep 2; done"
                ));
                steps.push(format!(
                    "retry {} --address={address}:{}",
                    runtime.command.trim(),
                    runtime.port
                ));
            }
        }
    }

    let mut script = String::from("set -e\nmkdir -p /tmp/podfleet /run/sshd\n/usr/sbin/sshd\n");
    if !steps.is_empty() {
        script.push_str(&format!(
            "retry() {{ n=1; until \"$@\"; do [ \"$n\" -ge {} ] && return 1; sleep $((n * 2)); n=$((n + 1)); done; }}\n",
            runtime.attempts
        ));
        script.push_str("(\n");
        for step in steps {
            script.push_str(&step);
            script.push('\n');
        }
        script.push_str(&format!(") > {SETUP_LOG} 2>&1 &\n"));
    }
    script.push_str(&format!(
        "exec podfleet keepalive --log-pattern \"$HOME/{TASK_LOG_PATTERN}\" --ready-file {READY_MARKER}\n"
    ));
    script
}

fn pod_template(spec: &ClusterSpec, role: NodeRole, settings: &PodSettings) -> Pod {
    let mut ports = vec![ContainerPort {
        name: Some("ssh".to_string()),
        container_port: 22,
        ..Default::default()
    }];
    if role == NodeRole::Head {
        ports.extend(
            head_ports(spec)
                .into_iter()
                .filter(|(_, port)| *port != 22)
                .map(|(name, port)| ContainerPort {
                    name: Some(name),
                    container_port: i32::from(port),
                    ..Default::default()
                }),
        );
    }

    let security_context = settings.fuse_resource.as_ref().map(|_| SecurityContext {
        capabilities: Some(Capabilities {
            add: Some(vec!["SYS_ADMIN".to_string()]),
            drop: None,
        }),
        ..Default::default()
    });

    let mut labels = labels::cluster_labels(&spec.name);
    labels.insert(labels::NODE_ROLE_LABEL.to_string(), role.as_label().to_string());
    if let Some(queue) = &spec.queue {
        labels.insert(labels::QUEUE_NAME_LABEL.to_string(), queue.queue_name.clone());
        labels.insert(
            labels::PRIORITY_CLASS_LABEL.to_string(),
            queue.priority_class.clone(),
        );
    }

    let container = Container {
        name: CONTAINER_NAME.to_string(),
        image: Some(spec.image.clone()),
        image_pull_policy: Some("IfNotPresent".to_string()),
        command: Some(vec![
            "/bin/bash".to_string(),
            "-c".to_string(),
            startup_script(spec, role),
        ]),
        ports: Some(ports),
        env: Some(vec![
            EnvVar {
                name: "PODFLEET_CLUSTER".to_string(),
                value: Some(spec.name.clone()),
                value_from: None,
            },
            EnvVar {
                name: "PODFLEET_NODE_ROLE".to_string(),
                value: Some(role.as_label().to_string()),
                value_from: None,
            },
            EnvVar {
                name: "POD_NAME".to_string(),
                value: None,
                value_from: Some(EnvVarSource {
                    field_ref: Some(ObjectFieldSelector {
                        field_path: "metadata.name".to_string(),
                        api_version: None,
                    }),
                    ..Default::default()
                }),
            },
        ]),
        resources: Some(resource_block(&spec.resources, settings)),
        volume_mounts: Some(vec![VolumeMount {
            name: SHM_VOLUME.to_string(),
            mount_path: "/dev/shm".to_string(),
            ..Default::default()
        }]),
        security_context,
        readiness_probe: Some(Probe {
            exec: Some(ExecAction {
                command: Some(vec![
                    "/bin/sh".to_string(),
                    "-c".to_string(),
                    format!("test -f {READY_MARKER} && pgrep -x sshd > /dev/null"),
                ]),
            }),
            initial_delay_seconds: Some(1),
            period_seconds: Some(2),
            ..Default::default()
        }),
        ..Default::default()
    };

    let mut pod = Pod {
        metadata: ObjectMeta {
            namespace: Some(spec.namespace.clone()),
            labels: Some(labels),
            ..Default::default()
        },
        spec: Some(PodSpec {
            service_account_name: Some(spec.service_account.clone()),
            restart_policy: Some("Never".to_string()),
            containers: vec![container],
            volumes: Some(vec![Volume {
                name: SHM_VOLUME.to_string(),
                empty_dir: Some(EmptyDirVolumeSource {
                    medium: Some("Memory".to_string()),
                    size_limit: None,
                }),
                ..Default::default()
            }]),
            node_selector: (!settings.node_selector.is_empty())
                .then(|| settings.node_selector.clone()),
            tolerations: (!settings.tolerations.is_empty()).then(|| settings.tolerations.clone()),
            affinity: Some(spread_affinity(&spec.name)),
            ..Default::default()
        }),
        status: None,
    };

    let hash = spec_hash(&pod);
    pod.metadata.annotations = Some(BTreeMap::from([(
        labels::SPEC_HASH_ANNOTATION.to_string(),
        hash,
    )]));
    pod
}

fn spread_affinity(cluster: &str) -> Affinity {
    Affinity {
        pod_anti_affinity: Some(PodAntiAffinity {
            preferred_during_scheduling_ignored_during_execution: Some(vec![
                WeightedPodAffinityTerm {
                    weight: 100,
                    pod_affinity_term: PodAffinityTerm {
                        label_selector: Some(LabelSelector {
                            match_labels: Some(BTreeMap::from([(
                                labels::CLUSTER_LABEL.to_string(),
                                cluster.to_string(),
                            )])),
                            match_expressions: None,
                        }),
                        topology_key: "kubernetes.io/hostname".to_string(),
                        ..Default::default()
                    },
                },
            ]),
            required_during_scheduling_ignored_during_execution: None,
        }),
        ..Default::default()
    }
}

fn instantiate(template: &Pod, cluster: &str, role: NodeRole, name: &str) -> Pod {
    let mut pod = template.clone();
    pod.metadata.name = Some(name.to_string());
    pod.metadata
        .labels
        .get_or_insert_with(BTreeMap::new)
        .extend(labels::node_labels(cluster, role, name));
    pod
}

/// FNV-1a over the serialized pod spec, stable across runs.
fn spec_hash(pod: &Pod) -> String {
    const OFFSET: u64 = 0xcbf2_9ce4_8422_2325;
    const PRIME: u64 = 0x0000_0100_0000_01b3;

    let bytes = serde_json::to_vec(&pod.spec).unwrap_or_default();
    let hash = bytes
        .iter()
        .fold(OFFSET, |hash, byte| (hash ^ u64::from(*byte)).wrapping_mul(PRIME));
    format!("{hash:016x}")
}
