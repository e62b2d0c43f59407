//! Validated, immutable description of a cluster to provision.
//!
//! A [`ClusterSpec`] can only be obtained through [`ClusterSpec::from_config`],
//! which checks every field of the user supplied [`ClusterConfig`]. Checks that
//! depend on the declared integrations (resource flavors, FUSE device manager)
//! are repeated by the renderer so that no security control is ever dropped
//! silently.

use std::time::Duration;

use error_stack::Report;
use serde::Deserialize;
use serde::Serialize;

use crate::config::ClusterConfig;
use crate::domain::error::ValidationError;

/// Pod names get a `-head` / `-workerN` suffix, keep room for it.
const MAX_CLUSTER_NAME_LEN: usize = 50;

pub const DEFAULT_SERVICE_ACCOUNT: &str = "podfleet-service-account";
pub const DEFAULT_SYSTEM_NAMESPACE: &str = "podfleet-system";
pub const DEFAULT_INGRESS_NAMESPACE: &str = "ingress-nginx";
pub const DEFAULT_FUSE_RESOURCE: &str = "smarter-devices/fuse";
pub const DEFAULT_RUNTIME_COMMAND: &str = "ray start --disable-usage-stats";
pub const DEFAULT_RUNTIME_PORT: u16 = 6379;

/// Role of a pod inside a cluster. Every cluster has exactly one head.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, derive_more::Display)]
pub enum NodeRole {
    #[display("head")]
    Head,
    #[display("worker")]
    Worker,
}

impl NodeRole {
    pub fn as_label(self) -> &'static str {
        match self {
            NodeRole::Head => "head",
            NodeRole::Worker => "worker",
        }
    }

    pub fn from_label(value: &str) -> Option<Self> {
        match value {
            "head" => Some(NodeRole::Head),
            "worker" => Some(NodeRole::Worker),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NetworkingMode {
    /// Head ports are reached through `kubectl port-forward` (ClusterIP service).
    #[default]
    #[serde(alias = "portforward", rename = "port-forward")]
    PortForward,
    /// Head ports are exposed on every node (NodePort service).
    #[serde(alias = "nodeport")]
    Direct,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum TaintEffect {
    #[default]
    NoSchedule,
    PreferNoSchedule,
    NoExecute,
}

impl TaintEffect {
    pub fn as_str(self) -> &'static str {
        match self {
            TaintEffect::NoSchedule => "NoSchedule",
            TaintEffect::PreferNoSchedule => "PreferNoSchedule",
            TaintEffect::NoExecute => "NoExecute",
        }
    }
}

/// How long provisioning may take. `-1` in configuration means unbounded,
/// which is what queued clusters need since admission may take arbitrarily long.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProvisionTimeout {
    Bounded(Duration),
    Unbounded,
}

impl ProvisionTimeout {
    pub const UNBOUNDED_SENTINEL: i64 = -1;

    pub fn from_secs(secs: i64) -> Result<Self, Report<ValidationError>> {
        match secs {
            Self::UNBOUNDED_SENTINEL => Ok(ProvisionTimeout::Unbounded),
            secs if secs >= 0 => Ok(ProvisionTimeout::Bounded(Duration::from_secs(secs as u64))),
            secs => Err(Report::new(ValidationError::invalid(
                "provisionTimeout",
                format!("{secs} is neither a non-negative number of seconds nor -1"),
            ))),
        }
    }

    pub fn as_duration(self) -> Option<Duration> {
        match self {
            ProvisionTimeout::Bounded(duration) => Some(duration),
            ProvisionTimeout::Unbounded => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueuePlacement {
    pub queue_name: String,
    pub priority_class: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SpotPolicy {
    pub selector_key: String,
    pub selector_value: String,
    #[serde(default)]
    pub toleration_effect: TaintEffect,
}

/// A named class of schedulable accelerator capacity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceFlavor {
    pub name: String,
    /// Extended resource requested per accelerator, e.g. `nvidia.com/gpu`.
    pub resource_name: String,
    pub selector_key: String,
    pub selector_value: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FuseDeviceManager {
    #[serde(default = "default_fuse_resource")]
    pub resource_name: String,
}

fn default_fuse_resource() -> String {
    DEFAULT_FUSE_RESOURCE.to_string()
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Integrations {
    #[serde(default)]
    pub resource_flavors: Vec<ResourceFlavor>,
    #[serde(default)]
    pub fuse_device_manager: Option<FuseDeviceManager>,
    /// Shared namespace the device manager lives in.
    #[serde(default = "default_system_namespace")]
    pub system_namespace: String,
    /// Namespace of the ingress controller used for IP discovery.
    #[serde(default = "default_ingress_namespace")]
    pub ingress_namespace: String,
}

impl Default for Integrations {
    fn default() -> Self {
        Self {
            resource_flavors: Vec::new(),
            fuse_device_manager: None,
            system_namespace: default_system_namespace(),
            ingress_namespace: default_ingress_namespace(),
        }
    }
}

fn default_system_namespace() -> String {
    DEFAULT_SYSTEM_NAMESPACE.to_string()
}

fn default_ingress_namespace() -> String {
    DEFAULT_INGRESS_NAMESPACE.to_string()
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HeadPort {
    pub name: String,
    pub port: u16,
}

pub fn default_head_ports() -> Vec<HeadPort> {
    [("ssh", 22), ("dashboard", 8265), ("client", 10001)]
        .into_iter()
        .map(|(name, port)| HeadPort {
            name: name.to_string(),
            port,
        })
        .collect()
}

/// Distributed runtime started on every node once setup is done. The head
/// starts it with `--head --port=<port>`, workers with
/// `--address=<head service>:<port>`. An empty command disables it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RuntimeStart {
    #[serde(default = "default_runtime_command")]
    pub command: String,
    #[serde(default = "default_runtime_port")]
    pub port: u16,
    /// Attempts per setup step before the step is given up.
    #[serde(default = "default_setup_attempts")]
    pub attempts: u32,
}

impl Default for RuntimeStart {
    fn default() -> Self {
        Self {
            command: default_runtime_command(),
            port: default_runtime_port(),
            attempts: default_setup_attempts(),
        }
    }
}

impl RuntimeStart {
    pub fn enabled(&self) -> bool {
        !self.command.trim().is_empty()
    }
}

fn default_runtime_command() -> String {
    DEFAULT_RUNTIME_COMMAND.to_string()
}

fn default_runtime_port() -> u16 {
    DEFAULT_RUNTIME_PORT
}

fn default_setup_attempts() -> u32 {
    5
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AcceleratorRequest {
    pub count: u32,
    pub flavor: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct NodeResources {
    pub cpus: f64,
    pub memory_gb: f64,
    pub accelerators: Option<AcceleratorRequest>,
}

/// Validated cluster description. Never mutated after construction.
#[derive(Debug, Clone, PartialEq)]
pub struct ClusterSpec {
    pub(crate) name: String,
    pub(crate) namespace: String,
    pub(crate) context: Option<String>,
    pub(crate) num_nodes: u32,
    pub(crate) image: String,
    pub(crate) resources: NodeResources,
    pub(crate) queue: Option<QueuePlacement>,
    pub(crate) fuse_required: bool,
    pub(crate) spot: Option<SpotPolicy>,
    pub(crate) networking: NetworkingMode,
    pub(crate) provision_timeout: ProvisionTimeout,
    pub(crate) integrations: Integrations,
    pub(crate) service_account: String,
    pub(crate) setup_packages: Vec<String>,
    pub(crate) head_ports: Vec<HeadPort>,
    pub(crate) runtime: RuntimeStart,
}

impl ClusterSpec {
    /// Validate a user configuration.
    ///
    /// # Errors
    ///
    /// - [`ValidationError::InvalidField`] for the first field that fails its check
    pub fn from_config(config: ClusterConfig) -> Result<Self, Report<ValidationError>> {
        check_dns_label("name", &config.name, MAX_CLUSTER_NAME_LEN)?;
        check_dns_label("namespace", &config.namespace, 63)?;
        check_dns_label("serviceAccount", &config.service_account, 63)?;
        check_dns_label(
            "integrations.systemNamespace",
            &config.integrations.system_namespace,
            63,
        )?;
        check_dns_label(
            "integrations.ingressNamespace",
            &config.integrations.ingress_namespace,
            63,
        )?;

        if config.num_nodes == 0 {
            return Err(Report::new(ValidationError::invalid(
                "numNodes",
                "a cluster needs at least the head node",
            )));
        }
        if config.image.trim().is_empty() {
            return Err(Report::new(ValidationError::invalid(
                "image",
                "must not be empty",
            )));
        }
        if !(config.resources.cpus.is_finite() && config.resources.cpus > 0.0) {
            return Err(Report::new(ValidationError::invalid(
                "resources.cpus",
                format!("{} is not a positive number", config.resources.cpus),
            )));
        }
        if !(config.resources.memory.is_finite() && config.resources.memory > 0.0) {
            return Err(Report::new(ValidationError::invalid(
                "resources.memory",
                format!("{} is not a positive number", config.resources.memory),
            )));
        }

        let accelerators = match (config.resources.accelerators, config.resources.accelerator_flavor) {
            (0, _) => None,
            (count, Some(flavor)) if !flavor.is_empty() => Some(AcceleratorRequest { count, flavor }),
            (count, _) => {
                return Err(Report::new(ValidationError::invalid(
                    "resources.acceleratorFlavor",
                    format!("{count} accelerators requested without naming a resource flavor"),
                )))
            }
        };

        if let Some(queue) = &config.queue {
            if queue.queue_name.trim().is_empty() {
                return Err(Report::new(ValidationError::invalid(
                    "queue.queueName",
                    "must not be empty",
                )));
            }
            if queue.priority_class.trim().is_empty() {
                return Err(Report::new(ValidationError::invalid(
                    "queue.priorityClass",
                    "must not be empty",
                )));
            }
        }

        if let Some(spot) = &config.spot {
            if spot.selector_key.is_empty() || spot.selector_value.is_empty() {
                return Err(Report::new(ValidationError::invalid(
                    "spot",
                    "selector key and value are both required",
                )));
            }
        }

        for package in &config.setup_packages {
            if package.is_empty() || !package.chars().all(is_package_char) {
                return Err(Report::new(ValidationError::invalid(
                    "setupPackages",
                    format!("`{package}` is not a valid package name"),
                )));
            }
        }

        let head_ports = if config.head_ports.is_empty() {
            default_head_ports()
        } else {
            config.head_ports
        };
        for port in &head_ports {
            check_dns_label("headPorts.name", &port.name, 15)?;
            if port.port == 0 {
                return Err(Report::new(ValidationError::invalid(
                    "headPorts.port",
                    format!("port `{}` must be non-zero", port.name),
                )));
            }
        }

        if config.runtime.attempts == 0 {
            return Err(Report::new(ValidationError::invalid(
                "runtime.attempts",
                "at least one attempt is required",
            )));
        }
        if config.runtime.enabled() && config.runtime.port == 0 {
            return Err(Report::new(ValidationError::invalid(
                "runtime.port",
                "must be non-zero",
            )));
        }

        let provision_timeout = ProvisionTimeout::from_secs(config.provision_timeout)?;

        Ok(Self {
            name: config.name,
            namespace: config.namespace,
            context: config.context,
            num_nodes: config.num_nodes,
            image: config.image,
            resources: NodeResources {
                cpus: config.resources.cpus,
                memory_gb: config.resources.memory,
                accelerators,
            },
            queue: config.queue,
            fuse_required: config.fuse_required,
            spot: config.spot,
            networking: config.networking,
            provision_timeout,
            integrations: config.integrations,
            service_account: config.service_account,
            setup_packages: config.setup_packages,
            head_ports,
            runtime: config.runtime,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    pub fn context(&self) -> Option<&str> {
        self.context.as_deref()
    }

    pub fn provision_timeout(&self) -> ProvisionTimeout {
        self.provision_timeout
    }

    pub fn worker_count(&self) -> u32 {
        self.num_nodes - 1
    }

    pub fn head_pod_name(&self) -> String {
        head_pod_name(&self.name)
    }

    /// Resolve the declared flavor for the accelerator request, if any.
    ///
    /// # Errors
    ///
    /// - [`ValidationError::UnknownResourceFlavor`] if the request names an undeclared flavor
    pub(crate) fn accelerator_flavor(
        &self,
    ) -> Result<Option<(&AcceleratorRequest, &ResourceFlavor)>, Report<ValidationError>> {
        let Some(request) = &self.resources.accelerators else {
            return Ok(None);
        };
        self.integrations
            .resource_flavors
            .iter()
            .find(|flavor| flavor.name == request.flavor)
            .map(|flavor| Some((request, flavor)))
            .ok_or_else(|| {
                Report::new(ValidationError::UnknownResourceFlavor {
                    flavor: request.flavor.clone(),
                })
            })
    }

    /// # Errors
    ///
    /// - [`ValidationError::FuseDeviceManagerMissing`] when FUSE is required without a device manager
    pub(crate) fn fuse_device_manager(
        &self,
    ) -> Result<Option<&FuseDeviceManager>, Report<ValidationError>> {
        match (self.fuse_required, &self.integrations.fuse_device_manager) {
            (false, _) => Ok(None),
            (true, Some(manager)) => Ok(Some(manager)),
            (true, None) => Err(Report::new(ValidationError::FuseDeviceManagerMissing)),
        }
    }
}

pub fn head_pod_name(cluster: &str) -> String {
    format!("{cluster}-head")
}

pub fn worker_pod_name(cluster: &str, index: u32) -> String {
    format!("{cluster}-worker{index}")
}

fn is_package_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || matches!(c, '.' | '+' | '-' | '_' | ':' | '=')
}

fn check_dns_label(
    field: &'static str,
    value: &str,
    max_len: usize,
) -> Result<(), Report<ValidationError>> {
    let valid_chars = value
        .chars()
        .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-');
    let valid_edges = value
        .chars()
        .next()
        .is_some_and(|c| c.is_ascii_alphanumeric())
        && value.chars().last().is_some_and(|c| c.is_ascii_alphanumeric());

    if value.is_empty() || value.len() > max_len || !valid_chars || !valid_edges {
        return Err(Report::new(ValidationError::invalid(
            field,
            format!("`{value}` must be a lowercase DNS label of at most {max_len} characters"),
        )));
    }
    Ok(())
}
