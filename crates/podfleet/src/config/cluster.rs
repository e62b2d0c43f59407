use std::path::Path;

use serde::Deserialize;
use serde::Serialize;

use crate::domain::cluster_spec::HeadPort;
use crate::domain::cluster_spec::Integrations;
use crate::domain::cluster_spec::NetworkingMode;
use crate::domain::cluster_spec::QueuePlacement;
use crate::domain::cluster_spec::RuntimeStart;
use crate::domain::cluster_spec::SpotPolicy;
use crate::domain::cluster_spec::DEFAULT_SERVICE_ACCOUNT;

/// Errors raised while loading a cluster configuration document.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read cluster config `{path}`: {source}")]
    Read {
        path: String,
        source: std::io::Error,
    },
    #[error("failed to parse cluster config `{path}`: {source}")]
    Parse {
        path: String,
        source: serde_yaml::Error,
    },
}

/// User facing cluster configuration, as written in YAML (or JSON).
///
/// This is the unvalidated form; turn it into a
/// [`ClusterSpec`](crate::domain::cluster_spec::ClusterSpec) before use.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClusterConfig {
    pub name: String,
    #[serde(default = "default_namespace")]
    pub namespace: String,
    /// kubeconfig context, defaults to the current one
    #[serde(default)]
    pub context: Option<String>,
    /// Total number of nodes, head included.
    #[serde(default = "default_num_nodes")]
    pub num_nodes: u32,
    pub image: String,
    pub resources: ResourcesConfig,
    #[serde(default)]
    pub queue: Option<QueuePlacement>,
    #[serde(default)]
    pub fuse_required: bool,
    #[serde(default)]
    pub spot: Option<SpotPolicy>,
    #[serde(default)]
    pub networking: NetworkingMode,
    /// Seconds to wait for the cluster to come up, `-1` waits forever.
    #[serde(default = "default_provision_timeout")]
    pub provision_timeout: i64,
    #[serde(default)]
    pub integrations: Integrations,
    #[serde(default = "default_service_account")]
    pub service_account: String,
    /// Packages installed in the background after the pod starts.
    #[serde(default)]
    pub setup_packages: Vec<String>,
    #[serde(default)]
    pub head_ports: Vec<HeadPort>,
    #[serde(default)]
    pub runtime: RuntimeStart,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourcesConfig {
    pub cpus: f64,
    /// Memory in GB.
    pub memory: f64,
    #[serde(default)]
    pub accelerators: u32,
    #[serde(default)]
    pub accelerator_flavor: Option<String>,
}

impl ClusterConfig {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        serde_yaml::from_str(&raw).map_err(|source| ConfigError::Parse {
            path: path.display().to_string(),
            source,
        })
    }
}

fn default_namespace() -> String {
    "default".to_string()
}

fn default_num_nodes() -> u32 {
    1
}

fn default_provision_timeout() -> i64 {
    10
}

fn default_service_account() -> String {
    DEFAULT_SERVICE_ACCOUNT.to_string()
}
