use std::path::PathBuf;

use clap::Args;
use clap::Parser;

/// How to reach the API server.
#[derive(Args, Clone, Debug)]
pub struct KubeArgs {
    #[arg(
        long,
        env = "KUBECONFIG",
        value_hint = clap::ValueHint::FilePath,
        help = "Path to kubeconfig file (defaults to cluster config or ~/.kube/config)"
    )]
    pub kubeconfig: Option<PathBuf>,

    #[arg(
        long,
        env = "PODFLEET_CONTEXT",
        help = "kubeconfig context to use instead of the current one"
    )]
    pub context: Option<String>,
}

#[derive(Parser, Clone, Debug)]
pub struct LaunchArgs {
    #[arg(
        long,
        short = 'c',
        env = "PODFLEET_CLUSTER_CONFIG",
        value_hint = clap::ValueHint::FilePath,
        help = "Cluster configuration file (YAML or JSON)"
    )]
    pub config: PathBuf,

    #[arg(
        long,
        help = "Delete and recreate existing node pods whose spec no longer matches the configuration"
    )]
    pub recreate: bool,

    #[arg(
        long,
        default_value = "2",
        help = "Seconds between readiness checks while waiting for pods"
    )]
    pub readiness_poll_secs: u64,

    #[command(flatten)]
    pub kube: KubeArgs,
}

#[derive(Parser, Clone, Debug)]
pub struct ClusterRefArgs {
    #[arg(help = "Cluster name")]
    pub cluster: String,

    #[arg(
        long,
        short = 'n',
        env = "PODFLEET_NAMESPACE",
        default_value = "default",
        help = "Namespace the cluster runs in"
    )]
    pub namespace: String,

    #[command(flatten)]
    pub kube: KubeArgs,
}
