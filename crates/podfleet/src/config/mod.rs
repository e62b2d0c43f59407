pub mod cli;
pub mod cluster;
pub mod cluster_args;
pub mod jobs;
pub mod keepalive;

pub use cli::*;
pub use cluster::ClusterConfig;
pub use cluster::ConfigError;
pub use cluster::ResourcesConfig;
pub use cluster_args::*;
pub use jobs::*;
pub use keepalive::*;
