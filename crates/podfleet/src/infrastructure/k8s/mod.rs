//! Kubernetes integration: the live [`ClusterApi`](crate::domain::cluster_api::ClusterApi),
//! the queue's custom resources and the job event watcher.

pub mod api;
pub mod crds;
pub mod job_events;

pub use api::KubeClusterApi;
pub use crds::Workload;
pub use job_events::JobEventWatcher;
