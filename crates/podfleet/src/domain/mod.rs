pub mod cluster_api;
pub mod cluster_spec;
pub mod error;
pub mod jobs;
pub mod keepalive;
pub mod labels;
pub mod node_pods;
pub mod objects;
pub mod pod_state;
pub mod rbac;
pub mod render;
pub mod retry;

#[cfg(test)]
pub(crate) mod mock;
