//! Multi-node compute clusters and preemption-tolerant jobs on Kubernetes,
//! built from plain pods.

pub mod cmd;
pub mod config;
pub mod domain;
pub mod infrastructure;
