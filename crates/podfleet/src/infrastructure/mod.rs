pub mod k8s;
pub mod kube_client;
pub mod proc_probe;
pub mod signals;
pub mod tail;
