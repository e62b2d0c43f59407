pub mod down;
pub mod jobs;
pub mod keepalive;
pub mod launch;
pub mod status;

use std::sync::Arc;

use anyhow::Result;

use crate::config::KubeArgs;
use crate::infrastructure::k8s::KubeClusterApi;
use crate::infrastructure::kube_client;

/// Connect to the API server described by the common kube flags. A context
/// from the flags wins over `fallback_context`.
pub(crate) async fn connect(
    kube: &KubeArgs,
    fallback_context: Option<String>,
) -> Result<Arc<KubeClusterApi>> {
    let context = kube.context.clone().or(fallback_context);
    let client = kube_client::init_kube_client(kube.kubeconfig.clone(), context)
        .await
        .map_err(|e| anyhow::anyhow!("{e:?}"))?;
    Ok(Arc::new(KubeClusterApi::new(client)))
}
