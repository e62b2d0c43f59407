use anyhow::Result;
use tracing::info;

use super::status::QUERY_TIMEOUT;
use crate::config::ClusterRefArgs;
use crate::domain::node_pods::NodePodController;
use crate::domain::retry::RetryPolicy;

pub async fn run_down(args: ClusterRefArgs) -> Result<()> {
    let api = super::connect(&args.kube, None).await?;
    let deleted = NodePodController::new(api, RetryPolicy::new(QUERY_TIMEOUT))
        .teardown(&args.namespace, &args.cluster)
        .await
        .map_err(|e| anyhow::anyhow!("{e:?}"))?;

    info!(cluster = %args.cluster, pods = deleted, "Cluster down");
    println!("deleted {deleted} pods of cluster {}", args.cluster);
    Ok(())
}
