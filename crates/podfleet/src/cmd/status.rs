use std::time::Duration;

use anyhow::Result;

use crate::config::ClusterRefArgs;
use crate::domain::cluster_spec::NodeRole;
use crate::domain::cluster_spec::ProvisionTimeout;
use crate::domain::node_pods::NodePodController;
use crate::domain::pod_state::PodPhase;
use crate::domain::pod_state::PodRecord;
use crate::domain::retry::RetryPolicy;

/// Retry budget for read-only commands.
pub(crate) const QUERY_TIMEOUT: ProvisionTimeout = ProvisionTimeout::Bounded(Duration::from_secs(30));

/// One line per cluster: its phase derived from the phases of its pods.
pub fn summarize(records: &[PodRecord]) -> String {
    let Some(head) = records.iter().find(|r| r.role == NodeRole::Head) else {
        return "not found".to_string();
    };
    let running = records.iter().filter(|r| r.phase == PodPhase::Running).count();
    let state = if records.iter().any(|r| r.phase.is_terminal()) {
        "degraded"
    } else if running == records.len() {
        "up"
    } else {
        "starting"
    };
    format!(
        "{} {state} ({running}/{} nodes running)",
        head.cluster,
        records.len()
    )
}

pub async fn run_status(args: ClusterRefArgs) -> Result<()> {
    let api = super::connect(&args.kube, None).await?;
    let records = NodePodController::new(api, RetryPolicy::new(QUERY_TIMEOUT))
        .status(&args.namespace, &args.cluster)
        .await
        .map_err(|e| anyhow::anyhow!("{e:?}"))?;

    if records.is_empty() {
        println!("cluster {} not found in namespace {}", args.cluster, args.namespace);
        return Ok(());
    }
    println!("{}", summarize(&records));
    for record in &records {
        println!("{:<40} {:<8} {}", record.name, record.role.as_label(), record.phase);
    }
    Ok(())
}
