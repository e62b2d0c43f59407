use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use error_stack::Report;
use tracing::info;

use crate::config::ClusterConfig;
use crate::config::LaunchArgs;
use crate::domain::cluster_api::ClusterApi;
use crate::domain::cluster_spec::ClusterSpec;
use crate::domain::error::ProvisionError;
use crate::domain::node_pods::NodePodController;
use crate::domain::pod_state::PodRecord;
use crate::domain::rbac::BootstrapReport;
use crate::domain::rbac::RbacBootstrapper;
use crate::domain::rbac::RbacOutcome;
use crate::domain::render::render;
use crate::domain::render::RenderedCluster;
use crate::domain::retry::RetryPolicy;

#[derive(Debug)]
pub struct LaunchSummary {
    pub rbac: BootstrapReport,
    pub pods: Vec<PodRecord>,
}

#[derive(Debug, Clone, Copy)]
pub struct LaunchOptions {
    pub retry: RetryPolicy,
    pub recreate: bool,
    pub readiness_poll: Duration,
}

/// Bootstrap RBAC, then create the head Service and node pods and wait for
/// every pod to become ready.
#[tracing::instrument(skip(api, rendered, options), fields(cluster = %rendered.cluster_name))]
pub async fn provision<A: ClusterApi>(
    api: Arc<A>,
    rendered: &RenderedCluster,
    options: LaunchOptions,
) -> Result<LaunchSummary, Report<ProvisionError>> {
    let rbac = RbacBootstrapper::new(api.clone(), options.retry)
        .bootstrap(rendered)
        .await?;
    let pods = NodePodController::new(api, options.retry)
        .with_recreate(options.recreate)
        .with_readiness_poll(options.readiness_poll)
        .realize(rendered)
        .await?;
    Ok(LaunchSummary { rbac, pods })
}

pub async fn run_launch(args: LaunchArgs) -> Result<()> {
    let config = ClusterConfig::load(&args.config)?;
    let fallback_context = config.context.clone();
    let spec = ClusterSpec::from_config(config).map_err(|e| anyhow::anyhow!("{e:?}"))?;
    let rendered = render(&spec).map_err(|e| anyhow::anyhow!("{e:?}"))?;

    info!(
        cluster = %spec.name(),
        namespace = %spec.namespace(),
        nodes = spec.worker_count() + 1,
        "Launching cluster"
    );
    let api = super::connect(&args.kube, fallback_context).await?;
    let options = LaunchOptions {
        retry: RetryPolicy::new(spec.provision_timeout()),
        recreate: args.recreate,
        readiness_poll: Duration::from_secs(args.readiness_poll_secs.max(1)),
    };

    let summary = match provision(api, &rendered, options).await {
        Ok(summary) => summary,
        Err(e) if e.current_context().requires_operator() => {
            return Err(anyhow::anyhow!(
                "{e:?}\nThis needs a cluster administrator; fix the permissions or pod spec and launch again."
            ));
        }
        Err(e) => return Err(anyhow::anyhow!("{e:?}")),
    };

    println!(
        "RBAC: {} created, {} patched, {} reused",
        summary.rbac.count(RbacOutcome::Created),
        summary.rbac.count(RbacOutcome::Patched),
        summary.rbac.count(RbacOutcome::Reused),
    );
    for record in &summary.pods {
        println!("{:<40} {:<8} {}", record.name, record.role.as_label(), record.phase);
    }
    println!("Head node: {}", spec.head_pod_name());
    Ok(())
}
