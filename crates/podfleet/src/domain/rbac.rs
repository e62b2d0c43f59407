//! Create-or-reuse of the service account and role set a cluster runs under.

use std::sync::Arc;

use error_stack::Report;
use tracing::debug;
use tracing::info;

use crate::domain::cluster_api::ClusterApi;
use crate::domain::cluster_api::KubernetesError;
use crate::domain::error::ProvisionError;
use crate::domain::objects::ManagedObject;
use crate::domain::objects::ObjectKey;
use crate::domain::render::RenderedCluster;
use crate::domain::retry::RetryPolicy;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RbacOutcome {
    Created,
    Reused,
    Patched,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BootstrapReport {
    pub objects: Vec<(ObjectKey, RbacOutcome)>,
}

impl BootstrapReport {
    pub fn count(&self, outcome: RbacOutcome) -> usize {
        self.objects.iter().filter(|(_, o)| *o == outcome).count()
    }
}

pub struct RbacBootstrapper<A> {
    api: Arc<A>,
    retry: RetryPolicy,
}

impl<A: ClusterApi> RbacBootstrapper<A> {
    pub fn new(api: Arc<A>, retry: RetryPolicy) -> Self {
        Self { api, retry }
    }

    /// Realize every RBAC object of the cluster. Safe to run any number of
    /// times, also concurrently with another launcher: objects are only ever
    /// created or patched, never deleted, so live pods keep their grants.
    ///
    /// # Errors
    ///
    /// - [`ProvisionError::Permission`] if our own identity may not create or patch an object
    /// - [`ProvisionError::Timeout`] if the API stays unavailable past the provisioning timeout
    /// - [`ProvisionError::ImmutableRoleRef`] if an existing binding points at another role
    #[tracing::instrument(skip(self, rendered), fields(cluster = %rendered.cluster_name))]
    pub async fn bootstrap(
        &self,
        rendered: &RenderedCluster,
    ) -> Result<BootstrapReport, Report<ProvisionError>> {
        let mut report = BootstrapReport::default();
        for object in rendered.rbac_objects() {
            let outcome = self.ensure(&object).await?;
            debug!(object = %object.key(), ?outcome, "rbac object realized");
            report.objects.push((object.key(), outcome));
        }
        info!(
            created = report.count(RbacOutcome::Created),
            reused = report.count(RbacOutcome::Reused),
            patched = report.count(RbacOutcome::Patched),
            "rbac bootstrap complete"
        );
        Ok(report)
    }

    async fn ensure(&self, desired: &ManagedObject) -> Result<RbacOutcome, Report<ProvisionError>> {
        let key = desired.key();
        let existing = self
            .retry
            .run(&format!("get {key}"), || self.api.get_object(&key))
            .await?;

        match existing {
            None => {
                self.retry
                    .run(&format!("create {key}"), move || async move {
                        match self.api.create_object(desired).await {
                            Err(report) if report.current_context().is_already_exists() => {
                                Ok(RbacOutcome::Reused)
                            }
                            Err(report) => Err(report),
                            Ok(()) => Ok(RbacOutcome::Created),
                        }
                    })
                    .await
            }
            Some(current) if current.same_content(desired) => Ok(RbacOutcome::Reused),
            Some(current) if current.role_ref_differs(desired) => {
                Err(Report::new(ProvisionError::ImmutableRoleRef {
                    binding: key.to_string(),
                }))
            }
            Some(_) => {
                self.retry
                    .run(&format!("patch {key}"), || self.patch(desired))
                    .await?;
                Ok(RbacOutcome::Patched)
            }
        }
    }

    async fn patch(&self, desired: &ManagedObject) -> Result<(), Report<KubernetesError>> {
        self.api.patch_object(desired).await
    }
}
