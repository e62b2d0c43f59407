use std::fmt::Debug;

use error_stack::Report;
use k8s_openapi::api::core::v1::Pod;
use k8s_openapi::api::core::v1::Service;
use k8s_openapi::api::core::v1::ServiceAccount;
use k8s_openapi::api::rbac::v1::ClusterRole;
use k8s_openapi::api::rbac::v1::ClusterRoleBinding;
use k8s_openapi::api::rbac::v1::Role;
use k8s_openapi::api::rbac::v1::RoleBinding;
use k8s_openapi::NamespaceResourceScope;
use kube::api::ApiResource;
use kube::api::DeleteParams;
use kube::api::DynamicObject;
use kube::api::GroupVersionKind;
use kube::api::ListParams;
use kube::api::Patch;
use kube::api::PatchParams;
use kube::api::PostParams;
use kube::Api;
use kube::Client;
use kube::Resource;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::debug;

use super::crds::Workload;
use super::crds::KUEUE_GROUP;
use super::crds::KUEUE_VERSION;
use crate::domain::cluster_api::ClusterApi;
use crate::domain::cluster_api::KubernetesError;
use crate::domain::cluster_api::QueueAdmissionRecord;
use crate::domain::objects::ManagedObject;
use crate::domain::objects::ObjectKey;
use crate::domain::objects::ObjectKind;

/// Field manager recorded on server-side apply patches.
const FIELD_MANAGER: &str = "podfleet";

/// [`ClusterApi`] backed by a live API server.
#[derive(Clone)]
pub struct KubeClusterApi {
    client: Client,
}

impl KubeClusterApi {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    pub fn client(&self) -> &Client {
        &self.client
    }

    fn namespaced<K>(&self, key: &ObjectKey) -> Api<K>
    where
        K: Resource<Scope = NamespaceResourceScope, DynamicType = ()>,
    {
        match key.namespace.as_deref() {
            Some(namespace) => Api::namespaced(self.client.clone(), namespace),
            None => Api::default_namespaced(self.client.clone()),
        }
    }

    fn cluster<K>(&self) -> Api<K>
    where
        K: Resource<DynamicType = ()>,
    {
        Api::all(self.client.clone())
    }

    fn kueue(&self, kind: &str) -> ApiResource {
        ApiResource::from_gvk(&GroupVersionKind::gvk(KUEUE_GROUP, KUEUE_VERSION, kind))
    }
}

/// Classify a client error for the object it concerns.
fn api_error(object: impl ToString, error: kube::Error) -> Report<KubernetesError> {
    let object = object.to_string();
    match error {
        kube::Error::Api(response) => Report::new(KubernetesError::from_status(
            response.code,
            object,
            response.message.clone(),
        ))
        .attach_printable(format!("reason: {}", response.reason)),
        other => Report::new(KubernetesError::ConnectionFailed {
            message: format!("{object}: {other}"),
        }),
    }
}

async fn get<K>(api: Api<K>, key: &ObjectKey) -> Result<Option<K>, Report<KubernetesError>>
where
    K: Clone + DeserializeOwned + Debug,
{
    api.get_opt(&key.name).await.map_err(|e| api_error(key, e))
}

async fn create<K>(api: Api<K>, key: &ObjectKey, object: &K) -> Result<(), Report<KubernetesError>>
where
    K: Clone + DeserializeOwned + Serialize + Debug,
{
    api.create(&PostParams::default(), object)
        .await
        .map(|_| ())
        .map_err(|e| api_error(key, e))
}

async fn apply<K>(api: Api<K>, key: &ObjectKey, object: &K) -> Result<(), Report<KubernetesError>>
where
    K: Clone + DeserializeOwned + Serialize + Debug,
{
    api.patch(
        &key.name,
        &PatchParams::apply(FIELD_MANAGER).force(),
        &Patch::Apply(object),
    )
    .await
    .map(|_| ())
    .map_err(|e| api_error(key, e))
}

async fn delete<K>(api: Api<K>, key: &ObjectKey) -> Result<(), Report<KubernetesError>>
where
    K: Clone + DeserializeOwned + Debug,
{
    match api.delete(&key.name, &DeleteParams::default()).await {
        Ok(_) => Ok(()),
        Err(kube::Error::Api(response)) if response.code == 404 => {
            debug!(object = %key, "already deleted");
            Ok(())
        }
        Err(e) => Err(api_error(key, e)),
    }
}

#[async_trait::async_trait]
impl ClusterApi for KubeClusterApi {
    async fn get_object(
        &self,
        key: &ObjectKey,
    ) -> Result<Option<ManagedObject>, Report<KubernetesError>> {
        let object = match key.kind {
            ObjectKind::ServiceAccount => {
                get(self.namespaced::<ServiceAccount>(key), key).await?.map(ManagedObject::ServiceAccount)
            }
            ObjectKind::Role => get(self.namespaced::<Role>(key), key).await?.map(ManagedObject::Role),
            ObjectKind::RoleBinding => {
                get(self.namespaced::<RoleBinding>(key), key).await?.map(ManagedObject::RoleBinding)
            }
            ObjectKind::ClusterRole => {
                get(self.cluster::<ClusterRole>(), key).await?.map(ManagedObject::ClusterRole)
            }
            ObjectKind::ClusterRoleBinding => get(self.cluster::<ClusterRoleBinding>(), key)
                .await?
                .map(ManagedObject::ClusterRoleBinding),
            ObjectKind::Service => {
                get(self.namespaced::<Service>(key), key).await?.map(ManagedObject::Service)
            }
            ObjectKind::Pod => get(self.namespaced::<Pod>(key), key).await?.map(ManagedObject::Pod),
        };
        Ok(object)
    }

    async fn create_object(&self, object: &ManagedObject) -> Result<(), Report<KubernetesError>> {
        let key = object.key();
        match object {
            ManagedObject::ServiceAccount(o) => create(self.namespaced(&key), &key, o).await,
            ManagedObject::Role(o) => create(self.namespaced(&key), &key, o).await,
            ManagedObject::RoleBinding(o) => create(self.namespaced(&key), &key, o).await,
            ManagedObject::ClusterRole(o) => create(self.cluster(), &key, o).await,
            ManagedObject::ClusterRoleBinding(o) => create(self.cluster(), &key, o).await,
            ManagedObject::Service(o) => create(self.namespaced(&key), &key, o).await,
            ManagedObject::Pod(o) => create(self.namespaced(&key), &key, o).await,
        }
    }

    async fn patch_object(&self, object: &ManagedObject) -> Result<(), Report<KubernetesError>> {
        let key = object.key();
        match object {
            ManagedObject::ServiceAccount(o) => apply(self.namespaced(&key), &key, o).await,
            ManagedObject::Role(o) => apply(self.namespaced(&key), &key, o).await,
            ManagedObject::RoleBinding(o) => apply(self.namespaced(&key), &key, o).await,
            ManagedObject::ClusterRole(o) => apply(self.cluster(), &key, o).await,
            ManagedObject::ClusterRoleBinding(o) => apply(self.cluster(), &key, o).await,
            ManagedObject::Service(o) => apply(self.namespaced(&key), &key, o).await,
            ManagedObject::Pod(o) => apply(self.namespaced(&key), &key, o).await,
        }
    }

    async fn delete_object(&self, key: &ObjectKey) -> Result<(), Report<KubernetesError>> {
        match key.kind {
            ObjectKind::ServiceAccount => delete(self.namespaced::<ServiceAccount>(key), key).await,
            ObjectKind::Role => delete(self.namespaced::<Role>(key), key).await,
            ObjectKind::RoleBinding => delete(self.namespaced::<RoleBinding>(key), key).await,
            ObjectKind::ClusterRole => delete(self.cluster::<ClusterRole>(), key).await,
            ObjectKind::ClusterRoleBinding => {
                delete(self.cluster::<ClusterRoleBinding>(), key).await
            }
            ObjectKind::Service => delete(self.namespaced::<Service>(key), key).await,
            ObjectKind::Pod => delete(self.namespaced::<Pod>(key), key).await,
        }
    }

    async fn list_pods(
        &self,
        namespace: &str,
        label_selector: &str,
    ) -> Result<Vec<Pod>, Report<KubernetesError>> {
        let api: Api<Pod> = Api::namespaced(self.client.clone(), namespace);
        let pods = api
            .list(&ListParams::default().labels(label_selector))
            .await
            .map_err(|e| api_error(format!("Pod {namespace}/[{label_selector}]"), e))?;
        Ok(pods.items)
    }

    async fn find_workload(
        &self,
        namespace: &str,
        pod_name: &str,
    ) -> Result<Option<QueueAdmissionRecord>, Report<KubernetesError>> {
        let api: Api<Workload> = Api::namespaced(self.client.clone(), namespace);
        let workloads = match api.list(&ListParams::default()).await {
            Ok(list) => list.items,
            // queue not installed
            Err(kube::Error::Api(response)) if response.code == 404 => return Ok(None),
            Err(e) => return Err(api_error(format!("Workload {namespace}/*"), e)),
        };
        Ok(workloads
            .iter()
            .filter(|workload| workload.owner_pod() == Some(pod_name))
            .find_map(Workload::admission_record))
    }

    async fn local_queue_exists(
        &self,
        namespace: &str,
        queue: &str,
    ) -> Result<bool, Report<KubernetesError>> {
        let resource = self.kueue("LocalQueue");
        let api: Api<DynamicObject> = Api::namespaced_with(self.client.clone(), namespace, &resource);
        match api.get_opt(queue).await {
            Ok(found) => Ok(found.is_some()),
            Err(kube::Error::Api(response)) if response.code == 404 => Ok(false),
            Err(e) => Err(api_error(format!("LocalQueue {namespace}/{queue}"), e)),
        }
    }

    async fn priority_class_exists(&self, name: &str) -> Result<bool, Report<KubernetesError>> {
        let resource = self.kueue("WorkloadPriorityClass");
        let api: Api<DynamicObject> = Api::all_with(self.client.clone(), &resource);
        match api.get_opt(name).await {
            Ok(found) => Ok(found.is_some()),
            Err(kube::Error::Api(response)) if response.code == 404 => Ok(false),
            Err(e) => Err(api_error(format!("WorkloadPriorityClass {name}"), e)),
        }
    }
}
