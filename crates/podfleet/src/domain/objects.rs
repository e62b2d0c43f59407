//! Closed set of Kubernetes object kinds podfleet creates.

use std::fmt;

use k8s_openapi::api::core::v1::Pod;
use k8s_openapi::api::core::v1::Service;
use k8s_openapi::api::core::v1::ServiceAccount;
use k8s_openapi::api::rbac::v1::ClusterRole;
use k8s_openapi::api::rbac::v1::ClusterRoleBinding;
use k8s_openapi::api::rbac::v1::Role;
use k8s_openapi::api::rbac::v1::RoleBinding;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ObjectKind {
    ServiceAccount,
    Role,
    RoleBinding,
    ClusterRole,
    ClusterRoleBinding,
    Service,
    Pod,
}

impl fmt::Display for ObjectKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

impl ObjectKind {
    pub fn is_cluster_scoped(self) -> bool {
        matches!(self, ObjectKind::ClusterRole | ObjectKind::ClusterRoleBinding)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObjectKey {
    pub kind: ObjectKind,
    /// `None` for cluster scoped kinds.
    pub namespace: Option<String>,
    pub name: String,
}

impl ObjectKey {
    pub fn namespaced(kind: ObjectKind, namespace: &str, name: &str) -> Self {
        Self {
            kind,
            namespace: Some(namespace.to_string()),
            name: name.to_string(),
        }
    }

    pub fn cluster(kind: ObjectKind, name: &str) -> Self {
        Self {
            kind,
            namespace: None,
            name: name.to_string(),
        }
    }

    pub fn pod(namespace: &str, name: &str) -> Self {
        Self::namespaced(ObjectKind::Pod, namespace, name)
    }
}

impl fmt::Display for ObjectKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.namespace {
            Some(namespace) => write!(f, "{} {namespace}/{}", self.kind, self.name),
            None => write!(f, "{} {}", self.kind, self.name),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ManagedObject {
    ServiceAccount(ServiceAccount),
    Role(Role),
    RoleBinding(RoleBinding),
    ClusterRole(ClusterRole),
    ClusterRoleBinding(ClusterRoleBinding),
    Service(Service),
    Pod(Pod),
}

impl ManagedObject {
    pub fn kind(&self) -> ObjectKind {
        match self {
            ManagedObject::ServiceAccount(_) => ObjectKind::ServiceAccount,
            ManagedObject::Role(_) => ObjectKind::Role,
            ManagedObject::RoleBinding(_) => ObjectKind::RoleBinding,
            ManagedObject::ClusterRole(_) => ObjectKind::ClusterRole,
            ManagedObject::ClusterRoleBinding(_) => ObjectKind::ClusterRoleBinding,
            ManagedObject::Service(_) => ObjectKind::Service,
            ManagedObject::Pod(_) => ObjectKind::Pod,
        }
    }

    pub fn metadata(&self) -> &ObjectMeta {
        match self {
            ManagedObject::ServiceAccount(o) => &o.metadata,
            ManagedObject::Role(o) => &o.metadata,
            ManagedObject::RoleBinding(o) => &o.metadata,
            ManagedObject::ClusterRole(o) => &o.metadata,
            ManagedObject::ClusterRoleBinding(o) => &o.metadata,
            ManagedObject::Service(o) => &o.metadata,
            ManagedObject::Pod(o) => &o.metadata,
        }
    }

    pub fn key(&self) -> ObjectKey {
        let metadata = self.metadata();
        ObjectKey {
            kind: self.kind(),
            namespace: if self.kind().is_cluster_scoped() {
                None
            } else {
                metadata.namespace.clone()
            },
            name: metadata.name.clone().unwrap_or_default(),
        }
    }

    /// Whether `self` is a binding whose `roleRef` differs from `other`'s.
    /// The API server rejects any change to `roleRef`, so such drift cannot
    /// be patched.
    pub fn role_ref_differs(&self, other: &ManagedObject) -> bool {
        match (self, other) {
            (ManagedObject::RoleBinding(a), ManagedObject::RoleBinding(b)) => a.role_ref != b.role_ref,
            (ManagedObject::ClusterRoleBinding(a), ManagedObject::ClusterRoleBinding(b)) => {
                a.role_ref != b.role_ref
            }
            _ => false,
        }
    }

    /// Compare the parts of an object that grant or route access, ignoring
    /// server assigned metadata. Used to decide whether an existing object
    /// must be patched.
    pub fn same_content(&self, other: &ManagedObject) -> bool {
        match (self, other) {
            (ManagedObject::ServiceAccount(_), ManagedObject::ServiceAccount(_)) => true,
            (ManagedObject::Role(a), ManagedObject::Role(b)) => a.rules == b.rules,
            (ManagedObject::RoleBinding(a), ManagedObject::RoleBinding(b)) => {
                a.role_ref == b.role_ref && a.subjects == b.subjects
            }
            (ManagedObject::ClusterRole(a), ManagedObject::ClusterRole(b)) => a.rules == b.rules,
            (ManagedObject::ClusterRoleBinding(a), ManagedObject::ClusterRoleBinding(b)) => {
                a.role_ref == b.role_ref && a.subjects == b.subjects
            }
            (ManagedObject::Service(a), ManagedObject::Service(b)) => {
                let selector = |s: &Service| s.spec.as_ref().and_then(|spec| spec.selector.clone());
                selector(a) == selector(b)
            }
            (ManagedObject::Pod(a), ManagedObject::Pod(b)) => {
                spec_hash_of(&a.metadata) == spec_hash_of(&b.metadata)
            }
            _ => false,
        }
    }
}

fn spec_hash_of(metadata: &ObjectMeta) -> Option<&String> {
    metadata
        .annotations
        .as_ref()
        .and_then(|annotations| annotations.get(crate::domain::labels::SPEC_HASH_ANNOTATION))
}

#[cfg(test)]
mod tests {
    use k8s_openapi::api::rbac::v1::PolicyRule;
    use similar_asserts::assert_eq;

    use super::*;

    fn role(verbs: &[&str]) -> ManagedObject {
        ManagedObject::Role(Role {
            metadata: ObjectMeta {
                name: Some("r".to_string()),
                namespace: Some("ns".to_string()),
                resource_version: Some("42".to_string()),
                ..Default::default()
            },
            rules: Some(vec![PolicyRule {
                verbs: verbs.iter().map(|v| v.to_string()).collect(),
                ..Default::default()
            }]),
        })
    }

    #[test]
    fn key_drops_namespace_for_cluster_scoped_kinds() {
        let role = ManagedObject::ClusterRole(ClusterRole {
            metadata: ObjectMeta {
                name: Some("cr".to_string()),
                namespace: Some("ignored".to_string()),
                ..Default::default()
            },
            ..Default::default()
        });
        assert_eq!(role.key(), ObjectKey::cluster(ObjectKind::ClusterRole, "cr"));
        assert_eq!(role.key().to_string(), "ClusterRole cr");
    }

    #[test]
    fn same_content_ignores_metadata() {
        let mut other = role(&["get"]);
        if let ManagedObject::Role(r) = &mut other {
            r.metadata.resource_version = None;
        }
        assert!(role(&["get"]).same_content(&other));
        assert!(!role(&["get"]).same_content(&role(&["get", "list"])));
    }
}
