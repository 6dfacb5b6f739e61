//! Binding types
//!
//! A [`DesiredBinding`] is what a ConfigMap declares; a managed
//! `ClusterRoleBinding` is what lands on the cluster. The management marker
//! annotation is what ties the two together: only marked bindings are ever
//! listed, updated, or deleted.

use std::collections::{BTreeMap, HashSet};

use k8s_openapi::api::rbac::v1::{ClusterRoleBinding, RoleRef, Subject};
use kube::api::ObjectMeta;
use serde::{Deserialize, Serialize};

/// API group of ClusterRole references and User subjects
pub const RBAC_API_GROUP: &str = "rbac.authorization.k8s.io";

/// Annotation key marking a ClusterRoleBinding as owned by this controller
pub const MANAGED_BY_ANNOTATION: &str = "rbac-sync.dev/managed-by";

/// Value written under [`MANAGED_BY_ANNOTATION`]
pub const MANAGED_BY_VALUE: &str = "rbac-sync";

/// Identifier type for raw sub-account ids
pub const SUB_ACCOUNT_ID_TYPE: &str = "subAccountId";

/// Identifier type for email addresses
pub const EMAIL_TYPE: &str = "email";

/// A declared user, before or after resolution
///
/// `value` starts as the raw identifier and is replaced in place with the
/// canonical principal name once resolved.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserIdentifier {
    /// Selects the resolver worker (e.g. "subAccountId", "email")
    #[serde(rename = "type")]
    pub value_type: String,
    /// Raw identifier, or canonical name after resolution
    pub value: String,
}

impl UserIdentifier {
    /// Create a new identifier
    pub fn new(value_type: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            value_type: value_type.into(),
            value: value.into(),
        }
    }
}

/// A role plus the users that should hold it, keyed by binding name
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DesiredBinding {
    /// Name of the ClusterRoleBinding; unique across all sources
    pub binding_name: String,
    /// Name of the ClusterRole to bind
    pub role_name: String,
    /// Users in declaration order
    pub users: Vec<UserIdentifier>,
    /// `namespace/name` of the ConfigMap that declared this binding
    #[serde(skip)]
    pub source: String,
}

impl DesiredBinding {
    /// Build the managed ClusterRoleBinding for this binding
    ///
    /// Subjects are de-duplicated by name, keeping first-seen order, so two
    /// identifiers resolving to the same principal yield one subject.
    pub fn to_cluster_role_binding(&self) -> ClusterRoleBinding {
        let mut seen = HashSet::new();
        let subjects: Vec<Subject> = self
            .users
            .iter()
            .filter(|u| seen.insert(u.value.as_str()))
            .map(|u| user_subject(&u.value))
            .collect();

        let mut crb = ClusterRoleBinding {
            metadata: ObjectMeta {
                name: Some(self.binding_name.clone()),
                ..Default::default()
            },
            role_ref: cluster_role_ref(&self.role_name),
            subjects: Some(subjects),
        };
        mark_managed(&mut crb);
        crb
    }
}

/// RoleRef pointing at a ClusterRole
pub fn cluster_role_ref(role_name: &str) -> RoleRef {
    RoleRef {
        api_group: RBAC_API_GROUP.to_string(),
        kind: "ClusterRole".to_string(),
        name: role_name.to_string(),
    }
}

/// User subject with the given principal name
pub fn user_subject(name: &str) -> Subject {
    Subject {
        api_group: Some(RBAC_API_GROUP.to_string()),
        kind: "User".to_string(),
        name: name.to_string(),
        namespace: None,
    }
}

/// Whether the binding carries the management marker
pub fn is_managed(crb: &ClusterRoleBinding) -> bool {
    crb.metadata
        .annotations
        .as_ref()
        .is_some_and(|a| a.contains_key(MANAGED_BY_ANNOTATION))
}

/// Stamp the management marker onto the binding
pub fn mark_managed(crb: &mut ClusterRoleBinding) {
    crb.metadata
        .annotations
        .get_or_insert_with(BTreeMap::new)
        .insert(
            MANAGED_BY_ANNOTATION.to_string(),
            MANAGED_BY_VALUE.to_string(),
        );
}

/// Binding name, or empty string for nameless objects
pub fn binding_name(crb: &ClusterRoleBinding) -> &str {
    crb.metadata.name.as_deref().unwrap_or_default()
}
