//! ClusterRoleBinding storage

use async_trait::async_trait;
use k8s_openapi::api::rbac::v1::ClusterRoleBinding;
use kube::api::{Api, DeleteParams, ListParams, PostParams};
use kube::Client;

#[cfg(test)]
use mockall::automock;

use crate::binding::{binding_name, is_managed};
use crate::{Result, FIELD_MANAGER};

/// CRUD over cluster-scoped ClusterRoleBindings
///
/// This trait allows mocking the Kubernetes API in tests while using the real
/// client in production.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait BindingStore: Send + Sync {
    /// Bindings carrying the management marker
    async fn list_managed(&self) -> Result<Vec<ClusterRoleBinding>>;

    /// Create a new binding
    async fn create(&self, binding: &ClusterRoleBinding) -> Result<()>;

    /// Replace an existing binding, using its metadata for optimistic concurrency
    async fn replace(&self, binding: &ClusterRoleBinding) -> Result<()>;

    /// Delete a binding by name
    async fn delete(&self, name: &str) -> Result<()>;
}

/// Real Kubernetes implementation
pub struct KubeBindingStore {
    api: Api<ClusterRoleBinding>,
}

impl KubeBindingStore {
    /// Create a store over the cluster's ClusterRoleBindings
    pub fn new(client: Client) -> Self {
        Self {
            api: Api::all(client),
        }
    }
}

fn post_params() -> PostParams {
    PostParams {
        field_manager: Some(FIELD_MANAGER.to_string()),
        ..Default::default()
    }
}

/// Keep only the bindings carrying the management marker
pub(crate) fn retain_managed(bindings: Vec<ClusterRoleBinding>) -> Vec<ClusterRoleBinding> {
    bindings.into_iter().filter(is_managed).collect()
}

#[async_trait]
impl BindingStore for KubeBindingStore {
    async fn list_managed(&self) -> Result<Vec<ClusterRoleBinding>> {
        let list = self.api.list(&ListParams::default()).await?;
        Ok(retain_managed(list.items))
    }

    async fn create(&self, binding: &ClusterRoleBinding) -> Result<()> {
        self.api.create(&post_params(), binding).await?;
        Ok(())
    }

    async fn replace(&self, binding: &ClusterRoleBinding) -> Result<()> {
        self.api
            .replace(binding_name(binding), &post_params(), binding)
            .await?;
        Ok(())
    }

    async fn delete(&self, name: &str) -> Result<()> {
        self.api.delete(name, &DeleteParams::default()).await?;
        Ok(())
    }
}
