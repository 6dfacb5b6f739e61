//! Configuration source
//!
//! Declared bindings live in ConfigMaps carrying the [`BINDING_ANNOTATION`]
//! marker. Unmarked ConfigMaps are ignored before parsing ever happens.

mod parse;

use std::time::Duration;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::ConfigMap;
use kube::runtime::reflector::Store;
use tracing::{debug, info};

#[cfg(test)]
use mockall::automock;

pub use parse::{
    parse_config_map, parse_manifest, source_name, BINDINGS_KEY, DEFAULT_USER_TYPE_KEY,
};

use crate::retry::{retry_with_backoff, RetryConfig};
use crate::{Error, Result};

/// Annotation that puts a ConfigMap in scope
pub const BINDING_ANNOTATION: &str = "rbac-sync.dev/binding";

/// Whether the ConfigMap carries the binding marker
pub fn has_binding_marker(cm: &ConfigMap) -> bool {
    cm.metadata
        .annotations
        .as_ref()
        .is_some_and(|a| a.contains_key(BINDING_ANNOTATION))
}

/// Source of the ConfigMaps declaring bindings
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ConfigSource: Send + Sync {
    /// All marked ConfigMaps, ordered by `namespace/name`
    async fn list_configs(&self) -> Result<Vec<ConfigMap>>;
}

/// ConfigSource backed by a reflector cache
pub struct ConfigMapSource {
    store: Store<ConfigMap>,
}

impl ConfigMapSource {
    /// Wrap a reflector store; the caller drives the matching watch stream
    pub fn new(store: Store<ConfigMap>) -> Self {
        Self { store }
    }

    /// Wait for the cache's initial list, giving up after `config.max_attempts`
    ///
    /// Exhaustion is [`Error::CacheSync`], which is fatal.
    pub async fn wait_until_ready(
        &self,
        config: &RetryConfig,
        attempt_timeout: Duration,
    ) -> Result<()> {
        info!("waiting for ConfigMap cache to sync");
        let store = &self.store;
        retry_with_backoff(config, "configmap cache sync", move || async move {
            match tokio::time::timeout(attempt_timeout, store.wait_until_ready()).await {
                Ok(Ok(())) => Ok(()),
                Ok(Err(e)) => Err(Error::cache_sync(format!("ConfigMap watch stopped: {e}"))),
                Err(_) => Err(Error::cache_sync(format!(
                    "ConfigMap cache not ready after {attempt_timeout:?}"
                ))),
            }
        })
        .await?;
        info!("ConfigMap cache synced");
        Ok(())
    }
}

#[async_trait]
impl ConfigSource for ConfigMapSource {
    async fn list_configs(&self) -> Result<Vec<ConfigMap>> {
        let mut configs: Vec<ConfigMap> = self
            .store
            .state()
            .into_iter()
            .filter(|cm| has_binding_marker(cm))
            .map(|cm| (*cm).clone())
            .collect();
        configs.sort_by_key(source_name);
        debug!(count = configs.len(), "listed binding ConfigMaps");
        Ok(configs)
    }
}
