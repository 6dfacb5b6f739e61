//! Worker for raw sub-account ids

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Mutex;

use super::pacing::{describe_in_batches, Pacer};
use super::{Resolution, ResolveWorker};
use crate::binding::SUB_ACCOUNT_ID_TYPE;
use crate::identity::IdentityService;

/// Resolves sub-account ids directly with one describe call per batch
pub struct SubAccountIdWorker {
    service: Arc<dyn IdentityService>,
    cluster_id: String,
    pacer: Mutex<Pacer>,
}

impl SubAccountIdWorker {
    /// Create a worker bound to one cluster, paced at `requests_per_second`
    pub fn new(
        service: Arc<dyn IdentityService>,
        cluster_id: impl Into<String>,
        requests_per_second: u32,
    ) -> Self {
        Self {
            service,
            cluster_id: cluster_id.into(),
            pacer: Mutex::new(Pacer::new(requests_per_second)),
        }
    }
}

#[async_trait]
impl ResolveWorker for SubAccountIdWorker {
    fn value_type(&self) -> &str {
        SUB_ACCOUNT_ID_TYPE
    }

    async fn resolve(&self, identifiers: Vec<String>) -> Resolution {
        let mut pacer = self.pacer.lock().await;
        let (resolved, errors) = describe_in_batches(
            self.service.as_ref(),
            &self.cluster_id,
            &identifiers,
            &mut pacer,
        )
        .await;

        let names = identifiers
            .into_iter()
            .zip(resolved)
            .map(|(raw, name)| name.unwrap_or(raw))
            .collect();
        Resolution { names, errors }
    }
}
