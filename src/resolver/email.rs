//! Worker for email identifiers
//!
//! Each email is first looked up to its sub-account id, one paced call per
//! email, then the ids go through the same batched describe call as the
//! sub-account id worker. Lookups and describes share one pacer.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tracing::warn;

use super::pacing::{describe_in_batches, Pacer};
use super::{Resolution, ResolveWorker};
use crate::binding::EMAIL_TYPE;
use crate::identity::IdentityService;

/// Resolves emails via sub-account id lookup
pub struct EmailWorker {
    service: Arc<dyn IdentityService>,
    cluster_id: String,
    pacer: Mutex<Pacer>,
}

impl EmailWorker {
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
impl ResolveWorker for EmailWorker {
    fn value_type(&self) -> &str {
        EMAIL_TYPE
    }

    async fn resolve(&self, identifiers: Vec<String>) -> Resolution {
        let mut pacer = self.pacer.lock().await;
        let mut errors = Vec::new();

        // (slot, sub-account id) for every email that was found
        let mut found: Vec<(usize, String)> = Vec::with_capacity(identifiers.len());
        for (slot, email) in identifiers.iter().enumerate() {
            pacer.wait().await;
            match self.service.lookup_sub_account_id(email).await {
                Ok(id) => found.push((slot, id)),
                Err(e) => {
                    warn!(%email, error = %e, "sub-account lookup failed, keeping raw value");
                    errors.push(e);
                }
            }
        }

        let ids: Vec<String> = found.iter().map(|(_, id)| id.clone()).collect();
        let (resolved, describe_errors) =
            describe_in_batches(self.service.as_ref(), &self.cluster_id, &ids, &mut pacer).await;
        errors.extend(describe_errors);

        let mut names = identifiers;
        for ((slot, _), name) in found.into_iter().zip(resolved) {
            if let Some(name) = name {
                names[slot] = name;
            }
        }
        Resolution { names, errors }
    }
}
