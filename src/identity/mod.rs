//! Identity service abstraction
//!
//! The resolver workers only ever talk to [`IdentityService`]. Production uses
//! [`TencentCloudClient`]; tests use the generated `MockIdentityService`.
//!
//! Clients are owned by a [`ClientRegistry`] that is built once at startup and
//! handed to whoever needs a client. There is no process-wide client cache.

mod credential;
mod tencent;

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;

#[cfg(test)]
use mockall::automock;

pub use credential::{Credential, CredentialProvider, CvmRole, CVM_METADATA_ENDPOINT};
pub use tencent::{TencentCloudClient, KNOWN_REGIONS};

use crate::{Error, Result};

/// Upper bound on sub-account ids per `describe_common_names` call
pub const COMMON_NAME_BATCH_SIZE: usize = 50;

/// Canonical principal name of one sub-account on one cluster
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CommonName {
    /// Sub-account id the name belongs to
    pub sub_account_id: String,
    /// Principal name to use as the binding subject
    pub name: String,
}

/// Calls the resolver workers need from the identity service
#[cfg_attr(test, automock)]
#[async_trait]
pub trait IdentityService: Send + Sync {
    /// Describe the cluster principal names for up to [`COMMON_NAME_BATCH_SIZE`] sub-account ids
    ///
    /// Entries may come back in any order and ids unknown to the service may
    /// be missing from the result.
    async fn describe_common_names(
        &self,
        cluster_id: &str,
        sub_account_ids: &[String],
    ) -> Result<Vec<CommonName>>;

    /// Look up the sub-account id of a user by name (email)
    async fn lookup_sub_account_id(&self, user_name: &str) -> Result<String>;
}

/// Identity clients keyed by region
///
/// Built once with every region the process needs, then shared read-only.
#[derive(Default)]
pub struct ClientRegistry {
    clients: HashMap<String, Arc<TencentCloudClient>>,
}

impl ClientRegistry {
    /// Build a registry with one client per region
    ///
    /// Every client signs with credentials from the same provider.
    pub fn new(credentials: CredentialProvider, regions: &[&str]) -> Result<Self> {
        let credentials = Arc::new(credentials);
        let mut clients = HashMap::new();
        for region in regions {
            let client = TencentCloudClient::new(credentials.clone(), region)?;
            clients.insert(region.to_string(), Arc::new(client));
        }
        Ok(Self { clients })
    }

    /// Client for a region that was registered at construction
    pub fn client(&self, region: &str) -> Result<Arc<TencentCloudClient>> {
        self.clients
            .get(region)
            .cloned()
            .ok_or_else(|| Error::validation(format!("no identity client for region {region}")))
    }

    /// Regions with a client
    pub fn regions(&self) -> impl Iterator<Item = &str> {
        self.clients.keys().map(String::as_str)
    }
}
