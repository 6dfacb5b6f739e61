//! Identity resolution
//!
//! [`Resolver`] takes a mixed list of [`UserIdentifier`]s, groups them by
//! identifier type, and runs one task per type against the matching
//! [`ResolveWorker`]. Results are written back into the original slots.
//!
//! Resolution never changes the number or order of identifiers. An identifier
//! that could not be resolved keeps its raw value; a subject name is never
//! empty.

mod email;
mod pacing;
mod sub_account;

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use futures::future::join_all;
use tracing::{debug, instrument, warn};

pub use email::EmailWorker;
pub use pacing::Pacer;
pub use sub_account::SubAccountIdWorker;

use crate::binding::UserIdentifier;
use crate::identity::IdentityService;
use crate::{Error, Result};

/// Output of one worker call
///
/// `names[i]` is the resolved name of input `i`, or the raw input when it could
/// not be resolved. `errors` lists the failed calls.
#[derive(Debug, Default)]
pub struct Resolution {
    /// One entry per input identifier, same order
    pub names: Vec<String>,
    /// Failures encountered while resolving
    pub errors: Vec<Error>,
}

impl Resolution {
    /// Resolution that keeps every input unchanged
    pub fn unresolved(identifiers: Vec<String>) -> Self {
        Self {
            names: identifiers,
            errors: Vec::new(),
        }
    }
}

/// Resolves identifiers of a single type to canonical names
#[async_trait]
pub trait ResolveWorker: Send + Sync {
    /// Identifier type this worker handles (the `type` field of a user entry)
    fn value_type(&self) -> &str;

    /// Resolve `identifiers`, returning exactly one name per input in input order
    async fn resolve(&self, identifiers: Vec<String>) -> Resolution;
}

/// Dispatches identifiers to the worker registered for their type
#[derive(Default)]
pub struct Resolver {
    workers: HashMap<String, Arc<dyn ResolveWorker>>,
}

impl Resolver {
    /// Create a resolver with no workers
    pub fn new() -> Self {
        Self::default()
    }

    /// Resolver with the sub-account id and email workers registered
    pub fn with_default_workers(
        service: Arc<dyn IdentityService>,
        cluster_id: &str,
        requests_per_second: u32,
    ) -> Self {
        let mut resolver = Self::new();
        resolver.add_worker(Arc::new(SubAccountIdWorker::new(
            service.clone(),
            cluster_id,
            requests_per_second,
        )));
        resolver.add_worker(Arc::new(EmailWorker::new(
            service,
            cluster_id,
            requests_per_second,
        )));
        resolver
    }

    /// Register a worker under its type, replacing any previous worker for that type
    pub fn add_worker(&mut self, worker: Arc<dyn ResolveWorker>) {
        let value_type = worker.value_type().to_string();
        if self.workers.insert(value_type.clone(), worker).is_some() {
            debug!(%value_type, "replaced resolver worker");
        }
    }

    /// Resolve every identifier in place
    ///
    /// All worker tasks run to completion and write back their results, even
    /// when another type fails. Any failure is reported as one
    /// [`Error::Resolution`] listing all of them.
    #[instrument(skip_all, fields(users = users.len()))]
    pub async fn resolve_all(&self, users: &mut [UserIdentifier]) -> Result<()> {
        let mut slots_by_type = Vec::new();
        let mut tasks = Vec::new();

        for (value_type, group) in partition_by_type(users) {
            let Some(worker) = self.workers.get(&value_type).cloned() else {
                debug!(%value_type, count = group.slots.len(), "no worker for type, leaving unresolved");
                continue;
            };
            tasks.push(tokio::spawn(async move { worker.resolve(group.values).await }));
            slots_by_type.push((value_type, group.slots));
        }

        let mut failures = Vec::new();
        for ((value_type, slots), joined) in slots_by_type.into_iter().zip(join_all(tasks).await) {
            let resolution = match joined {
                Ok(resolution) => resolution,
                Err(e) => {
                    failures.push(format!("{value_type}: worker task failed: {e}"));
                    continue;
                }
            };

            if resolution.names.len() != slots.len() {
                failures.push(format!(
                    "{value_type}: worker returned {} names for {} identifiers",
                    resolution.names.len(),
                    slots.len()
                ));
                continue;
            }

            for (slot, name) in slots.into_iter().zip(resolution.names) {
                if !name.is_empty() {
                    users[slot].value = name;
                }
            }
            failures.extend(
                resolution
                    .errors
                    .iter()
                    .map(|e| format!("{value_type}: {e}")),
            );
        }

        if failures.is_empty() {
            Ok(())
        } else {
            warn!(failures = failures.len(), "identity resolution incomplete");
            Err(Error::Resolution(failures))
        }
    }
}

struct TypeGroup {
    slots: Vec<usize>,
    values: Vec<String>,
}

/// Group identifier values by type, remembering each value's slot
fn partition_by_type(users: &[UserIdentifier]) -> BTreeMap<String, TypeGroup> {
    let mut groups: BTreeMap<String, TypeGroup> = BTreeMap::new();
    for (slot, user) in users.iter().enumerate() {
        let group = groups
            .entry(user.value_type.clone())
            .or_insert_with(|| TypeGroup {
                slots: Vec::new(),
                values: Vec::new(),
            });
        group.slots.push(slot);
        group.values.push(user.value.clone());
    }
    groups
}
