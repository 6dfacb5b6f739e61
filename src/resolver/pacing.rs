//! Request pacing and batched common-name lookups shared by the workers

use std::collections::HashMap;
use std::time::Duration;

use tokio::time::Instant;
use tracing::warn;

use crate::identity::{IdentityService, COMMON_NAME_BATCH_SIZE};
use crate::Error;

/// Spaces calls at least `1 / requests_per_second` apart
///
/// Blocking pacing, not a token bucket: idle time earns no credit, so there are
/// never two calls closer together than the interval.
#[derive(Debug)]
pub struct Pacer {
    interval: Duration,
    last_call: Option<Instant>,
}

impl Pacer {
    /// Pacer for the given rate; a rate of zero is treated as one per second
    pub fn new(requests_per_second: u32) -> Self {
        Self {
            interval: Duration::from_secs(1) / requests_per_second.max(1),
            last_call: None,
        }
    }

    /// Minimum spacing between calls
    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Wait until the next call is allowed, then record it
    pub async fn wait(&mut self) {
        if let Some(last) = self.last_call {
            tokio::time::sleep_until(last + self.interval).await;
        }
        self.last_call = Some(Instant::now());
    }
}

/// Look up common names for `ids` in batches of [`COMMON_NAME_BATCH_SIZE`]
///
/// Returns one entry per id: `Some(name)` when the service returned one,
/// `None` when the id was missing from the response or its batch failed.
pub(crate) async fn describe_in_batches(
    service: &dyn IdentityService,
    cluster_id: &str,
    ids: &[String],
    pacer: &mut Pacer,
) -> (Vec<Option<String>>, Vec<Error>) {
    let mut names = Vec::with_capacity(ids.len());
    let mut errors = Vec::new();

    for batch in ids.chunks(COMMON_NAME_BATCH_SIZE) {
        pacer.wait().await;
        match service.describe_common_names(cluster_id, batch).await {
            Ok(common_names) => {
                let by_id: HashMap<_, _> = common_names
                    .into_iter()
                    .map(|c| (c.sub_account_id, c.name))
                    .collect();
                names.extend(batch.iter().map(|id| by_id.get(id).cloned()));
            }
            Err(e) => {
                warn!(batch = batch.len(), error = %e, "common name lookup failed, keeping raw values");
                names.extend(batch.iter().map(|_| None));
                errors.push(e);
            }
        }
    }

    (names, errors)
}
