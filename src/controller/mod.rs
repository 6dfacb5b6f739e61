//! Convergence pass pipeline and its wiring to a live cluster
//!
//! One pass reads every marked ConfigMap, parses the declared bindings,
//! resolves the users' identifiers to canonical principal names, and converges
//! the managed ClusterRoleBindings. Passes are triggered by ConfigMap watch
//! events and a periodic resync, debounced by the [`Coalescer`].

mod events;
mod watch;

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::ConfigMap;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{info, instrument, warn};

pub use events::EventFilter;
pub use watch::run_cluster;

use crate::binding::DesiredBinding;
use crate::coalescer::{spawn_resync, Coalescer, Converge, Notifier};
use crate::reconciler::{ReconcileSummary, Reconciler};
use crate::resolver::Resolver;
use crate::source::{parse_config_map, ConfigSource};
use crate::Result;

/// Runs convergence passes
pub struct Controller {
    source: Arc<dyn ConfigSource>,
    resolver: Resolver,
    reconciler: Reconciler,
    pass_guard: Mutex<()>,
}

impl Controller {
    /// Create a controller from its collaborators
    pub fn new(source: Arc<dyn ConfigSource>, resolver: Resolver, reconciler: Reconciler) -> Self {
        Self {
            source,
            resolver,
            reconciler,
            pass_guard: Mutex::new(()),
        }
    }

    /// Run one convergence pass
    ///
    /// A ConfigMap that fails to parse abandons the pass before anything is
    /// applied. Identifiers that fail to resolve are applied as their raw
    /// values.
    #[instrument(skip(self))]
    pub async fn sync_all(&self) -> Result<ReconcileSummary> {
        let _pass = self.pass_guard.lock().await;

        let configs = self.source.list_configs().await?;
        let mut desired = collect_desired(&configs)?;
        self.resolve(&mut desired).await;

        let summary = self.reconciler.upsert(&desired).await?;
        info!(
            bindings = desired.len(),
            added = summary.added,
            updated = summary.updated,
            deleted = summary.deleted,
            "convergence pass complete"
        );
        Ok(summary)
    }

    /// Resolve every binding's users in one dispatch
    async fn resolve(&self, desired: &mut [DesiredBinding]) {
        let mut users: Vec<_> = desired
            .iter()
            .flat_map(|b| b.users.iter().cloned())
            .collect();
        if users.is_empty() {
            return;
        }

        if let Err(e) = self.resolver.resolve_all(&mut users).await {
            warn!(error = %e, "some identities were not resolved, applying raw values");
        }

        let slots = desired.iter_mut().flat_map(|b| b.users.iter_mut());
        for (slot, user) in slots.zip(users) {
            *slot = user;
        }
    }

    /// Run passes on every trigger until `shutdown` is cancelled
    ///
    /// Also drives the periodic resync through `notifier`. Returns early with
    /// the error of a pass that failed fatally.
    pub async fn run(
        &self,
        coalescer: Coalescer,
        notifier: Notifier,
        resync_interval: Duration,
        shutdown: CancellationToken,
    ) -> Result<()> {
        let ticks = shutdown.child_token();
        let ticker = spawn_resync(notifier, resync_interval, ticks.clone());
        info!(?resync_interval, "controller running");

        let result = coalescer.run(self, shutdown).await;

        ticks.cancel();
        if let Err(e) = ticker.await {
            warn!(error = %e, "resync task ended abnormally");
        }
        result
    }
}

#[async_trait]
impl Converge for Controller {
    async fn converge(&self) -> Result<()> {
        self.sync_all().await.map(|_| ())
    }
}

/// Parse all ConfigMaps into one set of bindings keyed by name
///
/// ConfigMaps arrive ordered by `namespace/name`. A binding name declared more
/// than once keeps the last declaration.
fn collect_desired(configs: &[ConfigMap]) -> Result<Vec<DesiredBinding>> {
    let mut by_name: BTreeMap<String, DesiredBinding> = BTreeMap::new();
    for cm in configs {
        for binding in parse_config_map(cm)? {
            if let Some(previous) = by_name.get(&binding.binding_name) {
                warn!(
                    binding = %binding.binding_name,
                    previous = %previous.source,
                    winner = %binding.source,
                    "binding declared more than once, last declaration wins"
                );
            }
            by_name.insert(binding.binding_name.clone(), binding);
        }
    }
    Ok(by_name.into_values().collect())
}
