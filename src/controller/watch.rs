//! ConfigMap watch and controller startup against a live cluster

use std::sync::Arc;
use std::time::Duration;

use futures::{Stream, StreamExt};
use k8s_openapi::api::core::v1::ConfigMap;
use kube::runtime::watcher::{self, Event};
use kube::runtime::{reflector, WatchStreamExt};
use kube::{Api, Client};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::events::EventFilter;
use super::Controller;
use crate::coalescer::{Coalescer, Notifier};
use crate::config::ControllerConfig;
use crate::reconciler::{KubeBindingStore, Reconciler};
use crate::resolver::Resolver;
use crate::retry::RetryConfig;
use crate::source::ConfigMapSource;
use crate::Result;

/// How long one cache readiness attempt may take
const CACHE_SYNC_TIMEOUT: Duration = Duration::from_secs(30);

/// Watch ConfigMaps and run the controller until `shutdown` or a fatal error
///
/// Fails fatally when the ConfigMap cache never syncs.
pub async fn run_cluster(
    client: Client,
    config: &ControllerConfig,
    resolver: Resolver,
    shutdown: CancellationToken,
) -> Result<()> {
    let api: Api<ConfigMap> = match &config.namespace {
        Some(ns) => Api::namespaced(client.clone(), ns),
        None => Api::all(client.clone()),
    };
    let (reader, writer) = reflector::store();
    let stream =
        reflector(writer, watcher::watcher(api, watcher::Config::default())).default_backoff();

    let (coalescer, notifier) = Coalescer::new(config.debounce);
    let tasks = shutdown.child_token();
    let watch = tokio::spawn(watch_config_maps(stream, notifier.clone(), tasks.clone()));

    let source = ConfigMapSource::new(reader);
    let readiness = RetryConfig::with_max_attempts(config.cache_sync_attempts);
    if let Err(e) = source.wait_until_ready(&readiness, CACHE_SYNC_TIMEOUT).await {
        stop_watch(&tasks, watch).await;
        return Err(e);
    }

    let controller = Controller::new(
        Arc::new(source),
        resolver,
        Reconciler::new(Arc::new(KubeBindingStore::new(client))),
    );
    let result = controller
        .run(coalescer, notifier, config.resync_interval, tasks.clone())
        .await;

    stop_watch(&tasks, watch).await;
    result
}

/// Cancel the watch task and wait for it, logging a panic instead of raising it
async fn stop_watch(tasks: &CancellationToken, watch: JoinHandle<()>) {
    tasks.cancel();
    if let Err(e) = watch.await {
        warn!(error = %e, "ConfigMap watch task ended abnormally");
    }
}

/// Feed watch events into the coalescer until cancelled
async fn watch_config_maps<S>(stream: S, notifier: Notifier, shutdown: CancellationToken)
where
    S: Stream<Item = std::result::Result<Event<ConfigMap>, watcher::Error>> + Send,
{
    let mut stream = std::pin::pin!(stream);
    let mut filter = EventFilter::default();
    info!("ConfigMap watch started");

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            event = stream.next() => match event {
                Some(Ok(event)) => {
                    if filter.observe(&event) {
                        debug!(
                            marked = filter.marked_count(),
                            "binding ConfigMap changed, requesting pass"
                        );
                        notifier.notify();
                    }
                }
                Some(Err(e)) => warn!(error = %e, "ConfigMap watch error, will retry"),
                None => {
                    warn!("ConfigMap watch stream ended");
                    break;
                }
            },
        }
    }
}
