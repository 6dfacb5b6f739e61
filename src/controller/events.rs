//! Which ConfigMap watch events warrant a convergence pass

use std::collections::HashSet;

use k8s_openapi::api::core::v1::ConfigMap;
use kube::runtime::watcher::Event;
use tracing::{debug, warn};

use crate::source::{has_binding_marker, source_name};

/// Tracks marked ConfigMaps across watch events
///
/// Remembering which ConfigMaps were marked lets an update that strips the
/// marker still trigger a pass, so the bindings it declared get deleted.
#[derive(Debug, Default)]
pub struct EventFilter {
    marked: HashSet<String>,
    relisting: Option<HashSet<String>>,
}

impl EventFilter {
    /// Record the event and report whether it should trigger a pass
    pub fn observe(&mut self, event: &Event<ConfigMap>) -> bool {
        match event {
            Event::Init => {
                self.relisting = Some(HashSet::new());
                false
            }
            Event::InitApply(cm) => {
                if has_binding_marker(cm) {
                    self.relisting
                        .get_or_insert_with(HashSet::new)
                        .insert(source_name(cm));
                }
                false
            }
            Event::InitDone => {
                // Deletes may have been missed while the watch was down
                self.marked = self.relisting.take().unwrap_or_default();
                debug!(marked = self.marked.len(), "ConfigMap watch (re)listed");
                true
            }
            Event::Apply(cm) => {
                let key = source_name(cm);
                if has_binding_marker(cm) {
                    self.marked.insert(key);
                    true
                } else if self.marked.remove(&key) {
                    warn!(configmap = %key, "binding marker removed, its bindings will be deleted");
                    true
                } else {
                    false
                }
            }
            Event::Delete(cm) => {
                let was_marked = self.marked.remove(&source_name(cm));
                was_marked || has_binding_marker(cm)
            }
        }
    }

    /// Number of marked ConfigMaps currently known
    pub(crate) fn marked_count(&self) -> usize {
        self.marked.len()
    }
}
