use metrics::counter;
use strata_core::{Context, Event, EventOperation, ObjectKey};
use strata_watch::Watcher;
use tracing::debug;

use crate::store::ObjectStore;

/// Cascading deletion: when an object is purged, every object whose owner
/// references name it gets a delete request. Children with finalizers go
/// through their own lifecycle.
pub struct GarbageCollector {
    watcher: Watcher,
}

impl GarbageCollector {
    pub fn start(store: &ObjectStore) -> Self {
        let s = store.clone();
        let watcher = store.watch(ObjectKey::default(), move |ev: Event| {
            let s = s.clone();
            async move {
                if ev.operation != EventOperation::Purge {
                    return Ok(());
                }
                let ctx = Context::background();
                for child in s.owned_by(&ev.key) {
                    match s.delete(&ctx, &child).await {
                        Ok(outcome) => {
                            counter!("store_gc_deletes_total", 1u64);
                            debug!(owner = %ev.key, child = %child, outcome = outcome.as_str(), "gc: cascaded delete");
                        }
                        Err(e) if e.is_not_found() => {}
                        Err(e) => return Err(e),
                    }
                }
                Ok(())
            }
        });
        Self { watcher }
    }

    pub async fn stop(&self) {
        self.watcher.stop().await;
    }
}
