use std::time::Instant;

use strata_core::{
    ApplyOutcome, ApplyRequest, Context, DeleteOutcome, Event, GenericObject, GenericObjectList, ListFilter, ObjectKey,
    StrataResult,
};
use strata_schema::KindSchema;
use strata_store::ObjectStore;
use tokio::sync::mpsc;
use tracing::{debug, info};

use crate::{queue_cap, CancelHandle, StrataApi, StreamHandle};

/// In-process implementation that calls the store directly.
#[derive(Clone)]
pub struct InProcApi {
    store: ObjectStore,
}

impl InProcApi {
    pub fn new(store: ObjectStore) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &ObjectStore {
        &self.store
    }
}

#[async_trait::async_trait]
impl StrataApi for InProcApi {
    async fn get(&self, ctx: &Context, key: &ObjectKey) -> StrataResult<GenericObject> {
        let obj = self.store.get(ctx, key)?;
        debug!(key = %key, revision = ?obj.revision(), "api: get ok");
        Ok(obj)
    }

    async fn list(&self, ctx: &Context, filter: &ListFilter) -> StrataResult<GenericObjectList> {
        let t0 = Instant::now();
        let list = self.store.list(ctx, filter)?;
        debug!(filter = %filter.key, items = list.len(), took_ms = %t0.elapsed().as_millis(), "api: list ok");
        Ok(list)
    }

    async fn apply(&self, ctx: &Context, req: ApplyRequest) -> StrataResult<ApplyOutcome> {
        self.store.apply(ctx, req).await
    }

    async fn delete(&self, ctx: &Context, key: &ObjectKey) -> StrataResult<DeleteOutcome> {
        self.store.delete(ctx, key).await
    }

    async fn watch(&self, ctx: &Context, filter: ObjectKey) -> StrataResult<StreamHandle<Event>> {
        filter.validate_filter()?;
        info!(filter = %filter, "api: watch start");
        let (tx, rx) = mpsc::channel::<Event>(queue_cap());
        let mut sub = self.store.subscribe(filter.clone());
        let token = ctx.token().clone();
        let task = tokio::spawn(async move {
            loop {
                let ev = tokio::select! {
                    _ = token.cancelled() => break,
                    ev = sub.recv() => ev,
                };
                let Some(ev) = ev else { break };
                if tx.send(ev).await.is_err() {
                    break;
                }
            }
            info!(filter = %filter, "api: watch ended");
        });
        Ok(StreamHandle { rx, cancel: CancelHandle::new(task) })
    }

    async fn kinds(&self, ctx: &Context) -> StrataResult<Vec<KindSchema>> {
        ctx.check()?;
        Ok(self.store.config().schemas.kinds())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::time::Duration;
    use strata_core::EventOperation;
    use strata_store::StoreConfig;

    fn key() -> ObjectKey {
        ObjectKey::new("g", "v1", "Widget", "t1", "w")
    }

    fn payload() -> serde_json::Value {
        json!({"apiVersion": "g/v1", "kind": "Widget", "metadata": {"name": "w", "account": "t1"}, "spec": {"a": 1}})
    }

    #[tokio::test]
    async fn watch_streams_until_cancelled() {
        let api = InProcApi::new(ObjectStore::new(StoreConfig::default()));
        let ctx = Context::background();
        let mut handle = api.watch(&ctx, ObjectKey::new("g", "", "Widget", "t1", "")).await.unwrap();
        api.apply(&ctx, ApplyRequest::new(key(), "m", payload())).await.unwrap();
        let ev = tokio::time::timeout(Duration::from_secs(1), handle.rx.recv()).await.unwrap().unwrap();
        assert_eq!(ev.operation, EventOperation::Create);

        ctx.cancel();
        let end = tokio::time::timeout(Duration::from_secs(1), handle.rx.recv()).await.unwrap();
        assert!(end.is_none());
    }

    #[tokio::test]
    async fn watch_rejects_malformed_filter() {
        let api = InProcApi::new(ObjectStore::new(StoreConfig::default()));
        let bad = ObjectKey::new("g.x", "", "", "", "");
        assert!(api.watch(&Context::background(), bad).await.is_err());
    }
}
