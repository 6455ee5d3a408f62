use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Instant;

use anyhow::{anyhow, Context as _};
use metrics::{counter, histogram};
use rustc_hash::FxHashMap;
use serde_json::Value as Json;
use strata_apply::merge_apply;
use strata_core::{
    key_from_payload, ApplyOutcome, ApplyRequest, Context, DeleteOutcome, Event, EventOperation, GenericObject,
    GenericObjectList, ListFilter, MetaOnlyObject, ObjectKey, OwnerReference, StrataError, StrataResult, Time,
};
use strata_persist::{Backend, Record};
use strata_watch::{Distributor, EventHandler, Subscription, Watcher};
use tokio::sync::OwnedMutexGuard;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::StoreConfig;
use crate::validate::Validators;

#[derive(Clone)]
struct Stored {
    seq: u64,
    object: Arc<Json>,
}

#[derive(Default)]
struct Committed {
    by_key: FxHashMap<ObjectKey, Stored>,
    /// Creation sequence to key; drives list order.
    order: BTreeMap<u64, ObjectKey>,
}

/// Per-key mutation lock. The flag is set once the key is purged and its
/// slot dropped from the index; a waiter that wakes on a retired slot retries.
type KeySlot = Arc<tokio::sync::Mutex<bool>>;

/// Declarative object store. Cheap to clone; clones share state.
#[derive(Clone)]
pub struct ObjectStore {
    inner: Arc<Inner>,
}

struct Inner {
    config: StoreConfig,
    locks: Mutex<FxHashMap<ObjectKey, KeySlot>>,
    committed: RwLock<Committed>,
    revision: AtomicU64,
    seq: AtomicU64,
    events: Distributor,
    backend: Option<Arc<dyn Backend>>,
}

impl ObjectStore {
    /// In-memory store.
    pub fn new(config: StoreConfig) -> Self {
        Self::build(config, None)
    }

    /// Store writing through to `backend`, reloaded from it first.
    pub fn with_backend(config: StoreConfig, backend: Arc<dyn Backend>) -> anyhow::Result<Self> {
        let t0 = Instant::now();
        let records = backend.load_all().context("loading objects from backend")?;
        let store = Self::build(config, Some(backend));
        let (mut max_rev, mut max_seq) = (0u64, 0u64);
        {
            let mut c = store.committed_mut();
            for rec in records {
                let object: Json =
                    serde_json::from_slice(&rec.data).with_context(|| format!("decoding stored object {}", rec.key))?;
                let key = key_from_payload(&object).map_err(|e| anyhow!("stored object {}: {e}", rec.key))?;
                max_rev = max_rev.max(rec.revision);
                max_seq = max_seq.max(rec.seq);
                c.order.insert(rec.seq, key.clone());
                c.by_key.insert(key, Stored { seq: rec.seq, object: Arc::new(object) });
            }
        }
        store.inner.revision.store(max_rev, Ordering::SeqCst);
        store.inner.seq.store(max_seq, Ordering::SeqCst);
        info!(objects = store.len(), revision = max_rev, took_ms = %t0.elapsed().as_millis(), "store: reloaded from backend");
        Ok(store)
    }

    fn build(config: StoreConfig, backend: Option<Arc<dyn Backend>>) -> Self {
        let events = Distributor::new(config.watch.clone());
        Self {
            inner: Arc::new(Inner {
                config,
                locks: Mutex::new(FxHashMap::default()),
                committed: RwLock::new(Committed::default()),
                revision: AtomicU64::new(0),
                seq: AtomicU64::new(0),
                events,
                backend,
            }),
        }
    }

    pub fn config(&self) -> &StoreConfig {
        &self.inner.config
    }

    pub fn validators(&self) -> &Validators {
        &self.inner.config.validators
    }

    pub fn events(&self) -> &Distributor {
        &self.inner.events
    }

    /// Revision of the most recent commit.
    pub fn revision(&self) -> u64 {
        self.inner.revision.load(Ordering::SeqCst)
    }

    pub fn len(&self) -> usize {
        self.committed().by_key.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn get(&self, ctx: &Context, key: &ObjectKey) -> StrataResult<GenericObject> {
        ctx.check()?;
        key.validate_strict()?;
        match self.stored(key) {
            Some(s) => Ok(GenericObject { key: key.clone(), raw: (*s.object).clone() }),
            None => Err(StrataError::NotFound(format!("object {key} not found"))),
        }
    }

    /// Objects matching `filter`, in creation order.
    pub fn list(&self, ctx: &Context, filter: &ListFilter) -> StrataResult<GenericObjectList> {
        ctx.check()?;
        filter.key.validate_filter()?;
        let c = self.committed();
        let items = c
            .order
            .values()
            .filter(|k| filter.matches(k))
            .filter_map(|k| c.by_key.get(k).map(|s| GenericObject { key: k.clone(), raw: (*s.object).clone() }))
            .collect();
        Ok(GenericObjectList { items })
    }

    pub async fn apply(&self, ctx: &Context, req: ApplyRequest) -> StrataResult<ApplyOutcome> {
        let t0 = Instant::now();
        let key = req.key.clone();
        let manager = req.manager.clone();
        let res = self.apply_inner(ctx, req).await;
        let result = match &res {
            Ok(o) => o.as_str(),
            Err(e) => e.code(),
        };
        counter!("store_apply_total", 1u64, "result" => result);
        histogram!("store_apply_latency_ms", t0.elapsed().as_secs_f64() * 1000.0);
        match &res {
            Ok(outcome) => {
                info!(key = %key, manager = %manager, outcome = outcome.as_str(), took_ms = %t0.elapsed().as_millis(), "store: apply ok")
            }
            Err(e) => warn!(key = %key, manager = %manager, error = %e, "store: apply failed"),
        }
        res
    }

    async fn apply_inner(&self, ctx: &Context, req: ApplyRequest) -> StrataResult<ApplyOutcome> {
        ctx.check()?;
        let ApplyRequest { key, manager, payload, force } = req;
        key.validate_strict()?;
        if manager.is_empty() {
            return Err(StrataError::Validation("field manager is required".into()));
        }
        if !self.inner.config.is_known_manager(&manager) {
            return Err(StrataError::Validation(format!("unknown field manager {manager:?}")));
        }
        let limits = &self.inner.config.limits;
        let size = serde_json::to_vec(&payload)
            .map_err(|e| StrataError::Internal(format!("encoding payload: {e}")))?
            .len();
        limits.check_bytes(size)?;
        limits.check_value(&payload)?;
        let payload_key = key_from_payload(&payload)?;
        if payload_key != key {
            return Err(StrataError::Validation(format!("payload addresses {payload_key} but request addresses {key}")));
        }

        let mut guard = ctx.run(async { Ok(self.lock_key(&key).await) }).await?;
        let res = self.apply_locked(ctx, &key, &manager, &payload, force);
        self.retire_if_gone(&key, &mut guard);
        res
    }

    /// Merge and commit. Runs entirely under the key lock, without awaiting,
    /// so a cancelled caller either commits fully or not at all.
    fn apply_locked(
        &self,
        ctx: &Context,
        key: &ObjectKey,
        manager: &str,
        payload: &Json,
        force: bool,
    ) -> StrataResult<ApplyOutcome> {
        let current = self.stored(key);
        let merged = match merge_apply(current.as_ref().map(|s| s.object.as_ref()), payload, manager, force) {
            Ok(m) => m,
            Err(e) => {
                if e.is_conflict() {
                    counter!("store_conflict_total", 1u64);
                }
                return Err(e);
            }
        };
        if merged.outcome == ApplyOutcome::Noop {
            return Ok(ApplyOutcome::Noop);
        }
        if !merged.transferred.is_empty() {
            info!(key = %key, manager, paths = merged.transferred.len(), "store: forced apply took ownership");
        }
        let mut object = merged.object;
        self.inner.config.schemas.validate(key, &object)?;
        self.inner.config.validators.check(key, current.as_ref().map(|s| s.object.as_ref()), &object)?;
        let meta = MetaOnlyObject::from_value(&object)?.metadata;

        ctx.check()?;
        let revision = self.next_revision();
        let (seq, created) = match &current {
            Some(s) => (s.seq, false),
            None => (self.inner.seq.fetch_add(1, Ordering::SeqCst) + 1, true),
        };
        stamp(&mut object, revision, created)?;

        if meta.is_deleting() && !meta.has_finalizers() {
            self.purge(key, revision)?;
            return Ok(ApplyOutcome::Updated);
        }
        let op = if created {
            EventOperation::Create
        } else if meta.is_deleting() {
            EventOperation::DeleteRequested
        } else {
            EventOperation::Update
        };
        self.commit(key, seq, revision, object, op)?;
        Ok(if created { ApplyOutcome::Created } else { ApplyOutcome::Updated })
    }

    /// Request deletion. Objects without finalizers are purged at once;
    /// otherwise a deletion timestamp is set and the object stays readable.
    pub async fn delete(&self, ctx: &Context, key: &ObjectKey) -> StrataResult<DeleteOutcome> {
        ctx.check()?;
        key.validate_strict()?;
        let mut guard = ctx.run(async { Ok(self.lock_key(key).await) }).await?;
        let res = self.delete_locked(ctx, key);
        self.retire_if_gone(key, &mut guard);
        match &res {
            Ok(outcome) => info!(key = %key, outcome = outcome.as_str(), "store: delete ok"),
            Err(e) if e.is_not_found() => debug!(key = %key, "store: delete of missing object"),
            Err(e) => warn!(key = %key, error = %e, "store: delete failed"),
        }
        res
    }

    fn delete_locked(&self, ctx: &Context, key: &ObjectKey) -> StrataResult<DeleteOutcome> {
        let current = self.stored(key).ok_or_else(|| StrataError::NotFound(format!("object {key} not found")))?;
        let meta = MetaOnlyObject::from_value(&current.object)?.metadata;
        if meta.is_deleting() {
            return Ok(DeleteOutcome::AlreadyDeleting);
        }
        ctx.check()?;
        let revision = self.next_revision();
        if !meta.has_finalizers() {
            self.purge(key, revision)?;
            return Ok(DeleteOutcome::Purged);
        }
        let mut object = (*current.object).clone();
        let ts = serde_json::to_value(Time::now()).map_err(|e| StrataError::Internal(format!("encoding time: {e}")))?;
        if let Some(m) = object.get_mut("metadata").and_then(Json::as_object_mut) {
            m.insert("deletionTimestamp".into(), ts);
            m.insert("revision".into(), Json::from(revision));
        }
        self.commit(key, current.seq, revision, object, EventOperation::DeleteRequested)?;
        Ok(DeleteOutcome::DeletionRequested)
    }

    pub fn subscribe(&self, filter: ObjectKey) -> Subscription {
        self.inner.events.subscribe(filter)
    }

    /// Start a watcher on committed events; see [`Distributor::start_watcher`].
    pub fn watch<H: EventHandler + 'static>(&self, filter: ObjectKey, handler: H) -> Watcher {
        self.inner.events.start_watcher(filter, handler)
    }

    /// Keys of objects whose owner references name `owner`.
    pub fn owned_by(&self, owner: &ObjectKey) -> Vec<ObjectKey> {
        let c = self.committed();
        c.order
            .values()
            .filter(|k| k.account == owner.account)
            .filter(|k| {
                c.by_key
                    .get(*k)
                    .and_then(|s| s.object.pointer("/metadata/ownerReferences"))
                    .and_then(|v| serde_json::from_value::<Vec<OwnerReference>>(v.clone()).ok())
                    .is_some_and(|refs| refs.iter().any(|r| r.is_owned_by(owner)))
            })
            .cloned()
            .collect()
    }

    fn commit(&self, key: &ObjectKey, seq: u64, revision: u64, object: Json, op: EventOperation) -> StrataResult<()> {
        if let Some(backend) = &self.inner.backend {
            let data = serde_json::to_vec(&object).map_err(|e| StrataError::Internal(format!("encoding {key}: {e}")))?;
            backend
                .put(&Record { key: key.to_string(), seq, revision, data })
                .map_err(|e| StrataError::Internal(format!("persisting {key}: {e:#}")))?;
        }
        let data = object.clone();
        {
            let mut c = self.committed_mut();
            c.order.insert(seq, key.clone());
            c.by_key.insert(key.clone(), Stored { seq, object: Arc::new(object) });
        }
        debug!(key = %key, revision, op = op.as_str(), "store: committed");
        self.inner.events.publish(Event { operation: op, key: key.clone(), revision, data: Some(data) });
        Ok(())
    }

    fn purge(&self, key: &ObjectKey, revision: u64) -> StrataResult<()> {
        if let Some(backend) = &self.inner.backend {
            backend
                .delete(&key.to_string())
                .map_err(|e| StrataError::Internal(format!("purging {key}: {e:#}")))?;
        }
        {
            let mut c = self.committed_mut();
            if let Some(s) = c.by_key.remove(key) {
                c.order.remove(&s.seq);
            }
        }
        counter!("store_purge_total", 1u64);
        info!(key = %key, revision, "store: purged");
        self.inner.events.publish(Event { operation: EventOperation::Purge, key: key.clone(), revision, data: None });
        Ok(())
    }

    async fn lock_key(&self, key: &ObjectKey) -> OwnedMutexGuard<bool> {
        loop {
            let slot = {
                let mut locks = self.locks();
                Arc::clone(locks.entry(key.clone()).or_default())
            };
            let guard = slot.lock_owned().await;
            if !*guard {
                return guard;
            }
        }
    }

    /// Drop the key's lock slot once no object lives under it.
    fn retire_if_gone(&self, key: &ObjectKey, guard: &mut OwnedMutexGuard<bool>) {
        if self.committed().by_key.contains_key(key) {
            return;
        }
        **guard = true;
        self.locks().remove(key);
    }

    fn next_revision(&self) -> u64 {
        self.inner.revision.fetch_add(1, Ordering::SeqCst) + 1
    }

    fn stored(&self, key: &ObjectKey) -> Option<Stored> {
        self.committed().by_key.get(key).cloned()
    }

    fn locks(&self) -> MutexGuard<'_, FxHashMap<ObjectKey, KeySlot>> {
        self.inner.locks.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn committed(&self) -> RwLockReadGuard<'_, Committed> {
        self.inner.committed.read().unwrap_or_else(|p| p.into_inner())
    }

    fn committed_mut(&self) -> RwLockWriteGuard<'_, Committed> {
        self.inner.committed.write().unwrap_or_else(|p| p.into_inner())
    }
}

/// Set store-owned metadata on a merged object.
fn stamp(object: &mut Json, revision: u64, created: bool) -> StrataResult<()> {
    let meta = object
        .get_mut("metadata")
        .and_then(Json::as_object_mut)
        .ok_or_else(|| StrataError::Validation("metadata must be an object".into()))?;
    meta.insert("revision".into(), Json::from(revision));
    if created {
        meta.insert("uid".into(), Json::String(Uuid::new_v4().to_string()));
        let ts = serde_json::to_value(Time::now()).map_err(|e| StrataError::Internal(format!("encoding time: {e}")))?;
        meta.insert("creationTimestamp".into(), ts);
    }
    Ok(())
}
