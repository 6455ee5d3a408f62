use std::sync::Arc;
use std::time::{Duration, Instant};

use metrics::{counter, histogram};
use rustc_hash::FxHashMap;
use strata_api::{CancelHandle, StrataApi, StreamHandle};
use strata_core::{Context, Event, ListFilter, MetaOnlyObject, ObjectKey, StrataResult};
use strata_store::{Validator, Validators};
use tokio::sync::{mpsc, Semaphore};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::queue::WorkQueue;
use crate::{ReconcileError, ReconcileResult, Reconciler, Request};

/// Runtime knobs for one controller.
#[derive(Debug, Clone)]
pub struct ControllerOptions {
    /// Reconciliations running at once across all keys.
    pub max_concurrent: usize,
    /// Delay before the first retry; doubles per consecutive failure.
    pub base_backoff: Duration,
    pub max_backoff: Duration,
    /// How long `stop` waits for in-flight reconciliations.
    pub stop_timeout: Duration,
    /// Deadline of the context handed to each reconcile call.
    pub reconcile_timeout: Duration,
}

impl Default for ControllerOptions {
    fn default() -> Self {
        Self {
            max_concurrent: 4,
            base_backoff: Duration::from_secs(1),
            max_backoff: Duration::from_secs(300),
            stop_timeout: Duration::from_secs(600),
            reconcile_timeout: Duration::from_secs(3600),
        }
    }
}

impl ControllerOptions {
    /// Defaults overridden by `STRATA_CONTROLLER_CONCURRENCY`,
    /// `STRATA_CONTROLLER_MAX_BACKOFF_SECS` and `STRATA_CONTROLLER_STOP_TIMEOUT_SECS`.
    pub fn from_env() -> Self {
        let d = Self::default();
        let secs = |name: &str, default: Duration| {
            std::env::var(name).ok().and_then(|s| s.parse::<u64>().ok()).map(Duration::from_secs).unwrap_or(default)
        };
        Self {
            max_concurrent: std::env::var("STRATA_CONTROLLER_CONCURRENCY")
                .ok()
                .and_then(|s| s.parse::<usize>().ok())
                .filter(|n| *n > 0)
                .unwrap_or(d.max_concurrent),
            max_backoff: secs("STRATA_CONTROLLER_MAX_BACKOFF_SECS", d.max_backoff),
            stop_timeout: secs("STRATA_CONTROLLER_STOP_TIMEOUT_SECS", d.stop_timeout),
            ..d
        }
    }

    pub fn with_max_concurrent(mut self, n: usize) -> Self {
        self.max_concurrent = n.max(1);
        self
    }

    pub fn with_backoff(mut self, base: Duration, max: Duration) -> Self {
        self.base_backoff = base;
        self.max_backoff = max;
        self
    }

    pub fn with_stop_timeout(mut self, timeout: Duration) -> Self {
        self.stop_timeout = timeout;
        self
    }
}

/// Delay before retry number `attempt` (1-based): `base * 2^(attempt-1)`, capped at `max`.
pub fn backoff_delay(attempt: u32, base: Duration, max: Duration) -> Duration {
    let factor = 1u32.checked_shl(attempt.saturating_sub(1)).unwrap_or(u32::MAX);
    base.saturating_mul(factor).min(max)
}

pub struct ControllerBuilder {
    api: Arc<dyn StrataApi>,
    name: String,
    filter: ObjectKey,
    owns: Vec<ObjectKey>,
    options: ControllerOptions,
    admission: Option<(Validators, Arc<dyn Validator>)>,
}

impl ControllerBuilder {
    /// Also reconcile an owner when an object matching `filter` that
    /// references it changes.
    pub fn owns(mut self, filter: ObjectKey) -> Self {
        self.owns.push(filter);
        self
    }

    pub fn options(mut self, options: ControllerOptions) -> Self {
        self.options = options;
        self
    }

    /// Install `validator` for the filter's kind in `validators` while the
    /// controller runs. The store consults it before every commit of that kind.
    pub fn validator(mut self, validators: &Validators, validator: Arc<dyn Validator>) -> Self {
        self.admission = Some((validators.clone(), validator));
        self
    }

    /// Open the watches, enqueue every existing object, and start dispatching.
    pub async fn start(self, reconciler: Arc<dyn Reconciler>) -> StrataResult<Controller> {
        let Self { api, name, filter, owns, options, admission } = self;
        filter.validate_filter()?;
        let shutdown = Context::background();
        let work = Context::background();
        let (tx, rx) = mpsc::unbounded_channel();

        let mut streams = Vec::with_capacity(1 + owns.len());
        let primary = api.watch(&shutdown, filter.clone()).await?;
        streams.push(forward(&name, primary, tx.clone(), None));
        for owned in owns {
            let handle = api.watch(&shutdown, owned).await?;
            streams.push(forward(&name, handle, tx.clone(), Some(filter.clone())));
        }

        let existing = api.list(&shutdown, &ListFilter::new(filter.clone())).await?;
        let resync = existing.len();
        for obj in existing.items {
            let _ = tx.send(Signal::Enqueue(obj.key));
        }

        let admission = match admission {
            Some((table, validator)) => {
                table.register(&filter.group, &filter.kind, validator)?;
                Some(table)
            }
            None => None,
        };

        let permits = Arc::new(Semaphore::new(options.max_concurrent.max(1)));
        let dispatcher = Dispatcher {
            name: name.clone(),
            reconciler,
            options: options.clone(),
            queue: WorkQueue::new(),
            attempts: FxHashMap::default(),
            permits: permits.clone(),
            tx,
            shutdown: shutdown.clone(),
            work: work.clone(),
        };
        let task = tokio::spawn(dispatcher.run(rx));
        info!(controller = %name, filter = %filter, resync, max_concurrent = options.max_concurrent, "controller: started");
        Ok(Controller { name, filter, shutdown, work, permits, options, streams, admission, task: Some(task) })
    }
}

/// A running reconcile loop for one kind.
pub struct Controller {
    name: String,
    filter: ObjectKey,
    shutdown: Context,
    work: Context,
    permits: Arc<Semaphore>,
    options: ControllerOptions,
    streams: Vec<(CancelHandle, JoinHandle<()>)>,
    admission: Option<Validators>,
    task: Option<JoinHandle<()>>,
}

impl Controller {
    pub fn builder(api: Arc<dyn StrataApi>, name: impl Into<String>, filter: ObjectKey) -> ControllerBuilder {
        ControllerBuilder {
            api,
            name: name.into(),
            filter,
            owns: Vec::new(),
            options: ControllerOptions::default(),
            admission: None,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn filter(&self) -> &ObjectKey {
        &self.filter
    }

    fn release_validator(&mut self) {
        if let Some(table) = self.admission.take() {
            if table.unregister(&self.filter.group, &self.filter.kind) {
                debug!(controller = %self.name, kind = %self.filter.kind, "controller: validator removed");
            }
        }
    }

    /// Cancel the watches, then wait up to `stop_timeout` for in-flight
    /// reconciliations. On timeout their contexts are cancelled and an error returned.
    pub async fn stop(mut self) -> anyhow::Result<()> {
        self.shutdown.cancel();
        self.release_validator();
        for (cancel, forwarder) in self.streams.drain(..) {
            cancel.cancel();
            forwarder.abort();
        }
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
        let all = u32::try_from(self.options.max_concurrent.max(1)).unwrap_or(u32::MAX);
        let drained = tokio::time::timeout(self.options.stop_timeout, self.permits.acquire_many(all)).await;
        match drained {
            Ok(_) => {
                info!(controller = %self.name, "controller: stopped");
                Ok(())
            }
            Err(_) => {
                self.work.cancel();
                anyhow::bail!(
                    "controller {}: timeout after {:?} waiting for reconcile loops to finish",
                    self.name,
                    self.options.stop_timeout
                )
            }
        }
    }
}

impl Drop for Controller {
    fn drop(&mut self) {
        self.shutdown.cancel();
        self.release_validator();
        for (_, forwarder) in &self.streams {
            forwarder.abort();
        }
    }
}

enum Signal {
    Enqueue(ObjectKey),
    Finished(ObjectKey, Result<ReconcileResult, ReconcileError>),
}

/// Pump watch events into the dispatcher. With `owner` set, events are mapped
/// to the owners they reference that match it.
fn forward(
    name: &str,
    handle: StreamHandle<Event>,
    tx: mpsc::UnboundedSender<Signal>,
    owner: Option<ObjectKey>,
) -> (CancelHandle, JoinHandle<()>) {
    let StreamHandle { mut rx, cancel } = handle;
    let name = name.to_string();
    let task = tokio::spawn(async move {
        while let Some(ev) = rx.recv().await {
            let keys = match &owner {
                None => vec![ev.key],
                Some(filter) => owners_of(&ev, filter),
            };
            for key in keys {
                if tx.send(Signal::Enqueue(key)).is_err() {
                    return;
                }
            }
        }
        warn!(controller = %name, "controller: watch stream ended");
    });
    (cancel, task)
}

fn owners_of(ev: &Event, filter: &ObjectKey) -> Vec<ObjectKey> {
    let Some(data) = ev.data.as_ref() else { return Vec::new() };
    let meta = match MetaOnlyObject::from_value(data) {
        Ok(m) => m.metadata,
        Err(e) => {
            debug!(key = %ev.key, error = %e, "controller: skipping undecodable owned object");
            return Vec::new();
        }
    };
    meta.owner_references
        .iter()
        .map(|r| ObjectKey::new(&r.group, &r.version, &r.kind, &r.account, &r.name))
        .filter(|k| k.matches(filter))
        .collect()
}

struct Dispatcher {
    name: String,
    reconciler: Arc<dyn Reconciler>,
    options: ControllerOptions,
    queue: WorkQueue,
    attempts: FxHashMap<ObjectKey, u32>,
    permits: Arc<Semaphore>,
    tx: mpsc::UnboundedSender<Signal>,
    shutdown: Context,
    work: Context,
}

impl Dispatcher {
    async fn run(mut self, mut rx: mpsc::UnboundedReceiver<Signal>) {
        loop {
            self.dispatch();
            let signal = tokio::select! {
                _ = self.shutdown.token().cancelled() => break,
                s = rx.recv() => s,
            };
            match signal {
                Some(Signal::Enqueue(key)) => self.queue.push(key),
                Some(Signal::Finished(key, res)) => self.finished(key, res),
                None => break,
            }
        }
        debug!(
            controller = %self.name,
            queued = self.queue.len(),
            coalesced = self.queue.coalesced(),
            "controller: dispatcher stopped"
        );
    }

    fn dispatch(&mut self) {
        while !self.queue.is_empty() {
            let Ok(permit) = self.permits.clone().try_acquire_owned() else { break };
            let Some(key) = self.queue.pop() else { break };
            let reconciler = self.reconciler.clone();
            let tx = self.tx.clone();
            let ctx = self.work.child_with_timeout(self.options.reconcile_timeout);
            let name = self.name.clone();
            tokio::spawn(async move {
                let t0 = Instant::now();
                debug!(controller = %name, key = %key, "controller: reconciling");
                let req = Request { key: key.clone() };
                let inner = tokio::spawn(async move { reconciler.reconcile(&ctx, req).await });
                let res = match inner.await {
                    Ok(res) => res,
                    Err(e) if e.is_panic() => Err(ReconcileError::Panic(panic_message(e.into_panic()))),
                    Err(e) => Err(ReconcileError::Other(anyhow::anyhow!("reconcile task ended: {e}"))),
                };
                histogram!("controller_reconcile_latency_ms", t0.elapsed().as_secs_f64() * 1000.0, "controller" => name);
                // Release the slot before reporting so the dispatcher can reuse it.
                drop(permit);
                let _ = tx.send(Signal::Finished(key, res));
            });
        }
    }

    fn finished(&mut self, key: ObjectKey, res: Result<ReconcileResult, ReconcileError>) {
        self.queue.done(&key);
        let res = match res {
            Err(e) if e.is_not_found() => {
                debug!(controller = %self.name, key = %key, "controller: object gone");
                Ok(ReconcileResult::default())
            }
            other => other,
        };
        match res {
            Ok(result) => {
                counter!("controller_reconcile_total", 1u64, "controller" => self.name.clone(), "result" => "ok");
                self.attempts.remove(&key);
                match result.requeue_after.filter(|d| !d.is_zero()) {
                    Some(delay) => self.schedule(key, delay),
                    None if result.requeue => self.queue.push(key),
                    None => {}
                }
            }
            Err(e) => {
                let attempt = self.attempts.entry(key.clone()).or_insert(0);
                *attempt = attempt.saturating_add(1);
                let delay = backoff_delay(*attempt, self.options.base_backoff, self.options.max_backoff);
                let result = if matches!(e, ReconcileError::Panic(_)) { "panic" } else { "error" };
                counter!("controller_reconcile_total", 1u64, "controller" => self.name.clone(), "result" => result);
                error!(controller = %self.name, key = %key, attempt = *attempt, backoff_ms = delay.as_millis() as u64, error = %e, "controller: reconcile failed");
                self.schedule(key, delay);
            }
        }
    }

    fn schedule(&self, key: ObjectKey, delay: Duration) {
        let tx = self.tx.clone();
        let shutdown = self.shutdown.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = shutdown.token().cancelled() => {}
                _ = tokio::time::sleep(delay) => {
                    let _ = tx.send(Signal::Enqueue(key));
                }
            }
        });
    }
}

fn panic_message(payload: Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_doubles_and_caps() {
        let base = Duration::from_secs(1);
        let max = Duration::from_secs(300);
        assert_eq!(backoff_delay(1, base, max), Duration::from_secs(1));
        assert_eq!(backoff_delay(2, base, max), Duration::from_secs(2));
        assert_eq!(backoff_delay(5, base, max), Duration::from_secs(16));
        assert_eq!(backoff_delay(9, base, max), max);
        assert_eq!(backoff_delay(200, base, max), max);
    }

    #[test]
    fn owned_events_map_to_matching_owners() {
        let ev = Event {
            operation: strata_core::EventOperation::Update,
            key: ObjectKey::new("azuredevops", "v1", "Repository", "acme", "api"),
            revision: 3,
            data: Some(serde_json::json!({
                "apiVersion": "azuredevops/v1",
                "kind": "Repository",
                "metadata": {"name": "api", "account": "acme", "ownerReferences": [
                    {"group": "azuredevops", "version": "v1", "kind": "Project", "account": "acme", "name": "web"},
                    {"group": "other", "version": "v1", "kind": "Team", "account": "acme", "name": "t"}
                ]}
            })),
        };
        let filter = ObjectKey::new("azuredevops", "v1", "Project", "", "");
        assert_eq!(owners_of(&ev, &filter), vec![ObjectKey::new("azuredevops", "v1", "Project", "acme", "web")]);

        let purge = Event { data: None, ..ev };
        assert!(owners_of(&purge, &filter).is_empty());
    }
}
