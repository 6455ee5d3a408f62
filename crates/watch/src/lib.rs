//! Strata watch: fan-out of committed events to subscribers.
//!
//! Every event is published on its `(group, kind, account)` channel and on
//! the firehose. Subscriptions whose filter pins all three channel segments
//! read their channel; anything wider reads the firehose and filters locally.
//! Publishing is synchronous so the store can do it inside its per-key
//! critical section, which keeps per-key order intact.

#![forbid(unsafe_code)]

use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use arc_swap::ArcSwap;
use metrics::counter;
use rustc_hash::FxHashMap;
use strata_core::{ChannelKey, Event, ObjectKey, StrataError};
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

fn watch_retention() -> usize {
    std::env::var("STRATA_WATCH_RETENTION")
        .ok()
        .and_then(|s| s.parse::<usize>().ok())
        .filter(|n| *n > 0)
        .unwrap_or(1024)
}

fn redelivery_attempts() -> u32 {
    std::env::var("STRATA_WATCH_REDELIVERY_ATTEMPTS")
        .ok()
        .and_then(|s| s.parse::<u32>().ok())
        .unwrap_or(5)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WatchConfig {
    /// Events buffered per channel; slower subscribers skip ahead.
    pub retention: usize,
    /// Delivery attempts per event before a watcher gives up on it.
    pub redelivery_attempts: u32,
    pub redelivery_base: Duration,
    pub redelivery_max: Duration,
}

impl Default for WatchConfig {
    fn default() -> Self {
        Self {
            retention: 1024,
            redelivery_attempts: 5,
            redelivery_base: Duration::from_millis(100),
            redelivery_max: Duration::from_secs(5),
        }
    }
}

impl WatchConfig {
    pub fn from_env() -> Self {
        Self { retention: watch_retention(), redelivery_attempts: redelivery_attempts(), ..Self::default() }
    }
}

type Channels = FxHashMap<ChannelKey, broadcast::Sender<Arc<Event>>>;

/// Event fan-out. Cheap to clone; clones share channels.
#[derive(Clone)]
pub struct Distributor {
    inner: Arc<DistributorInner>,
}

struct DistributorInner {
    config: WatchConfig,
    channels: ArcSwap<Channels>,
    // Serializes copy-on-write updates of `channels`; publish never takes it.
    channels_write: Mutex<()>,
    firehose: broadcast::Sender<Arc<Event>>,
}

impl Distributor {
    pub fn new(config: WatchConfig) -> Self {
        let (firehose, _) = broadcast::channel(config.retention.max(1));
        Self {
            inner: Arc::new(DistributorInner {
                config,
                channels: ArcSwap::from_pointee(Channels::default()),
                channels_write: Mutex::new(()),
                firehose,
            }),
        }
    }

    pub fn config(&self) -> &WatchConfig {
        &self.inner.config
    }

    /// Publish one committed event. Never blocks.
    pub fn publish(&self, event: Event) {
        let ch = event.key.channel();
        let op = event.operation.as_str();
        let event = Arc::new(event);
        if let Some(tx) = self.inner.channels.load().get(&ch) {
            let _ = tx.send(Arc::clone(&event));
        }
        let _ = self.inner.firehose.send(event);
        counter!("watch_events_published_total", 1u64, "operation" => op);
    }

    /// Raw subscription for transports; events arrive in commit order per key.
    pub fn subscribe(&self, filter: ObjectKey) -> Subscription {
        let rx = if pins_channel(&filter) { self.channel_rx(filter.channel()) } else { self.inner.firehose.subscribe() };
        debug!(filter = %filter, "watch: subscribed");
        Subscription { rx, filter }
    }

    fn channel_rx(&self, ch: ChannelKey) -> broadcast::Receiver<Arc<Event>> {
        if let Some(tx) = self.inner.channels.load().get(&ch) {
            return tx.subscribe();
        }
        let _w = self.inner.channels_write.lock().unwrap_or_else(|p| p.into_inner());
        let current = self.inner.channels.load_full();
        if let Some(tx) = current.get(&ch) {
            return tx.subscribe();
        }
        let (tx, rx) = broadcast::channel(self.inner.config.retention.max(1));
        let mut next: Channels =
            current.iter().filter(|(_, s)| s.receiver_count() > 0).map(|(k, s)| (k.clone(), s.clone())).collect();
        next.insert(ch, tx);
        self.inner.channels.store(Arc::new(next));
        rx
    }

    /// Number of live per-channel senders (excluding the firehose).
    pub fn channel_count(&self) -> usize {
        self.inner.channels.load().len()
    }

    /// Deliver events matching `filter` to `handler` until the watcher is closed.
    ///
    /// A handler error is logged and the same event is retried with backoff,
    /// up to `redelivery_attempts` times; the subscription itself stays up.
    pub fn start_watcher<H>(&self, filter: ObjectKey, handler: H) -> Watcher
    where
        H: EventHandler + 'static,
    {
        let mut sub = self.subscribe(filter.clone());
        let token = CancellationToken::new();
        let cancel = token.clone();
        let cfg = self.inner.config.clone();
        let task = tokio::spawn(async move {
            info!(filter = %filter, "watch: watcher started");
            loop {
                let ev = tokio::select! {
                    _ = cancel.cancelled() => break,
                    ev = sub.recv() => ev,
                };
                let Some(ev) = ev else {
                    debug!(filter = %filter, "watch: distributor closed");
                    break;
                };
                if !deliver(&handler, &ev, &cfg, &cancel).await {
                    break;
                }
            }
            info!(filter = %filter, "watch: watcher stopped");
        });
        Watcher { token, task: Mutex::new(Some(task)) }
    }
}

fn pins_channel(filter: &ObjectKey) -> bool {
    [&filter.group, &filter.kind, &filter.account]
        .iter()
        .all(|s| !s.is_empty() && s.as_str() != strata_core::WILDCARD)
}

/// Returns false when the watcher was cancelled mid-delivery.
async fn deliver<H: EventHandler>(handler: &H, ev: &Event, cfg: &WatchConfig, cancel: &CancellationToken) -> bool {
    let mut backoff = cfg.redelivery_base;
    for attempt in 1..=cfg.redelivery_attempts.max(1) {
        match handler.handle(ev.clone()).await {
            Ok(()) => return true,
            Err(e) if attempt < cfg.redelivery_attempts => {
                warn!(key = %ev.key, op = ev.operation.as_str(), attempt, error = %e, "watch: handler failed; redelivering");
                counter!("watch_redeliveries_total", 1u64);
                tokio::select! {
                    _ = cancel.cancelled() => return false,
                    _ = tokio::time::sleep(backoff) => {}
                }
                backoff = (backoff * 2).min(cfg.redelivery_max);
            }
            Err(e) => {
                error!(key = %ev.key, op = ev.operation.as_str(), attempts = attempt, error = %e, "watch: handler failed; dropping event");
                counter!("watch_dropped_total", 1u64);
            }
        }
    }
    true
}

/// Receives events for one filter.
pub struct Subscription {
    rx: broadcast::Receiver<Arc<Event>>,
    filter: ObjectKey,
}

impl Subscription {
    pub fn filter(&self) -> &ObjectKey {
        &self.filter
    }

    /// Next matching event; `None` once the distributor is gone. A lagging
    /// subscriber logs how many events it missed and continues.
    pub async fn recv(&mut self) -> Option<Event> {
        loop {
            match self.rx.recv().await {
                Ok(ev) if ev.key.matches(&self.filter) => return Some((*ev).clone()),
                Ok(_) => continue,
                Err(RecvError::Lagged(n)) => {
                    warn!(filter = %self.filter, missed = n, "watch: subscriber lagged; events skipped");
                    counter!("watch_lagged_events_total", n);
                }
                Err(RecvError::Closed) => return None,
            }
        }
    }
}

/// Event consumer used by [`Distributor::start_watcher`].
#[async_trait::async_trait]
pub trait EventHandler: Send + Sync {
    async fn handle(&self, event: Event) -> Result<(), StrataError>;
}

#[async_trait::async_trait]
impl<F, Fut> EventHandler for F
where
    F: Fn(Event) -> Fut + Send + Sync,
    Fut: Future<Output = Result<(), StrataError>> + Send,
{
    async fn handle(&self, event: Event) -> Result<(), StrataError> {
        (self)(event).await
    }
}

/// Running watcher. Closing is idempotent; dropping closes it too.
pub struct Watcher {
    token: CancellationToken,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl Watcher {
    pub fn close(&self) {
        self.token.cancel();
    }

    pub fn is_closed(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Close and wait for the delivery task to finish.
    pub async fn stop(&self) {
        self.close();
        let task = self.task.lock().unwrap_or_else(|p| p.into_inner()).take();
        if let Some(task) = task {
            let _ = task.await;
        }
    }
}

impl Drop for Watcher {
    fn drop(&mut self) {
        self.token.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use strata_core::EventOperation;
    use tokio::sync::mpsc;

    fn ev(op: EventOperation, account: &str, name: &str, revision: u64) -> Event {
        Event { operation: op, key: ObjectKey::new("g", "v1", "Project", account, name), revision, data: None }
    }

    #[tokio::test]
    async fn channel_and_firehose_subscriptions() {
        let d = Distributor::new(WatchConfig::default());
        let mut pinned = d.subscribe(ObjectKey::new("g", "", "Project", "t1", ""));
        let mut wide = d.subscribe(ObjectKey::default());
        d.publish(ev(EventOperation::Create, "t2", "x", 1));
        d.publish(ev(EventOperation::Create, "t1", "y", 2));
        assert_eq!(pinned.recv().await.unwrap().revision, 2);
        assert_eq!(wide.recv().await.unwrap().revision, 1);
        assert_eq!(wide.recv().await.unwrap().revision, 2);
        assert_eq!(d.channel_count(), 1);
    }

    #[tokio::test]
    async fn name_filter_applies_on_channel() {
        let d = Distributor::new(WatchConfig::default());
        let mut sub = d.subscribe(ObjectKey::new("g", "v1", "Project", "t1", "only"));
        d.publish(ev(EventOperation::Update, "t1", "other", 1));
        d.publish(ev(EventOperation::Update, "t1", "only", 2));
        assert_eq!(sub.recv().await.unwrap().key.name, "only");
    }

    #[tokio::test]
    async fn lagging_subscriber_continues() {
        let d = Distributor::new(WatchConfig { retention: 2, ..WatchConfig::default() });
        let mut sub = d.subscribe(ObjectKey::default());
        for i in 1..=5 {
            d.publish(ev(EventOperation::Update, "t1", "x", i));
        }
        // The oldest events were dropped; the newest two survive.
        assert_eq!(sub.recv().await.unwrap().revision, 4);
        assert_eq!(sub.recv().await.unwrap().revision, 5);
    }

    #[tokio::test]
    async fn watcher_redelivers_failed_events() {
        let d = Distributor::new(WatchConfig { redelivery_base: Duration::from_millis(1), ..WatchConfig::default() });
        let calls = Arc::new(AtomicU32::new(0));
        let (tx, mut rx) = mpsc::unbounded_channel();
        let c = Arc::clone(&calls);
        let w = d.start_watcher(ObjectKey::default(), move |e: Event| {
            let c = Arc::clone(&c);
            let tx = tx.clone();
            async move {
                if c.fetch_add(1, Ordering::SeqCst) < 2 {
                    return Err(StrataError::Internal("flaky".into()));
                }
                let _ = tx.send(e.revision);
                Ok(())
            }
        });
        tokio::task::yield_now().await;
        d.publish(ev(EventOperation::Create, "t1", "x", 7));
        assert_eq!(rx.recv().await, Some(7));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        w.close();
        w.close();
        assert!(w.is_closed());
        w.stop().await;
    }

    #[tokio::test]
    async fn watcher_preserves_order() {
        let d = Distributor::new(WatchConfig::default());
        let (tx, mut rx) = mpsc::unbounded_channel();
        let w = d.start_watcher(ObjectKey::new("g", "v1", "Project", "t1", "x"), move |e: Event| {
            let tx = tx.clone();
            async move {
                let _ = tx.send(e.revision);
                Ok(())
            }
        });
        for i in 1..=20 {
            d.publish(ev(EventOperation::Update, "t1", "x", i));
        }
        let mut got = Vec::new();
        while got.len() < 20 {
            got.push(rx.recv().await.unwrap());
        }
        assert_eq!(got, (1..=20).collect::<Vec<_>>());
        w.stop().await;
    }
}
