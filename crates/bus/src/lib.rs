//! Subject-addressed messaging.
//!
//! Subjects are `.`-separated tokens. Subscription patterns may use `*` for
//! exactly one token and a trailing `>` for one or more tokens. [`Bus`] is the
//! seam to a real broker; [`MemoryBus`] serves a single process and tests.

#![forbid(unsafe_code)]

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock, Weak};
use std::time::Duration;

use metrics::counter;
use rustc_hash::FxHashMap;
use strata_core::{StrataError, StrataResult};
use tokio::sync::mpsc;
use tracing::{debug, warn};

pub type Headers = BTreeMap<String, String>;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Message {
    pub subject: String,
    /// Inbox to answer on, set for requests.
    pub reply: Option<String>,
    pub headers: Headers,
    pub payload: Vec<u8>,
}

impl Message {
    pub fn new(subject: impl Into<String>, payload: impl Into<Vec<u8>>) -> Self {
        Self { subject: subject.into(), payload: payload.into(), ..Default::default() }
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).map(String::as_str)
    }

    /// Response addressed to this message's inbox, if it has one.
    pub fn respond(&self, payload: impl Into<Vec<u8>>) -> Option<Message> {
        self.reply.as_ref().map(|inbox| Message::new(inbox.clone(), payload))
    }
}

#[async_trait::async_trait]
pub trait Bus: Send + Sync {
    /// Fire and forget; messages with no subscriber are dropped.
    async fn publish(&self, msg: Message) -> StrataResult<()>;

    async fn subscribe(&self, pattern: &str) -> StrataResult<BusSubscription>;

    /// Publish with a fresh inbox and wait for the first reply.
    async fn request(&self, msg: Message, timeout: Duration) -> StrataResult<Message>;
}

/// Stream of messages for one pattern. Dropping it unsubscribes.
pub struct BusSubscription {
    rx: mpsc::Receiver<Message>,
    pattern: String,
    on_drop: Option<Box<dyn FnOnce() + Send + Sync>>,
}

impl BusSubscription {
    pub fn new(
        rx: mpsc::Receiver<Message>,
        pattern: impl Into<String>,
        on_drop: impl FnOnce() + Send + Sync + 'static,
    ) -> Self {
        Self { rx, pattern: pattern.into(), on_drop: Some(Box::new(on_drop)) }
    }

    pub fn pattern(&self) -> &str {
        &self.pattern
    }

    /// Next message; `None` once the bus is gone.
    pub async fn recv(&mut self) -> Option<Message> {
        self.rx.recv().await
    }
}

impl Drop for BusSubscription {
    fn drop(&mut self) {
        if let Some(f) = self.on_drop.take() {
            f();
        }
    }
}

/// Whether `subject` is selected by `pattern`.
pub fn subject_matches(pattern: &str, subject: &str) -> bool {
    let mut p = pattern.split('.');
    let mut s = subject.split('.');
    loop {
        match (p.next(), s.next()) {
            (Some(">"), Some(_)) => return true,
            (Some("*"), Some(_)) => {}
            (Some(a), Some(b)) if a == b => {}
            (None, None) => return true,
            _ => return false,
        }
    }
}

fn validate_pattern(pattern: &str) -> StrataResult<()> {
    let tokens: Vec<&str> = pattern.split('.').collect();
    for (i, t) in tokens.iter().enumerate() {
        if t.is_empty() {
            return Err(StrataError::Validation(format!("empty token in subject {pattern:?}")));
        }
        if *t == ">" && i + 1 != tokens.len() {
            return Err(StrataError::Validation(format!("'>' must be the last token in {pattern:?}")));
        }
    }
    Ok(())
}

/// A published `*` is a literal token; list requests use it for open key segments.
fn validate_subject(subject: &str) -> StrataResult<()> {
    validate_pattern(subject)?;
    if subject.split('.').any(|t| t == ">") {
        return Err(StrataError::Validation(format!("'>' is not allowed when publishing: {subject:?}")));
    }
    Ok(())
}

struct Sub {
    pattern: String,
    tx: mpsc::Sender<Message>,
}

struct Inner {
    subs: RwLock<FxHashMap<u64, Sub>>,
    next_id: AtomicU64,
    buffer: usize,
}

/// In-process bus. Each subscription has a bounded buffer; a subscriber that
/// falls behind loses messages rather than slowing publishers.
#[derive(Clone)]
pub struct MemoryBus {
    inner: Arc<Inner>,
}

impl Default for MemoryBus {
    fn default() -> Self {
        let buffer = std::env::var("STRATA_BUS_BUFFER").ok().and_then(|s| s.parse().ok()).unwrap_or(256);
        Self::with_buffer(buffer)
    }
}

impl MemoryBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_buffer(buffer: usize) -> Self {
        Self {
            inner: Arc::new(Inner {
                subs: RwLock::new(FxHashMap::default()),
                next_id: AtomicU64::new(1),
                buffer: buffer.max(1),
            }),
        }
    }

    pub fn subscription_count(&self) -> usize {
        self.inner.subs.read().unwrap_or_else(|p| p.into_inner()).len()
    }

    /// Returns how many subscribers accepted the message.
    fn deliver(&self, msg: &Message) -> usize {
        let subs = self.inner.subs.read().unwrap_or_else(|p| p.into_inner());
        let mut delivered = 0;
        for sub in subs.values().filter(|s| subject_matches(&s.pattern, &msg.subject)) {
            match sub.tx.try_send(msg.clone()) {
                Ok(()) => delivered += 1,
                Err(mpsc::error::TrySendError::Full(_)) => {
                    warn!(subject = %msg.subject, pattern = %sub.pattern, "bus: slow subscriber; message dropped");
                    counter!("bus_dropped_total", 1u64);
                }
                Err(mpsc::error::TrySendError::Closed(_)) => {}
            }
        }
        counter!("bus_messages_total", 1u64);
        delivered
    }

    fn add(&self, pattern: &str) -> BusSubscription {
        let (tx, rx) = mpsc::channel(self.inner.buffer);
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        self.inner
            .subs
            .write()
            .unwrap_or_else(|p| p.into_inner())
            .insert(id, Sub { pattern: pattern.to_string(), tx });
        debug!(pattern, id, "bus: subscribed");
        let weak: Weak<Inner> = Arc::downgrade(&self.inner);
        BusSubscription::new(rx, pattern, move || {
            if let Some(inner) = weak.upgrade() {
                inner.subs.write().unwrap_or_else(|p| p.into_inner()).remove(&id);
            }
        })
    }
}

#[async_trait::async_trait]
impl Bus for MemoryBus {
    async fn publish(&self, msg: Message) -> StrataResult<()> {
        validate_subject(&msg.subject)?;
        self.deliver(&msg);
        Ok(())
    }

    async fn subscribe(&self, pattern: &str) -> StrataResult<BusSubscription> {
        validate_pattern(pattern)?;
        Ok(self.add(pattern))
    }

    async fn request(&self, mut msg: Message, timeout: Duration) -> StrataResult<Message> {
        validate_subject(&msg.subject)?;
        let inbox = format!("_INBOX.{}", uuid::Uuid::new_v4().simple());
        let mut replies = self.add(&inbox);
        msg.reply = Some(inbox);
        if self.deliver(&msg) == 0 {
            return Err(StrataError::Transport(format!("no responders for {}", msg.subject)));
        }
        match tokio::time::timeout(timeout, replies.recv()).await {
            Ok(Some(reply)) => Ok(reply),
            Ok(None) => Err(StrataError::Transport("bus closed".into())),
            Err(_) => Err(StrataError::Transport("deadline exceeded".into())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wildcard_matching() {
        assert!(subject_matches("STRATA.events.*.*.Project.>", "STRATA.events.g.v1.Project.acme.web"));
        assert!(subject_matches("a.*.c", "a.b.c"));
        assert!(!subject_matches("a.*.c", "a.b.c.d"));
        assert!(!subject_matches("a.>", "a"));
        assert!(!subject_matches("a.b", "a.c"));
        assert!(subject_matches("a.b", "a.b"));
    }

    #[test]
    fn pattern_validation() {
        assert!(validate_pattern("a.>.b").is_err());
        assert!(validate_pattern("a..b").is_err());
        assert!(validate_subject("a.>").is_err());
        assert!(validate_subject("a.*").is_ok());
        assert!(validate_subject("a.b").is_ok());
    }

    #[tokio::test]
    async fn publish_reaches_matching_subscribers() {
        let bus = MemoryBus::new();
        let mut all = bus.subscribe("x.>").await.unwrap();
        let mut one = bus.subscribe("x.y").await.unwrap();
        bus.publish(Message::new("x.z", "1")).await.unwrap();
        bus.publish(Message::new("x.y", "2").with_header("H", "v")).await.unwrap();
        assert_eq!(all.recv().await.unwrap().payload, b"1");
        let got = one.recv().await.unwrap();
        assert_eq!(got.payload, b"2");
        assert_eq!(got.header("H"), Some("v"));
    }

    #[tokio::test]
    async fn dropped_subscription_is_removed() {
        let bus = MemoryBus::new();
        let sub = bus.subscribe("x").await.unwrap();
        assert_eq!(bus.subscription_count(), 1);
        drop(sub);
        assert_eq!(bus.subscription_count(), 0);
    }

    #[tokio::test]
    async fn request_reply() {
        let bus = MemoryBus::new();
        let mut svc = bus.subscribe("svc.echo").await.unwrap();
        let responder = bus.clone();
        tokio::spawn(async move {
            while let Some(req) = svc.recv().await {
                if let Some(resp) = req.respond(req.payload.clone()) {
                    responder.publish(resp.with_header("Strata-Status", "200")).await.unwrap();
                }
            }
        });
        let reply = bus.request(Message::new("svc.echo", "ping"), Duration::from_secs(1)).await.unwrap();
        assert_eq!(reply.payload, b"ping");
        assert_eq!(reply.header("Strata-Status"), Some("200"));
    }

    #[tokio::test]
    async fn request_without_responders_fails_fast() {
        let bus = MemoryBus::new();
        let err = bus.request(Message::new("nobody.home", ""), Duration::from_secs(5)).await.unwrap_err();
        assert!(matches!(err, StrataError::Transport(_)));
    }

    #[tokio::test]
    async fn request_times_out() {
        let bus = MemoryBus::new();
        let _silent = bus.subscribe("slow").await.unwrap();
        let err = bus.request(Message::new("slow", ""), Duration::from_millis(20)).await.unwrap_err();
        assert_eq!(err, StrataError::Transport("deadline exceeded".into()));
        assert_eq!(err.status(), 504);
    }
}
