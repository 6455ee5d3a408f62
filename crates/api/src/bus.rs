use std::sync::Arc;
use std::time::{Duration, Instant};

use metrics::counter;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value as Json;
use strata_bus::{Bus, Message};
use strata_core::{
    ApplyOutcome, ApplyRequest, Context, DeleteOutcome, Event, GenericObject, GenericObjectList, ListFilter, ObjectKey,
    StrataError, StrataResult,
};
use strata_schema::KindSchema;
use strata_store::ObjectStore;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::auth::SessionVerifier;
use crate::{queue_cap, ApplyStatus, CancelHandle, DeleteStatus, StrataApi, StreamHandle};

/// `STRATA.api.store.<command>.<group>.<version>.<kind>.<account>.<name>`
pub const API_PREFIX: &str = "STRATA.api.store";
/// `STRATA.events.<group>.<version>.<kind>.<account>.<name>`
pub const EVENTS_PREFIX: &str = "STRATA.events";
pub const KINDS_SUBJECT: &str = "STRATA.api.kinds";

pub const HEADER_MANAGER: &str = "Strata-Manager";
pub const HEADER_FORCE: &str = "Strata-Force";
pub const HEADER_STATUS: &str = "Strata-Status";
pub const HEADER_AUTHORIZATION: &str = "Strata-Authorization";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    Get,
    List,
    Apply,
    Delete,
}

impl Command {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Get => "get",
            Self::List => "list",
            Self::Apply => "apply",
            Self::Delete => "delete",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "get" => Some(Self::Get),
            "list" => Some(Self::List),
            "apply" => Some(Self::Apply),
            "delete" => Some(Self::Delete),
            _ => None,
        }
    }
}

pub fn api_subject(command: Command, key: &ObjectKey) -> String {
    format!("{API_PREFIX}.{}.{}", command.as_str(), key.subject())
}

pub fn event_subject(key: &ObjectKey) -> String {
    format!("{EVENTS_PREFIX}.{}", key.subject())
}

fn parse_api_subject(subject: &str) -> StrataResult<(Command, ObjectKey)> {
    let rest = subject
        .strip_prefix(API_PREFIX)
        .and_then(|r| r.strip_prefix('.'))
        .ok_or_else(|| StrataError::Validation(format!("not an api subject: {subject}")))?;
    let parts: Vec<&str> = rest.split('.').collect();
    let (cmd, key_parts) = parts
        .split_first()
        .ok_or_else(|| StrataError::Validation(format!("not an api subject: {subject}")))?;
    let command = Command::parse(cmd).ok_or_else(|| StrataError::Validation(format!("unknown command {cmd:?}")))?;
    Ok((command, ObjectKey::from_parts(key_parts)?))
}

fn encode<T: Serialize>(value: &T) -> StrataResult<Vec<u8>> {
    serde_json::to_vec(value).map_err(|e| StrataError::Internal(format!("encoding reply: {e}")))
}

fn decode<T: DeserializeOwned>(what: &str, payload: &[u8]) -> StrataResult<T> {
    serde_json::from_slice(payload).map_err(|e| StrataError::Validation(format!("decoding {what}: {e}")))
}

// ----------------- Server -----------------

/// Serves the store over a bus and bridges committed events onto it.
pub struct BusServer {
    token: CancellationToken,
    tasks: std::sync::Mutex<Vec<JoinHandle<()>>>,
}

impl BusServer {
    pub async fn start(
        bus: Arc<dyn Bus>,
        store: ObjectStore,
        verifier: Arc<dyn SessionVerifier>,
    ) -> StrataResult<Self> {
        let token = CancellationToken::new();
        let mut requests = bus.subscribe(&format!("{API_PREFIX}.*.*.*.*.*.*")).await?;
        let mut kinds = bus.subscribe(KINDS_SUBJECT).await?;
        let mut events = store.subscribe(ObjectKey::default());

        let serve = {
            let (bus, store, verifier, token) = (bus.clone(), store.clone(), verifier.clone(), token.clone());
            tokio::spawn(async move {
                loop {
                    let msg = tokio::select! {
                        _ = token.cancelled() => break,
                        m = requests.recv() => m,
                    };
                    let Some(msg) = msg else { break };
                    let (bus, store, verifier) = (bus.clone(), store.clone(), verifier.clone());
                    tokio::spawn(async move {
                        let reply = handle(&store, verifier.as_ref(), &msg).await;
                        respond(bus.as_ref(), &msg, reply).await;
                    });
                }
                info!("bus: api server stopped");
            })
        };

        let serve_kinds = {
            let (bus, store, token) = (bus.clone(), store.clone(), token.clone());
            tokio::spawn(async move {
                loop {
                    let msg = tokio::select! {
                        _ = token.cancelled() => break,
                        m = kinds.recv() => m,
                    };
                    let Some(msg) = msg else { break };
                    let reply = encode(&store.config().schemas.kinds()).map(|body| (200, body));
                    respond(bus.as_ref(), &msg, reply).await;
                }
            })
        };

        let bridge = {
            let token = token.clone();
            tokio::spawn(async move {
                loop {
                    let ev = tokio::select! {
                        _ = token.cancelled() => break,
                        ev = events.recv() => ev,
                    };
                    let Some(ev) = ev else { break };
                    let subject = event_subject(&ev.key);
                    match encode(&ev) {
                        Ok(body) => {
                            if let Err(e) = bus.publish(Message::new(subject, body)).await {
                                warn!(key = %ev.key, error = %e, "bus: event publish failed");
                            }
                        }
                        Err(e) => warn!(key = %ev.key, error = %e, "bus: event encode failed"),
                    }
                }
                info!("bus: event bridge stopped");
            })
        };

        info!(prefix = API_PREFIX, "bus: api server started");
        Ok(Self { token, tasks: std::sync::Mutex::new(vec![serve, serve_kinds, bridge]) })
    }

    /// Stop serving and wait for the server loops to exit.
    pub async fn stop(&self) {
        self.token.cancel();
        let tasks = std::mem::take(&mut *self.tasks.lock().unwrap_or_else(|p| p.into_inner()));
        for t in tasks {
            let _ = t.await;
        }
    }
}

impl Drop for BusServer {
    fn drop(&mut self) {
        self.token.cancel();
    }
}

async fn handle(store: &ObjectStore, verifier: &dyn SessionVerifier, msg: &Message) -> StrataResult<(u16, Vec<u8>)> {
    let t0 = Instant::now();
    let (command, key) = parse_api_subject(&msg.subject)?;
    let Some(session) = verifier.verify(msg.header(HEADER_AUTHORIZATION)).await else {
        counter!("api_requests_total", 1u64, "transport" => "bus", "command" => command.as_str(), "status" => "401");
        return Ok((401, encode(&StrataError::Validation("unauthorized".into()))?));
    };
    let ctx = Context::background();
    let res = match command {
        Command::Get => store.get(&ctx, &key).and_then(|obj| encode(&obj)).map(|b| (200, b)),
        Command::List => {
            let filter = if msg.payload.is_empty() { ListFilter::new(key) } else { decode("list filter", &msg.payload)? };
            store.list(&ctx, &filter).and_then(|list| encode(&list)).map(|b| (200, b))
        }
        Command::Apply => {
            let manager = msg.header(HEADER_MANAGER).unwrap_or_default().to_string();
            let force = msg.header(HEADER_FORCE).is_some_and(|v| v.eq_ignore_ascii_case("true"));
            let payload: Json = decode("apply payload", &msg.payload)?;
            let outcome = store.apply(&ctx, ApplyRequest { key: key.clone(), manager, payload, force }).await?;
            encode(&ApplyStatus { key, outcome }).map(|b| (outcome.status(), b))
        }
        Command::Delete => {
            let outcome = store.delete(&ctx, &key).await?;
            encode(&DeleteStatus { key, outcome }).map(|b| (200, b))
        }
    };
    let status = match &res {
        Ok((s, _)) => *s,
        Err(e) => e.status(),
    };
    counter!("api_requests_total", 1u64, "transport" => "bus", "command" => command.as_str(), "status" => status.to_string());
    debug!(subject = %msg.subject, caller = %session.subject, status, took_ms = %t0.elapsed().as_millis(), "bus: request served");
    res
}

async fn respond(bus: &dyn Bus, req: &Message, reply: StrataResult<(u16, Vec<u8>)>) {
    let (status, body) = match reply {
        Ok(r) => r,
        Err(e) => (e.status(), serde_json::to_vec(&e).unwrap_or_default()),
    };
    let Some(msg) = req.respond(body) else {
        debug!(subject = %req.subject, "bus: request without inbox; reply dropped");
        return;
    };
    if let Err(e) = bus.publish(msg.with_header(HEADER_STATUS, status.to_string())).await {
        warn!(subject = %req.subject, error = %e, "bus: reply failed");
    }
}

// ----------------- Client -----------------

/// [`StrataApi`] over a bus.
#[derive(Clone)]
pub struct BusClient {
    bus: Arc<dyn Bus>,
    session: Option<String>,
    timeout: Duration,
}

impl BusClient {
    pub fn new(bus: Arc<dyn Bus>) -> Self {
        let secs = std::env::var("STRATA_REQUEST_TIMEOUT_SECS").ok().and_then(|s| s.parse().ok()).unwrap_or(30);
        Self { bus, session: None, timeout: Duration::from_secs(secs) }
    }

    pub fn with_session(mut self, session: impl Into<String>) -> Self {
        self.session = Some(session.into());
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    async fn request(&self, ctx: &Context, mut msg: Message) -> StrataResult<(u16, Vec<u8>)> {
        ctx.check()?;
        if let Some(s) = &self.session {
            msg = msg.with_header(HEADER_AUTHORIZATION, s.clone());
        }
        let timeout = ctx.remaining().map_or(self.timeout, |r| r.min(self.timeout));
        let reply = ctx.run(self.bus.request(msg, timeout)).await?;
        let status: u16 = reply
            .header(HEADER_STATUS)
            .and_then(|s| s.parse().ok())
            .ok_or_else(|| StrataError::Transport(format!("reply without {HEADER_STATUS} header")))?;
        if status >= 400 {
            return Err(serde_json::from_slice::<StrataError>(&reply.payload)
                .unwrap_or_else(|_| StrataError::from_status(status, String::from_utf8_lossy(&reply.payload))));
        }
        Ok((status, reply.payload))
    }
}

#[async_trait::async_trait]
impl StrataApi for BusClient {
    async fn get(&self, ctx: &Context, key: &ObjectKey) -> StrataResult<GenericObject> {
        key.validate_strict()?;
        let (_, body) = self.request(ctx, Message::new(api_subject(Command::Get, key), Vec::new())).await?;
        decode("object", &body)
    }

    async fn list(&self, ctx: &Context, filter: &ListFilter) -> StrataResult<GenericObjectList> {
        filter.key.validate_filter()?;
        let msg = Message::new(api_subject(Command::List, &filter.key), encode(filter)?);
        let (_, body) = self.request(ctx, msg).await?;
        decode("object list", &body)
    }

    async fn apply(&self, ctx: &Context, req: ApplyRequest) -> StrataResult<ApplyOutcome> {
        req.key.validate_strict()?;
        let msg = Message::new(api_subject(Command::Apply, &req.key), encode(&req.payload)?)
            .with_header(HEADER_MANAGER, req.manager.clone())
            .with_header(HEADER_FORCE, req.force.to_string());
        let (status, _) = self.request(ctx, msg).await?;
        ApplyOutcome::from_status(status)
            .ok_or_else(|| StrataError::Transport(format!("unexpected apply status {status}")))
    }

    async fn delete(&self, ctx: &Context, key: &ObjectKey) -> StrataResult<DeleteOutcome> {
        key.validate_strict()?;
        let (_, body) = self.request(ctx, Message::new(api_subject(Command::Delete, key), Vec::new())).await?;
        Ok(decode::<DeleteStatus>("delete status", &body)?.outcome)
    }

    async fn watch(&self, ctx: &Context, filter: ObjectKey) -> StrataResult<StreamHandle<Event>> {
        filter.validate_filter()?;
        let mut sub = self.bus.subscribe(&event_subject(&filter)).await?;
        let (tx, rx) = mpsc::channel::<Event>(queue_cap());
        let token = ctx.token().clone();
        let task = tokio::spawn(async move {
            loop {
                let msg = tokio::select! {
                    _ = token.cancelled() => break,
                    m = sub.recv() => m,
                };
                let Some(msg) = msg else { break };
                let ev: Event = match serde_json::from_slice(&msg.payload) {
                    Ok(ev) => ev,
                    Err(e) => {
                        warn!(subject = %msg.subject, error = %e, "bus: undecodable event skipped");
                        continue;
                    }
                };
                if ev.key.matches(&filter) && tx.send(ev).await.is_err() {
                    break;
                }
            }
        });
        Ok(StreamHandle { rx, cancel: CancelHandle::new(task) })
    }

    async fn kinds(&self, ctx: &Context) -> StrataResult<Vec<KindSchema>> {
        let (_, body) = self.request(ctx, Message::new(KINDS_SUBJECT, Vec::new())).await?;
        decode("kinds", &body)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn subject_round_trip() {
        let key = ObjectKey::new("g", "v1", "Project", "acme", "");
        let subject = api_subject(Command::List, &key);
        assert_eq!(subject, "STRATA.api.store.list.g.v1.Project.acme.*");
        assert_eq!(parse_api_subject(&subject).unwrap(), (Command::List, key));
        assert!(parse_api_subject("STRATA.api.store.frob.a.b.c.d.e").is_err());
        assert!(parse_api_subject("STRATA.api.store.get.a.b").is_err());
    }

    #[test]
    fn event_subjects_render_wildcards() {
        assert_eq!(event_subject(&ObjectKey::new("g", "", "Project", "", "")), "STRATA.events.g.*.Project.*.*");
    }
}
