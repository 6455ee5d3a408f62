//! Strata public API.
//!
//! [`StrataApi`] is the one surface every consumer (CLI, controllers, server
//! adapters) depends on. Implementations:
//! - [`InProcApi`] calls an [`ObjectStore`](strata_store::ObjectStore) directly;
//! - [`BusClient`] speaks request/reply over a [`Bus`](strata_bus::Bus), served by [`BusServer`];
//! - [`HttpClient`] speaks REST to the [`router`] served by `strata`.

#![forbid(unsafe_code)]

mod auth;
mod bus;
mod http;
mod http_client;
mod inproc;

use serde::{Deserialize, Serialize};
use strata_core::{
    ApplyOutcome, ApplyRequest, Context, DeleteOutcome, Event, GenericObject, GenericObjectList, ListFilter, ObjectKey,
    StrataResult,
};

pub use auth::{bearer_token, AllowAll, Session, SessionVerifier, StaticTokenVerifier};
pub use bus::{
    api_subject, event_subject, BusClient, BusServer, Command, API_PREFIX, EVENTS_PREFIX, HEADER_AUTHORIZATION,
    HEADER_FORCE, HEADER_MANAGER, HEADER_STATUS, KINDS_SUBJECT,
};
pub use http::{router, ErrorBody, HttpConfig, HEADER_FIELD_MANAGER, HEADER_FORCE_APPLY};
pub use http_client::HttpClient;
pub use inproc::InProcApi;
pub use strata_schema::KindSchema;

/// Reply body of an apply.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApplyStatus {
    pub key: ObjectKey,
    pub outcome: ApplyOutcome,
}

/// Reply body of a delete.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeleteStatus {
    pub key: ObjectKey,
    pub outcome: DeleteOutcome,
}

/// Declarative Strata API surface.
#[async_trait::async_trait]
pub trait StrataApi: Send + Sync {
    async fn get(&self, ctx: &Context, key: &ObjectKey) -> StrataResult<GenericObject>;

    /// Objects matching the filter in creation order; an empty list is not an error.
    async fn list(&self, ctx: &Context, filter: &ListFilter) -> StrataResult<GenericObjectList>;

    async fn apply(&self, ctx: &Context, req: ApplyRequest) -> StrataResult<ApplyOutcome>;

    async fn delete(&self, ctx: &Context, key: &ObjectKey) -> StrataResult<DeleteOutcome>;

    /// Stream committed events matching `filter` until the handle is cancelled,
    /// the receiver dropped, or `ctx` cancelled.
    async fn watch(&self, ctx: &Context, filter: ObjectKey) -> StrataResult<StreamHandle<Event>>;

    /// Kinds with a registered schema.
    async fn kinds(&self, ctx: &Context) -> StrataResult<Vec<KindSchema>>;
}

// ----------------- Streaming primitives -----------------

/// Cancellation handle that aborts the underlying task.
pub struct CancelHandle {
    task: Option<tokio::task::JoinHandle<()>>,
}

impl CancelHandle {
    pub fn new(task: tokio::task::JoinHandle<()>) -> Self {
        Self { task: Some(task) }
    }

    pub fn cancel(mut self) {
        if let Some(h) = self.task.take() {
            h.abort();
        }
    }
}

/// Generic stream handle used by API streaming endpoints.
pub struct StreamHandle<T> {
    pub rx: tokio::sync::mpsc::Receiver<T>,
    pub cancel: CancelHandle,
}

pub(crate) fn queue_cap() -> usize {
    std::env::var("STRATA_QUEUE_CAP").ok().and_then(|s| s.parse::<usize>().ok()).unwrap_or(2048)
}
