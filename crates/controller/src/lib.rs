//! Strata reconciler runtime.
//!
//! A [`Controller`] watches one kind through any [`StrataApi`] transport and
//! drives a [`Reconciler`] toward convergence: one run per changed key, at most
//! one in-flight run per key, bounded concurrency across keys, and exponential
//! backoff on failure. [`Runtime`] holds one controller per kind.

#![forbid(unsafe_code)]

mod controller;
pub mod finalizer;
mod queue;

use std::sync::Arc;
use std::time::Duration;

use rustc_hash::FxHashMap;
use strata_api::StrataApi;
use strata_core::{ObjectKey, StrataError, StrataResult};
pub use strata_store::{Validator, Validators};
use tracing::warn;

pub use controller::{backoff_delay, Controller, ControllerBuilder, ControllerOptions};
pub use finalizer::{ensure_finalizer, identity, release_finalizer};
pub use queue::WorkQueue;
pub use strata_core::{ignore_not_found, Context};

/// Identifies the object to converge. The reconciler reads current state itself.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    pub key: ObjectKey,
}

/// What to do with the key after a successful run. The default means "wait for the next change".
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReconcileResult {
    /// Run again immediately.
    pub requeue: bool,
    /// Run again after this delay; takes precedence over `requeue`.
    pub requeue_after: Option<Duration>,
}

impl ReconcileResult {
    pub fn done() -> Self {
        Self::default()
    }

    pub fn requeue() -> Self {
        Self { requeue: true, requeue_after: None }
    }

    pub fn requeue_after(delay: Duration) -> Self {
        Self { requeue: true, requeue_after: Some(delay) }
    }

    pub fn is_zero(&self) -> bool {
        *self == Self::default()
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ReconcileError {
    #[error(transparent)]
    Api(#[from] StrataError),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
    #[error("panic: {0}")]
    Panic(String),
}

impl ReconcileError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::Api(e) if e.is_not_found())
    }
}

/// Converging logic for one kind.
#[async_trait::async_trait]
pub trait Reconciler: Send + Sync + 'static {
    async fn reconcile(&self, ctx: &Context, req: Request) -> Result<ReconcileResult, ReconcileError>;
}

/// Controllers keyed by the kind they reconcile.
pub struct Runtime {
    api: Arc<dyn StrataApi>,
    options: ControllerOptions,
    controllers: FxHashMap<String, Controller>,
    validators: Option<Validators>,
}

impl Runtime {
    pub fn new(api: Arc<dyn StrataApi>) -> Self {
        Self { api, options: ControllerOptions::from_env(), controllers: FxHashMap::default(), validators: None }
    }

    pub fn with_options(mut self, options: ControllerOptions) -> Self {
        self.options = options;
        self
    }

    /// Validator table of the store behind the API; needed by [`Runtime::register_with_validator`].
    pub fn with_validators(mut self, validators: Validators) -> Self {
        self.validators = Some(validators);
        self
    }

    /// Start a controller for `filter.kind`. A kind can be registered once.
    pub async fn register(&mut self, name: &str, filter: ObjectKey, reconciler: Arc<dyn Reconciler>) -> StrataResult<()> {
        self.start(name, filter, reconciler, None).await
    }

    /// Like [`Runtime::register`], also admitting writes of the kind through `validator`.
    pub async fn register_with_validator(
        &mut self,
        name: &str,
        filter: ObjectKey,
        reconciler: Arc<dyn Reconciler>,
        validator: Arc<dyn Validator>,
    ) -> StrataResult<()> {
        if self.validators.is_none() {
            return Err(StrataError::Validation("runtime has no validator table; see Runtime::with_validators".into()));
        }
        self.start(name, filter, reconciler, Some(validator)).await
    }

    async fn start(
        &mut self,
        name: &str,
        filter: ObjectKey,
        reconciler: Arc<dyn Reconciler>,
        validator: Option<Arc<dyn Validator>>,
    ) -> StrataResult<()> {
        if filter.kind.is_empty() {
            return Err(StrataError::Validation("a controller filter must name a kind".into()));
        }
        if self.controllers.contains_key(&filter.kind) {
            return Err(StrataError::Validation(format!("kind {} already has a controller", filter.kind)));
        }
        let kind = filter.kind.clone();
        let mut builder = Controller::builder(self.api.clone(), name, filter).options(self.options.clone());
        if let (Some(table), Some(v)) = (&self.validators, validator) {
            builder = builder.validator(table, v);
        }
        let controller = builder.start(reconciler).await?;
        self.controllers.insert(kind, controller);
        Ok(())
    }

    pub fn controller(&self, kind: &str) -> Option<&Controller> {
        self.controllers.get(kind)
    }

    pub fn len(&self) -> usize {
        self.controllers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.controllers.is_empty()
    }

    /// Stop every controller; the first failure is returned after all were asked to stop.
    pub async fn stop(self) -> anyhow::Result<()> {
        let mut first = None;
        for (kind, controller) in self.controllers {
            if let Err(e) = controller.stop().await {
                warn!(kind = %kind, error = %e, "controller: stop failed");
                first.get_or_insert(e);
            }
        }
        first.map_or(Ok(()), Err)
    }
}
