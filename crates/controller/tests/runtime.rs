use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::{json, Value as Json};
use strata_api::{InProcApi, StrataApi};
use strata_controller::{
    ensure_finalizer, identity, ignore_not_found, release_finalizer, Context, Controller, ControllerOptions,
    ReconcileError, ReconcileResult, Reconciler, Request, Runtime, Validator,
};
use strata_core::{ApplyOutcome, ApplyRequest, DeleteOutcome, ObjectKey, StrataError, StrataResult};
use strata_store::{ObjectStore, StoreConfig};

fn api() -> Arc<InProcApi> {
    Arc::new(InProcApi::new(ObjectStore::new(StoreConfig::default())))
}

fn widget(name: &str) -> ObjectKey {
    ObjectKey::new("g", "v1", "Widget", "t1", name)
}

fn widgets() -> ObjectKey {
    ObjectKey::new("g", "v1", "Widget", "", "")
}

fn fast() -> ControllerOptions {
    ControllerOptions::default()
        .with_max_concurrent(4)
        .with_backoff(Duration::from_millis(10), Duration::from_millis(80))
        .with_stop_timeout(Duration::from_secs(5))
}

fn with_n(key: &ObjectKey, n: u64) -> Json {
    let mut p = identity(key);
    p["spec"] = json!({"n": n});
    p
}

async fn eventually<F: Fn() -> bool>(what: &str, f: F) {
    for _ in 0..500 {
        if f() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("timed out waiting for {what}");
}

/// Records overlap per key and the last spec value it observed.
struct Probe {
    api: Arc<InProcApi>,
    running: AtomicUsize,
    max_running: AtomicUsize,
    runs: AtomicUsize,
    last_seen: Mutex<Option<u64>>,
}

#[async_trait::async_trait]
impl Reconciler for Probe {
    async fn reconcile(&self, ctx: &Context, req: Request) -> Result<ReconcileResult, ReconcileError> {
        let now = self.running.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_running.fetch_max(now, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(2)).await;
        let obj = self.api.get(ctx, &req.key).await;
        self.running.fetch_sub(1, Ordering::SeqCst);
        self.runs.fetch_add(1, Ordering::SeqCst);
        let obj = obj?;
        *self.last_seen.lock().unwrap() = obj.raw["spec"]["n"].as_u64();
        Ok(ReconcileResult::done())
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn single_flight_per_key_and_last_run_sees_latest() {
    let api = api();
    let probe = Arc::new(Probe {
        api: api.clone(),
        running: AtomicUsize::new(0),
        max_running: AtomicUsize::new(0),
        runs: AtomicUsize::new(0),
        last_seen: Mutex::new(None),
    });
    let controller = Controller::builder(api.clone(), "probe", widgets())
        .options(fast())
        .start(probe.clone())
        .await
        .unwrap();

    let ctx = Context::background();
    let key = widget("w");
    for n in 0..100 {
        api.apply(&ctx, ApplyRequest::new(key.clone(), "m", with_n(&key, n))).await.unwrap();
    }

    eventually("last run to see n=99", || *probe.last_seen.lock().unwrap() == Some(99)).await;
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(probe.max_running.load(Ordering::SeqCst), 1);
    assert!(probe.runs.load(Ordering::SeqCst) <= 100);
    assert_eq!(*probe.last_seen.lock().unwrap(), Some(99));
    controller.stop().await.unwrap();
}

struct Flaky {
    failures: u32,
    calls: AtomicU32,
    panic_first: bool,
}

#[async_trait::async_trait]
impl Reconciler for Flaky {
    async fn reconcile(&self, _ctx: &Context, _req: Request) -> Result<ReconcileResult, ReconcileError> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        if self.panic_first && call == 1 {
            panic!("reconciler blew up");
        }
        if call <= self.failures {
            return Err(anyhow::anyhow!("attempt {call} failed").into());
        }
        Ok(ReconcileResult::done())
    }
}

#[tokio::test]
async fn errors_retry_with_backoff_until_success() {
    let api = api();
    let ctx = Context::background();
    api.apply(&ctx, ApplyRequest::new(widget("a"), "m", with_n(&widget("a"), 1))).await.unwrap();

    let flaky = Arc::new(Flaky { failures: 3, calls: AtomicU32::new(0), panic_first: false });
    let controller = Controller::builder(api.clone(), "flaky", widgets()).options(fast()).start(flaky.clone()).await.unwrap();

    eventually("fourth attempt", || flaky.calls.load(Ordering::SeqCst) >= 4).await;
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(flaky.calls.load(Ordering::SeqCst), 4, "success must stop retries");
    controller.stop().await.unwrap();
}

#[tokio::test]
async fn panic_is_treated_as_an_error() {
    let api = api();
    let ctx = Context::background();
    api.apply(&ctx, ApplyRequest::new(widget("a"), "m", with_n(&widget("a"), 1))).await.unwrap();

    let flaky = Arc::new(Flaky { failures: 0, calls: AtomicU32::new(0), panic_first: true });
    let controller = Controller::builder(api.clone(), "panicky", widgets()).options(fast()).start(flaky.clone()).await.unwrap();

    eventually("retry after panic", || flaky.calls.load(Ordering::SeqCst) >= 2).await;
    controller.stop().await.unwrap();
}

struct Periodic {
    calls: AtomicU32,
}

#[async_trait::async_trait]
impl Reconciler for Periodic {
    async fn reconcile(&self, _ctx: &Context, _req: Request) -> Result<ReconcileResult, ReconcileError> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        if call < 3 {
            Ok(ReconcileResult::requeue_after(Duration::from_millis(20)))
        } else {
            Ok(ReconcileResult::done())
        }
    }
}

#[tokio::test]
async fn requeue_after_runs_again_without_new_events() {
    let api = api();
    let ctx = Context::background();
    api.apply(&ctx, ApplyRequest::new(widget("a"), "m", with_n(&widget("a"), 1))).await.unwrap();

    let periodic = Arc::new(Periodic { calls: AtomicU32::new(0) });
    let controller =
        Controller::builder(api.clone(), "periodic", widgets()).options(fast()).start(periodic.clone()).await.unwrap();
    eventually("three runs", || periodic.calls.load(Ordering::SeqCst) >= 3).await;
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(periodic.calls.load(Ordering::SeqCst), 3);
    controller.stop().await.unwrap();
}

struct Stuck {
    started: AtomicBool,
}

#[async_trait::async_trait]
impl Reconciler for Stuck {
    async fn reconcile(&self, ctx: &Context, _req: Request) -> Result<ReconcileResult, ReconcileError> {
        self.started.store(true, Ordering::SeqCst);
        ctx.token().cancelled().await;
        Err(StrataError::Transport("cancelled".into()).into())
    }
}

#[tokio::test]
async fn stop_is_bounded_by_stop_timeout() {
    let api = api();
    let ctx = Context::background();
    api.apply(&ctx, ApplyRequest::new(widget("a"), "m", with_n(&widget("a"), 1))).await.unwrap();

    let stuck = Arc::new(Stuck { started: AtomicBool::new(false) });
    let controller = Controller::builder(api.clone(), "stuck", widgets())
        .options(fast().with_stop_timeout(Duration::from_millis(50)))
        .start(stuck.clone())
        .await
        .unwrap();
    eventually("reconcile to start", || stuck.started.load(Ordering::SeqCst)).await;
    let err = controller.stop().await.unwrap_err();
    assert!(err.to_string().contains("timeout"), "{err}");
}

const FINALIZER: &str = "azuredevops/project";
const MANAGER: &str = "ctlr-project";

/// Claims a finalizer, reports a phase, and releases the finalizer on deletion.
struct ProjectReconciler {
    api: Arc<InProcApi>,
}

#[async_trait::async_trait]
impl Reconciler for ProjectReconciler {
    async fn reconcile(&self, ctx: &Context, req: Request) -> Result<ReconcileResult, ReconcileError> {
        let Some(obj) = ignore_not_found(self.api.get(ctx, &req.key).await.map(Some))? else {
            return Ok(ReconcileResult::done());
        };
        let meta = obj.meta()?;
        let mut status = identity(&req.key);
        if meta.is_deleting() {
            status["status"] = json!({"phase": "Deleting"});
            let payload = release_finalizer(status, FINALIZER);
            ignore_not_found(self.api.apply(ctx, ApplyRequest::new(req.key, MANAGER, payload)).await.map(Some))?;
            return Ok(ReconcileResult::done());
        }
        status["status"] = json!({"phase": "Ready"});
        let payload = ensure_finalizer(status, FINALIZER);
        self.api.apply(ctx, ApplyRequest::new(req.key, MANAGER, payload)).await?;
        Ok(ReconcileResult::done())
    }
}

#[tokio::test]
async fn project_controller_end_to_end() {
    let api = api();
    let mut runtime = Runtime::new(api.clone()).with_options(fast());
    runtime
        .register(
            "project",
            ObjectKey::new("azuredevops", "v1", "Project", "", ""),
            Arc::new(ProjectReconciler { api: api.clone() }),
        )
        .await
        .unwrap();
    assert!(runtime.controller("Project").is_some());

    let ctx = Context::background();
    let key = ObjectKey::new("azuredevops", "v1", "Project", "acme", "web");
    let mut desired = identity(&key);
    desired["spec"] = json!({"description": "web site"});
    api.apply(&ctx, ApplyRequest::new(key.clone(), "hzctl", desired)).await.unwrap();

    let ready = |api: Arc<InProcApi>, key: ObjectKey| async move {
        for _ in 0..500 {
            if let Ok(obj) = api.get(&Context::background(), &key).await {
                if obj.raw["status"]["phase"] == json!("Ready") {
                    return obj;
                }
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("project never became ready");
    };
    let obj = ready(api.clone(), key.clone()).await;
    assert_eq!(obj.raw["spec"]["description"], json!("web site"));
    assert_eq!(obj.raw["metadata"]["finalizers"], json!([FINALIZER]));

    assert_eq!(api.delete(&ctx, &key).await.unwrap(), DeleteOutcome::DeletionRequested);
    let mut gone = false;
    for _ in 0..500 {
        if api.get(&ctx, &key).await.is_err_and(|e| e.is_not_found()) {
            gone = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(gone, "finalizer release should purge the project");
    runtime.stop().await.unwrap();
}

#[tokio::test]
async fn runtime_rejects_duplicate_kinds() {
    let api = api();
    let mut runtime = Runtime::new(api.clone()).with_options(fast());
    let periodic = Arc::new(Periodic { calls: AtomicU32::new(0) });
    runtime.register("a", widgets(), periodic.clone()).await.unwrap();
    let err = runtime.register("b", widgets(), periodic).await.unwrap_err();
    assert!(matches!(err, StrataError::Validation(_)));
    assert_eq!(runtime.len(), 1);
    runtime.stop().await.unwrap();
}

/// Widgets may never shrink `spec.n`.
struct Monotonic;

impl Validator for Monotonic {
    fn validate_update(&self, old: &Json, new: &Json) -> StrataResult<()> {
        let n = |v: &Json| v.pointer("/spec/n").and_then(Json::as_u64).unwrap_or(0);
        if n(new) < n(old) {
            return Err(StrataError::Validation(format!("spec.n may not decrease below {}", n(old))));
        }
        Ok(())
    }
}

#[tokio::test]
async fn controller_validator_guards_writes_while_running() {
    let api = api();
    let ctx = Context::background();
    let mut runtime = Runtime::new(api.clone()).with_options(fast());
    let periodic = Arc::new(Periodic { calls: AtomicU32::new(0) });
    let err = runtime.register_with_validator("w", widgets(), periodic.clone(), Arc::new(Monotonic)).await.unwrap_err();
    assert!(matches!(err, StrataError::Validation(_)));

    let mut runtime = runtime.with_validators(api.store().validators().clone());
    runtime.register_with_validator("w", widgets(), periodic, Arc::new(Monotonic)).await.unwrap();
    let key = widget("a");
    api.apply(&ctx, ApplyRequest::new(key.clone(), "m", with_n(&key, 5))).await.unwrap();
    let err = api.apply(&ctx, ApplyRequest::new(key.clone(), "m", with_n(&key, 2))).await.unwrap_err();
    assert!(matches!(err, StrataError::Validation(_)), "{err:?}");
    assert_eq!(api.get(&ctx, &key).await.unwrap().raw["spec"]["n"], json!(5));

    runtime.stop().await.unwrap();
    assert!(api.store().validators().is_empty());
    let out = api.apply(&ctx, ApplyRequest::new(key.clone(), "m", with_n(&key, 2))).await.unwrap();
    assert_eq!(out, ApplyOutcome::Updated);
}
