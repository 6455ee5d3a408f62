#![forbid(unsafe_code)]

use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value as Json};
use strata_core::{
    ApplyOutcome, ApplyRequest, Context, DeleteOutcome, Event, EventOperation, ListFilter, ObjectKey, StrataError,
    StrataResult,
};
use strata_schema::{KindSchema, SchemaRegistry};
use strata_store::{GarbageCollector, ObjectStore, StoreConfig, Validator};
use strata_watch::Subscription;

fn project(name: &str) -> ObjectKey {
    ObjectKey::new("azuredevops", "v1", "Project", "acme", name)
}

fn ident(key: &ObjectKey) -> Json {
    json!({
        "apiVersion": key.api_version(),
        "kind": key.kind,
        "metadata": {"name": key.name, "account": key.account},
    })
}

fn with(mut base: Json, path: &[&str], value: Json) -> Json {
    let mut cur = &mut base;
    for seg in &path[..path.len() - 1] {
        cur = cur
            .as_object_mut()
            .unwrap()
            .entry(seg.to_string())
            .or_insert_with(|| json!({}));
    }
    cur[path[path.len() - 1]] = value;
    base
}

async fn next(sub: &mut Subscription) -> Event {
    tokio::time::timeout(Duration::from_secs(2), sub.recv()).await.expect("event in time").expect("open")
}

async fn drained(sub: &mut Subscription) -> Vec<Event> {
    let mut out = Vec::new();
    while let Ok(Some(ev)) = tokio::time::timeout(Duration::from_millis(100), sub.recv()).await {
        out.push(ev);
    }
    out
}

#[tokio::test]
async fn repeated_apply_is_a_noop() {
    let store = ObjectStore::new(StoreConfig::default());
    let ctx = Context::background();
    let key = project("web");
    let payload = with(ident(&key), &["spec", "description"], json!("site"));
    let mut sub = store.subscribe(key.clone());

    let first = store.apply(&ctx, ApplyRequest::new(key.clone(), "hzctl", payload.clone())).await.unwrap();
    let rev = store.revision();
    let second = store.apply(&ctx, ApplyRequest::new(key.clone(), "hzctl", payload)).await.unwrap();

    assert_eq!((first, second), (ApplyOutcome::Created, ApplyOutcome::Noop));
    assert_eq!(store.revision(), rev);
    let events = drained(&mut sub).await;
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].operation, EventOperation::Create);
}

#[tokio::test]
async fn get_returns_what_was_applied() {
    let store = ObjectStore::new(StoreConfig::default());
    let ctx = Context::background();
    let key = project("web");
    let payload = with(ident(&key), &["spec", "repos"], json!([{"name": "api", "branch": "main"}]));
    store.apply(&ctx, ApplyRequest::new(key.clone(), "hzctl", payload)).await.unwrap();

    let got = store.get(&ctx, &key).unwrap();
    assert_eq!(got.raw["spec"]["repos"], json!([{"name": "api", "branch": "main"}]));
    let meta = got.meta().unwrap();
    assert_eq!(meta.managed_fields.iter().count(), 1);
    assert!(meta.managed_fields.manager("hzctl").is_some());
}

#[tokio::test]
async fn conflicting_manager_is_rejected_until_forced() {
    let store = ObjectStore::new(StoreConfig::default());
    let ctx = Context::background();
    let key = project("web");
    let owned = with(ident(&key), &["spec", "description"], json!("a"));
    store.apply(&ctx, ApplyRequest::new(key.clone(), "hzctl", owned)).await.unwrap();

    let rival = with(ident(&key), &["spec", "description"], json!("b"));
    let err = store.apply(&ctx, ApplyRequest::new(key.clone(), "other", rival.clone())).await.unwrap_err();
    match &err {
        StrataError::Conflict(conflicts) => {
            assert_eq!(conflicts.len(), 1);
            assert_eq!(conflicts[0].manager, "hzctl");
        }
        other => panic!("expected conflict, got {other:?}"),
    }
    assert_eq!(store.get(&ctx, &key).unwrap().raw["spec"]["description"], json!("a"));

    let out = store.apply(&ctx, ApplyRequest::new(key.clone(), "other", rival).forced()).await.unwrap();
    assert_eq!(out, ApplyOutcome::Updated);
    let got = store.get(&ctx, &key).unwrap();
    assert_eq!(got.raw["spec"]["description"], json!("b"));
    assert!(got.meta().unwrap().managed_fields.manager("hzctl").is_none());
}

#[tokio::test]
async fn delete_without_finalizers_purges() {
    let store = ObjectStore::new(StoreConfig::default());
    let ctx = Context::background();
    let key = project("web");
    store.apply(&ctx, ApplyRequest::new(key.clone(), "hzctl", ident(&key))).await.unwrap();
    let mut sub = store.subscribe(key.clone());

    assert_eq!(store.delete(&ctx, &key).await.unwrap(), DeleteOutcome::Purged);
    assert!(store.get(&ctx, &key).unwrap_err().is_not_found());
    assert!(store.delete(&ctx, &key).await.unwrap_err().is_not_found());
    let ev = next(&mut sub).await;
    assert_eq!(ev.operation, EventOperation::Purge);
    assert!(ev.data.is_none());
}

#[tokio::test]
async fn finalizers_hold_deletion_until_released() {
    let store = ObjectStore::new(StoreConfig::default());
    let ctx = Context::background();
    let key = project("web");
    store.apply(&ctx, ApplyRequest::new(key.clone(), "hzctl", ident(&key))).await.unwrap();
    for (mgr, fin) in [("ctlr-1", "f1"), ("ctlr-2", "f2")] {
        let p = with(ident(&key), &["metadata", "finalizers"], json!([fin]));
        store.apply(&ctx, ApplyRequest::new(key.clone(), mgr, p)).await.unwrap();
    }
    let mut sub = store.subscribe(key.clone());

    assert_eq!(store.delete(&ctx, &key).await.unwrap(), DeleteOutcome::DeletionRequested);
    assert_eq!(store.delete(&ctx, &key).await.unwrap(), DeleteOutcome::AlreadyDeleting);
    let meta = store.get(&ctx, &key).unwrap().meta().unwrap();
    assert!(meta.is_deleting());
    assert_eq!(meta.finalizers.as_ref().map(|f| f.len()), Some(2));

    store.apply(&ctx, ApplyRequest::new(key.clone(), "ctlr-1", ident(&key))).await.unwrap();
    let meta = store.get(&ctx, &key).unwrap().meta().unwrap();
    assert!(meta.finalizers.as_ref().is_some_and(|f| f.contains("f2") && !f.contains("f1")));

    store.apply(&ctx, ApplyRequest::new(key.clone(), "ctlr-2", ident(&key))).await.unwrap();
    assert!(store.get(&ctx, &key).unwrap_err().is_not_found());

    let ops: Vec<_> = drained(&mut sub).await.into_iter().map(|e| e.operation).collect();
    assert_eq!(
        ops,
        vec![EventOperation::DeleteRequested, EventOperation::DeleteRequested, EventOperation::Purge]
    );
}

#[tokio::test]
async fn project_reconcile_flow() {
    let store = ObjectStore::new(StoreConfig::default());
    let ctx = Context::background();
    let key = project("web");
    let desired = with(ident(&key), &["spec", "description"], json!("web site"));
    store.apply(&ctx, ApplyRequest::new(key.clone(), "hzctl", desired)).await.unwrap();

    // The controller claims a finalizer and reports status.
    let status = with(
        with(ident(&key), &["metadata", "finalizers"], json!(["azuredevops/project"])),
        &["status", "phase"],
        json!("Ready"),
    );
    store.apply(&ctx, ApplyRequest::new(key.clone(), "ctlr-project", status.clone())).await.unwrap();

    // The user changes the spec without touching controller fields.
    let changed = with(ident(&key), &["spec", "description"], json!("new site"));
    assert_eq!(
        store.apply(&ctx, ApplyRequest::new(key.clone(), "hzctl", changed)).await.unwrap(),
        ApplyOutcome::Updated
    );
    let got = store.get(&ctx, &key).unwrap();
    assert_eq!(got.raw["status"]["phase"], json!("Ready"));
    assert_eq!(got.raw["spec"]["description"], json!("new site"));
    assert_eq!(
        store.apply(&ctx, ApplyRequest::new(key.clone(), "ctlr-project", status)).await.unwrap(),
        ApplyOutcome::Noop
    );

    assert_eq!(store.delete(&ctx, &key).await.unwrap(), DeleteOutcome::DeletionRequested);
    let cleanup = with(ident(&key), &["status", "phase"], json!("Deleting"));
    store.apply(&ctx, ApplyRequest::new(key.clone(), "ctlr-project", cleanup)).await.unwrap();
    assert!(store.get(&ctx, &key).unwrap_err().is_not_found());
}

#[tokio::test]
async fn metadata_only_apply_then_forced_finalizer_release() {
    let store = ObjectStore::new(StoreConfig::default());
    let ctx = Context::background();
    let key = ObjectKey::new("azuredevops", "v1", "Project", "t1", "p1");
    let claimed = with(
        with(ident(&key), &["metadata", "finalizers"], json!(["azuredevops/project"])),
        &["status", "ready"],
        json!(true),
    );
    let first = store.apply(&ctx, ApplyRequest::new(key.clone(), "ctlr-project", claimed)).await.unwrap();
    assert_eq!(first, ApplyOutcome::Created);

    let second = store.apply(&ctx, ApplyRequest::new(key.clone(), "hzctl", ident(&key))).await.unwrap();
    assert_eq!(second, ApplyOutcome::Updated);
    let got = store.get(&ctx, &key).unwrap();
    assert_eq!(got.raw["status"], json!({"ready": true}));
    assert!(got.meta().unwrap().managed_fields.manager("hzctl").is_some());
    assert_eq!(
        store.apply(&ctx, ApplyRequest::new(key.clone(), "hzctl", ident(&key))).await.unwrap(),
        ApplyOutcome::Noop
    );

    let mut sub = store.subscribe(key.clone());
    assert_eq!(store.delete(&ctx, &key).await.unwrap(), DeleteOutcome::DeletionRequested);
    let meta = store.get(&ctx, &key).unwrap().meta().unwrap();
    assert!(meta.is_deleting());
    assert!(meta.finalizers.as_ref().is_some_and(|f| f.contains("azuredevops/project")));

    store.apply(&ctx, ApplyRequest::new(key.clone(), "ctlr-project", ident(&key)).forced()).await.unwrap();
    assert!(store.get(&ctx, &key).unwrap_err().is_not_found());
    let ops: Vec<_> = drained(&mut sub).await.into_iter().map(|e| e.operation).collect();
    assert_eq!(ops.last(), Some(&EventOperation::Purge));
}

/// Rejects a change of `spec.region` once set.
struct RegionIsImmutable;

impl Validator for RegionIsImmutable {
    fn validate_update(&self, old: &Json, new: &Json) -> StrataResult<()> {
        match (old.pointer("/spec/region"), new.pointer("/spec/region")) {
            (Some(was), Some(now)) if was != now => {
                Err(StrataError::Validation(format!("spec.region is immutable (was {was})")))
            }
            _ => Ok(()),
        }
    }
}

#[tokio::test]
async fn rejected_update_leaves_the_object_unchanged() {
    let store = ObjectStore::new(StoreConfig::default());
    store.validators().register("azuredevops", "Project", Arc::new(RegionIsImmutable)).unwrap();
    let ctx = Context::background();
    let key = project("web");
    let eu = with(ident(&key), &["spec", "region"], json!("eu"));
    assert_eq!(store.apply(&ctx, ApplyRequest::new(key.clone(), "hzctl", eu)).await.unwrap(), ApplyOutcome::Created);
    let before = store.get(&ctx, &key).unwrap();
    let rev = store.revision();
    let mut sub = store.subscribe(key.clone());

    let us = with(ident(&key), &["spec", "region"], json!("us"));
    let err = store.apply(&ctx, ApplyRequest::new(key.clone(), "hzctl", us)).await.unwrap_err();
    assert!(matches!(err, StrataError::Validation(ref m) if m.contains("immutable")), "{err:?}");
    assert_eq!(store.get(&ctx, &key).unwrap(), before);
    assert_eq!(store.revision(), rev);
    assert!(drained(&mut sub).await.is_empty());

    // Other fields still update.
    let tagged = with(with(ident(&key), &["spec", "region"], json!("eu")), &["spec", "owner"], json!("ops"));
    assert_eq!(store.apply(&ctx, ApplyRequest::new(key.clone(), "hzctl", tagged)).await.unwrap(), ApplyOutcome::Updated);
}

#[tokio::test]
async fn list_filters_and_keeps_creation_order() {
    let store = ObjectStore::new(StoreConfig::default());
    let ctx = Context::background();
    for name in ["web-b", "db", "web-a"] {
        let key = project(name);
        store.apply(&ctx, ApplyRequest::new(key.clone(), "hzctl", ident(&key))).await.unwrap();
    }
    let other = ObjectKey::new("azuredevops", "v1", "Project", "other", "web-c");
    store.apply(&ctx, ApplyRequest::new(other.clone(), "hzctl", ident(&other))).await.unwrap();

    let all = store.list(&ctx, &ListFilter::new(ObjectKey::new("azuredevops", "", "Project", "acme", ""))).unwrap();
    let names: Vec<_> = all.items.iter().map(|o| o.key.name.as_str()).collect();
    assert_eq!(names, vec!["web-b", "db", "web-a"]);

    let web = store
        .list(&ctx, &ListFilter::new(ObjectKey::new("", "", "Project", "", "")).with_name_prefix("web-"))
        .unwrap();
    assert_eq!(web.len(), 3);
}

#[tokio::test]
async fn events_for_a_key_arrive_in_revision_order() {
    let store = ObjectStore::new(StoreConfig::default());
    let ctx = Context::background();
    let key = project("web");
    let mut sub = store.subscribe(key.clone());
    for i in 0..20 {
        let p = with(ident(&key), &["spec", "counter"], json!(i));
        store.apply(&ctx, ApplyRequest::new(key.clone(), "hzctl", p)).await.unwrap();
    }
    let revs: Vec<u64> = drained(&mut sub).await.iter().map(|e| e.revision).collect();
    assert_eq!(revs.len(), 20);
    assert!(revs.windows(2).all(|w| w[0] < w[1]));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_managers_on_one_key() {
    let store = ObjectStore::new(StoreConfig::default());
    let key = project("web");
    store.apply(&Context::background(), ApplyRequest::new(key.clone(), "hzctl", ident(&key))).await.unwrap();
    let mut sub = store.subscribe(key.clone());

    let mut tasks = Vec::new();
    for i in 0..8 {
        let store = store.clone();
        let key = key.clone();
        tasks.push(tokio::spawn(async move {
            let field = format!("field{i}");
            let p = with(ident(&key), &["spec", field.as_str()], json!(i));
            store.apply(&Context::background(), ApplyRequest::new(key, format!("mgr-{i}"), p)).await
        }));
    }
    for t in tasks {
        assert_eq!(t.await.unwrap().unwrap(), ApplyOutcome::Updated);
    }

    let got = store.get(&Context::background(), &key).unwrap();
    assert_eq!(got.raw["spec"].as_object().unwrap().len(), 8);
    let revs: Vec<u64> = drained(&mut sub).await.iter().map(|e| e.revision).collect();
    assert_eq!(revs.len(), 8);
    assert!(revs.windows(2).all(|w| w[0] < w[1]));
    assert_eq!(got.revision(), revs.last().copied());
}

#[tokio::test]
async fn schema_violations_are_not_committed() {
    let schema = KindSchema {
        group: "azuredevops".into(),
        version: "v1".into(),
        kind: "Project".into(),
        schema: Some(json!({
            "type": "object",
            "properties": {"spec": {"type": "object", "properties": {"size": {"type": "integer"}}}}
        })),
        printer_columns: Vec::new(),
    };
    let schemas = SchemaRegistry::builder().register(schema).unwrap().build();
    let store = ObjectStore::new(StoreConfig::default().with_schemas(schemas));
    let ctx = Context::background();
    let key = project("web");

    let bad = with(ident(&key), &["spec", "size"], json!("large"));
    let err = store.apply(&ctx, ApplyRequest::new(key.clone(), "hzctl", bad)).await.unwrap_err();
    assert!(matches!(err, StrataError::Validation(_)), "{err:?}");
    assert!(store.is_empty());

    let good = with(ident(&key), &["spec", "size"], json!(3));
    assert_eq!(store.apply(&ctx, ApplyRequest::new(key, "hzctl", good)).await.unwrap(), ApplyOutcome::Created);
}

#[tokio::test]
async fn purging_an_owner_cascades_to_children() {
    let store = ObjectStore::new(StoreConfig::default());
    let gc = GarbageCollector::start(&store);
    let ctx = Context::background();
    let owner = project("web");
    store.apply(&ctx, ApplyRequest::new(owner.clone(), "hzctl", ident(&owner))).await.unwrap();

    let child = ObjectKey::new("azuredevops", "v1", "Repository", "acme", "web-api");
    let owned = with(
        ident(&child),
        &["metadata", "ownerReferences"],
        json!([{"group": "azuredevops", "version": "v1", "kind": "Project", "account": "acme", "name": "web"}]),
    );
    store.apply(&ctx, ApplyRequest::new(child.clone(), "ctlr-project", owned)).await.unwrap();
    let mut sub = store.subscribe(child.clone());

    store.delete(&ctx, &owner).await.unwrap();
    let ev = next(&mut sub).await;
    assert_eq!(ev.operation, EventOperation::Purge);
    assert!(store.get(&ctx, &child).unwrap_err().is_not_found());
    gc.stop().await;
}
