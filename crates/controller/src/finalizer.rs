//! Payload builders for reconcilers that guard deletion with a finalizer.
//!
//! Apply payloads state a manager's full intent, so these helpers edit the
//! payload the reconciler is about to send rather than the stored object.

use serde_json::{json, Map, Value as Json};
use strata_core::ObjectKey;

/// Minimal payload naming `key`: `apiVersion`, `kind`, `metadata.name`, `metadata.account`.
pub fn identity(key: &ObjectKey) -> Json {
    json!({
        "apiVersion": key.api_version(),
        "kind": key.kind,
        "metadata": {"name": key.name, "account": key.account},
    })
}

/// Add `finalizer` to `metadata.finalizers` of the payload, once.
pub fn ensure_finalizer(mut payload: Json, finalizer: &str) -> Json {
    let Some(meta) = metadata_mut(&mut payload) else { return payload };
    let list = meta.entry("finalizers").or_insert_with(|| Json::Array(Vec::new()));
    if !list.is_array() {
        *list = Json::Array(Vec::new());
    }
    if let Some(items) = list.as_array_mut() {
        if !items.iter().any(|f| f.as_str() == Some(finalizer)) {
            items.push(Json::String(finalizer.to_string()));
        }
    }
    payload
}

/// Drop `finalizer` from the payload; an emptied list is removed so the
/// manager stops claiming the field altogether.
pub fn release_finalizer(mut payload: Json, finalizer: &str) -> Json {
    let Some(meta) = metadata_mut(&mut payload) else { return payload };
    let emptied = match meta.get_mut("finalizers").and_then(Json::as_array_mut) {
        Some(items) => {
            items.retain(|f| f.as_str() != Some(finalizer));
            items.is_empty()
        }
        None => false,
    };
    if emptied {
        meta.remove("finalizers");
    }
    payload
}

fn metadata_mut(payload: &mut Json) -> Option<&mut Map<String, Json>> {
    payload
        .as_object_mut()?
        .entry("metadata")
        .or_insert_with(|| Json::Object(Map::new()))
        .as_object_mut()
}
