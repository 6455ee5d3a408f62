use serde_json::{Map, Value as Json};
use strata_core::{FieldSet, PathElement, StrataError};

use crate::merge::read_managed_fields;

/// Minimal apply payload holding only what `manager` owns in `object`, plus
/// the identity fields needed to address it.
///
/// Re-applying the result as `manager` is a no-op, so a controller can start
/// from it to change its own fields without touching anyone else's.
pub fn extract_managed_fields(object: &Json, manager: &str) -> Result<Json, StrataError> {
    let root = object
        .as_object()
        .ok_or_else(|| StrataError::Validation("object must be a JSON object".into()))?;
    let managers = read_managed_fields(object)?;
    let mut out = match managers.manager(manager).and_then(|e| extract(object, &e.fields)) {
        Some(Json::Object(m)) => m,
        _ => Map::new(),
    };
    for f in ["apiVersion", "kind"] {
        if let Some(v) = root.get(f) {
            out.insert(f.to_string(), v.clone());
        }
    }
    let meta = out.entry("metadata").or_insert_with(|| Json::Object(Map::new()));
    if let (Some(meta), Some(src)) = (meta.as_object_mut(), root.get("metadata").and_then(Json::as_object)) {
        for f in ["name", "account"] {
            if let Some(v) = src.get(f) {
                meta.insert(f.to_string(), v.clone());
            }
        }
    }
    Ok(Json::Object(out))
}

fn extract(src: &Json, set: &FieldSet) -> Option<Json> {
    if set.is_leaf() {
        return Some(src.clone());
    }
    match src {
        Json::Object(m) => {
            let mut out = Map::new();
            for (el, child) in set.children() {
                let PathElement::Field(name) = el else { continue };
                if let Some(v) = m.get(name).and_then(|v| extract(v, child)) {
                    out.insert(name.clone(), v);
                }
            }
            Some(Json::Object(out))
        }
        Json::Array(items) => {
            let picked = items.iter().filter_map(|item| pick(item, set)).collect();
            Some(Json::Array(picked))
        }
        _ => None,
    }
}

fn pick(item: &Json, set: &FieldSet) -> Option<Json> {
    set.children().find_map(|(el, child)| match el {
        PathElement::Key { name, value } if item.get(name).and_then(Json::as_str) == Some(value.as_str()) => {
            let mut e = extract(item, child)?;
            if let Some(o) = e.as_object_mut() {
                o.insert(name.clone(), Json::String(value.clone()));
            }
            Some(e)
        }
        PathElement::Value(v) if item.as_str() == Some(v.as_str()) => Some(item.clone()),
        _ => None,
    })
}
