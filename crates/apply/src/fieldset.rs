//! Deriving the owned field set of an apply payload.

use serde_json::{Map, Value as Json};
use strata_core::{FieldSet, PathElement, StrataError};

/// Merge keys tried, in order, for arrays of objects.
pub const MERGE_KEYS: [&str; 2] = ["id", "name"];

/// Metadata fields the store owns; payloads cannot set them.
pub const READ_ONLY_METADATA: [&str; 5] = ["revision", "uid", "creationTimestamp", "deletionTimestamp", "managedFields"];

/// Lists treated as sets of strings, owned per element.
const SET_LISTS: [(&str, &str); 1] = [("metadata", "finalizers")];

fn excluded_at_root(field: &str) -> bool {
    matches!(field, "apiVersion" | "kind")
}

fn excluded_in_metadata(field: &str) -> bool {
    matches!(field, "name" | "account") || READ_ONLY_METADATA.contains(&field)
}

/// Remove store-owned metadata from a payload before it is merged.
pub fn strip_read_only(payload: &mut Json) {
    if let Some(meta) = payload.get_mut("metadata").and_then(Json::as_object_mut) {
        for f in READ_ONLY_METADATA {
            meta.remove(f);
        }
    }
}

/// The merge key shared by every element of `items`, if the array is associative.
pub fn merge_key_of(items: &[Json]) -> Option<&'static str> {
    if items.is_empty() {
        return None;
    }
    MERGE_KEYS.into_iter().find(|k| {
        items
            .iter()
            .all(|it| it.as_object().and_then(|o| o.get(*k)).is_some_and(Json::is_string))
    })
}

pub(crate) fn is_set_list(parent: Option<&str>, field: &str, depth: usize) -> bool {
    depth == 1 && SET_LISTS.iter().any(|(p, f)| Some(*p) == parent && *f == field)
}

/// Field set claimed by `payload`. Identity fields and read-only metadata are
/// never claimed.
pub fn fields_from_payload(payload: &Json) -> Result<FieldSet, StrataError> {
    let obj = payload
        .as_object()
        .ok_or_else(|| StrataError::Validation("payload must be a JSON object".into()))?;
    object_set(obj, None, 0)
}

fn object_set(obj: &Map<String, Json>, parent: Option<&str>, depth: usize) -> Result<FieldSet, StrataError> {
    let mut set = FieldSet::new();
    for (field, value) in obj {
        if depth == 0 && excluded_at_root(field) {
            continue;
        }
        if depth == 1 && parent == Some("metadata") && excluded_in_metadata(field) {
            continue;
        }
        let child = if is_set_list(parent, field, depth) {
            set_list(field, value)?
        } else {
            value_set(field, value, depth + 1)?
        };
        if let Some(c) = child {
            set.set_child(PathElement::Field(field.clone()), c);
        }
    }
    Ok(set)
}

/// `None` when the value claims nothing (an object whose members are all excluded).
fn value_set(field: &str, value: &Json, depth: usize) -> Result<Option<FieldSet>, StrataError> {
    match value {
        Json::Object(m) if m.is_empty() => Ok(Some(FieldSet::new())),
        Json::Object(m) => {
            let s = object_set(m, Some(field), depth)?;
            Ok((!s.is_empty()).then_some(s))
        }
        Json::Array(items) => match merge_key_of(items) {
            Some(key) => keyed_list(field, key, items, depth).map(Some),
            None => Ok(Some(FieldSet::new())),
        },
        _ => Ok(Some(FieldSet::new())),
    }
}

fn keyed_list(field: &str, key: &str, items: &[Json], depth: usize) -> Result<FieldSet, StrataError> {
    let mut set = FieldSet::new();
    for item in items {
        let Some(obj) = item.as_object() else { continue };
        let value = obj.get(key).and_then(Json::as_str).unwrap_or_default().to_string();
        let el = PathElement::Key { name: key.to_string(), value };
        if set.get(&el).is_some() {
            return Err(StrataError::Validation(format!("duplicate {key} {el} in list {field}")));
        }
        // The merge key identifies the element; it is not owned separately.
        let mut rest = obj.clone();
        rest.remove(key);
        set.set_child(el, object_set(&rest, Some(field), depth)?);
    }
    Ok(set)
}

fn set_list(field: &str, value: &Json) -> Result<Option<FieldSet>, StrataError> {
    let items = match value {
        Json::Array(items) => items,
        Json::Null => return Ok(None),
        _ => return Err(StrataError::Validation(format!("{field} must be a list of strings"))),
    };
    let mut set = FieldSet::new();
    for item in items {
        let s = item
            .as_str()
            .ok_or_else(|| StrataError::Validation(format!("{field} must be a list of strings")))?;
        set.set_child(PathElement::Value(s.to_string()), FieldSet::new());
    }
    Ok((!set.is_empty()).then_some(set))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use strata_core::FieldPath;

    fn leaves(payload: Json) -> Vec<String> {
        fields_from_payload(&payload).unwrap().leaves().iter().map(FieldPath::to_string).collect()
    }

    #[test]
    fn identity_fields_are_not_owned() {
        let got = leaves(json!({
            "apiVersion": "g/v1",
            "kind": "K",
            "metadata": {"name": "n", "account": "a", "revision": 4, "labels": {"team": "x"}},
            "spec": {"a": 1}
        }));
        assert_eq!(got, vec!["metadata.labels.team", "spec.a"]);
    }

    #[test]
    fn scalars_lists_and_empty_values_are_leaves() {
        let got = leaves(json!({"spec": {"tags": ["a", "b"], "none": [], "empty": {}, "n": null}}));
        assert_eq!(got, vec!["spec.empty", "spec.n", "spec.none", "spec.tags"]);
    }

    #[test]
    fn keyed_lists_are_owned_per_element() {
        let got = leaves(json!({"spec": {"items": [{"id": "a", "size": 1}, {"id": "b"}]}}));
        assert_eq!(got, vec!["spec.items[id=a].size", "spec.items[id=b]"]);
        let got = leaves(json!({"spec": {"ports": [{"name": "http", "port": 80}]}}));
        assert_eq!(got, vec!["spec.ports[name=http].port"]);
    }

    #[test]
    fn unkeyed_objects_in_lists_are_leaves() {
        let got = leaves(json!({"spec": {"rules": [{"id": "a"}, {"x": 1}]}}));
        assert_eq!(got, vec!["spec.rules"]);
    }

    #[test]
    fn duplicate_list_keys_are_rejected() {
        let err = fields_from_payload(&json!({"items": [{"id": "a"}, {"id": "a"}]})).unwrap_err();
        assert!(err.to_string().contains("duplicate"), "{err}");
    }

    #[test]
    fn finalizers_are_owned_per_value() {
        let got = leaves(json!({"metadata": {"name": "n", "finalizers": ["x/y", "z"]}}));
        assert_eq!(got, vec!["metadata.finalizers[\"x/y\"]", "metadata.finalizers[\"z\"]"]);
        assert!(leaves(json!({"metadata": {"name": "n", "finalizers": []}})).is_empty());
    }

    #[test]
    fn strip_removes_read_only_metadata() {
        let mut p = json!({"metadata": {"name": "n", "uid": "u", "revision": 3, "managedFields": []}});
        strip_read_only(&mut p);
        assert_eq!(p, json!({"metadata": {"name": "n"}}));
    }
}
