//! Field-manager merge: conflict detection, ownership transfer, purging of
//! released fields and the value merge itself.

use serde_json::{Map, Value as Json};
use strata_core::{
    ApplyOutcome, FieldConflict, FieldPath, FieldSet, ManagedFields, ManagedFieldsEntry, PathElement, StrataError,
};
use tracing::debug;

use crate::fieldset::{fields_from_payload, is_set_list, merge_key_of, strip_read_only};

/// Result of merging one apply payload into the stored object.
#[derive(Debug, Clone, PartialEq)]
pub struct Merged {
    /// Merged object including its rewritten `metadata.managedFields`.
    pub object: Json,
    pub outcome: ApplyOutcome,
    /// Paths taken from other managers by a forced apply.
    pub transferred: Vec<FieldConflict>,
}

pub fn read_managed_fields(object: &Json) -> Result<ManagedFields, StrataError> {
    match object.pointer("/metadata/managedFields") {
        None | Some(Json::Null) => Ok(ManagedFields::default()),
        Some(v) => serde_json::from_value(v.clone())
            .map_err(|e| StrataError::Internal(format!("decoding managed fields: {e}"))),
    }
}

fn write_managed_fields(object: &mut Json, managers: &ManagedFields) -> Result<(), StrataError> {
    let root = object
        .as_object_mut()
        .ok_or_else(|| StrataError::Validation("object must be a JSON object".into()))?;
    let meta = root.entry("metadata").or_insert_with(|| Json::Object(Map::new()));
    let meta = meta
        .as_object_mut()
        .ok_or_else(|| StrataError::Validation("metadata must be an object".into()))?;
    if managers.is_empty() {
        meta.remove("managedFields");
    } else {
        let v = serde_json::to_value(managers)
            .map_err(|e| StrataError::Internal(format!("encoding managed fields: {e}")))?;
        meta.insert("managedFields".into(), v);
    }
    Ok(())
}

/// Merge `payload` from `manager` into `current` (absent for a create).
///
/// Fails with `Conflict` when the payload claims a path another manager owns,
/// unless `force` is set, in which case the paths move to `manager`. Paths
/// `manager` owned before but omitted now are released and, when no other
/// manager still holds them, removed from the value.
pub fn merge_apply(current: Option<&Json>, payload: &Json, manager: &str, force: bool) -> Result<Merged, StrataError> {
    if manager.is_empty() {
        return Err(StrataError::Validation("field manager is required".into()));
    }
    let mut payload = payload.clone();
    strip_read_only(&mut payload);
    let requested = fields_from_payload(&payload)?;

    let Some(current) = current else {
        let mut object = payload;
        let managers = ManagedFields(vec![ManagedFieldsEntry::new(manager, requested)]);
        write_managed_fields(&mut object, &managers)?;
        return Ok(Merged { object, outcome: ApplyOutcome::Created, transferred: Vec::new() });
    };

    let mut managers = read_managed_fields(current)?;
    let conflicts: Vec<FieldConflict> = managers
        .iter()
        .filter(|e| e.manager != manager)
        .flat_map(|e| {
            requested
                .overlaps(&e.fields)
                .into_iter()
                .map(move |p| FieldConflict { manager: e.manager.clone(), path: p.to_string() })
        })
        .collect();
    if !conflicts.is_empty() {
        if !force {
            return Err(StrataError::Conflict(conflicts));
        }
        for e in managers.0.iter_mut().filter(|e| e.manager != manager) {
            e.fields.remove_overlaps(&requested);
        }
    }

    let previous = match managers.0.iter_mut().find(|e| e.manager == manager) {
        Some(e) => std::mem::replace(&mut e.fields, requested.clone()),
        None => {
            managers.0.push(ManagedFieldsEntry::new(manager, requested.clone()));
            FieldSet::new()
        }
    };
    // The issuer keeps its entry even when it owns nothing; others emptied by force are dropped.
    managers.0.retain(|e| e.manager == manager || !e.fields.is_empty());

    let mut object = current.clone();
    for path in previous.removed_in(&requested) {
        if let Some(owned) = subtree(&previous, &path) {
            release(&mut object, path, owned, &managers);
        }
    }
    if let (Some(dst), Some(src)) = (object.as_object_mut(), payload.as_object()) {
        merge_object(dst, src, None, 0);
    }
    write_managed_fields(&mut object, &managers)?;

    let outcome = if object == *current { ApplyOutcome::Noop } else { ApplyOutcome::Updated };
    Ok(Merged { object, outcome, transferred: if force { conflicts } else { Vec::new() } })
}

fn subtree<'a>(set: &'a FieldSet, path: &FieldPath) -> Option<&'a FieldSet> {
    path.0.iter().try_fold(set, |node, el| node.get(el))
}

/// Drop released paths from the value, descending where another manager
/// still holds part of the subtree.
fn release(object: &mut Json, path: FieldPath, owned: &FieldSet, managers: &ManagedFields) {
    if !managers.iter().any(|e| e.fields.touches(&path)) {
        if remove_path(object, &path.0) {
            debug!(path = %path, "apply: released field removed");
        }
        return;
    }
    for (el, child) in owned.children() {
        release(object, path.child(el.clone()), child, managers);
    }
}

fn merge_object(dst: &mut Map<String, Json>, src: &Map<String, Json>, parent: Option<&str>, depth: usize) {
    for (field, sv) in src {
        match dst.get_mut(field) {
            None => {
                dst.insert(field.clone(), sv.clone());
            }
            Some(dv) if is_set_list(parent, field, depth) => union_strings(dv, sv),
            Some(dv) => merge_value(dv, sv, field, depth + 1),
        }
    }
}

fn merge_value(dst: &mut Json, src: &Json, field: &str, depth: usize) {
    match (dst, src) {
        (Json::Object(dm), Json::Object(sm)) if !sm.is_empty() => merge_object(dm, sm, Some(field), depth),
        (Json::Array(da), Json::Array(sa)) => match merge_key_of(sa) {
            Some(key) if da.is_empty() || merge_key_of(da) == Some(key) => merge_keyed(da, sa, key, field, depth),
            _ => *da = sa.clone(),
        },
        (d, s) => *d = s.clone(),
    }
}

fn merge_keyed(dst: &mut Vec<Json>, src: &[Json], key: &str, field: &str, depth: usize) {
    for item in src {
        let id = item.get(key).and_then(Json::as_str);
        let pos = dst.iter().position(|d| d.get(key).and_then(Json::as_str) == id);
        match (pos, item.as_object()) {
            (Some(i), Some(sm)) => {
                if let Some(dm) = dst[i].as_object_mut() {
                    merge_object(dm, sm, Some(field), depth);
                }
            }
            _ => dst.push(item.clone()),
        }
    }
}

fn union_strings(dst: &mut Json, src: &Json) {
    let Json::Array(sa) = src else { return };
    match dst {
        Json::Array(da) => {
            for s in sa {
                if !da.contains(s) {
                    da.push(s.clone());
                }
            }
        }
        d => *d = src.clone(),
    }
}

/// Remove the value at `path`; returns whether anything was removed.
pub(crate) fn remove_path(value: &mut Json, path: &[PathElement]) -> bool {
    let Some((first, rest)) = path.split_first() else { return false };
    match first {
        PathElement::Field(name) => {
            let Some(obj) = value.as_object_mut() else { return false };
            if rest.is_empty() {
                obj.remove(name).is_some()
            } else {
                obj.get_mut(name).is_some_and(|v| remove_path(v, rest))
            }
        }
        PathElement::Key { name, value: id } => {
            let Some(items) = value.as_array_mut() else { return false };
            let pos = items.iter().position(|it| it.get(name).and_then(Json::as_str) == Some(id.as_str()));
            match pos {
                None => false,
                Some(i) if rest.is_empty() => {
                    items.remove(i);
                    true
                }
                Some(i) => remove_path(&mut items[i], rest),
            }
        }
        PathElement::Value(v) => {
            let Some(items) = value.as_array_mut() else { return false };
            let before = items.len();
            items.retain(|it| it.as_str() != Some(v.as_str()));
            before != items.len()
        }
    }
}
