//! Managed field sets.
//!
//! A [`FieldSet`] is a tree of owned paths. Object members are addressed by
//! [`PathElement::Field`], elements of associative lists (arrays of objects
//! sharing a string merge key) by [`PathElement::Key`], and members of set
//! lists such as `metadata.finalizers` by [`PathElement::Value`]. A node
//! without children is a leaf: the whole value at that path is owned.
//!
//! Serialized form mirrors the familiar `fieldsV1` encoding:
//! `{"f:spec":{"f:replicas":{}},"f:items":{"k:{\"id\":\"a\"}":{...}}}`.

use std::collections::BTreeMap;
use std::fmt;

use serde::de::Error as _;
use serde::ser::SerializeMap;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::error::StrataError;

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum PathElement {
    Field(String),
    Key { name: String, value: String },
    Value(String),
}

impl PathElement {
    fn encode(&self) -> String {
        match self {
            Self::Field(name) => format!("f:{name}"),
            Self::Key { name, value } => {
                let mut m = serde_json::Map::new();
                m.insert(name.clone(), serde_json::Value::String(value.clone()));
                format!("k:{}", serde_json::Value::Object(m))
            }
            Self::Value(v) => format!("v:{}", serde_json::Value::String(v.clone())),
        }
    }

    fn decode(raw: &str) -> Result<Self, StrataError> {
        if let Some(name) = raw.strip_prefix("f:") {
            return Ok(Self::Field(name.to_string()));
        }
        if let Some(body) = raw.strip_prefix("k:") {
            let m: BTreeMap<String, String> = serde_json::from_str(body)
                .map_err(|e| StrataError::Validation(format!("invalid list key {raw:?}: {e}")))?;
            let mut it = m.into_iter();
            return match (it.next(), it.next()) {
                (Some((name, value)), None) => Ok(Self::Key { name, value }),
                _ => Err(StrataError::Validation(format!("list key {raw:?} must have exactly one entry"))),
            };
        }
        if let Some(body) = raw.strip_prefix("v:") {
            let v: String = serde_json::from_str(body)
                .map_err(|e| StrataError::Validation(format!("invalid set value {raw:?}: {e}")))?;
            return Ok(Self::Value(v));
        }
        Err(StrataError::Validation(format!("invalid managed field key {raw:?}")))
    }
}

impl fmt::Display for PathElement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Field(name) => f.write_str(name),
            Self::Key { name, value } => write!(f, "[{name}={value}]"),
            Self::Value(v) => write!(f, "[{v:?}]"),
        }
    }
}

/// A path from the object root, rendered like `spec.items[id=a].size`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FieldPath(pub Vec<PathElement>);

impl FieldPath {
    pub fn child(&self, el: PathElement) -> Self {
        let mut v = self.0.clone();
        v.push(el);
        Self(v)
    }

    /// Convenience for object-only paths: `FieldPath::fields(&["spec", "x"])`.
    pub fn fields(names: &[&str]) -> Self {
        Self(names.iter().map(|n| PathElement::Field((*n).to_string())).collect())
    }
}

impl fmt::Display for FieldPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, el) in self.0.iter().enumerate() {
            if i > 0 && matches!(el, PathElement::Field(_)) {
                f.write_str(".")?;
            }
            write!(f, "{el}")?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FieldSet {
    children: BTreeMap<PathElement, FieldSet>,
}

impl FieldSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_leaf(&self) -> bool {
        self.children.is_empty()
    }

    pub fn is_empty(&self) -> bool {
        self.children.is_empty()
    }

    pub fn children(&self) -> impl Iterator<Item = (&PathElement, &FieldSet)> {
        self.children.iter()
    }

    pub fn get(&self, el: &PathElement) -> Option<&FieldSet> {
        self.children.get(el)
    }

    /// Child node, created as a leaf if missing.
    pub fn entry(&mut self, el: PathElement) -> &mut FieldSet {
        self.children.entry(el).or_default()
    }

    pub fn set_child(&mut self, el: PathElement, child: FieldSet) {
        self.children.insert(el, child);
    }

    pub fn insert(&mut self, path: &FieldPath) {
        let mut node = self;
        for el in &path.0 {
            node = node.entry(el.clone());
        }
    }

    /// Every leaf path in the set.
    pub fn leaves(&self) -> Vec<FieldPath> {
        fn walk(set: &FieldSet, at: &FieldPath, out: &mut Vec<FieldPath>) {
            for (el, child) in &set.children {
                let p = at.child(el.clone());
                if child.is_leaf() {
                    out.push(p);
                } else {
                    walk(child, &p, out);
                }
            }
        }
        let mut out = Vec::new();
        walk(self, &FieldPath::default(), &mut out);
        out
    }

    /// Paths both sets claim, where at least one side owns the whole value.
    pub fn overlaps(&self, other: &FieldSet) -> Vec<FieldPath> {
        fn walk(a: &FieldSet, b: &FieldSet, at: &FieldPath, out: &mut Vec<FieldPath>) {
            for (el, ac) in &a.children {
                let Some(bc) = b.children.get(el) else { continue };
                let p = at.child(el.clone());
                if ac.is_leaf() || bc.is_leaf() {
                    out.push(p);
                } else {
                    walk(ac, bc, &p, out);
                }
            }
        }
        let mut out = Vec::new();
        walk(self, other, &FieldPath::default(), &mut out);
        out
    }

    /// Drop every path that overlaps with `other`. Interior nodes emptied by
    /// the removal are dropped too, so they do not turn into leaves.
    pub fn remove_overlaps(&mut self, other: &FieldSet) {
        let keys: Vec<PathElement> = self.children.keys().cloned().collect();
        for el in keys {
            let Some(oc) = other.children.get(&el) else { continue };
            let drop_it = match self.children.get_mut(&el) {
                Some(sc) if sc.is_leaf() || oc.is_leaf() => true,
                Some(sc) => {
                    sc.remove_overlaps(oc);
                    sc.is_leaf()
                }
                None => false,
            };
            if drop_it {
                self.children.remove(&el);
            }
        }
    }

    /// Paths of `self` that `newer` no longer claims (removed ownership).
    pub fn removed_in(&self, newer: &FieldSet) -> Vec<FieldPath> {
        fn walk(old: &FieldSet, new: &FieldSet, at: &FieldPath, out: &mut Vec<FieldPath>) {
            for (el, oc) in &old.children {
                let p = at.child(el.clone());
                match new.children.get(el) {
                    None => out.push(p),
                    Some(nc) if nc.is_leaf() || oc.is_leaf() => {}
                    Some(nc) => walk(oc, nc, &p, out),
                }
            }
        }
        let mut out = Vec::new();
        walk(self, newer, &FieldPath::default(), &mut out);
        out
    }

    /// Whether the set owns `path`, an ancestor of it as a leaf, or anything below it.
    pub fn touches(&self, path: &FieldPath) -> bool {
        let mut node = self;
        for el in &path.0 {
            match node.children.get(el) {
                Some(child) if child.is_leaf() => return true,
                Some(child) => node = child,
                None => return false,
            }
        }
        true
    }
}

impl Serialize for FieldSet {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.children.len()))?;
        for (el, child) in &self.children {
            map.serialize_entry(&el.encode(), child)?;
        }
        map.end()
    }
}

impl<'de> Deserialize<'de> for FieldSet {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw: BTreeMap<String, FieldSet> = BTreeMap::deserialize(deserializer)?;
        let mut children = BTreeMap::new();
        for (k, v) in raw {
            children.insert(PathElement::decode(&k).map_err(D::Error::custom)?, v);
        }
        Ok(Self { children })
    }
}

pub const FIELDS_TYPE_V1: &str = "FieldsV1";

/// Ownership record of one manager.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ManagedFieldsEntry {
    pub manager: String,
    pub fields_type: String,
    #[serde(rename = "fieldsV1")]
    pub fields: FieldSet,
}

impl ManagedFieldsEntry {
    pub fn new(manager: impl Into<String>, fields: FieldSet) -> Self {
        Self { manager: manager.into(), fields_type: FIELDS_TYPE_V1.to_string(), fields }
    }
}

/// All managers of an object, in first-write order.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ManagedFields(pub Vec<ManagedFieldsEntry>);

impl ManagedFields {
    pub fn manager(&self, name: &str) -> Option<&ManagedFieldsEntry> {
        self.0.iter().find(|e| e.manager == name)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &ManagedFieldsEntry> {
        self.0.iter()
    }
}
