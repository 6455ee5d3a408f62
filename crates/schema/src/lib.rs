//! Strata schema registry: per-kind JSON Schema validation and printer columns.

#![forbid(unsafe_code)]

use std::path::Path;
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use jsonschema::{Draft, JSONSchema};
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use serde_json::Value as Json;
use strata_core::{ObjectKey, StrataError};
use tracing::{debug, info};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PrinterColumn {
    pub name: String,
    pub json_path: String,
}

/// Declared schema of one kind, as loaded from a schema file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KindSchema {
    pub group: String,
    pub version: String,
    pub kind: String,
    /// JSON Schema (draft 7) for the whole object.
    #[serde(default)]
    pub schema: Option<Json>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub printer_columns: Vec<PrinterColumn>,
}

impl KindSchema {
    /// Printer columns, falling back to scalar `spec` fields found in the schema.
    pub fn columns(&self) -> Vec<PrinterColumn> {
        let declared: Vec<PrinterColumn> = self
            .printer_columns
            .iter()
            .filter_map(|c| normalize_json_path(&c.json_path).map(|jp| PrinterColumn { name: c.name.clone(), json_path: jp }))
            .collect();
        if !declared.is_empty() {
            return declared;
        }
        self.schema
            .as_ref()
            .and_then(derive_columns_from_schema)
            .unwrap_or_default()
            .into_iter()
            .take(6)
            .map(|p| PrinterColumn { name: column_title(&p), json_path: p })
            .collect()
    }
}

/// One issue reported by schema validation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationIssue {
    pub path: String,
    pub error: String,
}

struct CompiledKind {
    declared: KindSchema,
    compiled: Option<JSONSchema>,
}

type KindId = (String, String, String);

/// Immutable set of kind schemas, cheap to clone and share.
#[derive(Clone, Default)]
pub struct SchemaRegistry {
    kinds: Arc<FxHashMap<KindId, CompiledKind>>,
    /// Reject objects of kinds that were never registered.
    require_known_kind: bool,
}

impl std::fmt::Debug for SchemaRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SchemaRegistry")
            .field("kinds", &self.kinds.len())
            .field("require_known_kind", &self.require_known_kind)
            .finish()
    }
}

/// Builds a [`SchemaRegistry`]; schemas are compiled on `register`.
#[derive(Default)]
pub struct SchemaRegistryBuilder {
    kinds: FxHashMap<KindId, CompiledKind>,
    require_known_kind: bool,
}

impl SchemaRegistryBuilder {
    pub fn require_known_kind(mut self, yes: bool) -> Self {
        self.require_known_kind = yes;
        self
    }

    pub fn register(mut self, declared: KindSchema) -> Result<Self> {
        let compiled = match &declared.schema {
            Some(schema) => Some(
                JSONSchema::options()
                    .with_draft(Draft::Draft7)
                    .compile(schema)
                    .map_err(|e| anyhow!("compiling schema for {}/{}/{}: {e}", declared.group, declared.version, declared.kind))?,
            ),
            None => None,
        };
        let id = (declared.group.clone(), declared.version.clone(), declared.kind.clone());
        debug!(group = %id.0, version = %id.1, kind = %id.2, "schema: registered kind");
        self.kinds.insert(id, CompiledKind { declared, compiled });
        Ok(self)
    }

    /// Register every `*.yaml`, `*.yml` and `*.json` file in `dir`.
    pub fn load_dir(mut self, dir: &Path) -> Result<Self> {
        let mut paths: Vec<_> = std::fs::read_dir(dir)
            .with_context(|| format!("reading schema dir {}", dir.display()))?
            .filter_map(|e| e.ok().map(|e| e.path()))
            .filter(|p| matches!(p.extension().and_then(|s| s.to_str()), Some("yaml" | "yml" | "json")))
            .collect();
        paths.sort();
        for p in paths {
            let text = std::fs::read_to_string(&p).with_context(|| format!("reading {}", p.display()))?;
            let declared: KindSchema =
                serde_yaml::from_str(&text).with_context(|| format!("parsing schema file {}", p.display()))?;
            self = self.register(declared)?;
        }
        info!(dir = %dir.display(), kinds = self.kinds.len(), "schema: loaded schema dir");
        Ok(self)
    }

    pub fn build(self) -> SchemaRegistry {
        SchemaRegistry { kinds: Arc::new(self.kinds), require_known_kind: self.require_known_kind }
    }
}

impl SchemaRegistry {
    pub fn builder() -> SchemaRegistryBuilder {
        SchemaRegistryBuilder::default()
    }

    pub fn len(&self) -> usize {
        self.kinds.len()
    }

    pub fn is_empty(&self) -> bool {
        self.kinds.is_empty()
    }

    pub fn get(&self, key: &ObjectKey) -> Option<&KindSchema> {
        self.kinds.get(&kind_id(key)).map(|k| &k.declared)
    }

    /// Every registered kind, sorted by group, version and kind.
    pub fn kinds(&self) -> Vec<KindSchema> {
        let mut out: Vec<KindSchema> = self.kinds.values().map(|k| k.declared.clone()).collect();
        out.sort_by(|a, b| (&a.group, &a.version, &a.kind).cmp(&(&b.group, &b.version, &b.kind)));
        out
    }

    /// Issues found validating `object` against the schema of its kind.
    pub fn issues(&self, key: &ObjectKey, object: &Json) -> Vec<ValidationIssue> {
        let Some(kind) = self.kinds.get(&kind_id(key)) else {
            if self.require_known_kind {
                return vec![ValidationIssue {
                    path: String::new(),
                    error: format!("unknown kind {}/{}/{}", key.group, key.version, key.kind),
                }];
            }
            return Vec::new();
        };
        let Some(compiled) = &kind.compiled else { return Vec::new() };
        match compiled.validate(object) {
            Ok(()) => Vec::new(),
            Err(errors) => errors
                .map(|e| ValidationIssue { path: e.instance_path.to_string(), error: e.to_string() })
                .collect(),
        }
    }

    /// Validate `object`, folding all issues into one `Validation` error.
    pub fn validate(&self, key: &ObjectKey, object: &Json) -> Result<(), StrataError> {
        let issues = self.issues(key, object);
        if issues.is_empty() {
            return Ok(());
        }
        let parts: Vec<String> = issues
            .iter()
            .map(|i| if i.path.is_empty() { i.error.clone() } else { format!("{}: {}", i.path, i.error) })
            .collect();
        Err(StrataError::Validation(format!("schema validation failed for {key}: {}", parts.join("; "))))
    }
}

fn kind_id(key: &ObjectKey) -> KindId {
    (key.group.clone(), key.version.clone(), key.kind.clone())
}

fn column_title(path: &str) -> String {
    let last = path.rsplit('.').next().unwrap_or(path);
    let last = last.split('[').next().unwrap_or(last);
    last.to_uppercase()
}

pub fn normalize_json_path(jp: &str) -> Option<String> {
    // Accept only simple paths like .spec.foo.bar[0]
    if jp.contains('?') || jp.contains('*') {
        return None;
    }
    let s = jp.strip_prefix('.').unwrap_or(jp);
    if s.is_empty() {
        return None;
    }
    for seg in s.split('.') {
        let (key, index) = match seg.split_once('[') {
            Some((k, rest)) => (k, Some(rest.strip_suffix(']')?)),
            None => (seg, None),
        };
        if key.is_empty() || !key.chars().all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-') {
            return None;
        }
        if let Some(idx) = index {
            if idx.is_empty() || !idx.chars().all(|c| c.is_ascii_digit()) {
                return None;
            }
        }
    }
    Some(s.to_string())
}

/// Follow a path accepted by [`normalize_json_path`].
pub fn extract_path<'a>(root: &'a Json, path: &str) -> Option<&'a Json> {
    let mut cur = root;
    for seg in path.split('.') {
        let (key, idx) = match seg.split_once('[') {
            Some((k, rest)) => (k, Some(rest.strip_suffix(']')?.parse::<usize>().ok()?)),
            None => (seg, None),
        };
        cur = cur.as_object()?.get(key)?;
        if let Some(i) = idx {
            cur = cur.as_array()?.get(i)?;
        }
    }
    Some(cur)
}

/// Render the cells of `columns` for one object; missing values are empty.
pub fn project(raw: &Json, columns: &[PrinterColumn]) -> Vec<String> {
    columns
        .iter()
        .map(|c| match extract_path(raw, &c.json_path) {
            Some(Json::String(s)) => s.clone(),
            Some(Json::Number(n)) => n.to_string(),
            Some(Json::Bool(b)) => b.to_string(),
            _ => String::new(),
        })
        .collect()
}

fn derive_columns_from_schema(schema: &Json) -> Option<Vec<String>> {
    let spec_props = schema.get("properties")?.get("spec")?.get("properties")?.as_object()?;

    fn is_scalar_type(ty: &str) -> bool {
        matches!(ty, "string" | "integer" | "number" | "boolean")
    }

    fn walk_object(obj: &serde_json::Map<String, Json>, base: &str, depth: usize, out: &mut Vec<String>) {
        if depth > 3 || out.len() >= 16 {
            return;
        }
        for (k, v) in obj {
            let path = format!("{base}.{k}");
            match v.get("type").and_then(Json::as_str).unwrap_or("") {
                "object" => {
                    if let Some(props) = v.get("properties").and_then(Json::as_object) {
                        walk_object(props, &path, depth + 1, out);
                    }
                }
                t if is_scalar_type(t) => out.push(path),
                _ => {}
            }
            if out.len() >= 16 {
                return;
            }
        }
    }

    let mut out = Vec::new();
    walk_object(spec_props, "spec", 0, &mut out);
    (!out.is_empty()).then_some(out)
}
