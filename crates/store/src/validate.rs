//! Admission validators: per-kind checks run inside the apply section, after
//! schema validation and before commit. A rejection leaves the stored object
//! untouched.

use std::fmt;
use std::sync::Arc;

use arc_swap::ArcSwap;
use metrics::counter;
use rustc_hash::FxHashMap;
use serde_json::Value as Json;
use strata_core::{ObjectKey, StrataError, StrataResult};
use tracing::{debug, info};

/// Admission checks for one kind. Both hooks see the merged object as it
/// would be committed; `validate_update` also sees the stored one.
pub trait Validator: Send + Sync + 'static {
    fn validate_create(&self, object: &Json) -> StrataResult<()> {
        let _ = object;
        Ok(())
    }

    fn validate_update(&self, old: &Json, new: &Json) -> StrataResult<()> {
        let _ = (old, new);
        Ok(())
    }
}

type Table = FxHashMap<(String, String), Arc<dyn Validator>>;

/// Shared validator table keyed by `(group, kind)`. An empty group applies to
/// every group of that kind. Cheap to clone; clones share the table.
#[derive(Clone)]
pub struct Validators {
    table: Arc<ArcSwap<Table>>,
}

impl Default for Validators {
    fn default() -> Self {
        Self { table: Arc::new(ArcSwap::from_pointee(Table::default())) }
    }
}

impl fmt::Debug for Validators {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.table.load().keys().map(|(g, k)| format!("{g}/{k}"))).finish()
    }
}

impl Validators {
    /// Install `validator` for `kind` in `group`, replacing any previous one.
    pub fn register(&self, group: &str, kind: &str, validator: Arc<dyn Validator>) -> StrataResult<()> {
        if kind.is_empty() {
            return Err(StrataError::Validation("a validator must name a kind".into()));
        }
        let slot = (group.to_string(), kind.to_string());
        self.table.rcu(|cur| {
            let mut next = Table::clone(cur);
            next.insert(slot.clone(), Arc::clone(&validator));
            next
        });
        info!(group, kind, "store: validator registered");
        Ok(())
    }

    pub fn unregister(&self, group: &str, kind: &str) -> bool {
        let slot = (group.to_string(), kind.to_string());
        let prev = self.table.rcu(|cur| {
            let mut next = Table::clone(cur);
            next.remove(&slot);
            next
        });
        prev.contains_key(&slot)
    }

    pub fn len(&self) -> usize {
        self.table.load().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lookup(&self, key: &ObjectKey) -> Option<Arc<dyn Validator>> {
        let table = self.table.load();
        if table.is_empty() {
            return None;
        }
        table
            .get(&(key.group.clone(), key.kind.clone()))
            .or_else(|| table.get(&(String::new(), key.kind.clone())))
            .cloned()
    }

    /// Run the kind's validator, if any: `validate_create` when `old` is absent.
    pub fn check(&self, key: &ObjectKey, old: Option<&Json>, new: &Json) -> StrataResult<()> {
        let Some(validator) = self.lookup(key) else { return Ok(()) };
        let res = match old {
            None => validator.validate_create(new),
            Some(old) => validator.validate_update(old, new),
        };
        if let Err(e) = &res {
            counter!("store_admission_rejected_total", 1u64, "kind" => key.kind.clone());
            debug!(key = %key, error = %e, "store: admission rejected");
        }
        res
    }
}
