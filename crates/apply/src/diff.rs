use serde::{Deserialize, Serialize};
use serde_json::Value as Json;

use crate::fieldset::READ_ONLY_METADATA;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiffSummary {
    pub adds: usize,
    pub updates: usize,
    pub removes: usize,
}

impl DiffSummary {
    pub fn is_empty(&self) -> bool {
        self.adds == 0 && self.updates == 0 && self.removes == 0
    }
}

/// Drop store-assigned metadata so it does not show up in diffs.
pub fn strip_noisy(mut v: Json) -> Json {
    if let Some(meta) = v.get_mut("metadata").and_then(Json::as_object_mut) {
        for f in READ_ONLY_METADATA {
            meta.remove(f);
        }
    }
    v
}

/// Count member-level adds, updates and removes from `base` to `target`.
pub fn diff_summary(target: &Json, base: &Json) -> DiffSummary {
    fn walk(a: &Json, b: &Json, sum: &mut DiffSummary) {
        match (a, b) {
            (Json::Object(ao), Json::Object(bo)) => {
                for (k, av) in ao {
                    match bo.get(k) {
                        Some(bv) if av == bv => {}
                        Some(bv) => walk(av, bv, sum),
                        None => sum.adds += 1,
                    }
                }
                sum.removes += bo.keys().filter(|k| !ao.contains_key(*k)).count();
            }
            (Json::Array(aa), Json::Array(bb)) => {
                sum.updates += aa.iter().zip(bb).filter(|(x, y)| x != y).count();
                sum.adds += aa.len().saturating_sub(bb.len());
                sum.removes += bb.len().saturating_sub(aa.len());
            }
            // Scalars differ or type differs
            (av, bv) => {
                if av != bv {
                    sum.updates += 1;
                }
            }
        }
    }
    let mut sum = DiffSummary::default();
    walk(target, base, &mut sum);
    sum
}
