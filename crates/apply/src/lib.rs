//! Strata apply: field-manager merge engine, managed field extraction,
//! payload limits and minimal diffs.
//!
//! Everything here is synchronous and side-effect free; the store calls it
//! while holding the per-key lock.

#![forbid(unsafe_code)]

mod diff;
mod extract;
mod fieldset;
mod limits;
mod merge;

pub use diff::{diff_summary, strip_noisy, DiffSummary};
pub use extract::extract_managed_fields;
pub use fieldset::{fields_from_payload, merge_key_of, strip_read_only, MERGE_KEYS, READ_ONLY_METADATA};
pub use limits::PayloadLimits;
pub use merge::{merge_apply, read_managed_fields, Merged};
