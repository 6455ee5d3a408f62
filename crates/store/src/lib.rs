//! Strata object store.
//!
//! Holds the authoritative objects, merges applies by field manager,
//! drives the finalizer lifecycle and publishes one event per commit.
//! Mutations of one key are serialized; reads never wait on them.

#![forbid(unsafe_code)]

mod config;
mod gc;
mod store;
mod validate;

pub use config::StoreConfig;
pub use gc::GarbageCollector;
pub use store::ObjectStore;
pub use validate::{Validator, Validators};
