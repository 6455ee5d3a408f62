//! Strata core types: object addressing, metadata, managed fields, events and errors.

#![forbid(unsafe_code)]

pub mod context;
pub mod error;
pub mod event;
pub mod fields;
pub mod key;
pub mod meta;
pub mod object;
pub mod request;

pub use context::Context;
pub use error::{ignore_not_found, FieldConflict, StrataError, StrataResult};
pub use event::{Event, EventOperation};
pub use fields::{FieldPath, FieldSet, ManagedFields, ManagedFieldsEntry, PathElement, FIELDS_TYPE_V1};
pub use key::{ChannelKey, ObjectKey, WILDCARD};
pub use meta::{Finalizers, MetaOnlyObject, ObjectMeta, OwnerReference, Time, TypeMeta};
pub use object::{key_from_payload, GenericObject, GenericObjectList};
pub use request::{ApplyOutcome, ApplyRequest, DeleteOutcome, ListFilter};

pub mod prelude {
    pub use crate::{
        ApplyOutcome, ApplyRequest, Context, DeleteOutcome, Event, EventOperation, GenericObject, GenericObjectList, ListFilter,
        ObjectKey, ObjectMeta, StrataError, StrataResult,
    };
}
