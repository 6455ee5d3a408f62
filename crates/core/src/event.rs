use serde::{Deserialize, Serialize};

use crate::key::ObjectKey;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventOperation {
    Create,
    Update,
    /// The object carries a deletion timestamp but still has finalizers.
    DeleteRequested,
    /// The record is gone.
    Purge,
}

impl EventOperation {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Create => "create",
            Self::Update => "update",
            Self::DeleteRequested => "delete_requested",
            Self::Purge => "purge",
        }
    }
}

/// One committed mutation. `data` is the object as committed; it is `None` for purges.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub operation: EventOperation,
    pub key: ObjectKey,
    pub revision: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
}
