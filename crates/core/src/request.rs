use serde::{Deserialize, Serialize};
use serde_json::Value as Json;

use crate::key::ObjectKey;

/// A partial update from one field manager.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApplyRequest {
    pub key: ObjectKey,
    pub manager: String,
    pub payload: Json,
    #[serde(default)]
    pub force: bool,
}

impl ApplyRequest {
    pub fn new(key: ObjectKey, manager: impl Into<String>, payload: Json) -> Self {
        Self { key, manager: manager.into(), payload, force: false }
    }

    pub fn forced(mut self) -> Self {
        self.force = true;
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApplyOutcome {
    Created,
    Updated,
    /// The merged object is identical to the stored one; nothing was written.
    Noop,
}

impl ApplyOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Created => "created",
            Self::Updated => "updated",
            Self::Noop => "noop",
        }
    }

    pub fn status(&self) -> u16 {
        match self {
            Self::Created => 201,
            Self::Updated => 200,
            Self::Noop => 304,
        }
    }

    pub fn from_status(status: u16) -> Option<Self> {
        match status {
            201 => Some(Self::Created),
            200 => Some(Self::Updated),
            304 => Some(Self::Noop),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeleteOutcome {
    /// Finalizers remain; the object carries a deletion timestamp.
    DeletionRequested,
    /// A deletion timestamp was already set; nothing changed.
    AlreadyDeleting,
    Purged,
}

impl DeleteOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::DeletionRequested => "deletion_requested",
            Self::AlreadyDeleting => "already_deleting",
            Self::Purged => "purged",
        }
    }
}

/// List selector: empty key segments match anything.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ListFilter {
    #[serde(flatten)]
    pub key: ObjectKey,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name_prefix: Option<String>,
}

impl ListFilter {
    pub fn new(key: ObjectKey) -> Self {
        Self { key, name_prefix: None }
    }

    pub fn with_name_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.name_prefix = Some(prefix.into());
        self
    }

    pub fn matches(&self, key: &ObjectKey) -> bool {
        key.matches(&self.key) && self.name_prefix.as_deref().map_or(true, |p| key.name.starts_with(p))
    }
}

impl From<ObjectKey> for ListFilter {
    fn from(key: ObjectKey) -> Self {
        Self::new(key)
    }
}
