use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use smallvec::SmallVec;

use crate::error::StrataError;
use crate::fields::ManagedFields;
use crate::key::ObjectKey;

/// RFC 3339 timestamp.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Time(pub DateTime<Utc>);

impl Time {
    pub fn now() -> Self {
        Self(Utc::now())
    }

    pub fn is_past(&self) -> bool {
        self.0 <= Utc::now()
    }
}

/// Ordered set of finalizer tokens. Duplicates are dropped on insert and on decode.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(transparent)]
pub struct Finalizers(SmallVec<[String; 2]>);

impl Finalizers {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns true if the finalizer was not present before.
    pub fn add(&mut self, finalizer: impl Into<String>) -> bool {
        let f = finalizer.into();
        if self.contains(&f) {
            return false;
        }
        self.0.push(f);
        true
    }

    /// Returns true if the finalizer was present.
    pub fn remove(&mut self, finalizer: &str) -> bool {
        let before = self.0.len();
        self.0.retain(|f| f != finalizer);
        before != self.0.len()
    }

    pub fn contains(&self, finalizer: &str) -> bool {
        self.0.iter().any(|f| f == finalizer)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.0.iter().map(String::as_str)
    }
}

impl<'de> Deserialize<'de> for Finalizers {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw: Vec<String> = Vec::deserialize(deserializer)?;
        Ok(raw.into_iter().collect())
    }
}

impl<S: Into<String>> FromIterator<S> for Finalizers {
    fn from_iter<I: IntoIterator<Item = S>>(iter: I) -> Self {
        let mut f = Self::new();
        for s in iter {
            f.add(s);
        }
        f
    }
}

/// Points at the object that owns this one; purging the owner cascades.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OwnerReference {
    pub group: String,
    pub version: String,
    pub kind: String,
    pub account: String,
    pub name: String,
}

impl OwnerReference {
    pub fn for_key(key: &ObjectKey) -> Self {
        Self {
            group: key.group.clone(),
            version: key.version.clone(),
            kind: key.kind.clone(),
            account: key.account.clone(),
            name: key.name.clone(),
        }
    }

    pub fn is_owned_by(&self, owner: &ObjectKey) -> bool {
        self.group == owner.group
            && self.version == owner.version
            && self.kind == owner.kind
            && self.account == owner.account
            && self.name == owner.name
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ObjectMeta {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub name: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub account: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,
    /// Store-assigned, monotonic across all commits.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub revision: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uid: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub creation_timestamp: Option<Time>,
    /// Set once by a delete request and never cleared.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deletion_timestamp: Option<Time>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finalizers: Option<Finalizers>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub owner_references: Vec<OwnerReference>,
    #[serde(default, skip_serializing_if = "ManagedFields::is_empty")]
    pub managed_fields: ManagedFields,
}

impl ObjectMeta {
    pub fn has_finalizers(&self) -> bool {
        self.finalizers.as_ref().is_some_and(|f| !f.is_empty())
    }

    pub fn is_deleting(&self) -> bool {
        self.deletion_timestamp.is_some()
    }

    pub fn is_owned_by(&self, owner: &ObjectKey) -> bool {
        self.owner_references.iter().any(|r| r.is_owned_by(owner))
    }
}

/// `apiVersion` + `kind`; the group and version are split from `apiVersion`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TypeMeta {
    #[serde(default)]
    pub api_version: String,
    #[serde(default)]
    pub kind: String,
}

impl TypeMeta {
    pub fn group_version(&self) -> (&str, &str) {
        self.api_version.split_once('/').unwrap_or(("", self.api_version.as_str()))
    }
}

/// An object with only its type and metadata decoded.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MetaOnlyObject {
    #[serde(flatten)]
    pub type_meta: TypeMeta,
    #[serde(default)]
    pub metadata: ObjectMeta,
}

impl MetaOnlyObject {
    pub fn from_value(raw: &serde_json::Value) -> Result<Self, StrataError> {
        serde_json::from_value(raw.clone())
            .map_err(|e| StrataError::Validation(format!("decoding object metadata: {e}")))
    }

    pub fn key(&self) -> ObjectKey {
        let (group, version) = self.type_meta.group_version();
        ObjectKey::new(group, version, &self.type_meta.kind, &self.metadata.account, &self.metadata.name)
    }
}
