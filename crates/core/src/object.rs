use serde::de::DeserializeOwned;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::Value as Json;

use crate::error::StrataError;
use crate::key::ObjectKey;
use crate::meta::{MetaOnlyObject, ObjectMeta};

/// Untyped envelope: the key plus the raw payload, decoded on demand.
#[derive(Debug, Clone, PartialEq)]
pub struct GenericObject {
    pub key: ObjectKey,
    pub raw: Json,
}

impl GenericObject {
    /// Wrap a payload, deriving the key from `apiVersion`, `kind` and metadata.
    pub fn from_raw(raw: Json) -> Result<Self, StrataError> {
        let key = key_from_payload(&raw)?;
        Ok(Self { key, raw })
    }

    pub fn decode<T: DeserializeOwned>(&self) -> Result<T, StrataError> {
        serde_json::from_value(self.raw.clone())
            .map_err(|e| StrataError::Validation(format!("decoding {}: {e}", self.key)))
    }

    pub fn meta(&self) -> Result<ObjectMeta, StrataError> {
        Ok(MetaOnlyObject::from_value(&self.raw)?.metadata)
    }

    pub fn revision(&self) -> Option<u64> {
        self.raw.pointer("/metadata/revision").and_then(Json::as_u64)
    }
}

impl Serialize for GenericObject {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.raw.serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for GenericObject {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = Json::deserialize(deserializer)?;
        Self::from_raw(raw).map_err(serde::de::Error::custom)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GenericObjectList {
    #[serde(default)]
    pub items: Vec<GenericObject>,
}

impl GenericObjectList {
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    /// Decode every item as `T`.
    pub fn decode<T: DeserializeOwned>(&self) -> Result<Vec<T>, StrataError> {
        self.items.iter().map(GenericObject::decode).collect()
    }
}

/// Derive the object key from a payload.
pub fn key_from_payload(raw: &Json) -> Result<ObjectKey, StrataError> {
    let obj = raw
        .as_object()
        .ok_or_else(|| StrataError::Validation("payload must be a JSON object".into()))?;
    let str_at = |ptr: &str| raw.pointer(ptr).and_then(Json::as_str).unwrap_or_default();
    let api_version = obj.get("apiVersion").and_then(Json::as_str).unwrap_or_default();
    let (group, version) = api_version
        .split_once('/')
        .ok_or_else(|| StrataError::Validation(format!("apiVersion {api_version:?} must be group/version")))?;
    let key = ObjectKey::new(
        group,
        version,
        str_at("/kind"),
        str_at("/metadata/account"),
        str_at("/metadata/name"),
    );
    key.validate_strict()?;
    Ok(key)
}
