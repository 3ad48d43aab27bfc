use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::ids::DocumentId;
use crate::error::{AccessError, Result};

/// A document as returned by the remote store: its id plus the raw payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Document {
    pub id: DocumentId,
    pub data: Value,
}

impl Document {
    pub fn new(id: impl Into<DocumentId>, data: Value) -> Self {
        Self {
            id: id.into(),
            data,
        }
    }

    /// Looks up a top-level field. Dotted paths descend into nested objects.
    pub fn field(&self, path: &str) -> Option<&Value> {
        path.split('.')
            .try_fold(&self.data, |value, segment| value.get(segment))
    }

    /// The payload with the document id injected as an `id` field when the
    /// payload is an object that does not carry one, so entities can expose
    /// their id without the store persisting it twice.
    pub fn entity_value(&self) -> Value {
        let mut data = self.data.clone();
        if let Value::Object(ref mut map) = data {
            map.entry("id")
                .or_insert_with(|| Value::String(self.id.to_string()));
        }
        data
    }

    /// Deserializes the payload into an entity type. See [`Document::entity_value`].
    pub fn to_entity<T: DeserializeOwned>(&self) -> Result<T> {
        serde_json::from_value(self.entity_value()).map_err(AccessError::from)
    }

    /// Applies a shallow merge patch: top-level keys of `partial` replace the
    /// existing ones, `null` values remove them.
    pub fn merge(&mut self, partial: &Value) {
        let Value::Object(patch) = partial else {
            return;
        };
        if !self.data.is_object() {
            self.data = Value::Object(Default::default());
        }
        if let Value::Object(ref mut target) = self.data {
            for (key, value) in patch {
                if value.is_null() {
                    target.remove(key);
                } else {
                    target.insert(key.clone(), value.clone());
                }
            }
        }
    }
}

/// Serializes an entity into a store payload, stripping a top-level `id`
/// field since the store keeps ids out of band.
pub fn to_payload<T: Serialize>(entity: &T) -> Result<Value> {
    let mut value = serde_json::to_value(entity)?;
    if let Value::Object(ref mut map) = value {
        map.remove("id");
    }
    Ok(value)
}
