//! Item identifiers.
//!
//! An item id is the string form of an object's key. Single-key classes use
//! the key value itself; composite keys join their values with a separator.

use ormdoc_proto::Document;
use serde_json::{json, Value};

use super::cast::{cast_value, plain_string};
use crate::catalog::ClassMeta;
use crate::error::Error;

/// Converts between item ids and key fields.
pub trait KeyProvider: Send + Sync {
    /// Split an item id into key field values (uncast).
    fn key_to_data(&self, cm: &ClassMeta, id: &str) -> Result<Document, Error>;

    /// Build the item id of a stored document; `None` when a key field is missing.
    fn data_to_key(&self, cm: &ClassMeta, data: &Document) -> Option<String>;
}

/// Key provider joining key values with a separator.
#[derive(Debug, Clone)]
pub struct SeparatorKeyProvider {
    separator: String,
}

impl SeparatorKeyProvider {
    /// Create a provider with the given separator.
    pub fn new(separator: impl Into<String>) -> Self {
        Self {
            separator: separator.into(),
        }
    }
}

impl KeyProvider for SeparatorKeyProvider {
    fn key_to_data(&self, cm: &ClassMeta, id: &str) -> Result<Document, Error> {
        let keys = cm.key_properties();
        let mut data = Document::new();
        if keys.len() == 1 {
            data.insert(keys[0].clone(), Value::String(id.to_string()));
            return Ok(data);
        }

        let parts: Vec<&str> = id.splitn(keys.len(), self.separator.as_str()).collect();
        if parts.len() != keys.len() {
            return Err(Error::malformed(
                "$ItemId",
                format!("{} is not a key of {}", id, cm.canonical_name()),
            ));
        }
        for (key, part) in keys.iter().zip(parts) {
            data.insert(key.clone(), Value::String(part.to_string()));
        }
        Ok(data)
    }

    fn data_to_key(&self, cm: &ClassMeta, data: &Document) -> Option<String> {
        let parts = cm
            .key_properties()
            .iter()
            .map(|key| match data.get(key) {
                None | Some(Value::Null) => None,
                Some(v) => Some(plain_string(v)),
            })
            .collect::<Option<Vec<_>>>()?;
        Some(parts.join(&self.separator))
    }
}

/// Build a domain filter selecting the items with the given ids.
pub fn filter_by_item_ids(keys: &dyn KeyProvider, cm: &ClassMeta, ids: &[String]) -> Result<Value, Error> {
    if let [key] = cm.key_properties() {
        let values = match cm.property_meta(key) {
            Some(pm) => ids
                .iter()
                .map(|id| cast_value(pm, &Value::String(id.clone()), None))
                .collect::<Result<Vec<_>, _>>()?,
            None => ids.iter().cloned().map(Value::String).collect(),
        };
        return Ok(json!({ key: {"$in": values} }));
    }

    let alternatives = ids
        .iter()
        .map(|id| keys.key_to_data(cm, id).map(Value::Object))
        .collect::<Result<Vec<_>, _>>()?;
    Ok(json!({ "$or": alternatives }))
}
