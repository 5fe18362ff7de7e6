//! Class definitions.

use serde::{Deserialize, Serialize};

use super::property::PropertyMeta;

/// A class (collection schema).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClassMeta {
    /// Class name.
    pub name: String,
    /// Namespace; empty for the default namespace.
    #[serde(default)]
    pub namespace: String,
    /// Key property names.
    pub key: Vec<String>,
    /// Properties in declaration order.
    pub properties: Vec<PropertyMeta>,
    /// Properties searched by default in free-text queries.
    #[serde(default)]
    pub semantic_attributes: Vec<String>,
}

impl ClassMeta {
    /// Create a class with a single key property.
    pub fn new(name: impl Into<String>, key: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            namespace: String::new(),
            key: vec![key.into()],
            properties: Vec::new(),
            semantic_attributes: Vec::new(),
        }
    }

    /// Set the namespace.
    pub fn with_namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = namespace.into();
        self
    }

    /// Replace the key with a composite key.
    pub fn with_key(mut self, key: Vec<String>) -> Self {
        self.key = key;
        self
    }

    /// Add a property.
    pub fn with_property(mut self, property: PropertyMeta) -> Self {
        self.properties.push(property);
        self
    }

    /// Add multiple properties.
    pub fn with_properties(mut self, properties: impl IntoIterator<Item = PropertyMeta>) -> Self {
        self.properties.extend(properties);
        self
    }

    /// Set the default free-text attributes.
    pub fn with_semantic_attributes(mut self, attributes: Vec<String>) -> Self {
        self.semantic_attributes = attributes;
        self
    }

    /// Get a property by name.
    pub fn property_meta(&self, name: &str) -> Option<&PropertyMeta> {
        self.properties.iter().find(|p| p.name == name)
    }

    /// Key property names.
    pub fn key_properties(&self) -> &[String] {
        &self.key
    }

    /// Namespace of the class.
    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    /// Name qualified with the namespace (`name@namespace`).
    pub fn canonical_name(&self) -> String {
        if self.namespace.is_empty() {
            self.name.clone()
        } else {
            format!("{}@{}", self.name, self.namespace)
        }
    }

    /// Name of the collection holding objects of this class.
    pub fn table_name(&self, separator: &str) -> String {
        if self.namespace.is_empty() {
            self.name.clone()
        } else {
            format!("{}{}{}", self.namespace, separator, self.name)
        }
    }

    /// Properties physically present in stored documents.
    pub fn stored_attributes(&self) -> impl Iterator<Item = &PropertyMeta> {
        self.properties.iter().filter(|p| p.is_stored())
    }

    /// Default free-text attributes, or every property when none are declared.
    pub fn search_attributes(&self) -> Vec<String> {
        if self.semantic_attributes.is_empty() {
            self.properties.iter().map(|p| p.name.clone()).collect()
        } else {
            self.semantic_attributes.clone()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::PropertyType;

    fn order() -> ClassMeta {
        ClassMeta::new("Order", "id")
            .with_namespace("shop")
            .with_property(PropertyMeta::new("id", PropertyType::Int))
            .with_property(PropertyMeta::new("status", PropertyType::String))
            .with_property(PropertyMeta::collection("lines", "OrderLine").with_back_ref("order"))
            .with_property(PropertyMeta::new("total", PropertyType::Real).with_formula("sum"))
    }

    #[test]
    fn test_names() {
        let cm = order();
        assert_eq!(cm.canonical_name(), "Order@shop");
        assert_eq!(cm.table_name("_"), "shop_Order");
        assert_eq!(ClassMeta::new("Tag", "id").table_name("_"), "Tag");
    }

    #[test]
    fn test_property_lookup() {
        let cm = order();
        assert!(cm.property_meta("status").is_some());
        assert!(cm.property_meta("colour").is_none());
        assert_eq!(cm.key_properties(), ["id".to_string()]);
    }

    #[test]
    fn test_stored_attributes() {
        let cm = order();
        let stored: Vec<&str> = cm.stored_attributes().map(|p| p.name.as_str()).collect();
        assert_eq!(stored, vec!["id", "status"]);
    }

    #[test]
    fn test_search_attributes_fallback() {
        let cm = order();
        assert_eq!(cm.search_attributes().len(), 4);
        let cm = cm.with_semantic_attributes(vec!["status".into()]);
        assert_eq!(cm.search_attributes(), vec!["status".to_string()]);
    }
}
