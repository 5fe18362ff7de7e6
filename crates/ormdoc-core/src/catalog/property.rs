//! Property definitions.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::types::PropertyType;

/// One entry of a selection list.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SelectionItem {
    /// Stored value.
    pub key: Value,
    /// Display value.
    pub value: String,
}

impl SelectionItem {
    /// Create a selection item.
    pub fn new(key: impl Into<Value>, value: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
        }
    }
}

/// Selection list that applies when its conditions hold.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MatrixEntry {
    /// Domain filter over the owning class.
    pub conditions: Value,
    /// Items offered under these conditions.
    pub items: Vec<SelectionItem>,
}

/// Source of allowed values for a property.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SelectionProvider {
    /// A fixed list.
    Simple {
        /// Allowed values.
        items: Vec<SelectionItem>,
    },
    /// Lists chosen by conditions on the owning object.
    Matrix {
        /// Conditional lists.
        entries: Vec<MatrixEntry>,
    },
}

/// A property of a class.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PropertyMeta {
    /// Property name.
    pub name: String,
    /// Property type.
    #[serde(rename = "type")]
    pub property_type: PropertyType,
    /// Whether null is a valid value.
    #[serde(default = "default_true")]
    pub nullable: bool,
    /// Whether the store indexes the property.
    #[serde(default)]
    pub indexed: bool,
    /// Whether values are unique.
    #[serde(default)]
    pub unique: bool,
    /// Whether the property takes part in the full-text index.
    #[serde(default)]
    pub index_search: bool,
    /// Whether the value is assigned by the system.
    #[serde(default)]
    pub autoassigned: bool,
    /// Formula of a computed property.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub formula: Option<String>,
    /// Target class of a reference or collection.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ref_class: Option<String>,
    /// Property of the target class pointing back at the owner.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub back_ref: Option<String>,
    /// Owner property the back reference binds to (defaults to the owner's key).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub binding: Option<String>,
    /// Allowed values.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub selection: Option<SelectionProvider>,
}

fn default_true() -> bool {
    true
}

impl PropertyMeta {
    /// Create a nullable property.
    pub fn new(name: impl Into<String>, property_type: PropertyType) -> Self {
        Self {
            name: name.into(),
            property_type,
            nullable: true,
            indexed: false,
            unique: false,
            index_search: false,
            autoassigned: false,
            formula: None,
            ref_class: None,
            back_ref: None,
            binding: None,
            selection: None,
        }
    }

    /// Create a reference to another class.
    pub fn reference(name: impl Into<String>, ref_class: impl Into<String>) -> Self {
        Self::new(name, PropertyType::Reference).with_ref_class(ref_class)
    }

    /// Create a collection of objects of another class.
    pub fn collection(name: impl Into<String>, ref_class: impl Into<String>) -> Self {
        Self::new(name, PropertyType::Collection).with_ref_class(ref_class)
    }

    /// Mark as not nullable.
    pub fn required(mut self) -> Self {
        self.nullable = false;
        self
    }

    /// Mark as indexed.
    pub fn with_index(mut self) -> Self {
        self.indexed = true;
        self
    }

    /// Mark as unique.
    pub fn with_unique(mut self) -> Self {
        self.unique = true;
        self
    }

    /// Include in the full-text index.
    pub fn with_index_search(mut self) -> Self {
        self.index_search = true;
        self
    }

    /// Mark as system-assigned.
    pub fn autoassigned(mut self) -> Self {
        self.autoassigned = true;
        self
    }

    /// Set a formula.
    pub fn with_formula(mut self, formula: impl Into<String>) -> Self {
        self.formula = Some(formula.into());
        self
    }

    /// Set the target class.
    pub fn with_ref_class(mut self, ref_class: impl Into<String>) -> Self {
        self.ref_class = Some(ref_class.into());
        self
    }

    /// Set the back reference.
    pub fn with_back_ref(mut self, back_ref: impl Into<String>) -> Self {
        self.back_ref = Some(back_ref.into());
        self
    }

    /// Set the binding of a back reference.
    pub fn with_binding(mut self, binding: impl Into<String>) -> Self {
        self.binding = Some(binding.into());
        self
    }

    /// Set the selection provider.
    pub fn with_selection(mut self, selection: SelectionProvider) -> Self {
        self.selection = Some(selection);
        self
    }

    /// Check if this is a computed property.
    pub fn is_formula(&self) -> bool {
        self.formula.is_some()
    }

    /// Check if the value is physically stored in the owner's documents.
    pub fn is_stored(&self) -> bool {
        !self.is_formula() && !(self.property_type.is_relational() && self.back_ref.is_some())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_property_builder() {
        let pm = PropertyMeta::new("code", PropertyType::String)
            .required()
            .with_index()
            .with_unique();

        assert_eq!(pm.name, "code");
        assert!(!pm.nullable);
        assert!(pm.indexed);
        assert!(pm.unique);
        assert!(pm.is_stored());
    }

    #[test]
    fn test_stored() {
        let lines = PropertyMeta::collection("lines", "OrderLine").with_back_ref("order");
        assert!(!lines.is_stored());

        let tags = PropertyMeta::collection("tags", "Tag");
        assert!(tags.is_stored());

        let total = PropertyMeta::new("total", PropertyType::Real).with_formula("sum(lines.amount)");
        assert!(!total.is_stored());
    }

    #[test]
    fn test_from_json() {
        let pm: PropertyMeta = serde_json::from_value(serde_json::json!({
            "name": "state",
            "type": "string",
            "selection": {
                "type": "simple",
                "items": [{"key": "o", "value": "Open"}, {"key": "c", "value": "Closed"}]
            }
        }))
        .unwrap();

        assert!(pm.nullable);
        match pm.selection {
            Some(SelectionProvider::Simple { items }) => assert_eq!(items.len(), 2),
            other => panic!("unexpected selection: {:?}", other),
        }
    }
}
