//! Class registry.

use std::collections::HashMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use super::{ClassMeta, PropertyMeta};
use crate::error::Error;

/// Read-only source of class metadata.
pub trait ClassMetaProvider: Send + Sync {
    /// Look up a class by canonical (`name@namespace`) or plain name.
    fn class_meta(&self, name: &str) -> Option<Arc<ClassMeta>>;

    /// Resolve the target class of a relational property of `owner`.
    ///
    /// A plain target name is looked up in the owner's namespace first.
    fn ref_class(&self, owner: &ClassMeta, pm: &PropertyMeta) -> Option<Arc<ClassMeta>> {
        let target = pm.ref_class.as_deref()?;
        if !target.contains('@') && !owner.namespace().is_empty() {
            if let Some(cm) = self.class_meta(&format!("{}@{}", target, owner.namespace())) {
                return Some(cm);
            }
        }
        self.class_meta(target)
    }
}

/// Serialized form of a catalog.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CatalogDef {
    /// Class definitions.
    pub classes: Vec<ClassMeta>,
}

/// In-memory class registry.
#[derive(Debug, Default)]
pub struct Catalog {
    /// Classes keyed by canonical name.
    classes: HashMap<String, Arc<ClassMeta>>,
    /// Plain name to canonical names.
    by_name: HashMap<String, Vec<String>>,
}

impl Catalog {
    /// Create an empty catalog.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a class.
    pub fn with_class(mut self, class: ClassMeta) -> Self {
        self.register(class);
        self
    }

    /// Register a class, replacing one with the same canonical name.
    pub fn register(&mut self, class: ClassMeta) {
        let canonical = class.canonical_name();
        let names = self.by_name.entry(class.name.clone()).or_default();
        if !names.contains(&canonical) {
            names.push(canonical.clone());
        }
        self.classes.insert(canonical, Arc::new(class));
    }

    /// Build a catalog from its JSON form.
    pub fn from_json(json: &str) -> Result<Self, Error> {
        let def: CatalogDef = serde_json::from_str(json)?;
        Ok(Self::from_def(def))
    }

    /// Build a catalog from its serialized form.
    pub fn from_def(def: CatalogDef) -> Self {
        let mut catalog = Self::new();
        for class in def.classes {
            catalog.register(class);
        }
        catalog
    }

    /// Number of registered classes.
    pub fn len(&self) -> usize {
        self.classes.len()
    }

    /// Check if the catalog is empty.
    pub fn is_empty(&self) -> bool {
        self.classes.is_empty()
    }

    /// Canonical names of all classes, sorted.
    pub fn class_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.classes.keys().cloned().collect();
        names.sort();
        names
    }
}

impl ClassMetaProvider for Catalog {
    fn class_meta(&self, name: &str) -> Option<Arc<ClassMeta>> {
        if let Some(cm) = self.classes.get(name) {
            return Some(cm.clone());
        }
        match self.by_name.get(name).map(Vec::as_slice) {
            Some([canonical]) => self.classes.get(canonical).cloned(),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::PropertyType;

    #[test]
    fn test_lookup_by_name() {
        let catalog = Catalog::new()
            .with_class(ClassMeta::new("Order", "id").with_namespace("shop"))
            .with_class(ClassMeta::new("Tag", "id"));

        assert_eq!(catalog.len(), 2);
        assert!(catalog.class_meta("Order@shop").is_some());
        assert!(catalog.class_meta("Order").is_some());
        assert!(catalog.class_meta("Tag").is_some());
        assert!(catalog.class_meta("Missing").is_none());
    }

    #[test]
    fn test_ambiguous_plain_name() {
        let catalog = Catalog::new()
            .with_class(ClassMeta::new("Item", "id").with_namespace("a"))
            .with_class(ClassMeta::new("Item", "id").with_namespace("b"));

        assert!(catalog.class_meta("Item").is_none());
        assert!(catalog.class_meta("Item@b").is_some());
    }

    #[test]
    fn test_ref_class_prefers_owner_namespace() {
        let catalog = Catalog::new()
            .with_class(ClassMeta::new("Customer", "id").with_namespace("a"))
            .with_class(ClassMeta::new("Customer", "id").with_namespace("b"));
        let owner = ClassMeta::new("Order", "id").with_namespace("b");
        let pm = PropertyMeta::reference("customer", "Customer");

        let target = catalog.ref_class(&owner, &pm).unwrap();
        assert_eq!(target.namespace(), "b");
    }

    #[test]
    fn test_from_json() {
        let catalog = Catalog::from_json(
            r#"{"classes": [{
                "name": "Order",
                "key": ["id"],
                "properties": [
                    {"name": "id", "type": "int"},
                    {"name": "customer", "type": "reference", "ref_class": "Customer"}
                ]
            }]}"#,
        )
        .unwrap();

        let cm = catalog.class_meta("Order").unwrap();
        assert_eq!(
            cm.property_meta("customer").unwrap().property_type,
            PropertyType::Reference
        );
    }
}
