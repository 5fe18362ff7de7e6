//! Class metadata catalog.
//!
//! The catalog describes the classes queries are written against: their
//! properties, keys, namespaces and the relations between them.

mod catalog;
mod class;
mod property;
mod types;

pub use catalog::{Catalog, CatalogDef, ClassMetaProvider};
pub use class::ClassMeta;
pub use property::{MatrixEntry, PropertyMeta, SelectionItem, SelectionProvider};
pub use types::PropertyType;
