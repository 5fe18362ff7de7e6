//! Property type tags.

use serde::{Deserialize, Serialize};

/// Type of a class property.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PropertyType {
    /// Short string.
    String,
    /// Integer.
    Int,
    /// Floating point number.
    Real,
    /// Fixed-precision decimal (stored as a number).
    Decimal,
    /// Boolean.
    Boolean,
    /// Timestamp.
    #[serde(alias = "date")]
    DateTime,
    /// Long text.
    Text,
    /// URL.
    Url,
    /// HTML markup.
    Html,
    /// GeoJSON geometry.
    Geo,
    /// Single attached file.
    File,
    /// Attached file list.
    FileList,
    /// Reference to an object of another class.
    Reference,
    /// Collection of objects of another class.
    Collection,
}

impl PropertyType {
    /// Check if this type links to another class.
    pub fn is_relational(&self) -> bool {
        matches!(self, PropertyType::Reference | PropertyType::Collection)
    }

    /// Check if values of this type are strings.
    pub fn is_string_like(&self) -> bool {
        matches!(
            self,
            PropertyType::String | PropertyType::Text | PropertyType::Url | PropertyType::Html
        )
    }

    /// Check if this type is numeric.
    pub fn is_numeric(&self) -> bool {
        matches!(
            self,
            PropertyType::Int | PropertyType::Real | PropertyType::Decimal
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_type_groups() {
        assert!(PropertyType::Reference.is_relational());
        assert!(PropertyType::Collection.is_relational());
        assert!(!PropertyType::Geo.is_relational());

        assert!(PropertyType::Html.is_string_like());
        assert!(!PropertyType::File.is_string_like());

        assert!(PropertyType::Decimal.is_numeric());
        assert!(!PropertyType::DateTime.is_numeric());
    }

    #[test]
    fn test_serde_names() {
        let t: PropertyType = serde_json::from_str("\"file_list\"").unwrap();
        assert_eq!(t, PropertyType::FileList);
        let t: PropertyType = serde_json::from_str("\"date\"").unwrap();
        assert_eq!(t, PropertyType::DateTime);
        assert_eq!(serde_json::to_string(&PropertyType::DateTime).unwrap(), "\"date_time\"");
    }
}
