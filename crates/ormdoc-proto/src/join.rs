//! Join markers.

use serde::{Deserialize, Serialize};

use crate::error::Error;
use crate::filter::{FilterNode, Operand};

/// Description of a lookup into a related collection.
///
/// A document of the current collection is related to a document of `table`
/// when its `left` field equals the related document's `right` field. When
/// `many` is set the result of the lookup is an array and has to be unwound
/// before its fields can be tested.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JoinSpec {
    /// Related collection.
    pub table: String,
    /// Field of the current document.
    pub left: String,
    /// Field of the related document.
    pub right: String,
    /// Whether the lookup yields many related documents.
    pub many: bool,
    /// Alias the lookup result is stored under; assigned by the join registry.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub alias: Option<String>,
    /// Condition on the related document.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filter: Option<Box<FilterNode>>,
    /// Joins from the related document onward.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub join: Vec<JoinSpec>,
}

impl JoinSpec {
    /// Create a join with no condition.
    pub fn new(
        table: impl Into<String>,
        left: impl Into<String>,
        right: impl Into<String>,
        many: bool,
    ) -> Self {
        Self {
            table: table.into(),
            left: left.into(),
            right: right.into(),
            many,
            alias: None,
            filter: None,
            join: Vec::new(),
        }
    }

    /// Set the condition on the related document.
    pub fn with_filter(mut self, filter: FilterNode) -> Self {
        self.filter = if filter.is_unconstrained() {
            None
        } else {
            Some(Box::new(filter))
        };
        self
    }

    /// Add a nested join.
    pub fn with_join(mut self, join: JoinSpec) -> Self {
        self.join.push(join);
        self
    }

    /// Set the alias.
    pub fn with_alias(mut self, alias: impl Into<String>) -> Self {
        self.alias = Some(alias.into());
        self
    }

    /// A join that only tests for the presence of any related document.
    pub fn is_existence_only(&self) -> bool {
        self.filter.is_none() && self.join.is_empty()
    }

    /// Rebuild the join with every operand in its filters passed through `f`.
    pub fn map_operands<F>(self, f: &mut F) -> Result<JoinSpec, Error>
    where
        F: FnMut(Operand) -> Result<Operand, Error>,
    {
        let filter = match self.filter {
            Some(filter) => Some(Box::new(filter.map_operands(f)?)),
            None => None,
        };
        let join = self
            .join
            .into_iter()
            .map(|j| j.map_operands(f))
            .collect::<Result<_, _>>()?;
        Ok(JoinSpec {
            filter,
            join,
            ..self
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_existence_only() {
        let join = JoinSpec::new("wh_item", "items", "_id", true);
        assert!(join.is_existence_only());

        let join = join.with_filter(FilterNode::Const(true));
        assert!(join.is_existence_only());

        let join = join.with_filter(FilterNode::eq("price", 10));
        assert!(!join.is_existence_only());
    }

    #[test]
    fn test_external_shape() {
        let join = JoinSpec::new("wh_customer", "customer", "_id", false).with_alias("customer_j");
        let value = serde_json::to_value(&join).unwrap();
        assert_eq!(
            value,
            json!({
                "table": "wh_customer",
                "left": "customer",
                "right": "_id",
                "many": false,
                "alias": "customer_j"
            })
        );
    }
}
