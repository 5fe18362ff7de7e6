//! ormdoc wire types.
//!
//! This crate defines the types exchanged between the query compiler, the
//! execution adapters and tooling. Everything serializes with `serde` into the
//! JSON shapes a document store understands.
//!
//! # Modules
//!
//! - [`value`] - JSON document helpers, extended-JSON dates and value ordering
//! - [`filter`] - Store filter tree and its query/expression renderings
//! - [`join`] - Join markers
//! - [`pipeline`] - Aggregation pipeline stages
//! - [`query`] - List and aggregate request types
//! - [`error`] - Protocol error types
//!
//! # Example
//!
//! ```
//! use ormdoc_proto::{pipeline_to_value, PipelineStage};
//!
//! let stages = vec![PipelineStage::Skip(10), PipelineStage::Limit(5)];
//! let json = pipeline_to_value(&stages).unwrap();
//! assert_eq!(json.to_string(), r#"[{"$skip":10},{"$limit":5}]"#);
//! ```

pub mod error;
pub mod filter;
pub mod join;
pub mod pipeline;
pub mod query;
pub mod value;

pub use error::Error;

pub use filter::{CompareOp, DateExpr, DateUnit, FieldOp, FilterNode, Operand};
pub use join::JoinSpec;
pub use pipeline::{pipeline_to_value, Group, Lookup, PipelineStage, Unwind};
pub use query::{
    AggregateFunction, AggregateRequest, Aggregation, ListQuery, SearchRequest, SortDirection,
    SortSpec,
};
pub use value::{Document, Value};

/// Primary key attribute of every stored document.
pub const ID_FIELD: &str = "_id";

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_id_field() {
        assert_eq!(ID_FIELD, "_id");
    }
}
