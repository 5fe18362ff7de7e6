//! Core error types.

use thiserror::Error;

/// Error categories callers dispatch on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// A class or property name did not resolve against the catalog.
    UnknownProperty,
    /// A relation traversal cannot be expressed as a join.
    UnsupportedJoin,
    /// An operator was used outside a valid context or with a bad operand.
    MalformedFilter,
    /// An aggregate side-channel query failed or returned nothing.
    AggregateFetch,
    /// The execution adapter failed.
    PipelineExecution,
    /// Encoding or decoding failed.
    Serialization,
}

/// Core compiler errors.
#[derive(Debug, Error)]
pub enum Error {
    /// Class not found in the catalog.
    #[error("unknown class: {0}")]
    UnknownClass(String),

    /// Property not found on a class.
    #[error("unknown property {property} of class {class}")]
    UnknownProperty {
        /// Class the property was looked up on.
        class: String,
        /// Property name.
        property: String,
    },

    /// Relation cannot be joined.
    #[error("unsupported join on {class}.{property}: {reason}")]
    UnsupportedJoin {
        /// Class owning the relation.
        class: String,
        /// Relation property.
        property: String,
        /// Why the join is not possible.
        reason: String,
    },

    /// Malformed filter.
    #[error("malformed filter near {operator}: {reason}")]
    MalformedFilter {
        /// Operator or key being processed.
        operator: String,
        /// What is wrong with it.
        reason: String,
    },

    /// Value cannot be cast to the property type.
    #[error("invalid value {value} for {property}: expected {expected}")]
    InvalidValue {
        /// Property name.
        property: String,
        /// Offending value, rendered as JSON.
        value: String,
        /// Expected type.
        expected: String,
    },

    /// Aggregate side-channel query failed.
    #[error("aggregate fetch on {table} failed: {reason}")]
    AggregateFetch {
        /// Queried collection.
        table: String,
        /// Failure description.
        reason: String,
    },

    /// Execution adapter failure.
    #[error("pipeline execution on {table} failed: {reason}")]
    PipelineExecution {
        /// Queried collection.
        table: String,
        /// Failure description.
        reason: String,
    },

    /// Protocol error.
    #[error("protocol error: {0}")]
    Protocol(#[from] ormdoc_proto::Error),

    /// JSON error.
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

impl Error {
    /// Shorthand for a malformed filter error.
    pub fn malformed(operator: impl Into<String>, reason: impl Into<String>) -> Self {
        Error::MalformedFilter {
            operator: operator.into(),
            reason: reason.into(),
        }
    }

    /// Shorthand for an unsupported join error.
    pub fn unsupported_join(
        class: impl Into<String>,
        property: impl Into<String>,
        reason: impl Into<String>,
    ) -> Self {
        Error::UnsupportedJoin {
            class: class.into(),
            property: property.into(),
            reason: reason.into(),
        }
    }

    /// Shorthand for an execution failure.
    pub fn execution(table: impl Into<String>, reason: impl ToString) -> Self {
        Error::PipelineExecution {
            table: table.into(),
            reason: reason.to_string(),
        }
    }

    /// Category of this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::UnknownClass(_) | Error::UnknownProperty { .. } => ErrorKind::UnknownProperty,
            Error::UnsupportedJoin { .. } => ErrorKind::UnsupportedJoin,
            Error::MalformedFilter { .. } | Error::InvalidValue { .. } => {
                ErrorKind::MalformedFilter
            }
            Error::AggregateFetch { .. } => ErrorKind::AggregateFetch,
            Error::PipelineExecution { .. } => ErrorKind::PipelineExecution,
            Error::Protocol(_) | Error::Json(_) => ErrorKind::Serialization,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = Error::UnknownProperty {
            class: "Order".into(),
            property: "colour".into(),
        };
        assert_eq!(err.to_string(), "unknown property colour of class Order");
        assert_eq!(err.kind(), ErrorKind::UnknownProperty);
    }

    #[test]
    fn test_error_kind() {
        assert_eq!(
            Error::unsupported_join("Order", "lines", "composite key").kind(),
            ErrorKind::UnsupportedJoin
        );
        assert_eq!(Error::malformed("$foo", "unknown operator").kind(), ErrorKind::MalformedFilter);
        assert_eq!(Error::execution("wh_order", "boom").kind(), ErrorKind::PipelineExecution);
    }
}
