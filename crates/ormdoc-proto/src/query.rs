//! Query request types.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::value::Document;

/// Sort direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SortDirection {
    /// Ascending order.
    #[default]
    Asc,
    /// Descending order.
    Desc,
}

impl SortDirection {
    /// Numeric form used in `$sort` documents.
    pub fn as_i32(&self) -> i32 {
        match self {
            SortDirection::Asc => 1,
            SortDirection::Desc => -1,
        }
    }
}

/// Sort key of a list query.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SortSpec {
    /// Property to sort by.
    pub field: String,
    /// Direction.
    #[serde(default)]
    pub direction: SortDirection,
}

impl SortSpec {
    /// Ascending sort on a field.
    pub fn asc(field: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            direction: SortDirection::Asc,
        }
    }

    /// Descending sort on a field.
    pub fn desc(field: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            direction: SortDirection::Desc,
        }
    }
}

/// Free-text search request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SearchRequest {
    /// Search term.
    pub term: String,
    /// Language used for date parsing and the full-text clause.
    #[serde(default)]
    pub language: Option<String>,
    /// Attributes to search; empty means the class's semantic attributes.
    #[serde(default)]
    pub attributes: Vec<String>,
    /// How many reference hops to follow; `None` uses the configured default.
    #[serde(default)]
    pub depth: Option<usize>,
}

impl SearchRequest {
    /// Create a search for a term.
    pub fn new(term: impl Into<String>) -> Self {
        Self {
            term: term.into(),
            language: None,
            attributes: Vec::new(),
            depth: None,
        }
    }

    /// Set the language.
    pub fn with_language(mut self, language: impl Into<String>) -> Self {
        self.language = Some(language.into());
        self
    }

    /// Restrict the searched attributes.
    pub fn with_attributes(mut self, attributes: Vec<String>) -> Self {
        self.attributes = attributes;
        self
    }

    /// Set the reference depth.
    pub fn with_depth(mut self, depth: usize) -> Self {
        self.depth = Some(depth);
        self
    }
}

/// A list query over a class.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ListQuery {
    /// Class name (plain or canonical).
    pub class_name: String,
    /// Domain filter.
    #[serde(default)]
    pub filter: Option<Value>,
    /// Free-text search.
    #[serde(default)]
    pub search: Option<SearchRequest>,
    /// Sort keys in priority order.
    #[serde(default)]
    pub sort: Vec<SortSpec>,
    /// Rows to skip.
    #[serde(default)]
    pub offset: Option<u64>,
    /// Maximum rows to return.
    #[serde(default)]
    pub count: Option<u64>,
    /// Also compute the total number of matching rows.
    #[serde(default)]
    pub count_total: bool,
    /// Attributes to return; empty means all stored attributes.
    #[serde(default)]
    pub projection: Vec<String>,
    /// Collection to materialize the result into.
    #[serde(default)]
    pub output: Option<String>,
}

impl ListQuery {
    /// Create a query over a class.
    pub fn new(class_name: impl Into<String>) -> Self {
        Self {
            class_name: class_name.into(),
            ..Default::default()
        }
    }

    /// Set the domain filter.
    pub fn with_filter(mut self, filter: Value) -> Self {
        self.filter = Some(filter);
        self
    }

    /// Set the free-text search.
    pub fn with_search(mut self, search: SearchRequest) -> Self {
        self.search = Some(search);
        self
    }

    /// Add a sort key.
    pub fn with_sort(mut self, sort: SortSpec) -> Self {
        self.sort.push(sort);
        self
    }

    /// Set offset and count.
    pub fn with_pagination(mut self, offset: u64, count: u64) -> Self {
        self.offset = Some(offset);
        self.count = Some(count);
        self
    }

    /// Request the total row count.
    pub fn with_count_total(mut self) -> Self {
        self.count_total = true;
        self
    }

    /// Restrict returned attributes.
    pub fn with_projection(mut self, attributes: Vec<String>) -> Self {
        self.projection = attributes;
        self
    }

    /// Materialize the result into a collection.
    pub fn with_output(mut self, collection: impl Into<String>) -> Self {
        self.output = Some(collection.into());
        self
    }
}

/// Aggregate function types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AggregateFunction {
    /// Number of matching documents.
    Count,
    /// Sum of numeric values.
    Sum,
    /// Average of numeric values.
    Avg,
    /// Minimum value.
    Min,
    /// Maximum value.
    Max,
}

impl AggregateFunction {
    /// Parse a filter key (`$min`, `min`, ...).
    pub fn from_key(key: &str) -> Option<Self> {
        match key.trim_start_matches('$') {
            "count" => Some(AggregateFunction::Count),
            "sum" => Some(AggregateFunction::Sum),
            "avg" => Some(AggregateFunction::Avg),
            "min" => Some(AggregateFunction::Min),
            "max" => Some(AggregateFunction::Max),
            _ => None,
        }
    }

    /// Accumulator operator name.
    pub fn as_operator(&self) -> &'static str {
        match self {
            AggregateFunction::Count => "$count",
            AggregateFunction::Sum => "$sum",
            AggregateFunction::Avg => "$avg",
            AggregateFunction::Min => "$min",
            AggregateFunction::Max => "$max",
        }
    }
}

/// A single aggregation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Aggregation {
    /// Function to apply.
    pub function: AggregateFunction,
    /// Field to aggregate (None for count of documents).
    #[serde(default)]
    pub field: Option<String>,
}

impl Aggregation {
    /// Create an aggregation.
    pub fn new(function: AggregateFunction, field: Option<String>) -> Self {
        Self { function, field }
    }
}

/// An aggregate request sent to an execution adapter.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct AggregateRequest {
    /// Store filter restricting the aggregated documents.
    #[serde(default)]
    pub filter: Option<Document>,
    /// Result alias to aggregation.
    pub aggregations: BTreeMap<String, Aggregation>,
}

impl AggregateRequest {
    /// Create an empty request.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the store filter.
    pub fn with_filter(mut self, filter: Document) -> Self {
        self.filter = if filter.is_empty() { None } else { Some(filter) };
        self
    }

    /// Add an aggregation under an alias.
    pub fn with_aggregation(mut self, alias: impl Into<String>, aggregation: Aggregation) -> Self {
        self.aggregations.insert(alias.into(), aggregation);
        self
    }
}
