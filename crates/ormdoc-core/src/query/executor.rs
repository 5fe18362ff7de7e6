//! Query executor.
//!
//! Compiles queries and runs the resulting plans through an execution adapter.

use std::collections::BTreeMap;
use std::sync::Arc;

use ormdoc_proto::{AggregateRequest, Aggregation, Document, ListQuery, PipelineStage};
use serde_json::{json, Value};
use tracing::{debug, instrument};

use super::compiler::{QueryCompiler, QueryPlan};
use super::keys::filter_by_item_ids;
use super::normalize::normalize;
use super::partition::render_query;
use crate::adapter::ExecutionAdapter;
use crate::error::Error;

/// Rows of a list query.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ListResult {
    /// Returned rows.
    pub rows: Vec<Document>,
    /// Total number of matching rows, when requested.
    pub total: Option<u64>,
}

/// Runs compiled queries against an execution adapter.
pub struct QueryExecutor {
    compiler: QueryCompiler,
    adapter: Arc<dyn ExecutionAdapter>,
}

impl QueryExecutor {
    /// Create an executor.
    pub fn new(compiler: QueryCompiler, adapter: Arc<dyn ExecutionAdapter>) -> Self {
        Self { compiler, adapter }
    }

    pub fn compiler(&self) -> &QueryCompiler {
        &self.compiler
    }

    /// Compile a query without running it.
    pub async fn compile(&self, query: &ListQuery) -> Result<QueryPlan, Error> {
        self.compiler.compile(query, self.adapter.as_ref()).await
    }

    /// Run a list query.
    #[instrument(skip(self, query), fields(class = %query.class_name))]
    pub async fn list(&self, query: &ListQuery) -> Result<ListResult, Error> {
        let plan = self.compile(query).await?;
        let result = match &plan {
            QueryPlan::Find(find) => {
                let rows = self
                    .adapter
                    .find(find)
                    .await
                    .map_err(|e| execution_error(&find.table, e))?;
                ListResult { rows, total: None }
            }
            QueryPlan::Aggregate(pipeline) => {
                let rows = self.run(&pipeline.table, &pipeline.stages).await?;
                let total = match &pipeline.count_stages {
                    Some(stages) => Some(self.total(&pipeline.table, stages).await?),
                    None => None,
                };
                ListResult { rows, total }
            }
        };
        debug!(rows = result.rows.len(), total = ?result.total, "Listed rows");
        Ok(result)
    }

    /// Count the rows matching a domain filter.
    pub async fn count(&self, class_name: &str, filter: Option<Value>) -> Result<u64, Error> {
        let mut query = ListQuery::new(class_name).with_count_total();
        query.filter = filter;
        match self.compile(&query).await? {
            QueryPlan::Aggregate(plan) => match &plan.count_stages {
                Some(stages) => self.total(&plan.table, stages).await,
                None => Ok(self.run(&plan.table, &plan.stages).await?.len() as u64),
            },
            QueryPlan::Find(find) => {
                let mut stages = Vec::new();
                if !find.filter.is_empty() {
                    stages.push(PipelineStage::Match(find.filter.clone()));
                }
                let mut total = Document::new();
                total.insert(self.compiler.config().count_field.clone(), json!({"$sum": 1}));
                stages.push(PipelineStage::group(Value::Null, total));
                self.total(&find.table, &stages).await
            }
        }
    }

    /// Fetch one item by id.
    pub async fn get_item(&self, class_name: &str, id: &str) -> Result<Option<Document>, Error> {
        let query = ListQuery::new(class_name)
            .with_filter(json!({ "$ItemId": id }))
            .with_pagination(0, 1);
        Ok(self.list(&query).await?.rows.into_iter().next())
    }

    /// Fetch the items with the given ids.
    pub async fn get_items(&self, class_name: &str, ids: &[String]) -> Result<Vec<Document>, Error> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let cm = self.compiler.class_meta(class_name)?;
        let filter = filter_by_item_ids(self.compiler.keys(), &cm, ids)?;
        let query = ListQuery::new(class_name).with_filter(filter);
        Ok(self.list(&query).await?.rows)
    }

    /// Compute aggregates over the rows of a class matching a domain filter.
    ///
    /// The filter may not traverse relations.
    pub async fn aggregate(
        &self,
        class_name: &str,
        filter: Option<&Value>,
        aggregations: BTreeMap<String, Aggregation>,
    ) -> Result<Document, Error> {
        let cm = self.compiler.class_meta(class_name)?;
        let table = cm.table_name(&self.compiler.config().namespace_separator);
        let node = self
            .compiler
            .resolve_filter(&cm, filter, self.adapter.as_ref())
            .await?;
        let mut request = AggregateRequest::new().with_filter(render_query(&normalize(node)?)?);
        for (alias, aggregation) in aggregations {
            request = request.with_aggregation(alias, aggregation);
        }
        self.adapter
            .aggregate(&table, &request)
            .await
            .map_err(|e| execution_error(&table, e))
    }

    async fn run(&self, table: &str, stages: &[PipelineStage]) -> Result<Vec<Document>, Error> {
        self.adapter
            .run_pipeline(table, stages)
            .await
            .map_err(|e| execution_error(table, e))
    }

    async fn total(&self, table: &str, stages: &[PipelineStage]) -> Result<u64, Error> {
        let rows = self.run(table, stages).await?;
        let field = &self.compiler.config().count_field;
        Ok(rows
            .first()
            .and_then(|row| row.get(field))
            .and_then(Value::as_u64)
            .unwrap_or(0))
    }
}

fn execution_error(table: &str, error: Error) -> Error {
    match error {
        e @ Error::PipelineExecution { .. } => e,
        other => Error::execution(table, other),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapter::MemoryStore;
    use crate::test_support::{shop_catalog, shop_store};
    use ormdoc_proto::{AggregateFunction, SortSpec};
    use pretty_assertions::assert_eq;

    fn executor(store: MemoryStore) -> QueryExecutor {
        QueryExecutor::new(QueryCompiler::new(Arc::new(shop_catalog())), Arc::new(store))
    }

    #[tokio::test]
    async fn test_list_plain_read() {
        let executor = executor(shop_store());
        let query = ListQuery::new("Order")
            .with_filter(json!({"status": "open"}))
            .with_sort(SortSpec::asc("number"));
        let result = executor.list(&query).await.unwrap();
        let numbers: Vec<Value> = result.rows.iter().map(|r| r["number"].clone()).collect();
        assert_eq!(numbers, vec![json!(1), json!(3)]);
        assert_eq!(result.total, None);
    }

    #[tokio::test]
    async fn test_count() {
        let executor = executor(shop_store());
        assert_eq!(executor.count("Order", None).await.unwrap(), 3);
        assert_eq!(
            executor
                .count("Order", Some(json!({"items": {"$empty": true}})))
                .await
                .unwrap(),
            1
        );
    }

    #[tokio::test]
    async fn test_get_item() {
        let executor = executor(shop_store());
        let item = executor.get_item("Order", "2").await.unwrap().unwrap();
        assert_eq!(item["status"], json!("closed"));
        assert!(executor.get_item("Order", "99").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_get_items() {
        let executor = executor(shop_store());
        let items = executor
            .get_items("Order", &["1".to_string(), "3".to_string()])
            .await
            .unwrap();
        assert_eq!(items.len(), 2);
    }

    #[tokio::test]
    async fn test_aggregate() {
        let executor = executor(shop_store());
        let mut aggregations = BTreeMap::new();
        aggregations.insert(
            "sum".to_string(),
            Aggregation::new(AggregateFunction::Sum, Some("amount".into())),
        );
        let result = executor
            .aggregate("Order", Some(&json!({"status": "open"})), aggregations)
            .await
            .unwrap();
        assert_eq!(result.get("sum").and_then(Value::as_f64), Some(40.0));
    }

    #[tokio::test]
    async fn test_aggregate_rejects_joins() {
        let executor = executor(shop_store());
        let err = executor
            .aggregate("Order", Some(&json!({"items": {"$empty": true}})), BTreeMap::new())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::UnsupportedJoin { .. }));
    }
}
