//! Query compiler.
//!
//! Drives a list query through translation, aggregate resolution,
//! normalization, partitioning and assembly, and produces either a plain
//! filtered read or an aggregation pipeline.

use std::sync::Arc;

use ormdoc_proto::{pipeline_to_value, Document, FilterNode, ListQuery, PipelineStage, ID_FIELD};
use serde_json::{json, Value};
use tracing::debug;

use super::assemble::PipelineAssembler;
use super::keys::{KeyProvider, SeparatorKeyProvider};
use super::normalize::normalize;
use super::partition::Partitioner;
use super::registry::JoinRegistry;
use super::search::SearchBuilder;
use super::translate::{FilterTranslator, Translation};
use crate::adapter::ExecutionAdapter;
use crate::catalog::{ClassMeta, ClassMetaProvider};
use crate::config::CompilerConfig;
use crate::error::Error;

/// A read answered by a single filtered scan.
#[derive(Debug, Clone, PartialEq)]
pub struct FindPlan {
    /// Source collection.
    pub table: String,
    /// Store query; empty matches everything.
    pub filter: Document,
    /// Sort document.
    pub sort: Document,
    /// Rows to skip.
    pub skip: Option<u64>,
    /// Maximum rows.
    pub limit: Option<u64>,
    /// Returned attributes; empty returns whole documents.
    pub projection: Vec<String>,
}

/// A read answered by an aggregation pipeline.
#[derive(Debug, Clone, PartialEq)]
pub struct AggregatePlan {
    /// Source collection.
    pub table: String,
    /// Pipeline returning the rows.
    pub stages: Vec<PipelineStage>,
    /// Pipeline returning the total count, when requested.
    pub count_stages: Option<Vec<PipelineStage>>,
}

/// Compiled form of a list query.
#[derive(Debug, Clone, PartialEq)]
pub enum QueryPlan {
    /// Plain filtered read.
    Find(FindPlan),
    /// Aggregation pipeline.
    Aggregate(AggregatePlan),
}

impl QueryPlan {
    /// Source collection of the plan.
    pub fn table(&self) -> &str {
        match self {
            QueryPlan::Find(plan) => &plan.table,
            QueryPlan::Aggregate(plan) => &plan.table,
        }
    }

    /// Check whether the plan needs a pipeline.
    pub fn is_pipeline(&self) -> bool {
        matches!(self, QueryPlan::Aggregate(_))
    }

    /// JSON description of the plan, for display.
    pub fn explain(&self) -> Result<Value, Error> {
        let value = match self {
            QueryPlan::Find(plan) => json!({
                "find": plan.table,
                "filter": plan.filter,
                "sort": plan.sort,
                "skip": plan.skip,
                "limit": plan.limit,
                "projection": plan.projection,
            }),
            QueryPlan::Aggregate(plan) => {
                let count = match &plan.count_stages {
                    Some(stages) => pipeline_to_value(stages)?,
                    None => Value::Null,
                };
                json!({
                    "aggregate": plan.table,
                    "pipeline": pipeline_to_value(&plan.stages)?,
                    "count": count,
                })
            }
        };
        Ok(value)
    }
}

/// Compiles list queries into store plans.
pub struct QueryCompiler {
    provider: Arc<dyn ClassMetaProvider>,
    keys: Arc<dyn KeyProvider>,
    config: CompilerConfig,
}

impl QueryCompiler {
    /// Create a compiler with default configuration.
    pub fn new(provider: Arc<dyn ClassMetaProvider>) -> Self {
        let config = CompilerConfig::default();
        Self {
            provider,
            keys: Arc::new(SeparatorKeyProvider::new(config.key_separator.clone())),
            config,
        }
    }

    /// Replace the configuration.
    ///
    /// Also resets the key provider to one using the configured separator.
    pub fn with_config(mut self, config: CompilerConfig) -> Self {
        self.keys = Arc::new(SeparatorKeyProvider::new(config.key_separator.clone()));
        self.config = config;
        self
    }

    /// Use a custom key provider.
    pub fn with_key_provider(mut self, keys: Arc<dyn KeyProvider>) -> Self {
        self.keys = keys;
        self
    }

    pub fn config(&self) -> &CompilerConfig {
        &self.config
    }

    pub fn provider(&self) -> &dyn ClassMetaProvider {
        self.provider.as_ref()
    }

    pub fn keys(&self) -> &dyn KeyProvider {
        self.keys.as_ref()
    }

    /// Look up a class.
    pub fn class_meta(&self, name: &str) -> Result<Arc<ClassMeta>, Error> {
        self.provider
            .class_meta(name)
            .ok_or_else(|| Error::UnknownClass(name.to_string()))
    }

    /// Translate a domain filter over `cm` without resolving aggregates.
    pub fn translate(&self, cm: &ClassMeta, filter: &Value) -> Result<Translation, Error> {
        FilterTranslator::new(self.provider.as_ref(), self.keys.as_ref(), &self.config)
            .translate(cm, filter)
    }

    /// Domain filter of a query: its filter and its search, conjoined.
    pub fn domain_filter(&self, cm: &ClassMeta, query: &ListQuery) -> Result<Option<Value>, Error> {
        let search = match &query.search {
            Some(request) => Some(SearchBuilder::new(self.provider.as_ref(), &self.config).build(cm, request)?),
            None => None,
        };
        Ok(match (query.filter.clone(), search) {
            (Some(filter), Some(search)) => Some(json!({"$and": [filter, search]})),
            (filter, search) => filter.or(search),
        })
    }

    /// Translate a domain filter and fill in its aggregate values.
    pub async fn resolve_filter(
        &self,
        cm: &ClassMeta,
        filter: Option<&Value>,
        adapter: &dyn ExecutionAdapter,
    ) -> Result<FilterNode, Error> {
        match filter {
            Some(filter) => self.translate(cm, filter)?.resolve(adapter).await,
            None => Ok(FilterNode::Const(true)),
        }
    }

    /// Compile a list query.
    ///
    /// Aggregate values in the filter are fetched through `adapter` before
    /// the plan is built.
    pub async fn compile(&self, query: &ListQuery, adapter: &dyn ExecutionAdapter) -> Result<QueryPlan, Error> {
        let cm = self.class_meta(&query.class_name)?;
        let domain = self.domain_filter(&cm, query)?;
        let filter = self.resolve_filter(&cm, domain.as_ref(), adapter).await?;
        self.plan(&cm, filter, query)
    }

    /// Build the plan of a query whose filter is already translated and resolved.
    pub fn plan(&self, cm: &ClassMeta, filter: FilterNode, query: &ListQuery) -> Result<QueryPlan, Error> {
        let table = cm.table_name(&self.config.namespace_separator);
        let node = normalize(filter)?;

        let reserved = std::iter::once(ID_FIELD.to_string()).chain(cm.stored_attributes().map(|p| p.name.clone()));
        let registry = JoinRegistry::new(reserved, self.config.size_suffix.clone());
        let partition = Partitioner::new(registry).partition(&node)?;

        let plan = match PipelineAssembler::new(&self.config).assemble(cm, &partition, query)? {
            Some(pipeline) => QueryPlan::Aggregate(AggregatePlan {
                table,
                stages: pipeline.stages,
                count_stages: pipeline.count_stages,
            }),
            None => {
                let mut sort = Document::new();
                for spec in &query.sort {
                    sort.insert(spec.field.clone(), json!(spec.direction.as_i32()));
                }
                QueryPlan::Find(FindPlan {
                    table,
                    filter: partition.pre_match.unwrap_or_default(),
                    sort,
                    skip: query.offset.filter(|o| *o > 0),
                    limit: query.count.filter(|c| *c > 0),
                    projection: query.projection.clone(),
                })
            }
        };

        debug!(
            class = %cm.canonical_name(),
            table = %plan.table(),
            pipeline = plan.is_pipeline(),
            "Compiled query"
        );
        Ok(plan)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapter::MemoryStore;
    use crate::test_support::shop_catalog;
    use ormdoc_proto::{SearchRequest, SortSpec};
    use pretty_assertions::assert_eq;

    fn compiler() -> QueryCompiler {
        QueryCompiler::new(Arc::new(shop_catalog()))
    }

    #[tokio::test]
    async fn test_simple_filter_is_find() {
        let store = MemoryStore::new();
        let query = ListQuery::new("Order")
            .with_filter(json!({"status": "open"}))
            .with_sort(SortSpec::desc("date"))
            .with_pagination(10, 5);
        let plan = compiler().compile(&query, &store).await.unwrap();

        let QueryPlan::Find(find) = plan else {
            panic!("expected a plain read");
        };
        assert_eq!(find.table, "shop_Order");
        assert_eq!(Value::Object(find.filter), json!({"status": "open"}));
        assert_eq!(Value::Object(find.sort), json!({"date": -1}));
        assert_eq!(find.skip, Some(10));
        assert_eq!(find.limit, Some(5));
    }

    #[tokio::test]
    async fn test_join_is_pipeline() {
        let store = MemoryStore::new();
        let query = ListQuery::new("Order").with_filter(json!({"items": {"$contains": {"qty": {"$gt": 5}}}}));
        let plan = compiler().compile(&query, &store).await.unwrap();
        assert!(plan.is_pipeline());
        assert_eq!(plan.table(), "shop_Order");
    }

    #[tokio::test]
    async fn test_unknown_class() {
        let store = MemoryStore::new();
        let err = compiler().compile(&ListQuery::new("Invoice"), &store).await.unwrap_err();
        assert!(matches!(err, Error::UnknownClass(name) if name == "Invoice"));
    }

    #[test]
    fn test_domain_filter_conjoins_search() {
        let compiler = QueryCompiler::new(Arc::new(shop_catalog()))
            .with_config(CompilerConfig::default().with_full_text(false));
        let cm = compiler.class_meta("Order").unwrap();
        let query = ListQuery::new("Order")
            .with_filter(json!({"status": "open"}))
            .with_search(SearchRequest::new("7").with_attributes(vec!["number".into()]));
        assert_eq!(
            compiler.domain_filter(&cm, &query).unwrap(),
            Some(json!({"$and": [{"status": "open"}, {"$or": [{"number": 7}]}]}))
        );

        let bare = ListQuery::new("Order");
        assert_eq!(compiler.domain_filter(&cm, &bare).unwrap(), None);
    }

    #[tokio::test]
    async fn test_explain() {
        let store = MemoryStore::new();
        let plan = compiler().compile(&ListQuery::new("Order"), &store).await.unwrap();
        assert_eq!(
            plan.explain().unwrap(),
            json!({
                "find": "shop_Order",
                "filter": {},
                "sort": {},
                "skip": null,
                "limit": null,
                "projection": [],
            })
        );
    }
}
