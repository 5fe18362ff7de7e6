//! Execution adapters.
//!
//! The compiler never touches a store directly. Aggregate side-channel
//! queries and compiled pipelines go through an [`ExecutionAdapter`].

mod eval;
mod memory;

pub use eval::{evaluate, matches};
pub use memory::MemoryStore;

use async_trait::async_trait;
use ormdoc_proto::{AggregateRequest, Document, PipelineStage, ID_FIELD};
use serde_json::{json, Value};

use crate::error::Error;
use crate::query::FindPlan;

/// A document store able to run aggregation pipelines.
#[async_trait]
pub trait ExecutionAdapter: Send + Sync {
    /// Compute aggregates over the documents of `table` matching the request filter.
    ///
    /// The result maps each requested alias to its value.
    async fn aggregate(&self, table: &str, request: &AggregateRequest) -> Result<Document, Error>;

    /// Run a pipeline over `table`.
    async fn run_pipeline(&self, table: &str, stages: &[PipelineStage]) -> Result<Vec<Document>, Error>;

    /// Run a plain filtered read.
    async fn find(&self, plan: &FindPlan) -> Result<Vec<Document>, Error> {
        self.run_pipeline(&plan.table, &find_stages(plan)).await
    }
}

/// Pipeline equivalent of a plain read.
pub fn find_stages(plan: &FindPlan) -> Vec<PipelineStage> {
    let mut stages = Vec::new();
    if !plan.filter.is_empty() {
        stages.push(PipelineStage::Match(plan.filter.clone()));
    }
    if !plan.sort.is_empty() {
        stages.push(PipelineStage::Sort(plan.sort.clone()));
    }
    if let Some(skip) = plan.skip {
        stages.push(PipelineStage::Skip(skip));
    }
    if let Some(limit) = plan.limit {
        stages.push(PipelineStage::Limit(limit));
    }
    if !plan.projection.is_empty() {
        let mut project = Document::new();
        project.insert(ID_FIELD.into(), json!(1));
        for field in &plan.projection {
            project.insert(field.clone(), Value::from(1));
        }
        stages.push(PipelineStage::Project(project));
    }
    stages
}
