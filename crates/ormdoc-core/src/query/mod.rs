//! Query compilation for ormdoc.
//!
//! A list query passes through these steps:
//!
//! 1. [`FilterTranslator`] turns the domain filter into a [`FilterNode`] tree,
//!    with join markers for relation tests and placeholders for aggregate values.
//! 2. [`Translation::resolve`] fetches aggregate values through the adapter.
//! 3. [`normalize`] pushes negations down to the leaves.
//! 4. [`Partitioner`] splits the filter into pre-join, post-join and size
//!    probe conditions and registers the joins they need in a [`JoinRegistry`].
//! 5. [`PipelineAssembler`] emits the pipeline, or nothing when a plain read
//!    answers the query.
//!
//! [`QueryCompiler`] drives these steps and [`QueryExecutor`] runs the result.
//!
//! [`FilterNode`]: ormdoc_proto::FilterNode

mod assemble;
pub mod cast;
mod compiler;
pub mod dates;
mod executor;
pub mod keys;
mod normalize;
mod partition;
mod registry;
mod search;
mod translate;

pub use assemble::{AssembledPipeline, PipelineAssembler};
pub use compiler::{AggregatePlan, FindPlan, QueryCompiler, QueryPlan};
pub use executor::{ListResult, QueryExecutor};
pub use keys::{filter_by_item_ids, KeyProvider, SeparatorKeyProvider};
pub use normalize::normalize;
pub use partition::{render_query, Fragment, Partition, Partitioner, Piece};
pub use registry::{JoinRegistry, RegisteredJoin, SizeProbe};
pub use search::{term_pattern, SearchBuilder};
pub use translate::{FilterTranslator, PendingAggregate, Translation, AGGREGATE_RESULT_KEY};
