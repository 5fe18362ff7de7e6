//! ormdoc core - class catalog, domain filter translation and pipeline compilation.
//!
//! This crate turns queries written against class metadata into plans a
//! document store can run: plain filtered reads, or aggregation pipelines
//! with lookups when the filter tests related objects.

pub mod adapter;
pub mod catalog;
pub mod config;
pub mod error;
pub mod query;

pub use adapter::{ExecutionAdapter, MemoryStore};
pub use catalog::{Catalog, ClassMeta, ClassMetaProvider, PropertyMeta, PropertyType};
pub use config::CompilerConfig;
pub use error::{Error, ErrorKind};
pub use query::{ListResult, QueryCompiler, QueryExecutor, QueryPlan};

/// Re-export protocol types.
pub use ormdoc_proto as proto;
