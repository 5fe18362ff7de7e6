//! Pipeline assembly.
//!
//! Stages are appended in a fixed order: pre-match, lookups, post-match,
//! redact, deduplication, sort, skip/limit, output. A separate counting
//! pipeline shares everything up to the deduplication group.

use ormdoc_proto::{Document, ListQuery, PipelineStage, ID_FIELD};
use serde_json::{json, Value};
use tracing::debug;

use super::partition::Partition;
use super::registry::{RegisteredJoin, SizeProbe};
use crate::catalog::ClassMeta;
use crate::config::CompilerConfig;
use crate::error::Error;

/// Row variable of size-probe filters.
const ROW_VAR: &str = "r";

/// Field holding grouped row tuples in the data branch of a counted query.
const ROWS_FIELD: &str = "rows";

/// Assembled pipelines for one query.
#[derive(Debug, Clone, PartialEq)]
pub struct AssembledPipeline {
    /// Pipeline returning the rows.
    pub stages: Vec<PipelineStage>,
    /// Pipeline returning a single `{count_field: n}` document.
    pub count_stages: Option<Vec<PipelineStage>>,
}

/// Builds pipelines from partitioned filters.
pub struct PipelineAssembler<'a> {
    config: &'a CompilerConfig,
}

impl<'a> PipelineAssembler<'a> {
    /// Create an assembler.
    pub fn new(config: &'a CompilerConfig) -> Self {
        Self { config }
    }

    /// Assemble the pipeline of a query.
    ///
    /// Returns `None` when a plain filtered read answers the query.
    pub fn assemble(&self, cm: &ClassMeta, partition: &Partition, query: &ListQuery) -> Result<Option<AssembledPipeline>, Error> {
        let tuple = result_tuple(cm, query)?;
        let registry = &partition.registry;
        let needs_pipeline = !registry.is_empty()
            || partition.post_match.is_some()
            || partition.redact.is_some()
            || query.count_total
            || query.output.is_some();
        if !needs_pipeline {
            return Ok(None);
        }

        let mut stages = Vec::new();
        if let Some(pre) = &partition.pre_match {
            stages.push(PipelineStage::Match(pre.clone()));
        }

        let mut carry: Vec<String> = std::iter::once(ID_FIELD.to_string())
            .chain(cm.stored_attributes().map(|p| p.name.clone()))
            .collect();
        for join in registry.joins() {
            self.push_join(&mut stages, &mut carry, join);
        }

        if let Some(post) = &partition.post_match {
            stages.push(PipelineStage::Match(post.clone()));
        }
        if let Some(redact) = &partition.redact {
            stages.push(PipelineStage::keep_if(redact.clone()));
        }

        let dedup = registry.unwinds();
        let reshape = !registry.is_empty() || !query.projection.is_empty();

        let count_stages = if query.count_total {
            let mut count = stages.clone();
            if dedup {
                count.push(group_tuple(&tuple));
            }
            let mut total = Document::new();
            total.insert(self.config.count_field.clone(), json!({"$sum": 1}));
            count.push(PipelineStage::group(Value::Null, total));
            Some(count)
        } else {
            None
        };

        if dedup {
            stages.push(group_tuple(&tuple));
            if query.count_total {
                let mut rows = Document::new();
                rows.insert(ROWS_FIELD.into(), json!({"$addToSet": "$_id"}));
                stages.push(PipelineStage::group(Value::Null, rows));
                stages.push(PipelineStage::unwind_preserving(ROWS_FIELD));
                stages.push(PipelineStage::Project(flatten(&tuple, ROWS_FIELD)));
            } else {
                stages.push(PipelineStage::Project(flatten(&tuple, ID_FIELD)));
            }
        } else if reshape {
            stages.push(PipelineStage::Project(include(&tuple)));
        }

        if !query.sort.is_empty() {
            let mut sort = Document::new();
            for spec in &query.sort {
                sort.insert(spec.field.clone(), json!(spec.direction.as_i32()));
            }
            stages.push(PipelineStage::Sort(sort));
        }
        if let Some(offset) = query.offset.filter(|o| *o > 0) {
            stages.push(PipelineStage::Skip(offset));
        }
        if let Some(count) = query.count.filter(|c| *c > 0) {
            stages.push(PipelineStage::Limit(count));
        }
        if let Some(output) = &query.output {
            stages.push(PipelineStage::Out(output.clone()));
        }

        debug!(
            class = %cm.canonical_name(),
            stages = stages.len(),
            dedup,
            counted = count_stages.is_some(),
            "Assembled pipeline"
        );
        Ok(Some(AssembledPipeline {
            stages,
            count_stages,
        }))
    }

    fn push_join(&self, stages: &mut Vec<PipelineStage>, carry: &mut Vec<String>, join: &RegisteredJoin) {
        let local = if join.many && !join.exists_only {
            let key = format!("{}_key", join.alias);
            let mut project = include(carry);
            project.insert(key.clone(), Value::String(format!("${}", join.left)));
            stages.push(PipelineStage::Project(project));
            stages.push(PipelineStage::unwind_preserving(&key));
            key
        } else {
            join.left.clone()
        };
        stages.push(PipelineStage::lookup(
            &join.table,
            local,
            &join.right,
            &join.alias,
        ));
        carry.push(join.alias.clone());

        if !join.probes.is_empty() {
            let mut project = include(carry);
            for probe in &join.probes {
                project.insert(probe.field.clone(), size_expr(&join.alias, probe));
                carry.push(probe.field.clone());
            }
            stages.push(PipelineStage::Project(project));
        }
        if !join.exists_only {
            stages.push(PipelineStage::unwind_preserving(&join.alias));
        }
    }
}

/// Fields of a result row: the id, the requested or stored attributes, and sort keys.
fn result_tuple(cm: &ClassMeta, query: &ListQuery) -> Result<Vec<String>, Error> {
    let check = |field: &str| {
        if field == ID_FIELD || cm.property_meta(field).is_some() {
            Ok(())
        } else {
            Err(Error::UnknownProperty {
                class: cm.canonical_name(),
                property: field.to_string(),
            })
        }
    };

    let mut tuple = vec![ID_FIELD.to_string()];
    let attributes: Vec<String> = if query.projection.is_empty() {
        cm.stored_attributes().map(|p| p.name.clone()).collect()
    } else {
        query.projection.clone()
    };
    for field in attributes.iter().chain(query.sort.iter().map(|s| &s.field)) {
        check(field)?;
        if !tuple.contains(field) {
            tuple.push(field.clone());
        }
    }
    Ok(tuple)
}

fn include(fields: &[String]) -> Document {
    fields
        .iter()
        .map(|f| (f.clone(), json!(1)))
        .collect()
}

fn group_tuple(tuple: &[String]) -> PipelineStage {
    let key: Document = tuple
        .iter()
        .map(|f| (f.clone(), Value::String(format!("${}", f))))
        .collect();
    PipelineStage::group(Value::Object(key), Document::new())
}

fn flatten(tuple: &[String], from: &str) -> Document {
    tuple
        .iter()
        .map(|f| (f.clone(), Value::String(format!("${}.{}", from, f))))
        .collect()
}

fn size_expr(alias: &str, probe: &SizeProbe) -> Value {
    let input = json!({"$ifNull": [format!("${}", alias), []]});
    match &probe.filter {
        None => json!({"$size": input}),
        Some(cond) => json!({"$size": {"$filter": {
            "input": input,
            "as": ROW_VAR,
            "cond": cond,
        }}}),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::{PropertyMeta, PropertyType};
    use crate::query::partition::Partitioner;
    use crate::query::registry::JoinRegistry;
    use ormdoc_proto::{pipeline_to_value, CompareOp, FieldOp, FilterNode, JoinSpec, Operand, SortSpec};
    use pretty_assertions::assert_eq;

    fn order() -> ClassMeta {
        ClassMeta::new("Order", "number")
            .with_properties(vec![
                PropertyMeta::new("number", PropertyType::Int),
                PropertyMeta::new("status", PropertyType::String),
                PropertyMeta::collection("items", "OrderLine").with_back_ref("orderId"),
            ])
    }

    fn partition(cm: &ClassMeta, node: &FilterNode) -> Partition {
        let reserved = std::iter::once(ID_FIELD.to_string())
            .chain(cm.stored_attributes().map(|p| p.name.clone()));
        Partitioner::new(JoinRegistry::new(reserved, "_size"))
            .partition(node)
            .unwrap()
    }

    fn items() -> JoinSpec {
        JoinSpec::new("OrderLine", "_id", "orderId", false).with_alias("items")
    }

    #[test]
    fn test_plain_query_needs_no_pipeline() {
        let config = CompilerConfig::default();
        let cm = order();
        let p = partition(&cm, &FilterNode::eq("status", "open"));
        let query = ListQuery::new("Order");
        assert!(PipelineAssembler::new(&config).assemble(&cm, &p, &query).unwrap().is_none());
    }

    #[test]
    fn test_contains_pipeline() {
        let config = CompilerConfig::default();
        let cm = order();
        let node = FilterNode::JoinExists(items().with_filter(FilterNode::field(
            "qty",
            FieldOp::Compare(CompareOp::Gt, Operand::Value(json!(5))),
        )));
        let p = partition(&cm, &node);
        let pipeline = PipelineAssembler::new(&config)
            .assemble(&cm, &p, &ListQuery::new("Order"))
            .unwrap()
            .unwrap();
        assert_eq!(
            pipeline_to_value(&pipeline.stages).unwrap(),
            json!([
                {"$lookup": {"from": "OrderLine", "localField": "_id", "foreignField": "orderId", "as": "items"}},
                {"$unwind": {"path": "$items", "preserveNullAndEmptyArrays": true}},
                {"$match": {"items": {"$exists": true}, "items.qty": {"$gt": 5}}},
                {"$group": {"_id": {"_id": "$_id", "number": "$number", "status": "$status"}}},
                {"$project": {"_id": "$_id._id", "number": "$_id.number", "status": "$_id.status"}}
            ])
        );
        assert!(pipeline.count_stages.is_none());
    }

    #[test]
    fn test_existence_only_join_is_not_unwound() {
        let config = CompilerConfig::default();
        let cm = order();
        let p = partition(&cm, &FilterNode::JoinNotExists(items()));
        let pipeline = PipelineAssembler::new(&config)
            .assemble(&cm, &p, &ListQuery::new("Order"))
            .unwrap()
            .unwrap();
        assert_eq!(
            pipeline_to_value(&pipeline.stages).unwrap(),
            json!([
                {"$lookup": {"from": "OrderLine", "localField": "_id", "foreignField": "orderId", "as": "items"}},
                {"$project": {
                    "_id": 1, "number": 1, "status": 1, "items": 1,
                    "items_size": {"$size": {"$ifNull": ["$items", []]}}
                }},
                {"$redact": {"$cond": {
                    "if": {"$eq": ["$items_size", 0]}, "then": "$$KEEP", "else": "$$PRUNE"
                }}},
                {"$project": {"_id": 1, "number": 1, "status": 1}}
            ])
        );
    }

    #[test]
    fn test_stored_many_join_unwinds_key() {
        let config = CompilerConfig::default();
        let cm = ClassMeta::new("Order", "number").with_properties(vec![
            PropertyMeta::new("number", PropertyType::Int),
            PropertyMeta::collection("tags", "Tag"),
        ]);
        let join = JoinSpec::new("Tag", "tags", "code", true)
            .with_alias("tags")
            .with_filter(FilterNode::eq("label", "red"));
        let p = partition(&cm, &FilterNode::JoinExists(join));
        let stages = PipelineAssembler::new(&config)
            .assemble(&cm, &p, &ListQuery::new("Order"))
            .unwrap()
            .unwrap()
            .stages;
        let names: Vec<&str> = stages.iter().map(PipelineStage::name).collect();
        assert_eq!(
            names,
            vec!["$project", "$unwind", "$lookup", "$unwind", "$match", "$group", "$project"]
        );
        assert_eq!(
            stages[0],
            PipelineStage::Project(
                serde_json::from_value(json!({"_id": 1, "number": 1, "tags": 1, "tags_1_key": "$tags"}))
                    .unwrap()
            )
        );
    }

    #[test]
    fn test_count_and_pagination() {
        let config = CompilerConfig::default();
        let cm = order();
        let node = FilterNode::And(vec![
            FilterNode::eq("status", "open"),
            FilterNode::JoinExists(items().with_filter(FilterNode::eq("qty", 1))),
        ]);
        let p = partition(&cm, &node);
        let query = ListQuery::new("Order")
            .with_sort(SortSpec::desc("number"))
            .with_pagination(10, 5)
            .with_count_total();
        let pipeline = PipelineAssembler::new(&config).assemble(&cm, &p, &query).unwrap().unwrap();

        let names: Vec<&str> = pipeline.stages.iter().map(PipelineStage::name).collect();
        assert_eq!(
            names,
            vec![
                "$match", "$lookup", "$unwind", "$match", "$group", "$group", "$unwind",
                "$project", "$sort", "$skip", "$limit"
            ]
        );
        let count = pipeline.count_stages.unwrap();
        assert_eq!(
            pipeline_to_value(&count[count.len() - 1..]).unwrap(),
            json!([{"$group": {"_id": null, "total": {"$sum": 1}}}])
        );
        assert_eq!(count.len(), 6);
    }

    #[test]
    fn test_unknown_sort_field() {
        let config = CompilerConfig::default();
        let cm = order();
        let p = partition(&cm, &FilterNode::Const(true));
        let query = ListQuery::new("Order").with_sort(SortSpec::asc("colour"));
        let err = PipelineAssembler::new(&config).assemble(&cm, &p, &query).unwrap_err();
        assert!(matches!(err, Error::UnknownProperty { .. }));
    }

    #[test]
    fn test_output_stage_is_last() {
        let config = CompilerConfig::default();
        let cm = order();
        let p = partition(&cm, &FilterNode::eq("status", "open"));
        let query = ListQuery::new("Order").with_output("open_orders");
        let stages = PipelineAssembler::new(&config).assemble(&cm, &p, &query).unwrap().unwrap().stages;
        assert_eq!(
            pipeline_to_value(&stages).unwrap(),
            json!([{"$match": {"status": "open"}}, {"$out": "open_orders"}])
        );
    }
}
