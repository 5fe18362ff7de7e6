//! In-memory document store.
//!
//! Runs compiled pipelines over collections held in memory. Used by tests
//! and by the command-line tool to try queries against fixture data.

use std::cmp::Ordering;
use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use ormdoc_proto::pipeline::{Group, Lookup, Unwind};
use ormdoc_proto::value::{compare_values, values_equal};
use ormdoc_proto::{AggregateFunction, AggregateRequest, Aggregation, Document, PipelineStage, ID_FIELD};
use parking_lot::RwLock;
use serde_json::{Number, Value};
use tracing::debug;

use super::eval::{matches_value, path_values, truthy, Context};
use super::ExecutionAdapter;
use crate::error::Error;

/// Collections of documents held in memory.
#[derive(Debug, Default)]
pub struct MemoryStore {
    collections: RwLock<HashMap<String, Vec<Document>>>,
}

impl MemoryStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a document.
    pub fn insert(&self, table: &str, doc: Document) {
        self.collections
            .write()
            .entry(table.to_string())
            .or_default()
            .push(doc);
    }

    /// Insert several documents.
    pub fn insert_many(&self, table: &str, docs: impl IntoIterator<Item = Document>) {
        self.collections
            .write()
            .entry(table.to_string())
            .or_default()
            .extend(docs);
    }

    /// Load collections from a JSON object mapping table names to document arrays.
    pub fn load_fixture(&self, json: &str) -> Result<(), Error> {
        let fixture: HashMap<String, Vec<Document>> = serde_json::from_str(json)?;
        let mut collections = self.collections.write();
        for (table, docs) in fixture {
            collections.entry(table).or_default().extend(docs);
        }
        Ok(())
    }

    /// Snapshot of a collection.
    pub fn collection(&self, table: &str) -> Vec<Document> {
        self.collections.read().get(table).cloned().unwrap_or_default()
    }

    /// Number of documents in a collection.
    pub fn len(&self, table: &str) -> usize {
        self.collections.read().get(table).map_or(0, Vec::len)
    }

    /// Check whether a collection is empty or absent.
    pub fn is_empty(&self, table: &str) -> bool {
        self.len(table) == 0
    }

    fn run(&self, table: &str, stages: &[PipelineStage]) -> Result<Vec<Document>, String> {
        let now = Utc::now();
        let mut docs = self.collection(table);
        for stage in stages {
            docs = match stage {
                PipelineStage::Match(query) => {
                    let mut kept = Vec::with_capacity(docs.len());
                    for doc in docs {
                        if matches_value(&Value::Object(doc.clone()), query, now)? {
                            kept.push(doc);
                        }
                    }
                    kept
                }
                PipelineStage::Lookup(lookup) => self.lookup(docs, lookup),
                PipelineStage::Unwind(unwind) => unwind_docs(docs, unwind),
                PipelineStage::Redact(expr) => {
                    let mut kept = Vec::with_capacity(docs.len());
                    for doc in docs {
                        let root = Value::Object(doc);
                        let verdict = Context::new(&root, now).eval(expr)?;
                        match verdict {
                            Some(Value::String(s)) if s == "$$KEEP" => {
                                if let Value::Object(doc) = root {
                                    kept.push(doc);
                                }
                            }
                            Some(Value::String(s)) if s == "$$PRUNE" => {}
                            other => return Err(format!("$redact must yield $$KEEP or $$PRUNE, got {:?}", other)),
                        }
                    }
                    kept
                }
                PipelineStage::Project(spec) => {
                    let mut out = Vec::with_capacity(docs.len());
                    for doc in docs {
                        out.push(project(doc, spec, now)?);
                    }
                    out
                }
                PipelineStage::Group(group) => group_docs(docs, group, now)?,
                PipelineStage::Sort(spec) => {
                    let mut docs = docs;
                    docs.sort_by(|a, b| sort_order(a, b, spec));
                    docs
                }
                PipelineStage::Skip(n) => docs.into_iter().skip(*n as usize).collect(),
                PipelineStage::Limit(n) => docs.into_iter().take(*n as usize).collect(),
                PipelineStage::Out(target) => {
                    self.collections.write().insert(target.clone(), docs);
                    Vec::new()
                }
            };
        }
        Ok(docs)
    }

    fn lookup(&self, docs: Vec<Document>, lookup: &Lookup) -> Vec<Document> {
        let foreign = self.collection(&lookup.from);
        docs.into_iter()
            .map(|mut doc| {
                let mut locals = join_values(&Value::Object(doc.clone()), &lookup.local_field);
                if locals.is_empty() {
                    locals.push(Value::Null);
                }
                let related: Vec<Value> = foreign
                    .iter()
                    .filter(|f| {
                        let mut remote = join_values(&Value::Object((*f).clone()), &lookup.foreign_field);
                        if remote.is_empty() {
                            remote.push(Value::Null);
                        }
                        remote
                            .iter()
                            .any(|r| locals.iter().any(|l| values_equal(l, r)))
                    })
                    .cloned()
                    .map(Value::Object)
                    .collect();
                doc.insert(lookup.as_field.clone(), Value::Array(related));
                doc
            })
            .collect()
    }

    fn aggregate_sync(&self, table: &str, request: &AggregateRequest) -> Result<Document, String> {
        let now = Utc::now();
        let mut docs = Vec::new();
        for doc in self.collection(table) {
            let keep = match &request.filter {
                Some(filter) => matches_value(&Value::Object(doc.clone()), filter, now)?,
                None => true,
            };
            if keep {
                docs.push(doc);
            }
        }

        let mut result = Document::new();
        for (alias, aggregation) in &request.aggregations {
            result.insert(alias.clone(), aggregate_docs(&docs, aggregation));
        }
        Ok(result)
    }
}

#[async_trait]
impl ExecutionAdapter for MemoryStore {
    async fn aggregate(&self, table: &str, request: &AggregateRequest) -> Result<Document, Error> {
        let result = self
            .aggregate_sync(table, request)
            .map_err(|reason| Error::execution(table, reason))?;
        debug!(table, aggregations = result.len(), "Aggregated in memory");
        Ok(result)
    }

    async fn run_pipeline(&self, table: &str, stages: &[PipelineStage]) -> Result<Vec<Document>, Error> {
        let rows = self
            .run(table, stages)
            .map_err(|reason| Error::execution(table, reason))?;
        debug!(table, stages = stages.len(), rows = rows.len(), "Ran pipeline in memory");
        Ok(rows)
    }
}

/// Values of a join field; array values contribute their elements.
fn join_values(doc: &Value, path: &str) -> Vec<Value> {
    let mut out = Vec::new();
    for value in path_values(doc, path) {
        match value {
            Value::Array(items) => out.extend(items),
            other => out.push(other),
        }
    }
    out
}

fn unwind_docs(docs: Vec<Document>, unwind: &Unwind) -> Vec<Document> {
    let field = unwind.path.trim_start_matches('$');
    let mut out = Vec::with_capacity(docs.len());
    for mut doc in docs {
        match doc.get(field).cloned() {
            Some(Value::Array(items)) if !items.is_empty() => {
                for item in items {
                    let mut row = doc.clone();
                    row.insert(field.to_string(), item);
                    out.push(row);
                }
            }
            Some(Value::Array(_)) | None => {
                if unwind.preserve_null_and_empty_arrays {
                    doc.remove(field);
                    out.push(doc);
                }
            }
            Some(Value::Null) => {
                if unwind.preserve_null_and_empty_arrays {
                    out.push(doc);
                }
            }
            Some(_) => out.push(doc),
        }
    }
    out
}

fn project(doc: Document, spec: &Document, now: DateTime<Utc>) -> Result<Document, String> {
    let root = Value::Object(doc);
    let mut out = Document::new();
    let include_id = !matches!(spec.get(ID_FIELD), Some(v) if !truthy(&Some(v.clone())));
    if include_id && !spec.contains_key(ID_FIELD) {
        if let Some(id) = root.get(ID_FIELD) {
            out.insert(ID_FIELD.to_string(), id.clone());
        }
    }
    for (field, rule) in spec {
        match rule {
            Value::Bool(_) | Value::Number(_) => {
                if truthy(&Some(rule.clone())) {
                    if let Some(value) = root.get(field) {
                        out.insert(field.clone(), value.clone());
                    }
                }
            }
            expr => {
                if let Some(value) = Context::new(&root, now).eval(expr)? {
                    out.insert(field.clone(), value);
                }
            }
        }
    }
    Ok(out)
}

fn group_docs(docs: Vec<Document>, group: &Group, now: DateTime<Utc>) -> Result<Vec<Document>, String> {
    let mut groups: Vec<(Value, Vec<Value>)> = Vec::new();
    for doc in docs {
        let root = Value::Object(doc);
        let key = Context::new(&root, now).eval(&group.id)?.unwrap_or(Value::Null);
        match groups.iter_mut().find(|(k, _)| *k == key) {
            Some((_, members)) => members.push(root),
            None => groups.push((key, vec![root])),
        }
    }

    let mut out = Vec::with_capacity(groups.len());
    for (key, members) in groups {
        let mut doc = Document::new();
        doc.insert(ID_FIELD.to_string(), key);
        for (field, accumulator) in &group.accumulators {
            doc.insert(field.clone(), accumulate(&members, accumulator, now)?);
        }
        out.push(doc);
    }
    Ok(out)
}

fn accumulate(members: &[Value], accumulator: &Value, now: DateTime<Utc>) -> Result<Value, String> {
    let (op, arg) = accumulator
        .as_object()
        .and_then(|doc| doc.iter().next())
        .ok_or("accumulator must be a single-operator document")?;

    let mut values = Vec::with_capacity(members.len());
    for member in members {
        if let Some(value) = Context::new(member, now).eval(arg)? {
            values.push(value);
        }
    }

    Ok(match op.as_str() {
        "$sum" => sum(values.iter()),
        "$avg" => average(values.iter()),
        "$min" => extreme(values, Ordering::Less),
        "$max" => extreme(values, Ordering::Greater),
        "$first" => values.into_iter().next().unwrap_or(Value::Null),
        "$push" => Value::Array(values),
        "$addToSet" => {
            let mut set: Vec<Value> = Vec::new();
            for value in values {
                if !set.iter().any(|v| values_equal(v, &value)) {
                    set.push(value);
                }
            }
            Value::Array(set)
        }
        other => return Err(format!("unsupported accumulator {}", other)),
    })
}

fn sum<'v>(values: impl Iterator<Item = &'v Value>) -> Value {
    let mut int_total: i64 = 0;
    let mut float_total = 0.0;
    let mut is_float = false;
    for value in values {
        if let Value::Number(n) = value {
            match n.as_i64() {
                Some(i) if !is_float => int_total += i,
                _ => {
                    if !is_float {
                        float_total = int_total as f64;
                        is_float = true;
                    }
                    float_total += n.as_f64().unwrap_or(0.0);
                }
            }
        }
    }
    if is_float {
        Number::from_f64(float_total).map_or(Value::Null, Value::Number)
    } else {
        Value::from(int_total)
    }
}

fn average<'v>(values: impl Iterator<Item = &'v Value>) -> Value {
    let numbers: Vec<f64> = values.filter_map(Value::as_f64).collect();
    if numbers.is_empty() {
        return Value::Null;
    }
    let avg = numbers.iter().sum::<f64>() / numbers.len() as f64;
    Number::from_f64(avg).map_or(Value::Null, Value::Number)
}

fn extreme(values: Vec<Value>, wanted: Ordering) -> Value {
    values
        .into_iter()
        .filter(|v| !v.is_null())
        .reduce(|best, v| if compare_values(&v, &best) == wanted { v } else { best })
        .unwrap_or(Value::Null)
}

fn aggregate_docs(docs: &[Document], aggregation: &Aggregation) -> Value {
    let values: Vec<Value> = match &aggregation.field {
        Some(field) => docs
            .iter()
            .flat_map(|d| path_values(&Value::Object(d.clone()), field))
            .filter(|v| !v.is_null())
            .collect(),
        None => Vec::new(),
    };
    match aggregation.function {
        AggregateFunction::Count => match aggregation.field {
            Some(_) => Value::from(values.len()),
            None => Value::from(docs.len()),
        },
        AggregateFunction::Sum => sum(values.iter()),
        AggregateFunction::Avg => average(values.iter()),
        AggregateFunction::Min => extreme(values, Ordering::Less),
        AggregateFunction::Max => extreme(values, Ordering::Greater),
    }
}

fn sort_order(a: &Document, b: &Document, spec: &Document) -> Ordering {
    for (field, direction) in spec {
        let left = a.get(field);
        let right = b.get(field);
        let ord = match (left, right) {
            (None, None) => Ordering::Equal,
            (None, Some(_)) => Ordering::Less,
            (Some(_), None) => Ordering::Greater,
            (Some(l), Some(r)) => compare_values(l, r),
        };
        let ord = if direction.as_i64() == Some(-1) { ord.reverse() } else { ord };
        if ord != Ordering::Equal {
            return ord;
        }
    }
    Ordering::Equal
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn doc(value: Value) -> Document {
        match value {
            Value::Object(doc) => doc,
            _ => panic!("not a document"),
        }
    }

    fn store() -> MemoryStore {
        let store = MemoryStore::new();
        store
            .load_fixture(
                r#"{
                    "Order": [
                        {"_id": 1, "status": "open", "tags": ["a", "b"]},
                        {"_id": 2, "status": "closed", "tags": []}
                    ],
                    "OrderLine": [
                        {"_id": 10, "orderId": 1, "qty": 2},
                        {"_id": 11, "orderId": 1, "qty": 9}
                    ],
                    "Tag": [{"_id": "a", "label": "red"}, {"_id": "b", "label": "blue"}]
                }"#,
            )
            .unwrap();
        store
    }

    #[tokio::test]
    async fn test_lookup_and_unwind() {
        let store = store();
        let stages = vec![
            PipelineStage::lookup("OrderLine", "_id", "orderId", "items"),
            PipelineStage::unwind_preserving("items"),
        ];
        let rows = store.run_pipeline("Order", &stages).await.unwrap();
        assert_eq!(rows.len(), 3);
        assert!(rows[2].get("items").is_none());
    }

    #[tokio::test]
    async fn test_unwind_keeps_null_and_drops_empty() {
        let store = MemoryStore::new();
        store
            .load_fixture(r#"{"Order": [{"_id": 1, "tags": null}, {"_id": 2, "tags": []}, {"_id": 3}]}"#)
            .unwrap();

        let rows = store
            .run_pipeline("Order", &[PipelineStage::unwind_preserving("tags")])
            .await
            .unwrap();
        assert_eq!(rows.len(), 3);
        assert_eq!(rows[0].get("tags"), Some(&Value::Null));
        assert!(rows[1].get("tags").is_none());
        assert!(rows[2].get("tags").is_none());

        let rows = store
            .run_pipeline("Order", &[PipelineStage::Unwind(Unwind {
                path: "$tags".into(),
                preserve_null_and_empty_arrays: false,
            })])
            .await
            .unwrap();
        assert!(rows.is_empty());
    }

    #[tokio::test]
    async fn test_lookup_over_array() {
        let store = store();
        let stages = vec![PipelineStage::lookup("Tag", "tags", "_id", "tag_docs")];
        let rows = store.run_pipeline("Order", &stages).await.unwrap();
        assert_eq!(rows[0]["tag_docs"].as_array().map(Vec::len), Some(2));
        assert_eq!(rows[1]["tag_docs"], json!([]));
    }

    #[tokio::test]
    async fn test_group_and_count() {
        let store = store();
        let stages = vec![
            PipelineStage::group(Value::Null, doc(json!({"n": {"$sum": 1}, "ids": {"$addToSet": "$orderId"}}))),
        ];
        let rows = store.run_pipeline("OrderLine", &stages).await.unwrap();
        assert_eq!(Value::Object(rows[0].clone()), json!({"_id": null, "n": 2, "ids": [1]}));

        let rows = store.run_pipeline("Missing", &stages).await.unwrap();
        assert!(rows.is_empty());
    }

    #[tokio::test]
    async fn test_aggregate() {
        let store = store();
        let request = AggregateRequest::new()
            .with_filter(doc(json!({"orderId": 1})))
            .with_aggregation("max", Aggregation::new(AggregateFunction::Max, Some("qty".into())))
            .with_aggregation("avg", Aggregation::new(AggregateFunction::Avg, Some("qty".into())))
            .with_aggregation("n", Aggregation::new(AggregateFunction::Count, None));
        let result = store.aggregate("OrderLine", &request).await.unwrap();
        assert_eq!(Value::Object(result), json!({"avg": 5.5, "max": 9, "n": 2}));
    }

    #[tokio::test]
    async fn test_out_replaces_collection() {
        let store = store();
        let stages = vec![
            PipelineStage::Match(doc(json!({"status": "open"}))),
            PipelineStage::Out("open_orders".into()),
        ];
        assert!(store.run_pipeline("Order", &stages).await.unwrap().is_empty());
        assert_eq!(store.len("open_orders"), 1);
    }

    #[tokio::test]
    async fn test_geo_is_an_execution_error() {
        let store = store();
        let stages = vec![PipelineStage::Match(doc(json!({"loc": {"$geoWithin": {}}})))];
        let err = store.run_pipeline("Order", &stages).await.unwrap_err();
        assert!(matches!(err, Error::PipelineExecution { .. }));
    }
}
