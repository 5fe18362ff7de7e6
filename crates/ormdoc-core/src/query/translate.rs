//! Domain filter translation.
//!
//! Walks a domain filter written against class properties and produces a
//! store [`FilterNode`] tree: values are cast to property types, collection
//! tests and dotted reference paths become join markers, and aggregate values
//! become placeholders that are filled in by [`Translation::resolve`].

use std::sync::Arc;

use futures::future::try_join_all;
use ormdoc_proto::value::date_value;
use ormdoc_proto::{
    AggregateFunction, AggregateRequest, Aggregation, CompareOp, FieldOp, FilterNode, JoinSpec,
    Operand, ID_FIELD,
};
use serde_json::{Map, Value};
use tracing::debug;

use super::cast::cast_value;
use super::dates::{date_operand, is_date_operand};
use super::keys::KeyProvider;
use super::normalize::normalize;
use super::partition::render_query;
use crate::adapter::ExecutionAdapter;
use crate::catalog::{ClassMeta, ClassMetaProvider, PropertyMeta, PropertyType};
use crate::config::CompilerConfig;
use crate::error::Error;

/// Alias under which aggregate side-channel queries return their value.
pub const AGGREGATE_RESULT_KEY: &str = "val";

/// An aggregate query whose result a translated filter is waiting for.
#[derive(Debug, Clone, PartialEq)]
pub struct PendingAggregate {
    /// Collection to aggregate.
    pub table: String,
    /// Request to send.
    pub request: AggregateRequest,
}

/// Output of the translator.
#[derive(Debug, Clone)]
pub struct Translation {
    /// Store filter; may hold aggregate placeholders.
    pub filter: FilterNode,
    /// Side-channel queries, indexed by placeholder slot.
    pub aggregates: Vec<PendingAggregate>,
}

impl Translation {
    /// Check whether the filter is usable without side-channel results.
    pub fn is_complete(&self) -> bool {
        self.aggregates.is_empty()
    }

    /// Run all side-channel queries concurrently and substitute their results.
    ///
    /// The first failure aborts the translation.
    pub async fn resolve(self, adapter: &dyn ExecutionAdapter) -> Result<FilterNode, Error> {
        if self.aggregates.is_empty() {
            return Ok(self.filter);
        }
        debug!(count = self.aggregates.len(), "Fetching aggregate filter values");

        let fetches = self.aggregates.iter().map(|pending| async move {
            let result = adapter
                .aggregate(&pending.table, &pending.request)
                .await
                .map_err(|e| Error::AggregateFetch {
                    table: pending.table.clone(),
                    reason: e.to_string(),
                })?;
            result
                .get(AGGREGATE_RESULT_KEY)
                .cloned()
                .ok_or_else(|| Error::AggregateFetch {
                    table: pending.table.clone(),
                    reason: "empty result".to_string(),
                })
        });
        let values = try_join_all(fetches).await?;

        let filter = self.filter.map_operands(&mut |operand| match operand {
            Operand::Aggregate(slot) => values.get(slot).cloned().map(Operand::Value).ok_or_else(
                || {
                    ormdoc_proto::Error::Serialization(format!(
                        "no aggregate result for placeholder {}",
                        slot
                    ))
                },
            ),
            other => Ok(other),
        })?;
        Ok(filter)
    }
}

/// Translator from domain filters to store filters.
pub struct FilterTranslator<'a> {
    provider: &'a dyn ClassMetaProvider,
    keys: &'a dyn KeyProvider,
    config: &'a CompilerConfig,
    pending: Vec<PendingAggregate>,
    /// Translating the filter of an aggregate value: joins and aggregates are rejected.
    nested: bool,
}

impl<'a> FilterTranslator<'a> {
    /// Create a translator.
    pub fn new(
        provider: &'a dyn ClassMetaProvider,
        keys: &'a dyn KeyProvider,
        config: &'a CompilerConfig,
    ) -> Self {
        Self {
            provider,
            keys,
            config,
            pending: Vec::new(),
            nested: false,
        }
    }

    /// Translate a domain filter over `cm`.
    pub fn translate(mut self, cm: &ClassMeta, filter: &Value) -> Result<Translation, Error> {
        let filter = self.translate_filter(Some(cm), filter)?;
        debug!(
            class = %cm.canonical_name(),
            aggregates = self.pending.len(),
            "Translated domain filter"
        );
        Ok(Translation {
            filter,
            aggregates: self.pending,
        })
    }

    fn translate_filter(&mut self, cm: Option<&ClassMeta>, filter: &Value) -> Result<FilterNode, Error> {
        match filter {
            Value::Object(obj) => self.translate_object(cm, obj),
            Value::Null => Ok(FilterNode::Const(true)),
            other => Err(Error::malformed(
                "filter",
                format!("expected an object, got {}", other),
            )),
        }
    }

    fn translate_object(&mut self, cm: Option<&ClassMeta>, obj: &Map<String, Value>) -> Result<FilterNode, Error> {
        let children = obj
            .iter()
            .map(|(key, value)| self.translate_entry(cm, key, value))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(FilterNode::and(children))
    }

    fn translate_list(&mut self, cm: Option<&ClassMeta>, op: &str, value: &Value) -> Result<Vec<FilterNode>, Error> {
        let items = value
            .as_array()
            .ok_or_else(|| Error::malformed(op, "expected an array of filters"))?;
        items
            .iter()
            .map(|item| self.translate_filter(cm, item))
            .collect()
    }

    fn translate_entry(&mut self, cm: Option<&ClassMeta>, key: &str, value: &Value) -> Result<FilterNode, Error> {
        match key {
            "$and" => return Ok(FilterNode::And(self.translate_list(cm, key, value)?)),
            "$or" => return Ok(FilterNode::Or(self.translate_list(cm, key, value)?)),
            "$nor" => return Ok(FilterNode::Nor(self.translate_list(cm, key, value)?)),
            "$not" => {
                if !value.is_object() {
                    return Err(Error::malformed(key, "expected a filter"));
                }
                return Ok(FilterNode::Not(Box::new(self.translate_filter(cm, value)?)));
            }
            "$text" => return text_clause(value),
            "$joinExists" | "$joinNotExists" => {
                if self.nested {
                    return Err(Error::unsupported_join(
                        "aggregate filter",
                        key,
                        "aggregate filters cannot join",
                    ));
                }
                let join = self.explicit_join(value)?;
                return Ok(if key == "$joinExists" {
                    FilterNode::JoinExists(join)
                } else {
                    FilterNode::JoinNotExists(join)
                });
            }
            "$ItemId" => {
                let cm = cm.ok_or_else(|| Error::malformed(key, "needs a class"))?;
                return self.item_id(cm, value);
            }
            _ if key.starts_with('$') => {
                return Err(Error::malformed(key, "unknown operator"));
            }
            _ => {}
        }

        let Some(cm) = cm else {
            return self.field(None, None, None, key, value);
        };
        if key == ID_FIELD {
            return self.field(Some(cm), None, None, key, value);
        }

        if let Some(pm) = cm.property_meta(key) {
            return match pm.property_type {
                PropertyType::Collection => self.collection_condition(cm, pm, value),
                PropertyType::Reference => {
                    let target = self.ref_class(cm, pm)?;
                    self.field(Some(cm), Some(pm), Some(&target), key, value)
                }
                _ => self.field(Some(cm), Some(pm), None, key, value),
            };
        }

        match key.split_once('.') {
            Some((head, rest)) => self.linked(cm, key, head, rest, value),
            None => Err(Error::UnknownProperty {
                class: cm.canonical_name(),
                property: key.to_string(),
            }),
        }
    }

    fn ref_class(&self, cm: &ClassMeta, pm: &PropertyMeta) -> Result<Arc<ClassMeta>, Error> {
        self.provider.ref_class(cm, pm).ok_or_else(|| {
            Error::UnknownClass(pm.ref_class.clone().unwrap_or_else(|| pm.name.clone()))
        })
    }

    /// Join from `cm` over a relational property.
    fn join(&self, cm: &ClassMeta, pm: &PropertyMeta, target: &ClassMeta) -> JoinSpec {
        let table = target.table_name(&self.config.namespace_separator);
        let target_key = target.key_properties().first().cloned().unwrap_or_default();
        let join = match &pm.back_ref {
            Some(back_ref) => {
                let left = pm
                    .binding
                    .clone()
                    .or_else(|| cm.key_properties().first().cloned())
                    .unwrap_or_default();
                JoinSpec::new(table, left, back_ref.clone(), false)
            }
            None => JoinSpec::new(
                table,
                pm.name.clone(),
                target_key,
                pm.property_type == PropertyType::Collection,
            ),
        };
        join.with_alias(pm.name.clone())
    }

    fn check_joinable(&self, cm: &ClassMeta, pm: &PropertyMeta, target: &ClassMeta) -> Result<(), Error> {
        if self.nested {
            return Err(Error::unsupported_join(
                cm.canonical_name(),
                &pm.name,
                "aggregate filters cannot join",
            ));
        }
        if pm.back_ref.is_none() && target.key_properties().len() > 1 {
            return Err(Error::unsupported_join(
                cm.canonical_name(),
                &pm.name,
                "relations to classes with a composite key cannot be joined",
            ));
        }
        Ok(())
    }

    fn collection_condition(&mut self, cm: &ClassMeta, pm: &PropertyMeta, value: &Value) -> Result<FilterNode, Error> {
        let obj = value.as_object().ok_or_else(|| {
            Error::malformed(&pm.name, "collection conditions take $contains or $empty")
        })?;
        let target = self.ref_class(cm, pm)?;
        self.check_joinable(cm, pm, &target)?;

        let mut parts = Vec::with_capacity(obj.len());
        for (op, arg) in obj {
            let node = match op.as_str() {
                "$contains" => {
                    let sub = self.translate_filter(Some(&target), arg)?;
                    FilterNode::JoinExists(self.join(cm, pm, &target).with_filter(sub))
                }
                "$empty" => self.empty_marker(cm, pm, &target, flag(op, arg)?, false),
                "$not" => match arg.as_object().and_then(|o| o.get("$empty")) {
                    Some(empty) if arg.as_object().is_some_and(|o| o.len() == 1) => {
                        self.empty_marker(cm, pm, &target, flag("$empty", empty)?, true)
                    }
                    _ => {
                        return Err(Error::malformed(
                            "$not",
                            "only $empty can be negated on a collection",
                        ))
                    }
                },
                other => {
                    return Err(Error::malformed(
                        other,
                        format!("not applicable to collection {}", pm.name),
                    ))
                }
            };
            parts.push(node);
        }
        Ok(FilterNode::and(parts))
    }

    fn empty_marker(&self, cm: &ClassMeta, pm: &PropertyMeta, target: &ClassMeta, empty: bool, negated: bool) -> FilterNode {
        let join = self.join(cm, pm, target);
        if empty != negated {
            FilterNode::JoinNotExists(join)
        } else {
            FilterNode::JoinExists(join)
        }
    }

    /// Dotted path starting at property `head`.
    fn linked(&mut self, cm: &ClassMeta, path: &str, head: &str, rest: &str, value: &Value) -> Result<FilterNode, Error> {
        let pm = cm.property_meta(head).ok_or_else(|| Error::UnknownProperty {
            class: cm.canonical_name(),
            property: head.to_string(),
        })?;
        match pm.property_type {
            PropertyType::Reference => {
                let target = self.ref_class(cm, pm)?;
                self.check_joinable(cm, pm, &target)?;
                let sub = self.translate_entry(Some(&target), rest, value)?;
                Ok(FilterNode::JoinExists(
                    self.join(cm, pm, &target).with_filter(sub),
                ))
            }
            PropertyType::Collection => Err(Error::unsupported_join(
                cm.canonical_name(),
                head,
                "use $contains to filter a collection",
            )),
            _ => self.field(Some(cm), None, None, path, value),
        }
    }

    fn item_id(&mut self, cm: &ClassMeta, value: &Value) -> Result<FilterNode, Error> {
        match value {
            Value::String(id) => {
                let data = self.keys.key_to_data(cm, id)?;
                let parts = data
                    .iter()
                    .map(|(key, v)| self.translate_entry(Some(cm), key, v))
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(FilterNode::and(parts))
            }
            other => {
                let key = cm
                    .key_properties()
                    .first()
                    .ok_or_else(|| Error::malformed("$ItemId", "class has no key"))?
                    .clone();
                self.translate_entry(Some(cm), &key, other)
            }
        }
    }

    fn explicit_join(&mut self, value: &Value) -> Result<JoinSpec, Error> {
        let obj = value
            .as_object()
            .ok_or_else(|| Error::malformed("$joinExists", "expected a join description"))?;
        let text = |name: &str| {
            obj.get(name)
                .and_then(Value::as_str)
                .map(str::to_string)
                .ok_or_else(|| Error::malformed("$joinExists", format!("missing {}", name)))
        };
        let mut join = JoinSpec::new(
            text("table")?,
            text("left")?,
            text("right")?,
            obj.get("many").and_then(Value::as_bool).unwrap_or(false),
        );
        if let Some(alias) = obj.get("alias").and_then(Value::as_str) {
            join = join.with_alias(alias);
        }
        if let Some(filter) = obj.get("filter") {
            let filter = self.translate_filter(None, filter)?;
            join = join.with_filter(filter);
        }
        if let Some(nested) = obj.get("join") {
            let nested = nested
                .as_array()
                .ok_or_else(|| Error::malformed("$joinExists", "join must be an array"))?;
            for item in nested {
                join = join.with_join(self.explicit_join(item)?);
            }
        }
        Ok(join)
    }

    fn field(
        &mut self,
        cm: Option<&ClassMeta>,
        pm: Option<&PropertyMeta>,
        target: Option<&ClassMeta>,
        path: &str,
        value: &Value,
    ) -> Result<FilterNode, Error> {
        let ops = self.ops(cm, pm, target, path, value)?;
        Ok(FilterNode::Field {
            path: path.to_string(),
            ops,
        })
    }

    fn ops(
        &mut self,
        cm: Option<&ClassMeta>,
        pm: Option<&PropertyMeta>,
        target: Option<&ClassMeta>,
        path: &str,
        value: &Value,
    ) -> Result<Vec<FieldOp>, Error> {
        let obj = match value {
            Value::Object(obj) if is_operator_doc(obj) => obj,
            _ => {
                let operand = self.operand(cm, pm, target, value)?;
                return Ok(vec![FieldOp::Compare(CompareOp::Eq, operand)]);
            }
        };

        let mut ops = Vec::with_capacity(obj.len());
        for (op, arg) in obj {
            let field_op = match op.as_str() {
                "$options" => continue,
                "$regex" => FieldOp::Regex {
                    pattern: arg
                        .as_str()
                        .ok_or_else(|| Error::malformed(op, "pattern must be a string"))?
                        .to_string(),
                    options: obj.get("$options").and_then(Value::as_str).map(str::to_string),
                },
                "$in" | "$nin" => {
                    let items = arg
                        .as_array()
                        .ok_or_else(|| Error::malformed(op, "expected an array"))?
                        .iter()
                        .map(|item| cast(pm, target, item))
                        .collect::<Result<Vec<_>, _>>()?;
                    if op == "$in" {
                        FieldOp::In(items)
                    } else {
                        FieldOp::Nin(items)
                    }
                }
                "$exists" => FieldOp::Exists(flag(op, arg)?),
                "$empty" => {
                    let blank = vec![Value::String(String::new()), Value::Null];
                    if flag(op, arg)? {
                        FieldOp::In(blank)
                    } else {
                        FieldOp::Nin(blank)
                    }
                }
                "$not" => {
                    if !arg.is_object() {
                        return Err(Error::malformed(op, "expected operator document"));
                    }
                    FieldOp::Not(self.ops(cm, pm, target, path, arg)?)
                }
                "$geoWithin" => FieldOp::GeoWithin(arg.clone()),
                "$geoIntersects" => FieldOp::GeoIntersects(arg.clone()),
                "$contains" => {
                    return Err(Error::malformed(
                        op,
                        format!("{} is not a collection", path),
                    ))
                }
                other => match CompareOp::from_operator(other) {
                    Some(cmp) => FieldOp::Compare(cmp, self.operand(cm, pm, target, arg)?),
                    None => return Err(Error::malformed(other, "unknown operator")),
                },
            };
            ops.push(field_op);
        }
        Ok(ops)
    }

    fn operand(
        &mut self,
        cm: Option<&ClassMeta>,
        pm: Option<&PropertyMeta>,
        target: Option<&ClassMeta>,
        value: &Value,
    ) -> Result<Operand, Error> {
        if is_date_operand(value) {
            let expr = date_operand(value)?;
            return Ok(match expr.fold() {
                Some(dt) => Operand::Value(date_value(dt)),
                None => Operand::Date(expr),
            });
        }
        if let Some((function, options)) = aggregate_value(value) {
            return self.aggregate_operand(cm, function, options);
        }
        Ok(Operand::Value(cast(pm, target, value)?))
    }

    fn aggregate_operand(&mut self, cm: Option<&ClassMeta>, function: AggregateFunction, options: &Value) -> Result<Operand, Error> {
        let op = function.as_operator();
        if self.nested {
            return Err(Error::malformed(op, "aggregate values cannot be nested"));
        }
        let opts = options
            .as_object()
            .ok_or_else(|| Error::malformed(op, "expected aggregate options"))?;

        let target = if let Some(class_name) = opts.get("className").and_then(Value::as_str) {
            self.provider
                .class_meta(class_name)
                .ok_or_else(|| Error::UnknownClass(class_name.to_string()))?
        } else if let Some(collection) = opts.get("collectionName").and_then(Value::as_str) {
            let cm = cm.ok_or_else(|| Error::malformed(op, "collectionName needs a class"))?;
            let pm = cm.property_meta(collection).ok_or_else(|| Error::UnknownProperty {
                class: cm.canonical_name(),
                property: collection.to_string(),
            })?;
            self.ref_class(cm, pm)?
        } else {
            return Err(Error::malformed(op, "className or collectionName is required"));
        };

        let property = opts.get("property").and_then(Value::as_str).map(str::to_string);
        match &property {
            Some(p) if target.property_meta(p).is_none() && p != ID_FIELD => {
                return Err(Error::UnknownProperty {
                    class: target.canonical_name(),
                    property: p.clone(),
                })
            }
            None if function != AggregateFunction::Count => {
                return Err(Error::malformed(op, "property is required"));
            }
            _ => {}
        }

        let filter = match opts.get("filter") {
            Some(filter) if !filter.is_null() => {
                let mut nested = FilterTranslator {
                    provider: self.provider,
                    keys: self.keys,
                    config: self.config,
                    pending: Vec::new(),
                    nested: true,
                };
                let node = nested.translate_filter(Some(&target), filter)?;
                render_query(&normalize(node)?)?
            }
            _ => Default::default(),
        };

        let request = AggregateRequest::new()
            .with_filter(filter)
            .with_aggregation(AGGREGATE_RESULT_KEY, Aggregation::new(function, property));
        let slot = self.pending.len();
        self.pending.push(PendingAggregate {
            table: target.table_name(&self.config.namespace_separator),
            request,
        });
        Ok(Operand::Aggregate(slot))
    }
}

fn cast(pm: Option<&PropertyMeta>, target: Option<&ClassMeta>, value: &Value) -> Result<Value, Error> {
    match pm {
        Some(pm) => cast_value(pm, value, target),
        None => Ok(value.clone()),
    }
}

fn flag(op: &str, value: &Value) -> Result<bool, Error> {
    match value {
        Value::Bool(b) => Ok(*b),
        Value::Number(n) => Ok(n.as_f64().is_some_and(|f| f != 0.0)),
        _ => Err(Error::malformed(op, "expected a boolean")),
    }
}

/// `{"$min": {...}}` and friends used as a value.
fn aggregate_value(value: &Value) -> Option<(AggregateFunction, &Value)> {
    let obj = value.as_object()?;
    if obj.len() != 1 {
        return None;
    }
    let (key, options) = obj.iter().next()?;
    if !key.starts_with('$') {
        return None;
    }
    AggregateFunction::from_key(key).map(|f| (f, options))
}

fn is_operator_doc(obj: &Map<String, Value>) -> bool {
    let value = Value::Object(obj.clone());
    !obj.is_empty()
        && obj.keys().all(|k| k.starts_with('$'))
        && !is_date_operand(&value)
        && aggregate_value(&value).is_none()
}

fn text_clause(value: &Value) -> Result<FilterNode, Error> {
    match value {
        Value::String(search) => Ok(FilterNode::Text {
            search: search.clone(),
            language: None,
        }),
        Value::Object(obj) => {
            let search = obj
                .get("$search")
                .and_then(Value::as_str)
                .ok_or_else(|| Error::malformed("$text", "missing $search"))?;
            Ok(FilterNode::Text {
                search: search.to_string(),
                language: obj.get("$language").and_then(Value::as_str).map(str::to_string),
            })
        }
        _ => Err(Error::malformed("$text", "expected $search")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::Catalog;
    use crate::query::keys::SeparatorKeyProvider;
    use crate::test_support::shop_catalog;
    use ormdoc_proto::filter::DateExpr;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn translate(catalog: &Catalog, class: &str, filter: Value) -> Result<Translation, Error> {
        let config = CompilerConfig::default();
        let keys = SeparatorKeyProvider::new("@");
        let cm = catalog.class_meta(class).unwrap();
        FilterTranslator::new(catalog, &keys, &config).translate(&cm, &filter)
    }

    #[test]
    fn test_scalar_cast() {
        let catalog = shop_catalog();
        let t = translate(&catalog, "Order", json!({"number": "17"})).unwrap();
        assert_eq!(t.filter, FilterNode::eq("number", 17));
    }

    #[test]
    fn test_multiple_keys_are_anded() {
        let catalog = shop_catalog();
        let t = translate(&catalog, "Order", json!({"status": "open", "number": {"$gt": 3}})).unwrap();
        match t.filter {
            FilterNode::And(children) => assert_eq!(children.len(), 2),
            other => panic!("expected conjunction, got {:?}", other),
        }
    }

    #[test]
    fn test_unknown_property() {
        let catalog = shop_catalog();
        let err = translate(&catalog, "Order", json!({"colour": "red"})).unwrap_err();
        assert!(matches!(err, Error::UnknownProperty { .. }));
    }

    #[test]
    fn test_unknown_operator() {
        let catalog = shop_catalog();
        let err = translate(&catalog, "Order", json!({"number": {"$between": [1, 2]}})).unwrap_err();
        assert!(matches!(err, Error::MalformedFilter { .. }));
    }

    #[test]
    fn test_contains_becomes_join() {
        let catalog = shop_catalog();
        let t = translate(&catalog, "Order", json!({"items": {"$contains": {"qty": {"$gt": "5"}}}})).unwrap();
        let expected = JoinSpec::new("shop_OrderLine", "number", "order", false)
            .with_alias("items")
            .with_filter(FilterNode::field(
                "qty",
                FieldOp::Compare(CompareOp::Gt, Operand::Value(json!(5))),
            ));
        assert_eq!(t.filter, FilterNode::JoinExists(expected));
    }

    #[test]
    fn test_empty_and_negated_empty() {
        let catalog = shop_catalog();
        let t = translate(&catalog, "Order", json!({"items": {"$empty": true}})).unwrap();
        assert!(matches!(t.filter, FilterNode::JoinNotExists(_)));

        let t = translate(&catalog, "Order", json!({"items": {"$not": {"$empty": true}}})).unwrap();
        assert!(matches!(t.filter, FilterNode::JoinExists(_)));
    }

    #[test]
    fn test_stored_collection_is_many() {
        let catalog = shop_catalog();
        let t = translate(&catalog, "Order", json!({"tags": {"$empty": false}})).unwrap();
        match t.filter {
            FilterNode::JoinExists(join) => {
                assert!(join.many);
                assert_eq!(join.left, "tags");
                assert_eq!(join.right, "code");
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_dotted_reference_path() {
        let catalog = shop_catalog();
        let t = translate(&catalog, "OrderLine", json!({"order.customer.name": "Acme"})).unwrap();
        let FilterNode::JoinExists(order) = t.filter else {
            panic!("expected join");
        };
        assert_eq!(order.table, "shop_Order");
        assert_eq!(order.left, "order");
        assert_eq!(order.right, "number");
        let Some(filter) = order.filter else {
            panic!("expected nested filter");
        };
        let FilterNode::JoinExists(customer) = *filter else {
            panic!("expected nested join");
        };
        assert_eq!(customer.table, "shop_Customer");
        assert_eq!(customer.filter.as_deref(), Some(&FilterNode::eq("name", "Acme")));
    }

    #[test]
    fn test_dotted_scalar_passes_through() {
        let catalog = shop_catalog();
        let t = translate(&catalog, "Customer", json!({"location.type": "Point"})).unwrap();
        assert_eq!(t.filter, FilterNode::eq("location.type", "Point"));
    }

    #[test]
    fn test_dotted_collection_rejected() {
        let catalog = shop_catalog();
        let err = translate(&catalog, "Order", json!({"items.qty": 1})).unwrap_err();
        assert!(matches!(err, Error::UnsupportedJoin { .. }));
    }

    #[test]
    fn test_composite_key_collection_rejected() {
        let catalog = shop_catalog();
        let err = translate(&catalog, "Customer", json!({"slots": {"$empty": false}})).unwrap_err();
        assert!(matches!(err, Error::UnsupportedJoin { .. }));
    }

    #[test]
    fn test_scalar_empty() {
        let catalog = shop_catalog();
        let t = translate(&catalog, "Order", json!({"status": {"$empty": true}})).unwrap();
        assert_eq!(
            t.filter,
            FilterNode::field("status", FieldOp::In(vec![json!(""), Value::Null]))
        );
    }

    #[test]
    fn test_item_id() {
        let catalog = shop_catalog();
        let t = translate(&catalog, "Order", json!({"$ItemId": "42"})).unwrap();
        assert_eq!(t.filter, FilterNode::eq("number", 42));
    }

    #[test]
    fn test_date_operands() {
        let catalog = shop_catalog();
        let t = translate(&catalog, "Order", json!({"date": {"$lt": {"$date": "$$NOW"}}})).unwrap();
        assert_eq!(
            t.filter,
            FilterNode::field(
                "date",
                FieldOp::Compare(
                    CompareOp::Lt,
                    Operand::Date(DateExpr::Truncate(Box::new(DateExpr::Now)))
                )
            )
        );

        let t = translate(&catalog, "Order", json!({"date": {"$date": "2024-03-01"}})).unwrap();
        assert_eq!(t.filter, FilterNode::eq("date", json!({"$date": "2024-03-01T00:00:00.000Z"})));
    }

    #[test]
    fn test_aggregate_placeholder() {
        let catalog = shop_catalog();
        let t = translate(
            &catalog,
            "Order",
            json!({"amount": {"$gte": {"$avg": {
                "className": "Order",
                "property": "amount",
                "filter": {"status": "open"}
            }}}}),
        )
        .unwrap();
        assert!(!t.is_complete());
        assert_eq!(t.aggregates[0].table, "shop_Order");
        assert_eq!(
            Value::Object(t.aggregates[0].request.filter.clone().unwrap()),
            json!({"status": "open"})
        );
        assert_eq!(
            t.filter,
            FilterNode::field("amount", FieldOp::Compare(CompareOp::Gte, Operand::Aggregate(0)))
        );
    }

    #[test]
    fn test_aggregate_filter_cannot_join() {
        let catalog = shop_catalog();
        let err = translate(
            &catalog,
            "Order",
            json!({"amount": {"$max": {
                "className": "Order",
                "property": "amount",
                "filter": {"items": {"$empty": false}}
            }}}),
        )
        .unwrap_err();
        assert!(matches!(err, Error::UnsupportedJoin { .. }));
    }

    #[test]
    fn test_explicit_join_is_untyped() {
        let catalog = shop_catalog();
        let t = translate(
            &catalog,
            "Order",
            json!({"$joinExists": {
                "table": "audit", "left": "_id", "right": "target", "many": false,
                "filter": {"kind": "check"}
            }}),
        )
        .unwrap();
        let FilterNode::JoinExists(join) = t.filter else {
            panic!("expected join");
        };
        assert_eq!(join.filter.as_deref(), Some(&FilterNode::eq("kind", "check")));
    }
}
