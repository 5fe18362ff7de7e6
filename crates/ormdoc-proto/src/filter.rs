//! Store filter tree.
//!
//! A [`FilterNode`] is what the domain filter becomes after translation: class
//! property names are resolved, values are cast, and relation tests are turned
//! into join markers. Each node can be rendered either as a query-language
//! document (for `$match`) or as an aggregation-expression predicate (for
//! `$redact` and `$filter`).

use chrono::{DateTime, Months, TimeDelta, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::error::Error;
use crate::join::JoinSpec;
use crate::value::{date_value, Document};

/// Resolves a field path to an expression reference such as `"$a.b"` or `"$$row.b"`.
pub type FieldRef<'a> = &'a dyn Fn(&str) -> String;

/// Comparison operators.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CompareOp {
    Eq,
    Ne,
    Lt,
    Lte,
    Gt,
    Gte,
}

impl CompareOp {
    /// Parse a `$`-prefixed operator name.
    pub fn from_operator(op: &str) -> Option<Self> {
        match op {
            "$eq" => Some(CompareOp::Eq),
            "$ne" => Some(CompareOp::Ne),
            "$lt" => Some(CompareOp::Lt),
            "$lte" => Some(CompareOp::Lte),
            "$gt" => Some(CompareOp::Gt),
            "$gte" => Some(CompareOp::Gte),
            _ => None,
        }
    }

    /// Operator name in both the query and the expression language.
    pub fn as_str(&self) -> &'static str {
        match self {
            CompareOp::Eq => "$eq",
            CompareOp::Ne => "$ne",
            CompareOp::Lt => "$lt",
            CompareOp::Lte => "$lte",
            CompareOp::Gt => "$gt",
            CompareOp::Gte => "$gte",
        }
    }
}

/// Calendar units accepted by `$dateAdd`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DateUnit {
    Millisecond,
    Second,
    Minute,
    Hour,
    Day,
    Week,
    Month,
    Year,
}

impl DateUnit {
    /// Parse a unit name or its short form.
    pub fn parse(unit: &str) -> Option<Self> {
        match unit {
            "ms" | "millisecond" | "milliseconds" => Some(DateUnit::Millisecond),
            "s" | "second" | "seconds" => Some(DateUnit::Second),
            "min" | "minute" | "minutes" => Some(DateUnit::Minute),
            "h" | "hour" | "hours" => Some(DateUnit::Hour),
            "d" | "day" | "days" => Some(DateUnit::Day),
            "w" | "week" | "weeks" => Some(DateUnit::Week),
            "month" | "months" => Some(DateUnit::Month),
            "y" | "year" | "years" => Some(DateUnit::Year),
            _ => None,
        }
    }

    /// Unit name in the store's expression language.
    pub fn as_str(&self) -> &'static str {
        match self {
            DateUnit::Millisecond => "millisecond",
            DateUnit::Second => "second",
            DateUnit::Minute => "minute",
            DateUnit::Hour => "hour",
            DateUnit::Day => "day",
            DateUnit::Week => "week",
            DateUnit::Month => "month",
            DateUnit::Year => "year",
        }
    }

    /// Shift a timestamp by `amount` units.
    pub fn add(&self, dt: DateTime<Utc>, amount: i64) -> Option<DateTime<Utc>> {
        let delta = match self {
            DateUnit::Millisecond => TimeDelta::try_milliseconds(amount),
            DateUnit::Second => TimeDelta::try_seconds(amount),
            DateUnit::Minute => TimeDelta::try_minutes(amount),
            DateUnit::Hour => TimeDelta::try_hours(amount),
            DateUnit::Day => TimeDelta::try_days(amount),
            DateUnit::Week => TimeDelta::try_weeks(amount),
            DateUnit::Month => return add_months(dt, amount),
            DateUnit::Year => return add_months(dt, amount.checked_mul(12)?),
        };
        dt.checked_add_signed(delta?)
    }
}

fn add_months(dt: DateTime<Utc>, amount: i64) -> Option<DateTime<Utc>> {
    let months = Months::new(u32::try_from(amount.unsigned_abs()).ok()?);
    if amount >= 0 {
        dt.checked_add_months(months)
    } else {
        dt.checked_sub_months(months)
    }
}

/// Truncate a timestamp to the start of its day.
pub fn truncate_day(dt: DateTime<Utc>) -> Option<DateTime<Utc>> {
    dt.date_naive().and_hms_opt(0, 0, 0).map(|n| n.and_utc())
}

/// Computed date operand (`$date` / `$dateAdd`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum DateExpr {
    /// A fixed timestamp.
    Literal(DateTime<Utc>),
    /// Value of a document field.
    Field(String),
    /// Evaluation time.
    Now,
    /// Start of the day of the inner value.
    Truncate(Box<DateExpr>),
    /// Inner value shifted by an interval.
    Add {
        base: Box<DateExpr>,
        amount: i64,
        unit: DateUnit,
    },
}

impl DateExpr {
    /// Evaluate at translation time when no field or clock is involved.
    pub fn fold(&self) -> Option<DateTime<Utc>> {
        match self {
            DateExpr::Literal(dt) => Some(*dt),
            DateExpr::Field(_) | DateExpr::Now => None,
            DateExpr::Truncate(inner) => inner.fold().and_then(truncate_day),
            DateExpr::Add { base, amount, unit } => {
                base.fold().and_then(|dt| unit.add(dt, *amount))
            }
        }
    }

    /// Render in the store's expression language.
    pub fn to_expr(&self, reference: FieldRef<'_>) -> Value {
        match self {
            DateExpr::Literal(dt) => date_value(*dt),
            DateExpr::Field(path) => Value::String(reference(path)),
            DateExpr::Now => Value::String("$$NOW".into()),
            DateExpr::Truncate(inner) => json!({
                "$dateTrunc": {"date": inner.to_expr(reference), "unit": "day"}
            }),
            DateExpr::Add { base, amount, unit } => json!({
                "$dateAdd": {
                    "startDate": base.to_expr(reference),
                    "unit": unit.as_str(),
                    "amount": amount,
                }
            }),
        }
    }
}

/// Right-hand side of a comparison.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Operand {
    /// A plain (already cast) value.
    Value(Value),
    /// A computed date expression that could not be folded.
    Date(DateExpr),
    /// Placeholder for a pending aggregate side-channel result.
    Aggregate(usize),
}

impl Operand {
    fn resolved(&self) -> Result<Option<&Value>, Error> {
        match self {
            Operand::Value(v) => Ok(Some(v)),
            Operand::Date(_) => Ok(None),
            Operand::Aggregate(slot) => Err(Error::Serialization(format!(
                "aggregate placeholder {} was never resolved",
                slot
            ))),
        }
    }
}

/// A single test applied to a field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum FieldOp {
    Compare(CompareOp, Operand),
    In(Vec<Value>),
    Nin(Vec<Value>),
    Exists(bool),
    Regex {
        pattern: String,
        options: Option<String>,
    },
    GeoWithin(Value),
    GeoIntersects(Value),
    Not(Vec<FieldOp>),
}

impl FieldOp {
    /// Check whether this op has a computed (non-literal) operand.
    pub fn is_computed(&self) -> bool {
        match self {
            FieldOp::Compare(_, Operand::Date(_)) => true,
            FieldOp::Not(ops) => ops.iter().any(FieldOp::is_computed),
            _ => false,
        }
    }

    /// Check whether this op is a geo operator.
    pub fn is_geo(&self) -> bool {
        match self {
            FieldOp::GeoWithin(_) | FieldOp::GeoIntersects(_) => true,
            FieldOp::Not(ops) => ops.iter().any(FieldOp::is_geo),
            _ => false,
        }
    }

    /// Map every operand through `f`, building a new op.
    pub fn map_operands<F>(self, f: &mut F) -> Result<FieldOp, Error>
    where
        F: FnMut(Operand) -> Result<Operand, Error>,
    {
        Ok(match self {
            FieldOp::Compare(op, operand) => FieldOp::Compare(op, f(operand)?),
            FieldOp::Not(ops) => FieldOp::Not(
                ops.into_iter()
                    .map(|op| op.map_operands(f))
                    .collect::<Result<_, _>>()?,
            ),
            other => other,
        })
    }

    fn query_entries(&self, out: &mut Document) -> Result<(), Error> {
        match self {
            FieldOp::Compare(op, operand) => {
                if let Some(v) = operand.resolved()? {
                    out.insert(op.as_str().into(), v.clone());
                }
            }
            FieldOp::In(values) => {
                out.insert("$in".into(), Value::Array(values.clone()));
            }
            FieldOp::Nin(values) => {
                out.insert("$nin".into(), Value::Array(values.clone()));
            }
            FieldOp::Exists(flag) => {
                out.insert("$exists".into(), Value::Bool(*flag));
            }
            FieldOp::Regex { pattern, options } => {
                out.insert("$regex".into(), Value::String(pattern.clone()));
                if let Some(options) = options {
                    out.insert("$options".into(), Value::String(options.clone()));
                }
            }
            FieldOp::GeoWithin(shape) => {
                out.insert("$geoWithin".into(), shape.clone());
            }
            FieldOp::GeoIntersects(shape) => {
                out.insert("$geoIntersects".into(), shape.clone());
            }
            FieldOp::Not(ops) => {
                let mut groups = operator_groups(ops.iter())?;
                if groups.len() != 1 {
                    return Err(Error::Serialization(
                        "$not holds conflicting operators".to_string(),
                    ));
                }
                out.insert("$not".into(), Value::Object(groups.remove(0)));
            }
        }
        Ok(())
    }

    fn to_expr(&self, field: &Value, reference: FieldRef<'_>) -> Result<Option<Value>, Error> {
        let nullable = json!({"$ifNull": [field, null]});
        Ok(Some(match self {
            FieldOp::Compare(op, Operand::Date(expr)) => {
                let compare = json!({ op.as_str(): [field, expr.to_expr(reference)] });
                match op {
                    CompareOp::Lt | CompareOp::Lte => json!({"$and": [{"$gt": [field, null]}, compare]}),
                    _ => compare,
                }
            }
            FieldOp::Compare(op, operand) => {
                let v = operand.resolved()?.cloned().unwrap_or(Value::Null);
                match op {
                    CompareOp::Eq | CompareOp::Ne if v.is_null() => {
                        json!({ op.as_str(): [nullable, null] })
                    }
                    // Missing and null sort below every value; a query-language
                    // range test never matches them.
                    CompareOp::Lt | CompareOp::Lte => json!({"$and": [
                        {"$gt": [field, null]},
                        { op.as_str(): [field, v] }
                    ]}),
                    _ => json!({ op.as_str(): [field, v] }),
                }
            }
            FieldOp::In(values) => json!({"$in": [nullable, values]}),
            FieldOp::Nin(values) => json!({"$not": [{"$in": [nullable, values]}]}),
            FieldOp::Exists(flag) => {
                let op = if *flag { "$ne" } else { "$eq" };
                json!({ op: [{"$type": field}, "missing"] })
            }
            FieldOp::Regex { pattern, options } => json!({"$and": [
                {"$gt": [field, null]},
                {"$regexMatch": {
                    "input": {"$toString": field},
                    "regex": pattern,
                    "options": options.clone().unwrap_or_default(),
                }}
            ]}),
            FieldOp::GeoWithin(_) | FieldOp::GeoIntersects(_) => return Ok(None),
            FieldOp::Not(ops) => match ops_expr(field, ops, reference)? {
                Some(inner) => json!({"$not": [inner]}),
                None => return Ok(None),
            },
        }))
    }
}

fn ops_expr(field: &Value, ops: &[FieldOp], reference: FieldRef<'_>) -> Result<Option<Value>, Error> {
    let mut parts = Vec::with_capacity(ops.len());
    for op in ops {
        match op.to_expr(field, reference)? {
            Some(e) => parts.push(e),
            None => return Ok(None),
        }
    }
    Ok(Some(match parts.len() {
        1 => parts.remove(0),
        _ => json!({ "$and": parts }),
    }))
}

/// A node of the store filter tree.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum FilterNode {
    /// All children hold; an empty list is always true.
    And(Vec<FilterNode>),
    /// At least one child holds.
    Or(Vec<FilterNode>),
    /// No child holds.
    Nor(Vec<FilterNode>),
    /// The child does not hold.
    Not(Box<FilterNode>),
    /// Tests on one attribute path.
    Field { path: String, ops: Vec<FieldOp> },
    /// A related document satisfying the join's filter exists.
    JoinExists(JoinSpec),
    /// No related document satisfying the join's filter exists.
    JoinNotExists(JoinSpec),
    /// Whole-document full-text search.
    Text {
        search: String,
        language: Option<String>,
    },
    /// Constant truth value.
    Const(bool),
}

impl FilterNode {
    /// Single-op field test.
    pub fn field(path: impl Into<String>, op: FieldOp) -> Self {
        FilterNode::Field {
            path: path.into(),
            ops: vec![op],
        }
    }

    /// Field equality against a plain value.
    pub fn eq(path: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::field(path, FieldOp::Compare(CompareOp::Eq, Operand::Value(value.into())))
    }

    /// Conjunction that collapses the trivial cases.
    pub fn and(mut children: Vec<FilterNode>) -> Self {
        if children.len() == 1 {
            children.remove(0)
        } else {
            FilterNode::And(children)
        }
    }

    /// Check for the always-true node.
    pub fn is_unconstrained(&self) -> bool {
        match self {
            FilterNode::Const(true) => true,
            FilterNode::And(children) => children.iter().all(FilterNode::is_unconstrained),
            _ => false,
        }
    }

    /// Check whether the tree contains a join marker.
    pub fn has_join(&self) -> bool {
        match self {
            FilterNode::JoinExists(_) | FilterNode::JoinNotExists(_) => true,
            FilterNode::And(children) | FilterNode::Or(children) | FilterNode::Nor(children) => {
                children.iter().any(FilterNode::has_join)
            }
            FilterNode::Not(inner) => inner.has_join(),
            _ => false,
        }
    }

    /// Rebuild the tree with every operand passed through `f`.
    pub fn map_operands<F>(self, f: &mut F) -> Result<FilterNode, Error>
    where
        F: FnMut(Operand) -> Result<Operand, Error>,
    {
        let map_all = |children: Vec<FilterNode>, f: &mut F| {
            children
                .into_iter()
                .map(|c| c.map_operands(f))
                .collect::<Result<Vec<_>, _>>()
        };
        Ok(match self {
            FilterNode::And(children) => FilterNode::And(map_all(children, f)?),
            FilterNode::Or(children) => FilterNode::Or(map_all(children, f)?),
            FilterNode::Nor(children) => FilterNode::Nor(map_all(children, f)?),
            FilterNode::Not(inner) => FilterNode::Not(Box::new(inner.map_operands(f)?)),
            FilterNode::Field { path, ops } => FilterNode::Field {
                path,
                ops: ops
                    .into_iter()
                    .map(|op| op.map_operands(f))
                    .collect::<Result<_, _>>()?,
            },
            FilterNode::JoinExists(join) => FilterNode::JoinExists(join.map_operands(f)?),
            FilterNode::JoinNotExists(join) => FilterNode::JoinNotExists(join.map_operands(f)?),
            other => other,
        })
    }
}

/// Render a field test as a query-language document.
///
/// `path` is the (already qualified) query path. Computed comparisons are
/// emitted under `$expr`.
pub fn field_query(path: &str, ops: &[FieldOp], reference: FieldRef<'_>) -> Result<Document, Error> {
    let (computed, plain): (Vec<&FieldOp>, Vec<&FieldOp>) =
        ops.iter().partition(|op| op.is_computed());

    let mut negated = Vec::new();
    let mut simple = Vec::with_capacity(plain.len());
    for op in plain {
        if let FieldOp::Not(inner) = op {
            let groups = operator_groups(inner.iter())?;
            if groups.len() > 1 {
                negated.push(json!({"$nor": [{"$and": path_conditions(path, groups)}]}));
                continue;
            }
        }
        simple.push(op);
    }

    let mut conditions = match simple.as_slice() {
        [FieldOp::Compare(CompareOp::Eq, Operand::Value(v))] if !v.is_object() && !v.is_array() => {
            vec![json!({ path: v })]
        }
        _ => path_conditions(path, operator_groups(simple.iter().copied())?),
    };
    conditions.extend(negated);

    let mut out = Document::new();
    match conditions.len() {
        0 => {}
        1 => {
            if let Some(Value::Object(doc)) = conditions.pop() {
                out = doc;
            }
        }
        _ => {
            out.insert("$and".into(), Value::Array(conditions));
        }
    }

    if !computed.is_empty() {
        let field = Value::String(format!("${}", path));
        let mut exprs = Vec::with_capacity(computed.len());
        for op in computed {
            if let Some(e) = op.to_expr(&field, reference)? {
                exprs.push(e);
            }
        }
        let expr = match exprs.len() {
            1 => exprs.remove(0),
            _ => json!({ "$and": exprs }),
        };
        out.insert("$expr".into(), expr);
    }
    Ok(out)
}

/// Operator documents for a conjunction of ops.
///
/// An op whose operator keys are already taken goes to the next document
/// without them, so no op overwrites another.
fn operator_groups<'o>(ops: impl Iterator<Item = &'o FieldOp>) -> Result<Vec<Document>, Error> {
    let mut groups: Vec<Document> = Vec::new();
    for op in ops {
        let mut entries = Document::new();
        op.query_entries(&mut entries)?;
        match groups
            .iter_mut()
            .find(|g| !entries.keys().any(|k| g.contains_key(k)))
        {
            Some(group) => group.extend(entries),
            None => groups.push(entries),
        }
    }
    Ok(groups)
}

fn path_conditions(path: &str, groups: Vec<Document>) -> Vec<Value> {
    groups
        .into_iter()
        .map(|group| json!({ path: group }))
        .collect()
}

/// Render a field test as an aggregation-expression predicate.
///
/// Returns `None` when an op has no expression form (geo operators).
pub fn field_expr(field: &Value, ops: &[FieldOp], reference: FieldRef<'_>) -> Result<Option<Value>, Error> {
    if ops.is_empty() {
        return Ok(Some(Value::Bool(true)));
    }
    ops_expr(field, ops, reference)
}

/// Render a full-text clause.
pub fn text_query(search: &str, language: Option<&str>) -> Document {
    let mut text = Document::new();
    text.insert("$search".into(), Value::String(search.to_string()));
    if let Some(language) = language {
        text.insert("$language".into(), Value::String(language.to_string()));
    }
    let mut out = Document::new();
    out.insert("$text".into(), Value::Object(text));
    out
}
