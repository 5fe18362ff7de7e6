//! In-memory evaluation of query documents and aggregation expressions.
//!
//! Follows the document store's semantics where the compiler depends on
//! them: query paths fan out over arrays, `null` matches missing fields,
//! range operators only compare values of the same type, and in
//! expressions a missing field sorts below `null`.

use std::cmp::Ordering;
use std::collections::HashMap;

use chrono::{DateTime, Utc};
use ormdoc_proto::filter::truncate_day;
use ormdoc_proto::value::{as_date, compare_values, date_value, is_date, type_rank, values_equal};
use ormdoc_proto::{DateUnit, Document};
use regex::RegexBuilder;
use serde_json::{Map, Value};

/// Result of an evaluation step; `None` is a missing value.
type Eval = Result<Option<Value>, String>;

/// Check whether a document satisfies a query document.
pub fn matches(doc: &Document, query: &Document) -> Result<bool, String> {
    let root = Value::Object(doc.clone());
    matches_value(&root, query, Utc::now())
}

/// Evaluate an aggregation expression against a document.
pub fn evaluate(expr: &Value, doc: &Document) -> Result<Option<Value>, String> {
    let root = Value::Object(doc.clone());
    Context::new(&root, Utc::now()).eval(expr)
}

pub(crate) fn matches_value(root: &Value, query: &Document, now: DateTime<Utc>) -> Result<bool, String> {
    for (key, cond) in query {
        let ok = match key.as_str() {
            "$and" => {
                let mut all = true;
                for q in sub_queries(key, cond)? {
                    if !matches_value(root, q, now)? {
                        all = false;
                        break;
                    }
                }
                all
            }
            "$or" => {
                let mut any = false;
                for q in sub_queries(key, cond)? {
                    if matches_value(root, q, now)? {
                        any = true;
                        break;
                    }
                }
                any
            }
            "$nor" => {
                let mut none = true;
                for q in sub_queries(key, cond)? {
                    if matches_value(root, q, now)? {
                        none = false;
                        break;
                    }
                }
                none
            }
            "$expr" => truthy(&Context::new(root, now).eval(cond)?),
            "$text" => text_matches(root, cond)?,
            other if other.starts_with('$') => return Err(format!("unsupported query operator {}", other)),
            path => field_matches(&path_values(root, path), cond)?,
        };
        if !ok {
            return Ok(false);
        }
    }
    Ok(true)
}

fn sub_queries<'q>(op: &str, cond: &'q Value) -> Result<Vec<&'q Document>, String> {
    cond.as_array()
        .ok_or_else(|| format!("{} expects an array", op))?
        .iter()
        .map(|q| q.as_object().ok_or_else(|| format!("{} expects documents", op)))
        .collect()
}

/// Values reached by a dotted path, fanning out over arrays of documents.
pub(crate) fn path_values(root: &Value, path: &str) -> Vec<Value> {
    let segments: Vec<&str> = path.split('.').collect();
    let mut out = Vec::new();
    collect_path(root, &segments, &mut out);
    out
}

fn collect_path(value: &Value, segments: &[&str], out: &mut Vec<Value>) {
    let Some((head, rest)) = segments.split_first() else {
        out.push(value.clone());
        return;
    };
    match value {
        Value::Object(doc) => {
            if let Some(next) = doc.get(*head) {
                collect_path(next, rest, out);
            }
        }
        Value::Array(items) => {
            for item in items.iter().filter(|i| i.is_object()) {
                collect_path(item, segments, out);
            }
        }
        _ => {}
    }
}

/// Candidates plus the elements of array candidates.
fn expanded(candidates: &[Value]) -> Vec<&Value> {
    let mut out = Vec::with_capacity(candidates.len());
    for c in candidates {
        out.push(c);
        if let Value::Array(items) = c {
            out.extend(items.iter());
        }
    }
    out
}

fn is_operator_doc(value: &Value) -> bool {
    match value {
        Value::Object(doc) => !doc.is_empty() && doc.keys().all(|k| k.starts_with('$')) && !is_date(value),
        _ => false,
    }
}

fn field_matches(candidates: &[Value], cond: &Value) -> Result<bool, String> {
    if !is_operator_doc(cond) {
        return Ok(equals(candidates, cond));
    }
    let Value::Object(ops) = cond else {
        return Ok(false);
    };
    for (op, arg) in ops {
        let ok = match op.as_str() {
            "$eq" => equals(candidates, arg),
            "$ne" => !equals(candidates, arg),
            "$gt" | "$gte" | "$lt" | "$lte" => range(candidates, op, arg),
            "$in" => in_list(candidates, arg)?,
            "$nin" => !in_list(candidates, arg)?,
            "$exists" => !candidates.is_empty() == truthy(&Some(arg.clone())),
            "$regex" => {
                let pattern = arg.as_str().ok_or("$regex expects a string")?;
                let options = ops.get("$options").and_then(Value::as_str).unwrap_or("");
                let re = build_regex(pattern, options)?;
                expanded(candidates)
                    .into_iter()
                    .any(|c| c.as_str().is_some_and(|s| re.is_match(s)))
            }
            "$options" => true,
            "$not" => !field_matches(candidates, arg)?,
            "$size" => {
                let n = arg.as_u64().ok_or("$size expects a number")?;
                candidates
                    .iter()
                    .any(|c| c.as_array().is_some_and(|a| a.len() as u64 == n))
            }
            "$geoWithin" | "$geoIntersects" => {
                return Err(format!("{} is not supported in memory", op))
            }
            other => return Err(format!("unsupported query operator {}", other)),
        };
        if !ok {
            return Ok(false);
        }
    }
    Ok(true)
}

fn equals(candidates: &[Value], target: &Value) -> bool {
    if target.is_null() {
        return candidates.is_empty() || candidates.iter().any(Value::is_null);
    }
    expanded(candidates).into_iter().any(|c| values_equal(c, target))
}

fn range(candidates: &[Value], op: &str, target: &Value) -> bool {
    if target.is_null() {
        return matches!(op, "$gte" | "$lte") && equals(candidates, target);
    }
    expanded(candidates).into_iter().any(|c| {
        if type_rank(c) != type_rank(target) {
            return false;
        }
        let ord = compare_values(c, target);
        match op {
            "$gt" => ord == Ordering::Greater,
            "$gte" => ord != Ordering::Less,
            "$lt" => ord == Ordering::Less,
            _ => ord != Ordering::Greater,
        }
    })
}

fn in_list(candidates: &[Value], list: &Value) -> Result<bool, String> {
    let items = list.as_array().ok_or("$in expects an array")?;
    Ok(items.iter().any(|item| equals(candidates, item)))
}

fn text_matches(root: &Value, cond: &Value) -> Result<bool, String> {
    let search = cond
        .get("$search")
        .and_then(Value::as_str)
        .ok_or("$text expects $search")?
        .to_lowercase();
    let mut strings = Vec::new();
    collect_strings(root, &mut strings);
    Ok(search
        .split_whitespace()
        .any(|word| strings.iter().any(|s| s.to_lowercase().contains(word))))
}

fn collect_strings<'v>(value: &'v Value, out: &mut Vec<&'v str>) {
    match value {
        Value::String(s) => out.push(s),
        Value::Array(items) => items.iter().for_each(|i| collect_strings(i, out)),
        Value::Object(doc) => doc.values().for_each(|v| collect_strings(v, out)),
        _ => {}
    }
}

fn build_regex(pattern: &str, options: &str) -> Result<regex::Regex, String> {
    RegexBuilder::new(pattern)
        .case_insensitive(options.contains('i'))
        .multi_line(options.contains('m'))
        .dot_matches_new_line(options.contains('s'))
        .ignore_whitespace(options.contains('x'))
        .build()
        .map_err(|e| e.to_string())
}

/// Truthiness of an expression result.
pub(crate) fn truthy(value: &Option<Value>) -> bool {
    match value {
        None | Some(Value::Null) | Some(Value::Bool(false)) => false,
        Some(Value::Number(n)) => n.as_f64() != Some(0.0),
        Some(_) => true,
    }
}

/// Expression evaluation state.
pub(crate) struct Context<'r> {
    root: &'r Value,
    vars: HashMap<String, Value>,
    now: DateTime<Utc>,
}

impl<'r> Context<'r> {
    pub(crate) fn new(root: &'r Value, now: DateTime<Utc>) -> Self {
        Self {
            root,
            vars: HashMap::new(),
            now,
        }
    }

    pub(crate) fn eval(&mut self, expr: &Value) -> Eval {
        match expr {
            Value::String(s) if s == "$$NOW" => Ok(Some(date_value(self.now))),
            Value::String(s) if s == "$$KEEP" || s == "$$PRUNE" => Ok(Some(expr.clone())),
            Value::String(s) if s.starts_with("$$") => {
                let path = &s[2..];
                let (name, rest) = path.split_once('.').map_or((path, None), |(n, r)| (n, Some(r)));
                let base = self
                    .vars
                    .get(name)
                    .ok_or_else(|| format!("undefined variable {}", name))?;
                Ok(match rest {
                    Some(rest) => expr_path(base, rest),
                    None => Some(base.clone()),
                })
            }
            Value::String(s) if s.starts_with('$') => Ok(expr_path(self.root, &s[1..])),
            Value::Array(items) => {
                let mut out = Vec::with_capacity(items.len());
                for item in items {
                    out.push(self.eval(item)?.unwrap_or(Value::Null));
                }
                Ok(Some(Value::Array(out)))
            }
            Value::Object(doc) if is_date(expr) => Ok(Some(Value::Object(doc.clone()))),
            Value::Object(doc) => match doc.iter().next() {
                Some((op, arg)) if doc.len() == 1 && op.starts_with('$') => self.operator(op, arg),
                _ => {
                    let mut out = Map::new();
                    for (k, v) in doc {
                        if let Some(v) = self.eval(v)? {
                            out.insert(k.clone(), v);
                        }
                    }
                    Ok(Some(Value::Object(out)))
                }
            },
            other => Ok(Some(other.clone())),
        }
    }

    fn args(&mut self, op: &str, arg: &Value, count: usize) -> Result<Vec<Option<Value>>, String> {
        let items = arg.as_array().ok_or_else(|| format!("{} expects an array", op))?;
        if items.len() != count {
            return Err(format!("{} expects {} arguments", op, count));
        }
        items.iter().map(|item| self.eval(item)).collect()
    }

    fn operator(&mut self, op: &str, arg: &Value) -> Eval {
        match op {
            "$literal" => Ok(Some(arg.clone())),
            "$and" | "$or" => {
                let items = arg.as_array().ok_or_else(|| format!("{} expects an array", op))?;
                let want = op == "$or";
                for item in items {
                    if truthy(&self.eval(item)?) == want {
                        return Ok(Some(Value::Bool(want)));
                    }
                }
                Ok(Some(Value::Bool(!want)))
            }
            "$not" => {
                let inner = match arg {
                    Value::Array(items) if items.len() == 1 => &items[0],
                    other => other,
                };
                Ok(Some(Value::Bool(!truthy(&self.eval(inner)?))))
            }
            "$eq" | "$ne" | "$gt" | "$gte" | "$lt" | "$lte" => {
                let args = self.args(op, arg, 2)?;
                let ord = compare_missing(&args[0], &args[1]);
                let equal = match (&args[0], &args[1]) {
                    (Some(a), Some(b)) => values_equal(a, b),
                    (None, None) => true,
                    _ => false,
                };
                Ok(Some(Value::Bool(match op {
                    "$eq" => equal,
                    "$ne" => !equal,
                    "$gt" => !equal && ord == Ordering::Greater,
                    "$gte" => equal || ord == Ordering::Greater,
                    "$lt" => !equal && ord == Ordering::Less,
                    _ => equal || ord == Ordering::Less,
                })))
            }
            "$in" => {
                let args = self.args(op, arg, 2)?;
                let list = args[1].as_ref().and_then(Value::as_array).ok_or("$in expects an array")?;
                let needle = args[0].clone().unwrap_or(Value::Null);
                Ok(Some(Value::Bool(list.iter().any(|v| values_equal(v, &needle)))))
            }
            "$size" => {
                let inner = match arg {
                    Value::Array(items) if items.len() == 1 => &items[0],
                    other => other,
                };
                match self.eval(inner)? {
                    Some(Value::Array(items)) => Ok(Some(Value::from(items.len()))),
                    _ => Err("$size expects an array".to_string()),
                }
            }
            "$filter" => {
                let input = arg.get("input").ok_or("$filter expects input")?;
                let name = arg.get("as").and_then(Value::as_str).unwrap_or("this").to_string();
                let cond = arg.get("cond").ok_or("$filter expects cond")?;
                let items = match self.eval(input)? {
                    Some(Value::Array(items)) => items,
                    None | Some(Value::Null) => return Ok(Some(Value::Null)),
                    Some(_) => return Err("$filter expects an array".to_string()),
                };
                let saved = self.vars.get(&name).cloned();
                let mut kept = Vec::new();
                for item in items {
                    self.vars.insert(name.clone(), item.clone());
                    if truthy(&self.eval(cond)?) {
                        kept.push(item);
                    }
                }
                match saved {
                    Some(v) => self.vars.insert(name, v),
                    None => self.vars.remove(&name),
                };
                Ok(Some(Value::Array(kept)))
            }
            "$type" => {
                let inner = match arg {
                    Value::Array(items) if items.len() == 1 => &items[0],
                    other => other,
                };
                let name = match self.eval(inner)? {
                    None => "missing",
                    Some(v) => type_name(&v),
                };
                Ok(Some(Value::String(name.to_string())))
            }
            "$ifNull" => {
                let items = arg.as_array().ok_or("$ifNull expects an array")?;
                let mut last = None;
                for item in items {
                    last = self.eval(item)?;
                    if matches!(&last, Some(v) if !v.is_null()) {
                        return Ok(last);
                    }
                }
                Ok(last)
            }
            "$cond" => {
                let (cond, then, otherwise) = match arg {
                    Value::Array(items) if items.len() == 3 => (&items[0], &items[1], &items[2]),
                    Value::Object(doc) => (
                        doc.get("if").ok_or("$cond expects if")?,
                        doc.get("then").ok_or("$cond expects then")?,
                        doc.get("else").ok_or("$cond expects else")?,
                    ),
                    _ => return Err("$cond expects if/then/else".to_string()),
                };
                if truthy(&self.eval(cond)?) {
                    self.eval(then)
                } else {
                    self.eval(otherwise)
                }
            }
            "$dateTrunc" => {
                let date = self.date_arg(arg.get("date"))?;
                match arg.get("unit").and_then(Value::as_str) {
                    Some("day") => Ok(date.and_then(truncate_day).map(date_value)),
                    other => Err(format!("unsupported $dateTrunc unit {:?}", other)),
                }
            }
            "$dateAdd" => {
                let date = self.date_arg(arg.get("startDate"))?;
                let unit = arg
                    .get("unit")
                    .and_then(Value::as_str)
                    .and_then(DateUnit::parse)
                    .ok_or("$dateAdd expects a unit")?;
                let amount = arg.get("amount").and_then(Value::as_i64).ok_or("$dateAdd expects an amount")?;
                Ok(date.and_then(|d| unit.add(d, amount)).map(date_value))
            }
            "$toString" => Ok(match self.eval(arg)? {
                None | Some(Value::Null) => Some(Value::Null),
                Some(Value::String(s)) => Some(Value::String(s)),
                Some(v) => match as_date(&v) {
                    Some(dt) => Some(Value::String(dt.to_rfc3339())),
                    None => Some(Value::String(v.to_string())),
                },
            }),
            "$regexMatch" => {
                let input = self.eval(arg.get("input").ok_or("$regexMatch expects input")?)?;
                let pattern = arg.get("regex").and_then(Value::as_str).ok_or("$regexMatch expects regex")?;
                let options = arg.get("options").and_then(Value::as_str).unwrap_or("");
                let re = build_regex(pattern, options)?;
                Ok(Some(Value::Bool(
                    input.as_ref().and_then(Value::as_str).is_some_and(|s| re.is_match(s)),
                )))
            }
            other => Err(format!("unsupported expression operator {}", other)),
        }
    }

    fn date_arg(&mut self, arg: Option<&Value>) -> Result<Option<DateTime<Utc>>, String> {
        let arg = arg.ok_or("missing date argument")?;
        match self.eval(arg)? {
            None | Some(Value::Null) => Ok(None),
            Some(v) => as_date(&v).map(Some).ok_or_else(|| format!("not a date: {}", v)),
        }
    }
}

/// Expression path lookup; arrays map to the values of their elements.
fn expr_path(base: &Value, path: &str) -> Option<Value> {
    let mut current = base.clone();
    for segment in path.split('.') {
        current = match current {
            Value::Object(mut doc) => doc.remove(segment)?,
            Value::Array(items) => Value::Array(
                items
                    .into_iter()
                    .filter_map(|item| match item {
                        Value::Object(mut doc) => doc.remove(segment),
                        _ => None,
                    })
                    .collect(),
            ),
            _ => return None,
        };
    }
    Some(current)
}

fn compare_missing(a: &Option<Value>, b: &Option<Value>) -> Ordering {
    match (a, b) {
        (None, None) => Ordering::Equal,
        (None, Some(_)) => Ordering::Less,
        (Some(_), None) => Ordering::Greater,
        (Some(a), Some(b)) => compare_values(a, b),
    }
}

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(n) if n.is_i64() || n.is_u64() => "long",
        Value::Number(_) => "double",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) if is_date(value) => "date",
        Value::Object(_) => "object",
    }
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

    fn query(value: Value) -> Document {
        doc(value)
    }

    #[test]
    fn test_null_matches_missing() {
        let d = doc(json!({"a": 1}));
        assert!(matches(&d, &query(json!({"b": null}))).unwrap());
        assert!(matches(&d, &query(json!({"b": {"$in": ["", null]}}))).unwrap());
        assert!(!matches(&d, &query(json!({"a": {"$in": ["", null]}}))).unwrap());
        assert!(matches(&d, &query(json!({"b": {"$ne": 1}}))).unwrap());
    }

    #[test]
    fn test_array_fan_out() {
        let d = doc(json!({"tags": ["x", "y"], "items": [{"qty": 1}, {"qty": 7}]}));
        assert!(matches(&d, &query(json!({"tags": "y"}))).unwrap());
        assert!(matches(&d, &query(json!({"items.qty": {"$gt": 5}}))).unwrap());
        assert!(!matches(&d, &query(json!({"items.qty": {"$gt": 9}}))).unwrap());
    }

    #[test]
    fn test_ranges_respect_types() {
        let d = doc(json!({"n": "10"}));
        assert!(!matches(&d, &query(json!({"n": {"$gt": 5}}))).unwrap());
        let d = doc(json!({"due": {"$date": "2024-01-02T00:00:00.000Z"}}));
        assert!(matches(&d, &query(json!({"due": {"$gt": {"$date": "2024-01-01T00:00:00.000Z"}}}))).unwrap());
    }

    #[test]
    fn test_logical_and_regex() {
        let d = doc(json!({"name": "Open Order", "n": 3}));
        assert!(matches(&d, &query(json!({"$or": [{"n": 1}, {"name": {"$regex": "open\\s+order", "$options": "i"}}]}))).unwrap());
        assert!(matches(&d, &query(json!({"$nor": [{"n": 1}]}))).unwrap());
        assert!(!matches(&d, &query(json!({"n": {"$not": {"$gt": 2}}}))).unwrap());
        assert!(matches(&d, &query(json!({"$text": {"$search": "order"}}))).unwrap());
    }

    #[test]
    fn test_expressions() {
        let d = doc(json!({"a": 2, "items": [{"q": 1}, {"q": 6}], "s": null}));
        assert_eq!(evaluate(&json!({"$size": {"$ifNull": ["$items", []]}}), &d).unwrap(), Some(json!(2)));
        assert_eq!(
            evaluate(&json!({"$size": {"$filter": {
                "input": "$items", "as": "r", "cond": {"$gt": ["$$r.q", 5]}
            }}}), &d)
            .unwrap(),
            Some(json!(1))
        );
        assert_eq!(evaluate(&json!({"$type": "$missing"}), &d).unwrap(), Some(json!("missing")));
        assert_eq!(evaluate(&json!({"$gt": ["$missing", null]}), &d).unwrap(), Some(json!(false)));
        assert_eq!(evaluate(&json!({"$gt": ["$s", null]}), &d).unwrap(), Some(json!(false)));
        assert_eq!(evaluate(&json!({"$gt": ["$a", null]}), &d).unwrap(), Some(json!(true)));
        assert_eq!(
            evaluate(&json!({"$cond": {"if": {"$eq": ["$a", 2]}, "then": "$$KEEP", "else": "$$PRUNE"}}), &d).unwrap(),
            Some(json!("$$KEEP"))
        );
    }

    #[test]
    fn test_date_expressions() {
        let d = doc(json!({"created": {"$date": "2024-03-05T17:45:00.000Z"}}));
        assert_eq!(
            evaluate(&json!({"$dateAdd": {
                "startDate": {"$dateTrunc": {"date": "$created", "unit": "day"}},
                "unit": "day",
                "amount": 1
            }}), &d)
            .unwrap(),
            Some(json!({"$date": "2024-03-06T00:00:00.000Z"}))
        );
    }

    #[test]
    fn test_unsupported_operator() {
        let d = doc(json!({"a": 1}));
        assert!(matches(&d, &query(json!({"a": {"$geoWithin": {}}}))).is_err());
        assert!(evaluate(&json!({"$bogus": 1}), &d).is_err());
    }
}
