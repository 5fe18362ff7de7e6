//! JSON value helpers shared by the compiler and execution adapters.
//!
//! Documents travel as `serde_json` values. Dates use the extended-JSON form
//! `{"$date": "<RFC 3339>"}` so that a rendered filter can be handed to a
//! document store as-is.

use std::cmp::Ordering;

use chrono::{DateTime, SecondsFormat, Utc};
pub use serde_json::Value;

/// A document (ordered map of field name to value).
pub type Document = serde_json::Map<String, Value>;

/// Key of the extended-JSON date wrapper.
pub const DATE_KEY: &str = "$date";

/// Wrap a timestamp in the extended-JSON date form.
pub fn date_value(dt: DateTime<Utc>) -> Value {
    let mut doc = Document::new();
    doc.insert(
        DATE_KEY.to_string(),
        Value::String(dt.to_rfc3339_opts(SecondsFormat::Millis, true)),
    );
    Value::Object(doc)
}

/// Read an extended-JSON date.
pub fn as_date(value: &Value) -> Option<DateTime<Utc>> {
    match value {
        Value::Object(doc) if doc.len() == 1 => match doc.get(DATE_KEY) {
            Some(Value::String(s)) => DateTime::parse_from_rfc3339(s)
                .ok()
                .map(|dt| dt.with_timezone(&Utc)),
            Some(Value::Number(n)) => n.as_i64().and_then(DateTime::from_timestamp_millis),
            _ => None,
        },
        _ => None,
    }
}

/// Check whether a value is an extended-JSON date.
pub fn is_date(value: &Value) -> bool {
    as_date(value).is_some()
}

/// Canonical type rank used for cross-type ordering.
///
/// Follows the document store's comparison order: null, numbers, strings,
/// objects, arrays, booleans, dates.
pub fn type_rank(value: &Value) -> u8 {
    match value {
        Value::Null => 1,
        Value::Number(_) => 2,
        Value::String(_) => 3,
        Value::Object(_) if is_date(value) => 9,
        Value::Object(_) => 4,
        Value::Array(_) => 5,
        Value::Bool(_) => 8,
    }
}

/// Total ordering over JSON values.
pub fn compare_values(a: &Value, b: &Value) -> Ordering {
    let (ra, rb) = (type_rank(a), type_rank(b));
    if ra != rb {
        return ra.cmp(&rb);
    }
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => {
            let (x, y) = (x.as_f64().unwrap_or(0.0), y.as_f64().unwrap_or(0.0));
            x.partial_cmp(&y).unwrap_or(Ordering::Equal)
        }
        (Value::String(x), Value::String(y)) => x.cmp(y),
        (Value::Bool(x), Value::Bool(y)) => x.cmp(y),
        (Value::Array(x), Value::Array(y)) => {
            for (l, r) in x.iter().zip(y.iter()) {
                let ord = compare_values(l, r);
                if ord != Ordering::Equal {
                    return ord;
                }
            }
            x.len().cmp(&y.len())
        }
        (Value::Object(x), Value::Object(y)) => {
            if let (Some(l), Some(r)) = (as_date(a), as_date(b)) {
                return l.cmp(&r);
            }
            for ((kl, vl), (kr, vr)) in x.iter().zip(y.iter()) {
                let ord = kl.cmp(kr).then_with(|| compare_values(vl, vr));
                if ord != Ordering::Equal {
                    return ord;
                }
            }
            x.len().cmp(&y.len())
        }
        _ => Ordering::Equal,
    }
}

/// Equality with numeric normalization (`1` equals `1.0`).
pub fn values_equal(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Number(_), Value::Number(_)) => compare_values(a, b) == Ordering::Equal,
        (Value::Array(x), Value::Array(y)) => {
            x.len() == y.len() && x.iter().zip(y.iter()).all(|(l, r)| values_equal(l, r))
        }
        (Value::Object(_), Value::Object(_)) if is_date(a) || is_date(b) => {
            matches!((as_date(a), as_date(b)), (Some(l), Some(r)) if l == r)
        }
        _ => a == b,
    }
}
