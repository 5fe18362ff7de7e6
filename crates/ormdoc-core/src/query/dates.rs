//! Date parsing and computed date operands.

use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use ormdoc_proto::value::{as_date, DATE_KEY};
use ormdoc_proto::{DateExpr, DateUnit};
use serde_json::Value;

use crate::error::Error;

/// Key of the interval operand.
pub const DATE_ADD_KEY: &str = "$dateAdd";

/// Key of an explicit date format next to `$date`.
pub const FORMAT_KEY: &str = "$format";

const NOW: &str = "$$NOW";

/// Parse an ISO-like date string.
///
/// Accepts RFC 3339, `YYYY-MM-DDTHH:MM:SS[.fff]`, `YYYY-MM-DD HH:MM:SS` and
/// `YYYY-MM-DD`. Values without a zone are taken as UTC.
pub fn parse_date(s: &str) -> Option<DateTime<Utc>> {
    let s = s.trim();
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Some(dt.with_timezone(&Utc));
    }
    for fmt in ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%dT%H:%M:%S", "%Y-%m-%d %H:%M:%S"] {
        if let Ok(dt) = NaiveDateTime::parse_from_str(s, fmt) {
            return Some(dt.and_utc());
        }
    }
    NaiveDate::parse_from_str(s, "%Y-%m-%d")
        .ok()
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .map(|dt| dt.and_utc())
}

/// Parse a date string with an explicit chrono format.
pub fn parse_date_with_format(s: &str, format: &str) -> Option<DateTime<Utc>> {
    if let Ok(dt) = DateTime::parse_from_str(s, format) {
        return Some(dt.with_timezone(&Utc));
    }
    if let Ok(dt) = NaiveDateTime::parse_from_str(s, format) {
        return Some(dt.and_utc());
    }
    NaiveDate::parse_from_str(s, format)
        .ok()
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .map(|dt| dt.and_utc())
}

/// Parse a date typed by a user in the given language.
///
/// ISO forms are always accepted; `ru` adds `dd.mm.yyyy`, `en` adds
/// `mm/dd/yyyy`.
pub fn parse_localized_date(s: &str, language: Option<&str>) -> Option<DateTime<Utc>> {
    if let Some(dt) = parse_date(s) {
        return Some(dt);
    }
    let lang = language.unwrap_or("en");
    let lang = lang.split(['-', '_']).next().unwrap_or(lang);
    let formats: &[&str] = match lang {
        "ru" => &["%d.%m.%Y %H:%M:%S", "%d.%m.%Y %H:%M", "%d.%m.%Y"],
        "en" => &["%m/%d/%Y %H:%M:%S", "%m/%d/%Y %H:%M", "%m/%d/%Y"],
        _ => &[],
    };
    formats
        .iter()
        .find_map(|fmt| parse_date_with_format(s.trim(), fmt))
}

/// Read a date from a JSON value: a string, epoch milliseconds or a
/// `{"$date": ...}` wrapper (optionally with `"$format"`).
pub fn date_from_value(value: &Value) -> Option<DateTime<Utc>> {
    match value {
        Value::String(s) => parse_date(s),
        Value::Number(n) => n.as_i64().and_then(DateTime::from_timestamp_millis),
        Value::Object(doc) => {
            if let Some(dt) = as_date(value) {
                return Some(dt);
            }
            let raw = doc.get(DATE_KEY)?.as_str()?;
            match doc.get(FORMAT_KEY).and_then(Value::as_str) {
                Some(format) => parse_date_with_format(raw, format),
                None => parse_date(raw),
            }
        }
        _ => None,
    }
}

/// Check whether a value is a computed date operand (`$date` / `$dateAdd`).
pub fn is_date_operand(value: &Value) -> bool {
    match value {
        Value::Object(doc) => doc.contains_key(DATE_KEY) || doc.contains_key(DATE_ADD_KEY),
        _ => false,
    }
}

/// Parse a `$date` / `$dateAdd` operand.
///
/// `{"$date": "$field"}` and `{"$date": "$$NOW"}` denote the start of the day
/// of a field or of the current time; any other `$date` is a literal.
pub fn date_operand(value: &Value) -> Result<DateExpr, Error> {
    let doc = match value {
        Value::Object(doc) => doc,
        Value::String(s) => return date_reference(s),
        other => {
            return date_from_value(other)
                .map(DateExpr::Literal)
                .ok_or_else(|| Error::malformed(DATE_KEY, format!("not a date: {}", other)))
        }
    };

    if let Some(args) = doc.get(DATE_ADD_KEY) {
        let args = args
            .as_object()
            .ok_or_else(|| Error::malformed(DATE_ADD_KEY, "expected an object"))?;
        let base = args
            .get("date")
            .ok_or_else(|| Error::malformed(DATE_ADD_KEY, "missing date"))?;
        let amount = args
            .get("amount")
            .and_then(amount_value)
            .ok_or_else(|| Error::malformed(DATE_ADD_KEY, "amount must be an integer"))?;
        let unit = args
            .get("unit")
            .and_then(Value::as_str)
            .and_then(DateUnit::parse)
            .ok_or_else(|| Error::malformed(DATE_ADD_KEY, "unknown unit"))?;
        return Ok(DateExpr::Add {
            base: Box::new(date_operand(base)?),
            amount,
            unit,
        });
    }

    match doc.get(DATE_KEY) {
        Some(Value::String(s)) if s.starts_with('$') => {
            Ok(DateExpr::Truncate(Box::new(date_reference(s)?)))
        }
        Some(_) => date_from_value(value)
            .map(DateExpr::Literal)
            .ok_or_else(|| Error::malformed(DATE_KEY, format!("not a date: {}", value))),
        None => Err(Error::malformed(DATE_KEY, "expected $date or $dateAdd")),
    }
}

fn date_reference(s: &str) -> Result<DateExpr, Error> {
    if s == NOW {
        Ok(DateExpr::Now)
    } else if let Some(field) = s.strip_prefix('$') {
        if field.is_empty() || field.starts_with('$') {
            Err(Error::malformed(DATE_KEY, format!("unknown variable {}", s)))
        } else {
            Ok(DateExpr::Field(field.to_string()))
        }
    } else {
        parse_date(s)
            .map(DateExpr::Literal)
            .ok_or_else(|| Error::malformed(DATE_KEY, format!("not a date: {}", s)))
    }
}

fn amount_value(value: &Value) -> Option<i64> {
    match value {
        Value::Number(n) => n.as_i64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}
