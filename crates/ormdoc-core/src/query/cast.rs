//! Casting of filter values to property types.

use ormdoc_proto::value::date_value;
use serde_json::{Number, Value};

use super::dates::date_from_value;
use crate::catalog::{ClassMeta, PropertyMeta, PropertyType};
use crate::error::Error;

/// Cast a filter value to the type of a property.
///
/// `target` is the referenced class for reference properties; without it a
/// reference value is left as-is.
pub fn cast_value(pm: &PropertyMeta, value: &Value, target: Option<&ClassMeta>) -> Result<Value, Error> {
    if value.is_null() {
        return Ok(Value::Null);
    }
    if let Value::Array(items) = value {
        if pm.property_type != PropertyType::Geo {
            return items
                .iter()
                .map(|item| cast_value(pm, item, target))
                .collect::<Result<Vec<_>, _>>()
                .map(Value::Array);
        }
    }

    match pm.property_type {
        PropertyType::Reference => cast_reference(pm, value, target),
        PropertyType::Boolean => cast_boolean(pm, value),
        PropertyType::Int => cast_int(pm, value),
        PropertyType::Real | PropertyType::Decimal => cast_real(pm, value),
        PropertyType::DateTime => date_from_value(value)
            .map(date_value)
            .ok_or_else(|| invalid(pm, value, "date")),
        PropertyType::String | PropertyType::Text | PropertyType::Url | PropertyType::Html => {
            match value {
                Value::String(_) => Ok(value.clone()),
                Value::Number(n) => Ok(Value::String(n.to_string())),
                Value::Bool(b) => Ok(Value::String(b.to_string())),
                _ => Err(invalid(pm, value, "string")),
            }
        }
        PropertyType::Geo
        | PropertyType::File
        | PropertyType::FileList
        | PropertyType::Collection => Ok(value.clone()),
    }
}

fn cast_reference(pm: &PropertyMeta, value: &Value, target: Option<&ClassMeta>) -> Result<Value, Error> {
    if is_falsy(value) {
        return Ok(Value::Null);
    }
    let Some(target) = target else {
        return Ok(value.clone());
    };
    match target.key_properties() {
        [key] => match target.property_meta(key) {
            Some(key_pm) => cast_value(key_pm, value, None),
            None => Ok(value.clone()),
        },
        _ => Ok(match value {
            Value::String(_) => value.clone(),
            other => Value::String(plain_string(other)),
        }),
    }
}

fn cast_boolean(pm: &PropertyMeta, value: &Value) -> Result<Value, Error> {
    match value {
        Value::Bool(_) => Ok(value.clone()),
        Value::Number(n) => Ok(Value::Bool(n.as_f64().is_some_and(|f| f != 0.0))),
        Value::String(s) => match s.trim() {
            "" if pm.nullable => Ok(Value::Null),
            "" => Ok(Value::Bool(false)),
            "true" | "1" => Ok(Value::Bool(true)),
            "false" | "0" => Ok(Value::Bool(false)),
            _ => Err(invalid(pm, value, "boolean")),
        },
        _ => Err(invalid(pm, value, "boolean")),
    }
}

fn cast_int(pm: &PropertyMeta, value: &Value) -> Result<Value, Error> {
    match value {
        Value::Number(n) => match n.as_i64() {
            Some(_) => Ok(value.clone()),
            None => n
                .as_f64()
                .map(|f| Value::from(f.trunc() as i64))
                .ok_or_else(|| invalid(pm, value, "integer")),
        },
        Value::String(s) if s.trim().is_empty() => Ok(Value::Null),
        Value::String(s) => {
            let s = s.trim();
            if let Ok(i) = s.parse::<i64>() {
                return Ok(Value::from(i));
            }
            s.parse::<f64>()
                .ok()
                .filter(|f| f.is_finite())
                .map(|f| Value::from(f.trunc() as i64))
                .ok_or_else(|| invalid(pm, value, "integer"))
        }
        Value::Bool(b) => Ok(Value::from(i64::from(*b))),
        _ => Err(invalid(pm, value, "integer")),
    }
}

fn cast_real(pm: &PropertyMeta, value: &Value) -> Result<Value, Error> {
    match value {
        Value::Number(_) => Ok(value.clone()),
        Value::String(s) if s.trim().is_empty() => Ok(Value::Null),
        Value::String(s) => s
            .trim()
            .parse::<f64>()
            .ok()
            .and_then(Number::from_f64)
            .map(Value::Number)
            .ok_or_else(|| invalid(pm, value, "number")),
        Value::Bool(b) => Ok(Value::from(i64::from(*b))),
        _ => Err(invalid(pm, value, "number")),
    }
}

fn is_falsy(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::Bool(b) => !b,
        Value::String(s) => s.is_empty(),
        Value::Number(n) => n.as_f64() == Some(0.0),
        _ => false,
    }
}

/// Render a scalar without JSON quoting.
pub fn plain_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn invalid(pm: &PropertyMeta, value: &Value, expected: &str) -> Error {
    Error::InvalidValue {
        property: pm.name.clone(),
        value: value.to_string(),
        expected: expected.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn pm(t: PropertyType) -> PropertyMeta {
        PropertyMeta::new("p", t)
    }

    #[test]
    fn test_numbers() {
        assert_eq!(cast_value(&pm(PropertyType::Int), &json!("42"), None).unwrap(), json!(42));
        assert_eq!(cast_value(&pm(PropertyType::Int), &json!(4.7), None).unwrap(), json!(4));
        assert_eq!(cast_value(&pm(PropertyType::Real), &json!("2.5"), None).unwrap(), json!(2.5));
        assert_eq!(cast_value(&pm(PropertyType::Decimal), &json!(""), None).unwrap(), Value::Null);
        assert!(cast_value(&pm(PropertyType::Int), &json!("abc"), None).is_err());
    }

    #[test]
    fn test_booleans() {
        let nullable = pm(PropertyType::Boolean);
        let required = pm(PropertyType::Boolean).required();
        assert_eq!(cast_value(&nullable, &json!("true"), None).unwrap(), json!(true));
        assert_eq!(cast_value(&nullable, &json!(0), None).unwrap(), json!(false));
        assert_eq!(cast_value(&nullable, &json!(""), None).unwrap(), Value::Null);
        assert_eq!(cast_value(&required, &json!(""), None).unwrap(), json!(false));
        assert!(cast_value(&nullable, &json!("maybe"), None).is_err());
    }

    #[test]
    fn test_dates() {
        assert_eq!(
            cast_value(&pm(PropertyType::DateTime), &json!("2024-02-01"), None).unwrap(),
            json!({"$date": "2024-02-01T00:00:00.000Z"})
        );
        assert!(cast_value(&pm(PropertyType::DateTime), &json!("soon"), None).is_err());
    }

    #[test]
    fn test_null_and_arrays() {
        assert_eq!(cast_value(&pm(PropertyType::Int), &Value::Null, None).unwrap(), Value::Null);
        assert_eq!(
            cast_value(&pm(PropertyType::Int), &json!(["1", 2]), None).unwrap(),
            json!([1, 2])
        );
        assert_eq!(
            cast_value(&pm(PropertyType::String), &json!(7), None).unwrap(),
            json!("7")
        );
    }

    #[test]
    fn test_references() {
        let customer = ClassMeta::new("Customer", "id")
            .with_property(PropertyMeta::new("id", PropertyType::Int));
        let reference = PropertyMeta::reference("customer", "Customer");
        assert_eq!(cast_value(&reference, &json!("7"), Some(&customer)).unwrap(), json!(7));
        assert_eq!(cast_value(&reference, &json!(""), Some(&customer)).unwrap(), Value::Null);

        let composite = ClassMeta::new("Slot", "day").with_key(vec!["day".into(), "room".into()]);
        assert_eq!(
            cast_value(&reference, &json!(12), Some(&composite)).unwrap(),
            json!("12")
        );
    }
}
