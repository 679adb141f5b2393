//! Dialect-independent value checks shared by the connections.

use crate::error::DataError;
use crate::model::{Field, FieldKind};
use chrono::{DateTime, NaiveDate, NaiveDateTime, SecondsFormat, Utc};
use serde_json::{Number, Value};

const MAX_SAFE_INTEGER: f64 = 9_007_199_254_740_991.0;

fn mismatch(field: &Field, expected: &str, got: &Value) -> DataError {
    DataError::Validation(format!("{} expects {}, got {}", field.name, expected, got))
}

/// Check `value` against the field type and normalize its representation.
/// Dialect-specific encoding happens after this.
pub fn check(field: &Field, value: Value) -> Result<Value, DataError> {
    if value.is_null() {
        return Ok(Value::Null);
    }
    match &field.kind {
        FieldKind::Text { .. } => match value {
            Value::String(_) => Ok(value),
            other => Err(mismatch(field, "text", &other)),
        },
        FieldKind::Number { .. } => match value {
            Value::Number(_) => Ok(value),
            Value::String(ref s) => s
                .trim()
                .parse::<f64>()
                .ok()
                .and_then(Number::from_f64)
                .map(|n| normalize_number(Value::Number(n)))
                .ok_or_else(|| mismatch(field, "a number", &value)),
            other => Err(mismatch(field, "a number", &other)),
        },
        FieldKind::Boolean => match &value {
            Value::Bool(_) => Ok(value),
            Value::Number(n) if n.as_i64() == Some(0) => Ok(Value::Bool(false)),
            Value::Number(n) if n.as_i64() == Some(1) => Ok(Value::Bool(true)),
            Value::String(s) if s == "true" || s == "1" => Ok(Value::Bool(true)),
            Value::String(s) if s == "false" || s == "0" => Ok(Value::Bool(false)),
            other => Err(mismatch(field, "a boolean", other)),
        },
        FieldKind::Date => {
            let s = value.as_str().ok_or_else(|| mismatch(field, "a date string", &value))?;
            parse_date(s)
                .map(|d| Value::String(d.format("%Y-%m-%d").to_string()))
                .ok_or_else(|| mismatch(field, "a YYYY-MM-DD date", &value))
        }
        FieldKind::Datetime => {
            let s = value.as_str().ok_or_else(|| mismatch(field, "a datetime string", &value))?;
            parse_datetime(s)
                .map(|d| Value::String(d.to_rfc3339_opts(SecondsFormat::Millis, true)))
                .ok_or_else(|| mismatch(field, "an RFC 3339 datetime", &value))
        }
        FieldKind::Json => Ok(value),
        FieldKind::Blob => match &value {
            Value::String(s) => hex::decode(s)
                .map(|bytes| Value::String(hex::encode(bytes)))
                .map_err(|_| mismatch(field, "hex-encoded bytes", &value)),
            Value::Array(items) => items
                .iter()
                .map(|i| i.as_u64().and_then(|n| u8::try_from(n).ok()))
                .collect::<Option<Vec<u8>>>()
                .map(|bytes| Value::String(hex::encode(bytes)))
                .ok_or_else(|| mismatch(field, "an array of bytes", &value)),
            other => Err(mismatch(field, "bytes", other)),
        },
        FieldKind::Primary { .. } | FieldKind::Relation { .. } => {
            let integer = field.key_format().map(|f| f.is_integer()).unwrap_or(true);
            check_key(field, value, integer)
        }
        FieldKind::Virtual => Err(DataError::Validation(format!(
            "{} is virtual and can not be stored",
            field.name
        ))),
    }
}

fn check_key(field: &Field, value: Value, integer: bool) -> Result<Value, DataError> {
    match (integer, &value) {
        (true, Value::Number(n)) if n.is_i64() || n.is_u64() => Ok(value),
        (true, Value::String(s)) => s
            .trim()
            .parse::<i64>()
            .map(|n| Value::Number(n.into()))
            .map_err(|_| mismatch(field, "an integer key", &value)),
        (true, other) => Err(mismatch(field, "an integer key", other)),
        (false, Value::String(s)) if !s.is_empty() => Ok(value),
        (false, Value::Number(n)) => Ok(Value::String(n.to_string())),
        (false, other) => Err(mismatch(field, "a string key", other)),
    }
}

fn parse_date(s: &str) -> Option<NaiveDate> {
    NaiveDate::parse_from_str(s, "%Y-%m-%d")
        .ok()
        .or_else(|| parse_datetime(s).map(|d| d.date_naive()))
}

fn parse_datetime(s: &str) -> Option<DateTime<Utc>> {
    if let Ok(d) = DateTime::parse_from_rfc3339(s) {
        return Some(d.with_timezone(&Utc));
    }
    ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f"]
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(s, fmt).ok())
        .map(|n| n.and_utc())
}

/// Integral floats become JSON integers so `5.0` read back from a float column is `5`.
pub fn normalize_number(value: Value) -> Value {
    match &value {
        Value::Number(n) if n.is_f64() => match n.as_f64() {
            Some(f) if f.fract() == 0.0 && f.abs() <= MAX_SAFE_INTEGER => Value::Number((f as i64).into()),
            _ => value,
        },
        _ => value,
    }
}

pub fn bytes_to_value(bytes: &[u8]) -> Value {
    Value::String(hex::encode(bytes))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::PrimaryFormat;
    use serde_json::json;

    #[test]
    fn text_rejects_numbers() {
        assert!(check(&Field::text("a"), json!(1)).is_err());
        assert_eq!(check(&Field::text("a"), json!("x")).unwrap(), json!("x"));
    }

    #[test]
    fn null_always_passes() {
        assert_eq!(check(&Field::boolean("b"), Value::Null).unwrap(), Value::Null);
    }

    #[test]
    fn booleans_accept_flags() {
        let f = Field::boolean("b");
        assert_eq!(check(&f, json!(1)).unwrap(), json!(true));
        assert_eq!(check(&f, json!("false")).unwrap(), json!(false));
        assert!(check(&f, json!("yes")).is_err());
    }

    #[test]
    fn numbers_parse_strings() {
        assert_eq!(check(&Field::number("n"), json!("4")).unwrap(), json!(4));
        assert_eq!(check(&Field::number("n"), json!("4.5")).unwrap(), json!(4.5));
        assert!(check(&Field::number("n"), json!("four")).is_err());
    }

    #[test]
    fn dates_normalize() {
        assert_eq!(
            check(&Field::date("d"), json!("2024-02-03T10:00:00Z")).unwrap(),
            json!("2024-02-03")
        );
        assert_eq!(
            check(&Field::datetime("d"), json!("2024-02-03 10:00:00")).unwrap(),
            json!("2024-02-03T10:00:00.000Z")
        );
        assert!(check(&Field::date("d"), json!("03/02/2024")).is_err());
    }

    #[test]
    fn blobs_become_hex() {
        assert_eq!(check(&Field::blob("b"), json!([1, 255])).unwrap(), json!("01ff"));
        assert!(check(&Field::blob("b"), json!("zz")).is_err());
    }

    #[test]
    fn keys_follow_format() {
        let int_pk = Field::primary("id", PrimaryFormat::Integer);
        assert_eq!(check(&int_pk, json!("7")).unwrap(), json!(7));
        let uuid_pk = Field::primary("id", PrimaryFormat::Uuid);
        assert_eq!(check(&uuid_pk, json!(7)).unwrap(), json!("7"));
        assert!(check(&uuid_pk, json!("")).is_err());
    }

    #[test]
    fn integral_floats_normalize() {
        assert_eq!(normalize_number(json!(5.0)), json!(5));
        assert_eq!(normalize_number(json!(5.5)), json!(5.5));
    }
}
