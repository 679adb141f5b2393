//! Field rule checks applied to incoming rows before encoding.

use crate::error::DataError;
use crate::model::{Entity, Field, FieldKind};
use regex::Regex;
use serde_json::{Map, Value};

pub struct RowValidator;

impl RowValidator {
    /// Validate a full row for insert. Every required field must be present and non-null.
    pub fn validate(entity: &Entity, row: &Map<String, Value>) -> Result<(), DataError> {
        for field in entity.stored_fields() {
            let val = row.get(&field.name);
            if field.required && !field.is_primary() && val.map_or(true, Value::is_null) {
                return Err(DataError::Validation(format!("{} is required", field.name)));
            }
            if let Some(v) = val {
                validate_field(field, v)?;
            }
        }
        Ok(())
    }

    /// Validate only the fields present (for updates). Missing required fields are fine;
    /// explicitly nulling one is not.
    pub fn validate_partial(entity: &Entity, row: &Map<String, Value>) -> Result<(), DataError> {
        for (name, v) in row {
            if let Some(field) = entity.field(name) {
                if field.required && v.is_null() {
                    return Err(DataError::Validation(format!("{} is required", name)));
                }
                validate_field(field, v)?;
            }
        }
        Ok(())
    }
}

/// Length, pattern and range rules. Type checks happen in the connection.
pub fn validate_field(field: &Field, v: &Value) -> Result<(), DataError> {
    if v.is_null() {
        return Ok(());
    }
    let col = &field.name;
    match &field.kind {
        FieldKind::Text {
            max_length,
            min_length,
            pattern,
        } => {
            let Some(s) = v.as_str() else {
                return Ok(());
            };
            let len = s.chars().count();
            if let Some(max) = max_length {
                if len > *max as usize {
                    return Err(DataError::Validation(format!(
                        "{} must be at most {} characters",
                        col, max
                    )));
                }
            }
            if let Some(min) = min_length {
                if len < *min as usize {
                    return Err(DataError::Validation(format!(
                        "{} must be at least {} characters",
                        col, min
                    )));
                }
            }
            if let Some(pattern) = pattern {
                let re = Regex::new(pattern)
                    .map_err(|_| DataError::Validation(format!("invalid pattern for {}", col)))?;
                if !re.is_match(s) {
                    return Err(DataError::Validation(format!("{} does not match required pattern", col)));
                }
            }
        }
        FieldKind::Number { minimum, maximum } => {
            let n = match v {
                Value::Number(n) => n.as_f64(),
                Value::String(s) => s.trim().parse::<f64>().ok(),
                _ => None,
            };
            if let Some(n) = n {
                if let Some(min) = minimum {
                    if n < *min {
                        return Err(DataError::Validation(format!("{} must be at least {}", col, min)));
                    }
                }
                if let Some(max) = maximum {
                    if n > *max {
                        return Err(DataError::Validation(format!("{} must be at most {}", col, max)));
                    }
                }
            }
        }
        _ => {}
    }
    Ok(())
}

impl Field {
    /// Check `value` against this field's length, pattern and range rules.
    pub fn validate_value(&self, value: &Value) -> Result<(), DataError> {
        if self.required && value.is_null() {
            return Err(DataError::Validation(format!("{} is required", self.name)));
        }
        validate_field(self, value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::EntityConfig;
    use serde_json::json;

    fn users() -> Entity {
        Entity::new(
            "users",
            vec![
                Field::text("username").required(),
                Field::text("email").max_length(3),
                Field::number("age").range(Some(0.0), Some(150.0)),
            ],
            EntityConfig::default(),
        )
        .unwrap()
    }

    fn row(v: Value) -> Map<String, Value> {
        v.as_object().cloned().unwrap()
    }

    #[test]
    fn required_fields_must_be_present() {
        let e = users();
        let err = RowValidator::validate(&e, &row(json!({"email": "a"}))).unwrap_err();
        assert!(err.to_string().contains("username is required"));
        assert!(RowValidator::validate(&e, &row(json!({"username": "x"}))).is_ok());
    }

    #[test]
    fn partial_skips_missing_required() {
        let e = users();
        assert!(RowValidator::validate_partial(&e, &row(json!({"email": "a"}))).is_ok());
        assert!(RowValidator::validate_partial(&e, &row(json!({"username": null}))).is_err());
    }

    #[test]
    fn length_and_range_rules() {
        let e = users();
        assert!(RowValidator::validate_partial(&e, &row(json!({"email": "abcd"}))).is_err());
        assert!(RowValidator::validate_partial(&e, &row(json!({"age": 200}))).is_err());
        assert!(RowValidator::validate_partial(&e, &row(json!({"age": "20"}))).is_ok());
    }

    #[test]
    fn pattern_rule() {
        let f = Field::text("code").pattern("^[A-Z]{3}$");
        assert!(f.validate_value(&json!("ABC")).is_ok());
        assert!(f.validate_value(&json!("abc")).is_err());
        assert!(Field::text("x").required().validate_value(&Value::Null).is_err());
    }
}
