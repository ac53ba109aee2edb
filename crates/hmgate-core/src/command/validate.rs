// ── Write validation ──
//
// Every outbound write is checked against the parameter description
// before it reaches the Request Client.

use hmgate_api::{ParameterDescription, ParameterType, Value};

use crate::error::CoreError;

/// Check that `parameter` on `channel` may be written with `value`, and
/// return the value in the representation the backend expects.
pub fn validate_write(
    channel: &str,
    parameter: &str,
    description: &ParameterDescription,
    value: &Value,
) -> Result<Value, CoreError> {
    if !description.operations.is_writable() {
        return Err(CoreError::PermissionDenied {
            channel: channel.to_owned(),
            parameter: parameter.to_owned(),
        });
    }

    let invalid = |message: String| CoreError::InvalidParameter {
        message: format!("{parameter} on {channel}: {message}"),
    };

    match description.kind {
        ParameterType::Bool => strict_bool(value)
            .map(Value::Bool)
            .ok_or_else(|| invalid(format!("expected a boolean, got {value}"))),
        ParameterType::Action => match strict_bool(value) {
            Some(true) => Ok(Value::Bool(true)),
            _ => Err(invalid(format!("actions only accept true, got {value}"))),
        },
        ParameterType::String => match value {
            Value::String(_) => Ok(value.clone()),
            other => Err(invalid(format!("expected a string, got {other}"))),
        },
        ParameterType::Enum => {
            let index = enum_index(description, value)
                .ok_or_else(|| invalid(format!("{value} is not a valid choice")))?;
            Ok(Value::Integer(index))
        }
        ParameterType::Integer | ParameterType::Float => {
            let coerced = match value {
                Value::Integer(_) | Value::Float(_) => value.coerce(description.kind),
                _ => None,
            }
            .ok_or_else(|| invalid(format!("expected a number, got {value}")))?;
            if is_special(description, &coerced) {
                return Ok(coerced);
            }
            check_range(description, &coerced).map_err(invalid)?;
            Ok(coerced)
        }
    }
}

fn strict_bool(value: &Value) -> Option<bool> {
    match value {
        Value::Bool(b) => Some(*b),
        Value::Integer(0) => Some(false),
        Value::Integer(1) => Some(true),
        Value::String(s) => match s.as_str() {
            "true" => Some(true),
            "false" => Some(false),
            _ => None,
        },
        _ => None,
    }
}

/// Index into `VALUE_LIST` for an index or a label.
fn enum_index(description: &ParameterDescription, value: &Value) -> Option<i64> {
    let choices = description.value_list.as_deref().unwrap_or_default();
    match value {
        Value::String(label) => choices
            .iter()
            .position(|c| c == label)
            .and_then(|i| i64::try_from(i).ok()),
        Value::Integer(index) => {
            let in_list = usize::try_from(*index).is_ok_and(|i| i < choices.len());
            let in_range = choices.is_empty() && check_range(description, value).is_ok();
            (in_list || in_range).then_some(*index)
        }
        _ => None,
    }
}

fn is_special(description: &ParameterDescription, value: &Value) -> bool {
    description
        .special
        .as_deref()
        .unwrap_or_default()
        .iter()
        .any(|s| s.value.as_f64() == value.as_f64())
}

fn check_range(description: &ParameterDescription, value: &Value) -> Result<(), String> {
    let Some(v) = value.as_f64() else {
        return Err(format!("{value} is not numeric"));
    };
    if let Some(min) = description.min.as_ref().and_then(Value::as_f64) {
        if v < min {
            return Err(format!("{v} is below the minimum {min}"));
        }
    }
    if let Some(max) = description.max.as_ref().and_then(Value::as_f64) {
        if v > max {
            return Err(format!("{v} is above the maximum {max}"));
        }
    }
    Ok(())
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use serde_json::json;

    fn desc(value: serde_json::Value) -> ParameterDescription {
        serde_json::from_value(value).unwrap()
    }

    #[test]
    fn read_only_parameters_are_denied() {
        let d = desc(json!({ "TYPE": "FLOAT", "OPERATIONS": 5 }));
        let err =
            validate_write("ABC123:1", "ACTUAL_TEMPERATURE", &d, &Value::Float(1.0)).unwrap_err();
        assert!(matches!(err, CoreError::PermissionDenied { .. }));
    }

    #[test]
    fn numbers_are_range_checked() {
        let d = desc(json!({ "TYPE": "FLOAT", "OPERATIONS": 7, "MIN": 0.0, "MAX": 1.01 }));
        assert_eq!(
            validate_write("A:1", "LEVEL", &d, &Value::Integer(1)).unwrap(),
            Value::Float(1.0)
        );
        assert!(matches!(
            validate_write("A:1", "LEVEL", &d, &Value::Float(1.5)),
            Err(CoreError::InvalidParameter { .. })
        ));
        assert!(validate_write("A:1", "LEVEL", &d, &Value::from("0.5")).is_err());
    }

    #[test]
    fn special_values_bypass_the_range() {
        let d = desc(json!({
            "TYPE": "FLOAT", "OPERATIONS": 7, "MIN": 0.0, "MAX": 1.0,
            "SPECIAL": [{ "ID": "NOT_USED", "VALUE": 1.005 }],
        }));
        assert!(validate_write("A:1", "LEVEL", &d, &Value::Float(1.005)).is_ok());
    }

    #[test]
    fn enums_take_index_or_label() {
        let d = desc(json!({
            "TYPE": "ENUM", "OPERATIONS": 7,
            "VALUE_LIST": ["LOCKED", "UNLOCKED", "OPEN"],
        }));
        let write = |value: Value| validate_write("A:1", "LOCK_TARGET_LEVEL", &d, &value);
        assert_eq!(write(Value::from("OPEN")).unwrap(), Value::Integer(2));
        assert_eq!(write(Value::Integer(1)).unwrap(), Value::Integer(1));
        assert!(write(Value::Integer(3)).is_err());
        assert!(write(Value::from("AJAR")).is_err());
    }

    #[test]
    fn actions_only_accept_true() {
        let d = desc(json!({ "TYPE": "ACTION", "OPERATIONS": 2 }));
        let stop = validate_write("A:1", "STOP", &d, &Value::Bool(true)).unwrap();
        assert_eq!(stop, Value::Bool(true));
        assert!(validate_write("A:1", "STOP", &d, &Value::Bool(false)).is_err());
    }

    #[test]
    fn bools_and_strings_are_type_checked() {
        let d = desc(json!({ "TYPE": "BOOL", "OPERATIONS": 7 }));
        let state = validate_write("A:1", "STATE", &d, &Value::Integer(1)).unwrap();
        assert_eq!(state, Value::Bool(true));
        assert!(validate_write("A:1", "STATE", &d, &Value::Float(0.5)).is_err());

        let d = desc(json!({ "TYPE": "STRING", "OPERATIONS": 2 }));
        assert!(validate_write("A:1", "TEXT", &d, &Value::from("hi")).is_ok());
        assert!(validate_write("A:1", "TEXT", &d, &Value::Integer(1)).is_err());
    }
}
