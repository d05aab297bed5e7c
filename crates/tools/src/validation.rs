//! Argument validation shared by the built-in tools.

use marlin_core::error::ToolError;
use std::ops::RangeInclusive;

pub const MAX_KEY_LEN: usize = 100;
pub const MAX_STRING_LEN: usize = 1000;

/// Reject oversized keys and string values anywhere in the arguments.
pub fn check_limits(arguments: &serde_json::Value) -> Result<(), ToolError> {
    match arguments {
        serde_json::Value::Object(map) => {
            for (key, value) in map {
                if key.chars().count() > MAX_KEY_LEN {
                    return Err(ToolError::InvalidArguments(format!(
                        "argument name longer than {MAX_KEY_LEN} characters"
                    )));
                }
                check_limits(value)?;
            }
            Ok(())
        }
        serde_json::Value::Array(items) => items.iter().try_for_each(check_limits),
        serde_json::Value::String(s) if s.chars().count() > MAX_STRING_LEN => {
            Err(ToolError::InvalidArguments(format!(
                "string argument longer than {MAX_STRING_LEN} characters"
            )))
        }
        _ => Ok(()),
    }
}

/// A required, non-blank string field.
pub fn required_str<'a>(arguments: &'a serde_json::Value, field: &str) -> Result<&'a str, ToolError> {
    let value = arguments[field]
        .as_str()
        .ok_or_else(|| ToolError::InvalidArguments(format!("Missing '{field}' argument")))?;
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return Err(ToolError::InvalidArguments(format!("'{field}' must not be empty")));
    }
    Ok(trimmed)
}

/// An optional integer field, defaulted and bounded.
pub fn optional_u64(
    arguments: &serde_json::Value,
    field: &str,
    default: u64,
    range: RangeInclusive<u64>,
) -> Result<u64, ToolError> {
    let value = match &arguments[field] {
        serde_json::Value::Null => return Ok(default),
        v => v
            .as_u64()
            .ok_or_else(|| ToolError::InvalidArguments(format!("'{field}' must be a non-negative integer")))?,
    };
    if !range.contains(&value) {
        return Err(ToolError::InvalidArguments(format!(
            "'{field}' must be between {} and {}",
            range.start(),
            range.end()
        )));
    }
    Ok(value)
}

pub fn required_f64(arguments: &serde_json::Value, field: &str) -> Result<f64, ToolError> {
    arguments[field]
        .as_f64()
        .filter(|v| v.is_finite())
        .ok_or_else(|| ToolError::InvalidArguments(format!("'{field}' must be a number")))
}
