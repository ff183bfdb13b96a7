//! Decoding of the JSON replies capability methods return.
//!
//! Two shapes exist. Recognition services flag failures inline with
//! `{"error": true, "error_code": n, "error_message": "..."}`. Chat, speech
//! and function calling report a numeric code instead, either as
//! `{"error": n, "errorMessage": "..."}` or `{"error_code": n, "error_message": "..."}`,
//! where zero means success.

use serde_json::{Map, Value};

use crate::error::{AiError, Result};

/// Code used when a reply flags an error without saying which.
const UNSPECIFIED_DAEMON_ERROR: i32 = -1;

/// Parse `reply` as a JSON object.
pub fn parse_object(reply: &str) -> Result<Map<String, Value>> {
    match serde_json::from_str::<Value>(reply) {
        Ok(Value::Object(obj)) => Ok(obj),
        Ok(other) => Err(AiError::parse(format!(
            "expected a JSON object, got {}",
            json_kind(&other)
        ))),
        Err(e) => Err(AiError::parse(e.to_string())),
    }
}

fn json_kind(v: &Value) -> &'static str {
    match v {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}

fn code_of(v: &Value) -> Option<i32> {
    v.as_i64().and_then(|n| i32::try_from(n).ok())
}

fn message_of(obj: &Map<String, Value>, keys: &[&str]) -> String {
    keys.iter()
        .find_map(|k| obj.get(*k).and_then(Value::as_str))
        .unwrap_or_default()
        .to_string()
}

/// String payload at `field`, empty when missing.
pub fn string_field(obj: &Map<String, Value>, field: &str) -> String {
    obj.get(field)
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string()
}

/// Error flagged with a boolean `error`, if any.
fn inline_error(obj: &Map<String, Value>) -> Option<AiError> {
    if !obj.get("error").and_then(Value::as_bool).unwrap_or(false) {
        return None;
    }
    Some(AiError::Daemon {
        code: obj
            .get("error_code")
            .and_then(code_of)
            .unwrap_or(UNSPECIFIED_DAEMON_ERROR),
        message: message_of(obj, &["error_message", "errorMessage"]),
    })
}

/// Error reported through a nonzero numeric code, if any.
fn coded_error(obj: &Map<String, Value>) -> Option<AiError> {
    if let Some(code) = obj.get("error_code").and_then(code_of)
        && code != 0
    {
        return Some(AiError::Daemon {
            code,
            message: message_of(obj, &["error_message", "errorMessage"]),
        });
    }
    if let Some(code) = obj.get("error").and_then(code_of)
        && code != 0
    {
        return Some(AiError::Daemon {
            code,
            message: message_of(obj, &["errorMessage", "error_message"]),
        });
    }
    inline_error(obj)
}

/// Unpack an inline-error reply and return its string payload at `field`.
pub fn unpack_inline_error(reply: &str, field: &str) -> Result<String> {
    let obj = parse_object(reply)?;
    if let Some(err) = inline_error(&obj) {
        return Err(err);
    }
    Ok(string_field(&obj, field))
}

/// Unpack an error-code reply and return the whole object.
pub fn unpack_coded_object(reply: &str) -> Result<Map<String, Value>> {
    let obj = parse_object(reply)?;
    match coded_error(&obj) {
        Some(err) => Err(err),
        None => Ok(obj),
    }
}

/// Unpack an error-code reply and return its string payload at `field`.
pub fn unpack_error_code(reply: &str, field: &str) -> Result<String> {
    unpack_coded_object(reply).map(|obj| string_field(&obj, field))
}

/// Function-calling reply: the `function` object re-encoded as compact JSON.
pub fn unpack_function(reply: &str) -> Result<String> {
    let obj = unpack_coded_object(reply)?;
    let function = match obj.get("function") {
        Some(Value::Object(f)) => Value::Object(f.clone()),
        Some(Value::Null) | None => Value::Object(Map::new()),
        Some(other) => {
            return Err(AiError::parse(format!(
                "'function' is {}, expected an object",
                json_kind(other)
            )));
        }
    };
    Ok(function.to_string())
}

/// Embedding platform reply: the `results` array.
pub fn unpack_results(reply: &str) -> Result<Vec<Value>> {
    let mut obj = parse_object(reply)?;
    if let Some(err) = coded_error(&obj) {
        return Err(err);
    }
    match obj.remove("results") {
        Some(Value::Array(items)) => Ok(items),
        Some(_) => Err(AiError::parse("'results' is not an array")),
        None => Err(AiError::parse("reply has no 'results' field")),
    }
}
