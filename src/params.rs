//! Packaging of caller parameters into the JSON blob the daemon expects.
//!
//! No schema checks happen here; whatever the caller passes is forwarded and
//! the daemon decides what it accepts.

use serde_json::{Map, Value};

use crate::error::{AiError, Result};
use crate::model::ChatHistory;

/// Loosely typed per-call options (`model`, `temperature`, `language`, ...).
pub type Params = Map<String, Value>;

/// Compact JSON object holding `params`; `{}` when empty.
pub fn package_params(params: &Params) -> String {
    Value::Object(params.clone()).to_string()
}

/// Like [`package_params`], but an empty map packages as an empty string.
pub fn package_optional_params(params: &Params) -> String {
    if params.is_empty() {
        return String::new();
    }
    package_params(params)
}

/// Chat request body: `history` under `"messages"`, then `params` merged on
/// top. A caller-supplied `"messages"` key wins.
pub fn package_chat_params(history: &[ChatHistory], params: &Params) -> String {
    let messages: Vec<Value> = history
        .iter()
        .map(|entry| {
            let mut msg = Map::new();
            msg.insert("role".into(), Value::from(entry.role.as_str()));
            msg.insert("content".into(), Value::from(entry.content.as_str()));
            Value::Object(msg)
        })
        .collect();

    let mut root = Map::new();
    root.insert("messages".into(), Value::Array(messages));
    for (key, value) in params {
        root.insert(key.clone(), value.clone());
    }
    Value::Object(root).to_string()
}

/// Parse a JSON object given on the command line or in a config value.
pub fn parse_params(json: &str) -> Result<Params> {
    match serde_json::from_str::<Value>(json) {
        Ok(Value::Object(map)) => Ok(map),
        Ok(_) => Err(AiError::invalid("parameters must be a JSON object")),
        Err(e) => Err(AiError::invalid(format!("parameters are not valid JSON: {e}"))),
    }
}

/// Build parameters from `key=value` pairs.
///
/// Values that parse as JSON keep their type (`top_k=5` is a number); anything
/// else is taken as a plain string.
pub fn params_from_pairs<I, S>(pairs: I) -> Result<Params>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let mut params = Params::new();
    for pair in pairs {
        let pair = pair.as_ref();
        let Some((key, raw)) = pair.split_once('=') else {
            return Err(AiError::invalid(format!("expected key=value, got '{pair}'")));
        };
        let key = key.trim();
        if key.is_empty() {
            return Err(AiError::invalid(format!("empty key in '{pair}'")));
        }
        let value = serde_json::from_str::<Value>(raw).unwrap_or_else(|_| Value::from(raw));
        params.insert(key.to_string(), value);
    }
    Ok(params)
}
