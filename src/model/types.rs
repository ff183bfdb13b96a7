//! Records exchanged with the daemon.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::AiError;

/// Author of a chat history entry.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum ChatRole {
    User,
    Assistant,
    System,
}

impl ChatRole {
    pub fn as_str(self) -> &'static str {
        match self {
            ChatRole::User => "user",
            ChatRole::Assistant => "assistant",
            ChatRole::System => "system",
        }
    }
}

impl fmt::Display for ChatRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ChatRole {
    type Err = AiError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "user" => Ok(ChatRole::User),
            "assistant" => Ok(ChatRole::Assistant),
            "system" => Ok(ChatRole::System),
            other => Err(AiError::invalid(format!("unknown chat role '{other}'"))),
        }
    }
}

/// One turn of a conversation passed to chat calls.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ChatHistory {
    pub role: ChatRole,
    pub content: String,
}

impl ChatHistory {
    pub fn new(role: ChatRole, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::new(ChatRole::User, content)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::new(ChatRole::Assistant, content)
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self::new(ChatRole::System, content)
    }
}

/// Where a model runs.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
pub enum DeployType {
    Local,
    Cloud,
    #[default]
    Custom,
}

impl DeployType {
    /// Anything other than `Local` or `Cloud` counts as custom.
    pub fn from_name(name: &str) -> Self {
        match name {
            "Local" => DeployType::Local,
            "Cloud" => DeployType::Cloud,
            _ => DeployType::Custom,
        }
    }
}

/// Model descriptor reported by the model registry.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct ModelInfo {
    pub name: String,
    pub provider: String,
    pub description: String,
    /// Capability name as the registry reports it.
    pub capability: String,
    pub deploy_type: DeployType,
    pub is_available: bool,
    /// Default parameters the model runs with.
    pub parameters: Map<String, Value>,
}

impl ModelInfo {
    /// Build from one registry JSON object; missing fields take their defaults.
    pub fn from_json(obj: &Map<String, Value>) -> Self {
        let text = |key: &str| {
            obj.get(key)
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string()
        };
        Self {
            name: text("name"),
            provider: text("provider"),
            description: text("description"),
            capability: text("capability"),
            deploy_type: DeployType::from_name(&text("deployType")),
            is_available: obj
                .get("isAvailable")
                .and_then(Value::as_bool)
                .unwrap_or(false),
            parameters: obj
                .get("parameters")
                .and_then(Value::as_object)
                .cloned()
                .unwrap_or_default(),
        }
    }
}

/// Document stored in the embedding platform.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct DocumentInfo {
    pub id: String,
    pub file_path: String,
    pub created_at: Option<DateTime<Utc>>,
    pub metadata: Map<String, Value>,
}

/// Matched piece of a document.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct Chunk {
    pub chunk_index: i64,
    pub content: String,
    pub tokens: i64,
    pub timestamp: Vec<String>,
}

/// One hit of a semantic search.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct SearchResult {
    pub id: String,
    pub model: String,
    pub distance: f64,
    pub chunk: Chunk,
}

/// Rectangle inside an image, in pixels.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct Region {
    pub x: i32,
    pub y: i32,
    pub width: i32,
    pub height: i32,
}

impl Region {
    pub fn new(x: i32, y: i32, width: i32, height: i32) -> Self {
        Self {
            x,
            y,
            width,
            height,
        }
    }
}

/// Formats as `x,y,width,height`, the form the daemon expects.
impl fmt::Display for Region {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{},{},{},{}", self.x, self.y, self.width, self.height)
    }
}

impl FromStr for Region {
    type Err = AiError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parts: Vec<i32> = s
            .split(',')
            .map(|p| p.trim().parse::<i32>())
            .collect::<Result<_, _>>()
            .map_err(|_| AiError::invalid(format!("region must be x,y,width,height: '{s}'")))?;
        match parts.as_slice() {
            [x, y, w, h] => Ok(Region::new(*x, *y, *w, *h)),
            _ => Err(AiError::invalid(format!(
                "region must be x,y,width,height: '{s}'"
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn chat_role_serializes_lowercase() {
        let entry = ChatHistory::assistant("hi");
        assert_eq!(
            serde_json::to_value(&entry).unwrap(),
            json!({"role": "assistant", "content": "hi"})
        );
        assert_eq!("System".parse::<ChatRole>().unwrap(), ChatRole::System);
        assert!("robot".parse::<ChatRole>().is_err());
    }

    #[test]
    fn model_info_from_registry_json() {
        let raw = json!({
            "name": "qwen",
            "provider": "local-llm",
            "capability": "Chat",
            "isAvailable": true,
            "deployType": "Local",
            "parameters": {"temperature": 0.7}
        });
        let info = ModelInfo::from_json(raw.as_object().unwrap());
        assert_eq!(info.name, "qwen");
        assert_eq!(info.deploy_type, DeployType::Local);
        assert!(info.is_available);
        assert_eq!(info.description, "");
        assert_eq!(info.parameters["temperature"], json!(0.7));
    }

    #[test]
    fn unknown_deploy_type_is_custom() {
        assert_eq!(DeployType::from_name("Edge"), DeployType::Custom);
        assert_eq!(DeployType::from_name("Cloud"), DeployType::Cloud);
    }

    #[test]
    fn region_text_form() {
        let region = Region::new(10, 20, 300, 40);
        assert_eq!(region.to_string(), "10,20,300,40");
        assert_eq!(" 10, 20,300 ,40".parse::<Region>().unwrap(), region);
        assert!("10,20,300".parse::<Region>().is_err());
        assert!("a,b,c,d".parse::<Region>().is_err());
    }
}
