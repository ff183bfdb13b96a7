//! Model registry queries.
//!
//! Every query goes to the daemon; nothing is cached.

use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tracing::debug;

use crate::bus::{Bus, BusValue, MODEL_INFO_PATH};
use crate::config::ClientConfig;
use crate::error::{AiError, LastError, Result};
use crate::model::ModelInfo;
use crate::reply::parse_object;
use crate::session::Capability;
use crate::state::ClientState;

#[derive(Debug)]
pub struct ModelManager {
    bus: Arc<dyn Bus>,
    state: ClientState,
    timeout: Duration,
}

impl ModelManager {
    pub fn new(bus: Arc<dyn Bus>, config: &ClientConfig) -> Self {
        Self {
            bus,
            state: ClientState::new(),
            timeout: config.request_timeout,
        }
    }

    pub fn connect(config: &ClientConfig) -> Self {
        Self::new(super::connect_bus(config), config)
    }

    fn call(&self, method: &str, args: Vec<BusValue>) -> Result<BusValue> {
        Ok(self.bus.call(MODEL_INFO_PATH, method, args, self.timeout)?)
    }

    fn call_json(&self, method: &str, args: Vec<BusValue>) -> Result<String> {
        Ok(self.call(method, args)?.into_string()?)
    }

    /// Capabilities the daemon has at least one backend for.
    ///
    /// Names this client does not know are skipped.
    pub fn supported_capabilities(&self) -> Result<Vec<Capability>> {
        let result = self.call_json("GetSupportedCapabilities", Vec::new()).and_then(|reply| {
            let names: Vec<Value> = serde_json::from_str(&reply)
                .map_err(|e| AiError::parse(format!("capability list: {e}")))?;
            Ok(names
                .iter()
                .filter_map(Value::as_str)
                .filter_map(|name| match name.parse::<Capability>() {
                    Ok(cap) => Some(cap),
                    Err(_) => {
                        debug!(capability = name, "skipping unknown capability");
                        None
                    }
                })
                .collect())
        });
        self.state.record_query(result)
    }

    /// Whether any model serves `capability`.
    pub fn is_capability_available(&self, capability: Capability) -> Result<bool> {
        Ok(!self.available_models(Some(capability))?.is_empty())
    }

    /// Models serving `capability`, or every model when `None`.
    pub fn available_models(&self, capability: Option<Capability>) -> Result<Vec<ModelInfo>> {
        let reply = match capability {
            Some(cap) => self.call_json("GetModelsForCapability", vec![BusValue::from(cap.as_str())]),
            None => self.call_json("GetAllModels", Vec::new()),
        };
        let result = reply.and_then(|r| parse_model_list(&r));
        self.state.record_query(result)
    }

    /// Descriptor of the model called `name`, `None` if the registry has none.
    pub fn model_info(&self, name: &str) -> Result<Option<ModelInfo>> {
        let result = self
            .call_json("GetModelInfo", vec![BusValue::from(name)])
            .and_then(|reply| {
                let info = ModelInfo::from_json(&parse_object(&reply)?);
                Ok((!info.name.is_empty()).then_some(info))
            });
        self.state.record_query(result)
    }

    /// Name of the model currently selected for `capability`.
    pub fn current_model_for_capability(&self, capability: Capability) -> Result<String> {
        let result = self.call_json(
            "GetCurrentModelForCapability",
            vec![BusValue::from(capability.as_str())],
        );
        self.state.record_query(result)
    }

    pub fn provider_list(&self) -> Result<Vec<String>> {
        let result = self
            .call("GetProviderList", Vec::new())
            .and_then(|v| Ok(v.into_str_list()?));
        self.state.record_query(result)
    }

    pub fn models_for_provider(&self, provider: &str) -> Result<Vec<ModelInfo>> {
        let result = self
            .call_json("GetModelsForProvider", vec![BusValue::from(provider)])
            .and_then(|r| parse_model_list(&r));
        self.state.record_query(result)
    }

    pub fn last_error(&self) -> LastError {
        self.state.last_error()
    }
}

/// `{"models": [...]}`; entries without a name are dropped.
fn parse_model_list(reply: &str) -> Result<Vec<ModelInfo>> {
    let obj = parse_object(reply)?;
    let models = obj
        .get("models")
        .and_then(Value::as_array)
        .map(|items| {
            items
                .iter()
                .filter_map(Value::as_object)
                .map(ModelInfo::from_json)
                .filter(|m| !m.name.is_empty())
                .collect()
        })
        .unwrap_or_default();
    Ok(models)
}
