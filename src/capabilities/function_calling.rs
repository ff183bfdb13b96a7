//! Function calling: map a prompt onto one of the caller's declared functions.

use std::sync::Arc;
use std::time::Duration;

use super::{require_text, send_terminate};
use crate::bus::{Bus, BusValue};
use crate::config::ClientConfig;
use crate::error::{LastError, Result};
use crate::params::{Params, package_optional_params};
use crate::reply::unpack_function;
use crate::session::{Capability, SessionProxy};
use crate::state::ClientState;

#[derive(Debug)]
pub struct FunctionCallingClient {
    session: SessionProxy,
    state: ClientState,
    timeout: Duration,
}

impl FunctionCallingClient {
    pub fn new(bus: Arc<dyn Bus>, config: &ClientConfig) -> Self {
        Self {
            session: SessionProxy::new(
                bus,
                Capability::FunctionCalling,
                config.timeout_for(Capability::FunctionCalling),
            ),
            state: ClientState::new(),
            timeout: config.chat_timeout,
        }
    }

    pub fn connect(config: &ClientConfig) -> Self {
        Self::new(super::connect_bus(config), config)
    }

    /// Pick the function `prompt` asks for out of `functions` (a JSON array of
    /// function declarations). Returns the chosen call as compact JSON, e.g.
    /// `{"arguments":{"app":"calc"},"name":"open_app"}`.
    pub fn parse(&self, prompt: &str, functions: &str, params: &Params) -> Result<String> {
        let result = self.parse_inner(prompt, functions, params);
        self.state.record(result)
    }

    fn parse_inner(&self, prompt: &str, functions: &str, params: &Params) -> Result<String> {
        require_text(prompt, "prompt")?;
        require_text(functions, "function list")?;
        self.session.ensure()?;
        let _guard = self.state.begin()?;

        let reply = self
            .session
            .call_with_timeout(
                "Parse",
                vec![
                    BusValue::from(prompt),
                    BusValue::from(functions),
                    BusValue::from(package_optional_params(params)),
                ],
                self.timeout,
            )?
            .into_string()?;
        unpack_function(&reply)
    }

    pub fn terminate(&self) {
        send_terminate(&self.session, "Terminate");
        self.state.force_idle();
    }

    pub fn is_running(&self) -> bool {
        self.state.is_running()
    }

    pub fn last_error(&self) -> LastError {
        self.state.last_error()
    }
}
