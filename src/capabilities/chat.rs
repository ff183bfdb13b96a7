//! Chat completion.

use std::sync::Arc;
use std::time::Duration;

use tracing::debug;

use super::{abandon_stream, require_text, send_terminate, wait_mapped};
use crate::bus::{Bus, BusValue, Signal};
use crate::config::ClientConfig;
use crate::error::{AiError, LastError, Result};
use crate::model::ChatHistory;
use crate::params::{Params, package_chat_params};
use crate::reply::unpack_error_code;
use crate::session::{Capability, SessionProxy};
use crate::state::ClientState;

/// Output of a streamed chat.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChatEvent {
    /// Next piece of generated text.
    Output(String),
    /// The stream ended; `code` 0 means success.
    Finished { code: i32, message: String },
}

#[derive(Debug)]
pub struct ChatClient {
    session: SessionProxy,
    state: ClientState,
    chat_timeout: Duration,
}

impl ChatClient {
    pub fn new(bus: Arc<dyn Bus>, config: &ClientConfig) -> Self {
        Self {
            session: SessionProxy::new(bus, Capability::Chat, config.timeout_for(Capability::Chat)),
            state: ClientState::new(),
            chat_timeout: config.chat_timeout,
        }
    }

    /// Client talking to the daemon socket from `config`.
    pub fn connect(config: &ClientConfig) -> Self {
        Self::new(super::connect_bus(config), config)
    }

    /// Blocking completion of `prompt` given the earlier turns in `history`.
    pub fn chat(&self, prompt: &str, history: &[ChatHistory], params: &Params) -> Result<String> {
        let result = self.chat_inner(prompt, history, params);
        self.state.record(result)
    }

    fn chat_inner(&self, prompt: &str, history: &[ChatHistory], params: &Params) -> Result<String> {
        require_text(prompt, "prompt")?;
        self.session.ensure()?;
        let _guard = self.state.begin()?;

        let reply = self
            .session
            .call_with_timeout(
                "chat",
                vec![
                    BusValue::from(prompt),
                    BusValue::from(package_chat_params(history, params)),
                ],
                self.chat_timeout,
            )?
            .into_string()?;
        unpack_error_code(&reply, "content")
    }

    /// Start a streamed completion. Output arrives as [`ChatEvent`]s through
    /// [`poll_events`](Self::poll_events) or [`wait_event`](Self::wait_event).
    pub fn chat_stream(&self, prompt: &str, history: &[ChatHistory], params: &Params) -> Result<()> {
        let result = self.chat_stream_inner(prompt, history, params);
        self.state.record(result)
    }

    fn chat_stream_inner(
        &self,
        prompt: &str,
        history: &[ChatHistory],
        params: &Params,
    ) -> Result<()> {
        require_text(prompt, "prompt")?;
        self.session.ensure()?;
        let guard = self.state.begin()?;

        // Chat signals carry no stream id; anything still queued belongs to
        // an earlier completion.
        self.session.discard_events();
        self.session.call(
            "streamChat",
            vec![
                BusValue::from(prompt),
                BusValue::from(package_chat_params(history, params)),
            ],
        )?;
        // The session handle stands in for the missing stream id.
        guard.stream(self.session.handle().unwrap_or_default());
        Ok(())
    }

    /// Events received since the last poll.
    pub fn poll_events(&self) -> Vec<ChatEvent> {
        match self.session.drain_events() {
            Ok(signals) => signals
                .into_iter()
                .filter_map(|s| self.handle_signal(s))
                .collect(),
            Err(e) => self.feed_lost(&e).into_iter().collect(),
        }
    }

    /// Block up to `timeout` for the next event.
    pub fn wait_event(&self, timeout: Duration) -> Option<ChatEvent> {
        wait_mapped(&self.session, timeout, |s| self.handle_signal(s))
            .unwrap_or_else(|e| self.feed_lost(&e))
    }

    fn feed_lost(&self, err: &AiError) -> Option<ChatEvent> {
        abandon_stream(&self.state, err)
            .map(|(code, message)| ChatEvent::Finished { code, message })
    }

    fn handle_signal(&self, signal: Signal) -> Option<ChatEvent> {
        if !self.state.is_streaming() {
            debug!(signal = %signal.name, "dropping chat signal outside a stream");
            return None;
        }
        match signal.name.as_str() {
            "StreamOutput" => Some(ChatEvent::Output(signal.str_arg(0).to_string())),
            "StreamFinished" => {
                let handle = self.session.handle().unwrap_or_default();
                if !self.state.close_stream(&handle) {
                    return None;
                }
                let code = signal.int_arg(0);
                let message = if code == 0 {
                    String::new()
                } else {
                    signal.str_arg(1).to_string()
                };
                if code == 0 {
                    self.state.clear_error();
                } else {
                    self.state.set_error(&AiError::Daemon {
                        code,
                        message: message.clone(),
                    });
                }
                Some(ChatEvent::Finished { code, message })
            }
            other => {
                debug!(signal = other, "ignoring chat signal");
                None
            }
        }
    }

    /// Ask the daemon to stop the running completion.
    pub fn terminate(&self) {
        send_terminate(&self.session, "terminate");
        self.state.force_idle();
    }

    pub fn is_running(&self) -> bool {
        self.state.is_running()
    }

    pub fn last_error(&self) -> LastError {
        self.state.last_error()
    }
}
