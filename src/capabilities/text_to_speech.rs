//! Speech synthesis, one-shot or streamed.
//!
//! Streamed audio is collected in a [`StreamAccumulator`] keyed by the daemon's
//! stream id, so [`TextToSpeechClient::accumulated`] always holds exactly the
//! chunks of the current stream in arrival order.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use parking_lot::Mutex;
use serde_json::{Map, Value};
use tracing::{debug, info};

use super::{abandon_stream, require_text, send_terminate};
use crate::bus::{Bus, BusValue, Signal};
use crate::config::ClientConfig;
use crate::error::{AiError, LastError, Result};
use crate::params::{Params, package_params};
use crate::reply::unpack_coded_object;
use crate::session::{Capability, SessionProxy};
use crate::state::ClientState;
use crate::stream::StreamAccumulator;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SynthesisEvent {
    /// Audio for the current stream.
    Chunk(Vec<u8>),
    Error { code: i32, message: String },
    /// The daemon finished the stream; carries its final audio, if any.
    Completed(Vec<u8>),
}

#[derive(Debug)]
pub struct TextToSpeechClient {
    session: SessionProxy,
    state: ClientState,
    synthesis_timeout: Duration,
    accumulator: Mutex<StreamAccumulator>,
    pending: Mutex<VecDeque<SynthesisEvent>>,
}

impl TextToSpeechClient {
    pub fn new(bus: Arc<dyn Bus>, config: &ClientConfig) -> Self {
        Self {
            session: SessionProxy::new(
                bus,
                Capability::TextToSpeech,
                config.timeout_for(Capability::TextToSpeech),
            ),
            state: ClientState::new(),
            synthesis_timeout: config.synthesis_timeout,
            accumulator: Mutex::new(StreamAccumulator::new()),
            pending: Mutex::new(VecDeque::new()),
        }
    }

    pub fn connect(config: &ClientConfig) -> Self {
        Self::new(super::connect_bus(config), config)
    }

    /// Synthesize `text` in one call.
    ///
    /// Returns the decoded `audio_data` of the reply, or an empty buffer when
    /// the daemon delivers the audio through stream events instead.
    pub fn synthesize_text(&self, text: &str, params: &Params) -> Result<Vec<u8>> {
        let result = self.synthesize_inner(text, params);
        self.state.record(result)
    }

    fn synthesize_inner(&self, text: &str, params: &Params) -> Result<Vec<u8>> {
        require_text(text, "text")?;
        self.session.ensure()?;
        let _guard = self.state.begin()?;

        let reply = self
            .session
            .call_with_timeout(
                "synthesizeText",
                vec![BusValue::from(text), BusValue::from(package_params(params))],
                self.synthesis_timeout,
            )?
            .into_string()?;
        decode_audio(&unpack_coded_object(&reply)?)
    }

    /// Open a synthesis stream for `text`. Fails with [`AiError::Busy`] while
    /// another operation or stream is active on this client.
    pub fn start_stream_synthesis(&self, text: &str, params: &Params) -> Result<()> {
        let result = self.start_stream_inner(text, params);
        self.state.record(result)
    }

    fn start_stream_inner(&self, text: &str, params: &Params) -> Result<()> {
        require_text(text, "text")?;
        self.session.ensure()?;
        let guard = self.state.begin()?;

        let stream_id = self
            .session
            .call(
                "startStreamSynthesis",
                vec![BusValue::from(text), BusValue::from(package_params(params))],
            )?
            .into_string()?;
        if stream_id.is_empty() {
            return Err(AiError::unavailable("failed to start stream synthesis"));
        }
        info!(stream_id = %stream_id, "synthesis stream started");
        self.accumulator.lock().open(stream_id.clone());
        self.pending.lock().clear();
        guard.stream(stream_id);
        Ok(())
    }

    /// Close the open stream and return the daemon's final audio.
    ///
    /// The daemon is asked to end the stream even after a completion or error
    /// event. A no-op returning an empty buffer when no stream was started.
    /// Chunks that arrived before the call stay available through
    /// [`accumulated`](Self::accumulated).
    pub fn end_stream_synthesis(&self) -> Result<Vec<u8>> {
        self.pump();
        let (stream_id, _guard) = match self.state.begin_end_stream() {
            Ok(Some(open)) => open,
            Ok(None) => return Ok(Vec::new()),
            Err(e) => return self.state.record(Err(e)),
        };
        self.accumulator.lock().close();
        let result = self.end_stream_inner(stream_id);
        self.state.record(result)
    }

    fn end_stream_inner(&self, stream_id: String) -> Result<Vec<u8>> {
        debug!(stream_id = %stream_id, "ending synthesis stream");
        let reply = match self
            .session
            .call_bound("endStreamSynthesis", vec![BusValue::from(stream_id)])
        {
            Some(reply) => reply?.into_string()?,
            None => return Ok(Vec::new()),
        };
        decode_audio(&unpack_coded_object(&reply)?)
    }

    /// Audio collected for the current (or most recent) stream.
    pub fn accumulated(&self) -> Vec<u8> {
        self.pump();
        self.accumulator.lock().data().to_vec()
    }

    /// Stream id of the open stream, if any.
    pub fn stream_id(&self) -> Option<String> {
        self.state.stream_tag()
    }

    pub fn poll_events(&self) -> Vec<SynthesisEvent> {
        self.pump();
        self.pending.lock().drain(..).collect()
    }

    pub fn wait_event(&self, timeout: Duration) -> Option<SynthesisEvent> {
        let deadline = Instant::now() + timeout;
        loop {
            self.pump();
            if let Some(event) = self.pending.lock().pop_front() {
                return Some(event);
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return None;
            }
            match self.session.wait_event(remaining) {
                Ok(Some(signal)) => self.handle_signal(signal),
                Ok(None) => return None,
                Err(e) => return self.feed_lost(&e),
            }
        }
    }

    /// Move queued signals into the accumulator and the pending event queue.
    fn pump(&self) {
        match self.session.drain_events() {
            Ok(signals) => {
                for signal in signals {
                    self.handle_signal(signal);
                }
            }
            Err(e) => {
                if let Some(event) = self.feed_lost(&e) {
                    self.pending.lock().push_back(event);
                }
            }
        }
    }

    fn feed_lost(&self, err: &AiError) -> Option<SynthesisEvent> {
        let (code, message) = abandon_stream(&self.state, err)?;
        self.accumulator.lock().close();
        Some(SynthesisEvent::Error { code, message })
    }

    fn handle_signal(&self, signal: Signal) {
        let stream_id = signal.str_arg(0);
        let mut acc = self.accumulator.lock();
        if !acc.accepts(stream_id) {
            debug!(stream_id, signal = %signal.name, "dropping event of stale stream");
            return;
        }
        let event = match signal.name.as_str() {
            "SynthesisResult" => {
                let chunk = signal.bytes_arg(1);
                acc.push(stream_id, &chunk);
                SynthesisEvent::Chunk(chunk)
            }
            "SynthesisError" => {
                let code = signal.int_arg(1);
                let message = signal.str_arg(2).to_string();
                acc.close();
                self.state.finish_stream(stream_id);
                self.state.set_error(&AiError::Daemon {
                    code,
                    message: message.clone(),
                });
                SynthesisEvent::Error { code, message }
            }
            "SynthesisCompleted" => {
                acc.close();
                self.state.finish_stream(stream_id);
                self.state.clear_error();
                SynthesisEvent::Completed(signal.bytes_arg(1))
            }
            other => {
                debug!(signal = other, "ignoring synthesis signal");
                return;
            }
        };
        drop(acc);
        self.pending.lock().push_back(event);
    }

    pub fn supported_voices(&self) -> Result<Vec<String>> {
        let result = self
            .session
            .call("getSupportedVoices", Vec::new())
            .and_then(|v| Ok(v.into_str_list()?));
        self.state.record_query(result)
    }

    /// Stop whatever is running and forget the open stream.
    pub fn terminate(&self) {
        send_terminate(&self.session, "terminate");
        self.accumulator.lock().close();
        self.state.force_idle();
    }

    pub fn is_running(&self) -> bool {
        self.state.is_running()
    }

    pub fn last_error(&self) -> LastError {
        self.state.last_error()
    }
}

/// Base64 `audio_data` of a synthesis reply; empty when absent.
fn decode_audio(reply: &Map<String, Value>) -> Result<Vec<u8>> {
    match reply.get("audio_data").and_then(Value::as_str) {
        Some(encoded) if !encoded.is_empty() => BASE64
            .decode(encoded)
            .map_err(|e| AiError::parse(format!("audio_data is not base64: {e}"))),
        _ => Ok(Vec::new()),
    }
}
