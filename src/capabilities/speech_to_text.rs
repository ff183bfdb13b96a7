//! Speech recognition, from files or from a live audio stream.
//!
//! A stream is opened with [`SpeechToTextClient::start_stream_recognition`],
//! fed with [`send_audio_data`](SpeechToTextClient::send_audio_data) and closed
//! with [`end_stream_recognition`](SpeechToTextClient::end_stream_recognition).
//! Results arrive as [`RecognitionEvent`]s tagged with the daemon's stream id;
//! events of any other stream are dropped.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info};

use super::{abandon_stream, require_data, require_existing, send_terminate, wait_mapped};
use crate::bus::{Bus, BusValue, Signal};
use crate::config::ClientConfig;
use crate::error::{AiError, LastError, Result};
use crate::params::{Params, package_params};
use crate::reply::{parse_object, unpack_error_code};
use crate::session::{Capability, SessionProxy};
use crate::state::ClientState;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecognitionEvent {
    Result(String),
    PartialResult(String),
    Error { code: i32, message: String },
    Completed(String),
}

#[derive(Debug)]
pub struct SpeechToTextClient {
    session: SessionProxy,
    state: ClientState,
    speech_timeout: Duration,
}

impl SpeechToTextClient {
    pub fn new(bus: Arc<dyn Bus>, config: &ClientConfig) -> Self {
        Self {
            session: SessionProxy::new(
                bus,
                Capability::SpeechToText,
                config.timeout_for(Capability::SpeechToText),
            ),
            state: ClientState::new(),
            speech_timeout: config.speech_timeout,
        }
    }

    pub fn connect(config: &ClientConfig) -> Self {
        Self::new(super::connect_bus(config), config)
    }

    /// Transcribe the audio file at `audio_file` (absolute, existing).
    pub fn recognize_file(&self, audio_file: impl AsRef<Path>, params: &Params) -> Result<String> {
        let result = require_existing(audio_file.as_ref(), "audio file")
            .and_then(|path| self.recognize_file_inner(path, params));
        self.state.record(result)
    }

    fn recognize_file_inner(&self, path: String, params: &Params) -> Result<String> {
        self.session.ensure()?;
        let _guard = self.state.begin()?;

        let reply = self
            .session
            .call_with_timeout(
                "recognizeFile",
                vec![BusValue::from(path), BusValue::from(package_params(params))],
                self.speech_timeout,
            )?
            .into_string()?;
        unpack_error_code(&reply, "text")
    }

    /// Open a recognition stream. Fails with [`AiError::Busy`] while another
    /// operation or stream is active on this client.
    pub fn start_stream_recognition(&self, params: &Params) -> Result<()> {
        let result = self.start_stream_inner(params);
        self.state.record(result)
    }

    fn start_stream_inner(&self, params: &Params) -> Result<()> {
        self.session.ensure()?;
        let guard = self.state.begin()?;

        let stream_id = self
            .session
            .call("startStreamRecognition", vec![BusValue::from(package_params(params))])?
            .into_string()?;
        if stream_id.is_empty() {
            return Err(AiError::unavailable("failed to start stream recognition"));
        }
        info!(stream_id = %stream_id, "recognition stream started");
        guard.stream(stream_id);
        Ok(())
    }

    /// Push a chunk of audio into the open stream.
    ///
    /// Returns `Ok(false)` without contacting the daemon when no stream is open.
    pub fn send_audio_data(&self, audio: &[u8]) -> Result<bool> {
        let Some(stream_id) = self.state.stream_tag() else {
            return Ok(false);
        };
        let result = require_data(audio, "audio chunk").and_then(|()| {
            match self
                .session
                .call_bound("sendAudioData", vec![BusValue::from(stream_id), audio.into()])
            {
                Some(reply) => Ok(reply?.as_bool()?),
                None => Ok(false),
            }
        });
        self.state.record_query(result)
    }

    /// Close the open stream and return the final transcript.
    ///
    /// The daemon is asked to end the stream even after a completion or error
    /// event. A no-op returning an empty string when no stream was started.
    pub fn end_stream_recognition(&self) -> Result<String> {
        let (stream_id, _guard) = match self.state.begin_end_stream() {
            Ok(Some(open)) => open,
            Ok(None) => return Ok(String::new()),
            Err(e) => return self.state.record(Err(e)),
        };
        let result = self.end_stream_inner(stream_id);
        self.state.record(result)
    }

    fn end_stream_inner(&self, stream_id: String) -> Result<String> {
        debug!(stream_id = %stream_id, "ending recognition stream");
        let reply = match self
            .session
            .call_bound("endStreamRecognition", vec![BusValue::from(stream_id)])
        {
            Some(reply) => reply?.into_string()?,
            None => return Ok(String::new()),
        };
        // Older daemons answer with the bare transcript.
        if parse_object(&reply).is_ok() {
            unpack_error_code(&reply, "text")
        } else {
            Ok(reply)
        }
    }

    /// Stream id of the open stream, if any.
    pub fn stream_id(&self) -> Option<String> {
        self.state.stream_tag()
    }

    pub fn poll_events(&self) -> Vec<RecognitionEvent> {
        match self.session.drain_events() {
            Ok(signals) => signals
                .into_iter()
                .filter_map(|s| self.handle_signal(s))
                .collect(),
            Err(e) => self.feed_lost(&e).into_iter().collect(),
        }
    }

    pub fn wait_event(&self, timeout: Duration) -> Option<RecognitionEvent> {
        wait_mapped(&self.session, timeout, |s| self.handle_signal(s))
            .unwrap_or_else(|e| self.feed_lost(&e))
    }

    fn feed_lost(&self, err: &AiError) -> Option<RecognitionEvent> {
        abandon_stream(&self.state, err)
            .map(|(code, message)| RecognitionEvent::Error { code, message })
    }

    fn handle_signal(&self, signal: Signal) -> Option<RecognitionEvent> {
        let stream_id = signal.str_arg(0);
        if self.state.stream_tag().as_deref() != Some(stream_id) {
            debug!(stream_id, signal = %signal.name, "dropping event of stale stream");
            return None;
        }
        match signal.name.as_str() {
            "RecognitionResult" => Some(RecognitionEvent::Result(signal.str_arg(1).to_string())),
            "RecognitionPartialResult" => {
                Some(RecognitionEvent::PartialResult(signal.str_arg(1).to_string()))
            }
            "RecognitionError" => {
                let code = signal.int_arg(1);
                let message = signal.str_arg(2).to_string();
                self.state.finish_stream(stream_id);
                self.state.set_error(&AiError::Daemon {
                    code,
                    message: message.clone(),
                });
                Some(RecognitionEvent::Error { code, message })
            }
            "RecognitionCompleted" => {
                self.state.finish_stream(stream_id);
                self.state.clear_error();
                Some(RecognitionEvent::Completed(signal.str_arg(1).to_string()))
            }
            other => {
                debug!(signal = other, "ignoring speech signal");
                None
            }
        }
    }

    pub fn supported_formats(&self) -> Result<Vec<String>> {
        let result = self
            .session
            .call("getSupportedFormats", Vec::new())
            .and_then(|v| Ok(v.into_str_list()?));
        self.state.record_query(result)
    }

    /// Stop whatever is running and forget the open stream.
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
