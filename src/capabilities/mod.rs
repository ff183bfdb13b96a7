//! One client per daemon capability.
//!
//! Session-backed clients (chat, OCR, image recognition, speech, function
//! calling) follow the same call shape: check the input locally, make sure the
//! session exists, take the busy guard, forward the call and decode the reply.
//! The embedding platform and model registry live at fixed paths and need no
//! session.

pub mod chat;
pub mod embedding;
pub mod function_calling;
pub mod image;
pub mod models;
pub mod ocr;
pub mod speech_to_text;
pub mod text_to_speech;

use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::{debug, warn};

use crate::bus::{Bus, Signal, UdsBus};
use crate::config::ClientConfig;
use crate::error::{AiError, Result};
use crate::session::SessionProxy;
use crate::state::ClientState;

pub use chat::{ChatClient, ChatEvent};
pub use embedding::EmbeddingClient;
pub use function_calling::FunctionCallingClient;
pub use image::{ImageEvent, ImageRecognitionClient};
pub use models::ModelManager;
pub use ocr::OcrClient;
pub use speech_to_text::{RecognitionEvent, SpeechToTextClient};
pub use text_to_speech::{SynthesisEvent, TextToSpeechClient};

/// Bus to the daemon described by `config`.
pub fn connect_bus(config: &ClientConfig) -> Arc<dyn Bus> {
    Arc::new(UdsBus::new(config))
}

pub(crate) fn require_text(value: &str, what: &str) -> Result<()> {
    if value.trim().is_empty() {
        return Err(AiError::invalid(format!("empty {what}")));
    }
    Ok(())
}

pub(crate) fn require_data(data: &[u8], what: &str) -> Result<()> {
    if data.is_empty() {
        return Err(AiError::invalid(format!("empty {what}")));
    }
    Ok(())
}

/// Non-empty absolute path, returned as the string sent to the daemon.
///
/// Relative paths are refused outright: the daemon resolves paths against its
/// own working directory, not the caller's.
pub(crate) fn require_absolute(path: &Path, what: &str) -> Result<String> {
    if path.as_os_str().is_empty() {
        return Err(AiError::invalid(format!("empty {what}")));
    }
    if !path.is_absolute() {
        return Err(AiError::invalid(format!(
            "relative path not allowed for {what}: {}",
            path.display()
        )));
    }
    path.to_str()
        .map(str::to_string)
        .ok_or_else(|| AiError::invalid(format!("{what} is not valid UTF-8")))
}

/// Like [`require_absolute`], and the file must exist.
pub(crate) fn require_existing(path: &Path, what: &str) -> Result<String> {
    let raw = require_absolute(path, what)?;
    if !path.exists() {
        return Err(AiError::invalid(format!(
            "{what} does not exist: {}",
            path.display()
        )));
    }
    Ok(raw)
}

/// Wait up to `timeout` for a signal that `map` turns into an event.
///
/// `Ok(None)` on timeout; an error once the session's signal feed is gone.
pub(crate) fn wait_mapped<E>(
    session: &SessionProxy,
    timeout: Duration,
    mut map: impl FnMut(Signal) -> Option<E>,
) -> Result<Option<E>> {
    let deadline = Instant::now() + timeout;
    loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        let Some(signal) = session.wait_event(remaining)? else {
            return Ok(None);
        };
        if let Some(event) = map(signal) {
            return Ok(Some(event));
        }
        if remaining.is_zero() {
            return Ok(None);
        }
    }
}

/// Give up the running stream after its signal feed went away.
///
/// Returns the `(code, message)` to report as the stream's error event, or
/// `None` when nothing was streaming.
pub(crate) fn abandon_stream(state: &ClientState, err: &AiError) -> Option<(i32, String)> {
    if !state.abandon_stream() {
        return None;
    }
    warn!(error = %err, "stream lost with its signal feed");
    state.set_error(err);
    Some((err.code(), err.message().to_string()))
}

/// Best-effort remote stop; never fails.
pub(crate) fn send_terminate(session: &SessionProxy, method: &str) {
    if let Some(Err(e)) = session.call_bound(method, Vec::new()) {
        debug!(capability = %session.capability(), error = %e, "terminate failed");
    }
}
