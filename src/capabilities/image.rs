//! Image recognition: describe or answer questions about an image.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use tracing::debug;

use super::{require_data, require_existing, require_text, send_terminate, wait_mapped};
use crate::bus::{Bus, BusValue, Signal};
use crate::config::ClientConfig;
use crate::error::{AiError, LastError, Result};
use crate::params::{Params, package_params};
use crate::reply::unpack_inline_error;
use crate::session::{Capability, SessionProxy};
use crate::state::ClientState;

/// Asynchronous notification from an image recognition session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ImageEvent {
    Result(String),
    Error { code: i32, message: String },
    Completed(String),
}

#[derive(Debug)]
pub struct ImageRecognitionClient {
    session: SessionProxy,
    state: ClientState,
    recognition_timeout: Duration,
}

impl ImageRecognitionClient {
    pub fn new(bus: Arc<dyn Bus>, config: &ClientConfig) -> Self {
        Self {
            session: SessionProxy::new(
                bus,
                Capability::ImageRecognition,
                config.timeout_for(Capability::ImageRecognition),
            ),
            state: ClientState::new(),
            recognition_timeout: config.recognition_timeout,
        }
    }

    pub fn connect(config: &ClientConfig) -> Self {
        Self::new(super::connect_bus(config), config)
    }

    /// Run `prompt` against the image file at `image_path` (absolute, existing).
    pub fn recognize_image(
        &self,
        image_path: impl AsRef<Path>,
        prompt: &str,
        params: &Params,
    ) -> Result<String> {
        let result = require_existing(image_path.as_ref(), "image file")
            .and_then(|path| self.recognize("recognizeImage", path.into(), prompt, params));
        self.state.record(result)
    }

    /// Run `prompt` against encoded image bytes.
    pub fn recognize_image_data(&self, image_data: &[u8], prompt: &str, params: &Params) -> Result<String> {
        let result = require_data(image_data, "image data")
            .and_then(|()| self.recognize("recognizeImageData", image_data.into(), prompt, params));
        self.state.record(result)
    }

    /// Run `prompt` against an image the daemon fetches from `image_url`.
    pub fn recognize_image_url(&self, image_url: &str, prompt: &str, params: &Params) -> Result<String> {
        let result = require_text(image_url, "image URL")
            .and_then(|()| self.recognize("recognizeImageUrl", image_url.into(), prompt, params));
        self.state.record(result)
    }

    fn recognize(&self, method: &str, image: BusValue, prompt: &str, params: &Params) -> Result<String> {
        self.session.ensure()?;
        let _guard = self.state.begin()?;

        let reply = self
            .session
            .call_with_timeout(
                method,
                vec![image, BusValue::from(prompt), BusValue::from(package_params(params))],
                self.recognition_timeout,
            )?
            .into_string()?;
        unpack_inline_error(&reply, "content")
    }

    pub fn supported_image_formats(&self) -> Result<Vec<String>> {
        let result = self
            .session
            .call("getSupportedImageFormats", Vec::new())
            .and_then(|v| Ok(v.into_str_list()?));
        self.state.record_query(result)
    }

    /// Largest image the daemon accepts, in bytes.
    pub fn max_image_size(&self) -> Result<i32> {
        let result = self
            .session
            .call("getMaxImageSize", Vec::new())
            .and_then(|v| {
                let n = v.as_i64()?;
                i32::try_from(n).map_err(|_| AiError::parse(format!("image size out of range: {n}")))
            });
        self.state.record_query(result)
    }

    /// Events received since the last poll. Empty once the signal feed is
    /// gone; the next recognition call reconnects.
    pub fn poll_events(&self) -> Vec<ImageEvent> {
        match self.session.drain_events() {
            Ok(signals) => signals
                .into_iter()
                .filter_map(|s| self.handle_signal(s))
                .collect(),
            Err(e) => {
                debug!(error = %e, "no image recognition events");
                Vec::new()
            }
        }
    }

    pub fn wait_event(&self, timeout: Duration) -> Option<ImageEvent> {
        wait_mapped(&self.session, timeout, |s| self.handle_signal(s))
            .unwrap_or_else(|e| {
                debug!(error = %e, "no image recognition events");
                None
            })
    }

    // Image signals are not tied to a stream; every one is delivered.
    fn handle_signal(&self, signal: Signal) -> Option<ImageEvent> {
        match signal.name.as_str() {
            "recognitionResult" => Some(ImageEvent::Result(signal.str_arg(1).to_string())),
            "recognitionError" => {
                let code = signal.int_arg(1);
                let message = signal.str_arg(2).to_string();
                self.state.set_error(&AiError::Daemon {
                    code,
                    message: message.clone(),
                });
                Some(ImageEvent::Error { code, message })
            }
            "recognitionCompleted" => Some(ImageEvent::Completed(signal.str_arg(1).to_string())),
            other => {
                debug!(signal = other, "ignoring image recognition signal");
                None
            }
        }
    }

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
