//! Client configuration.
//!
//! Defaults match what the daemon expects for each capability; every value can
//! be overridden from the environment (a `.env` file is honoured too).

use std::path::PathBuf;
use std::time::Duration;

use crate::bus::protocol::default_socket_path;
use crate::session::Capability;

/// Configuration shared by every capability client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientConfig {
    /// Path to the daemon's Unix socket.
    pub socket_path: PathBuf,
    /// Connection timeout.
    pub connect_timeout: Duration,
    /// Timeout for quick calls (session setup, capability queries, stream control).
    pub request_timeout: Duration,
    /// Timeout for chat and function calling.
    pub chat_timeout: Duration,
    /// Timeout for OCR and image recognition.
    pub recognition_timeout: Duration,
    /// Timeout for file-based speech recognition.
    pub speech_timeout: Duration,
    /// Timeout for speech synthesis.
    pub synthesis_timeout: Duration,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            socket_path: default_socket_path(),
            connect_timeout: Duration::from_secs(2),
            request_timeout: Duration::from_secs(10),
            chat_timeout: Duration::from_secs(30),
            recognition_timeout: Duration::from_secs(30),
            speech_timeout: Duration::from_secs(5 * 60),
            synthesis_timeout: Duration::from_secs(30),
        }
    }
}

impl ClientConfig {
    /// Load config from environment variables.
    pub fn from_env() -> Self {
        let mut cfg = Self::default();

        if let Ok(path) = dotenvy::var("AI_DAEMON_SOCKET") {
            cfg.socket_path = PathBuf::from(path);
        }

        let millis = |key: &str| -> Option<Duration> {
            dotenvy::var(key)
                .ok()
                .and_then(|val| val.parse::<u64>().ok())
                .map(Duration::from_millis)
        };

        if let Some(t) = millis("AI_DAEMON_CONNECT_TIMEOUT_MS") {
            cfg.connect_timeout = t;
        }
        if let Some(t) = millis("AI_DAEMON_REQUEST_TIMEOUT_MS") {
            cfg.request_timeout = t;
        }
        if let Some(t) = millis("AI_DAEMON_CHAT_TIMEOUT_MS") {
            cfg.chat_timeout = t;
        }
        if let Some(t) = millis("AI_DAEMON_RECOGNITION_TIMEOUT_MS") {
            cfg.recognition_timeout = t;
        }
        if let Some(t) = millis("AI_DAEMON_SPEECH_TIMEOUT_MS") {
            cfg.speech_timeout = t;
        }
        if let Some(t) = millis("AI_DAEMON_SYNTHESIS_TIMEOUT_MS") {
            cfg.synthesis_timeout = t;
        }

        cfg
    }

    /// Timeout a freshly bound proxy starts with for the given capability.
    ///
    /// Long-running operations switch to their own timeout per call
    /// (`chat_timeout`, `speech_timeout`, ...).
    pub fn timeout_for(&self, capability: Capability) -> Duration {
        match capability {
            Capability::Ocr | Capability::ImageRecognition => self.recognition_timeout,
            Capability::Chat
            | Capability::FunctionCalling
            | Capability::SpeechToText
            | Capability::TextToSpeech
            | Capability::Embedding => self.request_timeout,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_defaults() {
        let config = ClientConfig::default();
        assert_eq!(config.connect_timeout, Duration::from_secs(2));
        assert_eq!(config.request_timeout, Duration::from_secs(10));
        assert_eq!(config.chat_timeout, Duration::from_secs(30));
        assert_eq!(config.speech_timeout, Duration::from_secs(300));
    }

    #[test]
    fn test_timeout_per_capability() {
        let config = ClientConfig::default();
        assert_eq!(
            config.timeout_for(Capability::Ocr),
            config.recognition_timeout
        );
        assert_eq!(config.timeout_for(Capability::Chat), config.request_timeout);
        assert_eq!(
            config.timeout_for(Capability::TextToSpeech),
            config.request_timeout
        );
    }

    #[test]
    fn test_default_socket_path() {
        let config = ClientConfig::default();
        let path_str = config.socket_path.to_string_lossy();
        assert!(path_str.starts_with("/tmp/ai-daemon-"));
        assert!(path_str.ends_with(".sock"));
    }
}
