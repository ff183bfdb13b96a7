//! Accumulation of streamed payloads against a stream identifier.
//!
//! Events that carry another stream's identifier are dropped without touching
//! the buffer; they are trailing output of a stream that already ended.

use tracing::debug;

/// Append-only buffer for the stream currently open on a client.
#[derive(Debug, Default, Clone)]
pub struct StreamAccumulator {
    stream_id: Option<String>,
    buffer: Vec<u8>,
}

impl StreamAccumulator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start collecting for `stream_id`, discarding anything buffered before.
    pub fn open(&mut self, stream_id: impl Into<String>) {
        self.stream_id = Some(stream_id.into());
        self.buffer.clear();
    }

    pub fn stream_id(&self) -> Option<&str> {
        self.stream_id.as_deref()
    }

    pub fn is_open(&self) -> bool {
        self.stream_id.is_some()
    }

    /// Whether an event tagged `stream_id` belongs to the open stream.
    pub fn accepts(&self, stream_id: &str) -> bool {
        self.stream_id.as_deref() == Some(stream_id)
    }

    /// Append `chunk` if it belongs to the open stream.
    pub fn push(&mut self, stream_id: &str, chunk: &[u8]) -> bool {
        if !self.accepts(stream_id) {
            debug!(
                stream_id,
                current = self.stream_id.as_deref().unwrap_or(""),
                "dropping chunk of stale stream"
            );
            return false;
        }
        self.buffer.extend_from_slice(chunk);
        true
    }

    /// Bytes collected so far for the open (or last closed) stream.
    pub fn data(&self) -> &[u8] {
        &self.buffer
    }

    /// Stop accepting events. The buffer stays readable until the next `open`.
    pub fn close(&mut self) -> Option<String> {
        self.stream_id.take()
    }

    /// Close and hand the collected bytes out.
    pub fn take(&mut self) -> Vec<u8> {
        self.stream_id = None;
        std::mem::take(&mut self.buffer)
    }

    /// Forget everything.
    pub fn reset(&mut self) {
        self.stream_id = None;
        self.buffer.clear();
    }
}
