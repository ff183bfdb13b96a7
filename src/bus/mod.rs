//! Inter-process bus between capability clients and the AI daemon.
//!
//! The daemon exposes objects at well-known paths. Clients invoke methods on
//! those objects and subscribe to the signals they emit:
//!
//! ```text
//! ┌──────────────┐  Call{path,method,args}  ┌──────────────────────────────┐
//! │ OcrClient    │ ───────────────────────▶ │ /ai/daemon/SessionManager    │
//! │ ChatClient   │ ◀─────── Reply ───────── │ /ai/daemon/Session/<handle>  │
//! │ ...          │ ◀────── Signal ───────── │ /ai/daemon/EmbeddingPlatform │
//! └──────────────┘                          │ /ai/daemon/ModelInfo         │
//!                                           └──────────────────────────────┘
//! ```
//!
//! Two implementations ship with the crate:
//! - [`client::UdsBus`] talks to a running daemon over a Unix Domain Socket.
//! - [`memory::MemoryBus`] is an in-process stand-in with scripted handlers.

pub mod client;
pub mod memory;
pub mod protocol;

use std::fmt;
use std::time::Duration;

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, TryRecvError, bounded};
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use client::UdsBus;
pub use memory::MemoryBus;

/// Object path of the session manager.
pub const SESSION_MANAGER_PATH: &str = "/ai/daemon/SessionManager";
/// Prefix under which per-capability session objects live.
pub const SESSION_PATH_PREFIX: &str = "/ai/daemon/Session";
/// Object path of the embedding / RAG platform.
pub const EMBEDDING_PLATFORM_PATH: &str = "/ai/daemon/EmbeddingPlatform";
/// Object path of the model registry.
pub const MODEL_INFO_PATH: &str = "/ai/daemon/ModelInfo";

/// Object path of the session identified by `handle`.
pub fn session_path(handle: &str) -> String {
    format!("{SESSION_PATH_PREFIX}/{handle}")
}

/// A loosely typed value carried in call arguments, replies and signals.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum BusValue {
    Unit,
    Bool(bool),
    Int(i64),
    Str(String),
    Bytes(Vec<u8>),
    StrList(Vec<String>),
}

impl BusValue {
    fn kind(&self) -> &'static str {
        match self {
            BusValue::Unit => "unit",
            BusValue::Bool(_) => "bool",
            BusValue::Int(_) => "int",
            BusValue::Str(_) => "string",
            BusValue::Bytes(_) => "bytes",
            BusValue::StrList(_) => "string list",
        }
    }

    fn mismatch(&self, expected: &str) -> BusError {
        BusError::Protocol(format!(
            "expected {expected} reply, got {}",
            self.kind()
        ))
    }

    pub fn into_string(self) -> Result<String, BusError> {
        match self {
            BusValue::Str(s) => Ok(s),
            other => Err(other.mismatch("string")),
        }
    }

    pub fn into_str_list(self) -> Result<Vec<String>, BusError> {
        match self {
            BusValue::StrList(list) => Ok(list),
            other => Err(other.mismatch("string list")),
        }
    }

    pub fn into_bytes(self) -> Result<Vec<u8>, BusError> {
        match self {
            BusValue::Bytes(bytes) => Ok(bytes),
            other => Err(other.mismatch("bytes")),
        }
    }

    pub fn as_bool(&self) -> Result<bool, BusError> {
        match self {
            BusValue::Bool(b) => Ok(*b),
            other => Err(other.mismatch("bool")),
        }
    }

    pub fn as_i64(&self) -> Result<i64, BusError> {
        match self {
            BusValue::Int(n) => Ok(*n),
            other => Err(other.mismatch("int")),
        }
    }
}

impl From<&str> for BusValue {
    fn from(s: &str) -> Self {
        BusValue::Str(s.to_string())
    }
}

impl From<String> for BusValue {
    fn from(s: String) -> Self {
        BusValue::Str(s)
    }
}

impl From<bool> for BusValue {
    fn from(b: bool) -> Self {
        BusValue::Bool(b)
    }
}

impl From<i64> for BusValue {
    fn from(n: i64) -> Self {
        BusValue::Int(n)
    }
}

impl From<i32> for BusValue {
    fn from(n: i32) -> Self {
        BusValue::Int(i64::from(n))
    }
}

impl From<&[u8]> for BusValue {
    fn from(bytes: &[u8]) -> Self {
        BusValue::Bytes(bytes.to_vec())
    }
}

impl From<Vec<u8>> for BusValue {
    fn from(bytes: Vec<u8>) -> Self {
        BusValue::Bytes(bytes)
    }
}

impl From<Vec<String>> for BusValue {
    fn from(list: Vec<String>) -> Self {
        BusValue::StrList(list)
    }
}

/// A notification emitted by a daemon object.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Signal {
    /// Path of the emitting object.
    pub path: String,
    /// Signal name, e.g. `SynthesisResult`.
    pub name: String,
    pub args: Vec<BusValue>,
}

impl Signal {
    pub fn new(path: impl Into<String>, name: impl Into<String>, args: Vec<BusValue>) -> Self {
        Self {
            path: path.into(),
            name: name.into(),
            args,
        }
    }

    /// String argument at `idx`, or empty when absent or of another type.
    pub fn str_arg(&self, idx: usize) -> &str {
        match self.args.get(idx) {
            Some(BusValue::Str(s)) => s,
            _ => "",
        }
    }

    /// Integer argument at `idx`, or 0 when absent or of another type.
    pub fn int_arg(&self, idx: usize) -> i32 {
        match self.args.get(idx) {
            Some(BusValue::Int(n)) => i32::try_from(*n).unwrap_or(i32::MAX),
            _ => 0,
        }
    }

    /// Byte argument at `idx`; string arguments are taken as UTF-8 bytes.
    pub fn bytes_arg(&self, idx: usize) -> Vec<u8> {
        match self.args.get(idx) {
            Some(BusValue::Bytes(b)) => b.clone(),
            Some(BusValue::Str(s)) => s.as_bytes().to_vec(),
            _ => Vec::new(),
        }
    }
}

/// Signals a subscription buffers before newer ones are dropped.
pub const SIGNAL_QUEUE_CAPACITY: usize = 1024;

/// Channel feeding a [`Subscription`]. Senders should use `try_send` so a
/// reader that never drains cannot stall the transport.
pub fn signal_channel() -> (Sender<Signal>, Receiver<Signal>) {
    bounded(SIGNAL_QUEUE_CAPACITY)
}

/// Live stream of signals from one object path.
///
/// Dropping the subscription releases the underlying transport resources.
/// Once the transport side goes away, receiving fails with
/// [`BusError::Unavailable`] instead of reporting an empty queue forever.
pub struct Subscription {
    events: Receiver<Signal>,
    closer: Option<Box<dyn FnOnce() + Send>>,
}

impl Subscription {
    pub fn new(events: Receiver<Signal>) -> Self {
        Self {
            events,
            closer: None,
        }
    }

    /// Subscription that runs `closer` when dropped.
    pub fn with_closer(events: Receiver<Signal>, closer: impl FnOnce() + Send + 'static) -> Self {
        Self {
            events,
            closer: Some(Box::new(closer)),
        }
    }

    /// Block up to `timeout` for the next signal; `Ok(None)` on timeout.
    pub fn recv_timeout(&self, timeout: Duration) -> Result<Option<Signal>, BusError> {
        match self.events.recv_timeout(timeout) {
            Ok(signal) => Ok(Some(signal)),
            Err(RecvTimeoutError::Timeout) => Ok(None),
            Err(RecvTimeoutError::Disconnected) => Err(feed_closed()),
        }
    }

    /// Everything queued right now, in arrival order.
    ///
    /// Signals queued before the feed closed are still returned; the error
    /// comes on the first call that finds nothing left.
    pub fn drain(&self) -> Result<Vec<Signal>, BusError> {
        let mut signals = Vec::new();
        loop {
            match self.events.try_recv() {
                Ok(signal) => signals.push(signal),
                Err(TryRecvError::Empty) => return Ok(signals),
                Err(TryRecvError::Disconnected) if signals.is_empty() => {
                    return Err(feed_closed());
                }
                Err(TryRecvError::Disconnected) => return Ok(signals),
            }
        }
    }
}

fn feed_closed() -> BusError {
    BusError::Unavailable("signal feed closed".to_string())
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("pending", &self.events.len())
            .finish()
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(close) = self.closer.take() {
            close();
        }
    }
}

/// Transport-level failure.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum BusError {
    #[error("bus unavailable: {0}")]
    Unavailable(String),

    #[error("bus timeout: {0}")]
    Timeout(String),

    #[error("remote error ({code:?}): {message}")]
    Remote {
        code: protocol::ErrorCode,
        message: String,
    },

    #[error("protocol error: {0}")]
    Protocol(String),
}

impl BusError {
    /// Whether the object the call targeted can no longer be used.
    pub fn invalidates_object(&self) -> bool {
        match self {
            BusError::Unavailable(_) => true,
            BusError::Remote { code, .. } => *code == protocol::ErrorCode::UnknownObject,
            BusError::Timeout(_) | BusError::Protocol(_) => false,
        }
    }
}

/// Message transport to the daemon.
pub trait Bus: Send + Sync {
    /// Short identifier for logs.
    fn id(&self) -> &str;

    /// Invoke `method` on the object at `path`, blocking up to `timeout`.
    fn call(
        &self,
        path: &str,
        method: &str,
        args: Vec<BusValue>,
        timeout: Duration,
    ) -> Result<BusValue, BusError>;

    /// Start receiving the signals emitted by the object at `path`.
    fn subscribe(&self, path: &str) -> Result<Subscription, BusError>;
}

impl fmt::Debug for dyn Bus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Bus({})", self.id())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crossbeam_channel::unbounded;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicBool, Ordering};

    #[test]
    fn test_session_path() {
        assert_eq!(session_path("abc"), "/ai/daemon/Session/abc");
    }

    #[test]
    fn test_reply_type_mismatch_is_protocol_error() {
        let err = BusValue::Int(3).into_string().unwrap_err();
        assert!(matches!(err, BusError::Protocol(_)));
        assert_eq!(
            BusValue::from("x").into_string().unwrap(),
            "x".to_string()
        );
    }

    #[test]
    fn test_signal_args_default_when_missing() {
        let signal = Signal::new("/p", "Evt", vec![BusValue::from("id"), BusValue::Int(7)]);
        assert_eq!(signal.str_arg(0), "id");
        assert_eq!(signal.int_arg(1), 7);
        assert_eq!(signal.str_arg(5), "");
        assert_eq!(signal.int_arg(0), 0);
        assert_eq!(signal.bytes_arg(0), b"id".to_vec());
    }

    #[test]
    fn test_subscription_runs_closer_on_drop() {
        let closed = Arc::new(AtomicBool::new(false));
        let (tx, rx) = unbounded();
        let flag = closed.clone();
        let sub = Subscription::with_closer(rx, move || flag.store(true, Ordering::SeqCst));

        tx.send(Signal::new("/p", "A", vec![])).unwrap();
        tx.send(Signal::new("/p", "B", vec![])).unwrap();
        let names: Vec<_> = sub.drain().unwrap().into_iter().map(|s| s.name).collect();
        assert_eq!(names, vec!["A", "B"]);

        drop(sub);
        assert!(closed.load(Ordering::SeqCst));
    }

    #[test]
    fn test_closed_feed_is_an_error_not_a_timeout() {
        let (tx, rx) = signal_channel();
        let sub = Subscription::new(rx);
        assert_eq!(sub.recv_timeout(Duration::from_millis(10)), Ok(None));

        tx.send(Signal::new("/p", "Last", vec![])).unwrap();
        drop(tx);
        assert_eq!(sub.drain().unwrap().len(), 1);
        assert!(matches!(sub.drain(), Err(BusError::Unavailable(_))));
        assert!(matches!(
            sub.recv_timeout(Duration::from_secs(5)),
            Err(BusError::Unavailable(_))
        ));
    }

    #[test]
    fn test_signal_queue_is_bounded() {
        let (tx, rx) = signal_channel();
        for _ in 0..SIGNAL_QUEUE_CAPACITY {
            tx.try_send(Signal::new("/p", "Tick", vec![])).unwrap();
        }
        assert!(tx.try_send(Signal::new("/p", "Tick", vec![])).is_err());
        assert_eq!(Subscription::new(rx).drain().unwrap().len(), SIGNAL_QUEUE_CAPACITY);
    }

    #[test]
    fn test_invalidating_errors() {
        assert!(BusError::Unavailable("gone".into()).invalidates_object());
        assert!(
            BusError::Remote {
                code: protocol::ErrorCode::UnknownObject,
                message: "no such session".into()
            }
            .invalidates_object()
        );
        assert!(!BusError::Timeout("slow".into()).invalidates_object());
    }
}
