//! Unix Domain Socket implementation of [`Bus`].
//!
//! Calls share one pooled request connection: a caller checks the connection
//! out for the duration of its exchange, so a concurrent caller (typically a
//! `terminate()` issued while a long recognition call blocks) opens a fresh
//! connection instead of interleaving frames. Each subscription gets its own
//! connection and reader thread.

use std::io::{Read, Write};
use std::net::Shutdown;
use std::os::unix::net::UnixStream;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use crossbeam_channel::{Sender, TrySendError};
use parking_lot::Mutex;
use tracing::{debug, trace, warn};

use super::protocol::{
    FramedMessage, MAX_FRAME_LEN, PROTOCOL_VERSION, Request, Response, decode_message,
    encode_message,
};
use super::{Bus, BusError, BusValue, Signal, Subscription, signal_channel};
use crate::config::ClientConfig;

/// Unix Domain Socket client for the AI daemon.
pub struct UdsBus {
    socket_path: PathBuf,
    connect_timeout: Duration,
    connection: Mutex<Option<UnixStream>>,
    available: AtomicBool,
    request_counter: AtomicU64,
}

impl UdsBus {
    /// Create a bus for the socket named in `config`. Nothing is connected yet.
    pub fn new(config: &ClientConfig) -> Self {
        Self {
            socket_path: config.socket_path.clone(),
            connect_timeout: config.connect_timeout,
            connection: Mutex::new(None),
            available: AtomicBool::new(false),
            request_counter: AtomicU64::new(0),
        }
    }

    /// Create a bus from environment configuration.
    pub fn with_defaults() -> Self {
        Self::new(&ClientConfig::from_env())
    }

    /// Whether the last exchange with the daemon succeeded.
    pub fn is_available(&self) -> bool {
        self.available.load(Ordering::SeqCst)
    }

    fn open(&self) -> Result<UnixStream, BusError> {
        let stream = UnixStream::connect(&self.socket_path).map_err(|e| {
            self.available.store(false, Ordering::SeqCst);
            BusError::Unavailable(format!(
                "daemon not running at {}: {}",
                self.socket_path.display(),
                e
            ))
        })?;
        stream
            .set_write_timeout(Some(self.connect_timeout))
            .map_err(|e| BusError::Unavailable(format!("socket setup failed: {}", e)))?;
        debug!(socket = %self.socket_path.display(), "Connected to daemon");
        Ok(stream)
    }

    /// Take the pooled connection, or open a new one if it is stale or in use.
    fn checkout(&self) -> Result<UnixStream, BusError> {
        if let Some(stream) = self.connection.lock().take() {
            if stream.peer_addr().is_ok() {
                return Ok(stream);
            }
            // Connection is stale, drop it and reconnect
        }
        self.open()
    }

    fn checkin(&self, stream: UnixStream) {
        let mut slot = self.connection.lock();
        if slot.is_none() {
            *slot = Some(stream);
        }
    }

    fn next_request_id(&self) -> String {
        format!("ai-{}", self.request_counter.fetch_add(1, Ordering::Relaxed))
    }

    /// Send a request and receive a response.
    fn send_request(&self, request: Request, timeout: Duration) -> Result<Response, BusError> {
        let msg = FramedMessage::new(self.next_request_id(), request);
        let encoded = encode_message(&msg)
            .map_err(|e| BusError::Protocol(format!("failed to encode request: {}", e)))?;

        let mut stream = self.checkout()?;
        stream
            .set_read_timeout(Some(timeout.max(Duration::from_millis(1))))
            .map_err(|e| BusError::Unavailable(format!("socket setup failed: {}", e)))?;

        stream.write_all(&encoded).map_err(|e| {
            self.available.store(false, Ordering::SeqCst);
            BusError::Unavailable(format!("failed to send request: {}", e))
        })?;

        let payload = read_frame(&mut stream).map_err(|e| {
            self.available.store(false, Ordering::SeqCst);
            if matches!(
                e.kind(),
                std::io::ErrorKind::TimedOut | std::io::ErrorKind::WouldBlock
            ) {
                BusError::Timeout("response timeout".to_string())
            } else {
                BusError::Unavailable(format!("failed to read response: {}", e))
            }
        })?;

        let response: FramedMessage<Response> = decode_message(&payload)
            .map_err(|e| BusError::Protocol(format!("failed to decode response: {}", e)))?;

        // Check version compatibility
        if response.version != PROTOCOL_VERSION {
            return Err(BusError::Protocol(format!(
                "protocol version mismatch: expected {}, got {}",
                PROTOCOL_VERSION, response.version
            )));
        }

        self.available.store(true, Ordering::SeqCst);
        self.checkin(stream);
        Ok(response.payload)
    }
}

impl Bus for UdsBus {
    fn id(&self) -> &str {
        "uds"
    }

    fn call(
        &self,
        path: &str,
        method: &str,
        args: Vec<BusValue>,
        timeout: Duration,
    ) -> Result<BusValue, BusError> {
        trace!(path, method, "bus call");
        let request = Request::Call {
            path: path.to_string(),
            method: method.to_string(),
            args,
        };
        match self.send_request(request, timeout)? {
            Response::Reply(value) => Ok(value),
            Response::Error(err) => Err(BusError::Remote {
                code: err.code,
                message: err.message,
            }),
            other => Err(BusError::Protocol(format!(
                "unexpected response: {:?}",
                other
            ))),
        }
    }

    fn subscribe(&self, path: &str) -> Result<Subscription, BusError> {
        let mut stream = self.open()?;
        let msg = FramedMessage::new(
            self.next_request_id(),
            Request::Subscribe {
                path: path.to_string(),
            },
        );
        let encoded = encode_message(&msg)
            .map_err(|e| BusError::Protocol(format!("failed to encode request: {}", e)))?;
        stream
            .set_read_timeout(Some(self.connect_timeout))
            .map_err(|e| BusError::Unavailable(format!("socket setup failed: {}", e)))?;
        stream
            .write_all(&encoded)
            .map_err(|e| BusError::Unavailable(format!("failed to subscribe: {}", e)))?;

        let ack = read_frame(&mut stream)
            .map_err(|e| BusError::Unavailable(format!("no subscription ack: {}", e)))?;
        match decode_message::<Response>(&ack) {
            Ok(FramedMessage {
                payload: Response::Subscribed,
                ..
            }) => {}
            Ok(FramedMessage {
                payload: Response::Error(err),
                ..
            }) => {
                return Err(BusError::Remote {
                    code: err.code,
                    message: err.message,
                });
            }
            Ok(other) => {
                return Err(BusError::Protocol(format!(
                    "unexpected subscription ack: {:?}",
                    other.payload
                )));
            }
            Err(e) => return Err(BusError::Protocol(e.to_string())),
        }

        stream
            .set_read_timeout(None)
            .map_err(|e| BusError::Unavailable(format!("socket setup failed: {}", e)))?;
        let closer = stream
            .try_clone()
            .map_err(|e| BusError::Unavailable(format!("connection clone failed: {}", e)))?;

        let (tx, rx) = signal_channel();
        let path_owned = path.to_string();
        std::thread::Builder::new()
            .name("ai-bus-signals".to_string())
            .spawn(move || signal_loop(stream, tx, path_owned))
            .map_err(|e| BusError::Unavailable(format!("failed to start signal reader: {}", e)))?;

        debug!(path, "Subscribed to daemon signals");
        Ok(Subscription::with_closer(rx, move || {
            let _ = closer.shutdown(Shutdown::Both);
        }))
    }
}

/// Read one length-prefixed frame.
pub(crate) fn read_frame(stream: &mut UnixStream) -> std::io::Result<Vec<u8>> {
    let mut len_buf = [0u8; 4];
    stream.read_exact(&mut len_buf)?;

    let len = u32::from_be_bytes(len_buf) as usize;
    if len > MAX_FRAME_LEN {
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            format!("frame too large: {} bytes", len),
        ));
    }

    let mut payload = vec![0u8; len];
    stream.read_exact(&mut payload)?;
    Ok(payload)
}

fn signal_loop(mut stream: UnixStream, tx: Sender<Signal>, path: String) {
    loop {
        let payload = match read_frame(&mut stream) {
            Ok(p) => p,
            Err(e) => {
                debug!(path = %path, error = %e, "Signal stream closed");
                return;
            }
        };
        match decode_message::<Response>(&payload) {
            Ok(FramedMessage {
                payload: Response::Signal(signal),
                ..
            }) => {
                match tx.try_send(signal) {
                    Ok(()) => {}
                    Err(TrySendError::Full(signal)) => {
                        debug!(path = %path, signal = %signal.name, "Signal queue full, dropping");
                    }
                    Err(TrySendError::Disconnected(_)) => return,
                }
            }
            Ok(other) => {
                debug!(path = %path, frame = ?other.payload, "Ignoring non-signal frame");
            }
            Err(e) => {
                warn!(path = %path, error = %e, "Undecodable signal frame, closing stream");
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::net::UnixListener;
    use tempfile::TempDir;

    fn config_for(dir: &TempDir) -> ClientConfig {
        ClientConfig {
            socket_path: dir.path().join("daemon.sock"),
            ..Default::default()
        }
    }

    fn write_response(stream: &mut UnixStream, payload: Response) {
        let encoded = encode_message(&FramedMessage::new("resp", payload)).unwrap();
        stream.write_all(&encoded).unwrap();
    }

    #[test]
    fn test_client_not_available_initially() {
        let config = ClientConfig {
            socket_path: PathBuf::from("/tmp/nonexistent-ai-daemon-test.sock"),
            ..Default::default()
        };
        let bus = UdsBus::new(&config);
        assert!(!bus.is_available());

        let err = bus
            .call("/ai/daemon/SessionManager", "CreateSession", vec![], Duration::from_secs(1))
            .unwrap_err();
        assert!(matches!(err, BusError::Unavailable(_)));
        assert!(!bus.is_available());
    }

    #[test]
    fn test_request_counter_increments() {
        let bus = UdsBus::with_defaults();
        let first = bus.next_request_id();
        let second = bus.next_request_id();
        assert_ne!(first, second);
        assert!(second.starts_with("ai-"));
    }

    #[test]
    fn test_call_round_trip() {
        let dir = TempDir::new().unwrap();
        let config = config_for(&dir);
        let listener = UnixListener::bind(&config.socket_path).unwrap();

        let server = std::thread::spawn(move || {
            let (mut stream, _) = listener.accept().unwrap();
            let frame = read_frame(&mut stream).unwrap();
            let msg: FramedMessage<Request> = decode_message(&frame).unwrap();
            let Request::Call { path, method, args } = msg.payload else {
                panic!("expected Call");
            };
            assert_eq!(path, "/ai/daemon/SessionManager");
            assert_eq!(method, "CreateSession");
            assert_eq!(args, vec![BusValue::from("OCR")]);
            write_response(&mut stream, Response::Reply(BusValue::from("s-1")));
        });

        let bus = UdsBus::new(&config);
        let reply = bus
            .call(
                "/ai/daemon/SessionManager",
                "CreateSession",
                vec![BusValue::from("OCR")],
                Duration::from_secs(5),
            )
            .unwrap();
        assert_eq!(reply, BusValue::from("s-1"));
        assert!(bus.is_available());
        server.join().unwrap();
    }

    #[test]
    fn test_slow_reply_times_out() {
        let dir = TempDir::new().unwrap();
        let config = config_for(&dir);
        let listener = UnixListener::bind(&config.socket_path).unwrap();

        let server = std::thread::spawn(move || {
            let (mut stream, _) = listener.accept().unwrap();
            let _ = read_frame(&mut stream).unwrap();
            std::thread::sleep(Duration::from_millis(300));
        });

        let bus = UdsBus::new(&config);
        let err = bus
            .call("/p", "slow", vec![], Duration::from_millis(50))
            .unwrap_err();
        assert!(matches!(err, BusError::Timeout(_)), "got {err:?}");
        server.join().unwrap();
    }

    #[test]
    fn test_subscription_delivers_signals_in_order() {
        let dir = TempDir::new().unwrap();
        let config = config_for(&dir);
        let listener = UnixListener::bind(&config.socket_path).unwrap();

        let server = std::thread::spawn(move || {
            let (mut stream, _) = listener.accept().unwrap();
            let frame = read_frame(&mut stream).unwrap();
            let msg: FramedMessage<Request> = decode_message(&frame).unwrap();
            assert!(matches!(msg.payload, Request::Subscribe { .. }));
            write_response(&mut stream, Response::Subscribed);
            for name in ["First", "Second"] {
                write_response(
                    &mut stream,
                    Response::Signal(Signal::new("/p", name, vec![])),
                );
            }
        });

        let bus = UdsBus::new(&config);
        let sub = bus.subscribe("/p").unwrap();
        let first = sub.recv_timeout(Duration::from_secs(5)).unwrap().unwrap();
        let second = sub.recv_timeout(Duration::from_secs(5)).unwrap().unwrap();
        assert_eq!(first.name, "First");
        assert_eq!(second.name, "Second");
        server.join().unwrap();

        // The daemon side hung up; the reader thread ends and says so.
        assert!(matches!(
            sub.recv_timeout(Duration::from_secs(5)),
            Err(BusError::Unavailable(_))
        ));
    }
}
