use std::collections::HashMap;
use std::io::{Read, Write};
use std::net::Shutdown;
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use ai_daemon_client::ClientConfig;
use ai_daemon_client::bus::protocol::{
    ErrorCode, ErrorResponse, FramedMessage, Request, Response, decode_message, encode_message,
};
use ai_daemon_client::bus::{BusValue, SESSION_MANAGER_PATH, Signal};
use tempfile::TempDir;

/// Captures tracing output for tests.
#[allow(dead_code)]
pub struct TestTracing {
    buffer: Arc<Mutex<Vec<u8>>>,
}

#[allow(dead_code)]
impl TestTracing {
    pub fn new() -> Self {
        Self {
            buffer: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn install(&self) -> tracing::subscriber::DefaultGuard {
        let writer = self.buffer.clone();
        let make_writer = move || TestWriter(writer.clone());
        let subscriber = tracing_subscriber::fmt()
            .with_ansi(false)
            .without_time()
            .with_max_level(tracing::Level::DEBUG)
            .with_writer(make_writer)
            .finish();
        tracing::subscriber::set_default(subscriber)
    }

    pub fn output(&self) -> String {
        let buf = self.buffer.lock().unwrap();
        String::from_utf8_lossy(&buf).to_string()
    }

    /// Assert that the captured log output contains the provided substring.
    pub fn assert_contains(&self, needle: &str) {
        let out = self.output();
        assert!(
            out.contains(needle),
            "expected logs to contain `{needle}`, got:\n{out}"
        );
    }
}

#[allow(dead_code)]
struct TestWriter(Arc<Mutex<Vec<u8>>>);

impl Write for TestWriter {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.0.lock().unwrap().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

#[allow(dead_code)]
pub struct EnvGuard {
    key: String,
    prev: Option<String>,
}

#[allow(dead_code)]
impl EnvGuard {
    pub fn set(key: &str, val: impl AsRef<str>) -> Self {
        let prev = std::env::var(key).ok();
        unsafe { std::env::set_var(key, val.as_ref()) };
        Self {
            key: key.to_string(),
            prev,
        }
    }

    pub fn unset(key: &str) -> Self {
        let prev = std::env::var(key).ok();
        unsafe { std::env::remove_var(key) };
        Self {
            key: key.to_string(),
            prev,
        }
    }
}

impl Drop for EnvGuard {
    fn drop(&mut self) {
        match &self.prev {
            Some(v) => unsafe { std::env::set_var(&self.key, v) },
            None => unsafe { std::env::remove_var(&self.key) },
        }
    }
}

/// Config pointing at a socket nobody listens on.
#[allow(dead_code)]
pub fn absent_daemon_config(dir: &TempDir) -> ClientConfig {
    ClientConfig {
        socket_path: dir.path().join("nobody-home.sock"),
        connect_timeout: Duration::from_millis(200),
        ..Default::default()
    }
}

/// One call the stub daemon received.
#[allow(dead_code)]
#[derive(Debug, Clone)]
pub struct StubCall {
    pub path: String,
    pub method: String,
    pub args: Vec<BusValue>,
}

#[allow(dead_code)]
type StubHandler = Arc<dyn Fn(&[BusValue]) -> Response + Send + Sync>;

/// A daemon on a temporary Unix socket speaking the real wire protocol.
///
/// Replies are scripted per method name. The session manager is built in and
/// hands out `session-1`, `session-2`, ...
#[allow(dead_code)]
pub struct StubDaemon {
    _dir: TempDir,
    socket: PathBuf,
    handlers: Arc<Mutex<HashMap<String, StubHandler>>>,
    calls: Arc<Mutex<Vec<StubCall>>>,
    subscribers: Arc<Mutex<Vec<(String, UnixStream)>>>,
}

#[allow(dead_code)]
impl StubDaemon {
    pub fn start() -> Self {
        let dir = TempDir::new().expect("temp dir");
        let socket = dir.path().join("daemon.sock");
        let listener = UnixListener::bind(&socket).expect("bind stub socket");

        let daemon = Self {
            _dir: dir,
            socket,
            handlers: Arc::new(Mutex::new(HashMap::new())),
            calls: Arc::new(Mutex::new(Vec::new())),
            subscribers: Arc::new(Mutex::new(Vec::new())),
        };

        let sessions = Arc::new(AtomicU64::new(0));
        daemon.on("CreateSession", move |_args| {
            let n = sessions.fetch_add(1, Ordering::SeqCst) + 1;
            Response::Reply(BusValue::Str(format!("session-{n}")))
        });
        daemon.reply("DestroySession", BusValue::Unit);

        let handlers = daemon.handlers.clone();
        let calls = daemon.calls.clone();
        let subscribers = daemon.subscribers.clone();
        std::thread::spawn(move || {
            for stream in listener.incoming() {
                let Ok(stream) = stream else { break };
                let handlers = handlers.clone();
                let calls = calls.clone();
                let subscribers = subscribers.clone();
                std::thread::spawn(move || serve(stream, handlers, calls, subscribers));
            }
        });

        daemon
    }

    pub fn socket(&self) -> &Path {
        &self.socket
    }

    pub fn config(&self) -> ClientConfig {
        ClientConfig {
            socket_path: self.socket.clone(),
            ..Default::default()
        }
    }

    pub fn on<F>(&self, method: &str, handler: F)
    where
        F: Fn(&[BusValue]) -> Response + Send + Sync + 'static,
    {
        self.handlers
            .lock()
            .unwrap()
            .insert(method.to_string(), Arc::new(handler));
    }

    pub fn reply(&self, method: &str, value: BusValue) {
        self.on(method, move |_| Response::Reply(value.clone()));
    }

    pub fn reply_json(&self, method: &str, json: &str) {
        self.reply(method, BusValue::from(json));
    }

    pub fn fail(&self, method: &str, code: ErrorCode, message: &str) {
        let message = message.to_string();
        self.on(method, move |_| {
            Response::Error(ErrorResponse {
                code,
                message: message.clone(),
            })
        });
    }

    pub fn calls_to(&self, method: &str) -> Vec<StubCall> {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter(|c| c.method == method)
            .cloned()
            .collect()
    }

    /// Number of sessions handed out so far.
    pub fn sessions_created(&self) -> usize {
        self.calls_to("CreateSession")
            .iter()
            .filter(|c| c.path == SESSION_MANAGER_PATH)
            .count()
    }

    /// Push a signal to every subscriber of `path`. Returns how many got it.
    pub fn emit(&self, path: &str, name: &str, args: Vec<BusValue>) -> usize {
        let signal = Signal::new(path, name, args);
        let mut subscribers = self.subscribers.lock().unwrap();
        subscribers.retain_mut(|(sub_path, feed)| {
            sub_path != path
                || write_frame(feed, "signal", Response::Signal(signal.clone())).is_ok()
        });
        subscribers.iter().filter(|(p, _)| p == path).count()
    }

    /// Close every signal feed on `path`, as a crashing daemon would.
    pub fn hang_up(&self, path: &str) {
        self.subscribers.lock().unwrap().retain(|(sub_path, feed)| {
            if sub_path != path {
                return true;
            }
            let _ = feed.shutdown(Shutdown::Both);
            false
        });
    }

    /// Block until someone subscribed to `path`.
    pub fn wait_for_subscriber(&self, path: &str, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        while Instant::now() < deadline {
            if self
                .subscribers
                .lock()
                .unwrap()
                .iter()
                .any(|(p, _)| p == path)
            {
                return true;
            }
            std::thread::sleep(Duration::from_millis(10));
        }
        false
    }
}

#[allow(dead_code)]
fn serve(
    mut stream: UnixStream,
    handlers: Arc<Mutex<HashMap<String, StubHandler>>>,
    calls: Arc<Mutex<Vec<StubCall>>>,
    subscribers: Arc<Mutex<Vec<(String, UnixStream)>>>,
) {
    loop {
        let Ok(frame) = read_frame(&mut stream) else {
            return;
        };
        let Ok(msg) = decode_message::<Request>(&frame) else {
            return;
        };
        match msg.payload {
            Request::Call { path, method, args } => {
                calls.lock().unwrap().push(StubCall {
                    path: path.clone(),
                    method: method.clone(),
                    args: args.clone(),
                });
                let handler = handlers.lock().unwrap().get(&method).cloned();
                let response = match handler {
                    Some(handler) => handler(&args),
                    None => Response::Error(ErrorResponse {
                        code: ErrorCode::UnknownMethod,
                        message: format!("no method {method} at {path}"),
                    }),
                };
                if write_frame(&mut stream, &msg.request_id, response).is_err() {
                    return;
                }
            }
            Request::Subscribe { path } => {
                if let Ok(feed) = stream.try_clone() {
                    subscribers.lock().unwrap().push((path, feed));
                }
                let _ = write_frame(&mut stream, &msg.request_id, Response::Subscribed);
                return;
            }
        }
    }
}

#[allow(dead_code)]
fn read_frame(stream: &mut UnixStream) -> std::io::Result<Vec<u8>> {
    let mut len_buf = [0u8; 4];
    stream.read_exact(&mut len_buf)?;
    let mut payload = vec![0u8; u32::from_be_bytes(len_buf) as usize];
    stream.read_exact(&mut payload)?;
    Ok(payload)
}

#[allow(dead_code)]
fn write_frame(stream: &mut UnixStream, request_id: &str, payload: Response) -> std::io::Result<()> {
    let encoded = encode_message(&FramedMessage::new(request_id, payload))
        .map_err(|e| std::io::Error::other(e.to_string()))?;
    stream.write_all(&encoded)
}
