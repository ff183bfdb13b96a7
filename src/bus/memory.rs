//! In-process [`Bus`] with scripted method handlers.
//!
//! Stands in for the daemon wherever a real socket is unwanted: tests, demos,
//! or applications that embed their own backend. Methods without a handler
//! fail as if the daemon were not running.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use crossbeam_channel::Sender;
use parking_lot::Mutex;

use super::{
    Bus, BusError, BusValue, SESSION_MANAGER_PATH, Signal, Subscription, signal_channel,
};

type Handler = dyn Fn(&str, &[BusValue]) -> Result<BusValue, BusError> + Send + Sync;

/// A call observed by a [`MemoryBus`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordedCall {
    pub path: String,
    pub method: String,
    pub args: Vec<BusValue>,
    pub timeout: Duration,
}

#[derive(Default)]
pub struct MemoryBus {
    handlers: Mutex<HashMap<String, Arc<Handler>>>,
    calls: Mutex<Vec<RecordedCall>>,
    subscribers: Mutex<Vec<Subscriber>>,
}

struct Subscriber {
    path: String,
    tx: Sender<Signal>,
    closed: Arc<AtomicBool>,
}

impl Subscriber {
    fn is_live(&self) -> bool {
        !self.closed.load(Ordering::SeqCst)
    }
}

impl MemoryBus {
    /// A bus with no handlers: every call fails as daemon-unavailable.
    pub fn new() -> Self {
        Self::default()
    }

    /// A bus whose session manager hands out `session-1`, `session-2`, ...
    pub fn with_session_manager() -> Self {
        let bus = Self::new();
        bus.install_session_manager();
        bus
    }

    fn install_session_manager(&self) {
        let counter = Arc::new(AtomicU64::new(0));
        self.on("CreateSession", move |path, _args| {
            if path != SESSION_MANAGER_PATH {
                return Err(BusError::Remote {
                    code: super::protocol::ErrorCode::UnknownObject,
                    message: format!("no object at {path}"),
                });
            }
            let n = counter.fetch_add(1, Ordering::SeqCst) + 1;
            Ok(BusValue::Str(format!("session-{n}")))
        });
        self.reply("DestroySession", BusValue::Unit);
    }

    /// Handle `method` on any path with `handler`.
    pub fn on<F>(&self, method: &str, handler: F)
    where
        F: Fn(&str, &[BusValue]) -> Result<BusValue, BusError> + Send + Sync + 'static,
    {
        self.handlers
            .lock()
            .insert(method.to_string(), Arc::new(handler));
    }

    /// Answer `method` with a fixed value.
    pub fn reply(&self, method: &str, value: BusValue) {
        self.on(method, move |_, _| Ok(value.clone()));
    }

    /// Answer `method` with a fixed JSON string.
    pub fn reply_json(&self, method: &str, json: &str) {
        self.reply(method, BusValue::Str(json.to_string()));
    }

    /// Make `method` fail with `error`.
    pub fn fail(&self, method: &str, error: BusError) {
        self.on(method, move |_, _| Err(error.clone()));
    }

    /// Remove the handler for `method`.
    pub fn remove(&self, method: &str) {
        self.handlers.lock().remove(method);
    }

    /// Every call seen so far, oldest first.
    pub fn calls(&self) -> Vec<RecordedCall> {
        self.calls.lock().clone()
    }

    /// Calls to `method`, oldest first.
    pub fn calls_to(&self, method: &str) -> Vec<RecordedCall> {
        self.calls
            .lock()
            .iter()
            .filter(|c| c.method == method)
            .cloned()
            .collect()
    }

    /// Deliver a signal to every live subscriber of `path`.
    ///
    /// Returns how many subscribers received it; a subscriber whose queue is
    /// full misses the signal.
    pub fn emit(&self, path: &str, name: &str, args: Vec<BusValue>) -> usize {
        let signal = Signal::new(path, name, args);
        let mut subs = self.subscribers.lock();
        subs.retain(Subscriber::is_live);
        let mut delivered = 0;
        for sub in subs.iter().filter(|s| s.path == path) {
            if sub.tx.try_send(signal.clone()).is_ok() {
                delivered += 1;
            }
        }
        delivered
    }

    /// Hang up every signal feed on `path`, as a daemon that went away would.
    pub fn close_feeds(&self, path: &str) {
        self.subscribers.lock().retain(|s| s.path != path);
    }

    /// Number of subscriptions to `path` that have not been dropped.
    pub fn subscriber_count(&self, path: &str) -> usize {
        self.subscribers
            .lock()
            .iter()
            .filter(|s| s.path == path && s.is_live())
            .count()
    }
}

impl Bus for MemoryBus {
    fn id(&self) -> &str {
        "memory"
    }

    fn call(
        &self,
        path: &str,
        method: &str,
        args: Vec<BusValue>,
        timeout: Duration,
    ) -> Result<BusValue, BusError> {
        self.calls.lock().push(RecordedCall {
            path: path.to_string(),
            method: method.to_string(),
            args: args.clone(),
            timeout,
        });
        let handler = self.handlers.lock().get(method).cloned();
        match handler {
            Some(h) => h(path, &args),
            None => Err(BusError::Unavailable(format!(
                "no daemon serving {method}"
            ))),
        }
    }

    fn subscribe(&self, path: &str) -> Result<Subscription, BusError> {
        let (tx, rx) = signal_channel();
        let closed = Arc::new(AtomicBool::new(false));
        self.subscribers.lock().push(Subscriber {
            path: path.to_string(),
            tx,
            closed: closed.clone(),
        });
        Ok(Subscription::with_closer(rx, move || {
            closed.store(true, Ordering::SeqCst)
        }))
    }
}
