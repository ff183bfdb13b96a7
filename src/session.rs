//! Session establishment against the daemon's session manager.
//!
//! Every capability client owns one [`SessionProxy`]. The proxy creates its
//! daemon-side session lazily on first use, reuses the handle for every later
//! call and recreates it transparently once the daemon reports the session
//! object gone. Dropping the proxy destroys the session (best-effort).

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::bus::{
    Bus, BusError, BusValue, SESSION_MANAGER_PATH, Signal, Subscription, session_path,
};
use crate::error::{AiError, Result};

/// AI function area served by the daemon.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Capability {
    Chat,
    #[serde(rename = "OCR")]
    Ocr,
    SpeechToText,
    TextToSpeech,
    ImageRecognition,
    FunctionCalling,
    Embedding,
}

impl Capability {
    pub const ALL: [Capability; 7] = [
        Capability::Chat,
        Capability::Ocr,
        Capability::SpeechToText,
        Capability::TextToSpeech,
        Capability::ImageRecognition,
        Capability::FunctionCalling,
        Capability::Embedding,
    ];

    /// Name the session manager and model registry know this capability by.
    pub fn as_str(self) -> &'static str {
        match self {
            Capability::Chat => "Chat",
            Capability::Ocr => "OCR",
            Capability::SpeechToText => "SpeechToText",
            Capability::TextToSpeech => "TextToSpeech",
            Capability::ImageRecognition => "ImageRecognition",
            Capability::FunctionCalling => "FunctionCalling",
            Capability::Embedding => "Embedding",
        }
    }

    /// Whether sessions of this capability emit signals worth subscribing to.
    pub fn emits_events(self) -> bool {
        matches!(
            self,
            Capability::Chat
                | Capability::SpeechToText
                | Capability::TextToSpeech
                | Capability::ImageRecognition
        )
    }
}

impl fmt::Display for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Capability {
    type Err = AiError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        let needle = s.trim();
        Capability::ALL
            .into_iter()
            .find(|c| c.as_str().eq_ignore_ascii_case(needle))
            .ok_or_else(|| AiError::invalid(format!("unknown capability '{needle}'")))
    }
}

#[derive(Debug, Clone)]
struct Bound {
    handle: String,
    path: String,
}

/// Lazily created daemon session for one capability.
pub struct SessionProxy {
    bus: Arc<dyn Bus>,
    capability: Capability,
    timeout: Duration,
    bound: Mutex<Option<Bound>>,
    events: Mutex<Option<Subscription>>,
}

impl SessionProxy {
    /// `timeout` applies to session management and to calls that do not pass
    /// their own.
    pub fn new(bus: Arc<dyn Bus>, capability: Capability, timeout: Duration) -> Self {
        Self {
            bus,
            capability,
            timeout,
            bound: Mutex::new(None),
            events: Mutex::new(None),
        }
    }

    pub fn capability(&self) -> Capability {
        self.capability
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Current session handle, if one is established.
    pub fn handle(&self) -> Option<String> {
        self.bound.lock().as_ref().map(|b| b.handle.clone())
    }

    /// Make sure a live session exists and return its object path.
    ///
    /// No retry happens here; a failure leaves the proxy unbound so the next
    /// operation tries again.
    pub fn ensure(&self) -> Result<String> {
        let mut bound = self.bound.lock();
        if let Some(b) = bound.as_ref() {
            return Ok(b.path.clone());
        }

        let handle = self
            .bus
            .call(
                SESSION_MANAGER_PATH,
                "CreateSession",
                vec![BusValue::from(self.capability.as_str())],
                self.timeout,
            )
            .and_then(BusValue::into_string)
            .map_err(|e| AiError::unavailable(e.to_string()))?;

        if handle.is_empty() {
            return Err(AiError::unavailable(format!(
                "session manager returned no session for {}",
                self.capability
            )));
        }

        let path = session_path(&handle);
        if self.capability.emits_events() {
            match self.bus.subscribe(&path) {
                Ok(sub) => *self.events.lock() = Some(sub),
                Err(e) => {
                    self.destroy(&handle);
                    return Err(AiError::unavailable(e.to_string()));
                }
            }
        }

        info!(
            capability = %self.capability,
            session = %handle,
            bus = self.bus.id(),
            "session established"
        );
        *bound = Some(Bound {
            handle,
            path: path.clone(),
        });
        Ok(path)
    }

    /// Invoke `method` on the session object with the default timeout.
    pub fn call(&self, method: &str, args: Vec<BusValue>) -> Result<BusValue> {
        self.call_with_timeout(method, args, self.timeout)
    }

    /// Invoke `method` on the session object, creating the session if needed.
    pub fn call_with_timeout(
        &self,
        method: &str,
        args: Vec<BusValue>,
        timeout: Duration,
    ) -> Result<BusValue> {
        let path = self.ensure()?;
        self.dispatch(&path, method, args, timeout)
    }

    /// Invoke `method` only if a session already exists.
    ///
    /// Returns `None` without touching the daemon when unbound.
    pub fn call_bound(&self, method: &str, args: Vec<BusValue>) -> Option<Result<BusValue>> {
        let path = self.bound.lock().as_ref().map(|b| b.path.clone())?;
        Some(self.dispatch(&path, method, args, self.timeout))
    }

    fn dispatch(
        &self,
        path: &str,
        method: &str,
        args: Vec<BusValue>,
        timeout: Duration,
    ) -> Result<BusValue> {
        debug!(capability = %self.capability, method, "calling session");
        match self.bus.call(path, method, args, timeout) {
            Ok(value) => Ok(value),
            Err(e) => {
                if e.invalidates_object() {
                    self.invalidate(path);
                }
                Err(e.into())
            }
        }
    }

    /// Forget the session at `path`; the next call creates a fresh one.
    fn invalidate(&self, path: &str) {
        let mut bound = self.bound.lock();
        if bound.as_ref().is_some_and(|b| b.path == path) {
            debug!(capability = %self.capability, path, "session invalidated");
            *bound = None;
            *self.events.lock() = None;
        }
    }

    /// Signals queued for this session, in arrival order.
    ///
    /// Fails once the signal feed is gone; the session is then forgotten so
    /// the next operation establishes a fresh one.
    pub fn drain_events(&self) -> Result<Vec<Signal>> {
        let drained = match self.events.lock().as_ref() {
            Some(sub) => sub.drain(),
            None => return Err(self.no_feed()),
        };
        drained.map_err(|e| self.feed_closed(e))
    }

    /// Block up to `timeout` for the next signal; `Ok(None)` on timeout.
    pub fn wait_event(&self, timeout: Duration) -> Result<Option<Signal>> {
        let received = match self.events.lock().as_ref() {
            Some(sub) => sub.recv_timeout(timeout),
            None => return Err(self.no_feed()),
        };
        received.map_err(|e| self.feed_closed(e))
    }

    /// Drop signals queued so far, e.g. trailing output of an earlier call.
    pub fn discard_events(&self) {
        if let Ok(stale) = self.drain_events()
            && !stale.is_empty()
        {
            debug!(capability = %self.capability, count = stale.len(), "discarding queued signals");
        }
    }

    fn no_feed(&self) -> AiError {
        AiError::unavailable(format!("no signal feed for {} session", self.capability))
    }

    fn feed_closed(&self, err: BusError) -> AiError {
        let lost = self.bound.lock().take();
        *self.events.lock() = None;
        if let Some(b) = lost {
            warn!(capability = %self.capability, session = %b.handle, "signal feed lost");
            self.destroy(&b.handle);
        }
        err.into()
    }

    fn destroy(&self, handle: &str) {
        let result = self.bus.call(
            SESSION_MANAGER_PATH,
            "DestroySession",
            vec![BusValue::from(handle)],
            self.timeout,
        );
        match result {
            Ok(_) => debug!(capability = %self.capability, session = %handle, "session destroyed"),
            Err(e) => warn!(
                capability = %self.capability,
                session = %handle,
                error = %e,
                "failed to destroy session"
            ),
        }
    }
}

impl fmt::Debug for SessionProxy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionProxy")
            .field("bus", &self.bus.id())
            .field("capability", &self.capability)
            .field("handle", &self.handle())
            .finish()
    }
}

impl Drop for SessionProxy {
    fn drop(&mut self) {
        self.events.get_mut().take();
        if let Some(bound) = self.bound.get_mut().take() {
            self.destroy(&bound.handle);
        }
    }
}
