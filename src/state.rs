//! Per-client activity and last-error bookkeeping.
//!
//! A client is `Idle`, `Busy` with one blocking call, or `Streaming` while a
//! daemon-side stream it started is producing output. Remote-calling operations take a
//! [`BusyGuard`] first; a client that is not idle rejects the operation with
//! [`AiError::Busy`] instead of racing the one in flight.

use parking_lot::Mutex;
use tracing::debug;

use crate::error::{AiError, LastError, Result};

/// Identifier of an open stream, as issued by the daemon.
pub type StreamTag = String;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Activity {
    #[default]
    Idle,
    Busy,
    Streaming,
}

/// Activity plus the id of the stream the client opened.
///
/// The id outlives `Streaming`: a completed or failed stream is no longer
/// running, but stays open on the daemon until the client ends it.
#[derive(Debug, Default)]
struct Machine {
    activity: Activity,
    stream: Option<StreamTag>,
}

/// Activity machine plus the last-error mirror of one client.
#[derive(Debug, Default)]
pub struct ClientState {
    machine: Mutex<Machine>,
    last_error: Mutex<LastError>,
}

impl ClientState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Move `Idle -> Busy`, or fail with [`AiError::Busy`].
    ///
    /// The guard puts the client back to `Idle` when dropped unless it was
    /// turned into a stream with [`BusyGuard::stream`].
    pub fn begin(&self) -> Result<BusyGuard<'_>> {
        let mut machine = self.machine.lock();
        if machine.activity != Activity::Idle {
            debug!(activity = ?machine.activity, "rejecting operation while another is in flight");
            return Err(AiError::Busy);
        }
        machine.activity = Activity::Busy;
        Ok(BusyGuard {
            state: self,
            promoted: false,
        })
    }

    /// Take the stored stream id for an end-of-stream call, holding the
    /// client `Busy` until the returned guard drops.
    ///
    /// `Ok(None)` when no stream id is stored.
    pub fn begin_end_stream(&self) -> Result<Option<(StreamTag, BusyGuard<'_>)>> {
        let mut machine = self.machine.lock();
        if machine.stream.is_none() {
            return Ok(None);
        }
        if machine.activity == Activity::Busy {
            return Err(AiError::Busy);
        }
        let Some(tag) = machine.stream.take() else {
            return Ok(None);
        };
        machine.activity = Activity::Busy;
        Ok(Some((
            tag,
            BusyGuard {
                state: self,
                promoted: false,
            },
        )))
    }

    pub fn activity(&self) -> Activity {
        self.machine.lock().activity
    }

    pub fn is_running(&self) -> bool {
        self.machine.lock().activity != Activity::Idle
    }

    pub fn is_streaming(&self) -> bool {
        self.machine.lock().activity == Activity::Streaming
    }

    /// Id of the stream the client has not ended yet, running or not.
    pub fn stream_tag(&self) -> Option<StreamTag> {
        self.machine.lock().stream.clone()
    }

    /// Stop running the stream tagged `tag`; the id stays stored for the
    /// end-of-stream call.
    pub fn finish_stream(&self, tag: &str) -> bool {
        let mut machine = self.machine.lock();
        if machine.activity == Activity::Streaming && machine.stream.as_deref() == Some(tag) {
            machine.activity = Activity::Idle;
            return true;
        }
        false
    }

    /// Like [`finish_stream`](Self::finish_stream), but also forgets the id.
    /// For streams the daemon closes on its own.
    pub fn close_stream(&self, tag: &str) -> bool {
        let mut machine = self.machine.lock();
        if machine.activity == Activity::Streaming && machine.stream.as_deref() == Some(tag) {
            *machine = Machine::default();
            return true;
        }
        false
    }

    /// Drop a running stream whose daemon side is gone. `false` when nothing
    /// was streaming.
    pub fn abandon_stream(&self) -> bool {
        let mut machine = self.machine.lock();
        if machine.activity != Activity::Streaming {
            return false;
        }
        *machine = Machine::default();
        true
    }

    /// Back to `Idle` regardless of what was in flight; forgets the stream.
    pub fn force_idle(&self) {
        *self.machine.lock() = Machine::default();
    }

    pub fn last_error(&self) -> LastError {
        self.last_error.lock().clone()
    }

    pub fn set_error(&self, err: &AiError) {
        *self.last_error.lock() = LastError::from(err);
    }

    pub fn clear_error(&self) {
        *self.last_error.lock() = LastError::none();
    }

    /// Mirror the outcome of an operation: errors are stored, success clears.
    pub fn record<T>(&self, result: Result<T>) -> Result<T> {
        match &result {
            Ok(_) => self.clear_error(),
            Err(e) => self.set_error(e),
        }
        result
    }

    /// Mirror the outcome of a pure query: errors are stored, success leaves
    /// the previous error in place.
    pub fn record_query<T>(&self, result: Result<T>) -> Result<T> {
        if let Err(e) = &result {
            self.set_error(e);
        }
        result
    }
}

/// Scoped `Busy` marker returned by [`ClientState::begin`].
#[derive(Debug)]
pub struct BusyGuard<'a> {
    state: &'a ClientState,
    promoted: bool,
}

impl BusyGuard<'_> {
    /// Keep the client occupied by the stream `tag` after the guard is gone.
    ///
    /// Replaces the id of an earlier stream that finished but was never ended.
    pub fn stream(mut self, tag: impl Into<StreamTag>) {
        let mut machine = self.state.machine.lock();
        // terminate() may have reset us while the start call was in flight.
        if machine.activity == Activity::Busy {
            let tag = tag.into();
            if let Some(old) = machine.stream.replace(tag.clone()) {
                debug!(old = %old, new = %tag, "replacing unended stream");
            }
            machine.activity = Activity::Streaming;
        }
        self.promoted = true;
    }
}

impl Drop for BusyGuard<'_> {
    fn drop(&mut self) {
        if self.promoted {
            return;
        }
        let mut machine = self.state.machine.lock();
        if machine.activity == Activity::Busy {
            machine.activity = Activity::Idle;
        }
    }
}
