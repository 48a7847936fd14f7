//! Waiter handles
//!
//! A waiter handle is the capability the registry uses to release (or query)
//! one suspended participant. The registry only ever talks to the
//! [`WaiterHandle`] trait; [`ChannelWaiter`] is the in-process implementation
//! backed by a tokio oneshot channel, paired with a [`WaitTicket`] the
//! participant awaits.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use eyre::{Result, eyre};
use serde::{Deserialize, Serialize};
use tokio::sync::oneshot;
use tokio::sync::oneshot::error::TryRecvError;
use tracing::{debug, info};

/// Final outcome delivered to a waiter
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Outcome {
    /// Quorum reached, proceed
    Success,
    /// Released without reaching quorum (cancelled, forgotten, abandoned)
    Failure(String),
}

impl Outcome {
    pub fn is_success(&self) -> bool {
        matches!(self, Outcome::Success)
    }
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Success => write!(f, "success"),
            Self::Failure(reason) => write!(f, "failure: {}", reason),
        }
    }
}

/// Destination for human-readable progress lines
pub trait OutputSink: Send + Sync {
    fn println(&self, line: &str) -> Result<()>;
}

/// Capability over one suspended participant
///
/// Implemented by the hosting environment. The registry calls `resolve` at
/// most once per waiter, and uses `is_ready` to notice waiters that were
/// finished through some other path (for example the host cancelled them).
pub trait WaiterHandle: Send + Sync {
    /// Has this waiter already been resolved or abandoned by anyone?
    fn is_ready(&self) -> bool;

    /// Release the waiter with the given outcome
    fn resolve(&self, outcome: Outcome);

    /// Deliver a progress line to the waiter's output sink
    fn notify(&self, message: &str) -> Result<()>;
}

/// Sink that keeps every line in memory
#[derive(Debug, Clone, Default)]
pub struct MemorySink {
    lines: Arc<Mutex<Vec<String>>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of all lines written so far
    pub fn lines(&self) -> Vec<String> {
        self.lines.lock().map(|lines| lines.clone()).unwrap_or_default()
    }
}

impl OutputSink for MemorySink {
    fn println(&self, line: &str) -> Result<()> {
        let mut lines = self.lines.lock().map_err(|_| eyre!("memory sink poisoned"))?;
        lines.push(line.to_string());
        Ok(())
    }
}

/// Sink that forwards lines to the tracing subscriber
#[derive(Debug, Clone)]
pub struct TracingSink {
    waiter_id: String,
}

impl TracingSink {
    pub fn new(waiter_id: impl Into<String>) -> Self {
        Self {
            waiter_id: waiter_id.into(),
        }
    }
}

impl OutputSink for TracingSink {
    fn println(&self, line: &str) -> Result<()> {
        info!(waiter_id = %self.waiter_id, "{}", line);
        Ok(())
    }
}

/// In-process waiter handle backed by a oneshot channel
///
/// The handle becomes ready once it has been resolved, cancelled, or once the
/// participant dropped its [`WaitTicket`] (nobody is waiting any more).
pub struct ChannelWaiter {
    tx: Mutex<Option<oneshot::Sender<Outcome>>>,
    resolved: AtomicBool,
    cancelled: AtomicBool,
    sink: Arc<dyn OutputSink>,
}

impl ChannelWaiter {
    /// Create a handle/ticket pair
    pub fn new(sink: Arc<dyn OutputSink>) -> (Arc<Self>, WaitTicket) {
        let (tx, rx) = oneshot::channel();
        let waiter = Arc::new(Self {
            tx: Mutex::new(Some(tx)),
            resolved: AtomicBool::new(false),
            cancelled: AtomicBool::new(false),
            sink,
        });
        (waiter, WaitTicket { rx })
    }

    /// Cancel the waiter out-of-band, without going through the barrier
    ///
    /// The participant observes `Outcome::Failure("cancelled")`. The registry
    /// notices on its next cleanup pass.
    pub fn cancel(&self) {
        debug!("ChannelWaiter::cancel: called");
        if let Some(tx) = self.take_sender() {
            let _ = tx.send(Outcome::Failure("cancelled".to_string()));
            self.cancelled.store(true, Ordering::SeqCst);
        }
    }

    /// Whether the registry (or anyone) resolved this handle
    pub fn is_resolved(&self) -> bool {
        self.resolved.load(Ordering::SeqCst)
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    fn take_sender(&self) -> Option<oneshot::Sender<Outcome>> {
        self.tx.lock().unwrap_or_else(PoisonError::into_inner).take()
    }
}

impl WaiterHandle for ChannelWaiter {
    fn is_ready(&self) -> bool {
        if self.is_resolved() || self.is_cancelled() {
            return true;
        }
        match self.tx.lock().unwrap_or_else(PoisonError::into_inner).as_ref() {
            Some(tx) => tx.is_closed(),
            None => true,
        }
    }

    fn resolve(&self, outcome: Outcome) {
        debug!(%outcome, "ChannelWaiter::resolve: called");
        match self.take_sender() {
            Some(tx) => {
                if tx.send(outcome).is_err() {
                    debug!("ChannelWaiter::resolve: ticket already dropped");
                }
                self.resolved.store(true, Ordering::SeqCst);
            }
            None => debug!("ChannelWaiter::resolve: already resolved or cancelled"),
        }
    }

    fn notify(&self, message: &str) -> Result<()> {
        self.sink.println(message)
    }
}

/// Participant side of a [`ChannelWaiter`]
#[derive(Debug)]
pub struct WaitTicket {
    rx: oneshot::Receiver<Outcome>,
}

impl WaitTicket {
    /// Suspend until the waiter is resolved
    pub async fn wait(self) -> Outcome {
        self.rx.await.unwrap_or_else(|_| abandoned())
    }

    /// Blocking variant of [`WaitTicket::wait`] for plain threads
    ///
    /// Panics if called from within an async runtime.
    pub fn blocking_wait(self) -> Outcome {
        self.rx.blocking_recv().unwrap_or_else(|_| abandoned())
    }

    /// Non-blocking poll; `None` while still waiting
    pub fn try_outcome(&mut self) -> Option<Outcome> {
        match self.rx.try_recv() {
            Ok(outcome) => Some(outcome),
            Err(TryRecvError::Empty) => None,
            Err(TryRecvError::Closed) => Some(abandoned()),
        }
    }
}

fn abandoned() -> Outcome {
    Outcome::Failure("waiter handle dropped".to_string())
}
