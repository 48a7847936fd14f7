//! Barrier - one named rendezvous point
//!
//! Every method here assumes the caller holds the registry lock. The barrier
//! itself does no synchronization.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::waiter::{Outcome, WaiterHandle};

/// Lifecycle of a waiter inside a barrier
///
/// `unblock` moves `Held` waiters to `Resolved`, where they stay until their
/// handle reports ready and a cleanup pass removes them. Both states count
/// toward quorum.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum WaiterState {
    Held,
    Resolved,
}

impl fmt::Display for WaiterState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Held => write!(f, "held"),
            Self::Resolved => write!(f, "resolved"),
        }
    }
}

/// One waiter's slot in a barrier
pub struct HeldWaiter {
    pub state: WaiterState,
    pub entered_at: DateTime<Utc>,
    /// Live handle; `None` when restored from disk and not yet re-supplied
    handle: Option<Arc<dyn WaiterHandle>>,
}

impl HeldWaiter {
    fn live(handle: Arc<dyn WaiterHandle>, entered_at: DateTime<Utc>) -> Self {
        Self {
            state: WaiterState::Held,
            entered_at,
            handle: Some(handle),
        }
    }

    /// Slot restored from the persisted document, without a handle
    pub fn detached(state: WaiterState, entered_at: DateTime<Utc>) -> Self {
        Self {
            state,
            entered_at,
            handle: None,
        }
    }

    pub fn is_detached(&self) -> bool {
        self.handle.is_none()
    }

    /// Detached slots are never ready: nothing can tell us about them
    fn is_ready(&self) -> bool {
        self.handle.as_ref().is_some_and(|handle| handle.is_ready())
    }
}

impl fmt::Debug for HeldWaiter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HeldWaiter")
            .field("state", &self.state)
            .field("entered_at", &self.entered_at)
            .field("detached", &self.is_detached())
            .finish()
    }
}

/// Result of admitting a waiter via [`Barrier::block`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// Waiter is held and counts toward quorum
    Held,
    /// The slot was already released before the handle was re-supplied; the
    /// new handle has been resolved on the spot
    AlreadyReleased,
}

/// State of one rendezvous point
#[derive(Debug)]
pub struct Barrier {
    quorum: u32,
    /// Sorted by waiter id so persisted documents are deterministic
    holding: BTreeMap<String, HeldWaiter>,
}

impl Barrier {
    pub fn new(quorum: u32) -> Self {
        Self {
            quorum,
            holding: BTreeMap::new(),
        }
    }

    pub(crate) fn restore(quorum: u32, holding: BTreeMap<String, HeldWaiter>) -> Self {
        Self { quorum, holding }
    }

    pub fn quorum(&self) -> u32 {
        self.quorum
    }

    /// Overwrite the quorum (last write wins), returning the previous value
    /// when it changed
    pub fn set_quorum(&mut self, quorum: u32) -> Option<u32> {
        let previous = std::mem::replace(&mut self.quorum, quorum);
        (previous != quorum).then_some(previous)
    }

    pub fn holding(&self) -> &BTreeMap<String, HeldWaiter> {
        &self.holding
    }

    /// Number of waiters not yet released
    pub fn held_count(&self) -> usize {
        self.holding
            .values()
            .filter(|waiter| waiter.state == WaiterState::Held)
            .count()
    }

    /// Quorum counts every slot, released or not
    ///
    /// A waiter arriving while an earlier release is still in flight finds
    /// the barrier at quorum and is released with it.
    pub fn has_quorum(&self) -> bool {
        self.holding.len() >= self.quorum as usize
    }

    pub fn is_empty(&self) -> bool {
        self.holding.is_empty()
    }

    /// Hold a waiter, replacing any previous handle for the same id
    pub fn block(&mut self, waiter_id: &str, handle: Arc<dyn WaiterHandle>) -> Admission {
        debug!(%waiter_id, "Barrier::block: called");
        if let Some(existing) = self.holding.get_mut(waiter_id)
            && existing.state == WaiterState::Resolved
        {
            debug!(%waiter_id, "Barrier::block: slot already released, resolving new handle");
            handle.resolve(Outcome::Success);
            existing.handle = Some(handle);
            return Admission::AlreadyReleased;
        }

        let entered_at = self
            .holding
            .get(waiter_id)
            .map(|waiter| waiter.entered_at)
            .unwrap_or_else(Utc::now);
        self.holding
            .insert(waiter_id.to_string(), HeldWaiter::live(handle, entered_at));
        Admission::Held
    }

    /// Release every held waiter in one pass
    ///
    /// Slots stay in `holding` as `Resolved` until their handles report
    /// ready. Detached slots are marked resolved so the handle is released as
    /// soon as the host re-supplies it. Returns how many slots were released.
    pub fn unblock(&mut self) -> usize {
        let mut released = 0;
        for (waiter_id, waiter) in self.holding.iter_mut() {
            if waiter.state != WaiterState::Held {
                continue;
            }
            waiter.state = WaiterState::Resolved;
            match &waiter.handle {
                Some(handle) => handle.resolve(Outcome::Success),
                None => debug!(%waiter_id, "Barrier::unblock: detached waiter marked resolved"),
            }
            released += 1;
        }
        released
    }

    /// Fail every live held waiter, used when a barrier is forgotten
    pub fn abort(&mut self, reason: &str) -> usize {
        let mut aborted = 0;
        for waiter in self.holding.values_mut() {
            if waiter.state != WaiterState::Held {
                continue;
            }
            if let Some(handle) = &waiter.handle {
                handle.resolve(Outcome::Failure(reason.to_string()));
                aborted += 1;
            }
            waiter.state = WaiterState::Resolved;
        }
        aborted
    }

    /// Drop every waiter whose handle reports ready; returns how many went
    pub fn prune_ready(&mut self) -> usize {
        let before = self.holding.len();
        self.holding.retain(|_, waiter| !waiter.is_ready());
        before - self.holding.len()
    }

    /// Drop a detached slot; live slots are left to their readiness signal
    pub fn remove_detached(&mut self, waiter_id: &str) -> bool {
        match self.holding.get(waiter_id) {
            Some(waiter) if waiter.is_detached() => {
                self.holding.remove(waiter_id);
                true
            }
            _ => false,
        }
    }
}
