//! BarrierRegistry - the process-wide table of rendezvous points
//!
//! Every public operation runs as one critical section under a single mutex:
//! hydrate from the store (first use only), clean up, mutate, clean up again,
//! save. There is no per-barrier locking.
//!
//! Persistence failures never fail an operation. A load failure degrades to
//! an empty table; a save failure is logged and the in-memory table stays
//! authoritative.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard, OnceLock, PoisonError};

use serde::Serialize;
use tracing::{debug, info, warn};

use crate::barrier::{Admission, Barrier, HeldWaiter, WaiterState};
use crate::error::RendezvousError;
use crate::step::RendezvousStep;
use crate::store::{BarrierDocument, JsonFileStore, PersistedBarrier, PersistedWaiter, PersistentStore};
use crate::waiter::WaiterHandle;

type Table = BTreeMap<String, Barrier>;

/// What happened to an arriving waiter
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Arrival {
    /// Still short of quorum; `holding` counts every slot of the barrier
    Waiting { holding: usize, quorum: u32 },
    /// This arrival released `released` waiters (itself included)
    Released { released: usize },
}

/// What a cleanup pass removed
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CleanupReport {
    pub waiters_removed: usize,
    pub barriers_removed: usize,
}

impl CleanupReport {
    fn merge(self, other: CleanupReport) -> Self {
        Self {
            waiters_removed: self.waiters_removed + other.waiters_removed,
            barriers_removed: self.barriers_removed + other.barriers_removed,
        }
    }
}

/// Read-only view of one barrier
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BarrierStatus {
    pub name: String,
    pub quorum: u32,
    /// Waiter ids not yet released
    pub held: Vec<String>,
    /// Waiter ids released but not yet pruned
    pub resolved: Vec<String>,
    /// Slots restored from disk whose handle has not been re-supplied
    pub detached: usize,
}

impl BarrierStatus {
    fn of(name: &str, barrier: &Barrier) -> Self {
        let ids_in = |state: WaiterState| {
            barrier
                .holding()
                .iter()
                .filter(|(_, waiter)| waiter.state == state)
                .map(|(id, _)| id.clone())
                .collect::<Vec<_>>()
        };
        Self {
            name: name.to_string(),
            quorum: barrier.quorum(),
            held: ids_in(WaiterState::Held),
            resolved: ids_in(WaiterState::Resolved),
            detached: barrier.holding().values().filter(|w| w.is_detached()).count(),
        }
    }
}

/// Process-wide rendezvous table
pub struct BarrierRegistry {
    store: Arc<dyn PersistentStore>,
    /// `None` until hydrated from the store
    table: Mutex<Option<Table>>,
}

impl BarrierRegistry {
    pub fn new(store: Arc<dyn PersistentStore>) -> Self {
        Self {
            store,
            table: Mutex::new(None),
        }
    }

    /// Registry backed by a JSON file in `state_dir`
    pub fn open(state_dir: impl Into<PathBuf>) -> Self {
        Self::new(Arc::new(JsonFileStore::new(state_dir)))
    }

    /// Arrive at a rendezvous point
    ///
    /// Holds the waiter, and if the barrier's slots (released ones not yet
    /// pruned included) reach quorum, releases every held waiter (this one
    /// included) before returning. Re-entering with an id that is already
    /// held replaces its handle.
    pub fn enter(
        &self,
        step: &RendezvousStep,
        waiter_id: &str,
        handle: Arc<dyn WaiterHandle>,
    ) -> Result<Arrival, RendezvousError> {
        if waiter_id.is_empty() {
            return Err(RendezvousError::EmptyWaiterId);
        }
        let name = step.name();
        debug!(%name, %waiter_id, quorum = step.quorum(), "BarrierRegistry::enter: called");
        notify(handle.as_ref(), &format!("Reached rendezvous point {}", name));

        let mut guard = self.lock();
        let table = self.hydrate(&mut guard);
        cleanup_table(table);

        let barrier = table
            .entry(name.to_string())
            .or_insert_with(|| Barrier::new(step.quorum()));
        if let Some(previous) = barrier.set_quorum(step.quorum()) {
            warn!(%name, previous, quorum = step.quorum(), "Rendezvous quorum overwritten by later arrival");
        }

        let arrival = match barrier.block(waiter_id, handle.clone()) {
            Admission::AlreadyReleased => {
                notify(handle.as_ref(), "Critical mass reached. Proceeding.");
                Arrival::Released { released: 1 }
            }
            Admission::Held if barrier.has_quorum() => {
                notify(handle.as_ref(), "Critical mass reached. Proceeding.");
                let released = barrier.unblock();
                info!(%name, released, "Rendezvous point released");
                Arrival::Released { released }
            }
            Admission::Held => {
                let holding = barrier.holding().len();
                notify(
                    handle.as_ref(),
                    &format!("Waiting on rendezvous {} of {}", holding, barrier.quorum()),
                );
                Arrival::Waiting {
                    holding,
                    quorum: barrier.quorum(),
                }
            }
        };

        cleanup_table(table);
        self.save(table);
        Ok(arrival)
    }

    /// Tear-down of a participant that was never released
    ///
    /// Brings the persisted table in line with reality. Live waiters are
    /// pruned through their own readiness signal, which the host sets before
    /// calling this; a detached slot with this id is dropped outright since
    /// nothing will ever report for it.
    pub fn stop(&self, waiter_id: &str) -> CleanupReport {
        debug!(%waiter_id, "BarrierRegistry::stop: called");
        let mut guard = self.lock();
        let table = self.hydrate(&mut guard);

        let mut report = cleanup_table(table);
        for (name, barrier) in table.iter_mut() {
            if barrier.remove_detached(waiter_id) {
                debug!(%name, %waiter_id, "BarrierRegistry::stop: dropped detached waiter");
                report.waiters_removed += 1;
            }
        }
        let report = report.merge(cleanup_table(table));

        self.save(table);
        report
    }

    /// Prune waiters whose handles report ready, then empty barriers
    pub fn cleanup(&self) -> CleanupReport {
        debug!("BarrierRegistry::cleanup: called");
        let mut guard = self.lock();
        let table = self.hydrate(&mut guard);
        let report = cleanup_table(table);
        self.save(table);
        report
    }

    /// Abort a rendezvous point, failing every live held waiter
    ///
    /// Returns false when no such point exists.
    pub fn forget(&self, name: &str) -> bool {
        debug!(%name, "BarrierRegistry::forget: called");
        let mut guard = self.lock();
        let table = self.hydrate(&mut guard);
        cleanup_table(table);

        let existed = match table.remove(name) {
            Some(mut barrier) => {
                let aborted = barrier.abort(&format!("rendezvous point {} was forgotten", name));
                info!(%name, aborted, "Rendezvous point forgotten");
                true
            }
            None => false,
        };

        cleanup_table(table);
        self.save(table);
        existed
    }

    /// Status of every barrier, sorted by name
    pub fn statuses(&self) -> Vec<BarrierStatus> {
        let mut guard = self.lock();
        let table = self.hydrate(&mut guard);
        table
            .iter()
            .map(|(name, barrier)| BarrierStatus::of(name, barrier))
            .collect()
    }

    pub fn status(&self, name: &str) -> Option<BarrierStatus> {
        let mut guard = self.lock();
        let table = self.hydrate(&mut guard);
        table.get(name).map(|barrier| BarrierStatus::of(name, barrier))
    }

    fn lock(&self) -> MutexGuard<'_, Option<Table>> {
        self.table.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Load the table on first use; later calls reuse the in-memory copy
    fn hydrate<'a>(&self, slot: &'a mut Option<Table>) -> &'a mut Table {
        slot.get_or_insert_with(|| {
            let table = match self.store.load() {
                Ok(Some(document)) => table_from_document(document),
                Ok(None) => Table::new(),
                Err(e) => {
                    warn!(error = %e, "Failed to load rendezvous state, starting empty");
                    Table::new()
                }
            };
            debug!(barriers = table.len(), "BarrierRegistry::hydrate: loaded");
            table
        })
    }

    fn save(&self, table: &Table) {
        let document = document_from_table(table);
        match self.store.save(&document) {
            Ok(()) => debug!(barriers = document.barriers.len(), "BarrierRegistry::save: saved"),
            Err(e) => warn!(error = %e, "Failed to save rendezvous state"),
        }
    }
}

/// Lazily constructed registry shared by every participant of a process
///
/// The registry is built by the factory on the first [`SharedRegistry::get`]
/// and the same `Arc` is handed out afterwards.
pub struct SharedRegistry {
    cell: OnceLock<Arc<BarrierRegistry>>,
    factory: Box<dyn Fn() -> BarrierRegistry + Send + Sync>,
}

impl SharedRegistry {
    pub fn new(factory: impl Fn() -> BarrierRegistry + Send + Sync + 'static) -> Self {
        Self {
            cell: OnceLock::new(),
            factory: Box::new(factory),
        }
    }

    pub fn get(&self) -> Arc<BarrierRegistry> {
        self.cell
            .get_or_init(|| {
                debug!("SharedRegistry::get: constructing registry");
                Arc::new((self.factory)())
            })
            .clone()
    }

    pub fn is_initialized(&self) -> bool {
        self.cell.get().is_some()
    }
}

fn notify(handle: &dyn WaiterHandle, message: &str) {
    if let Err(e) = handle.notify(message) {
        warn!(error = %e, %message, "Failed to deliver rendezvous message");
    }
}

fn cleanup_table(table: &mut Table) -> CleanupReport {
    let mut report = CleanupReport::default();
    for barrier in table.values_mut() {
        report.waiters_removed += barrier.prune_ready();
    }
    let before = table.len();
    table.retain(|_, barrier| !barrier.is_empty());
    report.barriers_removed = before - table.len();
    report
}

fn table_from_document(document: BarrierDocument) -> Table {
    document
        .barriers
        .into_iter()
        .filter(|(_, persisted)| !persisted.holding.is_empty())
        .map(|(name, persisted)| {
            let holding = persisted
                .holding
                .into_iter()
                .map(|(id, waiter)| (id, HeldWaiter::detached(waiter.state, waiter.entered_at)))
                .collect();
            (name, Barrier::restore(persisted.quorum.max(1), holding))
        })
        .collect()
}

fn document_from_table(table: &Table) -> BarrierDocument {
    let barriers = table
        .iter()
        .map(|(name, barrier)| {
            let holding = barrier
                .holding()
                .iter()
                .map(|(id, waiter)| {
                    (
                        id.clone(),
                        PersistedWaiter {
                            state: waiter.state,
                            entered_at: waiter.entered_at,
                        },
                    )
                })
                .collect();
            (
                name.clone(),
                PersistedBarrier {
                    quorum: barrier.quorum(),
                    holding,
                },
            )
        })
        .collect();
    BarrierDocument::new(barriers)
}
