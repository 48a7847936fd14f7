//! Rendezvous - named barriers that survive restarts
//!
//! Any number of long-lived participants declare "I have reached point X and
//! I need N of us here", stay suspended until the quorum arrives, and are
//! then released together. Who is waiting where is persisted, so a restart
//! of the hosting process does not lose the barrier.
//!
//! # Architecture
//!
//! ```text
//! participant ──enter──▶ BarrierRegistry (one mutex)
//!                          ├── Barrier "deploy"  quorum=3  {w1: held, w2: held}
//!                          ├── Barrier "verify"  quorum=2  {w7: resolved}
//!                          └── PersistentStore  ──▶ <state-dir>/rendezvous.json
//! ```
//!
//! # Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use rendezvous::{BarrierRegistry, ChannelWaiter, RendezvousStep, TracingSink};
//!
//! let registry = BarrierRegistry::open("/var/lib/rendezvous");
//! let step = RendezvousStep::new("deploy", 3)?;
//! let (handle, ticket) = ChannelWaiter::new(Arc::new(TracingSink::new("build-42")));
//! step.enter(&registry, "build-42", handle)?;
//! let outcome = ticket.wait().await;
//! ```

pub mod barrier;
pub mod cli;
pub mod config;
pub mod error;
pub mod registry;
pub mod step;
pub mod store;
pub mod waiter;

pub use barrier::{Admission, Barrier, WaiterState};
pub use config::Config;
pub use error::RendezvousError;
pub use registry::{Arrival, BarrierRegistry, BarrierStatus, CleanupReport, SharedRegistry};
pub use step::RendezvousStep;
pub use store::{BarrierDocument, JsonFileStore, MemoryStore, PersistedBarrier, PersistedWaiter, PersistentStore};
pub use waiter::{ChannelWaiter, MemorySink, Outcome, OutputSink, TracingSink, WaitTicket, WaiterHandle};
