//! Rendezvous error types

use thiserror::Error;

/// Errors raised while declaring a rendezvous point
///
/// These are configuration mistakes made by the caller. They are returned
/// before any barrier state is touched.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RendezvousError {
    #[error("must specify name")]
    EmptyName,

    #[error("must specify quorum >= 1 (got {0})")]
    InvalidQuorum(u32),

    #[error("must specify waiter id")]
    EmptyWaiterId,
}
