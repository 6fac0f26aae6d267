//! src/error.rs
//!
//! Error surface of the pool subsystem.
//!
//! Callers need to distinguish "nothing left to drain" from "nothing yet"
//! from "a worker blew up", so the crate exposes a closed error enum rather
//! than an opaque error chain. Worker implementations themselves return
//! `anyhow::Result` and are free to carry whatever context they like; the
//! pool flattens those into a [`WorkerFailure`] at the worker boundary.

use std::time::Duration;
use thiserror::Error;

/// Crate-wide result alias.
pub type Result<T, E = PoolError> = std::result::Result<T, E>;

/// A failure captured at a worker boundary.
///
/// Carries the id of the worker slot that failed and the rendered error
/// message. Cloneable so a poisoned pool can keep re-raising the same
/// failure on every retrieval until it is stopped.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("worker {worker_id} failed: {message}")]
pub struct WorkerFailure {
    /// Slot id of the worker that failed, in `[0, pool_size)`.
    pub worker_id: usize,
    /// Rendered error chain (or panic payload) from the worker.
    pub message: String,
}

impl WorkerFailure {
    pub(crate) fn new(worker_id: usize, message: impl Into<String>) -> Self {
        Self {
            worker_id,
            message: message.into(),
        }
    }
}

/// Everything that can go wrong when driving a pool or a ventilator.
#[derive(Debug, Error)]
pub enum PoolError {
    /// Nothing is buffered and nothing can ever arrive again: every
    /// ventilated item has been accounted for and no attached ventilator
    /// has submissions left. Callers use this to detect drain completion.
    #[error("no results are pending and no further ventilation is expected")]
    EmptyResult,

    /// No result arrived within the caller's deadline. Recoverable; more
    /// results may still show up on a later call.
    #[error("timed out after {0:?} while waiting for a result")]
    Timeout(Duration),

    /// A worker failed while constructing or processing. Once observed,
    /// the pool keeps returning this on every retrieval until stopped.
    #[error(transparent)]
    WorkerFailed(#[from] WorkerFailure),

    /// Lifecycle misuse: starting twice, restarting a joined pool, or
    /// ventilating/retrieving outside the `Running` state.
    #[error("contract violation: {0}")]
    ContractViolation(String),

    /// The channel to the workers is gone (all execution units exited, or
    /// a worker process pipe was severed without a failure report).
    #[error("worker transport severed: {0}")]
    Transport(String),

    /// Rejected constructor or builder input.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// I/O failure while spawning or talking to a worker process.
    #[error("worker process i/o failed: {0}")]
    Io(#[from] std::io::Error),

    /// A work item, result, or bootstrap payload failed to encode/decode.
    #[error("message codec failed: {0}")]
    Codec(#[from] serde_json::Error),
}

impl PoolError {
    pub(crate) fn contract(message: impl Into<String>) -> Self {
        Self::ContractViolation(message.into())
    }

    pub(crate) fn transport(message: impl Into<String>) -> Self {
        Self::Transport(message.into())
    }
}
