//! Generic worker pools with flow-controlled work submission.
//!
//! A [`Pool`] runs `pool_size` identical [`Worker`]s, feeds them
//! [`WorkItem`]s, buffers everything they publish in a bounded results
//! channel, and re-raises worker failures in the caller. Three variants
//! share one contract:
//!
//! - [`SyncPool`]: inline on the caller's thread, strict FIFO results;
//!   the reference oracle for the other two.
//! - [`ThreadPool`]: `pool_size` parallel threads sharing memory.
//! - [`ProcessPool`]: one fresh OS process per worker; the only variant
//!   where a worker crash cannot corrupt the pool's memory.
//!
//! A [`ConcurrentVentilator`] feeds a predetermined (possibly repeating,
//! possibly shuffled) item sequence into a pool while bounding how many
//! items are in flight.
//!
//! ```ignore
//! let pool = ThreadPool::new(4)?;
//! pool.start::<RowGroupWorker>(Some(Value::Int(coeff)), None)?;
//! for rg in 0..row_groups {
//!     pool.ventilate(WorkItem::from_single("row_group", rg))?;
//! }
//! loop {
//!     match pool.get_results(None) {
//!         Ok(batch) => consume(batch),
//!         Err(PoolError::EmptyResult) => break,
//!         Err(error) => return Err(error.into()),
//!     }
//! }
//! pool.stop();
//! pool.join()?;
//! ```
//!
//! Binaries that use [`ProcessPool`] must register their worker types and
//! call [`run_spawned_worker`] first thing in `main`; see
//! [`pool::WorkerRegistry`].

pub mod bootstrap;
pub mod error;
mod ipc;
pub mod item;
pub mod pool;
pub mod ventilator;
pub mod worker;

pub use error::{PoolError, WorkerFailure};
pub use item::{Value, WorkItem};
pub use pool::{run_spawned_worker, Pool, ProcessPool, SyncPool, ThreadPool, WorkerRegistry};
pub use ventilator::{ConcurrentVentilator, Ventilator};
pub use worker::{Worker, WorkerContext};
