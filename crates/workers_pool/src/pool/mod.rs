//! src/pool/mod.rs
//!
//! Three interchangeable pool variants behind one lifecycle/operation
//! contract.
//!
//! # Architecture
//!
//! ```text
//!  caller / ventilator                         worker execution units
//!        |                                     (inline | threads | processes)
//!        |  ventilate(item)                               |
//!        +-----------------> work channel --------------->|
//!                                                         |  process(item)
//!        <----------------- results channel <-------------+  publish(value)*
//!        |  get_results()     (results, item-done           + item-done marker
//!        |                     markers, failures)
//! ```
//!
//! Every result-side message travels the same channel as an envelope:
//! published results, one `ItemDone` accounting marker per finished item,
//! and captured worker failures. Consuming a marker is what advances the
//! pool's processed count and relieves ventilator backpressure; consuming a
//! failure poisons the pool. Because each worker pushes its results before
//! its marker and the channel preserves per-producer order, equal
//! ventilated/processed counts prove that no unretrieved result exists,
//! which is what lets `get_results` distinguish "drained" from "not yet".

use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Condvar, Mutex};
use std::time::{Duration, Instant};

use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, SendTimeoutError, Sender};

use crate::error::{PoolError, WorkerFailure};
use crate::item::{Value, WorkItem};
use crate::ventilator::Ventilator;
use crate::worker::Worker;

mod process;
mod sync;
mod thread;

pub use process::{run_spawned_worker, ProcessPool, WorkerRegistry};
pub use sync::SyncPool;
pub use thread::ThreadPool;

/// Default capacity of the bounded results channel.
pub(crate) const DEFAULT_RESULTS_CAPACITY: usize = 50;

/// How often blocked channel operations wake up to re-check shutdown flags
/// and deadlines. A polling interval, not an error timeout.
pub(crate) const POLL_INTERVAL_MS: u64 = 100;

/// One lifecycle-and-operation contract over the three pool variants.
///
/// Lifecycle is strictly `NotStarted -> Running -> Stopped`; operations
/// outside their phase fail fast with a contract violation rather than
/// deadlocking or silently no-oping.
pub trait Pool {
    /// Instantiates the pool's workers and transitions to `Running`.
    ///
    /// Every worker is built from `W::new` with a unique `worker_id` in
    /// `[0, pool_size)` and the same `worker_args`. For the
    /// process-isolated variant this blocks until all workers have
    /// signaled readiness. A supplied ventilator is started last, once the
    /// pool can accept submissions.
    fn start<W: Worker>(
        &self,
        worker_args: Option<Value>,
        ventilator: Option<Box<dyn Ventilator>>,
    ) -> Result<(), PoolError>;

    /// Hands one work item to the next available worker. Never drops an
    /// item silently; fails if the pool is not running or its workers are
    /// unreachable.
    fn ventilate(&self, item: WorkItem) -> Result<(), PoolError>;

    /// Removes and returns one result.
    ///
    /// Blocks until a result arrives, `timeout` elapses
    /// ([`PoolError::Timeout`]), or the pool can prove nothing will ever
    /// arrive again ([`PoolError::EmptyResult`]). A captured worker
    /// failure is re-raised here instead, on this and every later call.
    fn get_results(&self, timeout: Option<Duration>) -> Result<Value, PoolError>;

    /// Signals all workers to cease after their current item. Idempotent.
    fn stop(&self);

    /// Blocks until every worker execution unit has fully exited and
    /// transport resources are released. Implies [`stop`](Self::stop).
    /// The pool cannot be started again afterwards.
    fn join(&self) -> Result<(), PoolError>;

    /// Instantaneous count of buffered, unretrieved results. Advisory
    /// only; racing producers may change it immediately.
    fn results_qsize(&self) -> usize;
}

/// Pool lifecycle phases. A pool passes through each at most once.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Lifecycle {
    NotStarted,
    Running,
    Stopped,
}

impl fmt::Display for Lifecycle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Lifecycle::NotStarted => write!(f, "not started"),
            Lifecycle::Running => write!(f, "running"),
            Lifecycle::Stopped => write!(f, "stopped"),
        }
    }
}

/// `NotStarted -> Running`, or a contract violation naming the pool and
/// the state that blocked it.
pub(crate) fn begin_start(state: &Mutex<Lifecycle>, label: &str) -> Result<(), PoolError> {
    let mut state = state.lock().expect("lifecycle lock poisoned");
    match *state {
        Lifecycle::NotStarted => {
            *state = Lifecycle::Running;
            Ok(())
        }
        current => Err(PoolError::contract(format!(
            "{} cannot be started: lifecycle state is already {}",
            label, current
        ))),
    }
}

pub(crate) fn ensure_running(
    state: &Mutex<Lifecycle>,
    label: &str,
    operation: &str,
) -> Result<(), PoolError> {
    let current = *state.lock().expect("lifecycle lock poisoned");
    if current == Lifecycle::Running {
        Ok(())
    } else {
        Err(PoolError::contract(format!(
            "{} cannot {}: lifecycle state is {}",
            label, operation, current
        )))
    }
}

/// `Running -> Stopped`. Returns whether this call performed the
/// transition, so `stop` can be idempotent while teardown runs once.
pub(crate) fn mark_stopped(state: &Mutex<Lifecycle>) -> bool {
    let mut state = state.lock().expect("lifecycle lock poisoned");
    if *state == Lifecycle::Running {
        *state = Lifecycle::Stopped;
        true
    } else {
        false
    }
}

/// Everything that can travel the results side of a pool.
#[derive(Debug)]
pub(crate) enum ResultEnvelope {
    /// A value published by a worker.
    Result(Value),
    /// Accounting marker: one work item fully processed.
    ItemDone,
    /// A failure captured at the worker boundary.
    Failure(WorkerFailure),
}

/// Blocking send that stays responsive to shutdown. Returns `false` when
/// the envelope could not be delivered (pool stopping or channel gone);
/// the producer should wind down in that case.
pub(crate) fn send_envelope(
    tx: &Sender<ResultEnvelope>,
    stop: &AtomicBool,
    envelope: ResultEnvelope,
) -> bool {
    let mut pending = envelope;
    loop {
        if stop.load(Ordering::Relaxed) {
            return false;
        }
        match tx.send_timeout(pending, Duration::from_millis(POLL_INTERVAL_MS)) {
            Ok(()) => return true,
            Err(SendTimeoutError::Timeout(back)) => pending = back,
            Err(SendTimeoutError::Disconnected(_)) => return false,
        }
    }
}

/// Ordered in-memory results buffer for the synchronous pool, where the
/// producer may be a ventilator thread and the consumer the caller.
pub(crate) struct ResultBuffer {
    queue: Mutex<VecDeque<ResultEnvelope>>,
    available: Condvar,
}

impl ResultBuffer {
    pub(crate) fn new() -> Self {
        Self {
            queue: Mutex::new(VecDeque::new()),
            available: Condvar::new(),
        }
    }

    pub(crate) fn push(&self, envelope: ResultEnvelope) {
        self.queue
            .lock()
            .expect("result buffer lock poisoned")
            .push_back(envelope);
        self.available.notify_all();
    }

    /// Pops the front envelope if one is already buffered.
    pub(crate) fn try_pop(&self) -> Option<ResultEnvelope> {
        self.queue
            .lock()
            .expect("result buffer lock poisoned")
            .pop_front()
    }

    /// Pops the front envelope, waiting up to `wait` for one to appear.
    pub(crate) fn pop_or_wait(&self, wait: Duration) -> Option<ResultEnvelope> {
        let mut queue = self.queue.lock().expect("result buffer lock poisoned");
        if let Some(envelope) = queue.pop_front() {
            return Some(envelope);
        }
        let (mut queue, _timed_out) = self
            .available
            .wait_timeout(queue, wait)
            .expect("result buffer lock poisoned");
        queue.pop_front()
    }

    pub(crate) fn len(&self) -> usize {
        self.queue.lock().expect("result buffer lock poisoned").len()
    }
}

/// The shared results side of the threaded and process pools: the bounded
/// envelope channel plus the accounting that decides emptiness and
/// poisoning.
pub(crate) struct ResultsChannel {
    tx: Sender<ResultEnvelope>,
    rx: Receiver<ResultEnvelope>,
    ventilated: AtomicUsize,
    processed: AtomicUsize,
    poisoned: Mutex<Option<WorkerFailure>>,
    ventilator: Mutex<Option<Box<dyn Ventilator>>>,
}

impl ResultsChannel {
    pub(crate) fn new(capacity: usize) -> Self {
        let (tx, rx) = bounded(capacity);
        Self {
            tx,
            rx,
            ventilated: AtomicUsize::new(0),
            processed: AtomicUsize::new(0),
            poisoned: Mutex::new(None),
            ventilator: Mutex::new(None),
        }
    }

    pub(crate) fn sender(&self) -> Sender<ResultEnvelope> {
        self.tx.clone()
    }

    pub(crate) fn qsize(&self) -> usize {
        self.rx.len()
    }

    pub(crate) fn record_ventilated(&self) {
        self.ventilated.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn attach_ventilator(&self, ventilator: Box<dyn Ventilator>) {
        *self.ventilator.lock().expect("ventilator slot lock poisoned") = Some(ventilator);
    }

    pub(crate) fn start_ventilator(&self) -> Result<(), PoolError> {
        if let Some(ventilator) = &*self.ventilator.lock().expect("ventilator slot lock poisoned") {
            ventilator.start()?;
        }
        Ok(())
    }

    pub(crate) fn stop_ventilator(&self) {
        if let Some(ventilator) = &*self.ventilator.lock().expect("ventilator slot lock poisoned") {
            ventilator.stop();
        }
    }

    /// Drops the ventilator handle. A ventilator's submission closure
    /// usually owns a pool handle, so this is what breaks the reference
    /// cycle at teardown.
    pub(crate) fn clear_ventilator(&self) {
        self.ventilator
            .lock()
            .expect("ventilator slot lock poisoned")
            .take();
    }

    fn ventilation_pending(&self) -> bool {
        self.ventilator
            .lock()
            .expect("ventilator slot lock poisoned")
            .as_ref()
            .map_or(false, |ventilator| !ventilator.completed())
    }

    fn note_processed(&self) {
        self.processed.fetch_add(1, Ordering::Relaxed);
        if let Some(ventilator) = &*self.ventilator.lock().expect("ventilator slot lock poisoned") {
            ventilator.processed_item();
        }
    }

    fn poisoned(&self) -> Option<WorkerFailure> {
        self.poisoned.lock().expect("poison lock poisoned").clone()
    }

    fn poison(&self, failure: WorkerFailure) {
        let mut poisoned = self.poisoned.lock().expect("poison lock poisoned");
        // First failure wins; later ones repeat the same story.
        if poisoned.is_none() {
            log::warn!("pool poisoned by {}", failure);
            *poisoned = Some(failure);
        }
    }

    /// The drain loop shared by the threaded and process pools.
    ///
    /// `fatal` is probed while idle so a variant can surface conditions the
    /// channel itself cannot express (severed process transport).
    pub(crate) fn next_result(
        &self,
        timeout: Option<Duration>,
        fatal: impl Fn() -> Option<PoolError>,
    ) -> Result<Value, PoolError> {
        if let Some(failure) = self.poisoned() {
            return Err(failure.into());
        }
        let deadline = timeout.map(|t| Instant::now() + t);
        loop {
            // Emptiness proof, completion sampled first: a ventilator
            // observed completed can never submit again, so reading equal
            // ventilated/processed counts afterwards proves the channel is
            // drained. Sampling the counters first would race the final
            // submission and strand its result.
            if !self.ventilation_pending()
                && self.ventilated.load(Ordering::Relaxed)
                    == self.processed.load(Ordering::Relaxed)
            {
                return Err(PoolError::EmptyResult);
            }
            if let Some(error) = fatal() {
                return Err(error);
            }

            let poll = Duration::from_millis(POLL_INTERVAL_MS);
            let wait = match deadline {
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        // timeout is Some whenever deadline is.
                        return Err(PoolError::Timeout(timeout.unwrap_or_default()));
                    }
                    poll.min(deadline - now)
                }
                None => poll,
            };

            match self.rx.recv_timeout(wait) {
                Ok(ResultEnvelope::Result(value)) => return Ok(value),
                Ok(ResultEnvelope::ItemDone) => self.note_processed(),
                Ok(ResultEnvelope::Failure(failure)) => {
                    self.poison(failure.clone());
                    return Err(failure.into());
                }
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => {
                    return Err(PoolError::transport(
                        "results channel disconnected; all workers exited",
                    ));
                }
            }
        }
    }
}
