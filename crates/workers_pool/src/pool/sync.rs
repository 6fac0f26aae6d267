//! src/pool/sync.rs
//!
//! The synchronous pool: one worker, run inline on the submitting thread.
//!
//! `ventilate` calls the worker's `process` immediately and buffers
//! whatever it publishes in an ordered in-memory queue, so result order
//! exactly equals submission order (FIFO across multiple results per
//! item). That determinism is why this variant doubles as the reference
//! oracle in the correctness tests of the concurrent variants.
//!
//! The submitting thread may be a ventilator's control thread rather than
//! the caller, so the buffer still has to support a caller blocked in
//! `get_results` while results arrive from elsewhere.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use crate::error::{PoolError, WorkerFailure};
use crate::item::{Value, WorkItem};
use crate::ventilator::Ventilator;
use crate::worker::{process_guarded, Publisher, PublishSink, Worker, WorkerContext};

use super::{
    begin_start, ensure_running, mark_stopped, Lifecycle, Pool, ResultBuffer, ResultEnvelope,
    POLL_INTERVAL_MS,
};

/// In-caller pool with strict FIFO result order.
///
/// Cheap-clone handle; clones share the same pool.
#[derive(Clone)]
pub struct SyncPool {
    inner: Arc<SyncPoolInner>,
}

struct SyncPoolInner {
    state: Mutex<Lifecycle>,
    worker: Mutex<Option<Box<dyn Worker>>>,
    buffer: Arc<ResultBuffer>,
    poisoned: Mutex<Option<WorkerFailure>>,
    ventilator: Mutex<Option<Box<dyn Ventilator>>>,
    items_handled: AtomicUsize,
}

impl SyncPool {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(SyncPoolInner {
                state: Mutex::new(Lifecycle::NotStarted),
                worker: Mutex::new(None),
                buffer: Arc::new(ResultBuffer::new()),
                poisoned: Mutex::new(None),
                ventilator: Mutex::new(None),
                items_handled: AtomicUsize::new(0),
            }),
        }
    }

    /// Count of items fully processed so far. Advisory.
    pub fn items_handled(&self) -> usize {
        self.inner.items_handled.load(Ordering::Relaxed)
    }

    fn label() -> &'static str {
        "SyncPool"
    }
}

impl Default for SyncPool {
    fn default() -> Self {
        Self::new()
    }
}

impl SyncPoolInner {
    fn poisoned(&self) -> Option<WorkerFailure> {
        self.poisoned.lock().expect("poison lock poisoned").clone()
    }

    fn poison(&self, failure: &WorkerFailure) {
        let mut poisoned = self.poisoned.lock().expect("poison lock poisoned");
        if poisoned.is_none() {
            log::warn!("pool poisoned by {}", failure);
            *poisoned = Some(failure.clone());
        }
    }

    fn ventilation_pending(&self) -> bool {
        self.ventilator
            .lock()
            .expect("ventilator slot lock poisoned")
            .as_ref()
            .map_or(false, |ventilator| !ventilator.completed())
    }

    fn notify_processed_item(&self) {
        self.items_handled.fetch_add(1, Ordering::Relaxed);
        if let Some(ventilator) = &*self
            .ventilator
            .lock()
            .expect("ventilator slot lock poisoned")
        {
            ventilator.processed_item();
        }
    }

    fn stop_ventilator(&self) {
        // Take the ventilator out of the slot before stopping it. stop()
        // joins the control thread, and that thread reports processed
        // items through this same slot lock; holding the guard across the
        // join would deadlock against an in-flight submission.
        let ventilator = self
            .ventilator
            .lock()
            .expect("ventilator slot lock poisoned")
            .take();
        if let Some(ventilator) = ventilator {
            ventilator.stop();
        }
    }
}

impl Pool for SyncPool {
    fn start<W: Worker>(
        &self,
        worker_args: Option<Value>,
        ventilator: Option<Box<dyn Ventilator>>,
    ) -> Result<(), PoolError> {
        begin_start(&self.inner.state, Self::label())?;

        let publisher = Publisher::new(PublishSink::Buffer(Arc::clone(&self.inner.buffer)));
        let context = WorkerContext::new(0, worker_args, publisher);
        let worker = match W::new(context) {
            Ok(worker) => worker,
            Err(error) => {
                // Startup failed; the pool is unusable, not restartable.
                mark_stopped(&self.inner.state);
                return Err(WorkerFailure::new(0, format!("construction failed: {:#}", error)).into());
            }
        };
        *self.inner.worker.lock().expect("worker lock poisoned") = Some(Box::new(worker));

        if let Some(ventilator) = ventilator {
            // Store before starting, so the feed thread's processed_item
            // notifications find the slot occupied from its first item on.
            let mut slot = self
                .inner
                .ventilator
                .lock()
                .expect("ventilator slot lock poisoned");
            slot.insert(ventilator).start()?;
        }
        Ok(())
    }

    fn ventilate(&self, item: WorkItem) -> Result<(), PoolError> {
        ensure_running(&self.inner.state, Self::label(), "ventilate")?;
        if let Some(failure) = self.inner.poisoned() {
            return Err(failure.into());
        }

        let mut worker = self.inner.worker.lock().expect("worker lock poisoned");
        let active = worker.as_deref_mut().ok_or_else(|| {
            PoolError::contract(format!("{} has no live worker", Self::label()))
        })?;
        match process_guarded(active, item) {
            Ok(()) => {
                self.inner.notify_processed_item();
                Ok(())
            }
            Err(message) => {
                // The worker is done for; capture the failure both for the
                // results stream and for every later submission attempt.
                let failure = WorkerFailure::new(0, message);
                worker.take();
                self.inner.poison(&failure);
                self.inner
                    .buffer
                    .push(ResultEnvelope::Failure(failure.clone()));
                Err(failure.into())
            }
        }
    }

    fn get_results(&self, timeout: Option<Duration>) -> Result<Value, PoolError> {
        ensure_running(&self.inner.state, Self::label(), "retrieve results")?;
        let deadline = timeout.map(|t| Instant::now() + t);
        let poll = Duration::from_millis(POLL_INTERVAL_MS);

        loop {
            // Completion is sampled before the buffer: the feed loop
            // pushes its final results before it turns completed, so a
            // completed-then-empty observation cannot strand a delivered
            // result.
            let ventilation_pending = self.inner.ventilation_pending();
            let envelope = match self.inner.buffer.try_pop() {
                Some(envelope) => envelope,
                None => {
                    if let Some(failure) = self.inner.poisoned() {
                        return Err(failure.into());
                    }
                    if !ventilation_pending {
                        return Err(PoolError::EmptyResult);
                    }
                    // A ventilator is still feeding; wait for its next push.
                    let wait = match deadline {
                        Some(deadline) => {
                            let now = Instant::now();
                            if now >= deadline {
                                return Err(PoolError::Timeout(timeout.unwrap_or_default()));
                            }
                            poll.min(deadline - now)
                        }
                        None => poll,
                    };
                    match self.inner.buffer.pop_or_wait(wait) {
                        Some(envelope) => envelope,
                        None => continue,
                    }
                }
            };

            match envelope {
                ResultEnvelope::Result(value) => return Ok(value),
                ResultEnvelope::Failure(failure) => {
                    self.inner.poison(&failure);
                    return Err(failure.into());
                }
                // The inline pool accounts items at ventilate time and
                // never emits markers.
                ResultEnvelope::ItemDone => {}
            }
        }
    }

    fn stop(&self) {
        self.inner.stop_ventilator();
        mark_stopped(&self.inner.state);
    }

    fn join(&self) -> Result<(), PoolError> {
        self.stop();
        // Drop the worker and the ventilator handle; the latter breaks the
        // pool <-> ventilator reference cycle.
        self.inner.worker.lock().expect("worker lock poisoned").take();
        self.inner
            .ventilator
            .lock()
            .expect("ventilator slot lock poisoned")
            .take();
        Ok(())
    }

    fn results_qsize(&self) -> usize {
        self.inner.buffer.len()
    }
}
