//! src/pool/thread.rs
//!
//! The threaded pool: `pool_size` workers, each pinned to one thread,
//! sharing process memory.
//!
//! Work distribution is a single shared channel that idle workers pull
//! from; results flow back through the bounded envelope channel. All
//! blocking operations poll a shutdown flag so `stop` + `join` terminate
//! even when workers sit blocked on a full results channel that nobody is
//! draining.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use crossbeam_channel::{unbounded, Receiver, RecvTimeoutError, Sender};

use crate::error::{PoolError, WorkerFailure};
use crate::item::{Value, WorkItem};
use crate::ventilator::Ventilator;
use crate::worker::{process_guarded, Publisher, PublishSink, Worker, WorkerContext};

use super::{
    begin_start, ensure_running, mark_stopped, send_envelope, Lifecycle, Pool, ResultEnvelope,
    ResultsChannel, DEFAULT_RESULTS_CAPACITY, POLL_INTERVAL_MS,
};

/// Shared-memory parallel pool.
///
/// Cheap-clone handle; clones share the same pool.
#[derive(Clone)]
pub struct ThreadPool {
    inner: Arc<ThreadPoolInner>,
}

struct ThreadPoolInner {
    label: String,
    state: Mutex<Lifecycle>,
    work_tx: Mutex<Option<Sender<WorkItem>>>,
    work_rx: Receiver<WorkItem>,
    results: ResultsChannel,
    stop: Arc<AtomicBool>,
    /// Worker threads still in their loop. The pool keeps its own clone of
    /// the work receiver, so channel disconnection cannot signal "all
    /// workers gone"; this counter does.
    live: Arc<AtomicUsize>,
    handles: Mutex<Vec<thread::JoinHandle<()>>>,
    size: usize,
}

impl ThreadPool {
    /// Creates a pool of `workers_count` threads with the default results
    /// capacity.
    pub fn new(workers_count: usize) -> Result<Self, PoolError> {
        Self::with_results_capacity(workers_count, DEFAULT_RESULTS_CAPACITY)
    }

    /// Creates a pool with an explicit results-channel capacity. The
    /// capacity bounds how far workers can run ahead of the consumer.
    pub fn with_results_capacity(
        workers_count: usize,
        results_capacity: usize,
    ) -> Result<Self, PoolError> {
        if workers_count == 0 {
            return Err(PoolError::InvalidConfig(
                "cannot create a ThreadPool with 0 workers; use SyncPool for inline processing"
                    .to_owned(),
            ));
        }
        if results_capacity == 0 {
            return Err(PoolError::InvalidConfig(
                "results capacity must be > 0 to prevent deadlocks".to_owned(),
            ));
        }

        let (work_tx, work_rx) = unbounded();
        Ok(Self {
            inner: Arc::new(ThreadPoolInner {
                label: format!("ThreadPool({})", workers_count),
                state: Mutex::new(Lifecycle::NotStarted),
                work_tx: Mutex::new(Some(work_tx)),
                work_rx,
                results: ResultsChannel::new(results_capacity),
                stop: Arc::new(AtomicBool::new(false)),
                live: Arc::new(AtomicUsize::new(0)),
                handles: Mutex::new(Vec::new()),
                size: workers_count,
            }),
        })
    }

    pub fn workers_count(&self) -> usize {
        self.inner.size
    }
}

impl Pool for ThreadPool {
    fn start<W: Worker>(
        &self,
        worker_args: Option<Value>,
        ventilator: Option<Box<dyn Ventilator>>,
    ) -> Result<(), PoolError> {
        let inner = &self.inner;
        begin_start(&inner.state, &inner.label)?;

        // Construct every worker before spawning any thread, so a failed
        // constructor aborts startup with nothing to clean up.
        let mut workers = Vec::with_capacity(inner.size);
        for worker_id in 0..inner.size {
            let publisher = Publisher::new(PublishSink::Channel {
                tx: inner.results.sender(),
                stop: Arc::clone(&inner.stop),
            });
            let context = WorkerContext::new(worker_id, worker_args.clone(), publisher);
            match W::new(context) {
                Ok(worker) => workers.push(Box::new(worker) as Box<dyn Worker>),
                Err(error) => {
                    mark_stopped(&inner.state);
                    return Err(WorkerFailure::new(
                        worker_id,
                        format!("construction failed: {:#}", error),
                    )
                    .into());
                }
            }
        }

        inner.live.store(inner.size, Ordering::Relaxed);
        let mut handles = inner.handles.lock().expect("handles lock poisoned");
        for (worker_id, worker) in workers.into_iter().enumerate() {
            let work_rx = inner.work_rx.clone();
            let results_tx = inner.results.sender();
            let stop = Arc::clone(&inner.stop);
            let live = Arc::clone(&inner.live);
            let handle = thread::Builder::new()
                .name(format!("pool-worker-{}", worker_id))
                .spawn(move || {
                    worker_loop(worker_id, worker, work_rx, results_tx, stop);
                    live.fetch_sub(1, Ordering::Relaxed);
                })?;
            handles.push(handle);
        }
        drop(handles);
        log::debug!("{} started", inner.label);

        if let Some(ventilator) = ventilator {
            inner.results.attach_ventilator(ventilator);
            inner.results.start_ventilator()?;
        }
        Ok(())
    }

    fn ventilate(&self, item: WorkItem) -> Result<(), PoolError> {
        let inner = &self.inner;
        ensure_running(&inner.state, &inner.label, "ventilate")?;
        // Every worker thread gone means nothing can ever consume the item;
        // report severance instead of queueing into the void.
        if inner.live.load(Ordering::Relaxed) == 0 {
            return Err(PoolError::transport(format!(
                "{}: all worker threads have exited",
                inner.label
            )));
        }

        let guard = inner.work_tx.lock().expect("work sender lock poisoned");
        let tx = guard
            .as_ref()
            .ok_or_else(|| PoolError::transport(format!("{}: work channel closed", inner.label)))?;
        tx.send(item).map_err(|_| {
            PoolError::transport(format!("{}: all worker threads have exited", inner.label))
        })?;
        // Count only after the channel accepted the item, so the emptiness
        // proof never waits for something that was not delivered.
        inner.results.record_ventilated();
        Ok(())
    }

    fn get_results(&self, timeout: Option<Duration>) -> Result<Value, PoolError> {
        let inner = &self.inner;
        ensure_running(&inner.state, &inner.label, "retrieve results")?;
        inner.results.next_result(timeout, || None)
    }

    fn stop(&self) {
        let inner = &self.inner;
        inner.results.stop_ventilator();
        if mark_stopped(&inner.state) {
            inner.stop.store(true, Ordering::Relaxed);
        }
    }

    fn join(&self) -> Result<(), PoolError> {
        let inner = &self.inner;
        self.stop();

        // Closing the work channel wakes idle workers out of their recv.
        inner
            .work_tx
            .lock()
            .expect("work sender lock poisoned")
            .take();
        let handles: Vec<_> = inner
            .handles
            .lock()
            .expect("handles lock poisoned")
            .drain(..)
            .collect();
        for handle in handles {
            let _ = handle.join();
        }
        // Release the ventilator handle; it closes the reference cycle
        // between the pool and a ventilator bound to it.
        inner.results.clear_ventilator();
        log::debug!("{} joined", inner.label);
        Ok(())
    }

    fn results_qsize(&self) -> usize {
        self.inner.results.qsize()
    }
}

impl Drop for ThreadPoolInner {
    fn drop(&mut self) {
        // Last handle gone: make sure worker threads wind down.
        self.stop.store(true, Ordering::Relaxed);
        if let Ok(tx) = self.work_tx.get_mut() {
            tx.take();
        }
        if let Ok(handles) = self.handles.get_mut() {
            for handle in handles.drain(..) {
                let _ = handle.join();
            }
        }
    }
}

/// One worker thread: pull, process, account; exit on failure or
/// shutdown.
fn worker_loop(
    worker_id: usize,
    mut worker: Box<dyn Worker>,
    work_rx: Receiver<WorkItem>,
    results_tx: Sender<ResultEnvelope>,
    stop: Arc<AtomicBool>,
) {
    while !stop.load(Ordering::Relaxed) {
        let item = match work_rx.recv_timeout(Duration::from_millis(POLL_INTERVAL_MS)) {
            Ok(item) => item,
            Err(RecvTimeoutError::Timeout) => continue,
            Err(RecvTimeoutError::Disconnected) => break,
        };

        match process_guarded(worker.as_mut(), item) {
            Ok(()) => {
                if !send_envelope(&results_tx, &stop, ResultEnvelope::ItemDone) {
                    break;
                }
            }
            Err(message) => {
                send_envelope(
                    &results_tx,
                    &stop,
                    ResultEnvelope::Failure(WorkerFailure::new(worker_id, message)),
                );
                break;
            }
        }
    }
    log::debug!("pool-worker-{} exiting", worker_id);
}
