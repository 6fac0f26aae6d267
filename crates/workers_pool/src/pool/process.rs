//! src/pool/process.rs
//!
//! The process-isolated pool: each worker in its own OS process.
//!
//! This is the only variant where a worker crash cannot corrupt the pool's
//! memory, at the cost of serializing every item and result. Each child is
//! a fresh spawn of the current executable (never a fork) that talks to the
//! pool over its own stdin/stdout pipe pair using the frames in
//! [`crate::ipc`].
//!
//! Parent-side topology, per child:
//!
//! ```text
//!   shared work channel --> writer thread --(stdin)--> child worker loop
//!   results channel     <-- reader thread <-(stdout)--     |
//!            ^                    |                        |
//!            +-- credit returned -+<-- ItemDone frame -----+
//! ```
//!
//! Dispatch is credit-based with one item of credit per child: a writer
//! hands its child a new item only after the previous one was reported
//! done, so work always goes to an idle worker and `stop` latency is at
//! most one in-flight item per child.
//!
//! Because the pool can only spawn *this* executable, the host binary must
//! register every worker type it may run in a [`WorkerRegistry`] and call
//! [`run_spawned_worker`] at the very top of `main`; that call is what
//! turns a re-executed child into a worker loop instead of a second copy
//! of the host program.

use std::collections::HashMap;
use std::io::{self, BufReader, Write};
use std::process::{Child, ChildStdin, ChildStdout, Stdio};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use crossbeam_channel::{bounded, unbounded, Receiver, RecvTimeoutError, Sender};
use serde::{Deserialize, Serialize};

use crate::bootstrap::{exec_in_new_process, take_spawn_request};
use crate::error::{PoolError, WorkerFailure};
use crate::ipc::{self, PoolMessage, WorkerMessage};
use crate::item::{Value, WorkItem};
use crate::ventilator::Ventilator;
use crate::worker::{process_guarded, Publisher, PublishSink, Worker, WorkerContext};

use super::{
    begin_start, ensure_running, mark_stopped, send_envelope, Lifecycle, Pool, ResultEnvelope,
    ResultsChannel, DEFAULT_RESULTS_CAPACITY, POLL_INTERVAL_MS,
};

/// Bootstrap entry name for pool worker processes.
const WORKER_ENTRY: &str = "workers_pool::worker";

/// How long `start` waits for every child to send its `Ready` frame before
/// giving up on the whole pool.
const READINESS_TIMEOUT: Duration = Duration::from_secs(30);

/// The launch payload a worker child reads back through the bootstrap.
///
/// Data only, never code: the child looks the worker type up by name in
/// its own registry and constructs it locally.
#[derive(Debug, Serialize, Deserialize)]
struct ChildPayload {
    worker: String,
    worker_id: usize,
    args: Option<Value>,
}

type ChildLoopFn = fn(ChildPayload) -> Result<(), PoolError>;

/// Maps worker names to their monomorphized child worker loops.
///
/// The host binary builds one, registers every worker type it may run in a
/// [`ProcessPool`], and hands it to [`run_spawned_worker`] before doing
/// anything else in `main`. There is no global registration singleton; the
/// registry is explicit so two binaries linking this crate cannot clash.
#[derive(Default)]
pub struct WorkerRegistry {
    entries: HashMap<&'static str, ChildLoopFn>,
}

impl WorkerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a worker type under its [`Worker::name`].
    pub fn register<W: Worker>(&mut self) -> &mut Self {
        self.entries.insert(W::name(), child_worker_loop::<W>);
        self
    }

    fn lookup(&self, name: &str) -> Option<ChildLoopFn> {
        self.entries.get(name).copied()
    }
}

/// Checks whether the current process was spawned as a pool worker and, if
/// so, runs the worker loop to completion.
///
/// Returns `Ok(true)` when this process was a worker child (its work is
/// done; `main` should return immediately) and `Ok(false)` for a normal
/// invocation. Fails if the process was spawned with a worker name the
/// registry does not know.
pub fn run_spawned_worker(registry: &WorkerRegistry) -> Result<bool, PoolError> {
    let Some(request) = take_spawn_request()? else {
        return Ok(false);
    };
    if request.entry() != WORKER_ENTRY {
        return Err(PoolError::contract(format!(
            "spawned with unknown entry '{}'",
            request.entry()
        )));
    }
    let payload: ChildPayload = request.payload()?;
    let run = registry.lookup(&payload.worker).ok_or_else(|| {
        PoolError::contract(format!(
            "worker '{}' is not registered in this binary's WorkerRegistry",
            payload.worker
        ))
    })?;
    run(payload)?;
    Ok(true)
}

/// The worker loop executed inside a spawned child process.
///
/// Frame protocol (child side): construct the worker, report `Ready` (or
/// `Failed` and exit), then serve `Item` frames until `Shutdown` or pipe
/// EOF. A processing failure reports `Failed` and exits; the parent
/// translates that into pool poisoning.
fn child_worker_loop<W: Worker>(payload: ChildPayload) -> Result<(), PoolError> {
    let worker_id = payload.worker_id;
    let stdout: Arc<Mutex<Box<dyn Write + Send>>> = Arc::new(Mutex::new(Box::new(io::stdout())));
    let publisher = Publisher::new(PublishSink::Pipe(Arc::clone(&stdout)));
    let context = WorkerContext::new(worker_id, payload.args, publisher);

    let mut worker = match W::new(context) {
        Ok(worker) => worker,
        Err(error) => {
            send_frame(
                &stdout,
                &WorkerMessage::Failed {
                    worker_id,
                    message: format!("construction failed: {:#}", error),
                },
            )?;
            return Ok(());
        }
    };
    send_frame(&stdout, &WorkerMessage::Ready { worker_id })?;

    let stdin = io::stdin();
    let mut reader = stdin.lock();
    loop {
        match ipc::read_frame::<PoolMessage>(&mut reader)? {
            Some(PoolMessage::Item(item)) => match process_guarded(&mut worker, item) {
                Ok(()) => send_frame(&stdout, &WorkerMessage::ItemDone)?,
                Err(message) => {
                    send_frame(&stdout, &WorkerMessage::Failed { worker_id, message })?;
                    return Ok(());
                }
            },
            // Cooperative shutdown and a vanished parent end the loop the
            // same way.
            Some(PoolMessage::Shutdown) | None => return Ok(()),
        }
    }
}

fn send_frame(
    stdout: &Arc<Mutex<Box<dyn Write + Send>>>,
    frame: &WorkerMessage,
) -> io::Result<()> {
    let mut writer = stdout.lock().expect("child stdout lock poisoned");
    ipc::write_frame(&mut *writer, frame)
}

/// Process-isolated parallel pool.
///
/// Cheap-clone handle; clones share the same pool.
#[derive(Clone)]
pub struct ProcessPool {
    inner: Arc<ProcessPoolInner>,
}

struct ProcessPoolInner {
    label: String,
    state: Mutex<Lifecycle>,
    work_tx: Mutex<Option<Sender<WorkItem>>>,
    work_rx: Receiver<WorkItem>,
    results: ResultsChannel,
    stop: Arc<AtomicBool>,
    /// Set when a child pipe breaks without a `Failed` frame while the
    /// pool is running: the transport is gone and no report explains why.
    severed: Arc<AtomicBool>,
    /// Children whose reader threads are still attached.
    live: Arc<AtomicUsize>,
    children: Mutex<Vec<Child>>,
    io_threads: Mutex<Vec<thread::JoinHandle<()>>>,
    size: usize,
}

impl ProcessPool {
    /// Creates a pool of `workers_count` worker processes with the default
    /// results capacity.
    pub fn new(workers_count: usize) -> Result<Self, PoolError> {
        Self::with_results_capacity(workers_count, DEFAULT_RESULTS_CAPACITY)
    }

    /// Creates a pool with an explicit results-channel capacity.
    pub fn with_results_capacity(
        workers_count: usize,
        results_capacity: usize,
    ) -> Result<Self, PoolError> {
        if workers_count == 0 {
            return Err(PoolError::InvalidConfig(
                "cannot create a ProcessPool with 0 workers; use SyncPool for inline processing"
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
            inner: Arc::new(ProcessPoolInner {
                label: format!("ProcessPool({})", workers_count),
                state: Mutex::new(Lifecycle::NotStarted),
                work_tx: Mutex::new(Some(work_tx)),
                work_rx,
                results: ResultsChannel::new(results_capacity),
                stop: Arc::new(AtomicBool::new(false)),
                severed: Arc::new(AtomicBool::new(false)),
                live: Arc::new(AtomicUsize::new(0)),
                children: Mutex::new(Vec::new()),
                io_threads: Mutex::new(Vec::new()),
                size: workers_count,
            }),
        })
    }

    pub fn workers_count(&self) -> usize {
        self.inner.size
    }

    fn transport_error(&self) -> Option<PoolError> {
        let inner = &self.inner;
        if inner.severed.load(Ordering::Relaxed) {
            Some(PoolError::transport(format!(
                "{}: a worker process pipe was severed without a failure report",
                inner.label
            )))
        } else if inner.live.load(Ordering::Relaxed) == 0 {
            Some(PoolError::transport(format!(
                "{}: all worker processes have exited",
                inner.label
            )))
        } else {
            None
        }
    }
}

impl Pool for ProcessPool {
    fn start<W: Worker>(
        &self,
        worker_args: Option<Value>,
        ventilator: Option<Box<dyn Ventilator>>,
    ) -> Result<(), PoolError> {
        let inner = &self.inner;
        begin_start(&inner.state, &inner.label)?;
        inner.live.store(inner.size, Ordering::Relaxed);

        let (ready_tx, ready_rx) = unbounded::<Result<usize, WorkerFailure>>();
        {
            let mut children = inner.children.lock().expect("children lock poisoned");
            let mut io_threads = inner.io_threads.lock().expect("io threads lock poisoned");

            for worker_id in 0..inner.size {
                let payload = ChildPayload {
                    worker: W::name().to_owned(),
                    worker_id,
                    args: worker_args.clone(),
                };
                let mut child = match exec_in_new_process(
                    WORKER_ENTRY,
                    &payload,
                    Stdio::piped(),
                    Stdio::piped(),
                ) {
                    Ok(child) => child,
                    Err(error) => {
                        drop(children);
                        drop(io_threads);
                        self.teardown();
                        return Err(error);
                    }
                };
                let stdin = child.stdin.take().expect("child stdin was piped");
                let stdout = child.stdout.take().expect("child stdout was piped");
                children.push(child);

                // One item of credit per child; deposited up front so the
                // writer may dispatch the first item as soon as work
                // arrives.
                let (credit_tx, credit_rx) = bounded::<()>(1);
                credit_tx.send(()).expect("fresh credit channel full");

                let writer = thread::Builder::new()
                    .name(format!("pool-writer-{}", worker_id))
                    .spawn({
                        let work_rx = inner.work_rx.clone();
                        let stop = Arc::clone(&inner.stop);
                        let severed = Arc::clone(&inner.severed);
                        move || writer_loop(stdin, work_rx, credit_rx, stop, severed)
                    })?;
                let reader = thread::Builder::new()
                    .name(format!("pool-reader-{}", worker_id))
                    .spawn({
                        let results_tx = inner.results.sender();
                        let ready_tx = ready_tx.clone();
                        let stop = Arc::clone(&inner.stop);
                        let severed = Arc::clone(&inner.severed);
                        let live = Arc::clone(&inner.live);
                        move || {
                            reader_loop(
                                worker_id, stdout, results_tx, credit_tx, ready_tx, stop, severed,
                            );
                            live.fetch_sub(1, Ordering::Relaxed);
                        }
                    })?;
                io_threads.push(writer);
                io_threads.push(reader);
            }
        }
        drop(ready_tx);

        // Block until every child reports readiness, so a subsequent
        // ventilate cannot race a not-yet-listening worker.
        let deadline = Instant::now() + READINESS_TIMEOUT;
        let mut ready = 0usize;
        while ready < inner.size {
            let remaining = deadline.saturating_duration_since(Instant::now());
            match ready_rx.recv_timeout(remaining) {
                Ok(Ok(worker_id)) => {
                    log::debug!("{}: worker process {} ready", inner.label, worker_id);
                    ready += 1;
                }
                Ok(Err(failure)) => {
                    self.teardown();
                    return Err(failure.into());
                }
                Err(_) => {
                    self.teardown();
                    return Err(PoolError::transport(format!(
                        "{}: timed out waiting for worker readiness ({}/{} ready)",
                        inner.label, ready, inner.size
                    )));
                }
            }
        }
        log::debug!("{} started, all {} workers ready", inner.label, inner.size);

        if let Some(ventilator) = ventilator {
            inner.results.attach_ventilator(ventilator);
            inner.results.start_ventilator()?;
        }
        Ok(())
    }

    fn ventilate(&self, item: WorkItem) -> Result<(), PoolError> {
        let inner = &self.inner;
        ensure_running(&inner.state, &inner.label, "ventilate")?;
        if let Some(error) = self.transport_error() {
            return Err(error);
        }

        let guard = inner.work_tx.lock().expect("work sender lock poisoned");
        let tx = guard
            .as_ref()
            .ok_or_else(|| PoolError::transport(format!("{}: work channel closed", inner.label)))?;
        tx.send(item)
            .map_err(|_| PoolError::transport(format!("{}: work channel closed", inner.label)))?;
        inner.results.record_ventilated();
        Ok(())
    }

    fn get_results(&self, timeout: Option<Duration>) -> Result<Value, PoolError> {
        let inner = &self.inner;
        ensure_running(&inner.state, &inner.label, "retrieve results")?;
        inner.results.next_result(timeout, || {
            if inner.severed.load(Ordering::Relaxed) {
                Some(PoolError::transport(format!(
                    "{}: a worker process pipe was severed without a failure report",
                    inner.label
                )))
            } else {
                None
            }
        })
    }

    fn stop(&self) {
        let inner = &self.inner;
        inner.results.stop_ventilator();
        if mark_stopped(&inner.state) {
            inner.stop.store(true, Ordering::Relaxed);
        }
    }

    fn join(&self) -> Result<(), PoolError> {
        self.stop();
        self.teardown();
        log::debug!("{} joined", self.inner.label);
        Ok(())
    }

    fn results_qsize(&self) -> usize {
        self.inner.results.qsize()
    }
}

impl ProcessPool {
    /// Winds down the transport: writers flush a `Shutdown` frame and drop
    /// their pipe ends, children see EOF and exit, readers drain the last
    /// frames, then every child is reaped.
    fn teardown(&self) {
        let inner = &self.inner;
        inner.stop.store(true, Ordering::Relaxed);
        mark_stopped(&inner.state);
        inner
            .work_tx
            .lock()
            .expect("work sender lock poisoned")
            .take();
        let io_threads: Vec<_> = inner
            .io_threads
            .lock()
            .expect("io threads lock poisoned")
            .drain(..)
            .collect();
        for handle in io_threads {
            let _ = handle.join();
        }
        let mut children = inner.children.lock().expect("children lock poisoned");
        for mut child in children.drain(..) {
            let _ = child.wait();
        }
        inner.results.clear_ventilator();
    }
}

impl Drop for ProcessPoolInner {
    fn drop(&mut self) {
        // Last handle gone: release the transport and reap the children.
        self.stop.store(true, Ordering::Relaxed);
        if let Ok(tx) = self.work_tx.get_mut() {
            tx.take();
        }
        if let Ok(io_threads) = self.io_threads.get_mut() {
            for handle in io_threads.drain(..) {
                let _ = handle.join();
            }
        }
        if let Ok(children) = self.children.get_mut() {
            for mut child in children.drain(..) {
                let _ = child.wait();
            }
        }
    }
}

/// Parent-side writer for one child: waits for the child's credit, pulls
/// one item from the shared work queue, writes it down the pipe.
///
/// Dropping `stdin` on exit is what delivers EOF to a child that missed
/// the `Shutdown` frame.
fn writer_loop(
    mut stdin: ChildStdin,
    work_rx: Receiver<WorkItem>,
    credit_rx: Receiver<()>,
    stop: Arc<AtomicBool>,
    severed: Arc<AtomicBool>,
) {
    let poll = Duration::from_millis(POLL_INTERVAL_MS);
    'outer: loop {
        if stop.load(Ordering::Relaxed) {
            let _ = ipc::write_frame(&mut stdin, &PoolMessage::Shutdown);
            break;
        }
        // Credit first: never pull an item for a child that is still busy,
        // so work always lands on an idle worker.
        match credit_rx.recv_timeout(poll) {
            Ok(()) => {}
            Err(RecvTimeoutError::Timeout) => continue,
            Err(RecvTimeoutError::Disconnected) => break,
        }
        let item = loop {
            if stop.load(Ordering::Relaxed) {
                let _ = ipc::write_frame(&mut stdin, &PoolMessage::Shutdown);
                break 'outer;
            }
            match work_rx.recv_timeout(poll) {
                Ok(item) => break item,
                Err(RecvTimeoutError::Timeout) => continue,
                Err(RecvTimeoutError::Disconnected) => {
                    let _ = ipc::write_frame(&mut stdin, &PoolMessage::Shutdown);
                    break 'outer;
                }
            }
        };
        if let Err(error) = ipc::write_frame(&mut stdin, &PoolMessage::Item(item)) {
            if !stop.load(Ordering::Relaxed) {
                log::error!("worker pipe write failed: {}", error);
                severed.store(true, Ordering::Relaxed);
            }
            break;
        }
    }
}

/// Parent-side reader for one child: forwards the child's frames into the
/// shared results channel and returns dispatch credit on `ItemDone`.
fn reader_loop(
    worker_id: usize,
    stdout: ChildStdout,
    results_tx: Sender<ResultEnvelope>,
    credit_tx: Sender<()>,
    ready_tx: Sender<Result<usize, WorkerFailure>>,
    stop: Arc<AtomicBool>,
    severed: Arc<AtomicBool>,
) {
    let mut reader = BufReader::new(stdout);
    let mut signaled_ready = false;
    let mut saw_failure = false;
    loop {
        match ipc::read_frame::<WorkerMessage>(&mut reader) {
            Ok(Some(WorkerMessage::Ready { .. })) => {
                signaled_ready = true;
                let _ = ready_tx.send(Ok(worker_id));
            }
            Ok(Some(WorkerMessage::Published(value))) => {
                if !send_envelope(&results_tx, &stop, ResultEnvelope::Result(value)) {
                    break;
                }
            }
            Ok(Some(WorkerMessage::ItemDone)) => {
                // Credit back before the marker: the child is idle again.
                let _ = credit_tx.try_send(());
                if !send_envelope(&results_tx, &stop, ResultEnvelope::ItemDone) {
                    break;
                }
            }
            Ok(Some(WorkerMessage::Failed { worker_id, message })) => {
                let failure = WorkerFailure::new(worker_id, message);
                saw_failure = true;
                if !signaled_ready {
                    // Construction failed; start is still waiting on us.
                    let _ = ready_tx.send(Err(failure.clone()));
                    break;
                }
                send_envelope(&results_tx, &stop, ResultEnvelope::Failure(failure));
            }
            Ok(None) => {
                // EOF. Expected after Shutdown or a Failed frame; anything
                // else means the child vanished without a report.
                if !signaled_ready {
                    let _ = ready_tx.send(Err(WorkerFailure::new(
                        worker_id,
                        "worker process exited before signaling readiness",
                    )));
                } else if !saw_failure && !stop.load(Ordering::Relaxed) {
                    log::warn!("worker process {} pipe severed unexpectedly", worker_id);
                    severed.store(true, Ordering::Relaxed);
                }
                break;
            }
            Err(error) => {
                if !stop.load(Ordering::Relaxed) {
                    log::error!("worker {} pipe read failed: {}", worker_id, error);
                    severed.store(true, Ordering::Relaxed);
                }
                break;
            }
        }
    }
    log::debug!("pool-reader-{} exiting", worker_id);
}
