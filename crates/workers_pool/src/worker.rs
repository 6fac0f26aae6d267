//! src/worker.rs
//!
//! The worker contract: one unit of repeatable processing logic.
//!
//! A worker is constructed once per pool slot with a [`WorkerContext`] that
//! carries its slot id, the pool-wide start arguments, and the publish
//! capability bound to the owning pool's results channel. Processing emits
//! zero or more results through `publish`; there is no return value because
//! a single return cannot express "many" or "none".

use anyhow::Result;
use std::any::Any;
use std::io::Write;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::AtomicBool;
use std::sync::{Arc, Mutex};

use crossbeam_channel::Sender;

use crate::error::PoolError;
use crate::ipc::{self, WorkerMessage};
use crate::item::{Value, WorkItem};
use crate::pool::{send_envelope, ResultBuffer, ResultEnvelope};

/// One unit of repeatable processing logic.
///
/// Implementations hold whatever state they need (usually the
/// [`WorkerContext`] they were constructed with) and are driven by the pool
/// that owns them: `process` is called once per work item handed to this
/// worker. Returning an error (or panicking) terminates this worker's
/// execution unit after the failure is captured for the caller; workers are
/// never retried transparently.
///
/// `'static` because pools box workers and move them onto threads that can
/// outlive the caller's stack frame.
pub trait Worker: Send + 'static {
    /// Stable lookup key for the process-isolated pool's registry.
    ///
    /// The default is the Rust type path, which is identical in the parent
    /// and the re-executed child because they are the same binary. Override
    /// only if the name must survive refactors (e.g. recorded externally).
    fn name() -> &'static str
    where
        Self: Sized,
    {
        std::any::type_name::<Self>()
    }

    /// Constructs a worker for one pool slot. Failure here aborts pool
    /// startup; no items will have been submitted yet.
    fn new(ctx: WorkerContext) -> Result<Self>
    where
        Self: Sized;

    /// Processes one work item, publishing any number of results through
    /// the context.
    fn process(&mut self, item: WorkItem) -> Result<()>;
}

/// Everything a worker receives at construction: identity, shared start
/// arguments, and the bound publish capability.
pub struct WorkerContext {
    worker_id: usize,
    args: Option<Value>,
    publisher: Publisher,
}

impl WorkerContext {
    pub(crate) fn new(worker_id: usize, args: Option<Value>, publisher: Publisher) -> Self {
        Self {
            worker_id,
            args,
            publisher,
        }
    }

    /// Slot id of this worker, unique within its pool, stable for the
    /// pool's lifetime.
    pub fn worker_id(&self) -> usize {
        self.worker_id
    }

    /// The start arguments shared by every worker of the pool.
    pub fn args(&self) -> Option<&Value> {
        self.args.as_ref()
    }

    /// Publishes one result to the pool's results channel.
    ///
    /// May block while the results channel is full; unblocks with an error
    /// if the pool begins shutting down, which a worker should propagate
    /// with `?` to end its run.
    pub fn publish(&self, value: impl Into<Value>) -> Result<(), PoolError> {
        self.publisher.publish(value.into())
    }
}

/// The publish capability handed to a worker, bound to whatever transport
/// its pool variant uses.
pub(crate) struct Publisher {
    sink: PublishSink,
}

pub(crate) enum PublishSink {
    /// Synchronous pool: ordered in-memory buffer on the caller's side.
    Buffer(Arc<ResultBuffer>),
    /// Threaded pool: bounded results channel, stop-aware blocking send.
    Channel {
        tx: Sender<ResultEnvelope>,
        stop: Arc<AtomicBool>,
    },
    /// Process-isolated worker: frames written to the child's stdout.
    Pipe(Arc<Mutex<Box<dyn Write + Send>>>),
}

impl Publisher {
    pub(crate) fn new(sink: PublishSink) -> Self {
        Self { sink }
    }

    fn publish(&self, value: Value) -> Result<(), PoolError> {
        match &self.sink {
            PublishSink::Buffer(buffer) => {
                buffer.push(ResultEnvelope::Result(value));
                Ok(())
            }
            PublishSink::Channel { tx, stop } => {
                if send_envelope(tx, stop, ResultEnvelope::Result(value)) {
                    Ok(())
                } else {
                    Err(PoolError::transport(
                        "results channel closed while publishing",
                    ))
                }
            }
            PublishSink::Pipe(writer) => {
                let mut writer = writer.lock().expect("publisher pipe lock poisoned");
                ipc::write_frame(&mut *writer, &WorkerMessage::Published(value))?;
                Ok(())
            }
        }
    }
}

/// Runs `process` with panics converted into the same captured-failure path
/// as returned errors. A worker is never used again after a failure, so the
/// unwind cannot expose torn state to anyone.
pub(crate) fn process_guarded(
    worker: &mut (impl Worker + ?Sized),
    item: WorkItem,
) -> std::result::Result<(), String> {
    match catch_unwind(AssertUnwindSafe(|| worker.process(item))) {
        Ok(Ok(())) => Ok(()),
        Ok(Err(error)) => Err(format!("{:#}", error)),
        Err(panic) => Err(panic_message(panic)),
    }
}

fn panic_message(panic: Box<dyn Any + Send>) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        format!("worker panicked: {}", message)
    } else if let Some(message) = panic.downcast_ref::<String>() {
        format!("worker panicked: {}", message)
    } else {
        "worker panicked".to_owned()
    }
}
