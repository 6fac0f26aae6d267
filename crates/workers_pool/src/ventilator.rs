//! src/ventilator.rs
//!
//! Flow-controlled work submission.
//!
//! A ventilator decouples "I have N items to eventually submit" from
//! "submit them one at a time without unbounded memory growth". The
//! concurrent implementation runs a control loop on its own thread,
//! submitting items through a bound closure while keeping the number of
//! in-flight items (ventilated but not yet reported processed) under a
//! configurable bound.
//!
//! Example:
//! ```ignore
//! let pool = ThreadPool::new(4)?;
//! let feeder = pool.clone();
//! let ventilator = ConcurrentVentilator::builder(
//!         move |item| feeder.ventilate(item),
//!         items,
//!     )
//!     .iterations(5)
//!     .randomize_item_order(true)
//!     .max_ventilation_queue_size(10)
//!     .build()?;
//! pool.start::<RowGroupWorker>(None, Some(Box::new(ventilator.clone())))?;
//! ```

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use rand::seq::SliceRandom;

use crate::error::PoolError;
use crate::item::WorkItem;

/// Polling interval while backpressured, and the default submission pace
/// control. Not an error timeout.
const VENTILATION_INTERVAL_MS: u64 = 10;

/// The feeder side of a pool: the pool only ever talks to this trait, so
/// alternative feeding strategies can stand in for
/// [`ConcurrentVentilator`].
pub trait Ventilator: Send + Sync {
    /// Begins feeding. Called by the pool once it can accept submissions.
    fn start(&self) -> Result<(), PoolError>;

    /// Reports one item fully handled by the pool. Sole external mutator
    /// of the processed count; this is how backpressure is relieved.
    fn processed_item(&self);

    /// True once no further submission can occur: no iterations remain or
    /// the item sequence is empty.
    fn completed(&self) -> bool;

    /// Forces remaining iterations to zero and joins the control loop.
    /// After this returns, no further submission occurs. Idempotent.
    fn stop(&self);
}

type VentilateFn = dyn Fn(WorkItem) -> Result<(), PoolError> + Send + Sync;

/// Feeds a predetermined (possibly repeating, possibly shuffled) item
/// sequence into a pool from a dedicated control thread.
///
/// Cheap-clone handle: keep one to observe or stop the ventilator after
/// handing another to [`Pool::start`](crate::pool::Pool::start).
#[derive(Clone)]
pub struct ConcurrentVentilator {
    inner: Arc<VentilatorInner>,
}

struct VentilatorInner {
    ventilate_fn: Box<VentilateFn>,
    items: Mutex<Vec<WorkItem>>,
    item_count: usize,
    iterations_remaining: Mutex<Option<usize>>,
    randomize_item_order: bool,
    max_ventilation_queue_size: usize,
    ventilation_interval: Duration,
    ventilated: AtomicUsize,
    processed: AtomicUsize,
    started: AtomicBool,
    control_thread: Mutex<Option<thread::JoinHandle<()>>>,
}

impl VentilatorInner {
    fn completed(&self) -> bool {
        if self.item_count == 0 {
            return true;
        }
        *self
            .iterations_remaining
            .lock()
            .expect("iterations lock poisoned")
            == Some(0)
    }
}

impl ConcurrentVentilator {
    /// Starts configuring a ventilator over `items`, bound to the given
    /// submission function (typically a closure over a cloned pool handle
    /// calling `ventilate`).
    pub fn builder(
        ventilate_fn: impl Fn(WorkItem) -> Result<(), PoolError> + Send + Sync + 'static,
        items: Vec<WorkItem>,
    ) -> ConcurrentVentilatorBuilder {
        ConcurrentVentilatorBuilder {
            ventilate_fn: Box::new(ventilate_fn),
            items,
            iterations: Some(1),
            randomize_item_order: false,
            max_ventilation_queue_size: None,
            ventilation_interval: Duration::from_millis(VENTILATION_INTERVAL_MS),
        }
    }

    /// Items submitted so far, over all iterations.
    pub fn ventilated_count(&self) -> usize {
        self.inner.ventilated.load(Ordering::Relaxed)
    }

    /// Items the pool has reported back as fully handled.
    pub fn processed_count(&self) -> usize {
        self.inner.processed.load(Ordering::Relaxed)
    }
}

impl Ventilator for ConcurrentVentilator {
    fn start(&self) -> Result<(), PoolError> {
        if self.inner.started.swap(true, Ordering::Relaxed) {
            return Err(PoolError::contract(
                "ventilator cannot be started twice",
            ));
        }
        let inner = Arc::clone(&self.inner);
        let handle = thread::Builder::new()
            .name("ventilator".to_owned())
            .spawn(move || run_ventilation_loop(&inner))?;
        *self
            .inner
            .control_thread
            .lock()
            .expect("control thread lock poisoned") = Some(handle);
        Ok(())
    }

    fn processed_item(&self) {
        self.inner.processed.fetch_add(1, Ordering::Relaxed);
    }

    fn completed(&self) -> bool {
        self.inner.completed()
    }

    fn stop(&self) {
        *self
            .inner
            .iterations_remaining
            .lock()
            .expect("iterations lock poisoned") = Some(0);
        let handle = self
            .inner
            .control_thread
            .lock()
            .expect("control thread lock poisoned")
            .take();
        if let Some(handle) = handle {
            let _ = handle.join();
        }
    }
}

/// The control loop: check for completion, shuffle at the top of each
/// pass, hold off while too much is in flight, otherwise submit and
/// advance.
fn run_ventilation_loop(inner: &VentilatorInner) {
    let mut cursor = 0usize;
    let mut rng = rand::rng();

    loop {
        if inner.completed() {
            break;
        }

        if cursor == 0 && inner.randomize_item_order {
            inner
                .items
                .lock()
                .expect("items lock poisoned")
                .shuffle(&mut rng);
        }

        let in_flight = inner
            .ventilated
            .load(Ordering::Relaxed)
            .saturating_sub(inner.processed.load(Ordering::Relaxed));
        if in_flight >= inner.max_ventilation_queue_size {
            thread::sleep(inner.ventilation_interval);
            continue;
        }

        let item = {
            let items = inner.items.lock().expect("items lock poisoned");
            items[cursor].clone()
        };
        if let Err(error) = (inner.ventilate_fn)(item) {
            // The pool is stopping or its workers are unreachable; either
            // way no submission can succeed anymore.
            log::error!("ventilation halted: submission failed: {}", error);
            *inner
                .iterations_remaining
                .lock()
                .expect("iterations lock poisoned") = Some(0);
            break;
        }
        inner.ventilated.fetch_add(1, Ordering::Relaxed);

        cursor += 1;
        if cursor >= inner.item_count {
            cursor = 0;
            let mut remaining = inner
                .iterations_remaining
                .lock()
                .expect("iterations lock poisoned");
            if let Some(count) = remaining.as_mut() {
                // stop() may have zeroed the count while this pass was
                // still in flight.
                *count = count.saturating_sub(1);
            }
        }
    }
}

/// Builder for [`ConcurrentVentilator`] with method chaining.
pub struct ConcurrentVentilatorBuilder {
    ventilate_fn: Box<VentilateFn>,
    items: Vec<WorkItem>,
    iterations: Option<usize>,
    randomize_item_order: bool,
    max_ventilation_queue_size: Option<usize>,
    ventilation_interval: Duration,
}

impl ConcurrentVentilatorBuilder {
    /// Number of passes over the item sequence. Default 1; must be
    /// positive (use [`unbounded_iterations`](Self::unbounded_iterations)
    /// for "feed forever").
    pub fn iterations(mut self, iterations: usize) -> Self {
        self.iterations = Some(iterations);
        self
    }

    /// Feed the sequence forever, until [`Ventilator::stop`].
    pub fn unbounded_iterations(mut self) -> Self {
        self.iterations = None;
        self
    }

    /// Shuffle the sequence in place at the start of every pass (not just
    /// once).
    pub fn randomize_item_order(mut self, randomize: bool) -> Self {
        self.randomize_item_order = randomize;
        self
    }

    /// Maximum items in flight (submitted but not reported processed)
    /// before the loop holds off. Defaults to the sequence length.
    pub fn max_ventilation_queue_size(mut self, size: usize) -> Self {
        self.max_ventilation_queue_size = Some(size);
        self
    }

    /// How long the loop sleeps between backpressure re-checks.
    ///
    /// - Too low: more wakeups while saturated.
    /// - Too high: slower reaction when the pool catches up.
    pub fn ventilation_interval(mut self, interval: Duration) -> Self {
        self.ventilation_interval = interval;
        self
    }

    /// Validates and builds the ventilator (not yet running; the pool
    /// calls [`Ventilator::start`] once it is ready to accept work).
    pub fn build(self) -> Result<ConcurrentVentilator, PoolError> {
        if self.iterations == Some(0) {
            return Err(PoolError::InvalidConfig(
                "iterations must be positive; use unbounded_iterations() for no limit".to_owned(),
            ));
        }
        if self.max_ventilation_queue_size == Some(0) && !self.items.is_empty() {
            return Err(PoolError::InvalidConfig(
                "max_ventilation_queue_size must be positive".to_owned(),
            ));
        }
        let item_count = self.items.len();
        let max_ventilation_queue_size = self.max_ventilation_queue_size.unwrap_or(item_count);
        Ok(ConcurrentVentilator {
            inner: Arc::new(VentilatorInner {
                ventilate_fn: self.ventilate_fn,
                items: Mutex::new(self.items),
                item_count,
                iterations_remaining: Mutex::new(self.iterations),
                randomize_item_order: self.randomize_item_order,
                max_ventilation_queue_size,
                ventilation_interval: self.ventilation_interval,
                ventilated: AtomicUsize::new(0),
                processed: AtomicUsize::new(0),
                started: AtomicBool::new(false),
                control_thread: Mutex::new(None),
            }),
        })
    }
}
