//! Stub workers shared by the integration tests.
#![allow(dead_code)]

use anyhow::{bail, Context, Result};
use std::thread;
use std::time::Duration;

use workers_pool::{Value, WorkItem, Worker, WorkerContext};

/// Publishes the `value` argument of every item unchanged.
pub struct IdentityWorker {
    ctx: WorkerContext,
}

impl Worker for IdentityWorker {
    fn name() -> &'static str {
        "identity"
    }

    fn new(ctx: WorkerContext) -> Result<Self> {
        Ok(Self { ctx })
    }

    fn process(&mut self, item: WorkItem) -> Result<()> {
        self.ctx.publish(item.get("value")?.clone())?;
        Ok(())
    }
}

/// Publishes each entry of the item's `values` list multiplied by the
/// pool-wide integer coefficient passed as worker args. Exercises the
/// shared-args path and multiple results per item.
pub struct MultiplierWorker {
    ctx: WorkerContext,
    coefficient: i64,
}

impl Worker for MultiplierWorker {
    fn name() -> &'static str {
        "multiplier"
    }

    fn new(ctx: WorkerContext) -> Result<Self> {
        let coefficient = ctx
            .args()
            .and_then(Value::as_i64)
            .context("multiplier worker needs an int coefficient as worker args")?;
        Ok(Self { ctx, coefficient })
    }

    fn process(&mut self, item: WorkItem) -> Result<()> {
        for value in item.get_list("values")? {
            let n = value
                .as_i64()
                .context("multiplier worker values must be ints")?;
            self.ctx.publish(n * self.coefficient)?;
        }
        Ok(())
    }
}

/// Fails on every item; also fails at construction when the worker args
/// say `"fail-at-construction"`.
pub struct FailingWorker;

impl Worker for FailingWorker {
    fn name() -> &'static str {
        "failing"
    }

    fn new(ctx: WorkerContext) -> Result<Self> {
        if ctx.args().and_then(Value::as_str) == Some("fail-at-construction") {
            bail!("refusing to construct");
        }
        Ok(Self)
    }

    fn process(&mut self, item: WorkItem) -> Result<()> {
        bail!("cannot process value {:?}", item.opt("value"));
    }
}

/// Panics on every item, to exercise the panic-capture path.
pub struct PanickyWorker;

impl Worker for PanickyWorker {
    fn name() -> &'static str {
        "panicky"
    }

    fn new(_ctx: WorkerContext) -> Result<Self> {
        Ok(Self)
    }

    fn process(&mut self, _item: WorkItem) -> Result<()> {
        panic!("synthetic worker panic");
    }
}

/// Sleeps for the item's `sleep_ms` before publishing its `value`.
pub struct SleepyWorker {
    ctx: WorkerContext,
}

impl Worker for SleepyWorker {
    fn name() -> &'static str {
        "sleepy"
    }

    fn new(ctx: WorkerContext) -> Result<Self> {
        Ok(Self { ctx })
    }

    fn process(&mut self, item: WorkItem) -> Result<()> {
        thread::sleep(Duration::from_millis(item.get_i64("sleep_ms")? as u64));
        self.ctx.publish(item.get("value")?.clone())?;
        Ok(())
    }
}

/// Consumes items without ever publishing anything.
pub struct SilentWorker;

impl Worker for SilentWorker {
    fn name() -> &'static str {
        "silent"
    }

    fn new(_ctx: WorkerContext) -> Result<Self> {
        Ok(Self)
    }

    fn process(&mut self, _item: WorkItem) -> Result<()> {
        Ok(())
    }
}

/// Publishes exactly the item's `outputs` list, element by element. Lets a
/// test program zero, one, or many results per item.
pub struct ProgramWorker {
    ctx: WorkerContext,
}

impl Worker for ProgramWorker {
    fn name() -> &'static str {
        "program"
    }

    fn new(ctx: WorkerContext) -> Result<Self> {
        Ok(Self { ctx })
    }

    fn process(&mut self, item: WorkItem) -> Result<()> {
        for value in item.get_list("outputs")? {
            self.ctx.publish(value.clone())?;
        }
        Ok(())
    }
}

/// Publishes its own worker id after a short delay, for work-distribution
/// checks across a pool.
pub struct TaggingWorker {
    ctx: WorkerContext,
}

impl Worker for TaggingWorker {
    fn name() -> &'static str {
        "tagging"
    }

    fn new(ctx: WorkerContext) -> Result<Self> {
        Ok(Self { ctx })
    }

    fn process(&mut self, _item: WorkItem) -> Result<()> {
        thread::sleep(Duration::from_millis(20));
        self.ctx.publish(self.ctx.worker_id())?;
        Ok(())
    }
}

/// Drains a pool into a vector until the empty-result condition, failing
/// the test on anything else (timeout included).
pub fn drain_pool<P: workers_pool::Pool>(pool: &P) -> Result<Vec<Value>> {
    let mut collected = Vec::new();
    loop {
        match pool.get_results(Some(Duration::from_secs(10))) {
            Ok(value) => collected.push(value),
            Err(workers_pool::PoolError::EmptyResult) => return Ok(collected),
            Err(error) => bail!("drain failed after {} results: {}", collected.len(), error),
        }
    }
}

/// Sorted copy of the drained ints, for multiset comparisons.
pub fn sorted_ints(values: &[Value]) -> Vec<i64> {
    let mut ints: Vec<i64> = values.iter().filter_map(Value::as_i64).collect();
    ints.sort_unstable();
    ints
}
