//! src/bootstrap.rs
//!
//! Execution-unit bootstrap: run a registered entry point in a brand-new
//! OS process.
//!
//! The new process is spawned, not forked, so it inherits no memory state
//! and cannot corrupt the caller's address space. Because a systems
//! language cannot serialize a function, the launch payload is data only:
//! an entry *name* plus a serializable payload, written to a transient
//! file that the spawned process reads back, deletes, and dispatches on.
//! The spawned process is this same executable; its `main` is expected to
//! call [`take_spawn_request`] (usually through
//! [`run_spawned_worker`](crate::pool::run_spawned_worker)) before doing
//! anything else.

use std::io::Write;
use std::process::{Child, Command, Stdio};

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::error::PoolError;

/// Environment variable carrying the payload-file path into the spawned
/// process. Consumed (and cleared) by [`take_spawn_request`].
const SPAWN_ENV: &str = "WORKERS_POOL_SPAWN";

/// The deserialized launch payload found by a spawned process.
#[derive(Debug, Serialize, Deserialize)]
pub struct SpawnRequest {
    entry: String,
    payload: serde_json::Value,
}

impl SpawnRequest {
    /// Name of the entry point this process was spawned to run.
    pub fn entry(&self) -> &str {
        &self.entry
    }

    /// Decodes the payload into the entry point's expected type.
    pub fn payload<T: DeserializeOwned>(&self) -> Result<T, PoolError> {
        Ok(serde_json::from_value(self.payload.clone())?)
    }
}

/// Launches `entry` with `payload` in a fresh OS process and returns the
/// handle without waiting for completion.
///
/// Serialization or spawn failures surface here, synchronously, and the
/// transient payload file is cleaned up. Failures *inside* the spawned
/// entry are the entry's own responsibility to report; the process pool
/// layers an explicit error-reporting channel on top for exactly that.
pub fn exec_in_new_process<T: Serialize>(
    entry: &str,
    payload: &T,
    stdin: Stdio,
    stdout: Stdio,
) -> Result<Child, PoolError> {
    let request = SpawnRequest {
        entry: entry.to_owned(),
        payload: serde_json::to_value(payload)?,
    };

    let mut file = tempfile::Builder::new()
        .prefix("workers-pool-spawn-")
        .suffix(".json")
        .tempfile()?;
    serde_json::to_writer(file.as_file_mut(), &request)?;
    file.as_file_mut().flush()?;
    // Hand the file over to the spawned process: it deletes it after
    // reading, so the parent must stop owning it here.
    let (_, path) = file.keep().map_err(|persist| persist.error)?;

    let executable = std::env::current_exe()?;
    let spawned = Command::new(&executable)
        .env(SPAWN_ENV, &path)
        .stdin(stdin)
        .stdout(stdout)
        .spawn();
    match spawned {
        Ok(child) => Ok(child),
        Err(error) => {
            // No child exists to consume the file; reclaim it.
            let _ = std::fs::remove_file(&path);
            Err(error.into())
        }
    }
}

/// Checks whether the current process was spawned by
/// [`exec_in_new_process`] and, if so, consumes the launch payload.
///
/// Reads and deletes the transient file and clears the environment
/// variable so processes spawned further down see a clean slate. Returns
/// `Ok(None)` for a process started normally.
pub fn take_spawn_request() -> Result<Option<SpawnRequest>, PoolError> {
    let Some(path) = std::env::var_os(SPAWN_ENV) else {
        return Ok(None);
    };
    std::env::remove_var(SPAWN_ENV);

    let contents = std::fs::read(&path)?;
    let _ = std::fs::remove_file(&path);
    let request = serde_json::from_slice(&contents)?;
    Ok(Some(request))
}
