//! src/ipc.rs
//!
//! Stdio frame codec for process-isolated workers.
//!
//! Each worker process talks to the pool over its own stdin/stdout pipe
//! pair using newline-delimited JSON frames, one serde enum per direction.
//! Framing stays line-based so a torn write can never desynchronize the
//! stream: either a full line arrives or EOF does.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::io::{self, BufRead, Write};

use crate::item::{Value, WorkItem};

/// Frames sent by the pool to a worker process (child stdin).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub(crate) enum PoolMessage {
    /// One work item for the worker to process.
    Item(WorkItem),
    /// Cooperative stop; the worker exits after its current item.
    Shutdown,
}

/// Frames sent by a worker process to the pool (child stdout).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub(crate) enum WorkerMessage {
    /// The worker is constructed and listening. Sent exactly once;
    /// `start` blocks until every worker has said so.
    Ready { worker_id: usize },
    /// One published result.
    Published(Value),
    /// Accounting marker: the current item is fully processed.
    ItemDone,
    /// The worker failed (construction, processing, or panic) and is
    /// about to exit.
    Failed { worker_id: usize, message: String },
}

/// Writes one frame followed by a newline and flushes.
///
/// Flushing per frame matters: the parent decides liveness by whether
/// frames arrive, not by buffer boundaries.
pub(crate) fn write_frame<T: Serialize>(writer: &mut impl Write, frame: &T) -> io::Result<()> {
    let line = serde_json::to_string(frame)?;
    writer.write_all(line.as_bytes())?;
    writer.write_all(b"\n")?;
    writer.flush()
}

/// Reads one frame. Returns `Ok(None)` on a clean EOF (peer closed the
/// pipe), which callers treat as the end of the conversation.
pub(crate) fn read_frame<T: DeserializeOwned>(reader: &mut impl BufRead) -> io::Result<Option<T>> {
    let mut line = String::new();
    loop {
        line.clear();
        if reader.read_line(&mut line)? == 0 {
            return Ok(None);
        }
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }
        return Ok(Some(serde_json::from_str(trimmed)?));
    }
}

#[cfg(test)]
mod ipc_test {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn test_frames_round_trip_through_a_pipe_buffer() -> anyhow::Result<()> {
        let mut buffer = Vec::new();
        write_frame(&mut buffer, &PoolMessage::Item(WorkItem::from_single("n", 3)))?;
        write_frame(&mut buffer, &PoolMessage::Shutdown)?;

        let mut reader = Cursor::new(buffer);
        let first: Option<PoolMessage> = read_frame(&mut reader)?;
        let second: Option<PoolMessage> = read_frame(&mut reader)?;
        let end: Option<PoolMessage> = read_frame(&mut reader)?;

        assert_eq!(first, Some(PoolMessage::Item(WorkItem::from_single("n", 3))));
        assert_eq!(second, Some(PoolMessage::Shutdown));
        assert!(end.is_none(), "EOF must read as None, not an error");
        Ok(())
    }

    #[test]
    fn test_failure_frame_keeps_worker_identity() -> anyhow::Result<()> {
        let mut buffer = Vec::new();
        write_frame(
            &mut buffer,
            &WorkerMessage::Failed {
                worker_id: 4,
                message: "decode failed".into(),
            },
        )?;

        let mut reader = Cursor::new(buffer);
        match read_frame::<WorkerMessage>(&mut reader)? {
            Some(WorkerMessage::Failed { worker_id, message }) => {
                assert_eq!(worker_id, 4);
                assert_eq!(message, "decode failed");
            }
            other => panic!("expected a Failed frame, got {:?}", other),
        }
        Ok(())
    }
}
