//! JSON-lines trace of queue activity, for offline inspection of timing.
//!
//! One object per notification:
//!
//! ```text
//! {"t_ms":12,"action":"plan","kind":"Button","payload":0,"seq":3,"due_ms":112}
//! ```
//!
//! `t_ms` and `due_ms` are milliseconds since the queue was created (its
//! [`epoch`](crate::queue::EventQueue::epoch)); `due_ms` is `null` for ASAP
//! entries.

use anyhow::{Context, Result};
use serde::Serialize;
use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::Path;
use std::time::Instant;

use crate::event::EventKind;
use crate::queue::{Due, EntryView, QueueAction, QueueObserver};

#[derive(Debug, Serialize)]
struct TraceLine {
    t_ms: u64,
    action: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    kind: Option<EventKind>,
    #[serde(skip_serializing_if = "Option::is_none")]
    payload: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    seq: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    due_ms: Option<Option<i64>>,
}

fn action_name(action: QueueAction) -> &'static str {
    match action {
        QueueAction::Changing => "changing",
        QueueAction::Wait => "wait",
        QueueAction::Plan => "plan",
        QueueAction::Delete => "delete",
        QueueAction::Dispatch => "dispatch",
    }
}

pub struct JsonTrace<W: Write + Send> {
    out: W,
    origin: Instant,
}

impl JsonTrace<BufWriter<File>> {
    /// Append to the trace file at `path`, creating it if needed.  Times are
    /// measured from `origin`.
    pub fn open(path: &Path, origin: Instant) -> Result<Self> {
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .with_context(|| format!("failed to open trace file: {}", path.display()))?;
        Ok(Self::new(BufWriter::new(file), origin))
    }
}

impl<W: Write + Send> JsonTrace<W> {
    pub fn new(out: W, origin: Instant) -> Self {
        Self { out, origin }
    }

    fn since_origin_ms(&self, t: Instant) -> i64 {
        if t >= self.origin {
            (t - self.origin).as_millis() as i64
        } else {
            -((self.origin - t).as_millis() as i64)
        }
    }

    fn line(&self, action: QueueAction, entry: Option<&EntryView>) -> TraceLine {
        TraceLine {
            t_ms: self.origin.elapsed().as_millis() as u64,
            action: action_name(action),
            kind: entry.map(|e| e.kind),
            payload: entry.map(|e| e.payload),
            seq: entry.map(|e| e.sequence),
            due_ms: entry.map(|e| match e.due {
                Due::Asap => None,
                Due::At(t) => Some(self.since_origin_ms(t)),
            }),
        }
    }
}

impl<W: Write + Send> QueueObserver for JsonTrace<W> {
    fn notify(&mut self, action: QueueAction, entry: Option<&EntryView>) {
        let line = self.line(action, entry);
        // Best-effort: a full disk must not stall the queue.
        if serde_json::to_writer(&mut self.out, &line).is_ok() {
            let _ = self.out.write_all(b"\n");
            if action == QueueAction::Dispatch {
                let _ = self.out.flush();
            }
        }
    }
}

// ===========================================================================
// Tests
// ===========================================================================
