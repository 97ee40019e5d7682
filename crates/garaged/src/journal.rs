//! Operational log: an append-only file of UTC-stamped lines.
//!
//! Writes are best-effort.  A missing or failing log file never stops the
//! controller; every line is mirrored to `tracing` as well.

use anyhow::{Context, Result};
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::Path;
use time::macros::format_description;
use time::OffsetDateTime;

pub trait Journal: Send {
    fn record(&mut self, message: &str);
}

/// `[YYYY-MM-DD HH:MM:SS UTC]` for `at`.
pub fn stamp(at: OffsetDateTime) -> String {
    let fmt = format_description!("[year]-[month]-[day] [hour]:[minute]:[second]");
    let utc = at.to_offset(time::UtcOffset::UTC);
    format!("[{} UTC]", utc.format(&fmt).unwrap_or_default())
}

pub struct FileJournal {
    file: Option<File>,
}

impl FileJournal {
    pub fn open(path: &Path) -> Result<Self> {
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .with_context(|| format!("failed to open log file: {}", path.display()))?;
        Ok(Self { file: Some(file) })
    }

    /// A journal that only mirrors to `tracing`.
    pub fn disabled() -> Self {
        Self { file: None }
    }
}

impl Journal for FileJournal {
    fn record(&mut self, message: &str) {
        tracing::info!(target: "journal", "{message}");
        let Some(file) = self.file.as_mut() else {
            return;
        };
        let line = format!("{} {message}\n", stamp(OffsetDateTime::now_utc()));
        if let Err(e) = file.write_all(line.as_bytes()).and_then(|()| file.flush()) {
            tracing::debug!("journal write failed: {e}");
        }
    }
}

/// In-memory journal shared with the test that created it.
#[cfg(test)]
#[derive(Clone, Default)]
pub(crate) struct MemoryJournal(std::sync::Arc<std::sync::Mutex<Vec<String>>>);

#[cfg(test)]
impl MemoryJournal {
    pub(crate) fn lines(&self) -> Vec<String> {
        self.0.lock().unwrap().clone()
    }

    pub(crate) fn count(&self, line: &str) -> usize {
        self.lines().iter().filter(|l| l.as_str() == line).count()
    }

    pub(crate) fn contains(&self, needle: &str) -> bool {
        self.lines().iter().any(|l| l.contains(needle))
    }
}

#[cfg(test)]
impl Journal for MemoryJournal {
    fn record(&mut self, message: &str) {
        self.0.lock().unwrap().push(message.to_string());
    }
}

// ===========================================================================
// Tests
// ===========================================================================
