//! Append-only log of completed item ids.
//!
//! The log is a UTF-8 text file with one id per line. Ids are buffered in
//! memory and appended in batches; a restart reloads every line, so an item
//! recorded before a crash is never processed again.

use std::collections::HashSet;
use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use tracing::{debug, error, info};

use crate::error::CheckpointError;
use crate::types::is_line_safe;

#[derive(Debug)]
struct LogState {
    processed: HashSet<String>,
    buffer: Vec<String>,
    last_flush: Instant,
}

/// Durable set of processed item ids.
#[derive(Debug)]
pub struct CheckpointLog {
    path: PathBuf,
    flush_interval: usize,
    flush_every: Option<Duration>,
    state: Mutex<LogState>,
}

impl CheckpointLog {
    /// Opens the log at `path`, loading any ids recorded by earlier runs.
    ///
    /// A missing file is an empty log; the file and its parent directory are
    /// created on the first append. `flush_interval` is the number of buffered
    /// ids that triggers an append (values below 1 are treated as 1).
    pub fn open(path: impl Into<PathBuf>, flush_interval: usize) -> Result<Self, CheckpointError> {
        let path = path.into();
        let processed = load_ids(&path)?;

        if !processed.is_empty() {
            info!(
                path = %path.display(),
                count = processed.len(),
                "Loaded checkpoint log"
            );
        }

        Ok(Self {
            path,
            flush_interval: flush_interval.max(1),
            flush_every: None,
            state: Mutex::new(LogState {
                processed,
                buffer: Vec::new(),
                last_flush: Instant::now(),
            }),
        })
    }

    /// Also appends buffered ids once `interval` has passed since the last append.
    pub fn with_flush_every(mut self, interval: Duration) -> Self {
        self.flush_every = Some(interval);
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Whether `id` has been recorded, in this run or a previous one.
    pub fn is_processed(&self, id: &str) -> bool {
        self.lock().processed.contains(id)
    }

    /// Records `id` as processed. Recording a known id is a no-op.
    ///
    /// Ids that would not reload unchanged (empty, padded with whitespace,
    /// or containing line breaks) are rejected. If the append triggered by
    /// this call fails, `id` is forgotten so a later `save` retries it.
    pub fn save(&self, id: &str) -> Result<(), CheckpointError> {
        if !is_line_safe(id) {
            return Err(CheckpointError::InvalidId(id.to_string()));
        }

        let mut state = self.lock();
        if !state.processed.insert(id.to_string()) {
            return Ok(());
        }
        state.buffer.push(id.to_string());

        let due_by_count = state.buffer.len() >= self.flush_interval;
        let due_by_time = self
            .flush_every
            .is_some_and(|every| state.last_flush.elapsed() >= every);

        if due_by_count || due_by_time {
            if let Err(e) = append_buffered(&self.path, &mut state) {
                state.buffer.pop();
                state.processed.remove(id);
                return Err(e);
            }
        }
        Ok(())
    }

    /// Appends all buffered ids to the file.
    pub fn flush(&self) -> Result<(), CheckpointError> {
        let mut state = self.lock();
        append_buffered(&self.path, &mut state)
    }

    /// Number of recorded ids, including those not yet flushed.
    pub fn len(&self) -> usize {
        self.lock().processed.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of ids waiting to be appended.
    pub fn pending(&self) -> usize {
        self.lock().buffer.len()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, LogState> {
        self.state.lock().expect("checkpoint lock poisoned")
    }
}

impl Drop for CheckpointLog {
    fn drop(&mut self) {
        let state = match self.state.get_mut() {
            Ok(state) => state,
            Err(poisoned) => poisoned.into_inner(),
        };
        if let Err(e) = append_buffered(&self.path, state) {
            error!(error = %e, "Failed to flush checkpoint log on drop");
        }
    }
}

fn append_buffered(path: &Path, state: &mut LogState) -> Result<(), CheckpointError> {
    if state.buffer.is_empty() {
        return Ok(());
    }

    let mut lines = String::new();
    for id in &state.buffer {
        lines.push_str(id);
        lines.push('\n');
    }

    write_lines(path, &lines).map_err(|source| CheckpointError::Write {
        path: path.to_path_buf(),
        source,
    })?;

    debug!(
        path = %path.display(),
        count = state.buffer.len(),
        "Appended ids to checkpoint log"
    );
    state.buffer.clear();
    state.last_flush = Instant::now();
    Ok(())
}

fn load_ids(path: &Path) -> Result<HashSet<String>, CheckpointError> {
    let raw = match fs::read_to_string(path) {
        Ok(raw) => raw,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(HashSet::new()),
        Err(source) => {
            return Err(CheckpointError::Load {
                path: path.to_path_buf(),
                source,
            })
        }
    };

    Ok(raw
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(str::to_string)
        .collect())
}

fn write_lines(path: &Path, lines: &str) -> io::Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)?;
        }
    }
    let mut file = OpenOptions::new().create(true).append(true).open(path)?;
    file.write_all(lines.as_bytes())?;
    file.flush()
}
