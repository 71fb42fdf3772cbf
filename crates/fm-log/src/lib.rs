//! Append-only conversation stream.
//!
//! Every inter-role exchange is persisted as one JSON object per line in a
//! UTF-8 file keyed by UTC calendar day (`events/stream/YYYY-MM-DD.jsonl`).
//! Records chain backwards through `parent_event_id`, which by construction
//! always references a smaller id, so chain walks terminate. Day files older
//! than the configured horizon migrate into an `archive/` subtree.

use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use chrono::{NaiveDate, Utc};
use fm_core::types::{EventDraft, EventRecord};
use fm_telemetry::counters::{names, RuntimeCounters};
use tracing::{debug, warn};

// ---------------------------------------------------------------------------
// Error
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum LogError {
    /// Append failures are fatal to the caller; nothing is dropped silently.
    #[error("io: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialize: {0}")]
    Serialize(#[from] serde_json::Error),

    /// A draft referenced a parent id that has not been appended yet.
    #[error("parent event {parent} does not precede this append (next id {next})")]
    ParentAhead { parent: u64, next: u64 },

    #[error("event {0} not found in stream or archive")]
    NotFound(u64),
}

pub type Result<T> = std::result::Result<T, LogError>;

// ---------------------------------------------------------------------------
// EventLog
// ---------------------------------------------------------------------------

/// Durable, ordered record of every inter-role exchange.
///
/// Appends are serialized by an internal mutex and written as exactly one
/// `write_all` of `line + '\n'`, so records are never torn. Ordering within
/// a day file matches append order.
pub struct EventLog {
    dir: PathBuf,
    max_content_bytes: usize,
    counters: Arc<RuntimeCounters>,
    inner: Mutex<LogInner>,
}

struct LogInner {
    next_id: u64,
}

impl EventLog {
    /// Open the stream at `dir`, creating it when absent. The next event id
    /// is seeded from the highest id already present in the stream and its
    /// archive, so ids stay monotonic across restarts.
    pub fn open(
        dir: impl Into<PathBuf>,
        max_content_bytes: usize,
        counters: Arc<RuntimeCounters>,
    ) -> Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        fs::create_dir_all(dir.join("archive"))?;

        let next_id = scan_max_id(&dir)? + 1;
        debug!(dir = %dir.display(), next_id, "event log opened");

        Ok(Self {
            dir,
            max_content_bytes,
            counters,
            inner: Mutex::new(LogInner { next_id }),
        })
    }

    /// Append one event and return its assigned id.
    ///
    /// Atomic at record granularity: the id is assigned and the line written
    /// under the same lock, so concurrent appenders interleave whole records
    /// in id order.
    pub fn append(&self, draft: EventDraft) -> Result<u64> {
        let mut inner = self.inner.lock().expect("event log lock poisoned");

        let id = inner.next_id;
        if let Some(parent) = draft.parent_event_id {
            if parent >= id {
                return Err(LogError::ParentAhead { parent, next: id });
            }
        }

        let mut content = draft.content;
        if content.len() > self.max_content_bytes {
            content = truncate_utf8(&content, self.max_content_bytes).to_string();
        }

        let record = EventRecord {
            id,
            t: Utc::now(),
            pipeline_id: draft.pipeline_id,
            job_id: draft.job_id,
            from_role: draft.from_role,
            to_role: draft.to_role,
            event_type: draft.event_type,
            parent_event_id: draft.parent_event_id,
            content,
            metadata: draft.metadata,
        };

        let line = serde_json::to_string(&record)?;
        let path = self.day_path(record.t.date_naive());
        let mut file = OpenOptions::new().create(true).append(true).open(&path)?;
        let mut buf = line.into_bytes();
        buf.push(b'\n');
        file.write_all(&buf)?;
        file.flush()?;

        inner.next_id = id + 1;
        self.counters.incr(names::EVENTS_APPENDED);
        Ok(id)
    }

    /// Stream every event of one UTC day, oldest first. Corrupt lines are
    /// skipped and counted; they never abort the read.
    pub fn read_day(&self, date: NaiveDate) -> Result<Vec<EventRecord>> {
        let path = self.day_path(date);
        let archived = self.archive_path(date);
        let path = if path.exists() {
            path
        } else if archived.exists() {
            archived
        } else {
            return Ok(Vec::new());
        };
        self.read_file(&path)
    }

    /// Walk `parent_event_id` backwards from `event_id` to the chain root.
    /// Returns the chain ordered root-first; the last element is the event
    /// itself.
    pub fn chain(&self, event_id: u64) -> Result<Vec<EventRecord>> {
        let index = self.load_index()?;
        let mut chain = Vec::new();
        let mut cursor = Some(event_id);
        while let Some(id) = cursor {
            let event = index.get(&id).ok_or(LogError::NotFound(id))?;
            cursor = event.parent_event_id;
            chain.push(event.clone());
        }
        chain.reverse();
        Ok(chain)
    }

    /// Move day files at least `archive_after_days` old into `archive/`.
    /// Returns how many files moved.
    pub fn archive_sweep(&self, archive_after_days: u32) -> Result<usize> {
        let cutoff = Utc::now().date_naive() - chrono::Days::new(archive_after_days as u64);
        let mut moved = 0;

        for entry in fs::read_dir(&self.dir)? {
            let entry = entry?;
            if !entry.file_type()?.is_file() {
                continue;
            }
            let name = entry.file_name();
            let Some(date) = parse_day_file_name(&name.to_string_lossy()) else {
                continue;
            };
            if date < cutoff {
                let dest = self.archive_path(date);
                fs::rename(entry.path(), &dest)?;
                moved += 1;
                self.counters.incr(names::EVENT_FILES_ARCHIVED);
                debug!(file = %dest.display(), "day file archived");
            }
        }
        Ok(moved)
    }

    /// Number of corrupt lines skipped since process start.
    pub fn corrupt_line_count(&self) -> u64 {
        self.counters.get(names::EVENT_LINES_CORRUPT)
    }

    fn day_path(&self, date: NaiveDate) -> PathBuf {
        self.dir.join(format!("{}.jsonl", date.format("%Y-%m-%d")))
    }

    fn archive_path(&self, date: NaiveDate) -> PathBuf {
        self.dir
            .join("archive")
            .join(format!("{}.jsonl", date.format("%Y-%m-%d")))
    }

    fn read_file(&self, path: &Path) -> Result<Vec<EventRecord>> {
        let file = File::open(path)?;
        let reader = BufReader::new(file);
        let mut events = Vec::new();
        for line in reader.lines() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<EventRecord>(&line) {
                Ok(event) => events.push(event),
                Err(e) => {
                    self.counters.incr(names::EVENT_LINES_CORRUPT);
                    warn!(file = %path.display(), error = %e, "skipping corrupt event line");
                }
            }
        }
        Ok(events)
    }

    /// Build an id → event map over the whole stream and archive. Chain
    /// walks cross day boundaries, so a per-day read is not enough.
    fn load_index(&self) -> Result<HashMap<u64, EventRecord>> {
        let mut index = HashMap::new();
        for dir in [self.dir.clone(), self.dir.join("archive")] {
            for entry in fs::read_dir(&dir)? {
                let entry = entry?;
                if !entry.file_type()?.is_file() {
                    continue;
                }
                if parse_day_file_name(&entry.file_name().to_string_lossy()).is_none() {
                    continue;
                }
                for event in self.read_file(&entry.path())? {
                    index.insert(event.id, event);
                }
            }
        }
        Ok(index)
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn parse_day_file_name(name: &str) -> Option<NaiveDate> {
    let stem = name.strip_suffix(".jsonl")?;
    NaiveDate::parse_from_str(stem, "%Y-%m-%d").ok()
}

/// Largest prefix of `s` that fits in `max` bytes without splitting a
/// UTF-8 sequence.
fn truncate_utf8(s: &str, max: usize) -> &str {
    if s.len() <= max {
        return s;
    }
    let mut end = max;
    while end > 0 && !s.is_char_boundary(end) {
        end -= 1;
    }
    &s[..end]
}

/// Scan stream and archive for the highest assigned id.
fn scan_max_id(dir: &Path) -> Result<u64> {
    let mut max_id = 0;
    for sub in [dir.to_path_buf(), dir.join("archive")] {
        if !sub.exists() {
            continue;
        }
        for entry in fs::read_dir(&sub)? {
            let entry = entry?;
            if !entry.file_type()?.is_file() {
                continue;
            }
            if parse_day_file_name(&entry.file_name().to_string_lossy()).is_none() {
                continue;
            }
            let file = File::open(entry.path())?;
            for line in BufReader::new(file).lines() {
                let line = line?;
                if let Ok(event) = serde_json::from_str::<EventRecord>(&line) {
                    max_id = max_id.max(event.id);
                }
            }
        }
    }
    Ok(max_id)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
