//! Event sinks: where flushed records end up.

use std::collections::VecDeque;
use std::fs::{self, File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use crate::error::OrchidResult;
use crate::record::EventRecord;

/// Destination of event log batches. A failed write may be retried with
/// the same batch, so sinks should not keep partial batches.
pub trait EventSink: Send {
    fn write_batch(&mut self, records: &[EventRecord]) -> OrchidResult<()>;
}

/// Bounded in-memory ring. Clones share the same buffer, so one handle
/// can be given to the writer while another reads.
#[derive(Clone)]
pub struct MemoryEventSink {
    records: Arc<Mutex<VecDeque<EventRecord>>>,
    capacity: usize,
}

impl MemoryEventSink {
    pub fn new(capacity: usize) -> Self {
        Self {
            records: Arc::new(Mutex::new(VecDeque::new())),
            capacity: capacity.max(1),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, VecDeque<EventRecord>> {
        self.records.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn records(&self) -> Vec<EventRecord> {
        self.lock().iter().cloned().collect()
    }

    pub fn of_type(&self, event_type: &str) -> Vec<EventRecord> {
        self.lock()
            .iter()
            .filter(|r| r.event_type == event_type)
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    pub fn clear(&self) {
        self.lock().clear();
    }
}

impl EventSink for MemoryEventSink {
    fn write_batch(&mut self, records: &[EventRecord]) -> OrchidResult<()> {
        let mut ring = self.lock();
        for record in records {
            if ring.len() == self.capacity {
                ring.pop_front();
            }
            ring.push_back(record.clone());
        }
        Ok(())
    }
}

/// Appends records as JSON lines to a file.
pub struct FileEventSink {
    path: PathBuf,
    file: BufWriter<File>,
}

impl FileEventSink {
    pub fn open(path: &Path) -> OrchidResult<Self> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Self {
            path: path.to_path_buf(),
            file: BufWriter::new(file),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl EventSink for FileEventSink {
    fn write_batch(&mut self, records: &[EventRecord]) -> OrchidResult<()> {
        // Serialize everything first so a bad record leaves the file alone.
        let mut lines = String::new();
        for record in records {
            lines.push_str(&record.to_json_line()?);
            lines.push('\n');
        }
        self.file.write_all(lines.as_bytes())?;
        self.file.flush()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::tempdir;

    fn record(i: u64) -> EventRecord {
        EventRecord::new("job_started", i).with("index", json!(i))
    }

    #[test]
    fn memory_sink_drops_oldest_past_capacity() {
        let sink = MemoryEventSink::new(3);
        let mut writer_side = sink.clone();
        writer_side
            .write_batch(&(0..5).map(record).collect::<Vec<_>>())
            .unwrap();
        let timestamps: Vec<u64> = sink.records().iter().map(|r| r.timestamp).collect();
        assert_eq!(timestamps, vec![2, 3, 4]);
    }

    #[test]
    fn file_sink_appends_json_lines() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("log/events.jsonl");

        let mut sink = FileEventSink::open(&path).unwrap();
        sink.write_batch(&[record(1), record(2)]).unwrap();
        drop(sink);
        let mut sink = FileEventSink::open(&path).unwrap();
        sink.write_batch(&[record(3)]).unwrap();

        let contents = fs::read_to_string(&path).unwrap();
        let parsed: Vec<EventRecord> = contents
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect();
        assert_eq!(parsed.len(), 3);
        assert_eq!(parsed[2].timestamp, 3);
        assert_eq!(parsed[0].get("index"), Some(&json!(1)));
    }
}
