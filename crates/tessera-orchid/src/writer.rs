//! Buffered event log writer.
//!
//! Records are buffered in memory and handed to the sink once per flush
//! period. A failed flush keeps the buffer and is retried after the
//! backoff time instead of the next period. While the log is disabled new
//! records are dropped.

use std::collections::BTreeMap;

use tracing::{debug, warn};

use tessera_balancer::BalancerEvent;
use tessera_core::{EventLogConfig, Millis, ResourceVector};
use tessera_fairshare::TreeShares;
use tessera_pools::PoolTree;
use tessera_scheduler::SchedulerEvent;

use crate::error::OrchidResult;
use crate::record::{self, EventRecord};
use crate::sink::{EventSink, FileEventSink, MemoryEventSink};

/// Ring size used when no log file is configured.
pub const DEFAULT_MEMORY_CAPACITY: usize = 100_000;

pub struct EventLogWriter {
    config: EventLogConfig,
    sink: Box<dyn EventSink>,
    buffer: Vec<EventRecord>,
    last_flush: Option<Millis>,
    retry_at: Option<Millis>,
    /// Tree → snapshot id of the last logged `fair_share_info`.
    logged_snapshots: BTreeMap<String, u64>,
    /// Tree → pool names at the last `pools_info`.
    logged_pools: BTreeMap<String, Vec<String>>,
    /// Tree → time of the last accumulated usage record.
    last_usage_log: BTreeMap<String, Millis>,
    dropped: u64,
}

impl EventLogWriter {
    pub fn new(config: EventLogConfig, sink: impl EventSink + 'static) -> Self {
        Self {
            config,
            sink: Box::new(sink),
            buffer: Vec::new(),
            last_flush: None,
            retry_at: None,
            logged_snapshots: BTreeMap::new(),
            logged_pools: BTreeMap::new(),
            last_usage_log: BTreeMap::new(),
            dropped: 0,
        }
    }

    /// Writer over the configured file, or over a fresh memory ring when
    /// no path is set.
    pub fn open(config: EventLogConfig) -> OrchidResult<Self> {
        match config.path.clone() {
            Some(path) => {
                let sink = FileEventSink::open(&path)?;
                debug!(path = %path.display(), "event log file opened");
                Ok(Self::new(config, sink))
            }
            None => Ok(Self::new(config, MemoryEventSink::new(DEFAULT_MEMORY_CAPACITY))),
        }
    }

    pub fn config(&self) -> &EventLogConfig {
        &self.config
    }

    pub fn set_config(&mut self, config: EventLogConfig) {
        self.config = config;
    }

    /// Records waiting for the next flush.
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    /// Records discarded while the log was disabled.
    pub fn dropped(&self) -> u64 {
        self.dropped
    }

    pub fn log(&mut self, record: EventRecord) {
        if !self.config.enabled {
            self.dropped += 1;
            return;
        }
        self.buffer.push(record);
    }

    pub fn log_scheduler_events(&mut self, events: &[SchedulerEvent]) {
        for event in events {
            match EventRecord::from_scheduler(event) {
                Ok(record) => self.log(record),
                Err(e) => warn!(error = %e, "scheduler event not logged"),
            }
        }
    }

    pub fn log_balancer_events(&mut self, events: &[BalancerEvent]) {
        for event in events {
            match EventRecord::from_balancer(event) {
                Ok(record) => self.log(record),
                Err(e) => warn!(cell_id = %event.cell_id, error = %e, "balancer event not logged"),
            }
        }
    }

    /// Log the shares of one tree. Returns false when this snapshot was
    /// already logged. A `pools_info` record precedes it whenever the set
    /// of pools changed.
    pub fn log_fair_share(&mut self, shares: &TreeShares, now: Millis) -> bool {
        if self.logged_snapshots.get(&shares.tree) == Some(&shares.snapshot_id) {
            debug!(tree = %shares.tree, snapshot = shares.snapshot_id, "tree snapshot already logged");
            return false;
        }
        self.logged_snapshots
            .insert(shares.tree.clone(), shares.snapshot_id);

        let pool_names: Vec<String> = shares.pools.keys().cloned().collect();
        if self.logged_pools.get(&shares.tree) != Some(&pool_names) {
            self.logged_pools.insert(shares.tree.clone(), pool_names);
            self.log(record::pools_info(shares, now));
        }

        match record::fair_share_info(shares, now, self.config.max_event_log_operation_batch_size) {
            Ok(records) => records.into_iter().for_each(|r| self.log(r)),
            Err(e) => warn!(tree = %shares.tree, error = %e, "fair share info not logged"),
        }
        true
    }

    pub fn accumulated_usage_due(&self, tree: &str, now: Millis) -> bool {
        self.last_usage_log
            .get(tree)
            .is_none_or(|t| now.saturating_sub(*t) >= self.config.accumulated_usage_log_period_ms)
    }

    /// Log usage accumulated since the previous call for this tree,
    /// followed by per-pool metering records.
    pub fn log_accumulated_usage(&mut self, tree: &PoolTree, usage: &BTreeMap<String, ResourceVector>, now: Millis) {
        let since = self.last_usage_log.insert(tree.name().to_string(), now);
        self.log(record::accumulated_usage_info(tree.name(), usage, now));
        if let Some(since) = since {
            for r in record::metering(tree, usage, since, now) {
                self.log(r);
            }
        }
    }

    /// Whether `flush` should run at `now`: after a failure, once the
    /// backoff passed; otherwise once per flush period.
    pub fn flush_due(&self, now: Millis) -> bool {
        if let Some(retry_at) = self.retry_at {
            return now >= retry_at;
        }
        self.last_flush
            .is_none_or(|t| now.saturating_sub(t) >= self.config.flush_period_ms)
    }

    /// Hand the buffer to the sink. Returns the number of records written.
    pub fn flush(&mut self, now: Millis) -> OrchidResult<usize> {
        if self.buffer.is_empty() {
            self.last_flush = Some(now);
            self.retry_at = None;
            return Ok(0);
        }
        match self.sink.write_batch(&self.buffer) {
            Ok(()) => {
                let written = self.buffer.len();
                self.buffer.clear();
                self.last_flush = Some(now);
                self.retry_at = None;
                debug!(written, "event log flushed");
                Ok(written)
            }
            Err(e) => {
                self.retry_at = Some(now + self.config.retry_backoff_time_ms);
                warn!(
                    buffered = self.buffer.len(),
                    retry_in_ms = self.config.retry_backoff_time_ms,
                    error = %e,
                    "event log flush failed"
                );
                Err(e)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::OrchidError;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    /// Fails the first `failures` writes, then forwards to a memory sink.
    struct FlakySink {
        failures: Arc<AtomicUsize>,
        inner: MemoryEventSink,
    }

    impl EventSink for FlakySink {
        fn write_batch(&mut self, records: &[EventRecord]) -> OrchidResult<()> {
            if self.failures.load(Ordering::SeqCst) > 0 {
                self.failures.fetch_sub(1, Ordering::SeqCst);
                return Err(OrchidError::SinkUnavailable("down".into()));
            }
            self.inner.write_batch(records)
        }
    }

    fn config() -> EventLogConfig {
        EventLogConfig {
            flush_period_ms: 5_000,
            retry_backoff_time_ms: 1_000,
            ..EventLogConfig::default()
        }
    }

    fn shares(snapshot_id: u64) -> TreeShares {
        TreeShares {
            tree: "default".into(),
            snapshot_id,
            ..TreeShares::default()
        }
    }

    #[test]
    fn flushes_once_per_period() {
        let sink = MemoryEventSink::new(100);
        let mut writer = EventLogWriter::new(config(), sink.clone());
        assert!(writer.flush_due(0));
        writer.log(EventRecord::new("operation_started", 0));
        assert_eq!(writer.flush(0).unwrap(), 1);

        writer.log(EventRecord::new("operation_completed", 10));
        assert!(!writer.flush_due(4_999));
        assert!(writer.flush_due(5_000));
        writer.flush(5_000).unwrap();
        assert_eq!(sink.len(), 2);
        assert_eq!(writer.buffered(), 0);
    }

    #[test]
    fn failed_flush_keeps_records_and_retries_after_backoff() {
        let failures = Arc::new(AtomicUsize::new(1));
        let inner = MemoryEventSink::new(100);
        let mut writer = EventLogWriter::new(
            config(),
            FlakySink {
                failures: failures.clone(),
                inner: inner.clone(),
            },
        );
        writer.log(EventRecord::new("job_started", 1).with("node", json!("n1")));

        assert!(writer.flush(100).is_err());
        assert_eq!(writer.buffered(), 1);
        assert!(!writer.flush_due(1_099));
        assert!(writer.flush_due(1_100));

        assert_eq!(writer.flush(1_100).unwrap(), 1);
        assert_eq!(inner.of_type("job_started").len(), 1);
        assert!(!writer.flush_due(2_000));
    }

    #[test]
    fn disabled_log_drops_records() {
        let sink = MemoryEventSink::new(100);
        let mut writer = EventLogWriter::new(
            EventLogConfig {
                enabled: false,
                ..config()
            },
            sink.clone(),
        );
        writer.log(EventRecord::new("job_started", 1));
        assert_eq!(writer.buffered(), 0);
        assert_eq!(writer.dropped(), 1);
    }

    #[test]
    fn same_tree_snapshot_is_logged_once() {
        let sink = MemoryEventSink::new(100);
        let mut writer = EventLogWriter::new(config(), sink.clone());
        assert!(writer.log_fair_share(&shares(1), 0));
        assert!(!writer.log_fair_share(&shares(1), 100));
        assert!(writer.log_fair_share(&shares(2), 200));
        writer.flush(200).unwrap();

        assert_eq!(sink.of_type(record::POOLS_INFO).len(), 1);
        let snapshots: Vec<u64> = sink
            .of_type(record::FAIR_SHARE_INFO)
            .iter()
            .filter_map(|r| r.get("tree_snapshot_id").and_then(|v| v.as_u64()))
            .collect();
        assert_eq!(snapshots, vec![1, 2]);
    }
}
