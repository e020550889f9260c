//! Node heartbeats: wire types, concurrency limits and per-node
//! cancellation.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use tessera_core::{JobId, OperationId, ResourceVector};

use crate::job::AbortReason;

/// What a node reports about its jobs since the last heartbeat.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct HeartbeatRequest {
    pub address: String,
    pub completed_jobs: Vec<JobId>,
    pub failed_jobs: Vec<JobId>,
    /// Jobs that made I/O progress.
    pub progressed_jobs: Vec<JobId>,
}

impl HeartbeatRequest {
    pub fn new(address: &str) -> Self {
        Self {
            address: address.to_string(),
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct JobStart {
    pub job_id: JobId,
    pub operation_id: OperationId,
    pub resources: ResourceVector,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct HeartbeatResponse {
    pub jobs_to_start: Vec<JobStart>,
    pub jobs_to_abort: Vec<(JobId, AbortReason)>,
    pub jobs_to_interrupt: Vec<JobId>,
    /// Over the soft limit: reports were applied, nothing was scheduled.
    pub scheduling_skipped: bool,
}

// ── Concurrency limits ─────────────────────────────────────────

/// Counts heartbeats in flight against a soft and a hard limit.
///
/// Past the soft limit heartbeats are still processed but do not schedule
/// jobs; the hard limit is never exceeded.
#[derive(Debug)]
pub struct HeartbeatLimiter {
    in_flight: Arc<AtomicUsize>,
    soft: AtomicUsize,
    hard: AtomicUsize,
}

/// Held for the duration of one heartbeat.
#[derive(Debug)]
pub struct HeartbeatPermit {
    in_flight: Arc<AtomicUsize>,
    /// Admitted above the soft limit.
    pub throttled: bool,
}

impl Drop for HeartbeatPermit {
    fn drop(&mut self) {
        self.in_flight.fetch_sub(1, Ordering::AcqRel);
    }
}

impl HeartbeatLimiter {
    pub fn new(soft: usize, hard: usize) -> Self {
        Self {
            in_flight: Arc::new(AtomicUsize::new(0)),
            soft: AtomicUsize::new(soft),
            hard: AtomicUsize::new(hard.max(1)),
        }
    }

    pub fn set_limits(&self, soft: usize, hard: usize) {
        self.soft.store(soft, Ordering::Release);
        self.hard.store(hard.max(1), Ordering::Release);
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::Acquire)
    }

    /// Admit one heartbeat, or `None` at the hard limit.
    pub fn try_acquire(&self) -> Option<HeartbeatPermit> {
        let hard = self.hard.load(Ordering::Acquire);
        let mut current = self.in_flight.load(Ordering::Acquire);
        loop {
            if current >= hard {
                return None;
            }
            match self
                .in_flight
                .compare_exchange(current, current + 1, Ordering::AcqRel, Ordering::Acquire)
            {
                Ok(_) => break,
                Err(actual) => current = actual,
            }
        }
        Some(HeartbeatPermit {
            in_flight: Arc::clone(&self.in_flight),
            throttled: current >= self.soft.load(Ordering::Acquire),
        })
    }
}

// ── Cancellation ───────────────────────────────────────────────

/// One cancellation token per node, cancelled when the node is banned.
#[derive(Debug, Default)]
pub struct NodeTokens {
    tokens: Mutex<BTreeMap<String, CancellationToken>>,
}

impl NodeTokens {
    pub fn token(&self, address: &str) -> CancellationToken {
        let mut tokens = self.tokens.lock().unwrap_or_else(|e| e.into_inner());
        tokens.entry(address.to_string()).or_default().clone()
    }

    /// Cancel in-flight heartbeats of the node; later heartbeats get a
    /// fresh token.
    pub fn cancel(&self, address: &str) {
        let mut tokens = self.tokens.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(token) = tokens.remove(address) {
            token.cancel();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn soft_limit_throttles_and_hard_limit_rejects() {
        let limiter = HeartbeatLimiter::new(1, 2);
        let first = limiter.try_acquire().unwrap();
        assert!(!first.throttled);
        let second = limiter.try_acquire().unwrap();
        assert!(second.throttled);
        assert!(limiter.try_acquire().is_none());
        assert_eq!(limiter.in_flight(), 2);
        drop(first);
        assert_eq!(limiter.in_flight(), 1);
        assert!(limiter.try_acquire().is_some());
    }

    #[test]
    fn cancelled_token_is_replaced() {
        let tokens = NodeTokens::default();
        let before = tokens.token("n1");
        tokens.cancel("n1");
        assert!(before.is_cancelled());
        assert!(!tokens.token("n1").is_cancelled());
    }
}
