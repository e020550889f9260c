//! Async front of the scheduler, shared by the daemon's loops and API.
//!
//! The scheduler and the node registry sit behind `tokio` locks, always
//! taken in that order. Heartbeats pass the concurrency limiter, wait out
//! the configured processing delay, and are cancelled cooperatively when
//! their node is banned: a cancelled heartbeat still gets a response, but
//! starts no jobs.

use std::sync::Arc;

use tokio::sync::RwLock;
use tracing::{debug, info};

use tessera_core::{now_ms, JobId, TesseraConfig};
use tessera_nodes::NodeRegistry;

use crate::error::{SchedulerError, SchedulerResult};
use crate::heartbeat::{HeartbeatLimiter, HeartbeatRequest, HeartbeatResponse, NodeTokens};
use crate::scheduler::Scheduler;

#[derive(Clone)]
pub struct SchedulerService {
    scheduler: Arc<RwLock<Scheduler>>,
    nodes: Arc<RwLock<NodeRegistry>>,
    limiter: Arc<HeartbeatLimiter>,
    tokens: Arc<NodeTokens>,
}

impl SchedulerService {
    pub fn new(scheduler: Scheduler, nodes: NodeRegistry) -> Self {
        let config = scheduler.config();
        let limiter = HeartbeatLimiter::new(
            config.soft_concurrent_heartbeat_limit,
            config.hard_concurrent_heartbeat_limit,
        );
        Self {
            scheduler: Arc::new(RwLock::new(scheduler)),
            nodes: Arc::new(RwLock::new(nodes)),
            limiter: Arc::new(limiter),
            tokens: Arc::new(NodeTokens::default()),
        }
    }

    pub fn scheduler(&self) -> &Arc<RwLock<Scheduler>> {
        &self.scheduler
    }

    pub fn nodes(&self) -> &Arc<RwLock<NodeRegistry>> {
        &self.nodes
    }

    /// Heartbeats currently being processed.
    pub fn in_flight_heartbeats(&self) -> usize {
        self.limiter.in_flight()
    }

    pub async fn heartbeat(&self, request: HeartbeatRequest) -> SchedulerResult<HeartbeatResponse> {
        let Some(permit) = self.limiter.try_acquire() else {
            return Err(SchedulerError::Throttled {
                address: request.address,
                in_flight: self.limiter.in_flight(),
            });
        };
        let token = self.tokens.token(&request.address);
        let delay = self.scheduler.read().await.config().node_heartbeat_processing_delay();

        let cancelled = if delay.is_zero() {
            token.is_cancelled()
        } else {
            tokio::select! {
                _ = token.cancelled() => true,
                _ = tokio::time::sleep(delay) => false,
            }
        };

        let mut scheduler = self.scheduler.write().await;
        let mut nodes = self.nodes.write().await;
        // The node may have been banned while we waited for the locks.
        let cancelled = cancelled || token.is_cancelled();
        if cancelled {
            debug!(address = %request.address, "heartbeat cancelled, job starts discarded");
        }
        let schedule = !permit.throttled && !cancelled;
        let response = scheduler.process_heartbeat(&mut nodes, &request, schedule, now_ms());
        drop(permit);
        response
    }

    /// Ban a node: cancel its in-flight heartbeats and abort its jobs.
    pub async fn ban_node(&self, address: &str) -> SchedulerResult<Vec<JobId>> {
        self.tokens.cancel(address);
        let mut scheduler = self.scheduler.write().await;
        let mut nodes = self.nodes.write().await;
        scheduler.ban_node(&mut nodes, address, now_ms())
    }

    pub async fn fair_share_tick(&self) {
        let mut scheduler = self.scheduler.write().await;
        let mut nodes = self.nodes.write().await;
        scheduler.fair_share_tick(&mut nodes, now_ms());
    }

    pub async fn apply_config(&self, config: TesseraConfig) {
        self.limiter.set_limits(
            config.soft_concurrent_heartbeat_limit,
            config.hard_concurrent_heartbeat_limit,
        );
        self.scheduler.write().await.apply_config(config);
        info!("scheduler service reconfigured");
    }
}
