//! The controller: every subsystem behind its lock, and the passes the
//! periodic loops drive.
//!
//! Locks are always taken in the order scheduler, nodes, cells, so the
//! fair-share pass, the balancer pass and the API never deadlock.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, warn};

use tessera_balancer::{settle_peers, CellBalancer};
use tessera_cells::CellStore;
use tessera_core::{now_ms, Millis, TesseraConfig, UserDirectory};
use tessera_nodes::NodeRegistry;
use tessera_orchid::{EventLogWriter, OrchidTree};
use tessera_scheduler::{Scheduler, SchedulerService};
use tessera_state::StateStore;

#[derive(Clone)]
pub struct Controller {
    config: Arc<RwLock<TesseraConfig>>,
    service: SchedulerService,
    cells: Arc<RwLock<CellStore>>,
    balancer: Arc<Mutex<CellBalancer>>,
    event_log: Arc<Mutex<EventLogWriter>>,
    orchid: Arc<RwLock<OrchidTree>>,
    state: StateStore,
}

impl Controller {
    /// Assemble the subsystems over `state`, restoring the scheduler's
    /// fair-share snapshots from it.
    pub fn new(config: TesseraConfig, state: StateStore, users: UserDirectory) -> anyhow::Result<Self> {
        let now = now_ms();

        let nodes = NodeRegistry::new()
            .with_heartbeat_timeout(Duration::from_millis(config.scheduler.node_heartbeat_timeout_ms))
            .with_default_tablet_slots(config.tablet_manager.default_tablet_slot_count);

        let mut scheduler = Scheduler::new(config.clone(), users.clone());
        let restored = scheduler.load_snapshots(&state, now)?;
        if !restored.is_empty() {
            info!(trees = ?restored, "fair-share state restored");
        }

        let mut cells = CellStore::new(state.clone());
        *cells.users_mut() = users;
        cells.set_safe_mode(config.enable_safe_mode);

        let balancer = CellBalancer::new(config.tablet_manager.clone());
        let event_log = EventLogWriter::open(config.event_log.clone())?;
        let orchid = OrchidTree::build(&scheduler, &nodes, &cells, now)?;

        Ok(Self {
            config: Arc::new(RwLock::new(config)),
            service: SchedulerService::new(scheduler, nodes),
            cells: Arc::new(RwLock::new(cells)),
            balancer: Arc::new(Mutex::new(balancer)),
            event_log: Arc::new(Mutex::new(event_log)),
            orchid: Arc::new(RwLock::new(orchid)),
            state,
        })
    }

    /// Controller over an in-memory store, for tests and dry runs.
    pub fn in_memory(config: TesseraConfig, users: UserDirectory) -> anyhow::Result<Self> {
        Self::new(config, StateStore::open_in_memory()?, users)
    }

    pub fn service(&self) -> &SchedulerService {
        &self.service
    }

    pub fn scheduler(&self) -> &Arc<RwLock<Scheduler>> {
        self.service.scheduler()
    }

    pub fn nodes(&self) -> &Arc<RwLock<NodeRegistry>> {
        self.service.nodes()
    }

    pub fn cells(&self) -> &Arc<RwLock<CellStore>> {
        &self.cells
    }

    pub fn event_log(&self) -> &Arc<Mutex<EventLogWriter>> {
        &self.event_log
    }

    pub fn orchid(&self) -> &Arc<RwLock<OrchidTree>> {
        &self.orchid
    }

    pub async fn config(&self) -> TesseraConfig {
        self.config.read().await.clone()
    }

    /// Swap the dynamic config. Subsequent passes see the new values.
    pub async fn apply_config(&self, config: TesseraConfig) {
        self.service.apply_config(config.clone()).await;
        self.cells.write().await.set_safe_mode(config.enable_safe_mode);
        self.balancer
            .lock()
            .await
            .set_config(config.tablet_manager.clone());
        self.event_log
            .lock()
            .await
            .set_config(config.event_log.clone());
        *self.config.write().await = config;
        info!("dynamic config applied");
    }

    // ── Periodic passes ────────────────────────────────────────────

    /// Fair-share tick, then log what it decided, persist the fair-share
    /// snapshots and refresh orchid.
    pub async fn fair_share_pass(&self, now: Millis) {
        {
            let mut scheduler = self.scheduler().write().await;
            let mut nodes = self.nodes().write().await;
            scheduler.fair_share_tick(&mut nodes, now);
        }

        {
            let mut scheduler = self.scheduler().write().await;
            let mut log = self.event_log.lock().await;
            log.log_scheduler_events(&scheduler.drain_events());
            for tree in scheduler.trees().names() {
                if let Some(shares) = scheduler.shares(&tree) {
                    log.log_fair_share(shares, now);
                }
                if log.accumulated_usage_due(&tree, now) {
                    let usage = scheduler.drain_accumulated_usage(&tree);
                    if let Ok(pool_tree) = scheduler.tree(&tree) {
                        log.log_accumulated_usage(pool_tree, &usage, now);
                    }
                }
            }
            if let Err(e) = scheduler.save_snapshots(&self.state, now) {
                warn!(error = %e, "fair-share snapshot not saved");
            }
        }

        self.refresh_orchid(now).await;
    }

    /// Balancer tick over all cells, the node-side peer reports, and the
    /// store's own transitions.
    pub async fn balancer_pass(&self, now: Millis) {
        let events = {
            let mut nodes = self.nodes().write().await;
            let mut cells = self.cells.write().await;
            let mut balancer = self.balancer.lock().await;
            let events = match balancer.tick(&mut cells, &mut nodes, now) {
                Ok(events) => events,
                Err(e) => {
                    warn!(error = %e, "balancer pass failed");
                    Vec::new()
                }
            };
            if let Err(e) = settle_peers(&mut cells, &nodes) {
                warn!(error = %e, "peer reports failed");
            }
            if let Err(e) = cells.tick(now) {
                warn!(error = %e, "cell store tick failed");
            }
            events
        };
        if !events.is_empty() {
            debug!(events = events.len(), "balancer pass produced events");
            self.event_log.lock().await.log_balancer_events(&events);
        }
        self.refresh_orchid(now).await;
    }

    /// Flush the event log if its period (or retry backoff) elapsed.
    pub async fn flush_event_log(&self, now: Millis) {
        let mut log = self.event_log.lock().await;
        if log.flush_due(now) {
            // Failures are logged by the writer and retried after backoff.
            let _ = log.flush(now);
        }
    }

    pub async fn refresh_orchid(&self, now: Millis) {
        let built = {
            let scheduler = self.scheduler().read().await;
            let nodes = self.nodes().read().await;
            let cells = self.cells.read().await;
            OrchidTree::build(&scheduler, &nodes, &cells, now)
        };
        match built {
            Ok(tree) => *self.orchid.write().await = tree,
            Err(e) => warn!(error = %e, "orchid rebuild failed"),
        }
    }

    /// Final flush and snapshot before exit.
    pub async fn shutdown(&self) {
        let now = now_ms();
        if let Err(e) = self.scheduler().read().await.save_snapshots(&self.state, now) {
            warn!(error = %e, "fair-share snapshot not saved on shutdown");
        }
        if let Err(e) = self.event_log.lock().await.flush(now) {
            warn!(error = %e, "event log not flushed on shutdown");
        }
        info!("controller stopped");
    }
}
