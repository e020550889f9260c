//! The controller's periodic loops.
//!
//! Each loop re-reads its period from the current config before sleeping,
//! so `apply_config` changes the cadence from the next iteration on. All
//! loops stop when the shutdown channel flips.

use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::debug;

use tessera_core::now_ms;

use crate::controller::Controller;

/// Floor for configured periods, so a zero period cannot spin.
const MIN_PERIOD: Duration = Duration::from_millis(10);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Pass {
    FairShare,
    Balancer,
    EventLog,
}

impl Pass {
    fn name(self) -> &'static str {
        match self {
            Pass::FairShare => "fair-share",
            Pass::Balancer => "balancer",
            Pass::EventLog => "event-log",
        }
    }

    async fn period(self, controller: &Controller) -> Duration {
        let config = controller.config().await;
        let period = match self {
            Pass::FairShare => config.fair_share_update_period(),
            Pass::Balancer => config.tablet_manager.balancer_tick_period(),
            // Checked often; the writer decides whether a flush is due.
            Pass::EventLog => config
                .event_log
                .flush_period()
                .min(Duration::from_millis(config.event_log.retry_backoff_time_ms)),
        };
        period.max(MIN_PERIOD)
    }

    async fn run_once(self, controller: &Controller) {
        let now = now_ms();
        match self {
            Pass::FairShare => controller.fair_share_pass(now).await,
            Pass::Balancer => controller.balancer_pass(now).await,
            Pass::EventLog => controller.flush_event_log(now).await,
        }
    }
}

async fn run_loop(controller: Controller, pass: Pass, mut shutdown: watch::Receiver<bool>) {
    debug!(pass = pass.name(), "loop starting");
    loop {
        let period = pass.period(&controller).await;
        tokio::select! {
            _ = tokio::time::sleep(period) => pass.run_once(&controller).await,
            _ = shutdown.changed() => {
                debug!(pass = pass.name(), "loop shutting down");
                break;
            }
        }
    }
}

/// Spawn the fair-share, balancer and event-log loops.
pub fn spawn_loops(controller: &Controller, shutdown: watch::Receiver<bool>) -> Vec<JoinHandle<()>> {
    [Pass::FairShare, Pass::Balancer, Pass::EventLog]
        .into_iter()
        .map(|pass| tokio::spawn(run_loop(controller.clone(), pass, shutdown.clone())))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tessera_core::{TesseraConfig, UserDirectory};

    #[tokio::test(start_paused = true)]
    async fn loops_tick_and_stop_on_shutdown() {
        let mut config = TesseraConfig::default();
        config.fair_share_update_period_ms = 100;
        let controller = Controller::in_memory(config, UserDirectory::default()).unwrap();

        let (tx, rx) = watch::channel(false);
        let handles = spawn_loops(&controller, rx);
        tokio::time::sleep(Duration::from_millis(350)).await;

        let snapshot = controller
            .scheduler()
            .read()
            .await
            .shares("default")
            .map(|s| s.snapshot_id);
        assert!(snapshot >= Some(2));

        tx.send(true).unwrap();
        for handle in handles {
            handle.await.unwrap();
        }
    }
}
