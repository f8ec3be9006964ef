//! Periodic registry maintenance

use crate::AppState;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::info;

/// Spawn the background task that evicts idle unattached tunnels.
/// The task never fails; a sweep pass logs and the loop continues.
pub fn spawn_sweeper(state: Arc<AppState>) -> JoinHandle<()> {
    let interval = state.config.sweep_interval;
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        ticker.tick().await;

        loop {
            ticker.tick().await;
            let evicted = state.registry.sweep().await;
            if evicted > 0 {
                info!(evicted, "sweep evicted idle tunnels");
            }
        }
    })
}
