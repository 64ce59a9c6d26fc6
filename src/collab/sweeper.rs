use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{info, warn};

use crate::collab::CollabEngine;

/// Spawn the background task that reclaims expired field locks.
///
/// The first pass runs immediately, catching locks left over from a
/// previous run. A failed pass is retried on the next tick.
pub fn spawn_lock_sweeper(engine: Arc<CollabEngine>, every: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(every);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            ticker.tick().await;
            match engine.sweep_expired_locks().await {
                Ok(0) => {}
                Ok(count) => info!("Lock sweeper reclaimed {} expired lock(s)", count),
                Err(e) => warn!("Lock sweep failed, will retry next interval: {}", e),
            }
        }
    })
}
