//! Periodic `scheduled → ready` promotion.
//!
//! Sessions whose `scheduled_start_at` has passed are marked ready on the
//! next tick. Idle per-session locks are pruned on the same cadence.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio_util::sync::CancellationToken;

use crate::membership::MembershipEngine;

/// Run one promotion pass. Returns the number of sessions promoted.
pub async fn tick(engine: &MembershipEngine) -> usize {
    let promoted = match engine.promote_due_sessions(Utc::now()).await {
        Ok(promoted) => promoted,
        Err(e) => {
            tracing::error!(error = %e, "readiness pass failed");
            0
        }
    };
    if promoted > 0 {
        tracing::info!(promoted, "sessions marked ready");
    }

    let pruned = engine.prune_locks();
    if pruned > 0 {
        tracing::debug!(pruned, "idle session locks pruned");
    }
    promoted
}

/// Run the readiness loop until `cancel` is triggered.
pub async fn run(engine: Arc<MembershipEngine>, every: Duration, cancel: CancellationToken) {
    tracing::info!(interval_secs = every.as_secs(), "readiness task started");

    let mut interval = tokio::time::interval(every);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                tracing::info!("readiness task stopping");
                break;
            }
            _ = interval.tick() => {
                tick(&engine).await;
            }
        }
    }
}
