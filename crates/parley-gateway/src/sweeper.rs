use std::time::Duration;

use tracing::{info, warn};

use crate::handler::Gateway;

/// Background task that flips users to offline once their heartbeats stop.
///
/// Covers clients that vanish without a clean close, which would otherwise
/// stay online forever.
pub async fn run_presence_sweep(gateway: Gateway, interval: Duration, stale_after: chrono::Duration) {
    let mut interval = tokio::time::interval(interval);

    loop {
        interval.tick().await;

        match gateway.sweep_stale_presence(stale_after).await {
            Ok(count) => {
                if count > 0 {
                    info!("Presence sweep: {} stale user(s) marked offline", count);
                }
            }
            Err(e) => {
                warn!("Presence sweep error: {}", e);
            }
        }
    }
}
