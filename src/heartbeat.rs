//! Heartbeat monitor
//!
//! Pings every registered connection on a fixed interval and unregisters the
//! ones whose ping cannot be written. The connection set is snapshotted and
//! the registry lock released before any ping goes out.

use std::time::Duration;

use futures_util::future::join_all;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::registry::Registry;

/// Periodic liveness prober
pub struct HeartbeatMonitor {
    registry: Registry,
    interval: Duration,
    shutdown: CancellationToken,
}

impl HeartbeatMonitor {
    pub fn new(registry: Registry, interval: Duration, shutdown: CancellationToken) -> Self {
        Self {
            registry,
            interval,
            shutdown,
        }
    }

    /// Run on a background task until `shutdown` fires
    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(self.run())
    }

    pub async fn run(self) {
        info!(interval = ?self.interval, "heartbeat monitor started");

        let mut ticker = interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick completes immediately
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    let reaped = self.probe().await;
                    if reaped > 0 {
                        info!(reaped, "reaped dead connections");
                    }
                }
            }
        }

        info!("heartbeat monitor stopped");
    }

    /// Ping every connection once; returns how many were unregistered
    pub async fn probe(&self) -> usize {
        let connections = self.registry.connections();
        debug!(connections = connections.len(), "heartbeat probe");

        let results = join_all(connections.into_iter().map(|conn| async move {
            let result = conn.ping().await;
            (conn, result)
        }))
        .await;

        let mut reaped = 0;
        for (conn, result) in results {
            if let Err(e) = result {
                warn!(user_id = conn.user_id(), error = %e, "ping failed");
                self.registry.unregister_connection(&conn).await;
                reaped += 1;
            }
        }
        reaped
    }
}
