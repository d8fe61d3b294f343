//! Heartbeat-based failure detection for the frontend's registry.

use std::time::{Duration, Instant};

use tracing::{info, warn};

use crate::{
    config::{LIVENESS_THRESHOLD, MONITOR_TICK},
    registry::{Eviction, NodeRegistry},
};

/// Evicts nodes whose heartbeat went stale and promotes standbys.
#[derive(Clone, Debug)]
pub struct FailoverMonitor {
    registry: NodeRegistry,
    threshold: Duration,
    tick: Duration,
}

impl FailoverMonitor {
    pub fn new(registry: NodeRegistry) -> Self {
        Self {
            registry,
            threshold: LIVENESS_THRESHOLD,
            tick: MONITOR_TICK,
        }
    }

    pub fn with_threshold(mut self, threshold: Duration) -> Self {
        self.threshold = threshold;
        self
    }

    pub fn with_tick(mut self, tick: Duration) -> Self {
        self.tick = tick;
        self
    }

    /// One pass over every role.
    pub fn sweep(&self, now: Instant) -> Vec<Eviction> {
        let evictions = self.registry.evict_stale(now, self.threshold);

        for eviction in &evictions {
            warn!(role = %eviction.role, slot = eviction.slot_id, "{} unavailable", eviction.role);
            if let Some(promoted) = &eviction.promoted {
                info!(
                    role = %eviction.role,
                    slot = promoted.slot_id,
                    address = %promoted.address,
                    "standby promoted"
                );
            } else if eviction.was_active {
                let active = self.registry.active_count(eviction.role);
                if active < self.registry.replication_factor() {
                    warn!(role = %eviction.role, active, "running with reduced redundancy");
                }
            }
        }

        evictions
    }

    /// Sweeps forever, handing every eviction to `on_eviction`.
    pub async fn run<F>(self, mut on_eviction: F)
    where
        F: FnMut(&Eviction),
    {
        let mut interval = tokio::time::interval(self.tick);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            interval.tick().await;
            for eviction in self.sweep(Instant::now()) {
                on_eviction(&eviction);
            }
        }
    }
}
