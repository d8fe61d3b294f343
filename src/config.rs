//! Timing constants and the per-process settings shared by every role.

use std::time::Duration;

/// A node whose last heartbeat is older than this is declared dead.
pub const LIVENESS_THRESHOLD: Duration = Duration::from_secs(3);

/// How often a backend node reports to the frontend.
pub const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(1);

/// Pause between two sweeps of the failover monitor.
pub const MONITOR_TICK: Duration = Duration::from_millis(100);

/// Period of the diagnostic state dump.
pub const STATE_DUMP_INTERVAL: Duration = Duration::from_secs(3);

/// Advisory watchdog per hop.
pub const DEFAULT_HOP_TIMEOUT: Duration = Duration::from_secs(10);

/// Deadline attached to every tarpc request. Must cover a whole nested chain.
pub const DEFAULT_RPC_DEADLINE: Duration = Duration::from_secs(60);

pub const DEFAULT_REPLICATION_FACTOR: usize = 2;

/// Largest file the client is willing to ship (1 MiB).
pub const MAX_FILE_SIZE: usize = 1 << 20;

/// Separator used when storage nodes accumulate file names during a list.
pub const LIST_SEPARATOR: &str = ",";

/// Reply for remote methods a role does not implement.
pub const UNSUPPORTED_REPLY: &str = "Incorrect node service";

/// Runtime knobs. Every server and the client carry one of these.
#[derive(Clone, Debug)]
pub struct Settings {
    /// Upper bound on active nodes per role.
    pub replication_factor: usize,
    pub hop_timeout: Duration,
    pub rpc_deadline: Duration,
    pub liveness_threshold: Duration,
    pub heartbeat_interval: Duration,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            replication_factor: DEFAULT_REPLICATION_FACTOR,
            hop_timeout: DEFAULT_HOP_TIMEOUT,
            rpc_deadline: DEFAULT_RPC_DEADLINE,
            liveness_threshold: LIVENESS_THRESHOLD,
            heartbeat_interval: HEARTBEAT_INTERVAL,
        }
    }
}

impl Settings {
    pub fn with_replication_factor(mut self, replication_factor: usize) -> Self {
        self.replication_factor = replication_factor;
        self
    }
}

/// Installs the fmt subscriber. `RUST_LOG` overrides the default `info` filter.
pub fn init_logging() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,tarpc=warn".into()),
        )
        .init();
}

/// Registers a chain error handler that logs instead of exiting, for
/// long-running servers.
pub fn log_chain_errors() {
    crate::chain::register_error_handler(|chain, reason| {
        tracing::warn!(chain = %chain.id, position = chain.position, "chain error: {}", reason);
    });
}
