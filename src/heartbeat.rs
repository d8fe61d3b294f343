//! Background loops shared by the backend servers.

use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::{debug, info, instrument, warn};

use crate::{
    chain::Role,
    error::{ChainError, Result},
    registry::{ActivityReport, NodeDescriptor, SlotId},
    replica::Snapshot,
    transport, MembershipClient,
};

/// What a backend tells the frontend on every heartbeat.
pub trait Reporter: Send + Sync + 'static {
    fn descriptor(&self) -> NodeDescriptor;

    /// Everything this node currently holds.
    fn snapshot(&self) -> Snapshot;

    /// Credentials to hand in for safekeeping. Only auth has any.
    fn credential_backup(&self) -> Option<Snapshot> {
        None
    }
}

/// Asks the frontend for a fresh slot id.
#[instrument]
pub async fn join(frontend: &str, role: Role, address: &str, deadline: Duration) -> Result<SlotId> {
    let membership = transport::connect_membership(frontend).await?;
    let slot = membership
        .join(transport::context(deadline), role, address.to_string())
        .await?
        .ok_or(ChainError::Rejected)?;
    info!(%role, slot, "joined");
    Ok(slot)
}

/// Reports `reporter` to the frontend every `interval`, forever. A failed
/// report drops the connection and dials again on the next tick.
pub async fn run<R: Reporter>(reporter: R, frontend: String, interval: Duration, deadline: Duration) {
    let mut ticker = tokio::time::interval(interval);
    let mut membership: Option<MembershipClient> = None;

    loop {
        ticker.tick().await;

        let client = match membership.take() {
            Some(client) => client,
            None => match transport::connect_membership(&frontend).await {
                Ok(client) => client,
                Err(err) => {
                    warn!(%frontend, "frontend unreachable: {}", err);
                    continue;
                }
            },
        };

        match beat(&reporter, &client, deadline).await {
            Ok(()) => membership = Some(client),
            Err(err) => warn!(%frontend, "heartbeat failed: {}", err),
        }
    }
}

async fn beat<R: Reporter>(reporter: &R, client: &MembershipClient, deadline: Duration) -> Result<()> {
    let report = ActivityReport {
        descriptor: reporter.descriptor(),
        snapshot: reporter.snapshot(),
    };
    let ack = client
        .report_server_activity(transport::context(deadline), report)
        .await?;
    debug!(%ack, "heartbeat");

    if let Some(backup) = reporter.credential_backup().filter(|backup| !backup.is_empty()) {
        let ack = client.auth_recovery(transport::context(deadline), backup).await?;
        debug!(%ack, "credential backup");
    }

    Ok(())
}

/// Logs `describe()` at debug level every `interval`.
pub fn spawn_state_dump<F>(interval: Duration, describe: F) -> JoinHandle<()>
where
    F: Fn() -> String + Send + 'static,
{
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        loop {
            ticker.tick().await;
            debug!("{}", describe());
        }
    })
}
