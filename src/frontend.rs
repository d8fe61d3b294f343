//! The frontend: admission, chain routing and cluster membership.
//!
//! Chains enter through [`Node::invoke`] on the frontend's chain address.
//! Backends talk to the [`Membership`] service on a second address.

use std::{
    sync::{Arc, Mutex, PoisonError},
    time::Instant,
};

use futures::future::join_all;
use tarpc::context::Context;
use tokio::task::JoinHandle;
use tracing::{debug, info, instrument, warn};

use crate::{
    chain::{EntryPoint, RpcChain, Role, StatusCode},
    composer,
    config::{Settings, STATE_DUMP_INTERVAL, UNSUPPORTED_REPLY},
    heartbeat,
    monitor::FailoverMonitor,
    registry::{ActivityReport, NodeDescriptor, NodeRegistry, Placement, SlotId},
    replica::{self, Snapshot},
    tracelog::VectorLog,
    transport, Membership, Node,
};

#[derive(Clone, Debug)]
pub struct FrontendServer(Arc<Inner>);

#[derive(Debug)]
struct Inner {
    registry: NodeRegistry,
    settings: Settings,
    tracelog: VectorLog,
    /// Latest non-empty credential map handed in by auth.
    credential_backup: Mutex<Snapshot>,
}

impl FrontendServer {
    pub fn new(settings: Settings) -> Self {
        let inner = Inner {
            registry: NodeRegistry::new(settings.replication_factor),
            settings,
            tracelog: VectorLog::new("frontend"),
            credential_backup: Mutex::new(Snapshot::default()),
        };

        Self(Arc::new(inner))
    }

    pub fn registry(&self) -> &NodeRegistry {
        &self.0.registry
    }

    pub fn credential_backup(&self) -> Snapshot {
        self.0
            .credential_backup
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn describe(&self) -> String {
        format!(
            "{} | credential backup: {} entries",
            self.0.registry.describe(),
            self.credential_backup().entries()
        )
    }

    /// Starts the failover monitor and the state dump.
    pub fn spawn_background(&self) -> Vec<JoinHandle<()>> {
        let monitor = FailoverMonitor::new(self.0.registry.clone())
            .with_threshold(self.0.settings.liveness_threshold);
        let server = self.clone();
        let watch = tokio::spawn(monitor.run(move |eviction| {
            if let Some(promoted) = eviction.promoted.clone().filter(|node| node.role == Role::Auth) {
                let server = server.clone();
                tokio::spawn(async move { server.restore_credentials(vec![promoted]).await });
            }
        }));

        let server = self.clone();
        let dump = heartbeat::spawn_state_dump(STATE_DUMP_INTERVAL, move || server.describe());

        vec![watch, dump]
    }

    /// Sends the credential backup to `targets`, skipping empty backups.
    async fn restore_credentials(&self, targets: Vec<NodeDescriptor>) -> usize {
        let backup = self.credential_backup();
        if backup.is_empty() || targets.is_empty() {
            return 0;
        }

        let deadline = self.0.settings.rpc_deadline;
        let pushes = targets.into_iter().map(|target| {
            let backup = backup.clone();
            async move {
                let node = transport::connect_node(&target.address).await?;
                let ack = node.auth_recovery(transport::context(deadline), backup).await?;
                debug!(role = %target.role, slot = target.slot_id, %ack, "credential backup delivered");
                Ok::<_, crate::error::ChainError>(())
            }
        });

        join_all(pushes)
            .await
            .into_iter()
            .filter(|pushed| match pushed {
                Ok(()) => true,
                Err(err) => {
                    warn!("credential backup not delivered: {}", err);
                    false
                }
            })
            .count()
    }

    /// Sends a reversed chain, or one that already carries a verdict, back to
    /// its origin.
    async fn relay(&self, mut chain: RpcChain) -> bool {
        self.0.tracelog.stamp(&mut chain, "relay");
        match chain.call_index(0, self.0.settings.hop_timeout).await {
            Ok(ack) => ack,
            Err(err) => {
                warn!(chain = %chain.id, "relay to origin failed: {}", err);
                false
            }
        }
    }

    async fn admit(&self, mut chain: RpcChain, entry: EntryPoint) -> bool {
        let op = entry.operation();
        let args = match chain.operation() {
            Ok(args) => args.clone(),
            Err(err) => {
                warn!(chain = %chain.id, "malformed chain: {}", err);
                return false;
            }
        };

        let route = match composer::route(&self.0.registry, op, &args) {
            Ok(route) => route,
            Err(err) => {
                warn!(chain = %chain.id, "system chain disrupted: {}", err);
                return false;
            }
        };

        composer::extend_at_frontend(&mut chain, route, op);
        self.0.tracelog.stamp(&mut chain, &entry.to_string());

        match chain.call_next(self.0.settings.hop_timeout).await {
            Ok(ack) => ack,
            Err(err) => {
                warn!(chain = %chain.id, "forwarding to metadata failed: {}", err);
                false
            }
        }
    }
}

impl Node for FrontendServer {
    #[instrument(skip(self, chain), fields(chain = %chain.id))]
    async fn invoke(self, _: Context, chain: RpcChain) -> bool {
        let Some(entry) = chain.current_hop().map(|hop| hop.entry_point) else {
            return false;
        };
        info!("Node::FrontendServer::invoke(entry={}, direction={:?})", entry, chain.direction);
        self.0.tracelog.observe(&chain, &entry.to_string());

        if !matches!(entry, EntryPoint::FStore | EntryPoint::FRetrieve | EntryPoint::FList) {
            warn!("{}: {}", UNSUPPORTED_REPLY, entry);
            return false;
        }

        let settled = chain
            .operation()
            .map(|args| args.status != StatusCode::Incomplete)
            .unwrap_or(false);

        if chain.is_return() || settled {
            self.relay(chain).await
        } else {
            self.admit(chain, entry).await
        }
    }

    async fn store_validation(self, _: Context, _file_name: String) -> String {
        UNSUPPORTED_REPLY.to_string()
    }

    async fn update_consistency(self, _: Context, _snapshot: Snapshot) -> String {
        UNSUPPORTED_REPLY.to_string()
    }

    async fn auth_recovery(self, _: Context, _snapshot: Snapshot) -> String {
        UNSUPPORTED_REPLY.to_string()
    }
}

impl Membership for FrontendServer {
    #[instrument(skip(self))]
    async fn join(self, _: Context, role: Role, address: String) -> Option<SlotId> {
        info!("Membership::FrontendServer::join(role={}, address={})", role, address);
        self.0.registry.join(role).ok()
    }

    #[instrument(skip(self, report), fields(role = %report.descriptor.role, slot = report.descriptor.slot_id))]
    async fn report_server_activity(self, _: Context, report: ActivityReport) -> String {
        let ActivityReport { descriptor, snapshot } = report;
        let role = descriptor.role;

        let outcome = match self.0.registry.report(descriptor.clone(), Instant::now()) {
            Ok(outcome) => outcome,
            Err(err) => return err.to_string(),
        };

        if outcome.placement == Placement::Activated && role == Role::Auth {
            self.restore_credentials(vec![descriptor]).await;
        }

        if !outcome.replica_targets.is_empty() && !snapshot.is_empty() {
            let acked = replica::push_snapshot(
                role,
                &outcome.replica_targets,
                &snapshot,
                self.0.settings.rpc_deadline,
            )
            .await;
            debug!(acked, "replicated primary snapshot");
        }

        format!("{:?}", outcome.placement)
    }

    #[instrument(skip(self, snapshot), fields(entries = snapshot.entries()))]
    async fn auth_recovery(self, _: Context, snapshot: Snapshot) -> String {
        if snapshot.is_empty() {
            return "Empty auth backup ignored".to_string();
        }

        *self
            .0
            .credential_backup
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = snapshot;

        let delivered = self
            .restore_credentials(self.0.registry.active(Role::StorageA))
            .await;
        debug!(delivered, "forwarded credential backup to storage A");

        "Auth backup stored".to_string()
    }
}
