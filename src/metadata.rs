//! The metadata server. Knows which storage class holds every file and
//! decides the downstream hops of each chain.

use std::{
    collections::BTreeMap,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
};

use tarpc::context::Context;
use tracing::{debug, info, instrument, warn};

use crate::{
    chain::{EntryPoint, Operation, RpcChain, StatusCode, StorageVariant},
    composer,
    config::{Settings, UNSUPPORTED_REPLY},
    error::Result,
    heartbeat::Reporter,
    registry::NodeDescriptor,
    replica::Snapshot,
    tracelog::VectorLog,
    Node,
};

#[derive(Clone, Debug)]
pub struct MetadataServer(Arc<Inner>);

#[derive(Debug)]
struct Inner {
    descriptor: NodeDescriptor,
    settings: Settings,
    tracelog: VectorLog,
    state: Mutex<State>,
}

/// File name to the service holding it, per storage class.
#[derive(Debug, Default)]
struct State {
    files_a: BTreeMap<String, String>,
    files_b: BTreeMap<String, String>,
    /// Stores that were routed but not yet confirmed by storage.
    pending: BTreeMap<String, StorageVariant>,
}

impl MetadataServer {
    pub fn new(descriptor: NodeDescriptor, settings: Settings) -> Self {
        let tracelog = VectorLog::new(format!("metadata-{}", descriptor.slot_id));
        Self(Arc::new(Inner {
            descriptor,
            settings,
            tracelog,
            state: Mutex::new(State::default()),
        }))
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.0.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Storage class currently recorded for `file_name`.
    pub fn lookup(&self, file_name: &str) -> Option<StorageVariant> {
        let state = self.state();
        if state.files_a.contains_key(file_name) {
            Some(StorageVariant::A)
        } else if state.files_b.contains_key(file_name) {
            Some(StorageVariant::B)
        } else {
            None
        }
    }

    pub fn describe(&self) -> String {
        let state = self.state();
        format!(
            "metadata {}: A={:?} B={:?} pending={:?}",
            self.0.descriptor.slot_id,
            state.files_a.keys().collect::<Vec<_>>(),
            state.files_b.keys().collect::<Vec<_>>(),
            state.pending
        )
    }

    async fn handle(&self, chain: &mut RpcChain, entry: EntryPoint) -> Result<bool> {
        let op = entry.operation();
        let args = chain.operation()?.clone();
        let timeout = self.0.settings.hop_timeout;

        let secure = match op {
            Operation::Store => {
                !args.secret.is_empty() || self.lookup(&args.file_name) == Some(StorageVariant::A)
            }
            Operation::Retrieve => !args.secret.is_empty(),
            Operation::List => false,
        };

        if op == Operation::Store {
            // a public name is recorded with the empty secret
            if !args.secret.is_empty() && self.lookup(&args.file_name) == Some(StorageVariant::B) {
                info!(file = %args.file_name, "secret store over a public file refused");
                chain.operation_mut()?.status = StatusCode::AuthInvalid;
                return composer::return_to_origin(chain, timeout).await;
            }
            if secure && chain.fanout()?.auth.is_none() {
                // status stays incomplete: no live auth node is an admission failure
                warn!(file = %args.file_name, "protected store without an auth node");
                return composer::return_to_origin(chain, timeout).await;
            }

            let variant = if secure { StorageVariant::A } else { StorageVariant::B };
            self.state().pending.insert(args.file_name.clone(), variant);
        }

        composer::splice_at_metadata(chain, op, secure)?;
        self.0.tracelog.stamp(chain, &entry.to_string());
        let forwarded = chain.call_next(timeout).await;
        if op == Operation::Store {
            // validated stores already left the pending map
            self.state().pending.remove(&args.file_name);
        }
        forwarded
    }

    /// Names routed to storage and still awaiting validation.
    pub fn pending(&self) -> Vec<String> {
        self.state().pending.keys().cloned().collect()
    }
}

impl Reporter for MetadataServer {
    fn descriptor(&self) -> NodeDescriptor {
        self.0.descriptor.clone()
    }

    fn snapshot(&self) -> Snapshot {
        let state = self.state();
        Snapshot::new(vec![state.files_a.clone(), state.files_b.clone()])
    }
}

impl Node for MetadataServer {
    #[instrument(skip(self, chain), fields(chain = %chain.id))]
    async fn invoke(self, _: Context, mut chain: RpcChain) -> bool {
        let Some(entry) = chain.current_hop().map(|hop| hop.entry_point) else {
            return false;
        };
        info!("Node::MetadataServer::invoke(entry={})", entry);
        self.0.tracelog.observe(&chain, &entry.to_string());

        if !matches!(entry, EntryPoint::MdStore | EntryPoint::MdRetrieve | EntryPoint::MdList) {
            warn!("{}: {}", UNSUPPORTED_REPLY, entry);
            return false;
        }

        match self.handle(&mut chain, entry).await {
            Ok(ack) => ack,
            Err(err) => {
                warn!("{} failed: {}", entry, err);
                false
            }
        }
    }

    #[instrument(skip(self))]
    async fn store_validation(self, _: Context, file_name: String) -> String {
        let mut guard = self.state();
        let state = &mut *guard;
        let Some(variant) = state.pending.remove(&file_name) else {
            return "Not in validation map METADATA".to_string();
        };

        let service = variant.role().service_name().to_string();
        let (into, other) = match variant {
            StorageVariant::A => (&mut state.files_a, &mut state.files_b),
            StorageVariant::B => (&mut state.files_b, &mut state.files_a),
        };
        other.remove(&file_name);
        into.insert(file_name, service);

        "Validated data in METADATA".to_string()
    }

    #[instrument(skip(self, snapshot), fields(entries = snapshot.entries()))]
    async fn update_consistency(self, _: Context, snapshot: Snapshot) -> String {
        let Ok([files_a, files_b]) = <[_; 2]>::try_from(snapshot.maps) else {
            return "Malformed metadata snapshot".to_string();
        };

        let mut state = self.state();
        state.files_a = files_a;
        state.files_b = files_b;
        debug!("replica state replaced");

        "Metadata replica updated".to_string()
    }

    async fn auth_recovery(self, _: Context, _snapshot: Snapshot) -> String {
        UNSUPPORTED_REPLY.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::Role;

    fn server() -> MetadataServer {
        MetadataServer::new(NodeDescriptor::new(0, Role::Metadata, "127.0.0.1:0"), Settings::default())
    }

    #[tokio::test]
    async fn validation_moves_names_between_classes() {
        let server = server();
        server.state().pending.insert("a.txt".into(), StorageVariant::B);
        let ack = server.clone().store_validation(tarpc::context::current(), "a.txt".into()).await;
        assert_eq!(ack, "Validated data in METADATA");
        assert_eq!(server.lookup("a.txt"), Some(StorageVariant::B));

        server.state().pending.insert("a.txt".into(), StorageVariant::A);
        server.clone().store_validation(tarpc::context::current(), "a.txt".into()).await;
        assert_eq!(server.lookup("a.txt"), Some(StorageVariant::A));
        assert_eq!(server.snapshot().maps[1].len(), 0);

        let ack = server.clone().store_validation(tarpc::context::current(), "a.txt".into()).await;
        assert_eq!(ack, "Not in validation map METADATA");
    }

    #[tokio::test]
    async fn replica_apply_requires_both_maps() {
        let server = server();
        let mut files = BTreeMap::new();
        files.insert("b.txt".to_string(), "FilestoreServiceB".to_string());

        let ack = server
            .clone()
            .update_consistency(tarpc::context::current(), Snapshot::new(vec![files.clone()]))
            .await;
        assert_eq!(ack, "Malformed metadata snapshot");
        assert_eq!(server.lookup("b.txt"), None);

        server
            .clone()
            .update_consistency(tarpc::context::current(), Snapshot::new(vec![BTreeMap::new(), files]))
            .await;
        assert_eq!(server.lookup("b.txt"), Some(StorageVariant::B));
    }
}
