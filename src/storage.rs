//! A file storage server. Variant A keeps protected files, variant B the rest.

use std::{
    collections::BTreeMap,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
    time::Duration,
};

use tarpc::context::Context;
use tracing::{debug, info, instrument, warn};

use crate::{
    chain::{EntryPoint, Operation, Role, RpcChain, StatusCode, StorageVariant},
    composer,
    config::{Settings, LIST_SEPARATOR, UNSUPPORTED_REPLY},
    error::{ChainError, Result},
    heartbeat::Reporter,
    registry::NodeDescriptor,
    replica::Snapshot,
    tracelog::VectorLog,
    transport, Node,
};

#[derive(Clone, Debug)]
pub struct StorageServer(Arc<Inner>);

#[derive(Debug)]
struct Inner {
    variant: StorageVariant,
    descriptor: NodeDescriptor,
    settings: Settings,
    tracelog: VectorLog,
    state: Mutex<State>,
}

#[derive(Debug, Default)]
struct State {
    files: BTreeMap<String, String>,
    /// Off-site copy of the auth credentials. Only variant A holds one.
    credential_backup: Snapshot,
}

impl StorageServer {
    pub fn new(variant: StorageVariant, descriptor: NodeDescriptor, settings: Settings) -> Self {
        let tracelog = VectorLog::new(format!("storage-{:?}-{}", variant, descriptor.slot_id).to_lowercase());
        Self(Arc::new(Inner {
            variant,
            descriptor,
            settings,
            tracelog,
            state: Mutex::new(State::default()),
        }))
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.0.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn variant(&self) -> StorageVariant {
        self.0.variant
    }

    pub fn read(&self, file_name: &str) -> Option<String> {
        self.state().files.get(file_name).cloned()
    }

    pub fn credential_backup(&self) -> Snapshot {
        self.state().credential_backup.clone()
    }

    pub fn describe(&self) -> String {
        let state = self.state();
        format!(
            "{}: files={:?} credential backup={}",
            self.0.variant.role(),
            state.files.keys().collect::<Vec<_>>(),
            state.credential_backup.entries()
        )
    }

    fn owns(&self, entry: EntryPoint) -> bool {
        Operation::Store.storage_entry(self.0.variant) == entry
            || Operation::Retrieve.storage_entry(self.0.variant) == entry
            || Operation::List.storage_entry(self.0.variant) == entry
    }

    async fn handle(&self, chain: &mut RpcChain, entry: EntryPoint) -> Result<bool> {
        let timeout = self.0.settings.hop_timeout;

        match entry.operation() {
            Operation::Store => {
                let args = chain.operation()?.clone();
                let validated = self.validate(chain, &args.file_name).await;
                match validated {
                    Ok(()) => {
                        self.state().files.insert(args.file_name.clone(), args.content);
                        info!(file = %args.file_name, "committed");
                        chain.operation_mut()?.status = StatusCode::Success;
                    }
                    Err(err) => warn!(file = %args.file_name, "store not validated: {}", err),
                }
            }
            Operation::Retrieve => {
                let args = chain.operation_mut()?;
                args.content = self.read(&args.file_name).unwrap_or_default();
                args.status = StatusCode::Success;
            }
            Operation::List => {
                let names = self.state().files.keys().cloned().collect::<Vec<_>>().join(LIST_SEPARATOR);
                let args = chain.operation_mut()?;
                append_names(&mut args.file_name, &names);

                let next = chain.next_index()?;
                let visits_storage = chain.hops[next].entry_point.is_storage_list();
                if visits_storage && !chain.is_return() {
                    self.0.tracelog.stamp(chain, &entry.to_string());
                    return chain.call_next(timeout).await;
                }
                chain.operation_mut()?.status = StatusCode::Success;
            }
        }

        self.0.tracelog.stamp(chain, &entry.to_string());
        composer::return_to_origin(chain, timeout).await
    }

    /// Promotes the pending entries upstream: metadata always, auth for
    /// protected files.
    async fn validate(&self, chain: &RpcChain, file_name: &str) -> Result<()> {
        let deadline = self.0.settings.rpc_deadline;

        let metadata = chain.find_hop(Role::Metadata).ok_or(ChainError::MissingHop(Role::Metadata))?;
        let ack = validate_at(&metadata.address, file_name, deadline).await?;
        debug!(%ack, "metadata validation");

        if self.0.variant == StorageVariant::A {
            let auth = chain.find_hop(Role::Auth).ok_or(ChainError::MissingHop(Role::Auth))?;
            let ack = validate_at(&auth.address, file_name, deadline).await?;
            debug!(%ack, "auth validation");
        }

        Ok(())
    }
}

async fn validate_at(address: &str, file_name: &str, deadline: Duration) -> Result<String> {
    let node = transport::connect_node(address).await?;
    Ok(node
        .store_validation(transport::context(deadline), file_name.to_string())
        .await?)
}

/// Joins `names` onto an accumulated list.
fn append_names(accumulated: &mut String, names: &str) {
    if names.is_empty() {
        return;
    }
    if !accumulated.is_empty() {
        accumulated.push_str(LIST_SEPARATOR);
    }
    accumulated.push_str(names);
}

impl Reporter for StorageServer {
    fn descriptor(&self) -> NodeDescriptor {
        self.0.descriptor.clone()
    }

    fn snapshot(&self) -> Snapshot {
        Snapshot::new(vec![self.state().files.clone()])
    }
}

impl Node for StorageServer {
    #[instrument(skip(self, chain), fields(chain = %chain.id, variant = ?self.0.variant))]
    async fn invoke(self, _: Context, mut chain: RpcChain) -> bool {
        let Some(entry) = chain.current_hop().map(|hop| hop.entry_point) else {
            return false;
        };
        info!("Node::StorageServer::invoke(entry={})", entry);
        self.0.tracelog.observe(&chain, &entry.to_string());

        if !self.owns(entry) {
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

    async fn store_validation(self, _: Context, _file_name: String) -> String {
        UNSUPPORTED_REPLY.to_string()
    }

    #[instrument(skip(self, snapshot), fields(entries = snapshot.entries()))]
    async fn update_consistency(self, _: Context, snapshot: Snapshot) -> String {
        let Ok([files]) = <[_; 1]>::try_from(snapshot.maps) else {
            return "Malformed storage snapshot".to_string();
        };

        self.state().files = files;
        debug!("replica state replaced");
        "Storage replica updated".to_string()
    }

    #[instrument(skip(self, snapshot), fields(entries = snapshot.entries()))]
    async fn auth_recovery(self, _: Context, snapshot: Snapshot) -> String {
        if self.0.variant != StorageVariant::A {
            return UNSUPPORTED_REPLY.to_string();
        }
        self.state().credential_backup = snapshot;
        "Auth backup stored".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn server(variant: StorageVariant) -> StorageServer {
        StorageServer::new(
            variant,
            NodeDescriptor::new(0, variant.role(), "127.0.0.1:0"),
            Settings::default(),
        )
    }

    #[test]
    fn names_accumulate_with_separator() {
        let mut list = String::new();
        append_names(&mut list, "");
        assert_eq!(list, "");
        append_names(&mut list, "x.txt");
        append_names(&mut list, "");
        append_names(&mut list, "y.txt,z.txt");
        assert_eq!(list, "x.txt,y.txt,z.txt");
    }

    #[test]
    fn variants_own_their_entry_points() {
        let a = server(StorageVariant::A);
        assert!(a.owns(EntryPoint::FaStore));
        assert!(a.owns(EntryPoint::FaList));
        assert!(!a.owns(EntryPoint::FbRetrieve));
        assert!(!a.owns(EntryPoint::MdStore));
    }

    #[tokio::test]
    async fn only_variant_a_keeps_credential_backups() {
        let mut credentials = BTreeMap::new();
        credentials.insert("a.txt".to_string(), "s".to_string());
        let backup = Snapshot::new(vec![credentials]);

        let a = server(StorageVariant::A);
        let ack = a.clone().auth_recovery(tarpc::context::current(), backup.clone()).await;
        assert_eq!(ack, "Auth backup stored");
        assert_eq!(a.credential_backup(), backup);

        let b = server(StorageVariant::B);
        let ack = b.clone().auth_recovery(tarpc::context::current(), backup).await;
        assert_eq!(ack, UNSUPPORTED_REPLY);
        assert!(b.credential_backup().is_empty());
    }

    #[tokio::test]
    async fn replica_apply_replaces_files() {
        let b = server(StorageVariant::B);
        b.state().files.insert("stale.txt".into(), "old".into());

        let mut files = BTreeMap::new();
        files.insert("y.txt".to_string(), "fresh".to_string());
        b.clone()
            .update_consistency(tarpc::context::current(), Snapshot::new(vec![files]))
            .await;

        assert_eq!(b.read("y.txt").as_deref(), Some("fresh"));
        assert_eq!(b.read("stale.txt"), None);
    }
}
