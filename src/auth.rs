//! The auth server: guards overwrites of protected files.

use std::{
    collections::BTreeMap,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
};

use tarpc::context::Context;
use tracing::{debug, info, instrument, warn};

use crate::{
    chain::{EntryPoint, RpcChain, StatusCode},
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
pub struct AuthServer(Arc<Inner>);

#[derive(Debug)]
struct Inner {
    descriptor: NodeDescriptor,
    settings: Settings,
    tracelog: VectorLog,
    state: Mutex<State>,
}

#[derive(Debug, Default)]
struct State {
    /// File name to the secret it was stored with.
    credentials: BTreeMap<String, String>,
    pending: BTreeMap<String, String>,
}

/// What to do with an incoming store.
#[derive(Debug, PartialEq, Eq)]
enum Verdict {
    Accept,
    /// The recorded secret differs.
    Mismatch,
    /// Another store of the same name is in flight.
    Pending,
}

impl AuthServer {
    pub fn new(descriptor: NodeDescriptor, settings: Settings) -> Self {
        let tracelog = VectorLog::new(format!("auth-{}", descriptor.slot_id));
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

    pub fn credentials(&self) -> BTreeMap<String, String> {
        self.state().credentials.clone()
    }

    /// Names with a store in flight.
    pub fn pending(&self) -> Vec<String> {
        self.state().pending.keys().cloned().collect()
    }

    pub fn describe(&self) -> String {
        let state = self.state();
        format!(
            "auth {}: files={:?} pending={:?}",
            self.0.descriptor.slot_id,
            state.credentials.keys().collect::<Vec<_>>(),
            state.pending.keys().collect::<Vec<_>>()
        )
    }

    /// Checks `secret` for `file_name` and, if accepted, marks the name pending.
    fn check(&self, file_name: &str, secret: &str) -> Verdict {
        let mut state = self.state();
        if state.pending.contains_key(file_name) {
            return Verdict::Pending;
        }
        match state.credentials.get(file_name) {
            Some(recorded) if recorded != secret => Verdict::Mismatch,
            _ => {
                state.pending.insert(file_name.to_string(), secret.to_string());
                Verdict::Accept
            }
        }
    }

    async fn handle(&self, chain: &mut RpcChain) -> Result<bool> {
        let args = chain.operation()?.clone();
        let timeout = self.0.settings.hop_timeout;

        match self.check(&args.file_name, &args.secret) {
            Verdict::Accept => {
                self.0.tracelog.stamp(chain, "AStore");
                let forwarded = chain.call_next(timeout).await;
                // a validated store has already moved the name to credentials
                if self.state().pending.remove(&args.file_name).is_some() {
                    debug!(file = %args.file_name, "store never validated; name released");
                }
                forwarded
            }
            verdict => {
                info!(file = %args.file_name, ?verdict, "store refused");
                chain.operation_mut()?.status = StatusCode::AuthInvalid;
                self.0.tracelog.stamp(chain, "AStore refused");
                composer::return_to_origin(chain, timeout).await
            }
        }
    }
}

impl Reporter for AuthServer {
    fn descriptor(&self) -> NodeDescriptor {
        self.0.descriptor.clone()
    }

    fn snapshot(&self) -> Snapshot {
        Snapshot::new(vec![self.credentials()])
    }

    fn credential_backup(&self) -> Option<Snapshot> {
        Some(self.snapshot())
    }
}

impl Node for AuthServer {
    #[instrument(skip(self, chain), fields(chain = %chain.id))]
    async fn invoke(self, _: Context, mut chain: RpcChain) -> bool {
        let Some(entry) = chain.current_hop().map(|hop| hop.entry_point) else {
            return false;
        };
        info!("Node::AuthServer::invoke(entry={})", entry);
        self.0.tracelog.observe(&chain, &entry.to_string());

        if entry != EntryPoint::AStore {
            warn!("{}: {}", UNSUPPORTED_REPLY, entry);
            return false;
        }

        match self.handle(&mut chain).await {
            Ok(ack) => ack,
            Err(err) => {
                warn!("{} failed: {}", entry, err);
                false
            }
        }
    }

    #[instrument(skip(self))]
    async fn store_validation(self, _: Context, file_name: String) -> String {
        let mut state = self.state();
        match state.pending.remove(&file_name) {
            Some(secret) => {
                state.credentials.insert(file_name, secret);
                "Moved to storage map AUTH".to_string()
            }
            None => "Not in validation map AUTH".to_string(),
        }
    }

    #[instrument(skip(self, snapshot), fields(entries = snapshot.entries()))]
    async fn update_consistency(self, _: Context, snapshot: Snapshot) -> String {
        let Ok([credentials]) = <[_; 1]>::try_from(snapshot.maps) else {
            return "Malformed auth snapshot".to_string();
        };

        self.state().credentials = credentials;
        debug!("replica state replaced");
        "Auth replica updated".to_string()
    }

    /// Adopts a recovered credential map, but only into an empty one.
    #[instrument(skip(self, snapshot), fields(entries = snapshot.entries()))]
    async fn auth_recovery(self, _: Context, snapshot: Snapshot) -> String {
        let mut state = self.state();
        if !state.credentials.is_empty() {
            return "Auth data kept".to_string();
        }
        if let Some(credentials) = snapshot.maps.into_iter().next() {
            info!(entries = credentials.len(), "recovered credentials");
            state.credentials = credentials;
        }
        "Auth data stored".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::Role;

    fn server() -> AuthServer {
        AuthServer::new(NodeDescriptor::new(0, Role::Auth, "127.0.0.1:0"), Settings::default())
    }

    #[tokio::test]
    async fn second_writer_loses_while_pending() {
        let server = server();
        assert_eq!(server.check("a.txt", "s"), Verdict::Accept);
        assert_eq!(server.check("a.txt", "s"), Verdict::Pending);

        server.clone().store_validation(tarpc::context::current(), "a.txt".into()).await;
        assert_eq!(server.credentials().get("a.txt").map(String::as_str), Some("s"));

        assert_eq!(server.check("a.txt", "other"), Verdict::Mismatch);
        assert_eq!(server.check("a.txt", "s"), Verdict::Accept);
    }

    #[tokio::test]
    async fn recovery_only_fills_an_empty_map() {
        let server = server();
        let mut recovered = BTreeMap::new();
        recovered.insert("a.txt".to_string(), "s".to_string());

        let ack = server
            .clone()
            .auth_recovery(tarpc::context::current(), Snapshot::new(vec![recovered]))
            .await;
        assert_eq!(ack, "Auth data stored");
        assert_eq!(server.credentials().len(), 1);

        let mut newer = BTreeMap::new();
        newer.insert("b.txt".to_string(), "t".to_string());
        let ack = server
            .clone()
            .auth_recovery(tarpc::context::current(), Snapshot::new(vec![newer]))
            .await;
        assert_eq!(ack, "Auth data kept");
        assert!(server.credentials().contains_key("a.txt"));
        assert!(!server.credentials().contains_key("b.txt"));
    }
}
