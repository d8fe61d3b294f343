//! The remote-call chain engine.
//!
//! An [`RpcChain`] describes one client operation as an ordered list of
//! [`Hop`]s. The chain travels by value: every hop receives the whole chain,
//! may append hops or rewrite the shared [`OperationArgs`] carried by hop 0,
//! and then dispatches it onward with [`RpcChain::call_next`] or
//! [`RpcChain::call_index`].
//!
//! Exclusive access to a chain's mutable fields is enforced by `&mut self`
//! on every mutating method. The watchdog armed by `call_index` only holds a
//! snapshot of the chain, never the chain itself.

use std::{
    fmt,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, PoisonError, RwLock,
    },
    time::{Duration, SystemTime, UNIX_EPOCH},
};

use lazy_static::lazy_static;
use rand::Rng;
use serde::{Deserialize, Serialize};
use tokio::sync::oneshot;
use tracing::{debug, error, instrument, trace, warn};

use crate::{
    config::DEFAULT_RPC_DEADLINE,
    error::{ChainError, Result},
    registry::NodeDescriptor,
    transport,
};

/// The process roles that can appear in a chain.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Role {
    Client,
    Frontend,
    Metadata,
    Auth,
    StorageA,
    StorageB,
}

impl Role {
    /// Roles tracked by the node registry.
    pub const BACKENDS: [Role; 4] = [Role::Metadata, Role::Auth, Role::StorageA, Role::StorageB];

    pub fn service_name(self) -> &'static str {
        match self {
            Role::Client => "ClientService",
            Role::Frontend => "FrontEndService",
            Role::Metadata => "MetadataService",
            Role::Auth => "AuthService",
            Role::StorageA => "FilestoreServiceA",
            Role::StorageB => "FilestoreServiceB",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Role::Client => "ClientRole",
            Role::Frontend => "FrontendRole",
            Role::Metadata => "MetadataRole",
            Role::Auth => "AuthRole",
            Role::StorageA => "StorageRoleA",
            Role::StorageB => "StorageRoleB",
        };
        f.write_str(name)
    }
}

/// The three client-visible operations.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Operation {
    Store,
    Retrieve,
    List,
}

impl Operation {
    pub fn origin_entry(self) -> EntryPoint {
        match self {
            Operation::Store => EntryPoint::Store,
            Operation::Retrieve => EntryPoint::Retrieve,
            Operation::List => EntryPoint::List,
        }
    }

    pub fn frontend_entry(self) -> EntryPoint {
        match self {
            Operation::Store => EntryPoint::FStore,
            Operation::Retrieve => EntryPoint::FRetrieve,
            Operation::List => EntryPoint::FList,
        }
    }

    pub fn metadata_entry(self) -> EntryPoint {
        match self {
            Operation::Store => EntryPoint::MdStore,
            Operation::Retrieve => EntryPoint::MdRetrieve,
            Operation::List => EntryPoint::MdList,
        }
    }

    pub fn storage_entry(self, variant: StorageVariant) -> EntryPoint {
        match (variant, self) {
            (StorageVariant::A, Operation::Store) => EntryPoint::FaStore,
            (StorageVariant::A, Operation::Retrieve) => EntryPoint::FaRetrieve,
            (StorageVariant::A, Operation::List) => EntryPoint::FaList,
            (StorageVariant::B, Operation::Store) => EntryPoint::FbStore,
            (StorageVariant::B, Operation::Retrieve) => EntryPoint::FbRetrieve,
            (StorageVariant::B, Operation::List) => EntryPoint::FbList,
        }
    }
}

/// The two interchangeable storage backends.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum StorageVariant {
    /// Holds files stored with a secret.
    A,
    /// Holds files stored without one.
    B,
}

impl StorageVariant {
    pub fn role(self) -> Role {
        match self {
            StorageVariant::A => Role::StorageA,
            StorageVariant::B => Role::StorageB,
        }
    }
}

/// Remote entry points reachable through `Node::invoke`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EntryPoint {
    Store,
    Retrieve,
    List,
    FStore,
    FRetrieve,
    FList,
    MdStore,
    MdRetrieve,
    MdList,
    AStore,
    FaStore,
    FaRetrieve,
    FaList,
    FbStore,
    FbRetrieve,
    FbList,
}

impl EntryPoint {
    pub fn operation(self) -> Operation {
        use EntryPoint::*;
        match self {
            Store | FStore | MdStore | AStore | FaStore | FbStore => Operation::Store,
            Retrieve | FRetrieve | MdRetrieve | FaRetrieve | FbRetrieve => Operation::Retrieve,
            List | FList | MdList | FaList | FbList => Operation::List,
        }
    }

    pub fn is_storage_list(self) -> bool {
        matches!(self, EntryPoint::FaList | EntryPoint::FbList)
    }
}

impl fmt::Display for EntryPoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            EntryPoint::Store => "Store",
            EntryPoint::Retrieve => "Retrieve",
            EntryPoint::List => "List",
            EntryPoint::FStore => "FStore",
            EntryPoint::FRetrieve => "FRetrieve",
            EntryPoint::FList => "FList",
            EntryPoint::MdStore => "MDStore",
            EntryPoint::MdRetrieve => "MDRetrieve",
            EntryPoint::MdList => "MDList",
            EntryPoint::AStore => "AStore",
            EntryPoint::FaStore => "FAStore",
            EntryPoint::FaRetrieve => "FARetrieve",
            EntryPoint::FaList => "FAList",
            EntryPoint::FbStore => "FBStore",
            EntryPoint::FbRetrieve => "FBRetrieve",
            EntryPoint::FbList => "FBList",
        };
        f.write_str(name)
    }
}

/// Outcome reported back to the origin through the shared arguments.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum StatusCode {
    #[default]
    Incomplete,
    Success,
    AuthInvalid,
}

/// Arguments shared by every hop of an operation, carried by hop 0.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OperationArgs {
    pub file_name: String,
    pub content: String,
    pub secret: String,
    pub status: StatusCode,
}

impl OperationArgs {
    pub fn new(file_name: impl Into<String>, content: impl Into<String>, secret: impl Into<String>) -> Self {
        Self {
            file_name: file_name.into(),
            content: content.into(),
            secret: secret.into(),
            status: StatusCode::Incomplete,
        }
    }
}

/// Storage targets the frontend hands to metadata so it can extend the chain.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Fanout {
    pub auth: Option<NodeDescriptor>,
    pub storage_a: NodeDescriptor,
    pub storage_b: NodeDescriptor,
}

/// Private argument bundle of a hop.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Payload {
    Operation(OperationArgs),
    MetadataFanout(Fanout),
}

/// One remote-call target.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Hop {
    pub address: String,
    pub role: Role,
    pub entry_point: EntryPoint,
    pub payload: Option<Payload>,
}

impl fmt::Display for Hop {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}@{}", self.role, self.entry_point, self.address)
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum Outcome {
    #[default]
    Pending,
    Success,
    Failure,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum Direction {
    #[default]
    Forward,
    Return,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RpcChain {
    pub id: String,
    pub position: usize,
    pub hops: Vec<Hop>,
    pub outcome: Outcome,
    /// Opaque causal-trace bytes, see [`crate::tracelog`].
    pub log: Vec<u8>,
    pub direction: Direction,
}

pub type ErrorHandler = Arc<dyn Fn(&RpcChain, &str) + Send + Sync>;
pub type TimeoutHandler = Arc<dyn Fn(&RpcChain) + Send + Sync>;

#[derive(Default)]
struct Handlers {
    error: Option<ErrorHandler>,
    timeout: Option<TimeoutHandler>,
}

static LAST_ID: AtomicU64 = AtomicU64::new(0);

lazy_static! {
    static ref HANDLERS: RwLock<Handlers> = RwLock::new(Handlers::default());
}

/// Installs the process-wide error handler. Replaces any previous one.
pub fn register_error_handler<F>(handler: F)
where
    F: Fn(&RpcChain, &str) + Send + Sync + 'static,
{
    HANDLERS.write().unwrap_or_else(PoisonError::into_inner).error = Some(Arc::new(handler));
}

/// Installs the process-wide timeout handler. Replaces any previous one.
pub fn register_timeout_handler<F>(handler: F)
where
    F: Fn(&RpcChain) + Send + Sync + 'static,
{
    HANDLERS.write().unwrap_or_else(PoisonError::into_inner).timeout = Some(Arc::new(handler));
}

fn error_handler() -> Option<ErrorHandler> {
    HANDLERS.read().unwrap_or_else(PoisonError::into_inner).error.clone()
}

fn timeout_handler() -> Option<TimeoutHandler> {
    HANDLERS.read().unwrap_or_else(PoisonError::into_inner).timeout.clone()
}

fn generate_id() -> String {
    let counter = LAST_ID.fetch_add(1, Ordering::SeqCst) + 1;
    let unix = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or_default();
    let salt: u32 = rand::thread_rng().gen_range(0..10000);
    format!("{counter}-{unix}-{salt}")
}

impl Default for RpcChain {
    fn default() -> Self {
        Self::new()
    }
}

impl RpcChain {
    /// Allocates an empty forward chain with a fresh id.
    pub fn new() -> Self {
        Self {
            id: generate_id(),
            position: 0,
            hops: Vec::new(),
            outcome: Outcome::Pending,
            log: Vec::new(),
            direction: Direction::Forward,
        }
    }

    /// Appends a hop, or inserts it at `index` shifting later hops right.
    /// An index past the end appends.
    pub fn add_hop(
        &mut self,
        address: impl Into<String>,
        role: Role,
        entry_point: EntryPoint,
        payload: Option<Payload>,
        index: Option<usize>,
    ) {
        let hop = Hop {
            address: address.into(),
            role,
            entry_point,
            payload,
        };

        match index {
            Some(index) if index < self.hops.len() => self.hops.insert(index, hop),
            _ => self.hops.push(hop),
        }
    }

    pub fn attach_log(&mut self, log: Vec<u8>) {
        self.log = log;
    }

    pub fn change_direction(&mut self) {
        self.direction = Direction::Return;
    }

    pub fn is_return(&self) -> bool {
        self.direction == Direction::Return
    }

    pub fn len(&self) -> usize {
        self.hops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.hops.is_empty()
    }

    pub fn first_hop(&self) -> Option<&Hop> {
        self.hops.first()
    }

    pub fn current_hop(&self) -> Option<&Hop> {
        self.hops.get(self.position)
    }

    pub fn last_hop(&self) -> Option<&Hop> {
        self.hops.last()
    }

    /// First hop played by `role`.
    pub fn find_hop(&self, role: Role) -> Option<&Hop> {
        self.hops.iter().find(|hop| hop.role == role)
    }

    /// Index of the first hop played by `role`.
    pub fn position_of(&self, role: Role) -> Option<usize> {
        self.hops.iter().position(|hop| hop.role == role)
    }

    /// `(position + 1) mod len`. Wraps a linear pipeline back to the origin.
    pub fn next_index(&self) -> Result<usize> {
        if self.hops.is_empty() {
            return Err(ChainError::EmptyChain);
        }
        Ok((self.position + 1) % self.hops.len())
    }

    /// The shared operation arguments carried by hop 0.
    pub fn operation(&self) -> Result<&OperationArgs> {
        match self.hops.first().map(|hop| &hop.payload) {
            Some(Some(Payload::Operation(args))) => Ok(args),
            Some(_) => Err(ChainError::PayloadMismatch {
                index: 0,
                expected: "operation",
            }),
            None => Err(ChainError::EmptyChain),
        }
    }

    pub fn operation_mut(&mut self) -> Result<&mut OperationArgs> {
        match self.hops.first_mut().map(|hop| &mut hop.payload) {
            Some(Some(Payload::Operation(args))) => Ok(args),
            Some(_) => Err(ChainError::PayloadMismatch {
                index: 0,
                expected: "operation",
            }),
            None => Err(ChainError::EmptyChain),
        }
    }

    /// The fanout payload attached to the current hop.
    pub fn fanout(&self) -> Result<&Fanout> {
        match self.current_hop().map(|hop| &hop.payload) {
            Some(Some(Payload::MetadataFanout(fanout))) => Ok(fanout),
            Some(_) => Err(ChainError::PayloadMismatch {
                index: self.position,
                expected: "metadata fanout",
            }),
            None => Err(ChainError::IndexOutOfRange {
                index: self.position,
                len: self.hops.len(),
            }),
        }
    }

    pub async fn call_next(&mut self, timeout: Duration) -> Result<bool> {
        let next = self.next_index()?;
        self.call_index(next, timeout).await
    }

    /// Moves to `index` and remote-invokes that hop with the whole chain.
    ///
    /// `Ok(false)` is a protocol rejection by the remote hop. A transport
    /// failure is passed to the registered error handler and returned; with no
    /// handler registered it terminates the process.
    #[instrument(skip(self), fields(chain = %self.id))]
    pub async fn call_index(&mut self, index: usize, timeout: Duration) -> Result<bool> {
        let Some(hop) = self.hops.get(index) else {
            return Err(ChainError::IndexOutOfRange {
                index,
                len: self.hops.len(),
            });
        };
        let address = hop.address.clone();
        trace!(%hop, direction = ?self.direction, "dispatching hop {}", index);

        self.position = index;
        let done = self.arm_watchdog(timeout);
        let reply = self.dispatch(&address, timeout).await;
        let _ = done.send(());

        match reply {
            Ok(true) => {
                self.outcome = Outcome::Success;
                Ok(true)
            }
            Ok(false) => {
                self.outcome = Outcome::Failure;
                self.reject("remote server returned failure");
                Ok(false)
            }
            Err(err) => {
                self.outcome = Outcome::Failure;
                self.fail(&err.to_string());
                Err(err)
            }
        }
    }

    async fn dispatch(&self, address: &str, timeout: Duration) -> Result<bool> {
        let node = transport::connect_node(address).await?;
        let ctx = transport::context(DEFAULT_RPC_DEADLINE.max(timeout));
        let ack = node.invoke(ctx, self.clone()).await?;
        Ok(ack)
    }

    /// Spawns the advisory watchdog. It fires the timeout handler iff the
    /// returned sender is still alive after `timeout`.
    fn arm_watchdog(&self, timeout: Duration) -> oneshot::Sender<()> {
        let (done, finished) = oneshot::channel::<()>();
        let snapshot = self.clone();

        tokio::spawn(async move {
            if tokio::time::timeout(timeout, finished).await.is_ok() {
                return;
            }
            match timeout_handler() {
                Some(handler) => handler(&snapshot),
                None => warn!(chain = %snapshot.id, position = snapshot.position, "timeout on chain"),
            }
        });

        done
    }

    fn reject(&self, reason: &str) {
        match error_handler() {
            Some(handler) => handler(self, reason),
            None => debug!(chain = %self.id, "{}", reason),
        }
    }

    fn fail(&self, reason: &str) {
        match error_handler() {
            Some(handler) => handler(self, reason),
            None => {
                error!(chain = %self.id, "Error: {}", reason);
                std::process::exit(1);
            }
        }
    }
}

impl fmt::Display for RpcChain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "chain {} [", self.id)?;
        for (index, hop) in self.hops.iter().enumerate() {
            if index > 0 {
                f.write_str(" -> ")?;
            }
            if index == self.position {
                write!(f, "*{hop}")?;
            } else {
                write!(f, "{hop}")?;
            }
        }
        write!(f, "] {:?} {:?}", self.outcome, self.direction)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pipeline(len: usize) -> RpcChain {
        let mut chain = RpcChain::new();
        chain.add_hop(
            "127.0.0.1:1",
            Role::Client,
            EntryPoint::Store,
            Some(Payload::Operation(OperationArgs::new("a.txt", "hi", ""))),
            None,
        );
        for i in 1..len {
            chain.add_hop(format!("127.0.0.1:{}", i + 1), Role::Frontend, EntryPoint::FStore, None, None);
        }
        chain
    }

    #[test]
    fn new_chain_is_pending_and_forward() {
        let chain = RpcChain::new();
        assert!(chain.is_empty());
        assert_eq!(chain.position, 0);
        assert_eq!(chain.outcome, Outcome::Pending);
        assert_eq!(chain.direction, Direction::Forward);
        assert!(matches!(chain.next_index(), Err(ChainError::EmptyChain)));
    }

    #[test]
    fn chain_ids_are_distinct() {
        let ids: std::collections::HashSet<_> = (0..1000).map(|_| RpcChain::new().id).collect();
        assert_eq!(ids.len(), 1000);
    }

    #[test]
    fn add_hop_inserts_at_index() {
        let mut chain = pipeline(2);
        chain.add_hop("md", Role::Metadata, EntryPoint::MdStore, None, None);
        chain.add_hop("b", Role::StorageB, EntryPoint::FbStore, None, None);
        chain.add_hop("auth", Role::Auth, EntryPoint::AStore, None, Some(3));

        let roles: Vec<_> = chain.hops.iter().map(|hop| hop.role).collect();
        assert_eq!(
            roles,
            vec![Role::Client, Role::Frontend, Role::Metadata, Role::Auth, Role::StorageB]
        );

        // past the end appends
        chain.add_hop("a", Role::StorageA, EntryPoint::FaStore, None, Some(42));
        assert_eq!(chain.last_hop().map(|hop| hop.role), Some(Role::StorageA));
    }

    #[test]
    fn next_index_wraps_to_origin() {
        let mut chain = pipeline(4);
        let mut visited = Vec::new();
        for _ in 0..4 {
            let next = chain.next_index().unwrap();
            chain.position = next;
            visited.push(next);
        }
        assert_eq!(visited, vec![1, 2, 3, 0]);
    }

    #[test]
    fn accessors_find_hops() {
        let mut chain = pipeline(2);
        chain.add_hop("md", Role::Metadata, EntryPoint::MdStore, None, None);
        chain.position = 1;

        assert_eq!(chain.first_hop().map(|hop| hop.role), Some(Role::Client));
        assert_eq!(chain.current_hop().map(|hop| hop.role), Some(Role::Frontend));
        assert_eq!(chain.last_hop().map(|hop| hop.role), Some(Role::Metadata));
        assert_eq!(chain.find_hop(Role::Metadata).map(|hop| hop.address.as_str()), Some("md"));
        assert_eq!(chain.position_of(Role::Metadata), Some(2));
        assert!(chain.find_hop(Role::Auth).is_none());
    }

    #[test]
    fn payload_variants_are_typed() {
        let mut chain = pipeline(2);
        assert_eq!(chain.operation().unwrap().file_name, "a.txt");

        chain.operation_mut().unwrap().status = StatusCode::Success;
        assert_eq!(chain.operation().unwrap().status, StatusCode::Success);

        chain.position = 1;
        assert!(matches!(
            chain.fanout(),
            Err(ChainError::PayloadMismatch { index: 1, .. })
        ));
    }

    #[tokio::test]
    async fn call_index_rejects_out_of_range() {
        let mut chain = pipeline(2);
        let err = chain.call_index(5, Duration::from_millis(10)).await.unwrap_err();
        assert!(matches!(err, ChainError::IndexOutOfRange { index: 5, len: 2 }));
        assert_eq!(chain.position, 0);
        assert_eq!(chain.outcome, Outcome::Pending);
    }

    #[test]
    fn entry_points_map_back_to_operations() {
        for op in [Operation::Store, Operation::Retrieve, Operation::List] {
            assert_eq!(op.origin_entry().operation(), op);
            assert_eq!(op.frontend_entry().operation(), op);
            assert_eq!(op.metadata_entry().operation(), op);
            assert_eq!(op.storage_entry(StorageVariant::A).operation(), op);
            assert_eq!(op.storage_entry(StorageVariant::B).operation(), op);
        }
        assert_eq!(EntryPoint::MdStore.to_string(), "MDStore");
    }
}
