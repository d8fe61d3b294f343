//! A replicated file store whose operations travel as chains of remote calls.
//!
//! A client operation (store, retrieve, list) becomes an [`chain::RpcChain`]:
//! an ordered list of hops that is passed by value from process to process.
//! The frontend admits the operation and picks one live node per role from its
//! [`registry::NodeRegistry`]; metadata then splices in the auth and storage
//! hops the operation needs, and the last hop calls back toward the client.
//!
//! ## Services
//!
//! - `Node`: served by every chain participant. `invoke` runs the hop the
//!    chain currently points at.
//! - `Membership`: served by the frontend. Backends join, heartbeat, and
//!    send credential backups through it.

use chain::{RpcChain, Role};
use registry::{ActivityReport, SlotId};
use replica::Snapshot;

pub mod auth;
pub mod chain;
pub mod client;
pub mod composer;
pub mod config;
pub mod error;
pub mod frontend;
pub mod heartbeat;
pub mod metadata;
pub mod monitor;
pub mod registry;
pub mod replica;
pub mod storage;
pub mod tracelog;
pub mod transport;

/// The `Node` trait is the RPC interface every chain participant serves.
#[tarpc::service]
pub trait Node {
	/// Runs the hop at `chain.position`.
	///
	/// # Returns
	/// `bool` - `false` if this hop rejected the chain.
	async fn invoke(chain: RpcChain) -> bool;

	/// Promotes a pending entry for `file_name` into the authoritative map.
	async fn store_validation(file_name: String) -> String;

	/// Replaces this replica's maps with a snapshot taken on the primary.
	async fn update_consistency(snapshot: Snapshot) -> String;

	/// Hands a node a backup of the credential map.
	async fn auth_recovery(snapshot: Snapshot) -> String;
}

/// The `Membership` trait defines the RPC interface backends use to talk to
/// the frontend's registry.
#[tarpc::service]
pub trait Membership {
	/// Reserves a fresh slot id for `role`.
	///
	/// # Returns
	/// `Option<SlotId>` - `None` if `role` cannot register.
	async fn join(role: Role, address: String) -> Option<SlotId>;

	/// Heartbeat. Upserts the reporter and, from a primary, replicates its
	/// snapshot to the secondaries.
	async fn report_server_activity(report: ActivityReport) -> String;

	/// Stores the latest credential backup sent by auth.
	async fn auth_recovery(snapshot: Snapshot) -> String;
}
