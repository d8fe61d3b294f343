//! Turns operation requests into concrete chains.
//!
//! The composer is split along the places where hops are decided:
//!
//! 1. the client builds the origin chain `[client, frontend]`,
//! 2. the frontend admits the operation and appends metadata, handing it the
//!    storage targets as a [`Fanout`],
//! 3. metadata splices the auth and storage hops right after itself.

use std::time::Duration;

use tracing::debug;

use crate::{
    chain::{EntryPoint, Fanout, Operation, OperationArgs, Payload, Role, RpcChain, StorageVariant},
    error::{ChainError, RegistryError, Result},
    registry::{NodeDescriptor, NodeRegistry},
};

/// Nodes picked by the frontend for one operation.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Route {
    pub metadata: NodeDescriptor,
    pub fanout: Fanout,
}

/// Admission check. Every operation needs metadata and both storage roles;
/// a store carrying a secret also needs auth.
pub fn route(registry: &NodeRegistry, op: Operation, args: &OperationArgs) -> std::result::Result<Route, RegistryError> {
    let metadata = registry.primary(Role::Metadata)?;
    let storage_a = registry.primary(Role::StorageA)?;
    let storage_b = registry.primary(Role::StorageB)?;

    let auth = match registry.primary(Role::Auth) {
        Ok(auth) => Some(auth),
        Err(err) if op == Operation::Store && !args.secret.is_empty() => return Err(err),
        Err(_) => None,
    };

    Ok(Route {
        metadata,
        fanout: Fanout {
            auth,
            storage_a,
            storage_b,
        },
    })
}

/// `[client, frontend]`, with the shared arguments on hop 0.
pub fn origin_chain(origin: &str, frontend: &str, op: Operation, args: OperationArgs) -> RpcChain {
    let mut chain = RpcChain::new();
    chain.add_hop(origin, Role::Client, op.origin_entry(), Some(Payload::Operation(args)), None);
    chain.add_hop(frontend, Role::Frontend, op.frontend_entry(), None, None);
    chain
}

/// Appends the metadata hop chosen by the frontend.
pub fn extend_at_frontend(chain: &mut RpcChain, route: Route, op: Operation) {
    chain.add_hop(
        route.metadata.address,
        Role::Metadata,
        op.metadata_entry(),
        Some(Payload::MetadataFanout(route.fanout)),
        None,
    );
}

/// Inserts the downstream hops right after the metadata hop at `position`.
///
/// A `secure` store goes through auth into storage A, a plain store straight
/// into storage B. Retrieve reads from A when `secure`, otherwise from B. List
/// visits A and then B.
pub fn splice_at_metadata(chain: &mut RpcChain, op: Operation, secure: bool) -> Result<()> {
    let fanout = chain.fanout()?.clone();
    let at = chain.position + 1;

    match op {
        Operation::Store if secure => {
            let auth = fanout.auth.ok_or(ChainError::MissingHop(Role::Auth))?;
            chain.add_hop(auth.address, Role::Auth, EntryPoint::AStore, None, Some(at));
            add_storage(chain, &fanout.storage_a, StorageVariant::A, op, at + 1);
        }
        Operation::Store => add_storage(chain, &fanout.storage_b, StorageVariant::B, op, at),
        Operation::Retrieve if secure => add_storage(chain, &fanout.storage_a, StorageVariant::A, op, at),
        Operation::Retrieve => add_storage(chain, &fanout.storage_b, StorageVariant::B, op, at),
        Operation::List => {
            add_storage(chain, &fanout.storage_a, StorageVariant::A, op, at);
            add_storage(chain, &fanout.storage_b, StorageVariant::B, op, at + 1);
        }
    }

    debug!(chain = %chain.id, "spliced {}", chain);
    Ok(())
}

fn add_storage(chain: &mut RpcChain, node: &NodeDescriptor, variant: StorageVariant, op: Operation, index: usize) {
    chain.add_hop(
        node.address.clone(),
        variant.role(),
        op.storage_entry(variant),
        None,
        Some(index),
    );
}

/// Reverses the chain and calls the frontend hop, which relays to the origin.
/// Chains without a frontend hop go to index 0 directly.
pub async fn return_to_origin(chain: &mut RpcChain, timeout: Duration) -> Result<bool> {
    chain.change_direction();
    let index = chain.position_of(Role::Frontend).unwrap_or(0);
    chain.call_index(index, timeout).await
}

#[cfg(test)]
mod tests {
    use std::time::Instant;

    use super::*;

    fn registry_with(roles: &[Role]) -> NodeRegistry {
        let registry = NodeRegistry::new(2);
        for (port, role) in roles.iter().enumerate() {
            let descriptor = NodeDescriptor::new(0, *role, format!("127.0.0.1:{}", 8100 + port));
            registry.report(descriptor, Instant::now()).unwrap();
        }
        registry
    }

    fn entries(chain: &RpcChain) -> Vec<EntryPoint> {
        chain.hops.iter().map(|hop| hop.entry_point).collect()
    }

    fn composed(op: Operation, args: OperationArgs, secure: bool) -> RpcChain {
        let registry = registry_with(&Role::BACKENDS);
        let route = route(&registry, op, &args).unwrap();
        let mut chain = origin_chain("127.0.0.1:7000", "127.0.0.1:7001", op, args);
        extend_at_frontend(&mut chain, route, op);
        chain.position = 2;
        splice_at_metadata(&mut chain, op, secure).unwrap();
        chain
    }

    #[test]
    fn admission_requires_metadata_and_both_storages() {
        let args = OperationArgs::new("a.txt", "hi", "");
        let partial = registry_with(&[Role::Metadata, Role::StorageA]);
        assert!(matches!(
            route(&partial, Operation::Retrieve, &args),
            Err(RegistryError::NoActiveNode(Role::StorageB))
        ));

        let without_auth = registry_with(&[Role::Metadata, Role::StorageA, Role::StorageB]);
        let route = route(&without_auth, Operation::Store, &args).unwrap();
        assert!(route.fanout.auth.is_none());
    }

    #[test]
    fn secret_store_requires_auth() {
        let registry = registry_with(&[Role::Metadata, Role::StorageA, Role::StorageB]);
        let args = OperationArgs::new("a.txt", "hi", "s3cret");
        assert!(matches!(
            route(&registry, Operation::Store, &args),
            Err(RegistryError::NoActiveNode(Role::Auth))
        ));
        assert!(route(&registry, Operation::Retrieve, &args).is_ok());
    }

    #[test]
    fn origin_chain_carries_arguments_on_hop_zero() {
        let chain = origin_chain("c", "f", Operation::List, OperationArgs::default());
        assert_eq!(entries(&chain), vec![EntryPoint::List, EntryPoint::FList]);
        assert_eq!(chain.operation().unwrap(), &OperationArgs::default());
    }

    #[test]
    fn secure_store_goes_through_auth() {
        let chain = composed(Operation::Store, OperationArgs::new("a.txt", "hi", "s"), true);
        assert_eq!(
            entries(&chain),
            vec![
                EntryPoint::Store,
                EntryPoint::FStore,
                EntryPoint::MdStore,
                EntryPoint::AStore,
                EntryPoint::FaStore
            ]
        );
        assert!(chain.find_hop(Role::Auth).is_some());
    }

    #[test]
    fn plain_store_and_retrieve_use_storage_b() {
        let store = composed(Operation::Store, OperationArgs::new("a.txt", "hi", ""), false);
        assert_eq!(store.last_hop().unwrap().entry_point, EntryPoint::FbStore);
        assert_eq!(store.len(), 4);

        let retrieve = composed(Operation::Retrieve, OperationArgs::new("a.txt", "", ""), false);
        assert_eq!(retrieve.last_hop().unwrap().entry_point, EntryPoint::FbRetrieve);

        let secure = composed(Operation::Retrieve, OperationArgs::new("a.txt", "", "s"), true);
        assert_eq!(secure.last_hop().unwrap().entry_point, EntryPoint::FaRetrieve);
    }

    #[test]
    fn list_visits_both_storages() {
        let chain = composed(Operation::List, OperationArgs::default(), false);
        assert_eq!(&entries(&chain)[3..], &[EntryPoint::FaList, EntryPoint::FbList]);
        assert!(chain.hops[3].entry_point.is_storage_list());
    }

    #[test]
    fn secure_store_without_auth_is_missing_a_hop() {
        let registry = registry_with(&[Role::Metadata, Role::StorageA, Role::StorageB]);
        let args = OperationArgs::new("a.txt", "hi", "");
        let route = route(&registry, Operation::Store, &args).unwrap();
        let mut chain = origin_chain("c", "f", Operation::Store, args);
        extend_at_frontend(&mut chain, route, Operation::Store);
        chain.position = 2;

        assert!(matches!(
            splice_at_metadata(&mut chain, Operation::Store, true),
            Err(ChainError::MissingHop(Role::Auth))
        ));
        assert_eq!(chain.len(), 3);
    }
}
