//! Full-state push replication from a role's primary to its secondaries.

use std::{collections::BTreeMap, time::Duration};

use futures::future::join_all;
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument, warn};

use crate::{chain::Role, error::ChainError, registry::NodeDescriptor, transport};

/// A full copy of the maps a role owns. The number and order of maps is
/// fixed per role: metadata ships `[class A, class B]`, auth and storage ship
/// a single map.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Snapshot {
    pub maps: Vec<BTreeMap<String, String>>,
}

impl Snapshot {
    pub fn new(maps: Vec<BTreeMap<String, String>>) -> Self {
        Self { maps }
    }

    /// True when every map is empty.
    pub fn is_empty(&self) -> bool {
        self.maps.iter().all(BTreeMap::is_empty)
    }

    pub fn entries(&self) -> usize {
        self.maps.iter().map(BTreeMap::len).sum()
    }
}

/// Pushes `snapshot` to every target concurrently and returns how many of
/// them acknowledged. Unreachable secondaries are logged and skipped; they
/// catch up on the primary's next heartbeat.
#[instrument(skip(targets, snapshot), fields(count = targets.len(), entries = snapshot.entries()))]
pub async fn push_snapshot(
    role: Role,
    targets: &[NodeDescriptor],
    snapshot: &Snapshot,
    deadline: Duration,
) -> usize {
    let pushes = targets.iter().map(|target| async move {
        match push_one(target, snapshot.clone(), deadline).await {
            Ok(ack) => {
                debug!(slot = target.slot_id, %ack, "replica updated");
                true
            }
            Err(err) => {
                warn!(slot = target.slot_id, address = %target.address, "replica push failed: {}", err);
                false
            }
        }
    });

    join_all(pushes).await.into_iter().filter(|acked| *acked).count()
}

async fn push_one(target: &NodeDescriptor, snapshot: Snapshot, deadline: Duration) -> Result<String, ChainError> {
    let node = transport::connect_node(&target.address).await?;
    let ack = node
        .update_consistency(transport::context(deadline), snapshot)
        .await?;
    Ok(ack)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn emptiness_covers_every_map() {
        assert!(Snapshot::default().is_empty());
        assert!(Snapshot::new(vec![BTreeMap::new(), BTreeMap::new()]).is_empty());

        let mut files = BTreeMap::new();
        files.insert("a.txt".to_string(), "hi".to_string());
        let snapshot = Snapshot::new(vec![BTreeMap::new(), files]);
        assert!(!snapshot.is_empty());
        assert_eq!(snapshot.entries(), 1);
    }

    #[tokio::test]
    async fn unreachable_targets_are_not_counted() {
        // port 1 on loopback refuses connections
        let target = NodeDescriptor::new(1, Role::Metadata, "127.0.0.1:1");
        let acked = push_snapshot(Role::Metadata, &[target], &Snapshot::default(), Duration::from_secs(1)).await;
        assert_eq!(acked, 0);
    }
}
