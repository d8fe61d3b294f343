//! Cluster membership kept by the frontend.
//!
//! Every backend role has one [`RoleRegistry`]: a bounded set of active slots,
//! an unbounded waitlist and the last heartbeat seen per slot. The frontend
//! owns all descriptors; nothing else keeps references into these maps.

use std::{
    collections::{BTreeMap, HashMap},
    sync::{Arc, Mutex, MutexGuard, PoisonError},
    time::{Duration, Instant},
};

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::{chain::Role, error::RegistryError, replica::Snapshot};

pub type SlotId = u32;

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeDescriptor {
    pub slot_id: SlotId,
    pub role: Role,
    pub address: String,
    pub service_name: String,
}

impl NodeDescriptor {
    pub fn new(slot_id: SlotId, role: Role, address: impl Into<String>) -> Self {
        Self {
            slot_id,
            role,
            address: address.into(),
            service_name: role.service_name().to_string(),
        }
    }
}

/// A heartbeat: who is reporting, and the data it currently holds.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ActivityReport {
    pub descriptor: NodeDescriptor,
    pub snapshot: Snapshot,
}

/// Where a reported slot ended up.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Placement {
    /// Already active, refreshed in place.
    Refreshed,
    /// Newly admitted into the active set.
    Activated,
    Waitlisted,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Report {
    pub placement: Placement,
    /// Secondaries to receive the reporter's snapshot. Non-empty only when the
    /// reporter is the role's primary and has company.
    pub replica_targets: Vec<NodeDescriptor>,
}

/// A slot declared dead by the monitor.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Eviction {
    pub role: Role,
    pub slot_id: SlotId,
    pub was_active: bool,
    pub promoted: Option<NodeDescriptor>,
}

/// Membership of a single role.
#[derive(Debug, Default)]
pub struct RoleRegistry {
    active: BTreeMap<SlotId, NodeDescriptor>,
    waiting: BTreeMap<SlotId, NodeDescriptor>,
    activity: BTreeMap<SlotId, Instant>,
    next_slot: SlotId,
}

impl RoleRegistry {
    /// Idempotent upsert of a heartbeat.
    ///
    /// Unseen slots enter the active set only while it has room and nobody
    /// is queued ahead of them.
    pub fn report(&mut self, descriptor: NodeDescriptor, now: Instant, replication_factor: usize) -> Report {
        let slot = descriptor.slot_id;
        self.next_slot = self.next_slot.max(slot.saturating_add(1));

        let placement = if let Some(entry) = self.active.get_mut(&slot) {
            *entry = descriptor;
            Placement::Refreshed
        } else if let Some(entry) = self.waiting.get_mut(&slot) {
            *entry = descriptor;
            Placement::Waitlisted
        } else if self.active.len() < replication_factor && self.waiting.is_empty() {
            self.active.insert(slot, descriptor);
            Placement::Activated
        } else {
            self.waiting.insert(slot, descriptor);
            Placement::Waitlisted
        };

        self.activity.insert(slot, now);

        let replica_targets = if self.primary_slot() == Some(slot) && self.active.len() > 1 {
            self.secondaries()
        } else {
            Vec::new()
        };

        Report {
            placement,
            replica_targets,
        }
    }

    /// Hands out a slot id nobody in this role has used yet.
    pub fn allocate_slot(&mut self) -> SlotId {
        let slot = self.next_slot;
        self.next_slot = slot.saturating_add(1);
        slot
    }

    pub fn primary_slot(&self) -> Option<SlotId> {
        self.active.keys().next().copied()
    }

    pub fn primary(&self) -> Option<&NodeDescriptor> {
        self.active.values().next()
    }

    /// Every active node except the primary.
    pub fn secondaries(&self) -> Vec<NodeDescriptor> {
        self.active.values().skip(1).cloned().collect()
    }

    pub fn active(&self) -> impl Iterator<Item = &NodeDescriptor> {
        self.active.values()
    }

    pub fn waiting(&self) -> impl Iterator<Item = &NodeDescriptor> {
        self.waiting.values()
    }

    pub fn active_count(&self) -> usize {
        self.active.len()
    }

    pub fn waiting_count(&self) -> usize {
        self.waiting.len()
    }

    pub fn last_heartbeat(&self, slot: SlotId) -> Option<Instant> {
        self.activity.get(&slot).copied()
    }

    /// Drops every slot whose last heartbeat is older than `threshold` and
    /// refills freed active slots from the waitlist, lowest slot id first.
    pub fn evict_stale(&mut self, role: Role, now: Instant, threshold: Duration) -> Vec<Eviction> {
        let stale: Vec<SlotId> = self
            .activity
            .iter()
            .filter(|(_, seen)| now.saturating_duration_since(**seen) > threshold)
            .map(|(slot, _)| *slot)
            .collect();

        stale
            .into_iter()
            .map(|slot| {
                self.activity.remove(&slot);

                if self.waiting.remove(&slot).is_some() {
                    return Eviction {
                        role,
                        slot_id: slot,
                        was_active: false,
                        promoted: None,
                    };
                }

                let was_active = self.active.remove(&slot).is_some();
                let promoted = if was_active { self.promote() } else { None };

                Eviction {
                    role,
                    slot_id: slot,
                    was_active,
                    promoted,
                }
            })
            .collect()
    }

    fn promote(&mut self) -> Option<NodeDescriptor> {
        let (slot, descriptor) = self.waiting.pop_first()?;
        self.active.insert(slot, descriptor.clone());
        Some(descriptor)
    }
}

/// Thread-safe registry over all backend roles, one lock per role.
#[derive(Clone, Debug)]
pub struct NodeRegistry(Arc<Inner>);

#[derive(Debug)]
struct Inner {
    replication_factor: usize,
    roles: HashMap<Role, Mutex<RoleRegistry>>,
}

impl NodeRegistry {
    pub fn new(replication_factor: usize) -> Self {
        let roles = Role::BACKENDS
            .into_iter()
            .map(|role| (role, Mutex::new(RoleRegistry::default())))
            .collect();

        Self(Arc::new(Inner {
            replication_factor,
            roles,
        }))
    }

    pub fn replication_factor(&self) -> usize {
        self.0.replication_factor
    }

    fn role(&self, role: Role) -> Result<MutexGuard<'_, RoleRegistry>, RegistryError> {
        let lock = self.0.roles.get(&role).ok_or(RegistryError::NotRegistrable(role))?;
        Ok(lock.lock().unwrap_or_else(PoisonError::into_inner))
    }

    pub fn report(&self, descriptor: NodeDescriptor, now: Instant) -> Result<Report, RegistryError> {
        let role = descriptor.role;
        let slot = descriptor.slot_id;
        let report = self.role(role)?.report(descriptor, now, self.0.replication_factor);

        match report.placement {
            Placement::Activated => info!(%role, slot, "node joined the active set"),
            Placement::Waitlisted => debug!(%role, slot, "node is waitlisted"),
            Placement::Refreshed => {}
        }

        Ok(report)
    }

    pub fn join(&self, role: Role) -> Result<SlotId, RegistryError> {
        Ok(self.role(role)?.allocate_slot())
    }

    pub fn primary_slot(&self, role: Role) -> Result<SlotId, RegistryError> {
        self.role(role)?
            .primary_slot()
            .ok_or(RegistryError::NoActiveNode(role))
    }

    pub fn primary(&self, role: Role) -> Result<NodeDescriptor, RegistryError> {
        self.role(role)?
            .primary()
            .cloned()
            .ok_or(RegistryError::NoActiveNode(role))
    }

    pub fn active(&self, role: Role) -> Vec<NodeDescriptor> {
        self.role(role)
            .map(|entry| entry.active().cloned().collect())
            .unwrap_or_default()
    }

    pub fn waiting(&self, role: Role) -> Vec<NodeDescriptor> {
        self.role(role)
            .map(|entry| entry.waiting().cloned().collect())
            .unwrap_or_default()
    }

    pub fn active_count(&self, role: Role) -> usize {
        self.role(role).map(|entry| entry.active_count()).unwrap_or_default()
    }

    pub fn secondaries(&self, role: Role) -> Vec<NodeDescriptor> {
        self.role(role)
            .map(|entry| entry.secondaries())
            .unwrap_or_default()
    }

    /// One eviction sweep over every role.
    pub fn evict_stale(&self, now: Instant, threshold: Duration) -> Vec<Eviction> {
        let mut evictions = Vec::new();
        for role in Role::BACKENDS {
            if let Ok(mut entry) = self.role(role) {
                evictions.extend(entry.evict_stale(role, now, threshold));
            }
        }
        evictions
    }

    /// Human-readable dump for the diagnostic loop.
    pub fn describe(&self) -> String {
        Role::BACKENDS
            .into_iter()
            .map(|role| {
                let active: Vec<_> = self.active(role).iter().map(|d| d.slot_id).collect();
                let waiting: Vec<_> = self.waiting(role).iter().map(|d| d.slot_id).collect();
                format!("{role}: active={active:?} waiting={waiting:?}")
            })
            .collect::<Vec<_>>()
            .join("; ")
    }
}
