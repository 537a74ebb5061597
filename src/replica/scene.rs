//! Process-local replica registry
//!
//! One `NetworkScene` exists per manager and is the sole mutator of the
//! id→replica mapping. It is never shared outside its manager; everything
//! here runs on the manager's tick.

use rustc_hash::FxHashMap;

use crate::replica::id::ReplicaId;
use crate::replica::replica::Replica;

#[derive(Default)]
pub struct NetworkScene {
    replicas: FxHashMap<ReplicaId, Replica>,
}

impl NetworkScene {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a replica under its id. A duplicate id is a content or
    /// bookkeeping defect, not a runtime race.
    pub fn add(&mut self, replica: Replica) {
        assert!(replica.id.is_valid(), "replica must have a valid id");
        let previous = self.replicas.insert(replica.id, replica);
        assert!(previous.is_none(), "duplicate replica id in scene");
    }

    /// Replace any existing replica under the same id, detaching it first
    pub fn add_or_replace(&mut self, replica: Replica) {
        if let Some(mut previous) = self.replicas.remove(&replica.id) {
            previous.detach();
        }
        self.replicas.insert(replica.id, replica);
    }

    /// Remove without detaching; idempotent
    pub fn remove(&mut self, id: ReplicaId) -> Option<Replica> {
        let removed = self.replicas.remove(&id);
        if let Some(replica) = &removed {
            // Unlink from a composite parent if there is one
            if let Some(parent_id) = replica.parent {
                if let Some(parent) = self.replicas.get_mut(&parent_id) {
                    parent.children.retain(|child| *child != id);
                }
            }
        }
        removed
    }

    pub fn contains(&self, id: ReplicaId) -> bool {
        self.replicas.contains_key(&id)
    }

    pub fn get(&self, id: ReplicaId) -> Option<&Replica> {
        self.replicas.get(&id)
    }

    pub fn get_mut(&mut self, id: ReplicaId) -> Option<&mut Replica> {
        self.replicas.get_mut(&id)
    }

    pub fn len(&self) -> usize {
        self.replicas.len()
    }

    pub fn is_empty(&self) -> bool {
        self.replicas.is_empty()
    }

    /// Snapshot of live ids; safe to iterate while mutating the scene
    pub fn ids(&self) -> Vec<ReplicaId> {
        self.replicas.keys().copied().collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Replica> {
        self.replicas.values()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut Replica> {
        self.replicas.values_mut()
    }

    /// Link a child replica to a composite root
    pub fn set_parent(&mut self, child_id: ReplicaId, parent_id: ReplicaId) {
        if let Some(child) = self.replicas.get_mut(&child_id) {
            child.parent = Some(parent_id);
        }
        if let Some(parent) = self.replicas.get_mut(&parent_id) {
            if !parent.children.contains(&child_id) {
                parent.children.push(child_id);
            }
        }
    }

    /// Detach and drop every replica (scene reset / shutdown)
    pub fn destroy_all(&mut self) {
        for replica in self.replicas.values_mut() {
            replica.detach();
        }
        self.replicas.clear();
    }
}
