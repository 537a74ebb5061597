//! Stable replica identity
//!
//! Scene replicas exist identically in build-time content on every peer, so
//! their ids are derived locally from the scene index and never transmitted
//! for identity establishment. Dynamic replicas are spawned at runtime and
//! only the server may allocate their ids.

use std::fmt;

/// First id value reserved for dynamic replicas. Everything below (except 0)
/// maps 1:1 to a build-time scene index.
pub const FIRST_DYNAMIC_ID: u32 = 256;

/// Compact stable identifier for a replica. Zero is reserved as invalid.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct ReplicaId(u32);

impl ReplicaId {
    pub const INVALID: ReplicaId = ReplicaId(0);

    pub fn invalid() -> Self {
        Self::INVALID
    }

    /// Deterministic id for a build-time scene replica. A scene index of 0
    /// marks unassigned content and yields the invalid id; scene loading
    /// rejects those entries before they get here.
    pub fn from_scene_index(scene_idx: u8) -> Self {
        Self(u32::from(scene_idx))
    }

    /// Reconstruct an id received over the wire
    pub fn from_raw(raw: u32) -> Self {
        Self(raw)
    }

    pub fn raw(self) -> u32 {
        self.0
    }

    pub fn is_valid(self) -> bool {
        self.0 != 0
    }

    pub fn is_scene_replica(self) -> bool {
        self.0 != 0 && self.0 < FIRST_DYNAMIC_ID
    }
}

impl fmt::Display for ReplicaId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if !self.is_valid() {
            write!(f, "Replica#invalid")
        } else if self.is_scene_replica() {
            write!(f, "Replica#scene:{}", self.0)
        } else {
            write!(f, "Replica#{}", self.0)
        }
    }
}

/// Server-side allocator for dynamic replica ids. Monotonic; ids are not
/// recycled within a process lifetime so late messages for a destroyed
/// replica can never alias a new one.
#[derive(Debug)]
pub struct ReplicaIdAllocator {
    next: u32,
}

impl ReplicaIdAllocator {
    pub fn new() -> Self {
        Self { next: FIRST_DYNAMIC_ID }
    }

    pub fn allocate(&mut self) -> ReplicaId {
        let id = ReplicaId(self.next);
        self.next += 1;
        id
    }
}

impl Default for ReplicaIdAllocator {
    fn default() -> Self {
        Self::new()
    }
}
