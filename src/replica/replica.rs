//! The replicated entity
//!
//! A `Replica` is the unit of replication: stable identity, ownership, an
//! ordered set of behaviors, and the relevance policy that decides how
//! eagerly the server sends it to each view. The same type backs both peers;
//! a role tag set at construction guards the server-only and client-only
//! operations.

use smallvec::SmallVec;

use crate::net::bitstream::BitStream;
use crate::net::transport::ConnectionId;
use crate::replica::behavior::{
    BehaviorError, ReplicaBehavior, RpcTarget, SerializeContext, SerializeMode,
};
use crate::replica::id::ReplicaId;
use crate::replica::view::ReplicaView;
use crate::util::vec3::{Quat, Vec3};

/// Relevance policy flags
pub mod priority_flags {
    /// Score this replica at full relevance regardless of distance
    pub const IGNORE_POSITION: u8 = 1 << 0;
}

/// Per-replica replication policy
#[derive(Debug, Clone)]
pub struct ReplicaSettings {
    /// Planar distance beyond which the replica is irrelevant to a view
    pub max_view_distance: f32,
    pub priority_flags: u8,
    /// Target interval between steady-state updates, seconds. Also drives
    /// the client-side inactivity window (30x this interval).
    pub desired_update_interval: f32,
}

impl Default for ReplicaSettings {
    fn default() -> Self {
        Self {
            max_view_distance: 100.0,
            priority_flags: 0,
            desired_update_interval: 0.1,
        }
    }
}

/// Which peer this replica instance lives on
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Server,
    Client,
}

/// RPC buffered on the server until the next tick flushes it
#[derive(Debug)]
pub struct QueuedRpc {
    pub target: RpcTarget,
    /// component_idx, method_id and arguments, in wire order
    pub payload: BitStream,
}

pub struct Replica {
    pub id: ReplicaId,
    /// Prefab Registry key; meaningless for scene replicas
    pub prefab_idx: u16,
    /// Nonzero only for scene replicas
    pub scene_idx: u8,
    pub settings: ReplicaSettings,
    /// Replicate exclusively to the owning connection
    pub replicate_only_to_owner: bool,
    /// Inactive replicas are never relevant
    pub active: bool,
    pub position: Vec3,
    pub orientation: Quat,
    /// Composite-object links, host-side bookkeeping only
    pub parent: Option<ReplicaId>,
    pub children: Vec<ReplicaId>,
    /// Client-side liveness clock, refreshed by every received update
    pub last_update_time: f32,

    role: Role,
    owner: ConnectionId,
    is_owner: bool,
    attached: bool,
    behaviors: Vec<Box<dyn ReplicaBehavior>>,
    queued_rpcs: SmallVec<[QueuedRpc; 2]>,
}

impl Replica {
    pub fn new(role: Role) -> Self {
        Self {
            id: ReplicaId::invalid(),
            prefab_idx: u16::MAX,
            scene_idx: 0,
            settings: ReplicaSettings::default(),
            replicate_only_to_owner: false,
            active: true,
            position: Vec3::ZERO,
            orientation: Quat::IDENTITY,
            parent: None,
            children: Vec::new(),
            last_update_time: 0.0,
            role,
            owner: ConnectionId::INVALID,
            is_owner: false,
            attached: true,
            behaviors: Vec::new(),
            queued_rpcs: SmallVec::new(),
        }
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn is_scene_replica(&self) -> bool {
        self.scene_idx != 0
    }

    pub fn owner(&self) -> ConnectionId {
        self.owner
    }

    /// True on the one peer that currently has authority over this replica
    pub fn is_owner_local(&self) -> bool {
        self.is_owner
    }

    /// Attach a behavior, assigning the next slot index. Attach order is the
    /// wire contract: it must match the peer's construction of the same
    /// prefab/scene entry.
    pub fn attach_behavior(&mut self, mut behavior: Box<dyn ReplicaBehavior>) -> u8 {
        debug_assert!(self.behaviors.len() < usize::from(u8::MAX));
        behavior.on_attach();
        self.behaviors.push(behavior);
        (self.behaviors.len() - 1) as u8
    }

    pub fn behavior_count(&self) -> usize {
        self.behaviors.len()
    }

    // ------------------------------------------------------------------
    // Ownership
    // ------------------------------------------------------------------

    /// Hand authority to a connection. Server only.
    pub fn assign_ownership(&mut self, owner: ConnectionId) {
        debug_assert_eq!(self.role, Role::Server);
        debug_assert!(owner.is_valid());

        self.owner = owner;
        self.is_owner = false;
    }

    /// Reclaim authority for the server itself. Server only.
    pub fn take_ownership(&mut self) {
        debug_assert_eq!(self.role, Role::Server);

        self.owner = ConnectionId::INVALID;
        self.is_owner = true;
    }

    /// Apply an ownership flag received from the server. Client only; the
    /// caller must have checked that the value actually changed.
    pub fn client_update_ownership(&mut self, owned: bool) {
        debug_assert_eq!(self.role, Role::Client);
        debug_assert_ne!(owned, self.is_owner);

        self.is_owner = owned;
    }

    // ------------------------------------------------------------------
    // Relevance
    // ------------------------------------------------------------------

    /// Hard pre-filter before any scoring. Server only.
    pub fn is_relevant_for(&self, view: &ReplicaView) -> bool {
        debug_assert_eq!(self.role, Role::Server);

        if !self.active {
            return false;
        }
        if self.replicate_only_to_owner {
            return view.connection == self.owner;
        }
        true
    }

    /// Relevance score in [0,1] used to prioritize updates under the
    /// bandwidth budget. Server only.
    pub fn relevance(&self, view: &ReplicaView) -> f32 {
        debug_assert_eq!(self.role, Role::Server);

        if self.owner.is_valid() && view.connection == self.owner {
            return 1.0;
        }

        let use_position = self.settings.priority_flags & priority_flags::IGNORE_POSITION == 0
            && !view.ignore_replica_positions_for_priority;
        if !use_position {
            return 1.0;
        }

        let diff = self.position.planar() - view.position.planar();
        let sqr_dist = diff.length_sq();
        if sqr_dist <= f32::EPSILON {
            return 1.0; // On top of the view; facing cannot matter
        }

        let sqr_max_dist = self.settings.max_view_distance * self.settings.max_view_distance;
        if sqr_dist > sqr_max_dist {
            return 0.0; // No costly calculations
        }

        let distance_relevance = 1.0 - (sqr_dist / sqr_max_dist).powf(0.8);

        // Facing never zeroes relevance out entirely: things behind the view
        // still replicate, just less eagerly (peripheral visibility).
        let dot_relevance = view
            .forward
            .planar()
            .normalize()
            .dot(diff.normalize())
            .max(0.5);

        distance_relevance * dot_relevance
    }

    // ------------------------------------------------------------------
    // Wire
    // ------------------------------------------------------------------

    /// Write all behavior payloads in slot order
    pub fn serialize(&self, bs: &mut BitStream, ctx: &SerializeContext) -> Result<(), BehaviorError> {
        for behavior in &self.behaviors {
            behavior.serialize(bs, ctx)?;
        }
        Ok(())
    }

    /// Read all behavior payloads in slot order
    pub fn deserialize(&mut self, bs: &mut BitStream, mode: SerializeMode) -> Result<(), BehaviorError> {
        for behavior in &mut self.behaviors {
            behavior.deserialize(bs, mode)?;
        }
        Ok(())
    }

    pub fn serialize_destruction(&self, bs: &mut BitStream) -> Result<(), BehaviorError> {
        for behavior in &self.behaviors {
            behavior.serialize_destruction(bs)?;
        }
        Ok(())
    }

    pub fn deserialize_destruction(&mut self, bs: &mut BitStream) -> Result<(), BehaviorError> {
        for behavior in &mut self.behaviors {
            behavior.deserialize_destruction(bs)?;
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // RPC
    // ------------------------------------------------------------------

    /// Buffer an outgoing RPC; the server manager flushes the queue on its
    /// next tick. `payload` starts with component_idx and method_id.
    pub fn queue_rpc(&mut self, target: RpcTarget, payload: BitStream) {
        self.queued_rpcs.push(QueuedRpc { target, payload });
    }

    pub(crate) fn take_queued_rpcs(&mut self) -> SmallVec<[QueuedRpc; 2]> {
        std::mem::take(&mut self.queued_rpcs)
    }

    /// Dispatch an RPC received from a client connection. Calls from any
    /// connection other than the current owner are silently ignored: stale
    /// or hostile senders are expected, not errors.
    pub fn call_rpc_server(
        &mut self,
        caller: ConnectionId,
        bs: &mut BitStream,
    ) -> Result<(), BehaviorError> {
        debug_assert_eq!(self.role, Role::Server);

        if caller != self.owner {
            return Ok(());
        }
        self.dispatch_rpc(bs)
    }

    /// Dispatch an RPC received from the server. No authority check; the
    /// server is implicitly trusted.
    pub fn call_rpc_client(&mut self, bs: &mut BitStream) -> Result<(), BehaviorError> {
        debug_assert_eq!(self.role, Role::Client);

        self.dispatch_rpc(bs)
    }

    fn dispatch_rpc(&mut self, bs: &mut BitStream) -> Result<(), BehaviorError> {
        let component_idx = bs.read_u8()?;
        let method_id = bs.read_u8()?;

        let behavior = self
            .behaviors
            .get_mut(usize::from(component_idx))
            .ok_or(BehaviorError::Fault("RPC addressed to unknown behavior slot"))?;
        behavior.dispatch_rpc(method_id, bs)
    }

    // ------------------------------------------------------------------
    // Lifecycle
    // ------------------------------------------------------------------

    pub fn tick(&mut self, dt: f32) {
        for behavior in &mut self.behaviors {
            behavior.on_tick(dt);
        }
    }

    /// Run detach hooks once. Safe to call repeatedly and during teardown.
    pub fn detach(&mut self) {
        if !self.attached {
            return;
        }
        self.attached = false;
        for behavior in &mut self.behaviors {
            behavior.on_detach();
        }
    }
}

impl Drop for Replica {
    fn drop(&mut self) {
        self.detach();
    }
}
