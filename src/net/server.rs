//! Server-side replication manager
//!
//! Owns the authoritative scene and one [`ReplicaView`] per connected client.
//! Each tick it broadcasts pending destroys, ticks behaviors, flushes queued
//! RPCs and then sends each view the most relevant replica updates that fit
//! its byte budget. All sends go through the [`ServerTransport`] seam; the
//! manager never touches a socket.

use std::sync::Arc;

use rustc_hash::{FxHashMap, FxHashSet};

use crate::net::bitstream::BitStream;
use crate::net::protocol::{
    begin_message, finish_message, open_message, MessageId, ProtocolError, MAX_MESSAGE_SIZE,
};
use crate::net::transport::{ConnectionId, Reliability, ServerTransport};
use crate::replica::behavior::{RpcTarget, SerializeContext, SerializeMode};
use crate::replica::id::{ReplicaId, ReplicaIdAllocator};
use crate::replica::prefab::{instantiate_scene_entry, PrefabRegistry, SceneDefinition};
use crate::replica::replica::{Replica, Role};
use crate::replica::scene::NetworkScene;
use crate::replica::view::ReplicaView;

#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error("Unknown prefab index {0}")]
    UnknownPrefab(u16),
}

/// Tuning knobs for the update flush
#[derive(Debug, Clone)]
pub struct ServerSettings {
    /// Byte budget for one view's replica updates per tick
    pub update_byte_budget: usize,
    /// Channel used for steady-state updates; lost ones are replaced by the
    /// next tick anyway
    pub update_reliability: Reliability,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            update_byte_budget: 1200,
            update_reliability: Reliability::Unreliable,
        }
    }
}

impl ServerSettings {
    pub fn from_config(config: &crate::config::ReplicationConfig) -> Self {
        Self {
            update_byte_budget: config.update_byte_budget,
            ..Default::default()
        }
    }
}

/// Destroy waiting for the next tick's broadcast. The destruction payload is
/// captured at destroy time; the replica itself is already gone.
struct PendingDestroy {
    id: ReplicaId,
    payload: BitStream,
}

pub struct ServerReplicaManager {
    scene: NetworkScene,
    views: Vec<ReplicaView>,
    allocator: ReplicaIdAllocator,
    registry: Arc<PrefabRegistry>,
    pending_destroys: Vec<PendingDestroy>,
    /// Which replicas each connection has already seen a full update for
    sent_full: FxHashMap<ConnectionId, FxHashSet<ReplicaId>>,
    settings: ServerSettings,
}

impl ServerReplicaManager {
    pub fn new(registry: Arc<PrefabRegistry>, settings: ServerSettings) -> Self {
        Self {
            scene: NetworkScene::new(),
            views: Vec::new(),
            allocator: ReplicaIdAllocator::new(),
            registry,
            pending_destroys: Vec::new(),
            sent_full: FxHashMap::default(),
            settings,
        }
    }

    // ------------------------------------------------------------------
    // Views
    // ------------------------------------------------------------------

    pub fn add_view(&mut self, view: ReplicaView) {
        debug_assert!(view.connection.is_valid());
        self.views.push(view);
    }

    pub fn view_mut(&mut self, conn: ConnectionId) -> Option<&mut ReplicaView> {
        self.views.iter_mut().find(|v| v.connection == conn)
    }

    /// Drop a connection's view and its full-update bookkeeping. Called on
    /// disconnect.
    pub fn remove_view(&mut self, conn: ConnectionId) {
        self.views.retain(|v| v.connection != conn);
        self.sent_full.remove(&conn);
    }

    pub fn view_count(&self) -> usize {
        self.views.len()
    }

    // ------------------------------------------------------------------
    // Replica lifecycle
    // ------------------------------------------------------------------

    /// Register the scene's build-time replicas. Both peers run this against
    /// identical content, so no traffic is needed to establish the ids.
    pub fn load_scene(&mut self, scene: &SceneDefinition) {
        for entry in scene.sorted_entries() {
            if let Some(replica) = instantiate_scene_entry(entry, Role::Server) {
                self.scene.add(replica);
            }
        }
    }

    /// Spawn a dynamic replica from the Prefab Registry. The server keeps
    /// ownership until the host hands it to a connection.
    pub fn spawn(&mut self, prefab_idx: u16) -> Result<ReplicaId, ServerError> {
        let template = self
            .registry
            .lookup(prefab_idx)
            .ok_or(ServerError::UnknownPrefab(prefab_idx))?;

        let mut replica = template.instantiate(Role::Server);
        replica.id = self.allocator.allocate();
        replica.prefab_idx = prefab_idx;
        replica.take_ownership();

        let id = replica.id;
        self.scene.add(replica);
        tracing::debug!(%id, prefab = %template.name, "replica spawned");
        Ok(id)
    }

    /// Destroy a replica and notify every client. The destruction payload is
    /// captured now; the broadcast goes out on the next tick, batched with
    /// any other pending destroys.
    pub fn destroy(&mut self, id: ReplicaId) {
        let Some(mut replica) = self.scene.remove(id) else {
            tracing::trace!(%id, "destroy of unknown replica ignored");
            return;
        };

        let mut payload = BitStream::new();
        if let Err(err) = replica.serialize_destruction(&mut payload) {
            tracing::warn!(%id, %err, "destruction payload dropped");
            payload.clear();
        }
        replica.detach();
        self.forget(id);
        self.pending_destroys.push(PendingDestroy { id, payload });
        tracing::debug!(%id, "replica destroyed");
    }

    /// Remove a replica without telling anyone. Clients let their copy decay
    /// through the inactivity timeout.
    pub fn remove(&mut self, id: ReplicaId) {
        if let Some(mut replica) = self.scene.remove(id) {
            replica.detach();
            self.forget(id);
        }
    }

    fn forget(&mut self, id: ReplicaId) {
        for sent in self.sent_full.values_mut() {
            sent.remove(&id);
        }
    }

    pub fn replica(&self, id: ReplicaId) -> Option<&Replica> {
        self.scene.get(id)
    }

    pub fn replica_mut(&mut self, id: ReplicaId) -> Option<&mut Replica> {
        self.scene.get_mut(id)
    }

    pub fn replica_count(&self) -> usize {
        self.scene.len()
    }

    // ------------------------------------------------------------------
    // Tick
    // ------------------------------------------------------------------

    pub fn update(&mut self, dt: f32, transport: &mut dyn ServerTransport) {
        self.flush_destroys(transport);
        for replica in self.scene.iter_mut() {
            replica.tick(dt);
        }
        self.flush_queued_rpcs(transport);
        self.send_replica_updates(transport);
    }

    /// Broadcast all pending destroys, batched into as few reliable messages
    /// as the size cap allows. Each entry records the absolute byte offset of
    /// the next entry so a reader can resync past a malformed payload.
    fn flush_destroys(&mut self, transport: &mut dyn ServerTransport) {
        if self.pending_destroys.is_empty() {
            return;
        }

        let pending = std::mem::take(&mut self.pending_destroys);
        let mut msg = begin_message(MessageId::ReplicaDestroy);
        for entry in pending {
            let entry_bytes = 4 + 2 + entry.payload.len_bits().div_ceil(8);
            if msg.write_pos() / 8 + entry_bytes > MAX_MESSAGE_SIZE {
                Self::broadcast(msg, transport);
                msg = begin_message(MessageId::ReplicaDestroy);
            }

            msg.write_u32(entry.id.raw());
            let offset_pos = msg.write_pos();
            msg.write_u16(0); // patched once the payload size is known
            msg.append(&entry.payload);
            msg.align_write_to_byte();

            let end = msg.write_pos();
            msg.set_write_pos(offset_pos);
            msg.write_u16((end / 8) as u16);
            msg.set_write_pos(end);
        }
        Self::broadcast(msg, transport);
    }

    fn broadcast(msg: BitStream, transport: &mut dyn ServerTransport) {
        match finish_message(msg) {
            Ok(bytes) => transport.broadcast(&bytes, Reliability::ReliableOrdered),
            Err(err) => tracing::warn!(%err, "broadcast dropped"),
        }
    }

    fn flush_queued_rpcs(&mut self, transport: &mut dyn ServerTransport) {
        for id in self.scene.ids() {
            let Some(replica) = self.scene.get_mut(id) else {
                continue;
            };
            let queued = replica.take_queued_rpcs();
            if queued.is_empty() {
                continue;
            }
            let owner = replica.owner();

            for rpc in queued {
                let mut msg = begin_message(MessageId::ReplicaRpc);
                msg.write_u32(id.raw());
                msg.append(&rpc.payload);
                let bytes = match finish_message(msg) {
                    Ok(bytes) => bytes,
                    Err(err) => {
                        tracing::warn!(%id, %err, "queued RPC dropped");
                        continue;
                    }
                };

                match rpc.target {
                    RpcTarget::Owner => {
                        if owner.is_valid() {
                            transport.send(owner, &bytes, Reliability::ReliableOrdered);
                        } else {
                            tracing::trace!(%id, "owner-targeted RPC on unowned replica dropped");
                        }
                    }
                    RpcTarget::All => {
                        for view in &self.views {
                            transport.send(view.connection, &bytes, Reliability::ReliableOrdered);
                        }
                    }
                    RpcTarget::AllExceptOwner => {
                        for view in &self.views {
                            if view.connection != owner {
                                transport.send(
                                    view.connection,
                                    &bytes,
                                    Reliability::ReliableOrdered,
                                );
                            }
                        }
                    }
                }
            }
        }
    }

    /// Send each view its most relevant replicas, full on first sight and
    /// partial afterwards, until the view's byte budget is spent.
    fn send_replica_updates(&mut self, transport: &mut dyn ServerTransport) {
        for view in &self.views {
            let mut scored: Vec<(ReplicaId, f32)> = self
                .scene
                .iter()
                .filter(|r| r.is_relevant_for(view))
                .map(|r| (r.id, r.relevance(view)))
                .filter(|(_, score)| *score > 0.0)
                .collect();
            scored.sort_unstable_by(|a, b| {
                b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal)
            });

            let sent_full = self.sent_full.entry(view.connection).or_default();
            let mut spent = 0usize;
            for (id, _) in scored {
                let Some(replica) = self.scene.get(id) else {
                    continue;
                };

                let is_full = !sent_full.contains(&id);
                let observer_is_owner =
                    view.connection.is_valid() && replica.owner() == view.connection;

                let mut msg = begin_message(MessageId::ReplicaUpdate);
                msg.write_bool(replica.is_scene_replica());
                if !replica.is_scene_replica() {
                    msg.write_u16(replica.prefab_idx);
                }
                msg.write_u32(id.raw());
                msg.write_bool(observer_is_owner);
                msg.write_bool(is_full);

                let ctx = SerializeContext {
                    mode: if is_full {
                        SerializeMode::Full
                    } else {
                        SerializeMode::Partial
                    },
                    observer: view.connection,
                    observer_is_owner,
                };
                if let Err(err) = replica.serialize(&mut msg, &ctx) {
                    tracing::warn!(%id, %err, "replica serialize failed, skipped this tick");
                    continue;
                }

                let bytes = match finish_message(msg) {
                    Ok(bytes) => bytes,
                    Err(err) => {
                        tracing::warn!(%id, %err, "replica update oversized, skipped");
                        continue;
                    }
                };
                if spent + bytes.len() > self.settings.update_byte_budget {
                    break; // Lower-relevance replicas wait for a later tick
                }

                transport.send(view.connection, &bytes, self.settings.update_reliability);
                spent += bytes.len();
                if is_full {
                    sent_full.insert(id);
                }
            }
        }
    }

    // ------------------------------------------------------------------
    // Inbound
    // ------------------------------------------------------------------

    /// Handle one message from a client connection. RPCs for unknown replicas
    /// are dropped silently; they are expected after a destroy is in flight.
    pub fn handle_message(&mut self, conn: ConnectionId, data: &[u8]) -> Result<(), ProtocolError> {
        let (message_id, mut bs) = open_message(data)?;
        match message_id {
            MessageId::ReplicaRpc => {
                let replica_id = ReplicaId::from_raw(bs.read_u32()?);
                let Some(replica) = self.scene.get_mut(replica_id) else {
                    tracing::trace!(%replica_id, "RPC for unknown replica dropped");
                    return Ok(());
                };
                if let Err(err) = replica.call_rpc_server(conn, &mut bs) {
                    tracing::warn!(%replica_id, %err, "RPC dispatch failed");
                }
            }
            other => {
                tracing::warn!(?other, "unexpected message from client");
            }
        }
        Ok(())
    }
}
