//! Client-side replication manager
//!
//! Mirrors the server's world from inbound messages: constructs dynamic
//! replicas on first sight from the Prefab Registry, applies updates and
//! RPCs, honors destroy batches, and times out replicas the server has gone
//! quiet about. The host feeds it received payloads and drives `update` with
//! its clock.

use std::sync::Arc;

use crate::config::ReplicationConfig;
use crate::net::bitstream::BitStream;
use crate::net::protocol::{begin_message, finish_message, open_message, MessageId, ProtocolError};
use crate::net::transport::{ClientTransport, Reliability};
use crate::replica::behavior::SerializeMode;
use crate::replica::id::ReplicaId;
use crate::replica::prefab::{instantiate_scene_entry, PrefabRegistry, SceneDefinition};
use crate::replica::replica::{Replica, Role};
use crate::replica::scene::NetworkScene;

/// Seconds between inactivity sweeps
const SWEEP_INTERVAL: f32 = 1.0;

/// A replica counts as abandoned after missing this many update intervals
const INACTIVITY_INTERVALS: f32 = 30.0;

pub struct ClientReplicaManager {
    scene: NetworkScene,
    registry: Arc<PrefabRegistry>,
    config: ReplicationConfig,
    next_sweep_time: f32,
}

impl ClientReplicaManager {
    pub fn new(registry: Arc<PrefabRegistry>, config: ReplicationConfig) -> Self {
        Self {
            scene: NetworkScene::new(),
            registry,
            config,
            next_sweep_time: 0.0,
        }
    }

    /// Register the scene's build-time replicas, matching the server's ids
    /// without any traffic. A duplicate scene index is a content defect; the
    /// later entry wins with a warning.
    pub fn load_scene(&mut self, scene: &SceneDefinition) {
        for entry in scene.sorted_entries() {
            let Some(replica) = instantiate_scene_entry(entry, Role::Client) else {
                continue;
            };
            if self.scene.contains(replica.id) {
                tracing::warn!(
                    scene_idx = entry.scene_idx,
                    "duplicate scene index, replacing earlier replica"
                );
            }
            self.scene.add_or_replace(replica);
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
    // Inbound
    // ------------------------------------------------------------------

    /// Handle one message from the server. `now` is the host clock that also
    /// drives [`update`](Self::update); it timestamps replica liveness.
    pub fn handle_message(&mut self, data: &[u8], now: f32) -> Result<(), ProtocolError> {
        let (message_id, mut bs) = open_message(data)?;
        match message_id {
            MessageId::ReplicaUpdate => self.handle_update(&mut bs, now)?,
            MessageId::ReplicaRpc => self.handle_rpc(&mut bs)?,
            MessageId::ReplicaDestroy => self.handle_destroy(&mut bs)?,
        }
        Ok(())
    }

    fn handle_update(&mut self, bs: &mut BitStream, now: f32) -> Result<(), ProtocolError> {
        let is_scene = bs.read_bool()?;
        let prefab_idx = if is_scene { 0 } else { bs.read_u16()? };
        let replica_id = ReplicaId::from_raw(bs.read_u32()?);
        let is_owner = bs.read_bool()?;
        let is_full = bs.read_bool()?;

        if !self.scene.contains(replica_id) {
            if is_scene {
                // Scene content mismatch or an update outracing a scene load
                tracing::trace!(%replica_id, "update for unknown scene replica dropped");
                return Ok(());
            }
            let Some(template) = self.registry.lookup(prefab_idx) else {
                tracing::warn!(%replica_id, prefab_idx, "unknown prefab index, update discarded");
                return Ok(());
            };
            let mut replica = template.instantiate(Role::Client);
            replica.id = replica_id;
            replica.prefab_idx = prefab_idx;
            self.scene.add(replica);
            tracing::debug!(%replica_id, prefab = %template.name, "replica constructed");
        }

        let Some(replica) = self.scene.get_mut(replica_id) else {
            return Ok(());
        };
        if is_owner != replica.is_owner_local() {
            replica.client_update_ownership(is_owner);
        }

        let mode = if is_full {
            SerializeMode::Full
        } else {
            SerializeMode::Partial
        };
        if let Err(err) = replica.deserialize(bs, mode) {
            // Abandon this payload but keep the replica; the next update
            // re-synchronizes it.
            tracing::warn!(%replica_id, %err, "replica deserialize failed, payload abandoned");
        }
        replica.last_update_time = now;
        Ok(())
    }

    fn handle_rpc(&mut self, bs: &mut BitStream) -> Result<(), ProtocolError> {
        let replica_id = ReplicaId::from_raw(bs.read_u32()?);
        let Some(replica) = self.scene.get_mut(replica_id) else {
            tracing::trace!(%replica_id, "RPC for unknown replica dropped");
            return Ok(());
        };
        if let Err(err) = replica.call_rpc_client(bs) {
            tracing::warn!(%replica_id, %err, "RPC dispatch failed");
        }
        Ok(())
    }

    /// Apply a batched destroy message. Each entry carries the absolute byte
    /// offset of the next one, so a malformed payload costs only its own
    /// entry.
    fn handle_destroy(&mut self, bs: &mut BitStream) -> Result<(), ProtocolError> {
        while !bs.is_exhausted() {
            let entry_start = bs.read_pos();
            let replica_id = ReplicaId::from_raw(bs.read_u32()?);
            let next_entry = usize::from(bs.read_u16()?) * 8;
            if next_entry <= entry_start || next_entry > bs.len_bits() {
                tracing::warn!(%replica_id, "corrupt destroy batch, remainder dropped");
                return Ok(());
            }

            if let Some(mut replica) = self.scene.remove(replica_id) {
                if let Err(err) = replica.deserialize_destruction(bs) {
                    tracing::warn!(%replica_id, %err, "destruction payload failed");
                }
                replica.detach();
                tracing::debug!(%replica_id, "replica destroyed by server");
            } else {
                tracing::trace!(%replica_id, "destroy for unknown replica dropped");
            }

            // Resync regardless of what the payload read consumed
            bs.set_read_pos(next_entry);
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Tick
    // ------------------------------------------------------------------

    /// Time out dynamic replicas the server has stopped updating (covers
    /// silent removal and lost destroy messages). Scene replicas never time
    /// out. Sweeps are throttled to once per second.
    pub fn update(&mut self, now: f32) {
        if now < self.next_sweep_time {
            return;
        }
        self.next_sweep_time = now + SWEEP_INTERVAL;

        for id in self.scene.ids() {
            let Some(replica) = self.scene.get(id) else {
                continue;
            };
            if replica.is_scene_replica() {
                continue;
            }
            let window = (replica.settings.desired_update_interval * INACTIVITY_INTERVALS)
                .max(self.config.min_inactivity_timeout);
            if replica.last_update_time < now - window {
                tracing::debug!(%id, "replica timed out");
                if let Some(mut replica) = self.scene.remove(id) {
                    replica.detach();
                }
            }
        }
    }

    // ------------------------------------------------------------------
    // Outbound
    // ------------------------------------------------------------------

    /// Send an RPC to the server-side counterpart of a replica. The server
    /// ignores it unless this client owns the replica.
    pub fn send_rpc(
        &self,
        replica_id: ReplicaId,
        component_idx: u8,
        method_id: u8,
        args: &BitStream,
        transport: &mut dyn ClientTransport,
    ) -> Result<(), ProtocolError> {
        let mut msg = begin_message(MessageId::ReplicaRpc);
        msg.write_u32(replica_id.raw());
        msg.write_u8(component_idx);
        msg.write_u8(method_id);
        msg.append(args);

        let bytes = finish_message(msg)?;
        transport.send(&bytes, Reliability::ReliableOrdered);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::net::server::{ServerReplicaManager, ServerSettings};
    use crate::net::transport::{ConnectionId, LoopbackClientTransport, LoopbackServerTransport};
    use crate::replica::prefab::{PrefabRegistry, PrefabTemplate};
    use crate::replica::test_behaviors::{
        init_test_logging, FaultyBehavior, LastWordsBehavior, SpyBehavior, TransformBehavior,
    };
    use crate::replica::view::ReplicaView;
    use crate::util::vec3::Vec3;

    fn test_registry() -> Arc<PrefabRegistry> {
        let mut registry = PrefabRegistry::new();
        registry.register(PrefabTemplate::new("ball").with_behavior(TransformBehavior::default));
        Arc::new(registry)
    }

    fn client_with(registry: Arc<PrefabRegistry>) -> ClientReplicaManager {
        ClientReplicaManager::new(registry, ReplicationConfig::default())
    }

    /// Full-update message as the server would send it
    fn update_message(replica_id: u32, prefab_idx: u16, is_owner: bool, position: Vec3) -> Vec<u8> {
        let mut msg = begin_message(MessageId::ReplicaUpdate);
        msg.write_bool(false); // dynamic
        msg.write_u16(prefab_idx);
        msg.write_u32(replica_id);
        msg.write_bool(is_owner);
        msg.write_bool(true); // full
        msg.write_vec3(position);
        msg.write_quat(crate::util::vec3::Quat::IDENTITY);
        msg.write_u32(100); // health
        finish_message(msg).unwrap()
    }

    #[test]
    fn test_scene_ids_match_server_without_traffic() {
        let scene = || {
            SceneDefinition::new()
                .with_replica(3, PrefabTemplate::new("door").with_behavior(TransformBehavior::default))
                .with_replica(1, PrefabTemplate::new("lift").with_behavior(TransformBehavior::default))
        };
        let mut server = ServerReplicaManager::new(test_registry(), ServerSettings::default());
        server.load_scene(&scene());
        let mut client = client_with(test_registry());
        client.load_scene(&scene());

        assert_eq!(client.replica_count(), 2);
        for idx in [1u8, 3] {
            let id = ReplicaId::from_scene_index(idx);
            assert!(server.replica(id).is_some());
            assert!(client.replica(id).is_some());
        }
    }

    #[test]
    fn test_unknown_prefab_constructs_nothing() {
        let mut client = client_with(test_registry());
        let msg = update_message(300, 42, false, Vec3::ZERO);

        client.handle_message(&msg, 0.0).unwrap();
        assert_eq!(client.replica_count(), 0);
    }

    #[test]
    fn test_update_constructs_and_applies_state() {
        let mut client = client_with(test_registry());
        let msg = update_message(300, 0, true, Vec3::new(4.0, 5.0, 6.0));

        client.handle_message(&msg, 2.5).unwrap();
        let replica = client.replica(ReplicaId::from_raw(300)).unwrap();
        assert!(replica.is_owner_local());
        assert_eq!(replica.last_update_time, 2.5);
        assert_eq!(replica.behavior_count(), 1);
    }

    #[test]
    fn test_repeated_full_update_is_idempotent() {
        let mut client = client_with(test_registry());
        let msg = update_message(300, 0, false, Vec3::new(4.0, 5.0, 6.0));

        client.handle_message(&msg, 1.0).unwrap();
        client.handle_message(&msg, 2.0).unwrap();
        assert_eq!(client.replica_count(), 1);
        assert_eq!(
            client.replica(ReplicaId::from_raw(300)).unwrap().last_update_time,
            2.0
        );
    }

    #[test]
    fn test_repeated_partial_update_is_idempotent() {
        let mut client = client_with(test_registry());
        client.handle_message(&update_message(300, 0, false, Vec3::ZERO), 0.0).unwrap();

        let mut partial = begin_message(MessageId::ReplicaUpdate);
        partial.write_bool(false);
        partial.write_u16(0);
        partial.write_u32(300);
        partial.write_bool(false);
        partial.write_bool(false); // partial: position only
        partial.write_vec3(Vec3::new(8.0, 0.0, 8.0));
        let bytes = finish_message(partial).unwrap();

        let snapshot = |client: &ClientReplicaManager| {
            let mut bs = BitStream::new();
            let ctx = crate::replica::behavior::SerializeContext {
                mode: SerializeMode::Full,
                observer: ConnectionId::INVALID,
                observer_is_owner: false,
            };
            client
                .replica(ReplicaId::from_raw(300))
                .unwrap()
                .serialize(&mut bs, &ctx)
                .unwrap();
            bs.to_bytes()
        };

        client.handle_message(&bytes, 1.0).unwrap();
        let once = snapshot(&client);
        client.handle_message(&bytes, 2.0).unwrap();
        assert_eq!(snapshot(&client), once);
        assert_eq!(client.replica_count(), 1);
    }

    #[test]
    fn test_deserialize_fault_keeps_replica_and_liveness() {
        init_test_logging();
        let mut registry = PrefabRegistry::new();
        registry.register(PrefabTemplate::new("faulty").with_behavior(|| FaultyBehavior {
            fail_deserialize: true,
            ..Default::default()
        }));
        let mut client = client_with(Arc::new(registry));

        let mut msg = begin_message(MessageId::ReplicaUpdate);
        msg.write_bool(false);
        msg.write_u16(0);
        msg.write_u32(300);
        msg.write_bool(false);
        msg.write_bool(true);
        msg.write_u8(0);
        let bytes = finish_message(msg).unwrap();

        client.handle_message(&bytes, 7.0).unwrap();
        let replica = client.replica(ReplicaId::from_raw(300)).unwrap();
        assert_eq!(replica.last_update_time, 7.0);
    }

    #[test]
    fn test_inactivity_timeout_dynamic_only() {
        let scene = SceneDefinition::new()
            .with_replica(1, PrefabTemplate::new("door").with_behavior(TransformBehavior::default));
        let mut client = client_with(test_registry());
        client.load_scene(&scene);
        client.handle_message(&update_message(300, 0, false, Vec3::ZERO), 0.0).unwrap();
        assert_eq!(client.replica_count(), 2);

        // Default interval 0.1s gives a 3s window; sweep just inside it
        client.update(2.9);
        assert_eq!(client.replica_count(), 2);

        // Well past the window: the dynamic replica goes, the scene one stays
        client.update(10.0);
        assert_eq!(client.replica_count(), 1);
        assert!(client.replica(ReplicaId::from_scene_index(1)).is_some());
    }

    #[test]
    fn test_timeout_sweep_is_throttled() {
        let mut client = client_with(test_registry());
        client.handle_message(&update_message(300, 0, false, Vec3::ZERO), 0.0).unwrap();

        client.update(2.9); // sweeps, replica still inside the window
        assert_eq!(client.replica_count(), 1);
        client.update(3.5); // past the window, but the sweep is throttled
        assert_eq!(client.replica_count(), 1);
        client.update(4.0); // next sweep fires
        assert_eq!(client.replica_count(), 0);
    }

    #[test]
    fn test_destroy_batch_runs_destruction_payloads() {
        let talker = LastWordsBehavior::new(0);
        let received = talker.received();
        let mut registry = PrefabRegistry::new();
        registry.register(PrefabTemplate::new("talker").with_behavior(move || talker.clone()));
        let mut client = client_with(Arc::new(registry));

        let mut msg = begin_message(MessageId::ReplicaUpdate);
        msg.write_bool(false);
        msg.write_u16(0);
        msg.write_u32(300);
        msg.write_bool(false);
        msg.write_bool(true);
        client.handle_message(&finish_message(msg).unwrap(), 0.0).unwrap();

        let mut destroy = begin_message(MessageId::ReplicaDestroy);
        destroy.write_u32(300);
        let offset_pos = destroy.write_pos();
        destroy.write_u16(0);
        destroy.write_u32(77); // farewell payload
        destroy.align_write_to_byte();
        let end = destroy.write_pos();
        destroy.set_write_pos(offset_pos);
        destroy.write_u16((end / 8) as u16);
        destroy.set_write_pos(end);

        client.handle_message(&finish_message(destroy).unwrap(), 0.1).unwrap();
        assert_eq!(client.replica_count(), 0);
        assert_eq!(received.get(), 77);
    }

    #[test]
    fn test_destroy_batch_resyncs_past_malformed_entry() {
        let mut client = client_with(test_registry());
        client.handle_message(&update_message(300, 0, false, Vec3::ZERO), 0.0).unwrap();
        client.handle_message(&update_message(301, 0, false, Vec3::ZERO), 0.0).unwrap();

        // First entry is for an unknown replica and carries garbage payload;
        // the offset still walks the reader to the valid second entry.
        let mut destroy = begin_message(MessageId::ReplicaDestroy);
        for id in [999u32, 301] {
            destroy.write_u32(id);
            let offset_pos = destroy.write_pos();
            destroy.write_u16(0);
            if id == 999 {
                destroy.write_u64(0xBAAD_F00D_BAAD_F00D); // garbage
            }
            destroy.align_write_to_byte();
            let end = destroy.write_pos();
            destroy.set_write_pos(offset_pos);
            destroy.write_u16((end / 8) as u16);
            destroy.set_write_pos(end);
        }

        client.handle_message(&finish_message(destroy).unwrap(), 0.1).unwrap();
        assert!(client.replica(ReplicaId::from_raw(300)).is_some());
        assert!(client.replica(ReplicaId::from_raw(301)).is_none());
    }

    #[test]
    fn test_send_rpc_wire_format() {
        let client = client_with(test_registry());
        let mut transport = LoopbackClientTransport::new();
        let mut args = BitStream::new();
        args.write_u32(1234);

        client
            .send_rpc(ReplicaId::from_raw(300), 2, 5, &args, &mut transport)
            .unwrap();

        let frames = transport.drain();
        let (message_id, mut bs) = open_message(&frames[0]).unwrap();
        assert_eq!(message_id, MessageId::ReplicaRpc);
        assert_eq!(bs.read_u32().unwrap(), 300);
        assert_eq!(bs.read_u8().unwrap(), 2);
        assert_eq!(bs.read_u8().unwrap(), 5);
        assert_eq!(bs.read_u32().unwrap(), 1234);
    }

    // ========================================================================
    // End to end over the loopback transport
    // ========================================================================

    #[test]
    fn test_spawn_tick_mirror_roundtrip() {
        let registry = test_registry();
        let mut server = ServerReplicaManager::new(Arc::clone(&registry), ServerSettings::default());
        let mut server_transport = LoopbackServerTransport::new();
        let conn = server_transport.connect(b"").unwrap();
        server.add_view(ReplicaView::new(conn));

        let mut client = client_with(registry);

        let id = server.spawn(0).unwrap();
        server.replica_mut(id).unwrap().position = Vec3::new(1.0, 2.0, 3.0);

        server.update(0.016, &mut server_transport);
        for frame in server_transport.drain(conn) {
            client.handle_message(&frame, 0.016).unwrap();
        }
        assert_eq!(client.replica_count(), 1);
        assert!(client.replica(id).is_some());

        // Second tick is partial and changes nothing observable
        server.update(0.016, &mut server_transport);
        for frame in server_transport.drain(conn) {
            let (message_id, mut bs) = open_message(&frame).unwrap();
            assert_eq!(message_id, MessageId::ReplicaUpdate);
            bs.read_bool().unwrap();
            bs.read_u16().unwrap();
            bs.read_u32().unwrap();
            bs.read_bool().unwrap();
            assert!(!bs.read_bool().unwrap());
            client.handle_message(&frame, 0.032).unwrap();
        }
        assert_eq!(client.replica_count(), 1);
    }

    #[test]
    fn test_client_rpc_reaches_server_behavior() {
        let spy = SpyBehavior::new();
        let calls = spy.calls();
        let mut registry = PrefabRegistry::new();
        registry.register(PrefabTemplate::new("spy").with_behavior(move || spy.clone()));
        let registry = Arc::new(registry);

        let mut server =
            ServerReplicaManager::new(Arc::clone(&registry), ServerSettings::default());
        let conn = ConnectionId(1);
        let id = server.spawn(0).unwrap();
        server.replica_mut(id).unwrap().assign_ownership(conn);

        let client = client_with(registry);
        let mut client_transport = LoopbackClientTransport::new();
        let mut args = BitStream::new();
        args.write_u32(400);
        client.send_rpc(id, 0, 9, &args, &mut client_transport).unwrap();

        for frame in client_transport.drain() {
            server.handle_message(conn, &frame).unwrap();
        }
        assert_eq!(&*calls.borrow(), &[(9, 400)]);
    }
}
