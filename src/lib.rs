//! Replica Net
//!
//! A transport-agnostic entity replication engine for real-time multiplayer
//! games. The server owns the authoritative world; clients mirror it from
//! prioritized partial updates, with RPCs for events and batched destroy
//! notifications for teardown.

pub mod config;
pub mod net;
pub mod replica;
pub mod util;

pub use config::ReplicationConfig;
pub use net::bitstream::BitStream;
pub use net::client::ClientReplicaManager;
pub use net::server::{ServerReplicaManager, ServerSettings};
pub use net::transport::{ClientTransport, ConnectionId, Reliability, ServerTransport};
pub use replica::behavior::{
    BehaviorError, ReplicaBehavior, RpcTarget, SerializeContext, SerializeMode,
};
pub use replica::id::ReplicaId;
pub use replica::prefab::{PrefabRegistry, PrefabTemplate, SceneDefinition};
pub use replica::replica::{Replica, ReplicaSettings, Role};
pub use replica::view::ReplicaView;
