//! Per-connection observer state
//!
//! One view exists on the server for each connected client; it carries the
//! connection identity and the spatial proxy relevance scoring reads. Views
//! are created when a connection is approved and destroyed when it ends.

use crate::net::transport::ConnectionId;
use crate::util::vec3::Vec3;

#[derive(Debug, Clone)]
pub struct ReplicaView {
    pub connection: ConnectionId,
    /// World position of the observing player (or camera)
    pub position: Vec3,
    /// Facing direction; feeds the peripheral-visibility term of relevance
    pub forward: Vec3,
    /// Debug/spectator flag: score every replica as if it were at the view's
    /// position
    pub ignore_replica_positions_for_priority: bool,
}

impl ReplicaView {
    pub fn new(connection: ConnectionId) -> Self {
        Self {
            connection,
            position: Vec3::ZERO,
            forward: Vec3::FORWARD,
            ignore_replica_positions_for_priority: false,
        }
    }
}
