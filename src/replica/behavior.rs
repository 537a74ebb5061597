//! Behavior capability interface
//!
//! A replica carries an ordered set of behaviors. Each behavior owns one wire
//! payload slot and any RPC methods addressed to it; the slot index assigned
//! at attach time is the only key both peers share, so attach order must be
//! identical on server and client (it is, because both construct from the
//! same prefab or scene definition).

use crate::net::bitstream::{BitStream, BitStreamError};
use crate::net::transport::ConnectionId;

/// Full snapshot (construction) vs. incremental delta (steady state)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SerializeMode {
    /// Complete state; sent the first time a view sees the replica
    Full,
    /// Changed/high-frequency fields only; rarely-changing fields may be
    /// omitted and keep their last received value on the client
    Partial,
}

/// Per-message context handed to behavior serialization
#[derive(Debug, Clone, Copy)]
pub struct SerializeContext {
    pub mode: SerializeMode,
    /// Connection the payload is addressed to
    pub observer: ConnectionId,
    /// Whether the observer owns the replica (owner-only fields)
    pub observer_is_owner: bool,
}

/// Recipients of a server-issued RPC
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RpcTarget {
    /// Only the owning connection
    Owner,
    /// Every connected view
    All,
    /// Every connected view except the owner
    AllExceptOwner,
}

/// Failure of one behavior's wire hook. Managers isolate these per replica:
/// one faulting entry never aborts the rest of a tick or batch.
#[derive(Debug, thiserror::Error)]
pub enum BehaviorError {
    #[error(transparent)]
    Stream(#[from] BitStreamError),
    #[error("Behavior fault: {0}")]
    Fault(&'static str),
}

/// One replicated behavior slot.
///
/// Lifecycle hooks are invoked by the owning manager (attach on registration,
/// tick once per frame on the server, detach on removal); wire hooks run in
/// slot order for every update message.
pub trait ReplicaBehavior {
    fn on_attach(&mut self) {}

    fn on_tick(&mut self, _dt: f32) {}

    fn on_detach(&mut self) {}

    /// Write this behavior's payload. Partial mode may write nothing.
    fn serialize(&self, bs: &mut BitStream, ctx: &SerializeContext) -> Result<(), BehaviorError>;

    /// Read the payload written by the server-side counterpart
    fn deserialize(&mut self, bs: &mut BitStream, mode: SerializeMode) -> Result<(), BehaviorError>;

    /// Final state written when the replica is destroyed (death effects etc.)
    fn serialize_destruction(&self, _bs: &mut BitStream) -> Result<(), BehaviorError> {
        Ok(())
    }

    fn deserialize_destruction(&mut self, _bs: &mut BitStream) -> Result<(), BehaviorError> {
        Ok(())
    }

    /// Invoke a method by its stable index, consuming arguments from `bs`
    fn dispatch_rpc(&mut self, method_id: u8, _bs: &mut BitStream) -> Result<(), BehaviorError> {
        tracing::warn!(method_id, "RPC addressed to behavior with no methods");
        Ok(())
    }
}
