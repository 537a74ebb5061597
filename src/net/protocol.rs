//! Logical message channels
//!
//! Every replication message starts with a one-byte [`MessageId`]; the rest
//! of the payload is a bit-packed body owned by the sending manager. Message
//! layouts:
//!
//! - `ReplicaUpdate` (server→client, unreliable): `is_scene: bool`,
//!   `prefab_idx: u16` when dynamic, `replica_id: u32`, `is_owner: bool`,
//!   `is_full: bool`, then behavior payloads in slot order.
//! - `ReplicaRpc` (either direction, reliable ordered): `replica_id: u32`,
//!   `component_idx: u8`, `method_id: u8`, argument payload.
//! - `ReplicaDestroy` (server→client, reliable ordered, batched): repeated
//!   `{ replica_id: u32, next_entry_offset: u16 (bytes), destruction
//!   payload, byte padding }`. The offset lets a reader resync past a
//!   malformed entry and keep parsing the rest of the batch.

use crate::net::bitstream::{BitStream, BitStreamError};

/// Upper bound for a single replication message, matching a conservative
/// MTU-sized datagram budget
pub const MAX_MESSAGE_SIZE: usize = 1400;

/// First byte of every replication message
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MessageId {
    ReplicaUpdate = 1,
    ReplicaRpc = 2,
    ReplicaDestroy = 3,
}

#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("Unknown message id {0}")]
    UnknownMessageId(u8),
    #[error("Message too large: {0} bytes (max {1})")]
    MessageTooLarge(usize, usize),
    #[error(transparent)]
    Stream(#[from] BitStreamError),
}

impl MessageId {
    pub fn from_u8(value: u8) -> Result<Self, ProtocolError> {
        match value {
            1 => Ok(MessageId::ReplicaUpdate),
            2 => Ok(MessageId::ReplicaRpc),
            3 => Ok(MessageId::ReplicaDestroy),
            other => Err(ProtocolError::UnknownMessageId(other)),
        }
    }
}

/// Start a message body with its id byte
pub fn begin_message(id: MessageId) -> BitStream {
    let mut bs = BitStream::new();
    bs.write_u8(id as u8);
    bs
}

/// Byte-align and extract the finished message, enforcing the size cap
pub fn finish_message(mut bs: BitStream) -> Result<Vec<u8>, ProtocolError> {
    bs.align_write_to_byte();
    let bytes = bs.to_bytes();
    if bytes.len() > MAX_MESSAGE_SIZE {
        return Err(ProtocolError::MessageTooLarge(bytes.len(), MAX_MESSAGE_SIZE));
    }
    Ok(bytes)
}

/// Wrap an inbound payload and consume its id byte
pub fn open_message(data: &[u8]) -> Result<(MessageId, BitStream), ProtocolError> {
    let mut bs = BitStream::from_bytes(data);
    let id = MessageId::from_u8(bs.read_u8()?)?;
    Ok((id, bs))
}
