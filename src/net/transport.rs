//! Transport seam
//!
//! The replication core never talks to a socket. It hands finished message
//! bytes to a [`ServerTransport`]/[`ClientTransport`] together with the
//! reliability mode the channel needs, and the host feeds inbound payloads
//! back into the managers with the connection id attached. A loopback
//! implementation is provided for in-process tests.

use std::collections::VecDeque;

use rustc_hash::FxHashMap;

/// Identifies one connected peer on the server. Zero is reserved as invalid
/// (a replica with an invalid owner is unowned).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct ConnectionId(pub u64);

impl ConnectionId {
    pub const INVALID: ConnectionId = ConnectionId(0);

    pub fn is_valid(self) -> bool {
        self.0 != 0
    }
}

/// Delivery guarantees the transport must provide per channel
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reliability {
    /// Fire and forget (steady-state replica updates)
    Unreliable,
    /// Unreliable, but stale packets are dropped on arrival
    UnreliableSequenced,
    /// Delivered eventually, any order
    ReliableUnordered,
    /// Delivered eventually, in send order (RPCs, destroy messages)
    ReliableOrdered,
    /// Delivered in order, stale packets dropped
    ReliableSequenced,
}

/// Outcome of a connection approval check. A rejection creates no state;
/// the reason is sent back to the requester by the transport.
#[derive(Debug, Clone)]
pub struct ApprovalResult {
    pub approved: bool,
    pub denial_reason: Option<String>,
}

impl ApprovalResult {
    pub fn approved() -> Self {
        Self {
            approved: true,
            denial_reason: None,
        }
    }

    pub fn denied(reason: impl Into<String>) -> Self {
        Self {
            approved: false,
            denial_reason: Some(reason.into()),
        }
    }
}

/// Server-side send surface
pub trait ServerTransport {
    fn send(&mut self, conn: ConnectionId, data: &[u8], reliability: Reliability);

    fn broadcast(&mut self, data: &[u8], reliability: Reliability);
}

/// Client-side send surface
pub trait ClientTransport {
    fn send(&mut self, data: &[u8], reliability: Reliability);
}

// ============================================================================
// Loopback (in-process test transport)
// ============================================================================

/// In-memory server transport: frames queue per connection and are drained
/// synchronously by the test driving the tick.
#[derive(Default)]
pub struct LoopbackServerTransport {
    queues: FxHashMap<ConnectionId, VecDeque<Vec<u8>>>,
    approval: Option<Box<dyn Fn(&[u8]) -> ApprovalResult>>,
    next_conn: u64,
}

impl LoopbackServerTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Install a connection approval check (default: approve everything)
    pub fn set_approval_handler(&mut self, handler: impl Fn(&[u8]) -> ApprovalResult + 'static) {
        self.approval = Some(Box::new(handler));
    }

    /// Establish a connection, running the approval check against `hello`
    pub fn connect(&mut self, hello: &[u8]) -> Result<ConnectionId, String> {
        if let Some(approval) = &self.approval {
            let result = approval(hello);
            if !result.approved {
                return Err(result
                    .denial_reason
                    .unwrap_or_else(|| "connection denied".to_string()));
            }
        }
        self.next_conn += 1;
        let conn = ConnectionId(self.next_conn);
        self.queues.insert(conn, VecDeque::new());
        Ok(conn)
    }

    /// Drop a connection and discard its buffered frames
    pub fn disconnect(&mut self, conn: ConnectionId) {
        self.queues.remove(&conn);
    }

    /// Take all frames queued for one connection
    pub fn drain(&mut self, conn: ConnectionId) -> Vec<Vec<u8>> {
        self.queues
            .get_mut(&conn)
            .map(|q| q.drain(..).collect())
            .unwrap_or_default()
    }
}

impl ServerTransport for LoopbackServerTransport {
    fn send(&mut self, conn: ConnectionId, data: &[u8], _reliability: Reliability) {
        if let Some(queue) = self.queues.get_mut(&conn) {
            queue.push_back(data.to_vec());
        }
    }

    fn broadcast(&mut self, data: &[u8], _reliability: Reliability) {
        for queue in self.queues.values_mut() {
            queue.push_back(data.to_vec());
        }
    }
}

/// Client end of the loopback: outbound frames buffer here and the test moves
/// them into the server's `handle_message`.
#[derive(Debug, Default)]
pub struct LoopbackClientTransport {
    outbox: VecDeque<Vec<u8>>,
}

impl LoopbackClientTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn drain(&mut self) -> Vec<Vec<u8>> {
        self.outbox.drain(..).collect()
    }
}

impl ClientTransport for LoopbackClientTransport {
    fn send(&mut self, data: &[u8], _reliability: Reliability) {
        self.outbox.push_back(data.to_vec());
    }
}
