//! Transaction identity and dispatch
//!
//! A transaction is one multi-step protocol exchange. Each is keyed by a
//! composite index that must be unique among live transactions on a stack,
//! carries a deadline, and retains the last transmitted datagram. The six
//! concrete roles (initiator and correspondent for join, endow, and message)
//! are dispatched through a tagged enum.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use crate::error::TransactionError;
use crate::protocol::endow::{Endowent, Endower};
use crate::protocol::join::{Joinent, Joiner};
use crate::protocol::message::{Messengent, Messenger};
use crate::protocol::packet::Packet;
use crate::stack::StackCore;

/// Default transaction timeout
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);

/// Composite transaction index
///
/// Unique among concurrently live transactions; a collision on add is a
/// caller error. For an inbound packet the index is derived from the head:
/// the remote-initiated flag is the inverse of the sender's correspondent
/// flag, and local/remote ids come from the destination/source ids.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TransactionIndex {
    /// The exchange was initiated by the remote side
    pub remote_initiated: bool,
    pub local_id: u32,
    pub remote_id: u32,
    pub sid: u32,
    pub tid: u32,
    pub broadcast: bool,
}

impl TransactionIndex {
    /// Derive the table-lookup index from a received packet's head
    pub fn from_packet(packet: &Packet) -> Self {
        Self {
            remote_initiated: !packet.flags.correspondent,
            local_id: packet.route.dst_id,
            remote_id: packet.route.src_id,
            sid: packet.route.sid,
            tid: packet.route.tid,
            broadcast: packet.flags.broadcast,
        }
    }
}

impl std::fmt::Display for TransactionIndex {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "({}, le={}, re={}, si={}, ti={}, bf={})",
            if self.remote_initiated { "rmt" } else { "lcl" },
            self.local_id,
            self.remote_id,
            self.sid,
            self.tid,
            self.broadcast
        )
    }
}

static NEXT_SERIAL: AtomicU64 = AtomicU64::new(1);

/// Shared per-transaction state
#[derive(Debug)]
pub struct TransactionCore {
    pub index: TransactionIndex,
    /// Instance identity, used by the table's defensive remove
    pub serial: u64,
    pub timeout: Duration,
    pub deadline: Instant,
    /// Last transmitted datagram, retained for a potential retry policy
    pub last_tx: Option<Vec<u8>>,
    /// Last received packet
    pub last_rx: Option<Packet>,
}

impl TransactionCore {
    pub fn new(index: TransactionIndex, timeout: Option<Duration>) -> Self {
        let timeout = timeout.unwrap_or(DEFAULT_TIMEOUT);
        Self {
            index,
            serial: NEXT_SERIAL.fetch_add(1, Ordering::Relaxed),
            timeout,
            deadline: Instant::now() + timeout,
            last_tx: None,
            last_rx: None,
        }
    }

    pub fn expired(&self, now: Instant) -> bool {
        now >= self.deadline
    }

    /// Push the deadline out by one timeout period
    pub fn extend_deadline(&mut self) {
        self.deadline = Instant::now() + self.timeout;
    }
}

/// What a transaction wants done with itself after processing a packet
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// Keep the transaction in the table
    Continue,
    /// The exchange reached a terminal state; remove it
    Complete,
}

/// Deadline check result for one service tick
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tick {
    Alive,
    /// Deadline elapsed without completing: evict with a timeout error
    Expired,
    /// A completed transaction's linger period elapsed: evict silently
    Lingered,
}

/// Tagged union over the six transaction roles
#[derive(Debug)]
pub enum Transaction {
    Joiner(Joiner),
    Joinent(Joinent),
    Endower(Endower),
    Endowent(Endowent),
    Messenger(Messenger),
    Messengent(Messengent),
}

impl Transaction {
    pub fn core(&self) -> &TransactionCore {
        match self {
            Self::Joiner(t) => &t.core,
            Self::Joinent(t) => &t.core,
            Self::Endower(t) => &t.core,
            Self::Endowent(t) => &t.core,
            Self::Messenger(t) => &t.core,
            Self::Messengent(t) => &t.core,
        }
    }

    pub fn index(&self) -> TransactionIndex {
        self.core().index
    }

    pub fn serial(&self) -> u64 {
        self.core().serial
    }

    pub fn kind_name(&self) -> &'static str {
        match self {
            Self::Joiner(_) => "joiner",
            Self::Joinent(_) => "joinent",
            Self::Endower(_) => "endower",
            Self::Endowent(_) => "endowent",
            Self::Messenger(_) => "messenger",
            Self::Messengent(_) => "messengent",
        }
    }

    /// Dispatch a received packet to the role's state machine
    pub fn receive(
        &mut self,
        core: &mut StackCore,
        packet: &Packet,
    ) -> Result<Disposition, TransactionError> {
        match self {
            Self::Joiner(t) => t.receive(core, packet),
            Self::Joinent(t) => t.receive(core, packet),
            Self::Endower(t) => t.receive(core, packet),
            Self::Endowent(t) => t.receive(core, packet),
            Self::Messenger(t) => t.receive(core, packet),
            Self::Messengent(t) => t.receive(core, packet),
        }
    }

    /// Check the deadline; called once per service cycle for every live
    /// transaction, uniformly across roles
    pub fn tick(&self, now: Instant) -> Tick {
        match self {
            Self::Endowent(t) => t.tick(now),
            // A messengent has already delivered and acked; its table entry
            // only lingers to absorb retransmits
            Self::Messengent(t) => {
                if t.core.expired(now) {
                    Tick::Lingered
                } else {
                    Tick::Alive
                }
            }
            other => {
                if other.core().expired(now) {
                    Tick::Expired
                } else {
                    Tick::Alive
                }
            }
        }
    }
}

/// Read a required string field from a packet or sealed-content body
pub(crate) fn body_str<'a>(
    body: &'a crate::protocol::packet::Body,
    packet: &'static str,
    field: &'static str,
) -> Result<&'a str, TransactionError> {
    body.get(field)
        .and_then(serde_json::Value::as_str)
        .ok_or(TransactionError::MissingField { packet, field })
}

/// Read a required u32 field from a packet or sealed-content body
pub(crate) fn body_u32(
    body: &crate::protocol::packet::Body,
    packet: &'static str,
    field: &'static str,
) -> Result<u32, TransactionError> {
    body.get(field)
        .and_then(serde_json::Value::as_u64)
        .map(|v| v as u32)
        .ok_or(TransactionError::MissingField { packet, field })
}

/// Read a required hex field and decode it
pub(crate) fn body_hex(
    body: &crate::protocol::packet::Body,
    packet: &'static str,
    field: &'static str,
) -> Result<Vec<u8>, TransactionError> {
    let text = body_str(body, packet, field)?;
    hex::decode(text).map_err(|_| TransactionError::Crypto(crate::error::CryptoError::Decryption))
}

/// Read a required hex field that must decode to exactly N bytes
pub(crate) fn body_hex_array<const N: usize>(
    body: &crate::protocol::packet::Body,
    packet: &'static str,
    field: &'static str,
) -> Result<[u8; N], TransactionError> {
    let bytes = body_hex(body, packet, field)?;
    let got = bytes.len();
    bytes.try_into().map_err(|_| {
        TransactionError::Crypto(crate::error::CryptoError::InvalidKeyLength { expected: N, got })
    })
}
