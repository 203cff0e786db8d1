//! Transport protocol implementation
//!
//! This module contains the core protocol components:
//! - Packet wire format (head/neck/body/tail framing)
//! - Peer state and registry
//! - Transaction identity and dispatch
//! - The join, endow, and message exchanges

pub mod endow;
pub mod join;
pub mod message;
pub mod packet;
pub mod peer;
pub mod transaction;

pub use endow::{Endowent, Endower};
pub use join::{Joinent, Joiner};
pub use message::{Messengent, Messenger};
pub use packet::{
    Body, BodyKind, ExchangeKind, Flags, HeadKind, Kinds, NeckKind, Packet, PacketKind, Route,
    TailKind,
};
pub use peer::{LocalPeer, PeerRegistry, RemotePeer, SessionKeys};
pub use transaction::{Disposition, Tick, Transaction, TransactionCore, TransactionIndex};
