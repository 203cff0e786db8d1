//! Message: payload delivery between endowed peers
//!
//! The application body travels JSON-encoded under the crypt tail, sealed
//! with the session keys established by the endow exchange. Delivery is
//! acked; received bodies are appended to the stack's inbound message queue.

use std::time::Duration;

use crate::error::{Result, StackError, TransactionError};
use crate::protocol::packet::{Body, BodyKind, ExchangeKind, Packet, PacketKind, Route, TailKind};
use crate::protocol::transaction::{Disposition, TransactionCore, TransactionIndex};
use crate::stack::StackCore;

/// Initiator side of a message exchange
#[derive(Debug)]
pub struct Messenger {
    pub core: TransactionCore,
    peer_id: u32,
}

impl Messenger {
    /// Queue a message body toward an endowed peer
    pub fn start(
        core: &mut StackCore,
        peer_id: u32,
        body: Body,
        timeout: Option<Duration>,
    ) -> Result<Self> {
        let local_id = core.local.id;
        let local_addr = core.local.addr;
        let peer = core
            .registry
            .get_mut(peer_id)
            .ok_or(StackError::UnknownPeer { id: peer_id })?;
        if !peer.endowed {
            return Err(TransactionError::NotEndowed { id: peer_id }.into());
        }
        let sid = peer.sid;
        let tid = peer.next_tid();
        let peer_addr = peer.addr;

        let index = TransactionIndex {
            remote_initiated: false,
            local_id,
            remote_id: peer_id,
            sid,
            tid,
            broadcast: false,
        };
        let mut messenger = Self {
            core: TransactionCore::new(index, timeout),
            peer_id,
        };

        let mut packet = Packet::new(ExchangeKind::Message, PacketKind::Message);
        packet.kinds.tail = TailKind::Crypt;
        packet.route = Route::between(local_addr, peer_addr, local_id, peer_id, sid, tid);
        packet.body = body;

        messenger.core.last_tx = Some(core.transmit(&packet, peer_addr)?);
        tracing::debug!(peer_id, tid, "message sent");
        Ok(messenger)
    }

    pub fn receive(
        &mut self,
        _core: &mut StackCore,
        packet: &Packet,
    ) -> std::result::Result<Disposition, TransactionError> {
        match packet.kind {
            PacketKind::Ack => {
                self.core.last_rx = Some(packet.clone());
                tracing::debug!(peer_id = self.peer_id, "message delivered");
                Ok(Disposition::Complete)
            }
            kind => {
                tracing::trace!(kind = kind.name(), "messenger ignoring unexpected packet");
                Ok(Disposition::Continue)
            }
        }
    }
}

/// Correspondent side of a message exchange
///
/// Completes in one step: the decoded body goes to the stack's inbound queue
/// and the ack goes back out.
#[derive(Debug)]
pub struct Messengent {
    pub core: TransactionCore,
    peer_id: u32,
}

impl Messengent {
    /// Deliver a received message body and ack it
    pub fn start(core: &mut StackCore, packet: &Packet) -> Result<Self> {
        let peer_id = packet.route.src_id;
        let peer = core
            .registry
            .get(peer_id)
            .ok_or(StackError::UnknownPeer { id: peer_id })?;
        if !peer.endowed {
            return Err(TransactionError::NotEndowed { id: peer_id }.into());
        }
        let peer_addr = peer.addr;

        let mut messengent = Self {
            core: TransactionCore::new(TransactionIndex::from_packet(packet), None),
            peer_id,
        };
        messengent.core.last_rx = Some(packet.clone());

        core.push_message(peer_id, packet.body.clone());
        messengent.send_ack(core, packet, peer_addr)?;
        tracing::debug!(peer_id, "message received");
        Ok(messengent)
    }

    fn send_ack(
        &mut self,
        core: &mut StackCore,
        message: &Packet,
        to: std::net::SocketAddr,
    ) -> Result<()> {
        let mut ack = Packet::new(ExchangeKind::Message, PacketKind::Ack);
        ack.kinds.body = BodyKind::None;
        ack.flags.correspondent = true;
        ack.route = Route::between(
            core.local.addr,
            to,
            message.route.dst_id,
            message.route.src_id,
            message.route.sid,
            message.route.tid,
        );
        self.core.last_tx = Some(core.transmit(&ack, to)?);
        Ok(())
    }

    /// A retransmitted message is acked again without redelivery
    pub fn receive(
        &mut self,
        core: &mut StackCore,
        packet: &Packet,
    ) -> std::result::Result<Disposition, TransactionError> {
        if packet.kind == PacketKind::Message {
            let peer_addr = core
                .registry
                .get(self.peer_id)
                .map(|peer| peer.addr)
                .ok_or(TransactionError::NotEndowed { id: self.peer_id })?;
            if let Err(error) = self.send_ack(core, packet, peer_addr) {
                tracing::debug!(%error, "re-ack of message failed");
            }
        } else {
            tracing::trace!(
                kind = packet.kind.name(),
                "messengent ignoring unexpected packet"
            );
        }
        Ok(Disposition::Continue)
    }
}

#[cfg(test)]
impl Messenger {
    /// Bare transaction with a caller-chosen index, for table tests
    pub(crate) fn stub(index: TransactionIndex) -> Self {
        Self {
            core: TransactionCore::new(index, None),
            peer_id: index.remote_id,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_message_requires_endowed_peer() {
        let mut core = StackCore::for_tests(2, "127.0.0.1:7531".parse().unwrap());
        let peer_addr: std::net::SocketAddr = "127.0.0.1:7530".parse().unwrap();
        let mut peer = crate::protocol::peer::RemotePeer::new(1, peer_addr);
        peer.accepted = true;
        core.registry.insert(peer).unwrap();

        let result = Messenger::start(&mut core, 1, Body::new(), None);
        assert!(matches!(
            result,
            Err(crate::error::TetherError::Transaction(
                TransactionError::NotEndowed { id: 1 }
            ))
        ));
    }
}
