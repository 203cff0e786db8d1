//! Join: the identity handshake
//!
//! Establishes that two peers know of each other and exchange long-term
//! public keys. The initiator (Joiner) sends its verify/encrypt public keys;
//! the correspondent (Joinent) acks, assigns a device id, and responds with
//! the id pair and its own public keys.
//!
//! Join runs on the bootstrap sequence id 0 and keeps the provisional peer
//! ids in the head (`de = 0` toward the master); the real ids travel in the
//! response body as `ldid`/`rdid`, named from the sender's perspective.

use std::time::Duration;

use serde_json::Value;

use crate::crypto::signing;
use crate::error::{Result, StackError, TransactionError};
use crate::protocol::packet::{
    BodyKind, ExchangeKind, Packet, PacketKind, Route,
};
use crate::protocol::peer::{RemotePeer, BOOTSTRAP_ID};
use crate::protocol::transaction::{
    body_hex_array, body_u32, Disposition, TransactionCore, TransactionIndex,
};
use crate::stack::StackCore;

/// Initiator side of the join exchange
#[derive(Debug)]
pub struct Joiner {
    pub core: TransactionCore,
    state: JoinerState,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum JoinerState {
    RequestSent,
    /// Acked but not yet responded; bookkeeping only
    Pending,
    Accepted,
}

impl Joiner {
    /// Start a join toward the bootstrap master
    ///
    /// Provisions a default master peer at id 0 with the configured bootstrap
    /// address when no remote peer is known yet.
    pub fn start(core: &mut StackCore, timeout: Option<Duration>) -> Result<Self> {
        if core.registry.is_empty() {
            let master = RemotePeer::new(BOOTSTRAP_ID, core.bootstrap);
            core.registry.insert(master)?;
        }
        let target = core
            .registry
            .find_by_addr(core.bootstrap)
            .unwrap_or(BOOTSTRAP_ID);
        let peer = core
            .registry
            .get_mut(target)
            .ok_or(StackError::UnknownPeer { id: target })?;
        let tid = peer.next_tid();
        let peer_addr = peer.addr;

        let index = TransactionIndex {
            remote_initiated: false,
            local_id: core.local.id,
            remote_id: target,
            sid: 0,
            tid,
            broadcast: false,
        };
        let mut joiner = Self {
            core: TransactionCore::new(index, timeout),
            state: JoinerState::RequestSent,
        };

        let mut packet = Packet::new(ExchangeKind::Join, PacketKind::Request);
        packet.route = Route::between(core.local.addr, peer_addr, core.local.id, target, 0, tid);
        packet.body.insert(
            "verhex".into(),
            Value::String(hex::encode(core.local.verify_public())),
        );
        packet.body.insert(
            "pubhex".into(),
            Value::String(hex::encode(core.local.crypt_public())),
        );

        joiner.core.last_tx = Some(core.transmit(&packet, peer_addr)?);
        tracing::debug!(target_id = target, tid, "join request sent");
        Ok(joiner)
    }

    pub fn receive(
        &mut self,
        core: &mut StackCore,
        packet: &Packet,
    ) -> std::result::Result<Disposition, TransactionError> {
        match (packet.kind, self.state) {
            (PacketKind::Ack, JoinerState::RequestSent) => {
                self.state = JoinerState::Pending;
                self.core.last_rx = Some(packet.clone());
                tracing::debug!("join pending");
                Ok(Disposition::Continue)
            }
            (PacketKind::Response, JoinerState::RequestSent | JoinerState::Pending) => {
                self.complete(core, packet)
            }
            (kind, _) => {
                tracing::trace!(kind = kind.name(), "joiner ignoring unexpected packet");
                Ok(Disposition::Continue)
            }
        }
    }

    /// Process the response: adopt the assigned id, record the responder's
    /// keys, and rekey the registry entry when its id changed
    fn complete(
        &mut self,
        core: &mut StackCore,
        packet: &Packet,
    ) -> std::result::Result<Disposition, TransactionError> {
        let ldid = body_u32(&packet.body, "response", "ldid")?;
        let rdid = body_u32(&packet.body, "response", "rdid")?;
        let verhex: [u8; 32] = body_hex_array(&packet.body, "response", "verhex")?;
        let pubhex: [u8; 32] = body_hex_array(&packet.body, "response", "pubhex")?;
        let verify_key = signing::VerifyingKey::from_bytes(&verhex)?;

        // Adopt the device id the responder assigned to us
        core.local.id = rdid;

        // The responder told us its real id; move the provisional entry
        let provisional = self.core.index.remote_id;
        if provisional != ldid {
            core.registry
                .rekey(provisional, ldid)
                .map_err(|_| TransactionError::RekeyCollision { id: ldid })?;
        }

        let peer = core
            .registry
            .get_mut(ldid)
            .ok_or(TransactionError::NotAccepted { id: ldid })?;
        peer.verify_key = Some(verify_key);
        peer.crypt_key = Some(pubhex);
        peer.accepted = true;
        peer.advance_sid();

        self.state = JoinerState::Accepted;
        self.core.last_rx = Some(packet.clone());
        tracing::info!(local_id = rdid, peer_id = ldid, "join accepted");
        Ok(Disposition::Complete)
    }
}

/// Correspondent side of the join exchange
#[derive(Debug)]
pub struct Joinent {
    pub core: TransactionCore,
    /// Device id assigned to the requester
    assigned_id: u32,
}

impl Joinent {
    /// Handle a fresh join request: register the requester provisionally and
    /// send the ack
    pub fn start(core: &mut StackCore, packet: &Packet) -> Result<Self> {
        let verhex: [u8; 32] = body_hex_array(&packet.body, "request", "verhex")?;
        let pubhex: [u8; 32] = body_hex_array(&packet.body, "request", "pubhex")?;
        let verify_key = signing::VerifyingKey::from_bytes(&verhex)?;

        let from = packet
            .from
            .ok_or_else(|| StackError::ReceiveFailed {
                reason: "received packet carries no source address".into(),
            })?;

        // A re-join from a known address converges on the same id; otherwise
        // assign the next free one
        let assigned_id = match core.registry.find_by_addr(from) {
            Some(id) => id,
            None => {
                let id = core.registry.assign_id(core.local.id);
                core.registry.insert(RemotePeer::new(id, from))?;
                id
            }
        };
        let peer = core
            .registry
            .get_mut(assigned_id)
            .ok_or(StackError::UnknownPeer { id: assigned_id })?;
        peer.verify_key = Some(verify_key);
        peer.crypt_key = Some(pubhex);

        let mut joinent = Self {
            core: TransactionCore::new(TransactionIndex::from_packet(packet), None),
            assigned_id,
        };
        joinent.core.last_rx = Some(packet.clone());
        joinent.send_ack(core, packet)?;
        tracing::debug!(assigned_id, %from, "join request received");
        Ok(joinent)
    }

    fn send_ack(&mut self, core: &mut StackCore, request: &Packet) -> Result<()> {
        let to = self.requester_addr(request)?;
        let mut ack = Packet::new(ExchangeKind::Join, PacketKind::Ack);
        ack.kinds.body = BodyKind::None;
        ack.flags.correspondent = true;
        ack.flags.pending = true;
        // Echo the requester's provisional addressing; real ids ride in the
        // response body
        ack.route = Route::between(
            core.local.addr,
            to,
            request.route.dst_id,
            request.route.src_id,
            request.route.sid,
            request.route.tid,
        );
        self.core.last_tx = Some(core.transmit(&ack, to)?);
        Ok(())
    }

    fn requester_addr(&self, request: &Packet) -> Result<std::net::SocketAddr> {
        request.from.ok_or_else(|| {
            StackError::ReceiveFailed {
                reason: "received packet carries no source address".into(),
            }
            .into()
        })
    }

    /// Accept the requester: send the response with the assigned id pair and
    /// our public keys, and mark the peer accepted
    pub fn accept(&mut self, core: &mut StackCore) -> Result<Disposition> {
        let request = self
            .core
            .last_rx
            .clone()
            .ok_or_else(|| StackError::ReceiveFailed {
                reason: "joinent has no request to accept".into(),
            })?;
        let to = self.requester_addr(&request)?;

        let mut response = Packet::new(ExchangeKind::Join, PacketKind::Response);
        response.flags.correspondent = true;
        response.route = Route::between(
            core.local.addr,
            to,
            request.route.dst_id,
            request.route.src_id,
            request.route.sid,
            request.route.tid,
        );
        response
            .body
            .insert("ldid".into(), core.local.id.into());
        response
            .body
            .insert("rdid".into(), self.assigned_id.into());
        response.body.insert(
            "verhex".into(),
            Value::String(hex::encode(core.local.verify_public())),
        );
        response.body.insert(
            "pubhex".into(),
            Value::String(hex::encode(core.local.crypt_public())),
        );

        self.core.last_tx = Some(core.transmit(&response, to)?);

        let peer = core
            .registry
            .get_mut(self.assigned_id)
            .ok_or(StackError::UnknownPeer {
                id: self.assigned_id,
            })?;
        peer.accepted = true;
        peer.advance_sid();

        tracing::info!(peer_id = self.assigned_id, "join accepted (correspondent)");
        Ok(Disposition::Complete)
    }

    /// A retransmitted request gets the ack again; everything else is noise
    pub fn receive(
        &mut self,
        core: &mut StackCore,
        packet: &Packet,
    ) -> std::result::Result<Disposition, TransactionError> {
        if packet.kind == PacketKind::Request {
            if let Err(error) = self.send_ack(core, packet) {
                tracing::debug!(%error, "re-ack of join request failed");
            }
        } else {
            tracing::trace!(kind = packet.kind.name(), "joinent ignoring unexpected packet");
        }
        Ok(Disposition::Continue)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // Join behavior is covered end-to-end in the stack tests, where two live
    // stacks complete the exchange over loopback sockets. Here we only pin
    // the body schema of the request.
    #[test]
    fn test_request_body_schema() {
        let mut core = StackCore::for_tests(1, "127.0.0.1:7530".parse().unwrap());
        let joiner = Joiner::start(&mut core, None).unwrap();
        assert_eq!(joiner.core.index.sid, 0);

        let (raw, _to) = core.pop_outbound().expect("request queued");
        let mut parsed = Packet::parse_outer(&raw, "127.0.0.1:7530".parse().unwrap());
        parsed.parse_inner(None, None);
        assert_eq!(parsed.error, None);
        assert_eq!(parsed.kind, PacketKind::Request);
        assert_eq!(parsed.exchange, ExchangeKind::Join);
        assert!(parsed.body.contains_key("verhex"));
        assert!(parsed.body.contains_key("pubhex"));
    }
}
