//! Endow: the session-key handshake
//!
//! A cookie exchange between two already-accepted peers that establishes
//! short-term symmetric session keys:
//!
//! ```text
//! Endower                           Endowent
//!   hello (plain + sealed plain) ---->   prove possession of ephemeral key
//!   <---- cookie (sealed {key, ids, oreo})
//!   initiate (sealed {key, vouch, oreo}) ---->
//!   <---- ack                            both sides endowed
//! ```
//!
//! Hello and cookie payloads are sealed between an ephemeral key and the
//! other side's long-term encryption key; the initiate is sealed ephemeral to
//! ephemeral. Any missing field, failed open, or mismatched plaintext/id/
//! cookie/vouch aborts the exchange. The correspondent lingers one timeout
//! period after completing so a retransmitted initiate is re-acked instead of
//! spawning a broken second exchange.

use std::time::{Duration, Instant};

use rand::RngCore;
use serde_json::{Map, Value};

use crate::crypto::aead;
use crate::error::{CryptoError, Result, StackError, TransactionError};
use crate::protocol::packet::{BodyKind, ExchangeKind, Packet, PacketKind, Route};
use crate::protocol::transaction::{
    body_hex, body_hex_array, body_u32, Disposition, Tick, TransactionCore, TransactionIndex,
};
use crate::stack::StackCore;

/// Length of the hello proof-of-possession plaintext
const HELLO_PLAIN_LEN: usize = 64;

/// Length of the opaque cookie value
const OREO_LEN: usize = 32;

/// Initiator side of the endow exchange
#[derive(Debug)]
pub struct Endower {
    pub core: TransactionCore,
    peer_id: u32,
    state: EndowerState,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum EndowerState {
    HelloSent,
    InitiateSent,
    Endowed,
}

impl Endower {
    /// Start an endow exchange with an accepted peer
    ///
    /// Refreshes the peer's ephemeral keys, invalidating any prior session.
    pub fn start(core: &mut StackCore, peer_id: u32, timeout: Option<Duration>) -> Result<Self> {
        let local_id = core.local.id;
        let local_addr = core.local.addr;
        let peer = core
            .registry
            .get_mut(peer_id)
            .ok_or(StackError::UnknownPeer { id: peer_id })?;
        if !peer.accepted {
            return Err(TransactionError::NotAccepted { id: peer_id }.into());
        }

        peer.refresh();
        let sid = peer.sid;
        let tid = peer.next_tid();
        let peer_addr = peer.addr;
        let short_private = *peer
            .local_short_private()
            .ok_or(CryptoError::Encryption)?;
        let short_public = peer.local_short_public.ok_or(CryptoError::Encryption)?;
        let crypt_key = peer.crypt_key.ok_or(TransactionError::NotAccepted { id: peer_id })?;

        let index = TransactionIndex {
            remote_initiated: false,
            local_id,
            remote_id: peer_id,
            sid,
            tid,
            broadcast: false,
        };
        let mut endower = Self {
            core: TransactionCore::new(index, timeout),
            peer_id,
            state: EndowerState::HelloSent,
        };

        // Hello: declare a 64-byte zero plaintext and prove possession of the
        // ephemeral key by also sealing it to the peer's long-term key
        let plain = [0u8; HELLO_PLAIN_LEN];
        let (nonce, cipher) = aead::seal_to(&short_private, &crypt_key, &plain)?;

        let mut packet = Packet::new(ExchangeKind::Endow, PacketKind::Hello);
        packet.route = Route::between(local_addr, peer_addr, local_id, peer_id, sid, tid);
        packet
            .body
            .insert("plain".into(), Value::String(hex::encode(plain)));
        packet
            .body
            .insert("shorthex".into(), Value::String(hex::encode(short_public)));
        packet
            .body
            .insert("nonce".into(), Value::String(hex::encode(nonce)));
        packet
            .body
            .insert("cipher".into(), Value::String(hex::encode(&cipher)));

        endower.core.last_tx = Some(core.transmit(&packet, peer_addr)?);
        tracing::debug!(peer_id, sid, tid, "endow hello sent");
        Ok(endower)
    }

    pub fn receive(
        &mut self,
        core: &mut StackCore,
        packet: &Packet,
    ) -> std::result::Result<Disposition, TransactionError> {
        match (packet.kind, self.state) {
            (PacketKind::Cookie, EndowerState::HelloSent) => self.on_cookie(core, packet),
            (PacketKind::Ack, EndowerState::InitiateSent) => self.on_ack(core, packet),
            (kind, _) => {
                tracing::trace!(kind = kind.name(), "endower ignoring unexpected packet");
                Ok(Disposition::Continue)
            }
        }
    }

    /// Open the cookie, validate the embedded ids, and send the initiate
    fn on_cookie(
        &mut self,
        core: &mut StackCore,
        packet: &Packet,
    ) -> std::result::Result<Disposition, TransactionError> {
        let nonce: [u8; aead::NONCE_LEN] = body_hex_array(&packet.body, "cookie", "nonce")?;
        let cipher = body_hex(&packet.body, "cookie", "cipher")?;

        let peer = core
            .registry
            .get_mut(self.peer_id)
            .ok_or(TransactionError::NotAccepted { id: self.peer_id })?;
        let short_private = *peer
            .local_short_private()
            .ok_or(CryptoError::Decryption)?;
        let crypt_key = peer
            .crypt_key
            .ok_or(TransactionError::NotAccepted { id: self.peer_id })?;

        // Sealed by the responder under its long-term key and our ephemeral
        // key; the shared secret is the same from either pairing
        let opened = aead::open_from(&short_private, &crypt_key, &nonce, &cipher)?;
        let content: Map<String, Value> = serde_json::from_slice(&opened)
            .map_err(|_| TransactionError::Crypto(CryptoError::Decryption))?;

        let remote_short: [u8; 32] = body_hex_array(&content, "cookie", "shorthex")?;
        let sdid = body_u32(&content, "cookie", "sdid")?;
        let ddid = body_u32(&content, "cookie", "ddid")?;
        let oreo = crate::protocol::transaction::body_str(&content, "cookie", "oreo")?.to_string();

        if sdid != self.peer_id {
            return Err(TransactionError::IdMismatch {
                expected: self.peer_id,
                got: sdid,
            });
        }
        if ddid != core.local.id {
            return Err(TransactionError::IdMismatch {
                expected: core.local.id,
                got: ddid,
            });
        }

        peer.remote_short_public = Some(remote_short);
        let short_public = peer.local_short_public.ok_or(CryptoError::Encryption)?;
        let peer_addr = peer.addr;

        // Initiate: vouch for our ephemeral key with the long-term identity
        // key, and return the cookie
        let vouch = core.local.signer.sign(&short_public);
        let mut content = Map::new();
        content.insert("shorthex".into(), Value::String(hex::encode(short_public)));
        content.insert("vouch".into(), Value::String(hex::encode(vouch)));
        content.insert("oreo".into(), Value::String(oreo));
        let content_bytes = serde_json::to_vec(&Value::Object(content))
            .map_err(|_| TransactionError::Crypto(CryptoError::Encryption))?;

        let (nonce, cipher) = aead::seal_to(&short_private, &remote_short, &content_bytes)?;

        let mut initiate = Packet::new(ExchangeKind::Endow, PacketKind::Initiate);
        initiate.route = Route::between(
            core.local.addr,
            peer_addr,
            self.core.index.local_id,
            self.peer_id,
            self.core.index.sid,
            self.core.index.tid,
        );
        initiate
            .body
            .insert("nonce".into(), Value::String(hex::encode(nonce)));
        initiate
            .body
            .insert("cipher".into(), Value::String(hex::encode(&cipher)));

        self.core.last_tx = Some(core.transmit(&initiate, peer_addr)?);
        self.core.last_rx = Some(packet.clone());
        self.state = EndowerState::InitiateSent;
        tracing::debug!(peer_id = self.peer_id, "endow initiate sent");
        Ok(Disposition::Continue)
    }

    /// Final ack: derive session keys and mark the peer endowed
    fn on_ack(
        &mut self,
        core: &mut StackCore,
        packet: &Packet,
    ) -> std::result::Result<Disposition, TransactionError> {
        let peer = core
            .registry
            .get_mut(self.peer_id)
            .ok_or(TransactionError::NotAccepted { id: self.peer_id })?;
        if !peer.derive_session(true) {
            return Err(TransactionError::Crypto(CryptoError::Decryption));
        }
        peer.endowed = true;

        self.core.last_rx = Some(packet.clone());
        self.state = EndowerState::Endowed;
        tracing::info!(peer_id = self.peer_id, "session endowed (initiator)");
        Ok(Disposition::Complete)
    }
}

/// Correspondent side of the endow exchange
#[derive(Debug)]
pub struct Endowent {
    pub core: TransactionCore,
    peer_id: u32,
    /// Opaque cookie issued in our cookie packet
    oreo: String,
    state: EndowentState,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum EndowentState {
    CookieSent,
    Endowed,
}

impl Endowent {
    /// Handle a fresh hello: verify possession of the claimed ephemeral key
    /// and reply with the cookie
    pub fn start(core: &mut StackCore, packet: &Packet) -> Result<Self> {
        let peer_id = packet.route.src_id;
        let local_id = core.local.id;
        let local_addr = core.local.addr;
        let local_crypt_private = core.local.crypt_private;

        let plain = body_hex(&packet.body, "hello", "plain")?;
        let remote_short: [u8; 32] = body_hex_array(&packet.body, "hello", "shorthex")?;
        let nonce: [u8; aead::NONCE_LEN] = body_hex_array(&packet.body, "hello", "nonce")?;
        let cipher = body_hex(&packet.body, "hello", "cipher")?;

        let peer = core
            .registry
            .get_mut(peer_id)
            .ok_or(TransactionError::NotAccepted { id: peer_id })?;
        if !peer.accepted {
            return Err(TransactionError::NotAccepted { id: peer_id }.into());
        }

        // The sealed block must reproduce the declared plaintext, proving the
        // sender holds the ephemeral private key
        if plain.len() != HELLO_PLAIN_LEN {
            return Err(TransactionError::PlaintextMismatch.into());
        }
        let opened = aead::open_from(&local_crypt_private, &remote_short, &nonce, &cipher)
            .map_err(TransactionError::from)?;
        if opened != plain {
            return Err(TransactionError::PlaintextMismatch.into());
        }

        // Fresh session state on this side as well
        peer.refresh();
        peer.remote_short_public = Some(remote_short);
        let short_public = peer.local_short_public.ok_or(CryptoError::Encryption)?;
        let peer_addr = peer.addr;

        let mut oreo_bytes = [0u8; OREO_LEN];
        rand::rngs::OsRng.fill_bytes(&mut oreo_bytes);
        let oreo = hex::encode(oreo_bytes);

        let mut content = Map::new();
        content.insert("shorthex".into(), Value::String(hex::encode(short_public)));
        content.insert("sdid".into(), local_id.into());
        content.insert("ddid".into(), peer_id.into());
        content.insert("oreo".into(), Value::String(oreo.clone()));
        let content_bytes = serde_json::to_vec(&Value::Object(content))
            .map_err(|_| TransactionError::Crypto(CryptoError::Encryption))?;

        let (cookie_nonce, cookie_cipher) =
            aead::seal_to(&local_crypt_private, &remote_short, &content_bytes)?;

        let mut endowent = Self {
            core: TransactionCore::new(TransactionIndex::from_packet(packet), None),
            peer_id,
            oreo,
            state: EndowentState::CookieSent,
        };
        endowent.core.last_rx = Some(packet.clone());

        let mut cookie = Packet::new(ExchangeKind::Endow, PacketKind::Cookie);
        cookie.flags.correspondent = true;
        cookie.route = Route::between(
            local_addr,
            peer_addr,
            packet.route.dst_id,
            packet.route.src_id,
            packet.route.sid,
            packet.route.tid,
        );
        cookie
            .body
            .insert("nonce".into(), Value::String(hex::encode(cookie_nonce)));
        cookie
            .body
            .insert("cipher".into(), Value::String(hex::encode(&cookie_cipher)));

        endowent.core.last_tx = Some(core.transmit(&cookie, peer_addr)?);
        tracing::debug!(peer_id, "endow cookie sent");
        Ok(endowent)
    }

    pub fn receive(
        &mut self,
        core: &mut StackCore,
        packet: &Packet,
    ) -> std::result::Result<Disposition, TransactionError> {
        match (packet.kind, self.state) {
            (PacketKind::Initiate, EndowentState::CookieSent) => self.on_initiate(core, packet),
            (PacketKind::Initiate, EndowentState::Endowed) => {
                // Retransmitted initiate during the linger period: ack again
                self.send_ack(core, packet)?;
                Ok(Disposition::Continue)
            }
            (kind, _) => {
                tracing::trace!(kind = kind.name(), "endowent ignoring unexpected packet");
                Ok(Disposition::Continue)
            }
        }
    }

    /// Open and validate the initiate, then ack and derive the session
    fn on_initiate(
        &mut self,
        core: &mut StackCore,
        packet: &Packet,
    ) -> std::result::Result<Disposition, TransactionError> {
        let nonce: [u8; aead::NONCE_LEN] = body_hex_array(&packet.body, "initiate", "nonce")?;
        let cipher = body_hex(&packet.body, "initiate", "cipher")?;

        let peer = core
            .registry
            .get_mut(self.peer_id)
            .ok_or(TransactionError::NotAccepted { id: self.peer_id })?;
        let short_private = *peer
            .local_short_private()
            .ok_or(CryptoError::Decryption)?;
        let remote_short = peer
            .remote_short_public
            .ok_or(CryptoError::Decryption)?;
        let verify_key = peer
            .verify_key
            .ok_or(TransactionError::NotAccepted { id: self.peer_id })?;

        // Possible forged or corrupted packet: abort, never retry
        let opened = aead::open_from(&short_private, &remote_short, &nonce, &cipher)?;
        let content: Map<String, Value> = serde_json::from_slice(&opened)
            .map_err(|_| TransactionError::Crypto(CryptoError::Decryption))?;

        let vouched: [u8; 32] = body_hex_array(&content, "initiate", "shorthex")?;
        let vouch = body_hex(&content, "initiate", "vouch")?;
        let oreo = crate::protocol::transaction::body_str(&content, "initiate", "oreo")?;

        if oreo != self.oreo {
            return Err(TransactionError::CookieMismatch);
        }
        if vouched != remote_short {
            return Err(TransactionError::VouchMismatch);
        }
        verify_key.verify(&vouched, &vouch)?;

        if !peer.derive_session(false) {
            return Err(TransactionError::Crypto(CryptoError::Decryption));
        }
        peer.endowed = true;

        self.core.last_rx = Some(packet.clone());
        self.send_ack(core, packet)?;
        self.state = EndowentState::Endowed;

        // Stay in the table for a grace period to tolerate a retransmitted
        // initiate
        self.core.extend_deadline();
        tracing::info!(peer_id = self.peer_id, "session endowed (correspondent)");
        Ok(Disposition::Continue)
    }

    fn send_ack(
        &mut self,
        core: &mut StackCore,
        initiate: &Packet,
    ) -> std::result::Result<(), TransactionError> {
        let peer_addr = core
            .registry
            .get(self.peer_id)
            .map(|peer| peer.addr)
            .ok_or(TransactionError::NotAccepted { id: self.peer_id })?;

        let mut ack = Packet::new(ExchangeKind::Endow, PacketKind::Ack);
        ack.kinds.body = BodyKind::None;
        ack.flags.correspondent = true;
        ack.route = Route::between(
            core.local.addr,
            peer_addr,
            initiate.route.dst_id,
            initiate.route.src_id,
            initiate.route.sid,
            initiate.route.tid,
        );
        self.core.last_tx = Some(core.transmit(&ack, peer_addr)?);
        Ok(())
    }

    /// Deadline check: a completed endowent expires silently
    pub fn tick(&self, now: Instant) -> Tick {
        if !self.core.expired(now) {
            Tick::Alive
        } else if self.state == EndowentState::Endowed {
            Tick::Lingered
        } else {
            Tick::Expired
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // The endow exchange is exercised end-to-end in the stack tests. Here we
    // pin the sealed-content schema of the hello packet.
    #[test]
    fn test_hello_proves_key_possession() {
        let mut core = StackCore::for_tests(2, "127.0.0.1:7531".parse().unwrap());
        let peer_addr: std::net::SocketAddr = "127.0.0.1:7530".parse().unwrap();

        // Register an accepted peer with known long-term keys
        let peer_crypt = crate::crypto::x25519::generate_keypair();
        let mut peer = crate::protocol::peer::RemotePeer::new(1, peer_addr);
        peer.accepted = true;
        peer.crypt_key = Some(peer_crypt.1);
        peer.sid = 1;
        core.registry.insert(peer).unwrap();

        let endower = Endower::start(&mut core, 1, None).unwrap();
        assert_eq!(endower.core.index.remote_id, 1);

        let (raw, _to) = core.pop_outbound().expect("hello queued");
        let mut hello = Packet::parse_outer(&raw, peer_addr);
        hello.parse_inner(None, None);
        assert_eq!(hello.error, None);
        assert_eq!(hello.kind, PacketKind::Hello);

        // The responder can open the sealed block with its long-term private
        // key and the claimed ephemeral key, and it matches the plaintext
        let plain = body_hex(&hello.body, "hello", "plain").unwrap();
        let short: [u8; 32] = body_hex_array(&hello.body, "hello", "shorthex").unwrap();
        let nonce: [u8; 24] = body_hex_array(&hello.body, "hello", "nonce").unwrap();
        let cipher = body_hex(&hello.body, "hello", "cipher").unwrap();

        let opened = aead::open_from(&peer_crypt.0, &short, &nonce, &cipher).unwrap();
        assert_eq!(opened, plain);
        assert_eq!(plain, vec![0u8; HELLO_PLAIN_LEN]);
    }

    /// Two cores wired up as if a join already completed
    fn accepted_cores() -> (StackCore, StackCore) {
        let a_addr: std::net::SocketAddr = "127.0.0.1:7531".parse().unwrap();
        let b_addr: std::net::SocketAddr = "127.0.0.1:7530".parse().unwrap();
        let mut a = StackCore::for_tests(2, a_addr);
        let mut b = StackCore::for_tests(1, b_addr);

        let mut peer_b = crate::protocol::peer::RemotePeer::new(1, b_addr);
        peer_b.accepted = true;
        peer_b.verify_key = Some(b.local.signer.verifying_key());
        peer_b.crypt_key = Some(b.local.crypt_public());
        peer_b.sid = 1;
        a.registry.insert(peer_b).unwrap();

        let mut peer_a = crate::protocol::peer::RemotePeer::new(2, a_addr);
        peer_a.accepted = true;
        peer_a.verify_key = Some(a.local.signer.verifying_key());
        peer_a.crypt_key = Some(a.local.crypt_public());
        peer_a.sid = 1;
        b.registry.insert(peer_a).unwrap();

        (a, b)
    }

    /// Pop the next queued datagram from a core and fully parse it
    fn next_packet(core: &mut StackCore, verify: &crate::crypto::signing::VerifyingKey) -> Packet {
        let (raw, _to) = core.pop_outbound().expect("packet queued");
        let mut packet = Packet::parse_outer(&raw, core.local.addr);
        packet.parse_inner(Some(verify), None);
        assert_eq!(packet.error, None);
        packet
    }

    #[test]
    fn test_full_exchange_by_hand() {
        let (mut a, mut b) = accepted_cores();
        let a_verify = a.local.signer.verifying_key();
        let b_verify = b.local.signer.verifying_key();

        let mut endower = Endower::start(&mut a, 1, None).unwrap();

        let hello = next_packet(&mut a, &a_verify);
        let mut endowent = Endowent::start(&mut b, &hello).unwrap();

        let cookie = next_packet(&mut b, &b_verify);
        assert_eq!(endower.receive(&mut a, &cookie).unwrap(), Disposition::Continue);

        let initiate = next_packet(&mut a, &a_verify);
        assert_eq!(
            endowent.receive(&mut b, &initiate).unwrap(),
            Disposition::Continue
        );
        assert!(b.registry.get(2).unwrap().endowed);

        let ack = next_packet(&mut b, &b_verify);
        assert_eq!(endower.receive(&mut a, &ack).unwrap(), Disposition::Complete);
        assert!(a.registry.get(1).unwrap().endowed);

        // Both sides derived complementary session keys
        let ka = a.registry.get(1).unwrap().session.clone().unwrap();
        let kb = b.registry.get(2).unwrap().session.clone().unwrap();
        assert_eq!(ka.tx, kb.rx);
        assert_eq!(ka.rx, kb.tx);

        let nonce = aead::random_nonce();
        let sealed = aead::seal(&ka.tx, &nonce, b"payload", &[]).unwrap();
        assert_eq!(aead::open(&kb.rx, &nonce, &sealed, &[]).unwrap(), b"payload");
    }

    #[test]
    fn test_corrupted_initiate_aborts() {
        let (mut a, mut b) = accepted_cores();
        let a_verify = a.local.signer.verifying_key();
        let b_verify = b.local.signer.verifying_key();

        let mut endower = Endower::start(&mut a, 1, None).unwrap();
        let hello = next_packet(&mut a, &a_verify);
        let mut endowent = Endowent::start(&mut b, &hello).unwrap();
        let cookie = next_packet(&mut b, &b_verify);
        endower.receive(&mut a, &cookie).unwrap();

        // Corrupt one byte of the initiate ciphertext
        let mut initiate = next_packet(&mut a, &a_verify);
        let cipher_hex = initiate.body["cipher"].as_str().unwrap();
        let mut cipher = hex::decode(cipher_hex).unwrap();
        cipher[0] ^= 0x01;
        initiate
            .body
            .insert("cipher".into(), Value::String(hex::encode(&cipher)));

        let result = endowent.receive(&mut b, &initiate);
        assert!(matches!(
            result,
            Err(TransactionError::Crypto(CryptoError::Decryption))
        ));
        assert!(!b.registry.get(2).unwrap().endowed);
    }

    #[test]
    fn test_wrong_cookie_rejected() {
        let (mut a, mut b) = accepted_cores();
        let a_verify = a.local.signer.verifying_key();
        let b_verify = b.local.signer.verifying_key();

        let mut endower = Endower::start(&mut a, 1, None).unwrap();
        let hello = next_packet(&mut a, &a_verify);

        // Two correspondents issue different cookies; an initiate built
        // against the first must be rejected by the second
        let mut first = Endowent::start(&mut b, &hello).unwrap();
        let cookie = next_packet(&mut b, &b_verify);
        let second = Endowent::start(&mut b, &hello);
        assert!(second.is_ok());
        let _ = b.pop_outbound();

        endower.receive(&mut a, &cookie).unwrap();
        let initiate = next_packet(&mut a, &a_verify);

        // The first endowent's session state was replaced by the second
        // hello's refresh, so the stale initiate cannot survive validation
        let result = first.receive(&mut b, &initiate);
        assert!(result.is_err());
        assert!(!b.registry.get(2).unwrap().endowed);
    }

    #[test]
    fn test_endow_requires_accepted_peer() {
        let mut core = StackCore::for_tests(2, "127.0.0.1:7531".parse().unwrap());
        let peer_addr: std::net::SocketAddr = "127.0.0.1:7530".parse().unwrap();
        core.registry
            .insert(crate::protocol::peer::RemotePeer::new(1, peer_addr))
            .unwrap();

        let result = Endower::start(&mut core, 1, None);
        assert!(matches!(
            result,
            Err(crate::error::TetherError::Transaction(
                TransactionError::NotAccepted { id: 1 }
            ))
        ));
    }
}
