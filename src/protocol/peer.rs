//! Peer state and the peer registry
//!
//! A peer is one transport endpoint: the local side holds its long-term
//! identity key material; a remote side additionally tracks the learned public
//! keys, per-session ephemeral keys, handshake flags, and the counters used to
//! mint outbound transaction identifiers.

use std::collections::HashMap;
use std::net::SocketAddr;

use crate::crypto::{blake2s, signing, x25519};
use crate::error::StackError;

/// Peer id reserved for broadcast/unaddressed-bootstrap destinations
pub const BOOTSTRAP_ID: u32 = 0;

/// First id handed out by the join responder (the master itself is 1)
const FIRST_ASSIGNED_ID: u32 = 2;

/// Symmetric session keys derived from a completed endow exchange
#[derive(Debug, Clone)]
pub struct SessionKeys {
    /// Key for sealing outgoing message bodies
    pub tx: [u8; 32],
    /// Key for opening incoming message bodies
    pub rx: [u8; 32],
}

impl SessionKeys {
    /// Derive the session key pair from the ephemeral DH shared secret
    ///
    /// The initiator's transmit key is the responder's receive key.
    pub fn derive(shared: &[u8; 32], initiator: bool) -> Self {
        let root = blake2s::hash(shared);
        let (k1, k2) = blake2s::kdf2(&root, &[]);
        if initiator {
            Self { tx: k1, rx: k2 }
        } else {
            Self { tx: k2, rx: k1 }
        }
    }
}

/// The local endpoint's identity
pub struct LocalPeer {
    /// Our peer id; 0 until the join handshake assigns one
    pub id: u32,
    /// Address the socket is bound to
    pub addr: SocketAddr,
    /// Long-term signing key
    pub signer: signing::SigningKey,
    /// Long-term encryption private key
    pub crypt_private: [u8; 32],
}

impl LocalPeer {
    pub fn new(
        id: u32,
        addr: SocketAddr,
        signer: signing::SigningKey,
        crypt_private: [u8; 32],
    ) -> Self {
        Self {
            id,
            addr,
            signer,
            crypt_private,
        }
    }

    /// Long-term verify public key
    pub fn verify_public(&self) -> [u8; 32] {
        self.signer.verifying_key().to_bytes()
    }

    /// Long-term encryption public key
    pub fn crypt_public(&self) -> [u8; 32] {
        x25519::public_key(&self.crypt_private)
    }
}

impl std::fmt::Debug for LocalPeer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalPeer")
            .field("id", &self.id)
            .field("addr", &self.addr)
            .finish_non_exhaustive()
    }
}

/// State tracked for one remote peer
#[derive(Debug)]
pub struct RemotePeer {
    pub id: u32,
    pub addr: SocketAddr,
    /// Long-term verify public key, learned during join
    pub verify_key: Option<signing::VerifyingKey>,
    /// Long-term encryption public key, learned during join
    pub crypt_key: Option<[u8; 32]>,
    /// Our ephemeral keypair for the current session
    local_short_private: Option<[u8; 32]>,
    pub local_short_public: Option<[u8; 32]>,
    /// The peer's ephemeral public key for the current session
    pub remote_short_public: Option<[u8; 32]>,
    /// Long-term identity verified via the join handshake
    pub accepted: bool,
    /// Session keys established via the endow handshake
    pub endowed: bool,
    pub session: Option<SessionKeys>,
    /// Current sequence id; advanced past 0 once joined
    pub sid: u32,
    /// Next outbound transaction id
    next_tid: u32,
}

impl RemotePeer {
    /// Create a provisional remote peer (not yet accepted)
    pub fn new(id: u32, addr: SocketAddr) -> Self {
        Self {
            id,
            addr,
            verify_key: None,
            crypt_key: None,
            local_short_private: None,
            local_short_public: None,
            remote_short_public: None,
            accepted: false,
            endowed: false,
            session: None,
            sid: 0,
            next_tid: 1,
        }
    }

    /// Regenerate our ephemeral keypair and invalidate any prior session
    pub fn refresh(&mut self) {
        let (private, public) = x25519::generate_keypair();
        self.local_short_private = Some(private);
        self.local_short_public = Some(public);
        self.remote_short_public = None;
        self.session = None;
        self.endowed = false;
    }

    /// Our ephemeral private key for the current session
    pub fn local_short_private(&self) -> Option<&[u8; 32]> {
        self.local_short_private.as_ref()
    }

    /// Mint the next outbound transaction id
    pub fn next_tid(&mut self) -> u32 {
        let tid = self.next_tid;
        self.next_tid = self.next_tid.wrapping_add(1).max(1);
        tid
    }

    /// Advance the sequence counter past the bootstrap value
    pub fn advance_sid(&mut self) {
        self.sid = self.sid.wrapping_add(1).max(1);
    }

    /// Derive and install session keys from the ephemeral exchange
    ///
    /// Requires both ephemeral keys; returns false when they are missing.
    pub fn derive_session(&mut self, initiator: bool) -> bool {
        let (Some(private), Some(remote)) =
            (self.local_short_private.as_ref(), self.remote_short_public.as_ref())
        else {
            return false;
        };
        let shared = x25519::dh(private, remote);
        self.session = Some(SessionKeys::derive(&shared, initiator));
        true
    }
}

/// Registry of remote peers keyed by id, owned by the stack
#[derive(Debug, Default)]
pub struct PeerRegistry {
    peers: HashMap<u32, RemotePeer>,
}

impl PeerRegistry {
    pub fn new() -> Self {
        Self {
            peers: HashMap::new(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }

    pub fn get(&self, id: u32) -> Option<&RemotePeer> {
        self.peers.get(&id)
    }

    pub fn get_mut(&mut self, id: u32) -> Option<&mut RemotePeer> {
        self.peers.get_mut(&id)
    }

    /// Insert a new peer; the id must not already be registered
    pub fn insert(&mut self, peer: RemotePeer) -> Result<(), StackError> {
        let id = peer.id;
        if self.peers.contains_key(&id) {
            return Err(StackError::PeerIdOccupied { id });
        }
        self.peers.insert(id, peer);
        Ok(())
    }

    /// Move a peer to a new id, atomically
    ///
    /// Fails when the old id is unknown or the new id is occupied; the
    /// registry is unchanged on failure.
    pub fn rekey(&mut self, old: u32, new: u32) -> Result<(), StackError> {
        if old == new {
            return Ok(());
        }
        if self.peers.contains_key(&new) {
            return Err(StackError::PeerIdOccupied { id: new });
        }
        let mut peer = self
            .peers
            .remove(&old)
            .ok_or(StackError::UnknownPeer { id: old })?;
        peer.id = new;
        self.peers.insert(new, peer);
        Ok(())
    }

    /// Find a registered peer by its network address
    pub fn find_by_addr(&self, addr: SocketAddr) -> Option<u32> {
        self.peers
            .values()
            .find(|peer| peer.addr == addr)
            .map(|peer| peer.id)
    }

    /// Pick the next free id for a join responder to assign
    pub fn assign_id(&self, local_id: u32) -> u32 {
        let mut candidate = FIRST_ASSIGNED_ID;
        while candidate == local_id || self.peers.contains_key(&candidate) {
            candidate += 1;
        }
        candidate
    }

    /// Iterate over all registered peers
    pub fn iter(&self) -> impl Iterator<Item = &RemotePeer> {
        self.peers.values()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_addr(port: u16) -> SocketAddr {
        format!("127.0.0.1:{port}").parse().unwrap()
    }

    #[test]
    fn test_refresh_invalidates_session() {
        let mut peer = RemotePeer::new(2, test_addr(7531));
        peer.refresh();
        peer.remote_short_public = Some([5u8; 32]);
        assert!(peer.derive_session(true));
        peer.endowed = true;

        let first_public = peer.local_short_public;
        peer.refresh();

        assert!(!peer.endowed);
        assert!(peer.session.is_none());
        assert!(peer.remote_short_public.is_none());
        assert_ne!(peer.local_short_public, first_public);
    }

    #[test]
    fn test_session_key_agreement() {
        let mut alice = RemotePeer::new(2, test_addr(7531));
        let mut bob = RemotePeer::new(1, test_addr(7530));
        alice.refresh();
        bob.refresh();

        alice.remote_short_public = bob.local_short_public;
        bob.remote_short_public = alice.local_short_public;

        assert!(alice.derive_session(true));
        assert!(bob.derive_session(false));

        let alice_keys = alice.session.unwrap();
        let bob_keys = bob.session.unwrap();
        assert_eq!(alice_keys.tx, bob_keys.rx);
        assert_eq!(alice_keys.rx, bob_keys.tx);
        assert_ne!(alice_keys.tx, alice_keys.rx);
    }

    #[test]
    fn test_tid_and_sid_counters() {
        let mut peer = RemotePeer::new(2, test_addr(7531));
        assert_eq!(peer.next_tid(), 1);
        assert_eq!(peer.next_tid(), 2);

        assert_eq!(peer.sid, 0);
        peer.advance_sid();
        assert_eq!(peer.sid, 1);
    }

    #[test]
    fn test_registry_insert_collision() {
        let mut registry = PeerRegistry::new();
        registry.insert(RemotePeer::new(2, test_addr(7531))).unwrap();

        let result = registry.insert(RemotePeer::new(2, test_addr(7532)));
        assert!(matches!(result, Err(StackError::PeerIdOccupied { id: 2 })));
    }

    #[test]
    fn test_registry_rekey() {
        let mut registry = PeerRegistry::new();
        registry.insert(RemotePeer::new(0, test_addr(7530))).unwrap();

        registry.rekey(0, 1).unwrap();
        assert!(registry.get(0).is_none());
        assert_eq!(registry.get(1).unwrap().id, 1);

        // Rekey onto an occupied id fails and changes nothing
        registry.insert(RemotePeer::new(3, test_addr(7533))).unwrap();
        let result = registry.rekey(1, 3);
        assert!(matches!(result, Err(StackError::PeerIdOccupied { id: 3 })));
        assert!(registry.get(1).is_some());
        assert!(registry.get(3).is_some());
    }

    #[test]
    fn test_assign_id_skips_occupied() {
        let mut registry = PeerRegistry::new();
        assert_eq!(registry.assign_id(1), 2);

        registry.insert(RemotePeer::new(2, test_addr(7531))).unwrap();
        assert_eq!(registry.assign_id(1), 3);

        // Never hands out the local id
        registry.insert(RemotePeer::new(3, test_addr(7532))).unwrap();
        assert_eq!(registry.assign_id(4), 5);
    }

    #[test]
    fn test_find_by_addr() {
        let mut registry = PeerRegistry::new();
        registry.insert(RemotePeer::new(2, test_addr(7531))).unwrap();

        assert_eq!(registry.find_by_addr(test_addr(7531)), Some(2));
        assert_eq!(registry.find_by_addr(test_addr(9999)), None);
    }
}
