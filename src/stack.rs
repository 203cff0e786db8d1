//! The transport stack
//!
//! Owns the datagram socket, the peer registry, and the transaction table.
//! Applications drive it through three entry points (`join`, `endow`,
//! `message`) and a poll-driven `service` tick that drains the socket,
//! demultiplexes inbound packets to live transactions or spawns correspondent
//! transactions via `reply`, enforces every transaction's deadline, and
//! flushes the outbound queue. Nothing here blocks; the service tick must be
//! the sole mutator and never re-entered.

use std::collections::{HashMap, VecDeque};
use std::io::ErrorKind;
use std::net::{SocketAddr, UdpSocket};
use std::time::{Duration, Instant};

use crate::config::StackConfig;
use crate::crypto::signing::SigningKey;
use crate::crypto::x25519;
use crate::error::{PacketError, Result, StackError};
use crate::protocol::packet::{
    Body, ExchangeKind, Packet, PacketKind, TailKind, MAX_PACKET_SIZE,
};
use crate::protocol::peer::{LocalPeer, PeerRegistry, RemotePeer, BOOTSTRAP_ID};
use crate::protocol::transaction::{Disposition, Tick, Transaction, TransactionIndex};
use crate::protocol::{Endowent, Endower, Joinent, Joiner, Messengent, Messenger};

/// Everything transactions need to mutate: the local peer, the registry, and
/// the outbound/message queues
///
/// Kept separate from the transaction table so a transaction removed from the
/// table can borrow the rest of the stack while it processes a packet.
pub struct StackCore {
    pub local: LocalPeer,
    pub registry: PeerRegistry,
    /// Well-known address used to provision the default master peer
    pub bootstrap: SocketAddr,
    pub default_timeout: Duration,
    tx_raw: VecDeque<(Vec<u8>, SocketAddr)>,
    rx_messages: VecDeque<(u32, Body)>,
}

impl StackCore {
    /// Pack a packet and queue it for transmission
    ///
    /// A `Crypt` tail is sealed with the destination peer's session transmit
    /// key. Returns the packed datagram so the caller can retain it.
    pub fn transmit(&mut self, packet: &Packet, to: SocketAddr) -> std::result::Result<Vec<u8>, PacketError> {
        let crypt_key = match packet.kinds.tail {
            TailKind::None => None,
            TailKind::Crypt => Some(
                self.registry
                    .get(packet.route.dst_id)
                    .and_then(|peer| peer.session.as_ref())
                    .map(|session| session.tx)
                    .ok_or(PacketError::MissingKeys {
                        what: "session",
                        kind: "tail",
                    })?,
            ),
        };
        let raw = packet.pack(&self.local.signer, crypt_key.as_ref())?;
        self.tx_raw.push_back((raw.clone(), to));
        Ok(raw)
    }

    /// Append a decoded message body to the inbound application queue
    pub fn push_message(&mut self, peer_id: u32, body: Body) {
        self.rx_messages.push_back((peer_id, body));
    }

    pub(crate) fn pop_outbound(&mut self) -> Option<(Vec<u8>, SocketAddr)> {
        self.tx_raw.pop_front()
    }

    fn requeue_outbound(&mut self, raw: Vec<u8>, to: SocketAddr) {
        self.tx_raw.push_front((raw, to));
    }

    #[cfg(test)]
    pub(crate) fn for_tests(id: u32, addr: SocketAddr) -> Self {
        let (crypt_private, _) = x25519::generate_keypair();
        Self {
            local: LocalPeer::new(id, addr, SigningKey::generate(), crypt_private),
            registry: PeerRegistry::new(),
            bootstrap: addr,
            default_timeout: crate::protocol::transaction::DEFAULT_TIMEOUT,
            tx_raw: VecDeque::new(),
            rx_messages: VecDeque::new(),
        }
    }
}

/// One transport endpoint
pub struct Stack {
    core: StackCore,
    socket: UdpSocket,
    rx_raw: VecDeque<(Vec<u8>, SocketAddr)>,
    transactions: HashMap<TransactionIndex, Transaction>,
}

impl Stack {
    /// Bind the socket and create the local peer from the configuration
    pub fn new(config: StackConfig) -> Result<Self> {
        let socket = UdpSocket::bind(config.bind).map_err(|e| StackError::BindFailed {
            addr: config.bind.to_string(),
            reason: e.to_string(),
        })?;
        socket.set_nonblocking(true)?;
        let addr = socket.local_addr()?;

        let signer = match config.sign_seed {
            Some(seed) => SigningKey::from_bytes(&seed),
            None => SigningKey::generate(),
        };
        let crypt_private = match config.crypt_seed {
            Some(seed) => seed,
            None => x25519::generate_keypair().0,
        };

        tracing::info!(%addr, device_id = config.device_id, name = %config.name, "stack bound");
        Ok(Self {
            core: StackCore {
                local: LocalPeer::new(config.device_id, addr, signer, crypt_private),
                registry: PeerRegistry::new(),
                bootstrap: config.bootstrap,
                default_timeout: config.timeout,
                tx_raw: VecDeque::new(),
                rx_messages: VecDeque::new(),
            },
            socket,
            rx_raw: VecDeque::new(),
            transactions: HashMap::new(),
        })
    }

    /// Our device id (0 until a join assigns one)
    pub fn local_id(&self) -> u32 {
        self.core.local.id
    }

    /// Address the socket is bound to
    pub fn local_addr(&self) -> SocketAddr {
        self.core.local.addr
    }

    /// Look up a remote peer
    pub fn peer(&self, id: u32) -> Option<&RemotePeer> {
        self.core.registry.get(id)
    }

    /// Iterate over all known peers
    pub fn peers(&self) -> impl Iterator<Item = &RemotePeer> {
        self.core.registry.iter()
    }

    /// Number of live transactions
    pub fn transaction_count(&self) -> usize {
        self.transactions.len()
    }

    /// Drain one received message body, if any
    pub fn received(&mut self) -> Option<(u32, Body)> {
        self.core.rx_messages.pop_front()
    }

    /// Initiate the join handshake toward the bootstrap master
    pub fn join(&mut self, timeout: Option<Duration>) -> Result<TransactionIndex> {
        let timeout = timeout.or(Some(self.core.default_timeout));
        let joiner = Joiner::start(&mut self.core, timeout)?;
        let index = joiner.core.index;
        self.add_transaction(Transaction::Joiner(joiner))?;
        Ok(index)
    }

    /// Initiate the endow (session-key) handshake with an accepted peer
    pub fn endow(&mut self, peer_id: u32, timeout: Option<Duration>) -> Result<TransactionIndex> {
        let timeout = timeout.or(Some(self.core.default_timeout));
        let endower = Endower::start(&mut self.core, peer_id, timeout)?;
        let index = endower.core.index;
        self.add_transaction(Transaction::Endower(endower))?;
        Ok(index)
    }

    /// Queue a message body toward an endowed peer
    pub fn message(&mut self, peer_id: u32, body: Body) -> Result<TransactionIndex> {
        let timeout = Some(self.core.default_timeout);
        let messenger = Messenger::start(&mut self.core, peer_id, body, timeout)?;
        let index = messenger.core.index;
        self.add_transaction(Transaction::Messenger(messenger))?;
        Ok(index)
    }

    /// One cooperative service tick
    ///
    /// Drains the datagrams available right now, processes them, enforces
    /// every live transaction's deadline, and flushes the outbound queue.
    pub fn service(&mut self) -> Result<()> {
        self.service_socket_receive()?;
        while self.process_inbound_packet()? {}
        self.tick_transactions(Instant::now());
        self.service_socket_send()?;
        Ok(())
    }

    /// Drain inbound datagrams and flush the outbound queue, nothing else
    pub fn service_socket(&mut self) -> Result<()> {
        self.service_socket_receive()?;
        self.service_socket_send()
    }

    fn service_socket_receive(&mut self) -> Result<()> {
        let mut buf = [0u8; MAX_PACKET_SIZE];
        loop {
            match self.socket.recv_from(&mut buf) {
                Ok((len, from)) => {
                    self.rx_raw.push_back((buf[..len].to_vec(), from));
                }
                Err(e) if e.kind() == ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == ErrorKind::ConnectionRefused => {
                    // ICMP port-unreachable surfaced on the socket; operational noise
                    tracing::trace!("recv: connection refused");
                }
                Err(e) => {
                    return Err(StackError::ReceiveFailed {
                        reason: e.to_string(),
                    }
                    .into())
                }
            }
        }
        Ok(())
    }

    fn service_socket_send(&mut self) -> Result<()> {
        while let Some((raw, to)) = self.core.pop_outbound() {
            match self.socket.send_to(&raw, to) {
                Ok(_) => {}
                Err(e) if e.kind() == ErrorKind::WouldBlock => {
                    // Socket buffer full; retry on the next tick
                    self.core.requeue_outbound(raw, to);
                    break;
                }
                Err(e) if e.kind() == ErrorKind::ConnectionRefused => {
                    tracing::trace!(%to, "send: connection refused, packet dropped");
                }
                Err(e) => {
                    return Err(StackError::SendFailed {
                        reason: e.to_string(),
                    }
                    .into())
                }
            }
        }
        Ok(())
    }

    /// Process one queued inbound datagram
    ///
    /// Returns false when the queue is empty. Framing and routing problems
    /// drop the packet; protocol errors from a transaction remove it from
    /// the table and propagate.
    pub fn process_inbound_packet(&mut self) -> Result<bool> {
        let Some((raw, from)) = self.rx_raw.pop_front() else {
            return Ok(false);
        };

        let mut packet = Packet::parse_outer(&raw, from);
        if let Some(error) = &packet.error {
            tracing::trace!(%from, %error, "dropping malformed packet");
            return Ok(true);
        }

        // Drop-invariant: a packet addressed to neither the bootstrap id nor
        // us is discarded before any transaction-table access
        let dst = packet.route.dst_id;
        if dst != BOOTSTRAP_ID && dst != self.core.local.id {
            tracing::trace!(%from, dst, "dropping packet for foreign destination");
            return Ok(true);
        }

        // Resolve the claimed source peer's keys for the inner parse
        let src = packet.route.src_id;
        let verify_key = self
            .core
            .registry
            .get(src)
            .filter(|peer| peer.accepted)
            .and_then(|peer| peer.verify_key);
        let crypt_key = match packet.kinds.tail {
            TailKind::Crypt => self
                .core
                .registry
                .get(src)
                .and_then(|peer| peer.session.as_ref())
                .map(|session| session.rx),
            TailKind::None => None,
        };
        packet.parse_inner(verify_key.as_ref(), crypt_key.as_ref());
        if let Some(error) = &packet.error {
            tracing::trace!(%from, %error, "dropping unparseable packet");
            return Ok(true);
        }

        let index = TransactionIndex::from_packet(&packet);
        if let Some(mut transaction) = self.transactions.remove(&index) {
            match transaction.receive(&mut self.core, &packet) {
                Ok(Disposition::Continue) => {
                    self.transactions.insert(index, transaction);
                }
                Ok(Disposition::Complete) => {
                    tracing::debug!(%index, kind = transaction.kind_name(), "transaction complete");
                }
                Err(error) => {
                    // The transaction is already out of the table; surface the
                    // failure to the caller
                    tracing::warn!(%index, kind = transaction.kind_name(), %error, "transaction failed");
                    return Err(error.into());
                }
            }
        } else if !packet.flags.correspondent {
            self.reply(packet)?;
        } else {
            tracing::trace!(%index, "dropping stale correspondent packet");
        }
        Ok(true)
    }

    /// Route a fresh initiating packet to the matching correspondent role
    fn reply(&mut self, packet: Packet) -> Result<()> {
        match (packet.exchange, packet.kind, packet.route.sid == 0) {
            (ExchangeKind::Join, PacketKind::Request, true) => {
                let mut joinent = Joinent::start(&mut self.core, &packet)?;
                // Auto-accept: send the response straight after the ack
                joinent.accept(&mut self.core)?;
            }
            (ExchangeKind::Endow, PacketKind::Hello, false) => {
                let endowent = Endowent::start(&mut self.core, &packet)?;
                self.add_transaction(Transaction::Endowent(endowent))?;
            }
            (ExchangeKind::Message, PacketKind::Message, false) => {
                let messengent = Messengent::start(&mut self.core, &packet)?;
                // Lingers briefly so a retransmitted message is re-acked
                // without being delivered twice
                self.add_transaction(Transaction::Messengent(messengent))?;
            }
            (exchange, kind, _) => {
                tracing::trace!(
                    exchange = exchange.name(),
                    kind = kind.name(),
                    "dropping unroutable fresh packet"
                );
            }
        }
        Ok(())
    }

    /// Register a transaction; the index must be free
    pub fn add_transaction(&mut self, transaction: Transaction) -> Result<()> {
        let index = transaction.index();
        if self.transactions.contains_key(&index) {
            return Err(StackError::IndexCollision {
                index: index.to_string(),
            }
            .into());
        }
        self.transactions.insert(index, transaction);
        Ok(())
    }

    /// Remove a transaction, but only the exact instance identified by
    /// `serial`; removing someone else's entry after table churn is a no-op
    pub fn remove_transaction(&mut self, index: TransactionIndex, serial: u64) {
        if let Some(transaction) = self.transactions.get(&index) {
            if transaction.serial() == serial {
                self.transactions.remove(&index);
            } else {
                tracing::debug!(%index, "remove skipped: different transaction registered");
            }
        }
    }

    /// Enforce every live transaction's deadline, uniformly across roles
    fn tick_transactions(&mut self, now: Instant) {
        let due: Vec<(TransactionIndex, Tick, &'static str)> = self
            .transactions
            .iter()
            .filter_map(|(index, transaction)| match transaction.tick(now) {
                Tick::Alive => None,
                tick => Some((*index, tick, transaction.kind_name())),
            })
            .collect();
        for (index, tick, kind) in due {
            self.transactions.remove(&index);
            match tick {
                Tick::Expired => tracing::warn!(%index, kind, "transaction timed out"),
                Tick::Lingered => tracing::debug!(%index, kind, "transaction linger elapsed"),
                Tick::Alive => {}
            }
        }
    }

    #[cfg(test)]
    pub(crate) fn inject(&mut self, raw: Vec<u8>, from: SocketAddr) {
        self.rx_raw.push_back((raw, from));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::Value;
    use std::thread::sleep;

    fn test_stack(device_id: u32, bootstrap: SocketAddr) -> Stack {
        let config = StackConfig {
            name: format!("test-{device_id}"),
            bind: "127.0.0.1:0".parse().unwrap(),
            device_id,
            master: device_id == 1,
            sign_seed: None,
            crypt_seed: None,
            bootstrap,
            timeout: Duration::from_secs(5),
        };
        Stack::new(config).unwrap()
    }

    /// Service both stacks until the predicate holds or the round budget runs out
    fn service_until(
        a: &mut Stack,
        b: &mut Stack,
        mut done: impl FnMut(&Stack, &Stack) -> bool,
    ) -> bool {
        for _ in 0..100 {
            a.service().unwrap();
            b.service().unwrap();
            if done(a, b) {
                return true;
            }
            sleep(Duration::from_millis(2));
        }
        false
    }

    fn joined_pair() -> (Stack, Stack) {
        let mut master = test_stack(1, "127.0.0.1:9".parse().unwrap());
        let mut joiner = test_stack(0, master.local_addr());

        joiner.join(None).unwrap();
        assert!(service_until(&mut joiner, &mut master, |j, _| j
            .peer(1)
            .map(|p| p.accepted)
            .unwrap_or(false)));
        (master, joiner)
    }

    fn endowed_pair() -> (Stack, Stack) {
        let (mut master, mut joiner) = joined_pair();
        joiner.endow(1, None).unwrap();
        assert!(service_until(&mut joiner, &mut master, |j, m| {
            j.peer(1).map(|p| p.endowed).unwrap_or(false)
                && m.peer(2).map(|p| p.endowed).unwrap_or(false)
        }));
        (master, joiner)
    }

    #[test]
    fn test_join_exchange() {
        let (master, joiner) = joined_pair();

        // The master assigned us device id 2 and keyed us under it
        assert_eq!(joiner.local_id(), 2);
        let master_entry = master.peer(2).unwrap();
        assert!(master_entry.accepted);
        assert!(master_entry.verify_key.is_some());
        assert!(master_entry.crypt_key.is_some());

        // The provisional bootstrap entry was rekeyed to the master's real id
        assert!(joiner.peer(0).is_none());
        let joiner_entry = joiner.peer(1).unwrap();
        assert!(joiner_entry.accepted);
        assert!(joiner_entry.verify_key.is_some());
        assert!(joiner_entry.crypt_key.is_some());

        // Both transaction tables drained
        assert_eq!(joiner.transaction_count(), 0);
        assert_eq!(master.transaction_count(), 0);
    }

    #[test]
    fn test_endow_exchange() {
        let (master, joiner) = endowed_pair();

        let a = joiner.peer(1).unwrap();
        let b = master.peer(2).unwrap();
        assert!(a.endowed && b.endowed);

        // The derived session keys are complementary
        let ka = a.session.as_ref().unwrap();
        let kb = b.session.as_ref().unwrap();
        assert_eq!(ka.tx, kb.rx);
        assert_eq!(ka.rx, kb.tx);

        // The initiator's table drained; the correspondent lingers until its
        // grace period elapses
        assert_eq!(joiner.transaction_count(), 0);
        assert!(master.transaction_count() <= 1);
    }

    #[test]
    fn test_message_exchange() {
        let (mut master, mut joiner) = endowed_pair();

        let mut body = Body::new();
        body.insert("cmd".into(), Value::String("status".into()));
        body.insert("seq".into(), 42.into());
        joiner.message(1, body.clone()).unwrap();

        assert!(service_until(&mut joiner, &mut master, |j, _| j
            .transaction_count()
            == 0));

        let (peer_id, received) = master.received().expect("message delivered");
        assert_eq!(peer_id, 2);
        assert_eq!(received, body);
        assert!(master.received().is_none());
    }

    #[test]
    fn test_message_requires_endowed_session() {
        let (_master, mut joiner) = joined_pair();
        let result = joiner.message(1, Body::new());
        assert!(result.is_err());
    }

    #[test]
    fn test_destination_filtering() {
        let mut stack = test_stack(2, "127.0.0.1:9".parse().unwrap());

        // A well-formed join request addressed to a foreign device id must be
        // dropped before it can spawn a correspondent or register a peer
        let signer = SigningKey::generate();
        let mut packet = Packet::new(ExchangeKind::Join, PacketKind::Request);
        packet.route.src_id = 5;
        packet.route.dst_id = 7;
        packet
            .body
            .insert("verhex".into(), Value::String(hex::encode([1u8; 32])));
        packet
            .body
            .insert("pubhex".into(), Value::String(hex::encode([2u8; 32])));
        let raw = packet.pack(&signer, None).unwrap();

        stack.inject(raw, "127.0.0.1:9999".parse().unwrap());
        stack.service().unwrap();

        assert_eq!(stack.transaction_count(), 0);
        assert!(stack.peers().next().is_none());
    }

    #[test]
    fn test_stale_correspondent_packet_dropped() {
        let mut stack = test_stack(2, "127.0.0.1:9".parse().unwrap());

        // Correspondent-flagged, no matching live transaction: must be
        // dropped, not dispatched to reply (which would register a peer)
        let signer = SigningKey::generate();
        let mut packet = Packet::new(ExchangeKind::Join, PacketKind::Request);
        packet.flags.correspondent = true;
        packet.route.src_id = 5;
        packet.route.dst_id = 2;
        packet
            .body
            .insert("verhex".into(), Value::String(hex::encode([1u8; 32])));
        packet
            .body
            .insert("pubhex".into(), Value::String(hex::encode([2u8; 32])));
        let raw = packet.pack(&signer, None).unwrap();

        stack.inject(raw, "127.0.0.1:9999".parse().unwrap());
        stack.service().unwrap();

        assert_eq!(stack.transaction_count(), 0);
        assert!(stack.peers().next().is_none());
    }

    #[test]
    fn test_table_discipline() {
        let mut stack = test_stack(2, "127.0.0.1:9".parse().unwrap());

        let index = TransactionIndex {
            remote_initiated: false,
            local_id: 2,
            remote_id: 1,
            sid: 1,
            tid: 9,
            broadcast: false,
        };
        let first = Transaction::Messenger(Messenger::stub(index));
        let first_serial = first.serial();
        stack.add_transaction(first).unwrap();

        // Adding a second transaction under the same index fails loudly
        let second = Transaction::Messenger(Messenger::stub(index));
        let second_serial = second.serial();
        let result = stack.add_transaction(second);
        assert!(result.is_err());
        assert_eq!(stack.transaction_count(), 1);

        // Removing with a different instance's serial is a no-op
        stack.remove_transaction(index, second_serial);
        assert_eq!(stack.transaction_count(), 1);

        // The registered instance removes cleanly
        stack.remove_transaction(index, first_serial);
        assert_eq!(stack.transaction_count(), 0);
    }

    #[test]
    fn test_timeout_eviction() {
        // The master is bound but never serviced, so the join goes unanswered
        let master = test_stack(1, "127.0.0.1:9".parse().unwrap());
        let mut joiner = test_stack(0, master.local_addr());

        joiner.join(Some(Duration::from_millis(20))).unwrap();
        joiner.service().unwrap();
        assert_eq!(joiner.transaction_count(), 1);

        sleep(Duration::from_millis(40));
        joiner.service().unwrap();
        assert_eq!(joiner.transaction_count(), 0);
        assert!(!joiner.peer(0).map(|p| p.accepted).unwrap_or(false));
    }

    #[test]
    fn test_service_never_blocks() {
        let mut stack = test_stack(1, "127.0.0.1:9".parse().unwrap());
        // Empty socket, empty queues: a tick is a no-op, not a wait
        stack.service().unwrap();
        stack.service_socket().unwrap();
        assert!(stack.received().is_none());
    }
}
