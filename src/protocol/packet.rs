//! Packet wire format
//!
//! One datagram is four concatenated segments:
//!
//! ```text
//! head (JSON + "\r\n\r\n") | neck (signature) | body (JSON) | tail (nonce)
//! ```
//!
//! The head is a JSON object whose `hl` field holds the head's own encoded
//! byte length as two hex digits, so it is serialized with a placeholder and
//! patched afterwards. Routing fields are elided from the head when they match
//! their defaults. Packing order is body, tail, neck, head (the head needs the
//! other segments' lengths); unpacking is the reverse.
//!
//! Parse failures never raise across this boundary: they set a human-readable
//! `error` string on the packet and leave the body empty.

use std::net::SocketAddr;

use serde_json::{Map, Value};

use crate::crypto::{aead, signing};
use crate::error::PacketError;

/// Protocol version carried in the head
pub const VERSION: u8 = 1;

/// Literal end-of-head delimiter
pub const HEAD_END: &[u8] = b"\r\n\r\n";

/// Maximum encodable head length (2-hex-digit length field)
pub const MAX_HEAD_LEN: usize = 0xff;

/// Maximum datagram size serviced by the stack
pub const MAX_PACKET_SIZE: usize = 65535;

/// Head framing format
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum HeadKind {
    #[default]
    Json = 1,
}

impl TryFrom<u8> for HeadKind {
    type Error = u8;

    fn try_from(value: u8) -> Result<Self, u8> {
        match value {
            1 => Ok(Self::Json),
            other => Err(other),
        }
    }
}

/// Authentication segment scheme
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum NeckKind {
    None = 0,
    #[default]
    Sign = 1,
}

impl NeckKind {
    /// Encoded segment length for this kind
    pub fn len(&self) -> usize {
        match self {
            Self::None => 0,
            Self::Sign => signing::SIGNATURE_LEN,
        }
    }
}

impl TryFrom<u8> for NeckKind {
    type Error = u8;

    fn try_from(value: u8) -> Result<Self, u8> {
        match value {
            0 => Ok(Self::None),
            1 => Ok(Self::Sign),
            other => Err(other),
        }
    }
}

/// Payload encoding
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BodyKind {
    None = 0,
    #[default]
    Json = 1,
}

impl TryFrom<u8> for BodyKind {
    type Error = u8;

    fn try_from(value: u8) -> Result<Self, u8> {
        match value {
            0 => Ok(Self::None),
            1 => Ok(Self::Json),
            other => Err(other),
        }
    }
}

/// Integrity/encryption scheme for the body
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TailKind {
    #[default]
    None = 0,
    /// Body is XChaCha20-Poly1305 ciphertext under the session key; the tail
    /// carries the 24-byte nonce.
    Crypt = 1,
}

impl TailKind {
    /// Encoded segment length for this kind
    pub fn len(&self) -> usize {
        match self {
            Self::None => 0,
            Self::Crypt => aead::NONCE_LEN,
        }
    }
}

impl TryFrom<u8> for TailKind {
    type Error = u8;

    fn try_from(value: u8) -> Result<Self, u8> {
        match value {
            0 => Ok(Self::None),
            1 => Ok(Self::Crypt),
            other => Err(other),
        }
    }
}

/// Step within an exchange
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacketKind {
    Request = 1,
    Ack = 2,
    Response = 3,
    Hello = 4,
    Cookie = 5,
    Initiate = 6,
    Message = 7,
}

impl PacketKind {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Request => "request",
            Self::Ack => "ack",
            Self::Response => "response",
            Self::Hello => "hello",
            Self::Cookie => "cookie",
            Self::Initiate => "initiate",
            Self::Message => "message",
        }
    }
}

impl TryFrom<u8> for PacketKind {
    type Error = u8;

    fn try_from(value: u8) -> Result<Self, u8> {
        match value {
            1 => Ok(Self::Request),
            2 => Ok(Self::Ack),
            3 => Ok(Self::Response),
            4 => Ok(Self::Hello),
            5 => Ok(Self::Cookie),
            6 => Ok(Self::Initiate),
            7 => Ok(Self::Message),
            other => Err(other),
        }
    }
}

/// Exchange (transaction) kind
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExchangeKind {
    Join = 1,
    Endow = 2,
    Message = 3,
}

impl ExchangeKind {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Join => "join",
            Self::Endow => "endow",
            Self::Message => "message",
        }
    }
}

impl TryFrom<u8> for ExchangeKind {
    type Error = u8;

    fn try_from(value: u8) -> Result<Self, u8> {
        match value {
            1 => Ok(Self::Join),
            2 => Ok(Self::Endow),
            3 => Ok(Self::Message),
            other => Err(other),
        }
    }
}

/// Segment kinds for one packet
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Kinds {
    pub head: HeadKind,
    pub neck: NeckKind,
    pub body: BodyKind,
    pub tail: TailKind,
}

/// Packed flag byte, carried as two hex digits in the head
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Flags {
    /// Sender is the correspondent (responder) side of its transaction
    pub correspondent: bool,
    /// Broadcast packet
    pub broadcast: bool,
    /// Exchange is in a pending sub-state
    pub pending: bool,
    /// Addressed to all peers
    pub all: bool,
}

impl Flags {
    pub fn pack(&self) -> u8 {
        (self.correspondent as u8)
            | (self.broadcast as u8) << 1
            | (self.pending as u8) << 2
            | (self.all as u8) << 3
    }

    pub fn unpack(byte: u8) -> Self {
        Self {
            correspondent: byte & 0x01 != 0,
            broadcast: byte & 0x02 != 0,
            pending: byte & 0x04 != 0,
            all: byte & 0x08 != 0,
        }
    }
}

/// Fixed-schema routing fields
///
/// Distinct from the free-form body mapping: every field here has a known key
/// and type, and defaults are elided from the encoded head.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Route {
    pub src_host: String,
    pub src_port: u16,
    pub dst_host: String,
    pub dst_port: u16,
    /// Source peer id; 0 means unset/bootstrap
    pub src_id: u32,
    /// Destination peer id; 0 is reserved for broadcast/bootstrap
    pub dst_id: u32,
    /// Sequence id; 0 is reserved for the join bootstrap exchange
    pub sid: u32,
    /// Transaction id
    pub tid: u32,
}

impl Default for Route {
    fn default() -> Self {
        Self {
            src_host: String::new(),
            src_port: 0,
            dst_host: String::new(),
            dst_port: 0,
            src_id: 0,
            dst_id: 0,
            sid: 0,
            tid: 0,
        }
    }
}

impl Route {
    /// Build the routing fields for a packet from `src` to `dst`
    pub fn between(
        src: SocketAddr,
        dst: SocketAddr,
        src_id: u32,
        dst_id: u32,
        sid: u32,
        tid: u32,
    ) -> Self {
        Self {
            src_host: src.ip().to_string(),
            src_port: src.port(),
            dst_host: dst.ip().to_string(),
            dst_port: dst.port(),
            src_id,
            dst_id,
            sid,
            tid,
        }
    }
}

/// Ordered application body mapping
pub type Body = Map<String, Value>;

/// One unit of transmission, either fully composed or fully parsed
///
/// A packet that failed to parse records the failure in `error` and must not
/// be dispatched to a transaction.
#[derive(Debug, Clone)]
pub struct Packet {
    pub kinds: Kinds,
    pub exchange: ExchangeKind,
    pub kind: PacketKind,
    pub route: Route,
    pub flags: Flags,
    pub body: Body,
    /// Human-readable parse failure, if any
    pub error: Option<String>,
    /// Observed source address (reception only)
    pub from: Option<SocketAddr>,
    /// Raw datagram and segment lengths (reception only)
    raw: Vec<u8>,
    head_len: usize,
    neck_len: usize,
    body_len: usize,
    tail_len: usize,
}

impl Packet {
    /// Create a fresh packet for composition
    pub fn new(exchange: ExchangeKind, kind: PacketKind) -> Self {
        Self {
            kinds: Kinds::default(),
            exchange,
            kind,
            route: Route::default(),
            flags: Flags::default(),
            body: Body::new(),
            error: None,
            from: None,
            raw: Vec::new(),
            head_len: 0,
            neck_len: 0,
            body_len: 0,
            tail_len: 0,
        }
    }

    /// Compose the packet into a datagram
    ///
    /// Packing order: body, tail, neck, head. The signature (neck kind
    /// `Sign`) covers `head || body || tail`. A `Crypt` tail requires the
    /// session transmit key.
    pub fn pack(
        &self,
        signer: &signing::SigningKey,
        crypt_key: Option<&[u8; 32]>,
    ) -> Result<Vec<u8>, PacketError> {
        // Body first
        let plain = match self.kinds.body {
            BodyKind::None => Vec::new(),
            BodyKind::Json => serde_json::to_vec(&self.body).map_err(|_| PacketError::BodyNotMap)?,
        };

        // Tail next: encryption replaces the body bytes with ciphertext and
        // puts the nonce in the tail
        let (body_bytes, tail_bytes) = match self.kinds.tail {
            TailKind::None => (plain, Vec::new()),
            TailKind::Crypt => {
                let key = crypt_key.ok_or(PacketError::MissingKeys {
                    what: "session",
                    kind: "tail",
                })?;
                let nonce = aead::random_nonce();
                let cipher = aead::seal(key, &nonce, &plain, &[])?;
                (cipher, nonce.to_vec())
            }
        };

        // Head last, now that every other length is known
        let head = self.pack_head(body_bytes.len(), tail_bytes.len())?;

        // Neck signature over head || body || tail
        let neck = match self.kinds.neck {
            NeckKind::None => Vec::new(),
            NeckKind::Sign => {
                let mut message =
                    Vec::with_capacity(head.len() + body_bytes.len() + tail_bytes.len());
                message.extend_from_slice(&head);
                message.extend_from_slice(&body_bytes);
                message.extend_from_slice(&tail_bytes);
                signer.sign(&message).to_vec()
            }
        };

        let mut packed =
            Vec::with_capacity(head.len() + neck.len() + body_bytes.len() + tail_bytes.len());
        packed.extend_from_slice(&head);
        packed.extend_from_slice(&neck);
        packed.extend_from_slice(&body_bytes);
        packed.extend_from_slice(&tail_bytes);
        Ok(packed)
    }

    /// Encode the head segment, patching the self-referential `hl` field
    fn pack_head(&self, body_len: usize, tail_len: usize) -> Result<Vec<u8>, PacketError> {
        let mut head = Map::new();
        head.insert("hk".into(), (self.kinds.head as u8).into());
        head.insert("hl".into(), Value::String("00".into()));
        head.insert("vn".into(), VERSION.into());
        head.insert("pk".into(), (self.kind as u8).into());
        head.insert("xk".into(), (self.exchange as u8).into());
        head.insert("nk".into(), (self.kinds.neck as u8).into());
        head.insert("nl".into(), self.kinds.neck.len().into());
        head.insert("bk".into(), (self.kinds.body as u8).into());
        head.insert("bl".into(), body_len.into());
        head.insert("tk".into(), (self.kinds.tail as u8).into());
        head.insert("tl".into(), tail_len.into());
        head.insert(
            "fg".into(),
            Value::String(format!("{:02x}", self.flags.pack())),
        );

        // Routing fields are elided when equal to their defaults
        let defaults = Route::default();
        if self.route.src_host != defaults.src_host {
            head.insert("sh".into(), Value::String(self.route.src_host.clone()));
        }
        if self.route.src_port != defaults.src_port {
            head.insert("sp".into(), self.route.src_port.into());
        }
        if self.route.dst_host != defaults.dst_host {
            head.insert("dh".into(), Value::String(self.route.dst_host.clone()));
        }
        if self.route.dst_port != defaults.dst_port {
            head.insert("dp".into(), self.route.dst_port.into());
        }
        if self.route.src_id != defaults.src_id {
            head.insert("se".into(), self.route.src_id.into());
        }
        if self.route.dst_id != defaults.dst_id {
            head.insert("de".into(), self.route.dst_id.into());
        }
        if self.route.sid != defaults.sid {
            head.insert("si".into(), self.route.sid.into());
        }
        if self.route.tid != defaults.tid {
            head.insert("ti".into(), self.route.tid.into());
        }

        let mut encoded =
            serde_json::to_vec(&Value::Object(head)).map_err(|_| PacketError::BodyNotMap)?;
        encoded.extend_from_slice(HEAD_END);

        let total = encoded.len();
        if total > MAX_HEAD_LEN {
            return Err(PacketError::HeadOversize { len: total });
        }

        // Patch the placeholder with the true length; the placeholder occurs
        // exactly once, immediately after the leading "hk" field
        let placeholder = b"\"hl\":\"00\"";
        let pos = find_subslice(&encoded, placeholder)
            .expect("hl placeholder is always serialized");
        let patched = format!("\"hl\":\"{:02x}\"", total);
        encoded.splice(pos..pos + placeholder.len(), patched.into_bytes());

        Ok(encoded)
    }

    /// Parse the outer framing (head and segment boundaries) of a datagram
    ///
    /// Never fails: framing problems are recorded in `error` and the body is
    /// left empty. The caller must check `error` before dispatching.
    pub fn parse_outer(raw: &[u8], from: SocketAddr) -> Self {
        let mut packet = Self::new(ExchangeKind::Message, PacketKind::Message);
        packet.from = Some(from);
        packet.raw = raw.to_vec();

        // Leading bytes must match the JSON head signature
        if !raw.starts_with(b"{\"hk\":") {
            packet.error = Some("unknown head kind".into());
            return packet;
        }

        let Some(end) = find_subslice(raw, HEAD_END) else {
            packet.error = Some("missing end-of-head delimiter".into());
            return packet;
        };
        let head_len = end + HEAD_END.len();

        let head: Map<String, Value> = match serde_json::from_slice(&raw[..end]) {
            Ok(Value::Object(map)) => map,
            _ => {
                packet.error = Some("malformed head json".into());
                return packet;
            }
        };

        if let Err(error) = packet.read_head(&head, head_len, raw.len()) {
            packet.error = Some(error);
            return packet;
        }
        packet.head_len = head_len;
        packet
    }

    /// Extract and validate head fields; returns an error description on failure
    fn read_head(
        &mut self,
        head: &Map<String, Value>,
        head_len: usize,
        raw_len: usize,
    ) -> Result<(), String> {
        let hk = req_u8(head, "hk")?;
        self.kinds.head =
            HeadKind::try_from(hk).map_err(|other| format!("unknown head kind {other}"))?;

        // The self-referential length field must match what was actually read
        let hl = match head.get("hl").and_then(Value::as_str) {
            Some(text) => usize::from_str_radix(text, 16)
                .map_err(|_| "malformed head length field".to_string())?,
            None => return Err("missing head length field".into()),
        };
        if hl != head_len {
            return Err(format!(
                "head length mismatch: declared {hl}, actual {head_len}"
            ));
        }

        let vn = req_u8(head, "vn")?;
        if vn != VERSION {
            return Err(format!("unsupported protocol version {vn}"));
        }

        let pk = req_u8(head, "pk")?;
        self.kind =
            PacketKind::try_from(pk).map_err(|other| format!("unknown packet kind {other}"))?;

        let xk = req_u8(head, "xk")?;
        self.exchange =
            ExchangeKind::try_from(xk).map_err(|other| format!("unknown exchange kind {other}"))?;

        let nk = req_u8(head, "nk")?;
        self.kinds.neck =
            NeckKind::try_from(nk).map_err(|other| format!("unknown neck kind {other}"))?;

        let bk = req_u8(head, "bk")?;
        self.kinds.body =
            BodyKind::try_from(bk).map_err(|other| format!("unknown body kind {other}"))?;

        let tk = req_u8(head, "tk")?;
        self.kinds.tail =
            TailKind::try_from(tk).map_err(|other| format!("unknown tail kind {other}"))?;

        self.neck_len = req_usize(head, "nl")?;
        self.body_len = req_usize(head, "bl")?;
        self.tail_len = req_usize(head, "tl")?;

        if self.neck_len != self.kinds.neck.len() {
            return Err("neck length does not match neck kind".into());
        }
        if self.kinds.tail != TailKind::None && self.tail_len != self.kinds.tail.len() {
            return Err("tail length does not match tail kind".into());
        }
        if head_len + self.neck_len + self.body_len + self.tail_len != raw_len {
            return Err("packet length mismatch".into());
        }

        let fg = match head.get("fg").and_then(Value::as_str) {
            Some(text) => {
                u8::from_str_radix(text, 16).map_err(|_| "malformed flag field".to_string())?
            }
            None => return Err("missing flag field".into()),
        };
        self.flags = Flags::unpack(fg);

        // Routing fields fall back to their defaults when absent
        let defaults = Route::default();
        self.route = Route {
            src_host: head
                .get("sh")
                .and_then(Value::as_str)
                .map(str::to_string)
                .unwrap_or(defaults.src_host),
            src_port: head
                .get("sp")
                .and_then(Value::as_u64)
                .map(|v| v as u16)
                .unwrap_or(defaults.src_port),
            dst_host: head
                .get("dh")
                .and_then(Value::as_str)
                .map(str::to_string)
                .unwrap_or(defaults.dst_host),
            dst_port: head
                .get("dp")
                .and_then(Value::as_u64)
                .map(|v| v as u16)
                .unwrap_or(defaults.dst_port),
            src_id: head
                .get("se")
                .and_then(Value::as_u64)
                .map(|v| v as u32)
                .unwrap_or(defaults.src_id),
            dst_id: head
                .get("de")
                .and_then(Value::as_u64)
                .map(|v| v as u32)
                .unwrap_or(defaults.dst_id),
            sid: head
                .get("si")
                .and_then(Value::as_u64)
                .map(|v| v as u32)
                .unwrap_or(defaults.sid),
            tid: head
                .get("ti")
                .and_then(Value::as_u64)
                .map(|v| v as u32)
                .unwrap_or(defaults.tid),
        };

        Ok(())
    }

    /// Parse the inner segments: verify the neck, decrypt the tail, decode the body
    ///
    /// `verify_key` is the source peer's identity key when known; signatures
    /// from not-yet-accepted peers cannot be checked and are let through.
    /// `crypt_key` is the session receive key, required for a `Crypt` tail.
    /// Failures are recorded in `error`.
    pub fn parse_inner(
        &mut self,
        verify_key: Option<&signing::VerifyingKey>,
        crypt_key: Option<&[u8; 32]>,
    ) {
        if self.error.is_some() {
            return;
        }

        let head_end = self.head_len;
        let neck_end = head_end + self.neck_len;
        let body_end = neck_end + self.body_len;
        let tail_end = body_end + self.tail_len;

        if self.kinds.neck == NeckKind::Sign {
            if let Some(key) = verify_key {
                let mut message = Vec::with_capacity(self.head_len + self.body_len + self.tail_len);
                message.extend_from_slice(&self.raw[..head_end]);
                message.extend_from_slice(&self.raw[neck_end..tail_end]);
                if key.verify(&message, &self.raw[head_end..neck_end]).is_err() {
                    self.error = Some("neck signature verification failed".into());
                    return;
                }
            } else {
                tracing::trace!("neck signature from unverified peer accepted");
            }
        }

        let plain = match self.kinds.tail {
            TailKind::None => self.raw[neck_end..body_end].to_vec(),
            TailKind::Crypt => {
                let Some(key) = crypt_key else {
                    self.error = Some("missing session keys for crypt tail".into());
                    return;
                };
                let mut nonce = [0u8; aead::NONCE_LEN];
                nonce.copy_from_slice(&self.raw[body_end..tail_end]);
                match aead::open(key, &nonce, &self.raw[neck_end..body_end], &[]) {
                    Ok(plain) => plain,
                    Err(_) => {
                        self.error = Some("crypt tail decryption failed".into());
                        return;
                    }
                }
            }
        };

        match self.kinds.body {
            BodyKind::None => {
                if !plain.is_empty() {
                    self.error = Some("nonzero body length for empty body kind".into());
                }
            }
            BodyKind::Json => match serde_json::from_slice(&plain) {
                Ok(Value::Object(map)) => self.body = map,
                Ok(_) => self.error = Some("body is not a mapping".into()),
                Err(_) => self.error = Some("malformed body json".into()),
            },
        }
    }

    /// Length of the encoded head segment (reception only)
    pub fn head_len(&self) -> usize {
        self.head_len
    }
}

/// Read a required numeric head field
fn req_u8(head: &Map<String, Value>, key: &str) -> Result<u8, String> {
    head.get(key)
        .and_then(Value::as_u64)
        .map(|v| v as u8)
        .ok_or_else(|| format!("missing head field {key}"))
}

fn req_usize(head: &Map<String, Value>, key: &str) -> Result<usize, String> {
    head.get(key)
        .and_then(Value::as_u64)
        .map(|v| v as usize)
        .ok_or_else(|| format!("missing head field {key}"))
}

/// Locate the first occurrence of `needle` in `haystack`
fn find_subslice(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::signing::SigningKey;

    fn test_addr() -> SocketAddr {
        "127.0.0.1:7530".parse().unwrap()
    }

    fn sample_packet(kinds: Kinds) -> Packet {
        let mut packet = Packet::new(ExchangeKind::Message, PacketKind::Message);
        packet.kinds = kinds;
        packet.route = Route {
            src_host: "127.0.0.1".into(),
            src_port: 7531,
            dst_host: "127.0.0.1".into(),
            dst_port: 7530,
            src_id: 2,
            dst_id: 1,
            sid: 1,
            tid: 3,
        };
        packet.flags.correspondent = true;
        if kinds.body == BodyKind::Json {
            packet.body.insert("cmd".into(), "status".into());
            packet.body.insert("args".into(), Value::Array(vec![1.into(), 2.into()]));
        }
        packet
    }

    #[test]
    fn test_roundtrip_all_kind_combinations() {
        let signer = SigningKey::generate();
        let verify = signer.verifying_key();
        let session_key = [9u8; 32];

        for neck in [NeckKind::None, NeckKind::Sign] {
            for body in [BodyKind::None, BodyKind::Json] {
                for tail in [TailKind::None, TailKind::Crypt] {
                    let kinds = Kinds {
                        head: HeadKind::Json,
                        neck,
                        body,
                        tail,
                    };
                    let packet = sample_packet(kinds);
                    let crypt = (tail == TailKind::Crypt).then_some(&session_key);

                    let raw = packet.pack(&signer, crypt).unwrap();

                    let mut parsed = Packet::parse_outer(&raw, test_addr());
                    assert_eq!(parsed.error, None, "outer parse failed for {kinds:?}");
                    parsed.parse_inner(Some(&verify), crypt);
                    assert_eq!(parsed.error, None, "inner parse failed for {kinds:?}");

                    assert_eq!(parsed.kinds, packet.kinds);
                    assert_eq!(parsed.route, packet.route);
                    assert_eq!(parsed.flags, packet.flags);
                    assert_eq!(parsed.body, packet.body);
                }
            }
        }
    }

    #[test]
    fn test_self_referential_head_length() {
        let signer = SigningKey::generate();
        let packet = sample_packet(Kinds::default());
        let raw = packet.pack(&signer, None).unwrap();

        let parsed = Packet::parse_outer(&raw, test_addr());
        assert_eq!(parsed.error, None);

        // The declared hl must equal the actual encoded head length
        let end = raw
            .windows(HEAD_END.len())
            .position(|w| w == HEAD_END)
            .unwrap();
        let head: Map<String, Value> = serde_json::from_slice(&raw[..end]).unwrap();
        let declared = usize::from_str_radix(head["hl"].as_str().unwrap(), 16).unwrap();
        assert_eq!(declared, parsed.head_len());
        assert_eq!(declared, end + HEAD_END.len());
    }

    #[test]
    fn test_default_route_fields_elided() {
        let signer = SigningKey::generate();
        let mut packet = Packet::new(ExchangeKind::Join, PacketKind::Request);
        packet.kinds.body = BodyKind::None;

        let raw = packet.pack(&signer, None).unwrap();
        let end = raw
            .windows(HEAD_END.len())
            .position(|w| w == HEAD_END)
            .unwrap();
        let head: Map<String, Value> = serde_json::from_slice(&raw[..end]).unwrap();

        // All-default routing fields are not encoded
        for key in ["sh", "sp", "dh", "dp", "se", "de", "si", "ti"] {
            assert!(!head.contains_key(key), "default field {key} was encoded");
        }

        let mut parsed = Packet::parse_outer(&raw, test_addr());
        parsed.parse_inner(None, None);
        assert_eq!(parsed.error, None);
        assert_eq!(parsed.route, Route::default());
    }

    #[test]
    fn test_garbage_leader_degrades_to_unknown_head() {
        let parsed = Packet::parse_outer(b"not a packet at all", test_addr());
        assert_eq!(parsed.error.as_deref(), Some("unknown head kind"));
        assert!(parsed.body.is_empty());
    }

    #[test]
    fn test_missing_delimiter_is_recorded() {
        let parsed = Packet::parse_outer(b"{\"hk\":1,\"hl\":\"0a\"}", test_addr());
        assert!(parsed
            .error
            .as_deref()
            .unwrap()
            .contains("end-of-head delimiter"));
    }

    #[test]
    fn test_truncated_packet_is_recorded() {
        let signer = SigningKey::generate();
        let packet = sample_packet(Kinds::default());
        let raw = packet.pack(&signer, None).unwrap();

        let parsed = Packet::parse_outer(&raw[..raw.len() - 3], test_addr());
        assert!(parsed.error.as_deref().unwrap().contains("length mismatch"));
    }

    #[test]
    fn test_scalar_body_rejected() {
        let signer = SigningKey::generate();
        let mut packet = sample_packet(Kinds {
            neck: NeckKind::None,
            ..Kinds::default()
        });
        packet.body.clear();
        let mut raw = packet.pack(&signer, None).unwrap();

        // Splice a scalar body in place of the empty JSON object
        let body_start = raw.len() - 2;
        raw.truncate(body_start);
        raw.extend_from_slice(b"42");

        let mut parsed = Packet::parse_outer(&raw, test_addr());
        assert_eq!(parsed.error, None);
        parsed.parse_inner(None, None);
        assert_eq!(parsed.error.as_deref(), Some("body is not a mapping"));
    }

    #[test]
    fn test_signature_tamper_detected() {
        let signer = SigningKey::generate();
        let verify = signer.verifying_key();
        let packet = sample_packet(Kinds::default());
        let mut raw = packet.pack(&signer, None).unwrap();

        // Flip one byte of the body
        let last = raw.len() - 1;
        raw[last] ^= 0x01;

        let mut parsed = Packet::parse_outer(&raw, test_addr());
        // Outer lengths still line up; the signature must catch the flip
        assert_eq!(parsed.error, None);
        parsed.parse_inner(Some(&verify), None);
        assert!(parsed
            .error
            .as_deref()
            .unwrap()
            .contains("signature verification failed"));
    }

    #[test]
    fn test_crypt_tail_requires_session_key() {
        let signer = SigningKey::generate();
        let session_key = [3u8; 32];
        let packet = sample_packet(Kinds {
            tail: TailKind::Crypt,
            ..Kinds::default()
        });
        let raw = packet.pack(&signer, Some(&session_key)).unwrap();

        let mut parsed = Packet::parse_outer(&raw, test_addr());
        parsed.parse_inner(Some(&signer.verifying_key()), None);
        assert!(parsed.error.as_deref().unwrap().contains("missing session keys"));

        // Wrong key fails authenticated decryption
        let mut parsed = Packet::parse_outer(&raw, test_addr());
        parsed.parse_inner(Some(&signer.verifying_key()), Some(&[4u8; 32]));
        assert!(parsed.error.as_deref().unwrap().contains("decryption failed"));
    }

    #[test]
    fn test_flags_roundtrip() {
        let flags = Flags {
            correspondent: true,
            broadcast: false,
            pending: true,
            all: false,
        };
        assert_eq!(Flags::unpack(flags.pack()), flags);
        assert_eq!(flags.pack(), 0x05);
    }
}
