//! Error types for the tether transport stack

use thiserror::Error;

/// Main error type for tether
#[derive(Error, Debug)]
pub enum TetherError {
    /// Configuration errors
    #[error("Config error: {0}")]
    Config(#[from] ConfigError),

    /// Cryptographic errors
    #[error("Crypto error: {0}")]
    Crypto(#[from] CryptoError),

    /// Packet composition errors
    #[error("Packet error: {0}")]
    Packet(#[from] PacketError),

    /// Transaction protocol errors
    #[error("Transaction error: {0}")]
    Transaction(#[from] TransactionError),

    /// Stack-level errors
    #[error("Stack error: {0}")]
    Stack(#[from] StackError),

    /// System I/O errors
    #[error("System error: {0}")]
    System(#[from] std::io::Error),
}

/// Configuration parsing errors
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("File not found: {path}")]
    FileNotFound { path: String },

    #[error("Invalid config format at line {line}: {message}")]
    ParseError { line: usize, message: String },

    #[error("Invalid base64 key: {field}")]
    InvalidKey { field: String },

    #[error("Invalid address: {value}")]
    InvalidAddress { value: String },

    #[error("Missing required field: {field}")]
    MissingField { field: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Cryptographic operation errors
#[derive(Error, Debug)]
pub enum CryptoError {
    #[error("Encryption failed")]
    Encryption,

    #[error("Decryption failed: invalid ciphertext or authentication tag")]
    Decryption,

    #[error("Invalid key length: expected {expected}, got {got}")]
    InvalidKeyLength { expected: usize, got: usize },

    #[error("Invalid signature")]
    InvalidSignature,

    #[error("Signature verification failed")]
    SignatureVerification,
}

/// Packet composition errors
///
/// Parse-side framing failures are recorded as a string on the packet rather
/// than surfaced through this type; only composition (pack) uses it.
#[derive(Error, Debug)]
pub enum PacketError {
    #[error("Packet head too large: {len} bytes exceeds the 2-hex-digit length field")]
    HeadOversize { len: usize },

    #[error("Body is not a mapping")]
    BodyNotMap,

    #[error("Missing {what} key material for {kind} segment")]
    MissingKeys { what: &'static str, kind: &'static str },

    #[error("Crypto error: {0}")]
    Crypto(#[from] CryptoError),
}

/// Transaction protocol errors
///
/// These indicate a peer that must be treated as failed for the exchange; the
/// transaction removes itself from the table as the error surfaces.
#[derive(Error, Debug)]
pub enum TransactionError {
    #[error("Missing required field in {packet} body: {field}")]
    MissingField { packet: &'static str, field: &'static str },

    #[error("Device id mismatch: expected {expected}, got {got}")]
    IdMismatch { expected: u32, got: u32 },

    #[error("Hello plaintext does not match sealed block")]
    PlaintextMismatch,

    #[error("Initiate cookie does not match the one issued")]
    CookieMismatch,

    #[error("Vouched key does not match the hello ephemeral key")]
    VouchMismatch,

    #[error("Peer {id} has not completed the join handshake")]
    NotAccepted { id: u32 },

    #[error("Peer {id} has no endowed session")]
    NotEndowed { id: u32 },

    #[error("Peer registry rekey failed: id {id} already occupied")]
    RekeyCollision { id: u32 },

    #[error("Crypto error: {0}")]
    Crypto(#[from] CryptoError),

    #[error("Packet error: {0}")]
    Packet(#[from] PacketError),
}

/// Stack-level errors
#[derive(Error, Debug)]
pub enum StackError {
    #[error("Socket bind failed on {addr}: {reason}")]
    BindFailed { addr: String, reason: String },

    #[error("Send failed: {reason}")]
    SendFailed { reason: String },

    #[error("Receive failed: {reason}")]
    ReceiveFailed { reason: String },

    #[error("Transaction index already registered: {index}")]
    IndexCollision { index: String },

    #[error("Unknown peer id: {id}")]
    UnknownPeer { id: u32 },

    #[error("Peer id already occupied: {id}")]
    PeerIdOccupied { id: u32 },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl TetherError {
    /// Check if this error is recoverable by re-initiating the exchange
    pub fn is_recoverable(&self) -> bool {
        match self {
            // Fatal errors
            Self::Config(_) => false,
            Self::Stack(StackError::BindFailed { .. }) => false,

            // A failed handshake can be re-initiated from scratch
            Self::Transaction(_) => true,
            Self::Crypto(CryptoError::Decryption) => true,
            Self::Crypto(CryptoError::SignatureVerification) => true,
            Self::Stack(StackError::SendFailed { .. }) => true,
            Self::Stack(StackError::ReceiveFailed { .. }) => true,

            // Default to non-recoverable for safety
            _ => false,
        }
    }

    /// Get the exit code for this error
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::Config(_) => 1,
            Self::Stack(_) => 3,
            Self::Transaction(_) => 4,
            Self::Crypto(_) => 5,
            Self::Packet(_) => 6,
            Self::System(_) => 7,
        }
    }
}

/// Result type alias for tether operations
pub type Result<T> = std::result::Result<T, TetherError>;
