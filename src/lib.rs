//! tether - connection-oriented transport over UDP datagrams
//!
//! A transport stack for inter-process communication between a
//! command-dispatch client and a routing daemon:
//!
//! - Four-segment packet framing (head/neck/body/tail) with signed necks
//! - A join handshake that exchanges long-term identity keys
//! - An endow handshake (cookie exchange) that derives per-session keys
//! - Acked message delivery under session encryption
//! - A poll-driven stack: no internal threads, no async runtime in the core
//!
//! # Usage
//!
//! ```no_run
//! use tether::{Stack, StackConfig};
//!
//! fn main() -> tether::Result<()> {
//!     let config = StackConfig::from_file("tether.conf")?;
//!     let mut stack = Stack::new(config)?;
//!     stack.join(None)?;
//!     loop {
//!         stack.service()?;
//!         std::thread::sleep(std::time::Duration::from_millis(50));
//!     }
//! }
//! ```

pub mod config;
pub mod crypto;
pub mod error;
pub mod protocol;
pub mod stack;

pub use config::StackConfig;
pub use error::{Result, TetherError};
pub use protocol::{Body, TransactionIndex};
pub use stack::Stack;
