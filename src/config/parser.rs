//! Configuration file parser
//!
//! Parses INI-style `.conf` files:
//!
//! ```text
//! [Stack]
//! Name = alpha
//! Host = 0.0.0.0
//! Port = 7531
//! Master = false
//! SignKey = <base64 32-byte seed>
//! CryptKey = <base64 32-byte seed>
//! Timeout = 5
//!
//! [Bootstrap]
//! Host = 127.0.0.1
//! Port = 7530
//! ```
//!
//! Key material is optional; a stack without configured seeds generates
//! fresh keys at startup.

use std::net::{IpAddr, SocketAddr};
use std::path::Path;
use std::time::Duration;

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};

use crate::error::ConfigError;

/// Device id a master stack runs under
const MASTER_DEVICE_ID: u32 = 1;

/// Complete stack configuration
#[derive(Debug, Clone)]
pub struct StackConfig {
    /// Human-readable stack name, used in logs
    pub name: String,
    /// Address to bind the datagram socket to
    pub bind: SocketAddr,
    /// Our device id: 1 for a master, 0 (unassigned) otherwise
    pub device_id: u32,
    /// Whether this stack answers join requests as the bootstrap master
    pub master: bool,
    /// Long-term signing key seed; generated when absent
    pub sign_seed: Option<[u8; 32]>,
    /// Long-term encryption key seed; generated when absent
    pub crypt_seed: Option<[u8; 32]>,
    /// Well-known master address used to provision the bootstrap peer
    pub bootstrap: SocketAddr,
    /// Default transaction timeout
    pub timeout: Duration,
}

impl StackConfig {
    /// Parse a configuration from a file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                ConfigError::FileNotFound {
                    path: path.display().to_string(),
                }
            } else {
                ConfigError::Io(e)
            }
        })?;
        Self::parse(&content)
    }

    /// Parse a configuration from a string
    pub fn parse(content: &str) -> Result<Self, ConfigError> {
        let mut builder = Builder::default();
        let mut current_section: Option<Section> = None;

        for (line_num, line) in content.lines().enumerate() {
            let line_num = line_num + 1; // 1-indexed
            let line = line.trim();

            // Skip empty lines and comments
            if line.is_empty() || line.starts_with('#') {
                continue;
            }

            // Check for section headers
            if line.eq_ignore_ascii_case("[stack]") {
                current_section = Some(Section::Stack);
                continue;
            } else if line.eq_ignore_ascii_case("[bootstrap]") {
                current_section = Some(Section::Bootstrap);
                continue;
            }

            // Parse key = value pairs
            let Some((key, value)) = line.split_once('=') else {
                return Err(ConfigError::ParseError {
                    line: line_num,
                    message: format!("Expected 'key = value', got: {}", line),
                });
            };

            let key = key.trim().to_lowercase();
            let value = value.trim();

            match current_section {
                Some(Section::Stack) => match key.as_str() {
                    "name" => builder.name = Some(value.to_string()),
                    "host" => {
                        builder.host = Some(parse_host(value)?);
                    }
                    "port" => {
                        builder.port = Some(value.parse().map_err(|_| ConfigError::ParseError {
                            line: line_num,
                            message: format!("Invalid Port: {}", value),
                        })?);
                    }
                    "master" => {
                        builder.master = value.parse().map_err(|_| ConfigError::ParseError {
                            line: line_num,
                            message: format!("Invalid Master flag: {}", value),
                        })?;
                    }
                    "signkey" => {
                        builder.sign_seed = Some(parse_key(value, "SignKey")?);
                    }
                    "cryptkey" => {
                        builder.crypt_seed = Some(parse_key(value, "CryptKey")?);
                    }
                    "timeout" => {
                        let secs: u64 = value.parse().map_err(|_| ConfigError::ParseError {
                            line: line_num,
                            message: format!("Invalid Timeout: {}", value),
                        })?;
                        builder.timeout = Some(Duration::from_secs(secs));
                    }
                    _ => {
                        // Unknown key, ignore (forward compatibility)
                        tracing::debug!("Unknown stack key: {}", key);
                    }
                },
                Some(Section::Bootstrap) => match key.as_str() {
                    "host" => {
                        builder.bootstrap_host = Some(parse_host(value)?);
                    }
                    "port" => {
                        builder.bootstrap_port =
                            Some(value.parse().map_err(|_| ConfigError::ParseError {
                                line: line_num,
                                message: format!("Invalid bootstrap Port: {}", value),
                            })?);
                    }
                    _ => {
                        tracing::debug!("Unknown bootstrap key: {}", key);
                    }
                },
                None => {
                    return Err(ConfigError::ParseError {
                        line: line_num,
                        message: "Configuration value outside of any section".to_string(),
                    });
                }
            }
        }

        builder.build()
    }
}

/// Section type during parsing
#[derive(Clone, Copy)]
enum Section {
    Stack,
    Bootstrap,
}

/// Accumulates fields while parsing
#[derive(Default)]
struct Builder {
    name: Option<String>,
    host: Option<IpAddr>,
    port: Option<u16>,
    master: bool,
    sign_seed: Option<[u8; 32]>,
    crypt_seed: Option<[u8; 32]>,
    bootstrap_host: Option<IpAddr>,
    bootstrap_port: Option<u16>,
    timeout: Option<Duration>,
}

impl Builder {
    fn build(self) -> Result<StackConfig, ConfigError> {
        let host = self.host.unwrap_or(IpAddr::from([0u8, 0, 0, 0]));
        let port = self.port.unwrap_or(0);

        // A master is its own bootstrap; everyone else must name one
        let bootstrap = match (self.bootstrap_host, self.bootstrap_port) {
            (Some(bootstrap_host), Some(bootstrap_port)) => {
                SocketAddr::new(bootstrap_host, bootstrap_port)
            }
            (None, None) if self.master => SocketAddr::new(host, port),
            _ => {
                return Err(ConfigError::MissingField {
                    field: "[Bootstrap] Host/Port".to_string(),
                })
            }
        };

        Ok(StackConfig {
            name: self.name.unwrap_or_else(|| "tether".to_string()),
            bind: SocketAddr::new(host, port),
            device_id: if self.master { MASTER_DEVICE_ID } else { 0 },
            master: self.master,
            sign_seed: self.sign_seed,
            crypt_seed: self.crypt_seed,
            bootstrap,
            timeout: self
                .timeout
                .unwrap_or(crate::protocol::transaction::DEFAULT_TIMEOUT),
        })
    }
}

/// Parse a host value as an IP address
fn parse_host(value: &str) -> Result<IpAddr, ConfigError> {
    value.parse().map_err(|_| ConfigError::InvalidAddress {
        value: value.to_string(),
    })
}

/// Parse a base64-encoded 32-byte key
fn parse_key(value: &str, field_name: &str) -> Result<[u8; 32], ConfigError> {
    let bytes = BASE64.decode(value).map_err(|_| ConfigError::InvalidKey {
        field: field_name.to_string(),
    })?;

    if bytes.len() != 32 {
        return Err(ConfigError::InvalidKey {
            field: field_name.to_string(),
        });
    }

    let mut key = [0u8; 32];
    key.copy_from_slice(&bytes);
    Ok(key)
}
