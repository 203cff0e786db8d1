//! tetherd - transport stack daemon
//!
//! Runs one stack endpoint, either as the bootstrap master answering join
//! requests or as a joining node that establishes a session and optionally
//! sends a demo message. The stack core is poll-driven; the binary drives the
//! service tick from a timer loop and handles shutdown signals.

use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;

use clap::Parser;
use serde_json::Value;
use tracing_subscriber::{fmt, EnvFilter};

use tether::error::TetherError;
use tether::protocol::Body;
use tether::{Stack, StackConfig};

/// Interval between service ticks
const SERVICE_INTERVAL: Duration = Duration::from_millis(50);

/// Operating mode
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mode {
    Master,
    Join,
}

/// tetherd - authenticated datagram transport daemon
#[derive(Parser, Debug)]
#[command(name = "tetherd")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to the stack configuration file
    #[arg(short, long)]
    config: PathBuf,

    /// Force master mode (answer join requests)
    #[arg(long, conflicts_with = "join")]
    master: bool,

    /// Force join mode (connect to the bootstrap master)
    #[arg(long, conflicts_with = "master")]
    join: bool,

    /// Send a text payload once the session is endowed (join mode)
    #[arg(long)]
    send: Option<String>,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();

    // Set up logging
    let filter = if args.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::new("info")
    };

    fmt().with_env_filter(filter).with_target(false).init();

    match run(args).await {
        Ok(_) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Error: {}", e);
            ExitCode::from(e.exit_code() as u8)
        }
    }
}

async fn run(args: Args) -> Result<(), TetherError> {
    tracing::info!("Loading configuration from: {}", args.config.display());
    let config = StackConfig::from_file(&args.config)?;

    let mode = determine_mode(&args, &config);
    let mut stack = Stack::new(config)?;

    match mode {
        Mode::Master => {
            tracing::info!("tetherd master listening on {}", stack.local_addr());
            run_with_cleanup(&mut stack, Driver::master()).await
        }
        Mode::Join => {
            tracing::info!("tetherd joining via {}", stack.local_addr());
            stack.join(None)?;
            run_with_cleanup(&mut stack, Driver::join(args.send)).await
        }
    }
}

/// Determine operating mode from args and config
fn determine_mode(args: &Args, config: &StackConfig) -> Mode {
    // Explicit flags take precedence
    if args.master {
        return Mode::Master;
    }
    if args.join {
        return Mode::Join;
    }

    if config.master {
        tracing::info!("Auto-detected master mode (Master = true in config)");
        Mode::Master
    } else {
        tracing::info!("Auto-detected join mode");
        Mode::Join
    }
}

/// Per-mode behavior layered over the service tick
struct Driver {
    master: bool,
    send: Option<String>,
    endow_requested: bool,
    message_sent: bool,
}

impl Driver {
    fn master() -> Self {
        Self {
            master: true,
            send: None,
            endow_requested: false,
            message_sent: false,
        }
    }

    fn join(send: Option<String>) -> Self {
        Self {
            master: false,
            send,
            endow_requested: false,
            message_sent: false,
        }
    }

    /// One application step after each service tick
    fn step(&mut self, stack: &mut Stack) -> Result<(), TetherError> {
        // Print anything that arrived
        while let Some((peer_id, body)) = stack.received() {
            let body = Value::Object(body);
            tracing::info!(peer_id, body = %body, "message received");
        }
        if self.master {
            return Ok(());
        }

        // Once joined, establish the session; once endowed, send the payload
        let accepted = stack.peers().find(|p| p.accepted).map(|p| (p.id, p.endowed));
        match accepted {
            Some((peer_id, false)) if !self.endow_requested => {
                stack.endow(peer_id, None)?;
                self.endow_requested = true;
            }
            Some((peer_id, true)) if !self.message_sent => {
                if let Some(text) = self.send.take() {
                    let mut body = Body::new();
                    body.insert("echo".into(), Value::String(text));
                    stack.message(peer_id, body)?;
                }
                self.message_sent = true;
            }
            _ => {}
        }
        Ok(())
    }
}

/// Drive the stack with graceful shutdown on Ctrl+C or SIGTERM
async fn run_with_cleanup(stack: &mut Stack, mut driver: Driver) -> Result<(), TetherError> {
    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<Option<()>>();

    tokio::pin!(terminate);

    let mut ticker = tokio::time::interval(SERVICE_INTERVAL);

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let result = match stack.service() {
                    Ok(()) => driver.step(stack),
                    Err(e) => Err(e),
                };
                // A failed handshake surfaces here; re-initiation is the
                // application's call, so log recoverable failures and keep going
                if let Err(e) = result {
                    if e.is_recoverable() {
                        tracing::warn!("service error: {}", e);
                    } else {
                        return Err(e);
                    }
                }
            }
            _ = &mut ctrl_c => {
                tracing::info!("\nReceived Ctrl+C, shutting down...");
                return Ok(());
            }
            _ = &mut terminate => {
                tracing::info!("\nReceived SIGTERM, shutting down...");
                return Ok(());
            }
        }
    }
}
