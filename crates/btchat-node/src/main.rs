//! `btchat` entry point.
//!
//! Wires the loopback radio, the discovery controller, the connection
//! manager, and the chat view together, then runs one of three commands:
//!
//! ```text
//! btchat [--config PATH] serve             wait for a peer to connect
//! btchat [--config PATH] connect <ADDRESS> connect to a paired peer
//! btchat [--config PATH] devices           scan and list devices
//! ```
//!
//! In a session every line typed on stdin is sent to the peer and every
//! received message is printed as `<sender>: <text>`.  Ctrl-C ends the
//! session and releases the radio.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use btchat_core::Device;
use btchat_node::application::chat_session::{ChatSession, ChatState};
use btchat_node::application::device_registry::DeviceRegistry;
use btchat_node::application::discovery_controller::DiscoveryController;
use btchat_node::infrastructure::network::connection_manager::ConnectionManager;
use btchat_node::infrastructure::radio::loopback::LoopbackRadio;
use btchat_node::infrastructure::radio::{EventSource, LinkStateEvent};
use btchat_node::infrastructure::storage::config::load_config;

// ── CLI argument definitions ──────────────────────────────────────────────────

/// Two-peer text chat over a short-range radio link.
#[derive(Debug, Parser)]
#[command(name = "btchat", about = "Two-peer chat over a short-range radio link", version)]
struct Cli {
    /// Configuration file.  Defaults to the platform config directory.
    #[arg(long, env = "BTCHAT_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Listen for an inbound peer and chat with it.
    Serve,
    /// Connect to a paired peer and chat with it.
    Connect {
        /// Radio address of the peer (`host:port` for the loopback radio).
        address: String,
    },
    /// Scan for nearby devices and list them with the paired ones.
    Devices {
        /// How long to scan before printing.
        #[arg(long, default_value_t = 2)]
        wait_secs: u64,
    },
}

// ── Entry point ───────────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config = load_config(cli.config.as_deref()).context("failed to load configuration")?;

    // `RUST_LOG` wins over the configured level.
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(&config.node.log_level)),
        )
        .init();

    info!("btchat node {} starting", config.node.name);

    // ── Wiring ────────────────────────────────────────────────────────────────
    let found: EventSource<Device> = EventSource::new(64);
    // The loopback radio has no link layer of its own; nothing publishes here.
    let links: EventSource<LinkStateEvent> = EventSource::new(16);

    let radio = Arc::new(LoopbackRadio::open(&config, found.clone())?);
    let capabilities = Arc::new(config.capabilities());
    let registry = DeviceRegistry::new();

    let discovery = Arc::new(DiscoveryController::new(
        radio.clone(),
        capabilities.clone(),
        registry.clone(),
        found,
    ));
    let manager = ConnectionManager::new(
        radio,
        capabilities,
        registry.clone(),
        config.manager_config(),
        &links,
    );
    let chat = ChatSession::new(Arc::clone(&discovery), manager);

    // ── Command ───────────────────────────────────────────────────────────────
    let result = match cli.command {
        Command::Devices { wait_secs } => list_devices(&chat, wait_secs).await,
        Command::Serve => {
            chat.wait_for_incoming().await?;
            println!("waiting for a peer on {} ...", config.radio.listen_address);
            run_chat(&chat).await
        }
        Command::Connect { address } => {
            discovery.refresh_paired();
            let device = registry
                .paired()
                .into_iter()
                .find(|d| d.address == address)
                .unwrap_or_else(|| Device::new(address, None));
            chat.connect(&device)
                .await
                .with_context(|| format!("could not connect to {device}"))?;
            run_chat(&chat).await
        }
    };

    chat.release();
    info!("btchat node stopped");
    result
}

async fn list_devices(chat: &ChatSession, wait_secs: u64) -> anyhow::Result<()> {
    chat.start_scan().context("scan failed")?;
    tokio::time::sleep(Duration::from_secs(wait_secs)).await;
    chat.stop_scan();

    let state = chat.snapshot();
    println!("paired:");
    for device in &state.paired {
        println!("  {device}");
    }
    println!("nearby:");
    for device in &state.scanned {
        println!("  {device}");
    }
    Ok(())
}

/// Relays stdin to the peer and prints the peer's messages until the session
/// ends, stdin closes, or Ctrl-C is pressed.
async fn run_chat(chat: &ChatSession) -> anyhow::Result<()> {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut state_rx = chat.subscribe();
    let mut printed = 0usize;
    let mut was_connected = false;

    loop {
        tokio::select! {
            line = lines.next_line() => {
                let Some(text) = line.context("failed to read stdin")? else {
                    break;
                };
                if text.trim().is_empty() {
                    continue;
                }
                if let Err(e) = chat.send_message(&text).await {
                    warn!("message not sent: {e}");
                    eprintln!("! {e}");
                }
            }
            changed = state_rx.changed() => {
                if changed.is_err() {
                    break;
                }
                let state = state_rx.borrow_and_update().clone();
                printed = print_new_messages(&state, printed);
                if let Some(err) = &state.error_message {
                    eprintln!("! {err}");
                    chat.clear_error();
                }
                if state.is_connected && !was_connected {
                    println!("connected");
                }
                if was_connected && !state.is_connected {
                    println!("peer disconnected");
                }
                // A repeat-mode server keeps connecting after a peer leaves.
                if !state.is_connected && !state.is_connecting {
                    break;
                }
                if state.is_connecting && !state.is_connected && was_connected {
                    println!("waiting for the next peer ...");
                }
                was_connected = state.is_connected;
            }
            _ = tokio::signal::ctrl_c() => {
                info!("received Ctrl+C; closing the session");
                chat.disconnect();
                break;
            }
        }
    }
    Ok(())
}

/// Prints remote messages past index `printed`; returns the new index.
fn print_new_messages(state: &ChatState, printed: usize) -> usize {
    let start = if state.messages.len() < printed { 0 } else { printed };
    for message in state.messages[start..].iter().filter(|m| !m.is_from_local_user()) {
        println!("{}: {}", message.sender_name, message.text);
    }
    state.messages.len()
}

// ── Tests ─────────────────────────────────────────────────────────────────────
