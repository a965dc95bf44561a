//! Murmur interactive shell.
//!
//! A thin front-end over the node: one command per engine capability,
//! notifications rendered as they arrive. Command names and output
//! are not part of the engine contract.

use clap::Parser;
use tokio::io::{AsyncBufReadExt, BufReader};

use murmur_network::{NetworkConfig, PeerId};
use murmur_node::{MurmurNode, Notification};
use murmur_types::config::AppConfig;
use murmur_types::MurmurError;

mod commands;

use commands::CommandOutcome;

// ---------------------------------------------------------------------------
// CLI arguments
// ---------------------------------------------------------------------------

/// Decentralized peer-to-peer messenger.
#[derive(Parser, Debug)]
#[command(name = "murmur", version, about)]
struct Args {
    /// TCP listen port (falls back to an ephemeral port on collision).
    #[arg(long)]
    port: Option<u16>,

    /// Path to the store file.
    #[arg(long)]
    db: Option<std::path::PathBuf>,

    /// Disable mDNS discovery on the local network.
    #[arg(long)]
    no_mdns: bool,
}

// ---------------------------------------------------------------------------
// Entry point
// ---------------------------------------------------------------------------

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_target(false)
        .init();

    let args = Args::parse();

    let mut config = match AppConfig::load() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("failed to load configuration: {e}");
            std::process::exit(1);
        }
    };
    if let Some(port) = args.port {
        config.port = port;
    }
    if let Some(db) = args.db {
        config.db_path = db;
    }

    let net_config = NetworkConfig {
        listen_port: config.port,
        enable_mdns: !args.no_mdns,
        ..NetworkConfig::default()
    };

    let (node, mut notifications) = match MurmurNode::start(config, net_config).await {
        Ok(started) => started,
        Err(e) => {
            eprintln!("failed to start node: {e}");
            std::process::exit(1);
        }
    };

    print_banner(&node).await;

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    prompt();

    loop {
        tokio::select! {
            line = lines.next_line() => {
                match line {
                    Ok(Some(line)) => {
                        match commands::dispatch(&node, line.trim()).await {
                            CommandOutcome::Continue => prompt(),
                            CommandOutcome::Quit => break,
                        }
                    }
                    Ok(None) => break,
                    Err(e) => {
                        eprintln!("stdin error: {e}");
                        break;
                    }
                }
            }
            note = notifications.recv() => {
                match note {
                    Some(note) => {
                        render_notification(&note);
                        prompt();
                    }
                    None => break,
                }
            }
            _ = tokio::signal::ctrl_c() => {
                println!();
                break;
            }
        }
    }

    println!("shutting down...");
    node.shutdown();
}

fn prompt() {
    use std::io::Write;
    print!("> ");
    let _ = std::io::stdout().flush();
}

async fn print_banner(node: &MurmurNode) {
    println!();
    println!("=== Murmur P2P Messenger ===");
    println!("Peer ID: {}", node.local_peer_id());

    // Listen addresses may take a moment to bind.
    for _ in 0..20 {
        match node.network().advertised_addresses().await {
            Ok(addrs) if !addrs.is_empty() => {
                println!("Your addresses:");
                for addr in addrs {
                    println!("  {addr}");
                }
                break;
            }
            _ => tokio::time::sleep(std::time::Duration::from_millis(100)).await,
        }
    }

    println!();
    println!("Register or login to get started:");
    println!("  register <username> <password> <full name...>");
    println!("  login <username> <password>");
    println!();
    println!("Type 'help' for all commands.");
    println!();
}

// ---------------------------------------------------------------------------
// Notifications
// ---------------------------------------------------------------------------

fn render_notification(note: &Notification) {
    println!();
    match note {
        Notification::FriendRequest { from_username, from_full_name, message, needs_login } => {
            println!("[friend request] {from_full_name} ({from_username}): {message}");
            if *needs_login {
                println!("  login to accept or reject");
            } else {
                println!("  use 'accept {from_username}' or 'reject {from_username}'");
            }
        }
        Notification::DuplicateFriendRequest { from_username } => {
            println!("[friend request] request from {from_username} already exists");
        }
        Notification::FriendAccepted { username, full_name } => {
            println!("[friends] {full_name} ({username}) accepted your friend request");
        }
        Notification::FriendRejected { username, full_name } => {
            println!("[friends] {full_name} ({username}) declined your friend request");
        }
        Notification::DirectMessage { from_username, from_full_name, content } => {
            println!("[message] {from_full_name} ({from_username}): {content}");
        }
        Notification::MessageQueued { to_username } => {
            println!("[message] queued for {to_username}, will deliver when online");
        }
        Notification::ConferenceInvite {
            conference_id,
            conference_name,
            from_username,
            message,
            ..
        } => {
            println!("[conference] invite from {from_username}: {message}");
            println!("  conference '{conference_name}' (id {conference_id})");
            println!("  use 'join-conf {conference_id}' to join");
        }
        Notification::ConferenceMessage { conference_id, from_full_name, content } => {
            println!("[conf {conference_id}] {from_full_name}: {content}");
        }
        Notification::PeerConnected { peer_id } => {
            println!("[net] peer connected: {peer_id}");
        }
        Notification::PeerDisconnected { peer_id } => {
            println!("[net] peer disconnected: {peer_id}");
        }
    }
}

// ---------------------------------------------------------------------------
// Error rendering (shared with commands)
// ---------------------------------------------------------------------------

/// Prints an engine error as a single-line diagnostic.
pub(crate) fn report(err: &MurmurError) {
    println!("error: {err}");
}

/// Parses a peer id argument.
pub(crate) fn parse_peer(arg: &str) -> Result<PeerId, MurmurError> {
    arg.parse().map_err(|_| MurmurError::InvalidAddress {
        reason: format!("'{arg}' is not a peer id"),
    })
}
