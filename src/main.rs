//! peercall - terminal client for two-party audio/video calls
//!
//! Signaling goes through a relay that forwards messages between named
//! clients; media negotiation and transport are delegated to the embedded
//! WebRTC engine.

mod config;
mod media;
mod session;
mod signaling;

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use config::Config;
use media::engine::WebRtcEngine;
use media::{MediaSink, TrackKind};
use session::{CallHandle, SessionPhase};

#[derive(Parser)]
#[command(name = "peercall-cli")]
#[command(about = "Terminal client for two-party audio/video calls", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Save relay endpoint and identity
    Setup {
        /// Identity to register with the relay
        #[arg(short, long)]
        name: Option<String>,

        /// Relay WebSocket URL, e.g. ws://localhost:3000
        #[arg(short, long)]
        relay: Option<String>,
    },

    /// Show the stored configuration
    Status,

    /// Connect to the relay and wait for incoming calls
    Listen,

    /// Connect to the relay and call a peer
    Call {
        /// Peer identity to call
        peer: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    let filter = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| filter.into()),
        )
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .init();

    match cli.command {
        Commands::Setup { name, relay } => setup(name, relay),
        Commands::Status => status(),
        Commands::Listen => run_client(None).await,
        Commands::Call { peer } => run_client(Some(peer)).await,
    }
}

fn setup(name: Option<String>, relay: Option<String>) -> Result<()> {
    let mut config = Config::load().context("Failed to load config")?;
    if let Some(name) = name {
        config.username = Some(name);
    }
    if let Some(relay) = relay {
        config.relay_url = Some(relay);
    }
    config.save().context("Failed to save config")?;
    println!(
        "Saved. relay={} name={}",
        config.relay_url.as_deref().unwrap_or("(unset)"),
        config.username.as_deref().unwrap_or("(generated per run)"),
    );
    Ok(())
}

fn status() -> Result<()> {
    let config = Config::load().context("Failed to load config")?;
    println!("relay: {}", config.relay_url.as_deref().unwrap_or("(unset)"));
    println!(
        "name:  {}",
        config.username.as_deref().unwrap_or("(generated per run)")
    );
    println!("stun:  {}", config.stun_servers_or_default().join(", "));
    Ok(())
}

/// Counts media units flowing through the render seam; a GUI would draw
/// them instead.
#[derive(Default)]
struct StatsSink {
    audio: AtomicU64,
    video: AtomicU64,
}

impl MediaSink for StatsSink {
    fn on_media(&self, kind: TrackKind, _bytes: usize) {
        let count = match kind {
            TrackKind::Audio => self.audio.fetch_add(1, Ordering::Relaxed) + 1,
            TrackKind::Video => self.video.fetch_add(1, Ordering::Relaxed) + 1,
        };
        if count % 250 == 0 {
            tracing::debug!("{} units received: {}", kind, count);
        }
    }
}

async fn run_client(initial_peer: Option<String>) -> Result<()> {
    let config = Config::load().context("Failed to load config")?;
    let relay_url = config
        .relay_url
        .clone()
        .context("No relay configured. Run `peercall-cli setup --relay <ws-url>` first.")?;
    let identity = match config.username.clone() {
        Some(name) => name,
        None => {
            let generated = uuid::Uuid::new_v4().simple().to_string()[..8].to_string();
            tracing::info!("No identity configured; using {}", generated);
            generated
        }
    };

    let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
    let (channel, _channel_task) = signaling::start(relay_url, identity.clone(), inbound_tx);
    let connectivity = channel.connectivity();

    let engine = Arc::new(WebRtcEngine::new(config.stun_servers_or_default()));
    let handle = session::spawn(identity.clone(), channel, engine, inbound_rx);
    handle.set_local_render(Arc::new(StatsSink::default()));
    handle.set_remote_render(Arc::new(StatsSink::default()));

    println!("Connecting as {}...", identity);
    println!("Commands: call <peer> | accept | reject | end | mute | camera | switch | quit");

    if let Some(peer) = initial_peer {
        let mut connectivity = connectivity;
        tokio::time::timeout(Duration::from_secs(10), connectivity.wait_for(|up| *up))
            .await
            .context("Timed out waiting for the relay connection")?
            .context("Signaling channel stopped")?;
        if let Err(e) = handle.start_call(peer.as_str()).await {
            println!("Could not call {}: {}", peer, e);
        }
    }

    interactive_loop(&handle).await
}

async fn interactive_loop(handle: &CallHandle) -> Result<()> {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut phases = handle.phase_changes();

    loop {
        tokio::select! {
            line = lines.next_line() => {
                let Some(line) = line.context("Failed to read stdin")? else {
                    return Ok(());
                };
                if !dispatch_command(handle, line.trim()).await {
                    return Ok(());
                }
            }
            changed = phases.changed() => {
                if changed.is_err() {
                    return Ok(());
                }
                let phase = phases.borrow().clone();
                announce_phase(&phase);
            }
            _ = tokio::signal::ctrl_c() => {
                println!("Shutting down...");
                if handle.phase() != SessionPhase::Idle {
                    let _ = handle.end_call().await;
                }
                return Ok(());
            }
        }
    }
}

/// Run one user command. Returns `false` when the user asked to quit.
async fn dispatch_command(handle: &CallHandle, line: &str) -> bool {
    let mut parts = line.split_whitespace();
    let Some(command) = parts.next() else {
        return true;
    };

    let result = match command {
        "call" => match parts.next() {
            Some(peer) => handle.start_call(peer).await,
            None => {
                println!("usage: call <peer>");
                return true;
            }
        },
        "accept" => handle.accept_call().await,
        "reject" => handle.reject_call().await,
        "end" => handle.end_call().await,
        "mute" => match handle.toggle_audio().await {
            Ok(enabled) => {
                println!("microphone {}", if enabled { "live" } else { "muted" });
                Ok(())
            }
            Err(e) => Err(e),
        },
        "camera" => match handle.toggle_camera().await {
            Ok(enabled) => {
                println!("camera {}", if enabled { "on" } else { "off" });
                Ok(())
            }
            Err(e) => Err(e),
        },
        "switch" => handle.switch_camera().await,
        "quit" | "exit" => {
            let _ = handle.end_call().await;
            return false;
        }
        _ => {
            println!("Commands: call <peer> | accept | reject | end | mute | camera | switch | quit");
            return true;
        }
    };

    if let Err(e) = result {
        println!("error: {}", e);
    }
    true
}

fn announce_phase(phase: &SessionPhase) {
    match phase {
        SessionPhase::Idle => println!("Ready."),
        SessionPhase::Outgoing { peer } => println!("Calling {}...", peer),
        SessionPhase::IncomingPending { peer } => {
            println!("Incoming call from {} - type `accept` or `reject`", peer);
        }
        SessionPhase::Connected { peer } => println!("Connected to {}.", peer),
        SessionPhase::Ended => println!("Call ended."),
    }
}
