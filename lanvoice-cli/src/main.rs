//! LanVoice CLI Application

use anyhow::{bail, Result};
use clap::{Parser, Subcommand};
use console::{describe_event, describe_state, ConsoleCommand, HELP};
use lanvoice_core::prelude::*;
use lanvoice_core::DEFAULT_MULTICAST_PORT;
use rand::Rng;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::broadcast::error::RecvError;
use tracing_subscriber::EnvFilter;

mod console;

#[derive(Parser)]
#[command(author, version, about)]
struct Cli {
    /// Name advertised on the LAN (e.g., "kitchen")
    #[arg(short, long, env = "LANVOICE_NAME")]
    name: Option<String>,

    /// Signaling port; 0 picks a free one
    #[arg(short, long, env = "LANVOICE_PORT", default_value_t = 0)]
    port: u16,

    /// UDP port for discovery beacons
    #[arg(long, env = "LANVOICE_DISCOVERY_PORT", default_value_t = DEFAULT_MULTICAST_PORT)]
    discovery_port: u16,

    /// STUN/TURN server URL (repeatable)
    #[arg(long = "stun")]
    stun: Vec<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Wait for incoming calls
    Listen {
        /// Answer incoming calls without asking
        #[arg(long)]
        auto_accept: bool,
    },

    /// List peers found on the LAN
    Peers {
        /// Seconds to listen for beacons
        #[arg(long, default_value_t = 5)]
        wait_secs: u64,
    },

    /// Call a peer by name
    Call {
        /// Peer name as listed by `peers`
        peer: String,

        /// Seconds to wait for the peer to show up
        #[arg(long, default_value_t = 10)]
        wait_secs: u64,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("lanvoice=info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let cli = Cli::parse();
    let name = cli.name.clone().unwrap_or_else(generate_random_name);

    println!("🔗 Using name: {}", name);

    match &cli.command {
        Commands::Listen { auto_accept } => {
            let manager = start_manager(&cli, &name, *auto_accept).await?;
            let result = handle_listen(&manager, *auto_accept).await;
            manager.shutdown().await;
            result?;
        }
        Commands::Peers { wait_secs } => {
            let manager = start_manager(&cli, &name, false).await?;
            handle_peers(&manager, *wait_secs).await;
            manager.shutdown().await;
        }
        Commands::Call { peer, wait_secs } => {
            let manager = start_manager(&cli, &name, false).await?;
            let result = handle_call(&manager, peer, *wait_secs).await;
            manager.shutdown().await;
            result?;
        }
    }

    Ok(())
}

async fn start_manager(cli: &Cli, name: &str, auto_accept: bool) -> Result<CallManager> {
    let directory = Arc::new(LanDirectory::new(DirectoryConfig {
        service_name: name.to_string(),
        multicast_port: cli.discovery_port,
        ..Default::default()
    }));
    let media = Arc::new(WebRtcNegotiator::new(WebRtcConfig {
        ice_servers: cli.stun.clone(),
    }));

    let manager = CallManager::builder()
        .with_config(CallManagerConfig {
            service_name: name.to_string(),
            signaling_port: cli.port,
            auto_accept,
            ..Default::default()
        })
        .with_media(media)
        .with_directory(directory)
        .start()
        .await?;

    println!("✅ Signaling on port {}", manager.signaling_port());
    Ok(manager)
}

async fn handle_listen(manager: &CallManager, auto_accept: bool) -> Result<()> {
    println!("👂 Listening for incoming calls...");
    if auto_accept {
        println!("   Auto-accept: enabled");
    }
    println!("   {}", HELP);

    run_console(manager, false).await
}

async fn handle_peers(manager: &CallManager, wait_secs: u64) {
    println!("🔍 Looking for peers for {}s...", wait_secs);
    tokio::time::sleep(Duration::from_secs(wait_secs)).await;

    let peers = manager.peers().borrow().clone();
    if peers.is_empty() {
        println!("No peers found");
        return;
    }
    for peer in peers {
        println!("  {}", peer);
    }
}

async fn handle_call(manager: &CallManager, name: &str, wait_secs: u64) -> Result<()> {
    let mut peers = manager.peers();
    let found = matches!(
        tokio::time::timeout(
            Duration::from_secs(wait_secs),
            peers.wait_for(|peers| peers.iter().any(|p| p.name == name)),
        )
        .await,
        Ok(Ok(_))
    );
    if !found {
        bail!("Peer {} not found on the LAN", name);
    }

    let Some(peer) = manager.find_peer(name) else {
        bail!("Peer {} went away", name);
    };
    manager.call(peer).await?;
    println!("   {}", HELP);

    run_console(manager, true).await
}

/// Drive the call from stdin until quit, Ctrl-C, or (with `exit_when_idle`)
/// the call ending
async fn run_console(manager: &CallManager, exit_when_idle: bool) -> Result<()> {
    let mut state = manager.state();
    let mut events = manager.subscribe_events();
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut stdin_open = true;

    loop {
        tokio::select! {
            line = lines.next_line(), if stdin_open => {
                let Some(line) = line? else {
                    stdin_open = false;
                    continue;
                };
                match ConsoleCommand::parse(&line) {
                    Some(ConsoleCommand::Quit) => break,
                    Some(command) => {
                        if let Err(e) = apply(manager, command).await {
                            println!("⚠️  {}", e);
                        }
                    }
                    None if line.trim().is_empty() => {}
                    None => println!("{}", HELP),
                }
            }
            changed = state.changed() => {
                if changed.is_err() {
                    break;
                }
                let current = state.borrow_and_update().clone();
                println!("{}", describe_state(&current));
                if exit_when_idle && current.is_idle() {
                    break;
                }
            }
            event = events.recv() => {
                match event {
                    Ok(event) => println!("{}", describe_event(&event)),
                    Err(RecvError::Lagged(skipped)) => {
                        tracing::debug!(skipped, "Missed call events");
                    }
                    Err(RecvError::Closed) => break,
                }
            }
            _ = tokio::signal::ctrl_c() => break,
        }
    }

    Ok(())
}

async fn apply(manager: &CallManager, command: ConsoleCommand) -> Result<(), CallError> {
    match command {
        ConsoleCommand::Accept => manager.accept_incoming().await,
        ConsoleCommand::Mute => manager.set_muted(true).await,
        ConsoleCommand::Unmute => manager.set_muted(false).await,
        ConsoleCommand::Speaker => manager.set_speaker(true).await,
        ConsoleCommand::Earpiece => manager.set_speaker(false).await,
        ConsoleCommand::HangUp => manager.end_call().await,
        ConsoleCommand::Quit => Ok(()),
    }
}

fn generate_random_name() -> String {
    let mut rng = rand::thread_rng();
    format!("lanvoice-{:05}", rng.gen_range(0..100_000))
}
