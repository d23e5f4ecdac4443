//! Mesh node with an interactive console
//!
//! ```text
//! stdin reader ──> command channel ──> dispatcher ──> MeshNode
//!                                          ▲
//! registry events ─────────────> printer   │ running flag (Ctrl+C, display quit)
//! ```
//!
//! Usage: `node <base_port> [--bind ADDR] [--advertise ADDR] [--config PATH]
//! [--no-video] [--no-audio] [--direct-pairing]`

use anyhow::{Context, Result};
use clap::Parser;
use std::io::{BufRead, Write};
use std::path::PathBuf;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use lan_media_mesh::{
    cli::{parse_command, Command},
    config::NodeConfig,
    media::TextSink,
    peers::PeerEvent,
    Collaborators, MeshNode,
};

#[derive(Debug, Parser)]
#[command(name = "node", version, about = "Full-mesh text/video/audio chat node")]
struct Args {
    /// Base port; text, video, control and audio use base+0..3
    base_port: u16,

    /// Local bind address
    #[arg(long)]
    bind: Option<String>,

    /// Address announced to peers (defaults to the address they see us at)
    #[arg(long)]
    advertise: Option<String>,

    /// Configuration file (TOML)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Disable the video channel
    #[arg(long)]
    no_video: bool,

    /// Disable the audio channel
    #[arg(long)]
    no_audio: bool,

    /// Register initiators directly instead of pairing back with them
    #[arg(long)]
    direct_pairing: bool,
}

fn load_config(args: &Args) -> Result<NodeConfig> {
    let mut config = match &args.config {
        Some(path) => NodeConfig::load(path)
            .with_context(|| format!("Cannot load config from {}", path.display()))?,
        None => match NodeConfig::default_path().filter(|p| p.exists()) {
            Some(path) => NodeConfig::load(&path)?,
            None => NodeConfig::default(),
        },
    };

    config.network.base_port = args.base_port;
    if let Some(bind) = &args.bind {
        config.network.bind_address = bind.clone();
    }
    if let Some(advertise) = &args.advertise {
        config.network.advertise_address = Some(advertise.clone());
    }
    if args.no_video {
        config.media.video_enabled = false;
    }
    if args.no_audio {
        config.media.audio_enabled = false;
    }
    if args.direct_pairing {
        config.pairing.reciprocal = false;
    }

    config.validate()?;
    Ok(config)
}

fn prompt() {
    print!("> ");
    let _ = std::io::stdout().flush();
}

fn console_sink() -> Arc<dyn TextSink> {
    Arc::new(|message: &str| {
        print!("\r[TEXT] {}\n", message);
        prompt();
    })
}

fn print_help() {
    println!("Commands:");
    println!("  /connect <port>          pair with a node on this host");
    println!("  /connect <host> <port>   pair with a remote node");
    println!("  /peers                   list connected peers");
    println!("  /stats                   show counters");
    println!("  /quit                    leave");
    println!("Anything else is sent as a text message (Ctrl+C to exit).");
}

/// Blocking stdin reader feeding the command channel; end of input means quit
fn spawn_stdin_reader(commands: mpsc::Sender<Command>) -> Result<()> {
    std::thread::Builder::new()
        .name("stdin".into())
        .spawn(move || {
            let stdin = std::io::stdin();
            for line in stdin.lock().lines() {
                let Ok(line) = line else { break };
                match parse_command(&line) {
                    Some(command) => {
                        if commands.blocking_send(command).is_err() {
                            return;
                        }
                    }
                    None => prompt(),
                }
            }
            let _ = commands.blocking_send(Command::Quit);
        })?;
    Ok(())
}

fn spawn_event_printer(mut events: broadcast::Receiver<PeerEvent>) {
    tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(PeerEvent::Connected(peer)) => {
                    print!("\rConnection established with {}\n", peer);
                    prompt();
                }
                Ok(PeerEvent::Failed(peer, reason)) => {
                    tracing::debug!("Pairing with {} abandoned: {}", peer, reason);
                }
                Ok(PeerEvent::Connecting(_)) => {}
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    tracing::warn!("Missed {} peer events", n);
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    });
}

/// Handle one command. Returns false to quit.
async fn dispatch(node: &Arc<MeshNode>, command: Command) -> bool {
    match command {
        Command::Connect { host, port } => {
            let pairing_node = node.clone();
            let target = format!("{}:{}", host, port);
            let result =
                tokio::task::spawn_blocking(move || pairing_node.pair_with(&host, port)).await;
            match result {
                Ok(Ok(())) => {}
                Ok(Err(e)) if e.is_duplicate_or_self() => {
                    println!("Already connected or connecting to self ({})", target);
                }
                Ok(Err(e)) => println!("Connection to {} failed: {}", target, e),
                Err(e) => tracing::error!("Pairing task failed: {}", e),
            }
        }
        Command::Peers => {
            let peers: Vec<String> = node.peers().iter().map(|p| p.to_string()).collect();
            println!("Connected peers: {}", peers.join(", "));
        }
        Command::Stats => {
            let stats = node.stats();
            println!("Peers: {}", stats.peers);
            println!(
                "Text out: {} sent, {} dropped | in: {} received",
                stats.text_out.units_sent, stats.text_out.units_dropped, stats.text_in.units_received
            );
            if let (Some(out), Some(inp)) = (&stats.video_out, &stats.video_in) {
                println!(
                    "Video out: {} sent, {} dropped | in: {} received, {} malformed | buffer {}/{}, {} overflows",
                    out.units_sent,
                    out.units_dropped,
                    inp.units_received,
                    stats.malformed_video,
                    stats.video_buffer.len,
                    stats.video_buffer.capacity,
                    stats.video_buffer.overflows
                );
            }
            if let (Some(out), Some(inp)) = (&stats.audio_out, &stats.audio_in) {
                println!(
                    "Audio out: {} sent, {} dropped | in: {} received, {} malformed | buffer {}/{}, {} underruns",
                    out.units_sent,
                    out.units_dropped,
                    inp.units_received,
                    stats.malformed_audio,
                    stats.audio_buffer.len,
                    stats.audio_buffer.capacity,
                    stats.audio_buffer.underruns
                );
            }
        }
        Command::Quit => return false,
        Command::Text(message) => {
            node.send_text(&message);
        }
        Command::Unknown(command) => println!("Unknown command: {}", command),
        Command::Invalid(usage) => println!("{}", usage),
    }

    prompt();
    true
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "info".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let args = Args::parse();
    let config = load_config(&args)?;

    let collaborators = Collaborators::headless(&config, console_sink());
    let node = Arc::new(
        MeshNode::start(config, collaborators)
            .with_context(|| format!("Cannot start node on port {}", args.base_port))?,
    );

    let running = node.running_flag();
    ctrlc::set_handler(move || {
        running.store(false, Ordering::SeqCst);
    })
    .context("Cannot install Ctrl+C handler")?;

    println!("Media chat running on port {}", args.base_port);
    print_help();
    prompt();

    let (command_tx, mut command_rx) = mpsc::channel::<Command>(32);
    spawn_stdin_reader(command_tx)?;
    spawn_event_printer(node.registry().subscribe());

    let mut liveness = tokio::time::interval(Duration::from_millis(100));
    loop {
        tokio::select! {
            command = command_rx.recv() => match command {
                Some(command) => {
                    if !dispatch(&node, command).await {
                        break;
                    }
                }
                None => break,
            },
            _ = liveness.tick() => {
                if !node.is_running() {
                    break;
                }
            }
        }
    }

    println!("\nLeaving...");
    let stopping = node.clone();
    tokio::task::spawn_blocking(move || stopping.shutdown()).await?;

    Ok(())
}
