//! pairup - Anonymous one-to-one matchmaking with peer-to-peer session setup

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use clap::{Parser, Subcommand};
use tokio::sync::broadcast;
use tracing::{info, warn, Level};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use pairup::config::{default_path, Config};
use pairup::identity::Identity;
use pairup::matching::MatchingQueue;
use pairup::net::LobbyClient;
use pairup::session::{
    ConnectionState, LoopbackHost, LoopbackNetwork, LoopbackOptions, LoopbackStats, Orchestrator,
    SessionEvent, SessionHandle,
};
use pairup::signaling::SignalingHub;

/// How long the demo waits for each step
const DEMO_STEP_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Parser)]
#[command(name = "pairup")]
#[command(about = "Anonymous one-to-one matchmaking with peer-to-peer session setup")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Configuration file (defaults to the platform config directory)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Pair two in-process participants and walk through a session
    Demo {
        /// Start with video disabled
        #[arg(long)]
        no_video: bool,
    },

    /// Show how many participants are waiting on a lobby server
    Waiting {
        /// Lobby server URL (ws:// or wss://)
        #[arg(short, long, env = "PAIRUP_SERVER")]
        server: Option<String>,
    },

    /// Join a lobby server's queue and report the session lifecycle
    Probe {
        /// Lobby server URL (ws:// or wss://)
        #[arg(short, long, env = "PAIRUP_SERVER")]
        server: Option<String>,

        /// Identity to join with
        #[arg(short, long)]
        identity: String,

        /// Seconds to stay in the queue or room
        #[arg(short, long, default_value = "60")]
        timeout: u64,

        /// Chat line to send once connected
        #[arg(short, long)]
        message: Option<String>,
    },

    /// Write the effective configuration to the config file
    InitConfig {
        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },
}

fn setup_logging(verbose: bool) -> Result<()> {
    let level = if verbose { Level::DEBUG } else { Level::INFO };
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(level.as_str().to_lowercase()));

    let subscriber = FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_target(false)
        .finish();

    tracing::subscriber::set_global_default(subscriber)
        .context("Failed to set tracing subscriber")?;
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    setup_logging(cli.verbose)?;

    let config = Config::load(cli.config.as_deref())?;

    match cli.command {
        Commands::Demo { no_video } => run_demo(config, no_video).await?,
        Commands::Waiting { server } => {
            let url = server_url(server, &config)?;
            run_waiting(&url).await?;
        }
        Commands::Probe {
            server,
            identity,
            timeout,
            message,
        } => {
            let url = server_url(server, &config)?;
            run_probe(&url, &identity, timeout, message, config).await?;
        }
        Commands::InitConfig { force } => {
            let path = match cli.config {
                Some(path) => path,
                None => default_path()
                    .ok_or_else(|| anyhow!("no platform config directory; use --config"))?,
            };
            if path.exists() && !force {
                return Err(anyhow!("{} already exists; use --force", path.display()));
            }
            config
                .save(&path)
                .with_context(|| format!("Failed to write {}", path.display()))?;
            info!("Wrote configuration to {}", path.display());
        }
    }

    Ok(())
}

/// Flag value, else the configured signaling URL
fn server_url(flag: Option<String>, config: &Config) -> Result<String> {
    flag.or_else(|| config.session.signaling_url.clone())
        .ok_or_else(|| anyhow!("no lobby server given; use --server or set session.signaling_url"))
}

fn parse_identity(value: &str) -> Result<Identity> {
    Identity::try_from(value.to_string()).with_context(|| format!("bad identity {:?}", value))
}

/// Print every session event until the session's event stream closes
fn spawn_printer(handle: &SessionHandle) {
    let name = handle.identity().display_name().to_string();
    let mut events = handle.subscribe();

    tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(event) => println!("  [{}] {}", name, describe(&event)),
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    });
}

fn describe(event: &SessionEvent) -> String {
    match event {
        SessionEvent::Searching => "searching for a partner".to_string(),
        SessionEvent::Matched {
            room_code,
            peer,
            role,
        } => format!(
            "matched with {} in room ...{} as {}",
            peer.display_name(),
            room_code.display_suffix(),
            role
        ),
        SessionEvent::Connected { room_code } => {
            format!("connected in room ...{}", room_code.display_suffix())
        }
        SessionEvent::RemoteStream { stream_id } => format!("remote stream {}", stream_id),
        SessionEvent::Message { from, text } => {
            format!("message from {}: {}", from.display_name(), text)
        }
        SessionEvent::PeerLeft { room_code } => {
            format!("partner left room ...{}", room_code.display_suffix())
        }
        SessionEvent::Ended { room_code } => {
            format!("room ...{} ended", room_code.display_suffix())
        }
        SessionEvent::Failed { reason } => format!("failed: {}", reason),
    }
}

async fn expect_state(handle: &SessionHandle, target: ConnectionState) -> Result<()> {
    if handle.wait_for(target, DEMO_STEP_TIMEOUT).await {
        Ok(())
    } else {
        Err(anyhow!(
            "{} did not reach {} (currently {})",
            handle.identity(),
            target,
            handle.state()
        ))
    }
}

async fn run_demo(config: Config, no_video: bool) -> Result<()> {
    println!("\n=== pairup demo ===\n");

    let queue = Arc::new(MatchingQueue::new());
    let hub = Arc::new(SignalingHub::new());
    let network = LoopbackNetwork::new();

    let mut session_config = config.session.clone();
    if no_video {
        session_config.video = false;
    }

    let alice_host = Arc::new(LoopbackHost::new(network.clone(), LoopbackOptions::default()));
    let bob_host = Arc::new(LoopbackHost::new(network.clone(), LoopbackOptions::default()));

    let alice = Orchestrator::spawn(
        parse_identity("alice@uni.edu")?,
        queue.clone(),
        hub.clone(),
        alice_host.clone(),
        session_config.clone(),
    );
    let bob = Orchestrator::spawn(
        parse_identity("bob@uni.edu")?,
        queue.clone(),
        hub.clone(),
        bob_host.clone(),
        session_config,
    );
    spawn_printer(&alice);
    spawn_printer(&bob);

    println!("Both participants join the queue");
    alice.connect().await?;
    bob.connect().await?;

    expect_state(&alice, ConnectionState::Connected).await?;
    expect_state(&bob, ConnectionState::Connected).await?;
    println!(
        "\nConnected. {} waiting, {} active room(s)\n",
        queue.waiting_count(),
        queue.active_rooms().len()
    );

    println!("alice says hello over the data channel");
    alice.send_message("hello from alice").await?;
    tokio::time::sleep(Duration::from_millis(100)).await;

    println!("\nalice turns the camera off and skips");
    alice.toggle_video(false);
    alice.skip().await?;
    expect_state(&bob, ConnectionState::Ended).await?;
    expect_state(&alice, ConnectionState::Searching).await?;
    println!(
        "\nalice is searching again (video={}), bob's room ended",
        alice_host.video_enabled()
    );

    println!("\nbob rejoins, they are paired again");
    bob.connect().await?;
    expect_state(&alice, ConnectionState::Connected).await?;
    expect_state(&bob, ConnectionState::Connected).await?;

    alice.disconnect().await?;
    bob.disconnect().await?;

    let stats = alice_host.stats();
    println!("\n=== Summary ===");
    println!("  Rooms created:       {}", queue.room_count());
    println!("  Offers by alice:     {}", LoopbackStats::get(&stats.offers_created));
    println!("  Answers by alice:    {}", LoopbackStats::get(&stats.answers_created));
    println!(
        "  Candidates applied:  {}",
        LoopbackStats::get(&stats.candidates_applied)
    );
    println!("  alice final state:   {}", alice.state());
    println!("  bob final state:     {}", bob.state());
    println!();

    Ok(())
}

async fn run_waiting(url: &str) -> Result<()> {
    use pairup::matching::Matchmaker;

    let client = LobbyClient::connect(url).await?;
    let count = client.count_waiting().await?;
    println!("{} participant(s) waiting on {}", count, url);

    if let Err(e) = client.close().await {
        warn!("Close failed: {}", e);
    }
    Ok(())
}

async fn run_probe(
    url: &str,
    identity: &str,
    timeout: u64,
    message: Option<String>,
    config: Config,
) -> Result<()> {
    let identity = parse_identity(identity)?;
    let client = Arc::new(LobbyClient::connect(url).await?);
    let host = Arc::new(LoopbackHost::new(
        LoopbackNetwork::new(),
        LoopbackOptions::default(),
    ));

    let handle = Orchestrator::spawn(
        identity.clone(),
        client.clone(),
        client.clone(),
        host,
        config.session,
    );
    spawn_printer(&handle);

    info!("Probing {} as {}", url, identity);
    handle.connect().await?;
    println!("Waiting in queue as {} (Ctrl+C to stop)", identity);

    let mut states = handle.watch_state();
    let deadline = tokio::time::sleep(Duration::from_secs(timeout));
    tokio::pin!(deadline);

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Interrupted");
                break;
            }
            _ = &mut deadline => {
                info!("Probe timed out after {}s", timeout);
                break;
            }
            changed = states.changed() => {
                if changed.is_err() {
                    break;
                }
                let state = *states.borrow_and_update();
                println!("  state: {}", state);

                if state == ConnectionState::Connected {
                    if let Some(text) = message.as_deref() {
                        if let Err(e) = handle.send_message(text).await {
                            warn!("Failed to send message: {}", e);
                        }
                    }
                }
            }
        }
    }

    handle.disconnect().await?;
    if let Err(e) = client.close().await {
        warn!("Close failed: {}", e);
    }
    Ok(())
}
