//! Ringline CLI Application

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use console::{describe, history_row, parse_input, Input, HELP};
use rand::Rng;
use ringline_core::prelude::*;
use ringline_core::ControllerEvent;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::broadcast::error::RecvError;
use tracing_subscriber::EnvFilter;
use url::Url;

mod console;

const RELAY_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Parser)]
#[command(author, version, about)]
struct Cli {
    /// Configuration file (JSON)
    #[arg(short, long, env = "RINGLINE_CONFIG")]
    config: Option<PathBuf>,

    /// Participant id to register with the relay
    #[arg(short, long, env = "RINGLINE_PARTICIPANT")]
    participant: Option<String>,

    /// Relay WebSocket URL
    #[arg(long, env = "RINGLINE_RELAY_URL")]
    relay_url: Option<Url>,

    /// Record service base URL
    #[arg(long, env = "RINGLINE_API_URL")]
    api_url: Option<Url>,

    /// Bearer token for the record service
    #[arg(long, env = "RINGLINE_ACCESS_TOKEN", hide_env_values = true)]
    token: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Place a call
    Call {
        /// Participant to call
        peer: String,

        /// Video call instead of voice
        #[arg(long)]
        video: bool,
    },

    /// Wait for incoming calls
    Listen {
        /// Accept incoming calls without asking
        #[arg(long)]
        auto_accept: bool,
    },

    /// Show recent calls
    History,

    /// Show configuration and available commands
    Status,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("ringline=info")),
        )
        .init();

    let cli = Cli::parse();
    let config_path = config_path(&cli);
    let config = load_config(&cli, config_path.as_ref())?;

    match cli.command {
        Commands::Call { peer, video } => {
            println!("🔗 Using identity: {}", config.participant);
            handle_call(&config, &peer, video).await?;
        }
        Commands::Listen { auto_accept } => {
            println!("🔗 Using identity: {}", config.participant);
            handle_listen(&config, auto_accept).await?;
        }
        Commands::History => {
            handle_history(&config).await?;
        }
        Commands::Status => {
            handle_status(&config, config_path.as_ref());
        }
    }

    Ok(())
}

fn config_path(cli: &Cli) -> Option<PathBuf> {
    cli.config.clone().or_else(|| {
        directories::ProjectDirs::from("org", "ringline", "ringline")
            .map(|dirs| dirs.config_dir().join("config.json"))
            .filter(|path| path.exists())
    })
}

fn load_config(cli: &Cli, path: Option<&PathBuf>) -> Result<ClientConfig> {
    let mut config = match path {
        Some(path) => ClientConfig::from_file(path)
            .with_context(|| format!("loading {}", path.display()))?,
        None => ClientConfig::default(),
    };

    if let Some(participant) = &cli.participant {
        config.participant = ParticipantId::parse(participant)?;
    }
    if let Some(url) = &cli.relay_url {
        config.relay_url = url.clone();
    }
    if let Some(url) = &cli.api_url {
        config.api_base_url = url.clone();
    }
    if let Some(token) = &cli.token {
        config.access_token = Some(token.clone());
    }
    if config.participant.as_str().is_empty() {
        config.participant = ParticipantId::new(generate_guest_id());
    }

    config.validate()?;
    Ok(config)
}

/// Wire the relay channel, record client and peer transport into a controller
async fn start_controller(config: &ClientConfig) -> Result<Arc<CallController>> {
    let (channel, signaling_events) = WsSignalingChannel::connect(config.signaling_config())?;
    let records = Arc::new(HttpCallRecordClient::new(
        config.api_base_url.clone(),
        config.access_token.clone(),
        config.request_timeout(),
    )?);
    let (negotiator, transport_events) = MediaNegotiator::new(
        config.negotiator_config(),
        Arc::new(WebRtcTransportFactory::new()),
    )?;

    let controller = CallController::new(
        channel.clone(),
        records,
        Arc::new(StaticDeviceProvider::with_default_devices()),
        negotiator,
    );
    let _ = controller.spawn(signaling_events, transport_events);

    let connected = tokio::time::timeout(RELAY_CONNECT_TIMEOUT, async {
        while !channel.is_connected() {
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
    })
    .await;
    if connected.is_err() {
        bail!("relay {} not reachable", config.relay_url);
    }
    println!("✅ Connected to relay");

    Ok(controller)
}

async fn handle_call(config: &ClientConfig, peer: &str, video: bool) -> Result<()> {
    let peer = ParticipantId::parse(peer)?;
    let call_type = if video { CallType::Video } else { CallType::Voice };

    let controller = start_controller(config).await?;
    let mut events = controller.subscribe_events();
    let call = controller.initiate_call(peer, call_type).await?;
    tracing::debug!(call_id = %call.id, "Call placed");

    run_session(&controller, &mut events, false, true).await
}

async fn handle_listen(config: &ClientConfig, auto_accept: bool) -> Result<()> {
    let controller = start_controller(config).await?;
    let mut events = controller.subscribe_events();

    println!("👂 Listening for incoming calls...");
    if auto_accept {
        println!("   Auto-accept: enabled");
    }
    run_session(&controller, &mut events, auto_accept, false).await
}

/// Print call events and forward console commands until the user quits, or
/// until the call ends when `exit_on_end` is set
async fn run_session(
    controller: &Arc<CallController>,
    events: &mut tokio::sync::broadcast::Receiver<CallEvent>,
    auto_accept: bool,
    exit_on_end: bool,
) -> Result<()> {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut stdin_open = true;
    println!("{HELP}");

    loop {
        tokio::select! {
            event = events.recv() => match event {
                Ok(event) => {
                    if let Some(text) = describe(&event, controller.local_id()) {
                        println!("{text}");
                    }
                    match event {
                        CallEvent::IncomingCall { .. } if auto_accept => {
                            println!("✅ Accepting call...");
                            if let Err(e) = controller.accept_call().await {
                                println!("❌ Accept failed: {e}");
                            }
                        }
                        CallEvent::CallEnded { .. } if exit_on_end => return Ok(()),
                        _ => {}
                    }
                }
                Err(RecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "Call event stream lagged");
                }
                Err(RecvError::Closed) => return Ok(()),
            },
            line = lines.next_line(), if stdin_open => match line? {
                Some(line) => match parse_input(&line) {
                    Some(Input::Command(command)) => {
                        if let Err(e) = controller.dispatch(ControllerEvent::Command(command)).await {
                            println!("❌ {e}");
                        }
                    }
                    Some(Input::Help) => println!("{HELP}"),
                    Some(Input::Quit) => {
                        controller.end_call().await?;
                        return Ok(());
                    }
                    None if line.trim().is_empty() => {}
                    None => println!("Unknown command. {HELP}"),
                },
                None => {
                    tracing::debug!("Console input closed");
                    stdin_open = false;
                }
            },
        }
    }
}

async fn handle_history(config: &ClientConfig) -> Result<()> {
    let records = HttpCallRecordClient::new(
        config.api_base_url.clone(),
        config.access_token.clone(),
        config.request_timeout(),
    )?;
    let history = records.get_history().await?;

    if history.is_empty() {
        println!("No calls yet");
        return Ok(());
    }
    println!("📜 Recent calls for {}", config.participant);
    for call in &history {
        println!("{}", history_row(call, &config.participant));
    }
    Ok(())
}

fn handle_status(config: &ClientConfig, config_path: Option<&PathBuf>) {
    println!("📊 Ringline CLI Status");
    println!("=====================");
    match config_path {
        Some(path) => println!("Config file:   {}", path.display()),
        None => println!("Config file:   (defaults)"),
    }
    println!("Participant:   {}", config.participant);
    println!("Relay:         {}", config.relay_url);
    println!("Record API:    {}", config.api_base_url);
    println!(
        "Access token:  {}",
        if config.access_token.is_some() { "set" } else { "not set" }
    );
    for server in &config.ice_servers {
        println!("ICE server:    {}", server.urls.join(", "));
    }
    println!();
    println!("Available commands:");
    println!("  ringline call <peer> [--video]   - Place a call");
    println!("  ringline listen [--auto-accept]  - Wait for calls");
    println!("  ringline history                 - Show recent calls");
    println!("  ringline status                  - Show this status");
    println!();
    println!("{HELP}");
}

fn generate_guest_id() -> String {
    const WORDS: &[&str] = &[
        "alpha", "bravo", "charlie", "delta", "echo", "foxtrot", "golf", "hotel", "india",
        "juliet", "kilo", "lima", "mike", "november", "oscar", "papa", "quebec", "romeo", "sierra",
        "tango", "uniform", "victor", "whiskey", "xray", "yankee", "zulu",
    ];

    let mut rng = rand::thread_rng();
    format!(
        "guest-{}-{}",
        WORDS[rng.gen_range(0..WORDS.len())],
        rng.gen_range(1000..10_000)
    )
}
