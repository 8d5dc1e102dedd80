//! MagHeart command-line client.
//!
//! Joins a co-creation meeting from the terminal, relays heart-rate readings
//! to the backend, or checks that the backend is up.

mod console;
mod settings;

use std::path::PathBuf;

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use log::info;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use uuid::Uuid;

use console::ConsoleCommand;
use magheart_ingest::{run_relay, HeartRateUploader};
use magheart_session::{MeetingPhase, Role, SessionClient, SessionIdentity};
use settings::Settings;

#[derive(Parser)]
#[command(name = "magheart")]
#[command(about = "MagHeart co-creation session client", long_about = None)]
struct Cli {
    /// Settings file (TOML). Defaults to ./magheart.toml when present.
    #[arg(long, short, global = true)]
    config: Option<PathBuf>,

    /// Backend origin, e.g. http://127.0.0.1:8000
    #[arg(long, global = true)]
    base_url: Option<String>,

    /// User id; a random one is generated when neither this nor the settings file sets it
    #[arg(long, short, global = true)]
    user: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Join a meeting, print every state change and read commands from stdin
    Join {
        meeting_id: String,
        #[arg(long, default_value = "remote")]
        role: Role,
        /// Avatar seed; defaults to the user id
        #[arg(long)]
        avatar: Option<String>,
        /// Phase announced until the server reports the real one
        #[arg(long, default_value = "lobby")]
        phase: MeetingPhase,
    },
    /// Upload bpm values read from stdin, one per line
    Relay {
        /// Label sent as `source`
        #[arg(long)]
        source: Option<String>,
    },
    /// Check that the backend answers
    Health,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::init();
    let cli = Cli::parse();

    let mut settings = Settings::load(cli.config.as_deref())?;
    if let Some(base_url) = &cli.base_url {
        settings.override_base_url(base_url);
    }
    let user_id = cli
        .user
        .clone()
        .or_else(|| settings.user_id.clone())
        .unwrap_or_else(|| format!("user-{}", &Uuid::new_v4().simple().to_string()[..8]));

    match cli.command {
        Commands::Join {
            meeting_id,
            role,
            avatar,
            phase,
        } => {
            let avatar = avatar.unwrap_or_else(|| user_id.clone());
            let identity = SessionIdentity::new(meeting_id, user_id, role, avatar)
                .with_initial_phase(phase);
            join(settings, identity).await
        }
        Commands::Relay { source } => {
            let mut config = settings.ingest;
            config.user_id = user_id;
            if source.is_some() {
                config.source = source;
            }
            relay(HeartRateUploader::new(config)?).await
        }
        Commands::Health => {
            settings.ingest.user_id = user_id;
            let uploader = HeartRateUploader::new(settings.ingest)?;
            let health = uploader.health_check().await;
            match health.status {
                Some(status) => println!("{} answered {status}", uploader.config().base_url),
                None => println!("{} is unreachable", uploader.config().base_url),
            }
            if !health.healthy {
                bail!("backend is not healthy");
            }
            Ok(())
        }
    }
}

async fn join(settings: Settings, identity: SessionIdentity) -> anyhow::Result<()> {
    info!(
        "Joining meeting {} as {} ({})",
        identity.meeting_id, identity.user_id, identity.role
    );
    let client = SessionClient::with_websocket(settings.session)?;
    let _printer = client.subscribe(|snapshot| println!("{}", console::render(snapshot)));
    client.init(identity);

    println!("{}", console::HELP);
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            line = lines.next_line() => {
                let Some(line) = line.context("reading stdin")? else {
                    break;
                };
                match console::parse_line(&line) {
                    Ok(Some(ConsoleCommand::Quit)) => break,
                    Ok(Some(command)) => dispatch(&client, command),
                    Ok(None) => {}
                    Err(e) => eprintln!("{e}"),
                }
            }
            _ = tokio::signal::ctrl_c() => break,
        }
    }

    client.shutdown().await;
    Ok(())
}

fn dispatch(client: &SessionClient, command: ConsoleCommand) {
    match command {
        ConsoleCommand::Phase(phase) => client.send_update_phase(phase),
        ConsoleCommand::Context(ctx) => client.send_update_shared_context(ctx),
        ConsoleCommand::Send { kind, payload } => client.send_message(kind, payload),
        ConsoleCommand::Leave(reason) => client.send_leave_meeting(reason),
        ConsoleCommand::Status => {
            let snapshot = client.snapshot();
            println!("{}", console::render(&snapshot));
            println!("{:?}", client.stats());
        }
        ConsoleCommand::Help => println!("{}", console::HELP),
        ConsoleCommand::Quit => {}
    }
}

async fn relay(uploader: HeartRateUploader) -> anyhow::Result<()> {
    info!(
        "Relaying heart rate for {} to {}",
        uploader.config().effective_user_id(),
        uploader.config().base_url
    );
    let (tx, rx) = mpsc::channel(64);

    let reader = tokio::spawn(async move {
        let mut lines = BufReader::new(tokio::io::stdin()).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            match line.parse::<u32>() {
                Ok(bpm) => {
                    if tx.send(bpm).await.is_err() {
                        break;
                    }
                }
                Err(_) => eprintln!("not a bpm value: {line}"),
            }
        }
    });

    let stats = run_relay(&uploader, rx).await;
    reader.await.context("stdin reader")?;
    println!("uploaded {}, failed {}", stats.uploaded, stats.failed);
    Ok(())
}
