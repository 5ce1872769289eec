//! cowatch: run a watch-session relay or join one from the terminal.
//!
//! `cowatch relay` serves sessions registered on the command line.
//! `cowatch join` connects a headless [`VirtualPlayer`] to a session and
//! reads commands from stdin:
//!
//! ```text
//! /play  /pause  /seek SECS  /log  /quit   anything else is sent as chat
//! ```

mod player;

use std::path::{Path, PathBuf};

use clap::{Parser, Subcommand};
use log::{info, warn};
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, BufReader};

use cowatch_sync::channel::{ChannelSender, Identity, SessionChannel};
use cowatch_sync::config::{ClientConfig, RelayConfig};
use cowatch_sync::error::SyncError;
use cowatch_sync::playback::{LocalOutcome, PlaybackEngine};
use cowatch_sync::protocol::{CommandKind, SessionId};
use cowatch_sync::registry::Member;
use cowatch_sync::relay::{RelayError, RelayServer};
use cowatch_sync::router::RouteOutcome;
use cowatch_sync::session::WatchSession;
use player::VirtualPlayer;

#[derive(Parser)]
#[command(version, about = "Synchronized playback and chat for shared watch sessions", long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Serve watch sessions
    Relay {
        /// JSON file with relay settings; flags override it
        #[arg(long, env = "COWATCH_RELAY_CONFIG")]
        config: Option<PathBuf>,

        /// Address to listen on
        #[arg(long, env = "COWATCH_BIND")]
        bind: Option<String>,

        /// Session to serve: `ID` (open to anyone) or `ID=user:Name,user:Name`
        #[arg(long = "session", value_parser = parse_session)]
        sessions: Vec<SessionSpec>,

        /// Chat messages replayed to late joiners
        #[arg(long, env = "COWATCH_CHAT_BACKFILL")]
        chat_backfill: Option<usize>,

        /// Do not deliver events back to their sender
        #[arg(long)]
        no_echo: bool,
    },
    /// Join a session as a headless viewer
    Join {
        /// JSON file with client settings; flags override it
        #[arg(long, env = "COWATCH_CLIENT_CONFIG")]
        config: Option<PathBuf>,

        /// Relay base URL
        #[arg(long, env = "COWATCH_SERVER")]
        server: Option<String>,

        /// Session to join
        #[arg(long, env = "COWATCH_SESSION")]
        session: String,

        /// Local user id
        #[arg(long, env = "COWATCH_USER")]
        user: String,

        /// Display name shown next to chat messages
        #[arg(long, env = "COWATCH_NAME")]
        name: Option<String>,

        /// Bearer credential passed to the relay
        #[arg(long, env = "COWATCH_TOKEN", default_value = "", hide_env_values = true)]
        token: String,
    },
}

/// A session registered on the relay command line.
#[derive(Debug, Clone, PartialEq)]
struct SessionSpec {
    id: SessionId,
    members: Vec<Member>,
}

#[derive(Debug, Error)]
enum CliError {
    #[error("invalid config {path}: {reason}")]
    Config { path: String, reason: String },
    #[error(transparent)]
    Relay(#[from] RelayError),
    #[error(transparent)]
    Sync(#[from] SyncError),
    #[error("stdin: {0}")]
    Stdin(#[from] std::io::Error),
}

fn parse_session(value: &str) -> Result<SessionSpec, String> {
    let (id, members) = match value.split_once('=') {
        Some((id, members)) => (id, Some(members)),
        None => (value, None),
    };
    if id.is_empty() {
        return Err("session id must not be empty".to_string());
    }

    let members = members
        .map(|list| {
            list.split(',')
                .filter(|entry| !entry.trim().is_empty())
                .map(|entry| match entry.split_once(':') {
                    Some((user, name)) if !user.trim().is_empty() => {
                        Ok(Member::new(user.trim(), name.trim()))
                    }
                    Some(_) => Err(format!("member `{entry}` has no user id")),
                    None => Ok(Member::new(entry.trim(), entry.trim())),
                })
                .collect::<Result<Vec<_>, _>>()
        })
        .transpose()?
        .unwrap_or_default();

    Ok(SessionSpec {
        id: SessionId::from(id),
        members,
    })
}

fn load_config<T>(path: Option<&Path>) -> Result<T, CliError>
where
    T: Default + serde::de::DeserializeOwned,
{
    let Some(path) = path else {
        return Ok(T::default());
    };
    let config_error = |reason: String| CliError::Config {
        path: path.display().to_string(),
        reason,
    };
    let text = std::fs::read_to_string(path).map_err(|e| config_error(e.to_string()))?;
    serde_json::from_str(&text).map_err(|e| config_error(e.to_string()))
}

#[tokio::main]
async fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();
    let result = match cli.command {
        Commands::Relay {
            config,
            bind,
            sessions,
            chat_backfill,
            no_echo,
        } => run_relay(config, bind, sessions, chat_backfill, no_echo).await,
        Commands::Join {
            config,
            server,
            session,
            user,
            name,
            token,
        } => {
            let name = name.unwrap_or_else(|| user.clone());
            let identity = Identity::new(user, name, token);
            run_join(config, server, SessionId::from(session), identity).await
        }
    };

    if let Err(e) = result {
        log::error!("{e}");
        std::process::exit(1);
    }
}

async fn run_relay(
    config_path: Option<PathBuf>,
    bind: Option<String>,
    sessions: Vec<SessionSpec>,
    chat_backfill: Option<usize>,
    no_echo: bool,
) -> Result<(), CliError> {
    let mut config: RelayConfig = load_config(config_path.as_deref())?;
    if let Some(bind) = bind {
        config.bind_addr = bind;
    }
    if let Some(chat_backfill) = chat_backfill {
        config.chat_backfill = chat_backfill;
    }
    if no_echo {
        config.echo_to_sender = false;
    }

    let relay = RelayServer::new(config);
    if sessions.is_empty() {
        warn!("No sessions registered; every join will be refused");
    }
    for spec in sessions {
        info!(
            "Registering session {} ({} members)",
            spec.id,
            spec.members.len()
        );
        relay.registry().create(spec.id, spec.members);
    }

    relay.run().await?;
    Ok(())
}

type CliSession = WatchSession<VirtualPlayer, ChannelSender>;

async fn run_join(
    config_path: Option<PathBuf>,
    server: Option<String>,
    session_id: SessionId,
    identity: Identity,
) -> Result<(), CliError> {
    let mut config: ClientConfig = load_config(config_path.as_deref())?;
    if let Some(server) = server {
        config.server_url = server;
    }

    let channel = SessionChannel::open(&config, &identity, &session_id).await?;
    let (sender, mut receiver) = channel.split();
    let mut session = WatchSession::new(
        session_id,
        &identity,
        VirtualPlayer::new(),
        sender.clone(),
        config.suppression_window(),
    );
    println!(
        "Joined {} as {}. /play /pause /seek SECS /log /quit",
        session.session_id(),
        identity.display_name
    );

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let outcome = loop {
        tokio::select! {
            frame = receiver.recv() => match frame {
                Some(raw) => {
                    let outcome = session.handle_inbound(&raw);
                    report_inbound(&session, outcome);
                }
                None => {
                    warn!("Relay closed session {}", session.session_id());
                    break Ok(());
                }
            },
            line = lines.next_line() => match line {
                Ok(Some(line)) => match handle_input(&mut session, line.trim()) {
                    Ok(true) => {}
                    Ok(false) => break Ok(()),
                    Err(e) => break Err(e),
                },
                Ok(None) => break Ok(()),
                Err(e) => break Err(e.into()),
            },
        }

        if let Err(e) = drain_player(&mut session) {
            break Err(e);
        }
    };

    sender.close();
    outcome
}

/// Apply one line of user input. Returns `false` when the user quits.
fn handle_input(session: &mut CliSession, line: &str) -> Result<bool, CliError> {
    let (command, arg) = match line.split_once(char::is_whitespace) {
        Some((command, arg)) => (command, arg.trim()),
        None => (line, ""),
    };

    match command {
        "" => {}
        "/quit" => return Ok(false),
        "/play" => session.engine_mut().play(),
        "/pause" => session.engine_mut().pause(),
        "/seek" => match arg.parse::<f64>() {
            Ok(position) if position.is_finite() => session.engine_mut().seek(position),
            _ => println!("usage: /seek SECONDS"),
        },
        "/log" => print_log(session),
        _ => {
            let entry = session.send_chat(line)?;
            println!("[{}] {}", entry.author_initials(), entry.message);
        }
    }
    Ok(true)
}

/// Feed the player's pending callbacks through echo suppression.
fn drain_player(session: &mut CliSession) -> Result<(), CliError> {
    while let Some((kind, position)) = session.engine_mut().next_callback() {
        match session.on_local_playback_event(kind, position)? {
            LocalOutcome::Emitted(_) => println!("> {kind} at {position:.1}s"),
            LocalOutcome::Suppressed(_) => {}
        }
    }
    Ok(())
}

fn report_inbound(session: &CliSession, outcome: RouteOutcome) {
    match outcome {
        RouteOutcome::Appended => {
            if let Some(entry) = session.chat().last() {
                println!("[{}] {}: {}", entry.author_initials(), entry.author_name, entry.message);
            }
        }
        RouteOutcome::Applied(_) => {
            let player = session.playback().engine();
            let status = if player.is_paused() {
                CommandKind::Pause
            } else {
                CommandKind::Play
            };
            println!("< synced: {status} at {:.1}s", player.position());
        }
        RouteOutcome::DuplicateChat | RouteOutcome::SelfOrigin | RouteOutcome::Dropped => {}
    }
}

fn print_log(session: &CliSession) {
    for entry in session.chat().iter() {
        let when = entry.timestamp.as_deref().unwrap_or("local");
        println!("{when} [{}] {}: {}", entry.author_initials(), entry.author_name, entry.message);
    }
    let state = session.last_known();
    println!(
        "-- {} at {:.1}s, {} chat message(s)",
        if state.paused { "paused" } else { "playing" },
        state.position,
        session.chat().len()
    );
}
