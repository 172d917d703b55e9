//! Interactive Call Client
//!
//! Terminal front-end for the call controller: shows who is online, places
//! and answers calls, and prints call events as they happen.

use anyhow::{Context, Result};
use clap::Parser;
use log::{info, warn};
use std::io::{self, Write};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::{broadcast, mpsc};

use duocall::call::{CallFailure, IncomingCall};
use duocall::media::{MediaConstraints, SimulatedMediaEngine, TrackKind};
use duocall::net::{self, SignalingConnection};
use duocall::{CallController, CallEvent, CallState, ClientConfig, ControllerOptions};

/// Command-line arguments
#[derive(Parser, Debug)]
#[command(name = "call-client")]
#[command(about = "Interactive one-to-one call client")]
struct Args {
    /// Configuration file path
    #[arg(short, long, default_value = "config/client.toml")]
    config: PathBuf,

    /// Server host
    #[arg(long)]
    host: Option<String>,

    /// Server port
    #[arg(short, long)]
    port: Option<u16>,

    /// User id to sign in as
    #[arg(short, long)]
    user: Option<String>,

    /// Name shown to the people you call
    #[arg(short, long)]
    name: Option<String>,

    /// Log level (overrides the config file)
    #[arg(long)]
    log_level: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Load configuration
    let mut config = if args.config.exists() {
        let path = args.config.to_string_lossy();
        ClientConfig::from_file(&path).with_context(|| format!("loading {}", path))?
    } else {
        ClientConfig::default()
    };
    if let Some(host) = args.host {
        config.server_host = host;
    }
    if let Some(port) = args.port {
        config.signaling_port = port;
    }
    if let Some(user) = args.user {
        config.user_id = user;
    }
    if args.name.is_some() {
        config.display_name = args.name;
    }

    // Initialize logging
    let level = args.log_level.unwrap_or_else(|| config.log_level.clone());
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(&level)).init();

    println!("📞 Duocall Interactive Client");
    println!("=============================");
    println!("User: {}", config.user_id);
    println!("Server: {}:{}", config.server_host, config.signaling_port);
    println!();

    println!("🔌 Connecting to relay...");
    let SignalingConnection {
        connection_id,
        outbound,
        inbound,
        mut tasks,
    } = net::connect(&config).await?;
    println!("✅ Connected ({})", connection_id);

    let engine = Arc::new(SimulatedMediaEngine::new());
    let controller = Arc::new(CallController::new(
        &config.user_id,
        engine,
        ControllerOptions::from_config(&config),
        outbound,
        inbound,
    ));
    let mut events = controller.subscribe();

    let (cmd_tx, mut cmd_rx) = mpsc::unbounded_channel::<String>();
    let input_task = tokio::spawn(async move { handle_user_input(cmd_tx).await });

    print_help();
    prompt();

    loop {
        tokio::select! {
            line = cmd_rx.recv() => {
                let Some(line) = line else {
                    break;
                };
                if !handle_command(&controller, &line) {
                    println!("👋 Goodbye!");
                    break;
                }
            }
            event = events.recv() => {
                match event {
                    Ok(event) => print_event(&controller, &event),
                    Err(broadcast::error::RecvError::Lagged(missed)) => {
                        warn!("Missed {} call events", missed);
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
            _ = tasks.closed() => {
                println!("Relay connection lost");
                break;
            }
        }
    }

    controller.shutdown();
    input_task.abort();
    info!("Client stopped");
    Ok(())
}

fn print_help() {
    println!();
    println!("💬 Commands:");
    println!("  users          - List users online");
    println!("  call <user>    - Start an audio call");
    println!("  video <user>   - Start an audio/video call");
    println!("  accept         - Answer the incoming call");
    println!("  decline        - Reject the incoming call");
    println!("  end            - Hang up");
    println!("  status         - Show the current call");
    println!("  quit           - Exit client");
    println!();
}

/// A parsed command line. Command words are case-insensitive.
#[derive(Debug, PartialEq)]
enum Command {
    Users,
    Call { callee: String, video: bool },
    Accept,
    Decline,
    End,
    Status,
    Help,
    Quit,
    Usage(&'static str),
    Unknown(String),
}

impl Command {
    fn parse(line: &str) -> Option<Command> {
        let mut parts = line.split_whitespace();
        let word = parts.next()?.to_lowercase();
        let command = match word.as_str() {
            "users" => Command::Users,
            "call" | "video" => {
                let video = word == "video";
                match parts.next() {
                    Some(callee) => Command::Call {
                        callee: callee.to_string(),
                        video,
                    },
                    None if video => Command::Usage("video <user>"),
                    None => Command::Usage("call <user>"),
                }
            }
            "accept" => Command::Accept,
            "decline" => Command::Decline,
            "end" | "hangup" => Command::End,
            "status" => Command::Status,
            "help" => Command::Help,
            "quit" | "exit" => Command::Quit,
            _ => Command::Unknown(word),
        };
        Some(command)
    }
}

/// Run one command line. Returns false when the user asked to quit.
fn handle_command(controller: &Arc<CallController>, line: &str) -> bool {
    let Some(command) = Command::parse(line) else {
        prompt();
        return true;
    };

    match command {
        Command::Users => {
            let others: Vec<String> = controller
                .online_users()
                .into_iter()
                .filter(|u| u != controller.user_id())
                .collect();
            if others.is_empty() {
                println!("  Nobody else is online");
            } else {
                println!("👥 Online:");
                for user in others {
                    println!("  {}", user);
                }
            }
        }
        Command::Call { callee, video } => {
            let controller = controller.clone();
            tokio::spawn(async move {
                let result = if video {
                    controller
                        .start_with(&callee, MediaConstraints::audio_video())
                        .await
                } else {
                    controller.start(&callee).await
                };
                if let Err(e) = result {
                    println!("{} ❌ {}", timestamp(), e);
                    prompt();
                }
            });
        }
        Command::Accept => {
            let controller = controller.clone();
            tokio::spawn(async move {
                if let Err(e) = controller.accept().await {
                    println!("{} ❌ {}", timestamp(), e);
                    prompt();
                }
            });
        }
        Command::Decline => {
            if let Err(e) = controller.decline() {
                println!("❌ {}", e);
            }
        }
        Command::End => {
            if !controller.end() {
                println!("No call in progress");
            }
        }
        Command::Status => print_status(controller),
        Command::Help => print_help(),
        Command::Quit => return false,
        Command::Usage(usage) => println!("Usage: {}", usage),
        Command::Unknown(word) => {
            println!("Unknown command: {}. Type 'help' for available commands.", word);
        }
    }
    prompt();
    true
}

fn print_status(controller: &CallController) {
    match (controller.state(), controller.peer_id()) {
        (CallState::Idle, _) | (_, None) => println!("📴 No call"),
        (state, Some(peer)) => {
            println!("📞 {} with {}", state, peer);
            if let Some(stream) = controller.local_stream() {
                println!("  Local: {}", describe_tracks(stream.tracks().iter().map(|t| t.kind())));
            }
            if let Some(stream) = controller.remote_stream() {
                println!("  Remote: {}", describe_tracks(stream.tracks().iter().map(|t| t.kind())));
            }
        }
    }
}

fn describe_tracks(kinds: impl Iterator<Item = TrackKind>) -> String {
    let names: Vec<&str> = kinds
        .map(|kind| match kind {
            TrackKind::Audio => "audio",
            TrackKind::Video => "video",
        })
        .collect();
    if names.is_empty() {
        "no tracks".to_string()
    } else {
        names.join(" + ")
    }
}

fn print_event(controller: &CallController, event: &CallEvent) {
    let now = timestamp();
    match event {
        CallEvent::StateChanged { state, peer_id } => match (state, peer_id) {
            (CallState::RingingOutgoing, Some(peer)) => println!("{} 📤 Calling {}...", now, peer),
            (CallState::Active, Some(peer)) => println!("{} 🟢 In call with {}", now, peer),
            (CallState::Idle, _) => println!("{} 📴 Call ended", now),
            // Incoming calls are announced by their own event
            _ => return,
        },
        CallEvent::IncomingCall(IncomingCall {
            from_user_id,
            from_name,
        }) => {
            let caller = match from_name {
                Some(name) => format!("{} ({})", name, from_user_id),
                None => from_user_id.clone(),
            };
            println!("{} 📲 Incoming call from {}. Type 'accept' or 'decline'", now, caller);
        }
        CallEvent::RemoteTrack { peer_id, kind } => {
            let kind = describe_tracks(std::iter::once(*kind));
            println!("{} 🔊 Receiving {} from {}", now, kind, peer_id);
        }
        CallEvent::Presence(users) => {
            let others = users.iter().filter(|u| *u != controller.user_id()).count();
            println!("{} 👥 {} other user(s) online", now, others);
        }
        CallEvent::Failed(CallFailure::TargetOffline { peer_id }) => {
            println!("{} ❌ {} is offline", now, peer_id);
        }
        CallEvent::Failed(CallFailure::MediaAcquisitionDenied { reason }) => {
            println!("{} ❌ Could not access microphone/camera: {}", now, reason);
        }
    }
    prompt();
}

fn timestamp() -> String {
    chrono::Local::now().format("%H:%M:%S").to_string()
}

fn prompt() {
    print!("> ");
    let _ = io::stdout().flush();
}

async fn handle_user_input(cmd_tx: mpsc::UnboundedSender<String>) -> Result<()> {
    let stdin = tokio::io::stdin();
    let reader = BufReader::new(stdin);
    let mut lines = reader.lines();

    while let Some(line) = lines.next_line().await? {
        if cmd_tx.send(line).is_err() {
            break;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_command_words_ignore_case() {
        assert_eq!(
            Command::parse("VIDEO bob"),
            Some(Command::Call {
                callee: "bob".to_string(),
                video: true,
            })
        );
        assert_eq!(
            Command::parse("Call Bob"),
            Some(Command::Call {
                callee: "Bob".to_string(),
                video: false,
            })
        );
        assert_eq!(Command::parse("  HangUp "), Some(Command::End));
        assert_eq!(Command::parse("Video"), Some(Command::Usage("video <user>")));
    }

    #[test]
    fn test_blank_and_unknown_lines() {
        assert_eq!(Command::parse("   "), None);
        assert_eq!(
            Command::parse("Dance now"),
            Some(Command::Unknown("dance".to_string()))
        );
    }
}
