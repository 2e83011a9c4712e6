use std::path::PathBuf;

use anyhow::{bail, Result};
use chat_client::{load_config, ConnectionEvent, ConnectionManager, ErrorInfo};
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

const USAGE: &str = "usage: chat-client [settings.json] <conversation-id>...";

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::from_default_env().add_directive(tracing::Level::INFO.into()))
        .init();

    let (settings, conversations) = parse_args(std::env::args().skip(1))?;
    let config = load_config(settings.as_deref())?;

    info!("Chat client starting");
    info!("  Channel endpoint: {}", config.base_url);
    info!("  Pool capacity: {}", config.pool_capacity());

    let manager = ConnectionManager::websocket(config);
    let mut events = manager.subscribe().await;

    // The last listed conversation ends up active
    for id in &conversations {
        manager.connect(id).await?;
    }

    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    loop {
        tokio::select! {
            event = events.recv() => match event {
                Some(event) => print_event(&event),
                None => break,
            },

            line = lines.next_line() => match line? {
                Some(line) => {
                    if !handle_line(&manager, line.trim()).await {
                        break;
                    }
                }
                None => break,
            },

            _ = tokio::signal::ctrl_c() => {
                info!("[MAIN] Interrupted");
                break;
            }
        }
    }

    manager.shutdown().await;
    info!("[MAIN] Bye");
    Ok(())
}

/// Split arguments into an optional settings file and conversation ids
fn parse_args(args: impl Iterator<Item = String>) -> Result<(Option<PathBuf>, Vec<String>)> {
    let mut args: Vec<String> = args.collect();
    if args.iter().any(|a| a == "-h" || a == "--help") {
        bail!(USAGE);
    }

    let settings = match args.first() {
        Some(first) if first.ends_with(".json") => Some(PathBuf::from(args.remove(0))),
        _ => None,
    };
    if args.is_empty() {
        bail!(USAGE);
    }
    Ok((settings, args))
}

/// Returns false when the user asked to quit
async fn handle_line(manager: &ConnectionManager, line: &str) -> bool {
    if line.is_empty() {
        return true;
    }

    let (command, rest) = line.split_once(' ').unwrap_or((line, ""));
    match command {
        "/quit" => return false,
        "/switch" if !rest.trim().is_empty() => {
            if let Err(e) = manager.connect(rest.trim()).await {
                error!("[MAIN] Switch failed: {}", e);
            }
        }
        "/status" => {
            let active = manager.active_conversation().await;
            let status = manager.active_status().await;
            println!(
                "{}: {} (queued {}, latency {:?}, stable {}){}",
                active.as_deref().unwrap_or("<none>"),
                status.state,
                status.queue_depth,
                status.quality.latency,
                status.quality.is_stable,
                status
                    .last_error
                    .map(|e| format!(" last error: {e}"))
                    .unwrap_or_default()
            );
        }
        "/stats" => {
            let stats = manager.stats().await;
            println!("{} connections, {} open", stats.total, stats.open);
            for conn in stats.connections {
                println!(
                    "  {} {} queued={} retries={}",
                    conn.conversation_id, conn.state, conn.queue_depth, conn.reconnect_attempts
                );
            }
        }
        _ if command.starts_with('/') => warn!("[MAIN] Unknown command: {}", command),
        _ => {
            let Some(active) = manager.active_conversation().await else {
                warn!("[MAIN] No active conversation");
                return true;
            };
            match manager.send(&active, line).await {
                Ok(true) => {}
                Ok(false) => info!("[MAIN] Queued for {} until it reconnects", active),
                Err(e) => error!("[MAIN] Send failed: {}", e),
            }
        }
    }
    true
}

fn print_event(event: &ConnectionEvent) {
    match event {
        ConnectionEvent::Message {
            conversation_id,
            message,
        } => println!(
            "[{}] {}: {}",
            conversation_id,
            message.sender_id.as_deref().unwrap_or("?"),
            message.text
        ),
        ConnectionEvent::StateChanged {
            conversation_id,
            from,
            to,
        } => info!("[MAIN] {} {} -> {}", conversation_id, from, to),
        ConnectionEvent::Opened { conversation_id } => info!("[MAIN] {} connected", conversation_id),
        ConnectionEvent::Closed {
            conversation_id,
            code,
        } => warn!("[MAIN] {} closed (code {:?})", conversation_id, code),
        ConnectionEvent::Error {
            conversation_id,
            error: err @ ErrorInfo::Exhausted { .. },
        } => error!("[MAIN] {} offline: {}", conversation_id, err),
        ConnectionEvent::Error {
            conversation_id,
            error: err,
        } => warn!("[MAIN] {} {}", conversation_id, err),
    }
}
