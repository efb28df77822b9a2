use anyhow::{Context, Result};
use clap::Parser;
use std::collections::HashMap;
use std::path::PathBuf;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::broadcast;
use tracing::{info, warn};
use tracing_subscriber::prelude::*;

use chat_sync::{
    ConnectionState, Credential, MessageStatus, Role, SyncConfig, SyncHandle, SyncNotice,
    SyncSnapshot,
};

#[derive(Parser)]
#[command(name = "chat-sync")]
#[command(about = "Line-oriented chat client on top of the conversation sync core")]
struct Cli {
    /// Custom data directory (defaults to ~/.chat-sync)
    #[arg(long)]
    data_dir: Option<PathBuf>,

    /// Bearer token issued by the chat server
    #[arg(long, env = "CHAT_SYNC_TOKEN", hide_env_values = true)]
    token: String,

    /// Conversation to open after login (defaults to the most recent one)
    #[arg(long)]
    conversation: Option<String>,

    /// Enable debug logging
    #[arg(short, long)]
    debug: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Setup logging. stdout belongs to the conversation.
    let default_directive = if cli.debug {
        "chat_sync=debug,info"
    } else {
        "chat_sync=info,warn"
    };
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_directive));
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(env_filter)
        .init();

    let (data_dir, config) = SyncConfig::load(cli.data_dir)?;
    info!(data_dir = %data_dir.display(), api = %config.api_url, ws = %config.ws_url, "starting chat-sync");

    let handle = SyncHandle::start(&config)
        .await
        .context("Failed to start sync core")?;

    let printer = tokio::spawn(print_updates(
        handle.subscribe_snapshots(),
        handle.subscribe_notices(),
    ));

    if let Err(e) = handle.login(Credential::new(cli.token)).await {
        warn!(error = %e, "initial conversation list failed");
    }
    if let Some(id) = cli.conversation.as_deref()
        && let Err(e) = handle.select_conversation(id).await
    {
        eprintln!("cannot open {id}: {e}");
    }

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        match run_line(&handle, line).await {
            Ok(true) => {}
            Ok(false) => break,
            Err(e) => eprintln!("error: {e}"),
        }
    }

    handle.shutdown().await.ok();
    printer.abort();
    Ok(())
}

/// Execute one input line. Returns false to quit.
async fn run_line(handle: &SyncHandle, line: &str) -> Result<bool> {
    let (command, arg) = match line.split_once(' ') {
        Some((command, arg)) => (command, arg.trim()),
        None => (line, ""),
    };

    match command {
        "/quit" => return Ok(false),
        "/list" => {
            handle.refresh_conversations().await?;
            let snapshot = handle.snapshot();
            for conv in &snapshot.conversations {
                let marker = if snapshot.active_conversation_id.as_deref() == Some(&conv.id) {
                    "*"
                } else {
                    " "
                };
                println!(
                    "{marker} {}  {}  ({} messages, {})",
                    conv.id,
                    conv.title,
                    conv.message_count,
                    conv.updated_at.format("%Y-%m-%d %H:%M")
                );
            }
        }
        "/new" => {
            let title = (!arg.is_empty()).then_some(arg);
            let conv = handle.create_conversation(title).await?;
            println!("created {} ({})", conv.id, conv.title);
        }
        "/switch" if !arg.is_empty() => handle.select_conversation(arg).await?,
        "/delete" if !arg.is_empty() => handle.delete_conversation(arg).await?,
        "/resend" if !arg.is_empty() => {
            let msg = handle.resend_message(arg).await?;
            if msg.status == MessageStatus::NotSent {
                println!("still offline, {} not sent", msg.id);
            }
        }
        "/switch" | "/delete" | "/resend" => anyhow::bail!("usage: {command} <id>"),
        _ if command.starts_with('/') => anyhow::bail!("unknown command: {command}"),
        _ => {
            handle.send_message(line).await?;
        }
    }
    Ok(true)
}

/// Print connection changes, new or changed messages in the active
/// conversation, and notices.
async fn print_updates(
    mut snapshots: tokio::sync::watch::Receiver<SyncSnapshot>,
    mut notices: broadcast::Receiver<SyncNotice>,
) {
    let mut connection = ConnectionState::Disconnected;
    let mut active: Option<String> = None;
    let mut seen: HashMap<String, MessageStatus> = HashMap::new();

    loop {
        tokio::select! {
            changed = snapshots.changed() => {
                if changed.is_err() {
                    break;
                }
                let snapshot = snapshots.borrow_and_update().clone();

                if snapshot.connection != connection {
                    connection = snapshot.connection;
                    println!("-- {connection}");
                }
                if snapshot.active_conversation_id != active {
                    active = snapshot.active_conversation_id.clone();
                    seen.clear();
                    match active.as_deref() {
                        Some(id) => println!("== {id}"),
                        None => println!("== (no conversation)"),
                    }
                }
                for msg in &snapshot.active_messages {
                    if seen.get(&msg.id) == Some(&msg.status) {
                        continue;
                    }
                    seen.insert(msg.id.clone(), msg.status);
                    let who = match msg.role {
                        Role::User => "you",
                        Role::Assistant => "assistant",
                    };
                    let status = match msg.status {
                        MessageStatus::Pending => " (sending)",
                        MessageStatus::NotSent => " (not sent, /resend to retry)",
                        MessageStatus::Confirmed => "",
                    };
                    println!("[{}] {who}: {}{status}", msg.id, msg.content);
                }
            }
            notice = notices.recv() => match notice {
                Ok(SyncNotice::SessionInvalid) => eprintln!("!! session expired, log in again"),
                Ok(SyncNotice::OperationFailed { operation, error }) => eprintln!("!! {operation} failed: {error}"),
                Ok(SyncNotice::MessageNotSent { message_id, .. }) => eprintln!("!! {message_id} not sent"),
                Ok(SyncNotice::ServerError { message }) => eprintln!("!! server: {message}"),
                Err(broadcast::error::RecvError::Lagged(n)) => warn!(skipped = n, "notice stream lagged"),
                Err(broadcast::error::RecvError::Closed) => break,
            },
        }
    }
}
