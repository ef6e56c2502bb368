use anyhow::Result;
use clap::Parser;
use log::{info, LevelFilter};
use std::path::PathBuf;

use mecachat::config::{self, ChatConfig};
use mecachat::rest::PageQuery;
use mecachat::sync::ChatClient;
use mecachat::utils;
use mecachat::ChatEvent;

/// Command line arguments for the mecachat event tail
#[derive(Parser, Debug)]
#[command(
    author,
    version,
    about = "mecachat: synchronization engine for the workshop chat platform.",
    long_about = "Connects to the chat backend, subscribes to the global notification \
    stream and prints engine events as they arrive.\n\n\
    Configuration comes from MECACHAT_API_BASE, MECACHAT_WS_BASE and \
    MECACHAT_TOKEN, falling back to the cached config file."
)]
struct Args {
    /// Override the config directory (config.json location)
    #[arg(long, value_name = "PATH")]
    config_dir: Option<PathBuf>,

    /// Log file path (defaults to mecachat.log in the working directory)
    #[arg(long, value_name = "PATH")]
    log_file: Option<PathBuf>,

    /// Open this conversation after connecting
    #[arg(long, value_name = "UUID")]
    conversation: Option<uuid::Uuid>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let log_file_path = args
        .log_file
        .unwrap_or_else(|| PathBuf::from("mecachat.log"));
    utils::setup_logging(log_file_path.to_str(), LevelFilter::Debug)?;
    info!("mecachat starting up");

    if let Some(dir) = args.config_dir {
        config::set_config_dir_override(dir);
    }

    let chat_config = match ChatConfig::load()? {
        Some(config) => config,
        None => {
            eprintln!("No configuration found.");
            eprintln!("Enter API base URL (e.g. https://api.example.com/api/v1/chat):");
            let api_base = utils::read_line()?;
            eprintln!("Enter WebSocket base URL (e.g. wss://api.example.com):");
            let ws_base = utils::read_line()?;
            eprintln!("Enter auth token:");
            let token = utils::read_line()?;
            let config = ChatConfig::new(&api_base, &ws_base, Some(&token));
            config::save_config(&config)?;
            config
        }
    };

    println!("Connecting to {} ...", chat_config.ws_base);
    let (client, mut events) = ChatClient::new(chat_config)?;
    client.connect_notifications().await?;
    client.refresh_conversations(&PageQuery::new()).await?;

    for conversation in client.conversations_snapshot().await {
        println!(
            "  [{}] {} (unread: {})",
            conversation.uuid, conversation.subject, conversation.unread_count
        );
    }

    if let Some(conversation) = args.conversation {
        client.select_conversation(conversation).await?;
        for message in client.messages_snapshot().await {
            println!(
                "  {} {}: {}",
                message.created_at.format("%H:%M:%S"),
                message.sender.display_name,
                message.content
            );
        }
    }

    println!("Listening for events (ctrl-c to quit)...");
    loop {
        tokio::select! {
            event = events.recv() => {
                match event {
                    Some(ChatEvent::Notification(notification)) => {
                        println!("notification: {:?}", notification.notification_type);
                    }
                    Some(ChatEvent::UnreadTotal(count)) => {
                        println!("unread total: {}", count);
                    }
                    Some(ChatEvent::MessagesUpdated { conversation }) => {
                        println!("messages updated in {}", conversation);
                    }
                    Some(ChatEvent::ConversationsUpdated) => {
                        println!("conversation list updated");
                    }
                    Some(ChatEvent::Typing { conversation, user_id, is_typing }) => {
                        println!("typing in {}: user {} {}", conversation, user_id, is_typing);
                    }
                    Some(ChatEvent::Connection { scope, state }) => {
                        println!("connection {}: {:?}", scope, state);
                    }
                    Some(ChatEvent::SessionExpired) => {
                        eprintln!("Session expired - please log in again.");
                        break;
                    }
                    Some(ChatEvent::Error(message)) => {
                        eprintln!("error: {}", message);
                    }
                    None => break,
                }
            }
            _ = tokio::signal::ctrl_c() => {
                println!("Shutting down...");
                break;
            }
        }
    }

    client.disconnect().await;
    Ok(())
}
