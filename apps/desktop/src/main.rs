use std::{
    io::{self, Write as _},
    sync::Arc,
};

use anyhow::{Context, Result};
use clap::Parser;
use client_core::{
    resolve_identity, ChatClient, ClientEvent, HttpChannelGateway, IdentityResolution,
    JsonPreferenceStore, PreferenceStore, StoredIdentity, PLACEHOLDER_NICKNAME,
};
use shared::domain::{Identity, Message};
use tokio::io::AsyncBufReadExt;
use tracing::info;

#[derive(Parser, Debug)]
struct Args {
    /// Chat backend base URL; falls back to CHAT_SERVER_URL.
    #[arg(long)]
    server_url: Option<String>,
    /// Overrides and persists the stored nickname.
    #[arg(long)]
    nickname: Option<String>,
    #[arg(long, default_value = "chat-prefs.json")]
    prefs_path: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt().init();
    let args = Args::parse();
    let server_url = args
        .server_url
        .or_else(|| std::env::var("CHAT_SERVER_URL").ok())
        .context("--server-url or CHAT_SERVER_URL is required")?;

    let store = JsonPreferenceStore::new(&args.prefs_path);
    let identity = match (resolve_identity(&store)?, args.nickname) {
        (
            IdentityResolution::Ready(identity) | IdentityResolution::NicknameRequired(identity),
            Some(nickname),
        ) => adopt_nickname(&store, identity, nickname)?,
        (IdentityResolution::Ready(identity), None) => identity,
        (IdentityResolution::NicknameRequired(identity), None) => {
            let nickname = prompt_nickname()?;
            adopt_nickname(&store, identity, nickname)?
        }
    };

    let gateway = HttpChannelGateway::new(server_url);
    let client = ChatClient::new(gateway);
    let mut events = client.subscribe_events();
    client.start(identity.clone()).await?;
    info!(user = %identity.user_id, "chat session started");

    let printer = {
        let client = Arc::clone(&client);
        tokio::spawn(async move {
            while let Ok(event) = events.recv().await {
                match event {
                    ClientEvent::ChannelSelected(channel) => {
                        println!("-- {} ({} members)", channel.name, channel.member_count);
                        for message in client.snapshot().await {
                            print_message(&message);
                        }
                    }
                    ClientEvent::LogChanged { admitted, .. } => {
                        let snapshot = client.snapshot().await;
                        let start = snapshot.len().saturating_sub(admitted.max(1));
                        for message in &snapshot[start..] {
                            print_message(message);
                        }
                    }
                    ClientEvent::AutoSynced { admitted } if admitted > 0 => {
                        println!("(( recovered {admitted} missed messages ))");
                    }
                    ClientEvent::Error { kind, message } => {
                        eprintln!("!! {kind:?}: {message}");
                    }
                    _ => {}
                }
            }
        })
    };

    println!("type a message, or /channels, /switch <n>, /create <name>, /sync, /quit");
    let mut lines = tokio::io::BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        let line = line.trim().to_string();
        if line.is_empty() {
            continue;
        }
        match line.split_once(' ') {
            _ if line == "/quit" => break,
            _ if line == "/sync" => {
                if let Err(err) = client.trigger_manual_sync().await {
                    eprintln!("!! {err}");
                }
            }
            _ if line == "/channels" => list_channels(&client).await,
            Some(("/switch", rest)) => switch_channel(&client, rest.trim()).await,
            Some(("/create", rest)) => {
                if let Err(err) = client.create_channel(rest.trim()).await {
                    eprintln!("!! {err}");
                }
            }
            _ => {
                if let Err(err) = client.send_message(&line).await {
                    eprintln!("!! send failed: {err}");
                }
            }
        }
    }

    client.close().await;
    printer.abort();
    Ok(())
}

async fn list_channels(client: &Arc<ChatClient>) {
    match client.list_channels().await {
        Ok(channels) => {
            for (index, channel) in channels.iter().enumerate() {
                println!(
                    "{index}: {} ({} members, {} unread) {}",
                    channel.name, channel.member_count, channel.unread_message_count,
                    channel.last_message
                );
            }
        }
        Err(err) => eprintln!("!! {err}"),
    }
}

async fn switch_channel(client: &Arc<ChatClient>, index: &str) {
    let Ok(index) = index.parse::<usize>() else {
        eprintln!("usage: /switch <index>");
        return;
    };
    match client.list_channels().await {
        Ok(channels) => match channels.get(index) {
            Some(channel) => {
                if let Err(err) = client.select_channel(channel).await {
                    eprintln!("!! {err}");
                }
            }
            None => eprintln!("no channel at index {index}"),
        },
        Err(err) => eprintln!("!! {err}"),
    }
}

fn adopt_nickname(
    store: &JsonPreferenceStore,
    identity: Identity,
    nickname: String,
) -> Result<Identity> {
    let nickname = nickname.trim().to_string();
    anyhow::ensure!(!nickname.is_empty(), "nickname must not be empty");
    store.store(&StoredIdentity {
        user_id: identity.user_id.0.clone(),
        nickname: nickname.clone(),
    })?;
    Ok(Identity {
        user_id: identity.user_id,
        nickname,
    })
}

fn prompt_nickname() -> Result<String> {
    let mut input = String::new();
    loop {
        print!("pick a nickname: ");
        io::stdout().flush()?;
        input.clear();
        io::stdin().read_line(&mut input)?;
        let nickname = input.trim();
        if !nickname.is_empty() && nickname != PLACEHOLDER_NICKNAME {
            return Ok(nickname.to_string());
        }
    }
}

fn print_message(message: &Message) {
    println!(
        "[{}] {}: {}",
        message.sent_at.format("%H:%M:%S"),
        message.sender,
        message.text
    );
}
