use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::Parser;
use client_core::{
    load_settings, ClientSettings, ConversationKey, ConversationSession, Delivery, SessionEvent,
    StaticToken,
};
use shared::{ChannelId, MessageId, UserId};
use tokio::{
    io::{AsyncBufReadExt, BufReader},
    sync::broadcast::error::RecvError,
};
use tracing::warn;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
struct Args {
    /// Overrides `api_base_url` from client.toml.
    #[arg(long)]
    api_url: Option<String>,
    /// Overrides `push_url` from client.toml.
    #[arg(long)]
    push_url: Option<String>,
    #[arg(long)]
    token: String,
    #[arg(long)]
    user: String,
    #[arg(long, conflicts_with = "direct")]
    channel: Option<String>,
    /// Recipient user id for a direct conversation.
    #[arg(long)]
    direct: Option<String>,
}

impl Args {
    fn settings(&self) -> ClientSettings {
        let mut settings = load_settings();
        if let Some(url) = &self.api_url {
            settings.api_base_url = url.clone();
        }
        if let Some(url) = &self.push_url {
            settings.push_url = url.clone();
        }
        settings
    }

    fn conversation(&self) -> Result<ConversationKey> {
        match (&self.channel, &self.direct) {
            (Some(channel), _) => Ok(ConversationKey::Channel(ChannelId::new(channel.as_str()))),
            (None, Some(recipient)) => Ok(ConversationKey::Direct {
                self_id: UserId::new(self.user.as_str()),
                recipient_id: UserId::new(recipient.as_str()),
            }),
            (None, None) => bail!("pass --channel or --direct"),
        }
    }
}

fn print_messages(session: &ConversationSession) {
    for message in session.messages() {
        let marker = match &message.delivery {
            Delivery::Confirmed => "",
            Delivery::Pending => " (sending)",
            Delivery::Failed { .. } => " (failed)",
        };
        println!(
            "[{}] {} <{}>: {}{marker}",
            message.timestamp.format("%H:%M"),
            message.id,
            message.display_name,
            message.content
        );
    }
}

/// `/edit <id> <text>`, `/delete <id>`, `/react <id> <type>`, `/reload`;
/// anything else is sent as a message.
async fn handle_line(session: &ConversationSession, line: &str) -> Result<()> {
    let mut parts = line.splitn(3, ' ');
    match parts.next() {
        Some("/edit") => {
            let id = MessageId::new(parts.next().context("missing message id")?);
            session
                .edit_message(&id, parts.next().unwrap_or_default())
                .await?;
        }
        Some("/delete") => {
            let id = MessageId::new(parts.next().context("missing message id")?);
            session.delete_message(&id).await?;
        }
        Some("/react") => {
            let id = MessageId::new(parts.next().context("missing message id")?);
            session.react(&id, parts.next().unwrap_or("like"))?;
        }
        Some("/reload") => session.reload().await?,
        _ => {
            session.send_text(line, None).await?;
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();
    let args = Args::parse();
    let key = args.conversation()?;

    let session = ConversationSession::from_settings(
        UserId::new(args.user.as_str()),
        Arc::new(StaticToken(args.token.clone())),
        &args.settings(),
    )?;
    let mut updates = session.subscribe_updates();
    session.sign_in().await;
    if let Err(err) = session.open_conversation(key.clone()).await {
        warn!(conversation = %key, "initial history unavailable: {err}");
    }
    print_messages(&session);

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            line = lines.next_line() => {
                let Some(line) = line? else { break };
                let line = line.trim();
                if line == "/quit" {
                    break;
                }
                if line.is_empty() {
                    continue;
                }
                if let Err(err) = handle_line(&session, line).await {
                    println!("! {err}");
                }
            }
            event = updates.recv() => match event {
                Ok(SessionEvent::MessagesChanged(_)) => print_messages(&session),
                Ok(SessionEvent::ConnectionChanged(status)) => {
                    println!("-- connection {:?} (retry {})", status.state, status.retry_count);
                }
                Ok(SessionEvent::Notice(text)) => println!("! {text}"),
                Err(RecvError::Lagged(skipped)) => {
                    warn!(skipped, "dropped session updates");
                    print_messages(&session);
                }
                Err(RecvError::Closed) => break,
            },
        }
    }

    session.sign_out();
    Ok(())
}
