use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use client_core::{
    ClientConfig, ClientEvent, FileCredentialSink, MatchupClient, SessionPhase, TimelineState,
};
use shared::domain::{MatchupId, MatchupSummary};
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::warn;
use uuid::Uuid;

mod config;

#[derive(Parser, Debug)]
struct Args {
    /// GraphQL endpoint, overriding the config file.
    #[arg(long)]
    endpoint: Option<String>,
    /// Matchup to open; defaults to the first one listed.
    #[arg(long)]
    matchup: Option<Uuid>,
    /// Drop the stored credential and exit.
    #[arg(long)]
    logout: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt().init();
    let args = Args::parse();
    let settings = config::load_settings();

    let endpoint = args.endpoint.unwrap_or(settings.endpoint);
    let mut client_config = ClientConfig::new(endpoint)?;
    client_config.poll_interval = Duration::from_millis(settings.poll_interval_ms);
    let sink = Arc::new(FileCredentialSink::new(settings.cookie_file));
    let client = MatchupClient::new_with_sink(client_config, sink);

    if args.logout {
        client.start().await?;
        client.logout().await?;
        println!("Logged out.");
        return Ok(());
    }

    let phase = client.start().await?;
    if phase != SessionPhase::Idle {
        login(&client).await?;
    }

    let profile_id = client
        .current_profile_id()
        .await?
        .context("login did not produce a profile")?;
    println!("Logged in as profile {profile_id}");

    let summaries = client.matchups().await?;
    print_listing(&summaries);

    let matchup_id = match args.matchup {
        Some(id) => MatchupId(id),
        None => summaries
            .first()
            .map(|summary| summary.matchup.id)
            .context("no matchups to open")?,
    };

    run_conversation(&client, matchup_id).await
}

/// Creates a session and waits for its out-of-band confirmation.
async fn login(client: &MatchupClient) -> Result<()> {
    let mut events = client.subscribe_events();
    client.begin_login().await?;
    println!("Waiting for login confirmation...");
    loop {
        match events.recv().await? {
            ClientEvent::SessionAwaitingConfirmation { session_id } => {
                println!("Confirm this session from a logged-in device: {session_id}");
            }
            ClientEvent::PhaseChanged(SessionPhase::Idle) => return Ok(()),
            ClientEvent::Error(message) => warn!(message, "client error"),
            _ => {}
        }
    }
}

fn print_listing(summaries: &[MatchupSummary]) {
    if summaries.is_empty() {
        println!("No matchups yet.");
        return;
    }
    println!("Matchups:");
    for summary in summaries {
        match &summary.last_message {
            Some(message) => println!(
                "  {}  [{}] {}",
                summary.matchup.id,
                message.timestamp.format("%H:%M"),
                message.text
            ),
            None => println!("  {}  (no messages)", summary.matchup.id),
        }
    }
}

async fn run_conversation(client: &MatchupClient, matchup_id: MatchupId) -> Result<()> {
    let mut watch = client.watch_matchup(matchup_id).await;
    println!("Opened matchup {matchup_id}. Type a message and press enter; ctrl-d exits.");
    render(&watch.timeline());

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut live = true;
    loop {
        tokio::select! {
            changed = watch.changed(), if live => {
                if changed {
                    render(&watch.timeline());
                } else {
                    live = false;
                    println!("(live updates ended)");
                }
            }
            line = lines.next_line() => {
                let Some(line) = line? else {
                    client.shutdown().await;
                    return Ok(());
                };
                let text = line.trim();
                if text.is_empty() {
                    continue;
                }
                if let Err(err) = client.send_message(matchup_id, text).await {
                    warn!(error = %err, "send failed");
                }
            }
        }
    }
}

/// Prints the conversation with consecutive messages from one sender
/// grouped under a single header.
fn render(timeline: &TimelineState) {
    match timeline {
        TimelineState::Unavailable { reason } => println!("-- {reason} --"),
        TimelineState::Ready { messages } => {
            println!("----");
            for rendered in messages {
                if rendered.first_of_run {
                    println!(
                        "[{}] {}:",
                        rendered.message.timestamp.format("%Y-%m-%d %H:%M"),
                        rendered.message.sender_id
                    );
                }
                println!("    {}", rendered.message.text);
                if rendered.last_of_run {
                    println!();
                }
            }
        }
    }
}
