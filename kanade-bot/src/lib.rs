//! Kanade Bot - Discord mention bot backed by Gemini.
//!
//! The process runs four long-lived tasks sharing one [`MemoryStore`]:
//! - the Discord gateway listener, reconnected with backoff
//! - the event handler, which answers mentions and slash commands
//! - the eviction sweeper
//! - the liveness HTTP server
//!
//! All of them stop when the shutdown signal fires.

#![warn(clippy::all)]
#![allow(clippy::pedantic)]

pub mod attachments;
pub mod commands;
pub mod discord;
pub mod handler;
pub mod message;
pub mod provider;
pub mod responder;
pub mod routes;
pub mod traits;

pub use attachments::HttpAttachmentReader;
pub use commands::{Command, CommandHandler};
pub use discord::{run_supervised, Backoff, DiscordChannel};
pub use handler::EventHandler;
pub use message::{Attachment, CommandInvocation, GatewayEvent, IncomingMessage, OutgoingMessage};
pub use provider::{GeminiProvider, ModelProvider, ProviderError};
pub use responder::{Responder, REMOTE_ERROR_REPLY, SESSION_ERROR_REPLY};
pub use traits::{AttachmentReader, Channel, ChannelError, ChannelResult};

use kanade_common::config::BotConfig;
use kanade_memory::{EvictionSweeper, MemoryStore, SweeperConfig};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};

/// Buffered gateway events before the listener waits on the handler.
const EVENT_BUFFER: usize = 256;

/// How long shutdown waits for each task.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// Run the bot until Ctrl+C or SIGTERM.
pub async fn run(config: BotConfig) -> anyhow::Result<()> {
    let store = Arc::new(MemoryStore::from_config(&config.memory));

    let provider = GeminiProvider::from_config(&config.model);
    if !provider.has_api_key() {
        tracing::warn!("No Gemini API key; every mention will get the session error reply");
    }
    let responder = Arc::new(Responder::from_config(
        &config,
        Arc::clone(&store),
        Arc::new(provider),
        Arc::new(HttpAttachmentReader::default()),
    ));

    let discord = Arc::new(DiscordChannel::from_config(&config.discord)?);
    discord.init().await?;
    let channel: Arc<dyn Channel> = discord;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let (event_tx, event_rx) = mpsc::channel(EVENT_BUFFER);

    let sweeper = EvictionSweeper::new(Arc::clone(&store), SweeperConfig::from_config(&config.memory))
        .spawn(shutdown_rx.clone());

    let server_config = config.server.clone();
    let server_shutdown = shutdown_rx.clone();
    let server = tokio::spawn(async move {
        if let Err(e) = routes::serve(&server_config, server_shutdown).await {
            tracing::error!(error = %e, "Liveness server failed");
        }
    });

    let handler = Arc::new(EventHandler::new(Arc::clone(&channel), responder));
    let handler_task = tokio::spawn(handler.run(event_rx, shutdown_rx.clone()));

    let listener = tokio::spawn(run_supervised(
        channel,
        event_tx,
        Backoff::from_config(&config.discord),
        shutdown_rx,
    ));

    tracing::info!(
        model = %config.model.model,
        max_history = config.memory.max_history,
        port = config.server.port,
        "Kanade started"
    );

    wait_for_signal().await?;
    tracing::info!("Shutting down");
    let _ = shutdown_tx.send(true);

    for (name, task) in [
        ("listener", listener),
        ("handler", handler_task),
        ("sweeper", sweeper),
        ("server", server),
    ] {
        match tokio::time::timeout(SHUTDOWN_GRACE, task).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => tracing::warn!(task = name, error = %e, "Task panicked"),
            Err(_) => tracing::warn!(task = name, "Task did not stop in time"),
        }
    }

    tracing::info!(active_users = store.active_user_count(), "Kanade stopped");
    Ok(())
}

/// Wait for Ctrl+C, or SIGTERM on unix.
async fn wait_for_signal() -> anyhow::Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate())?;
        let mut sigint = signal(SignalKind::interrupt())?;
        tokio::select! {
            _ = sigterm.recv() => tracing::info!("Received SIGTERM"),
            _ = sigint.recv() => tracing::info!("Received SIGINT"),
        }
    }
    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await?;
    }
    Ok(())
}
