//! Gateway event dispatch.

use crate::commands::CommandHandler;
use crate::message::{CommandInvocation, GatewayEvent, IncomingMessage, OutgoingMessage};
use crate::responder::Responder;
use crate::traits::Channel;
use kanade_common::channel_span;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tracing::Instrument;

/// Discord drops the typing indicator after ten seconds.
const TYPING_REFRESH: Duration = Duration::from_secs(8);

/// Routes gateway events to the responder or the command handler and sends
/// the results back through the channel.
pub struct EventHandler {
    channel: Arc<dyn Channel>,
    responder: Arc<Responder>,
    commands: CommandHandler,
}

impl EventHandler {
    pub fn new(channel: Arc<dyn Channel>, responder: Arc<Responder>) -> Self {
        let commands = CommandHandler::new(Arc::clone(responder.store()));
        Self {
            channel,
            responder,
            commands,
        }
    }

    /// Handle one event to completion.
    pub async fn handle(&self, event: GatewayEvent) {
        match event {
            GatewayEvent::Mention(message) => {
                let span = channel_span!(self.channel.name(), message.trace_id, message.author_id);
                self.handle_mention(message).instrument(span).await;
            }
            GatewayEvent::Command(invocation) => {
                let span = channel_span!(
                    self.channel.name(),
                    invocation.trace_id,
                    invocation.invoker_id,
                    command = %invocation.name
                );
                self.handle_command(invocation).instrument(span).await;
            }
        }
    }

    async fn handle_mention(&self, message: IncomingMessage) {
        tracing::info!(
            chat_id = %message.channel_id,
            guild = message.guild_id.as_deref().unwrap_or("dm"),
            attachments = message.attachments.len(),
            "Mention received"
        );

        let typing = self.keep_typing(message.channel_id.clone());
        let reply = self
            .responder
            .respond(&message.author_id, &message.text, &message.attachments)
            .await;
        typing.abort();

        let outgoing = OutgoingMessage {
            channel_id: message.channel_id,
            reply_to: Some(message.id),
            text: reply,
        };
        if let Err(e) = self.channel.send(outgoing).await {
            tracing::warn!(error = %e, "Failed to send reply");
        }
    }

    async fn handle_command(&self, invocation: CommandInvocation) {
        let text = self.commands.handle(&invocation).await;
        if let Err(e) = self
            .channel
            .respond_to_command(&invocation.id, &invocation.token, &text)
            .await
        {
            tracing::warn!(error = %e, "Failed to answer command");
        }
    }

    /// Show the typing indicator until the returned task is aborted.
    fn keep_typing(&self, channel_id: String) -> tokio::task::JoinHandle<()> {
        let channel = Arc::clone(&self.channel);
        tokio::spawn(async move {
            loop {
                if let Err(e) = channel.start_typing(&channel_id).await {
                    tracing::debug!(error = %e, "Typing indicator failed");
                }
                tokio::time::sleep(TYPING_REFRESH).await;
            }
        })
    }

    /// Handle events as they arrive, each on its own task, until `shutdown`
    /// fires or the sender side closes.
    pub async fn run(
        self: Arc<Self>,
        mut events: mpsc::Receiver<GatewayEvent>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        loop {
            tokio::select! {
                biased;

                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
                event = events.recv() => {
                    let Some(event) = event else {
                        break;
                    };
                    let handler = Arc::clone(&self);
                    tokio::spawn(async move { handler.handle(event).await });
                }
            }
        }

        tracing::info!("Event handler stopped");
    }
}
