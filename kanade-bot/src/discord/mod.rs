//! Discord channel.
//!
//! Connects via the Discord Gateway WebSocket for mentions and slash commands,
//! and answers through the REST API.

pub mod format;

use crate::commands::command_definitions;
use crate::message::{Attachment, CommandInvocation, GatewayEvent, IncomingMessage, OutgoingMessage};
use crate::traits::{Channel, ChannelError, ChannelResult};
use async_trait::async_trait;
use base64::Engine;
use futures_util::{SinkExt, StreamExt};
use kanade_common::config::DiscordConfig;
use kanade_common::logging::generate_trace_id;
use kanade_common::util::truncate_with_ellipsis;
use reqwest::Client;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch, RwLock};
use tokio::time::Instant;
use tokio_tungstenite::tungstenite::Message;

/// REST API root.
pub const DISCORD_API_BASE: &str = "https://discord.com/api/v10";

/// GUILDS | GUILD_MESSAGES | DIRECT_MESSAGES | MESSAGE_CONTENT
pub const GATEWAY_INTENTS: u64 = (1 << 0) | (1 << 9) | (1 << 12) | (1 << 15);

const INTERACTION_APPLICATION_COMMAND: u64 = 2;
const CALLBACK_CHANNEL_MESSAGE: u64 = 4;
const OPTION_TYPE_USER: u64 = 6;

/// Discord channel using Gateway WebSocket for real-time messaging.
///
/// Clones share the bot and application ids.
#[derive(Clone)]
pub struct DiscordChannel {
    bot_token: String,
    guild_id: Option<String>,
    status_text: String,
    api_base: String,
    client: Client,
    bot_user_id: Arc<RwLock<Option<String>>>,
    application_id: Arc<RwLock<Option<String>>>,
}

impl DiscordChannel {
    /// Create a new Discord channel.
    pub fn new(bot_token: String, guild_id: Option<String>, status_text: String) -> Self {
        let bot_user_id = Self::bot_user_id_from_token(&bot_token);
        Self {
            bot_token,
            guild_id,
            status_text,
            api_base: DISCORD_API_BASE.to_string(),
            client: Client::builder()
                .timeout(Duration::from_secs(30))
                .build()
                .unwrap_or_else(|_| Client::new()),
            bot_user_id: Arc::new(RwLock::new(bot_user_id)),
            application_id: Arc::new(RwLock::new(None)),
        }
    }

    pub fn from_config(config: &DiscordConfig) -> ChannelResult<Self> {
        let token = config
            .token()
            .ok_or_else(|| ChannelError::Auth("DISCORD_BOT_TOKEN missing".into()))?;
        Ok(Self::new(
            token.to_string(),
            config.guild_id.clone(),
            config.status_text.clone(),
        ))
    }

    /// Point REST calls at a different API root.
    pub fn with_api_base(mut self, api_base: &str) -> Self {
        self.api_base = api_base.trim_end_matches('/').to_string();
        self
    }

    /// The bot's own user ID, known from the token or the READY event.
    pub async fn bot_user_id(&self) -> Option<String> {
        self.bot_user_id.read().await.clone()
    }

    /// Application ID from the READY event.
    pub async fn application_id(&self) -> Option<String> {
        self.application_id.read().await.clone()
    }

    /// Extract bot user ID from token.
    fn bot_user_id_from_token(token: &str) -> Option<String> {
        use base64::engine::general_purpose::{STANDARD_NO_PAD, URL_SAFE_NO_PAD};

        let part = token.split('.').next()?.trim_end_matches('=');
        let bytes = STANDARD_NO_PAD
            .decode(part)
            .or_else(|_| URL_SAFE_NO_PAD.decode(part))
            .ok()?;
        String::from_utf8(bytes)
            .ok()
            .filter(|id| !id.is_empty() && id.chars().all(|c| c.is_ascii_digit()))
    }

    fn auth_header(&self) -> String {
        format!("Bot {}", self.bot_token)
    }

    fn identify_payload(&self) -> Value {
        json!({
            "op": 2,
            "d": {
                "token": self.bot_token,
                "intents": GATEWAY_INTENTS,
                "properties": {
                    "os": std::env::consts::OS,
                    "browser": "kanade",
                    "device": "kanade"
                },
                "presence": {
                    "since": null,
                    "activities": [{ "name": self.status_text, "type": 0 }],
                    "status": "online",
                    "afk": false
                }
            }
        })
    }

    async fn check_status(resp: reqwest::Response, what: &str) -> ChannelResult<reqwest::Response> {
        let status = resp.status();
        if status.is_success() {
            return Ok(resp);
        }
        let error = resp.text().await.unwrap_or_default();
        Err(ChannelError::SendFailed(format!(
            "Discord {what} failed ({status}): {}",
            truncate_with_ellipsis(&error, 200)
        )))
    }

    /// Register the slash commands, replacing any previous set.
    ///
    /// Commands are registered on the configured guild when there is one
    /// (visible immediately), otherwise globally.
    pub async fn register_commands(&self, application_id: &str) -> ChannelResult<()> {
        let url = match &self.guild_id {
            Some(guild) => format!(
                "{}/applications/{application_id}/guilds/{guild}/commands",
                self.api_base
            ),
            None => format!("{}/applications/{application_id}/commands", self.api_base),
        };

        let resp = self
            .client
            .put(&url)
            .header("Authorization", self.auth_header())
            .json(&command_definitions())
            .send()
            .await
            .map_err(|e| ChannelError::SendFailed(format!("Command registration error: {e}")))?;
        Self::check_status(resp, "command registration").await?;

        tracing::info!(guild = self.guild_id.as_deref().unwrap_or("global"), "Slash commands registered");
        Ok(())
    }

    /// Capture the ids from READY and register commands in the background so
    /// the gateway loop keeps heartbeating.
    async fn handle_ready(&self, d: &Value) -> Option<tokio::task::JoinHandle<()>> {
        if let Some(id) = d.pointer("/user/id").and_then(Value::as_str) {
            *self.bot_user_id.write().await = Some(id.to_string());
        }
        let application_id = d.pointer("/application/id").and_then(Value::as_str);
        if let Some(id) = application_id {
            *self.application_id.write().await = Some(id.to_string());
        }

        tracing::info!(
            bot_user_id = d.pointer("/user/id").and_then(serde_json::Value::as_str).unwrap_or("unknown"),
            "Discord: ready"
        );

        let Some(id) = application_id.map(String::from) else {
            tracing::warn!("READY without application id; commands not registered");
            return None;
        };
        let channel = self.clone();
        Some(tokio::spawn(async move {
            if let Err(e) = channel.register_commands(&id).await {
                tracing::warn!(error = %e, "Slash command registration failed");
            }
        }))
    }
}

// ============================================================================
// Event parsing
// ============================================================================

/// Convert a `MESSAGE_CREATE` payload into a mention, if it is one.
///
/// Messages from bots (including this one) and messages that do not mention
/// `bot_user_id` are skipped.
pub fn parse_mention(d: &Value, bot_user_id: &str) -> Option<IncomingMessage> {
    let author = d.get("author")?;
    let author_id = author.get("id").and_then(Value::as_str)?;
    if author_id == bot_user_id || author.get("bot").and_then(Value::as_bool).unwrap_or(false) {
        return None;
    }

    let text = d.get("content").and_then(Value::as_str).unwrap_or("");
    let mentioned = d
        .get("mentions")
        .and_then(Value::as_array)
        .is_some_and(|m| {
            m.iter()
                .any(|u| u.get("id").and_then(Value::as_str) == Some(bot_user_id))
        })
        || format::mentions_user(text, bot_user_id);
    if !mentioned {
        return None;
    }

    let attachments = d
        .get("attachments")
        .and_then(Value::as_array)
        .map(|items| items.iter().filter_map(parse_attachment).collect())
        .unwrap_or_default();

    Some(IncomingMessage {
        id: d.get("id").and_then(Value::as_str)?.to_string(),
        channel_id: d.get("channel_id").and_then(Value::as_str)?.to_string(),
        guild_id: d.get("guild_id").and_then(Value::as_str).map(String::from),
        author_id: author_id.to_string(),
        text: format::strip_mentions(text, bot_user_id),
        attachments,
        trace_id: generate_trace_id(),
    })
}

fn parse_attachment(a: &Value) -> Option<Attachment> {
    Some(Attachment {
        url: a.get("url").and_then(Value::as_str)?.to_string(),
        filename: a
            .get("filename")
            .and_then(Value::as_str)
            .unwrap_or("attachment")
            .to_string(),
        content_type: a.get("content_type").and_then(Value::as_str).map(String::from),
        size_bytes: a.get("size").and_then(Value::as_u64),
    })
}

/// Convert an `INTERACTION_CREATE` payload into a command invocation.
///
/// Only application commands are accepted.
pub fn parse_interaction(d: &Value) -> Option<CommandInvocation> {
    if d.get("type").and_then(Value::as_u64) != Some(INTERACTION_APPLICATION_COMMAND) {
        return None;
    }

    let data = d.get("data")?;
    // Guild invocations carry a member; DMs carry a bare user.
    let invoker_id = d
        .pointer("/member/user/id")
        .or_else(|| d.pointer("/user/id"))
        .and_then(Value::as_str)?;
    let invoker_permissions = d
        .pointer("/member/permissions")
        .and_then(Value::as_str)
        .and_then(|p| p.parse().ok())
        .unwrap_or(0);

    let target_user = data
        .get("options")
        .and_then(Value::as_array)
        .and_then(|opts| {
            opts.iter().find(|o| {
                o.get("name").and_then(Value::as_str) == Some("user")
                    && o.get("type").and_then(Value::as_u64) == Some(OPTION_TYPE_USER)
            })
        })
        .and_then(|o| o.get("value"))
        .and_then(Value::as_str)
        .map(String::from);

    Some(CommandInvocation {
        id: d.get("id").and_then(Value::as_str)?.to_string(),
        token: d.get("token").and_then(Value::as_str)?.to_string(),
        name: data.get("name").and_then(Value::as_str)?.to_string(),
        invoker_id: invoker_id.to_string(),
        invoker_permissions,
        target_user,
        trace_id: generate_trace_id(),
    })
}

#[async_trait]
impl Channel for DiscordChannel {
    fn name(&self) -> &'static str {
        "discord"
    }

    async fn init(&self) -> ChannelResult<()> {
        // Verify token by calling auth endpoint
        let resp = self
            .client
            .get(format!("{}/users/@me", self.api_base))
            .header("Authorization", self.auth_header())
            .send()
            .await
            .map_err(|e| ChannelError::Auth(format!("Failed to verify Discord token: {e}")))?;

        if !resp.status().is_success() {
            return Err(ChannelError::Auth("Invalid Discord bot token".into()));
        }

        let me: Value = resp
            .json()
            .await
            .map_err(|e| ChannelError::Auth(format!("Invalid users/@me response: {e}")))?;
        if let Some(id) = me.get("id").and_then(Value::as_str) {
            *self.bot_user_id.write().await = Some(id.to_string());
        }

        tracing::info!("Discord channel initialized");
        Ok(())
    }

    async fn send(&self, message: OutgoingMessage) -> ChannelResult<String> {
        let url = format!("{}/channels/{}/messages", self.api_base, message.channel_id);
        let mut last_message_id = String::new();

        for chunk in format::split_message(&message.text) {
            let mut body = json!({ "content": chunk });

            // Only the first chunk replies to the original message
            if last_message_id.is_empty() {
                if let Some(ref reply_to) = message.reply_to {
                    body["message_reference"] = json!({
                        "message_id": reply_to,
                        "fail_if_not_exists": false
                    });
                }
            }

            let resp = self
                .client
                .post(&url)
                .header("Authorization", self.auth_header())
                .json(&body)
                .send()
                .await
                .map_err(|e| ChannelError::SendFailed(format!("Discord send error: {e}")))?;
            let resp = Self::check_status(resp, "send").await?;

            let msg_data: Value = resp
                .json()
                .await
                .map_err(|e| ChannelError::Internal(format!("Failed to parse response: {e}")))?;

            last_message_id = msg_data
                .get("id")
                .and_then(Value::as_str)
                .unwrap_or("unknown")
                .to_string();
        }

        Ok(last_message_id)
    }

    async fn start_typing(&self, channel_id: &str) -> ChannelResult<()> {
        let resp = self
            .client
            .post(format!("{}/channels/{channel_id}/typing", self.api_base))
            .header("Authorization", self.auth_header())
            .send()
            .await
            .map_err(|e| ChannelError::SendFailed(format!("Typing indicator error: {e}")))?;
        Self::check_status(resp, "typing").await?;
        Ok(())
    }

    async fn respond_to_command(&self, id: &str, token: &str, text: &str) -> ChannelResult<()> {
        let content = truncate_with_ellipsis(text, format::MAX_MESSAGE_LENGTH - 3);
        let body = json!({
            "type": CALLBACK_CHANNEL_MESSAGE,
            "data": { "content": content }
        });

        let resp = self
            .client
            .post(format!("{}/interactions/{id}/{token}/callback", self.api_base))
            .json(&body)
            .send()
            .await
            .map_err(|e| ChannelError::SendFailed(format!("Interaction response error: {e}")))?;
        Self::check_status(resp, "interaction response").await?;
        Ok(())
    }

    async fn listen(&self, tx: mpsc::Sender<GatewayEvent>) -> ChannelResult<()> {
        // Get Gateway URL
        let gw_resp: Value = self
            .client
            .get(format!("{}/gateway/bot", self.api_base))
            .header("Authorization", self.auth_header())
            .send()
            .await
            .map_err(|e| ChannelError::Connection(format!("Failed to get gateway: {e}")))?
            .json()
            .await
            .map_err(|e| ChannelError::Connection(format!("Invalid gateway response: {e}")))?;

        let gw_url = gw_resp
            .get("url")
            .and_then(Value::as_str)
            .unwrap_or("wss://gateway.discord.gg");

        let ws_url = format!("{gw_url}/?v=10&encoding=json");
        tracing::info!("Discord: connecting to gateway...");

        let (ws_stream, _) = tokio_tungstenite::connect_async(&ws_url)
            .await
            .map_err(|e| ChannelError::Connection(format!("WebSocket connection failed: {e}")))?;

        let (mut write, mut read) = ws_stream.split();

        // Read Hello (opcode 10)
        let hello = read
            .next()
            .await
            .ok_or_else(|| ChannelError::Connection("No hello from gateway".into()))?
            .map_err(|e| ChannelError::Connection(format!("WebSocket error: {e}")))?;

        let hello_data: Value = serde_json::from_str(&hello.to_string())
            .map_err(|e| ChannelError::Connection(format!("Invalid hello: {e}")))?;

        let heartbeat_interval = hello_data
            .pointer("/d/heartbeat_interval")
            .and_then(Value::as_u64)
            .unwrap_or(41250);

        // Send Identify (opcode 2)
        write
            .send(Message::Text(self.identify_payload().to_string()))
            .await
            .map_err(|e| ChannelError::Connection(format!("Failed to identify: {e}")))?;

        tracing::info!(heartbeat_ms = heartbeat_interval, "Discord: connected and identified");

        let mut heartbeat = tokio::time::interval(Duration::from_millis(heartbeat_interval));
        heartbeat.tick().await;
        let mut sequence: Option<u64> = None;

        loop {
            tokio::select! {
                _ = heartbeat.tick() => {
                    let hb = json!({ "op": 1, "d": sequence });
                    if write.send(Message::Text(hb.to_string())).await.is_err() {
                        break Err(ChannelError::Connection("Heartbeat send failed".into()));
                    }
                }
                msg = read.next() => {
                    let msg = match msg {
                        Some(Ok(Message::Text(t))) => t,
                        Some(Ok(Message::Close(frame))) => {
                            break Err(ChannelError::Connection(format!("Gateway closed: {frame:?}")));
                        }
                        None => break Err(ChannelError::Connection("Gateway stream ended".into())),
                        Some(Err(e)) => break Err(ChannelError::Connection(format!("WebSocket error: {e}"))),
                        Some(Ok(_)) => continue,
                    };

                    let Ok(event) = serde_json::from_str::<Value>(&msg) else {
                        continue;
                    };

                    if let Some(s) = event.get("s").and_then(Value::as_u64) {
                        sequence = Some(s);
                    }

                    match event.get("op").and_then(Value::as_u64) {
                        Some(0) => {}
                        Some(1) => {
                            let hb = json!({ "op": 1, "d": sequence });
                            if write.send(Message::Text(hb.to_string())).await.is_err() {
                                break Err(ChannelError::Connection("Heartbeat send failed".into()));
                            }
                            continue;
                        }
                        Some(7) => break Err(ChannelError::Connection("Gateway requested reconnect".into())),
                        Some(9) => break Err(ChannelError::Connection("Gateway invalidated session".into())),
                        _ => continue,
                    }

                    let Some(d) = event.get("d") else {
                        continue;
                    };

                    let gateway_event = match event.get("t").and_then(Value::as_str).unwrap_or("") {
                        "READY" => {
                            let _ = self.handle_ready(d).await;
                            continue;
                        }
                        "MESSAGE_CREATE" => {
                            let Some(bot_id) = self.bot_user_id().await else {
                                continue;
                            };
                            match parse_mention(d, &bot_id) {
                                Some(m) => GatewayEvent::Mention(m),
                                None => continue,
                            }
                        }
                        "INTERACTION_CREATE" => match parse_interaction(d) {
                            Some(c) => GatewayEvent::Command(c),
                            None => continue,
                        },
                        _ => continue,
                    };

                    if tx.send(gateway_event).await.is_err() {
                        break Ok(());
                    }
                }
            }
        }
    }

    async fn shutdown(&self) -> ChannelResult<()> {
        tracing::info!("Discord channel shutdown");
        Ok(())
    }
}

// ============================================================================
// Supervision
// ============================================================================

/// Exponential reconnect delay.
#[derive(Debug, Clone)]
pub struct Backoff {
    initial: Duration,
    max: Duration,
    current: Duration,
}

impl Backoff {
    pub fn new(initial: Duration, max: Duration) -> Self {
        let initial = initial.min(max);
        Self {
            initial,
            max,
            current: initial,
        }
    }

    pub fn from_config(config: &DiscordConfig) -> Self {
        Self::new(
            Duration::from_secs(config.initial_backoff_secs.max(1)),
            Duration::from_secs(config.max_backoff_secs.max(1)),
        )
    }

    /// Delay before the next attempt; doubles up to the maximum.
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.current;
        self.current = (self.current * 2).min(self.max);
        delay
    }

    pub fn reset(&mut self) {
        self.current = self.initial;
    }

    pub fn max(&self) -> Duration {
        self.max
    }
}

/// Keep a channel listening until `shutdown` fires, reconnecting with backoff.
///
/// A connection that stayed up longer than the maximum delay resets the
/// backoff. Returns when shutdown is signalled or the event receiver is gone.
pub async fn run_supervised(
    channel: Arc<dyn Channel>,
    tx: mpsc::Sender<GatewayEvent>,
    mut backoff: Backoff,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        if *shutdown.borrow() || tx.is_closed() {
            break;
        }

        let started = Instant::now();
        tokio::select! {
            biased;

            _ = shutdown.changed() => break,
            result = channel.listen(tx.clone()) => {
                match result {
                    Ok(()) if tx.is_closed() => break,
                    Ok(()) => tracing::warn!(channel = channel.name(), "Listener returned; reconnecting"),
                    Err(e) => tracing::warn!(channel = channel.name(), error = %e, "Listener failed"),
                }
            }
        }

        if started.elapsed() > backoff.max() {
            backoff.reset();
        }
        let delay = backoff.next_delay();
        tracing::info!(channel = channel.name(), delay_secs = delay.as_secs(), "Reconnecting after delay");

        tokio::select! {
            biased;

            _ = shutdown.changed() => break,
            _ = tokio::time::sleep(delay) => {}
        }
    }

    if let Err(e) = channel.shutdown().await {
        tracing::warn!(error = %e, "Channel shutdown failed");
    }
}
