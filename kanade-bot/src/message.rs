//! Gateway event types.

/// A message that mentioned the bot.
#[derive(Debug, Clone)]
pub struct IncomingMessage {
    /// Message ID
    pub id: String,
    /// Channel the message was posted in
    pub channel_id: String,
    /// Guild, absent for direct messages
    pub guild_id: Option<String>,
    /// Author user ID
    pub author_id: String,
    /// Message text with the bot's own mention removed
    pub text: String,
    /// Files attached to the message
    pub attachments: Vec<Attachment>,
    /// Trace ID assigned on receipt
    pub trace_id: String,
}

/// A file attached to an inbound message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Attachment {
    /// Download URL
    pub url: String,
    /// Filename
    pub filename: String,
    /// Declared MIME type, if Discord reported one
    pub content_type: Option<String>,
    /// Size in bytes
    pub size_bytes: Option<u64>,
}

impl Attachment {
    /// True when the declared content type is an image type.
    pub fn is_image(&self) -> bool {
        self.content_type
            .as_deref()
            .is_some_and(|ct| ct.trim().to_ascii_lowercase().starts_with("image/"))
    }

    /// Content type without parameters (`image/png; charset=...` -> `image/png`).
    pub fn mime_type(&self) -> Option<String> {
        self.content_type
            .as_deref()
            .and_then(|ct| ct.split(';').next())
            .map(|ct| ct.trim().to_ascii_lowercase())
            .filter(|ct| !ct.is_empty())
    }
}

/// A slash-command invocation.
#[derive(Debug, Clone)]
pub struct CommandInvocation {
    /// Interaction ID
    pub id: String,
    /// Interaction token used for the response
    pub token: String,
    /// Command name without the slash
    pub name: String,
    /// Invoking user ID
    pub invoker_id: String,
    /// Invoker's permission bitfield in the guild (0 in DMs)
    pub invoker_permissions: u64,
    /// `user` option, if supplied
    pub target_user: Option<String>,
    /// Trace ID assigned on receipt
    pub trace_id: String,
}

/// Events surfaced by the gateway listener.
#[derive(Debug, Clone)]
pub enum GatewayEvent {
    Mention(IncomingMessage),
    Command(CommandInvocation),
}

/// Outgoing reply.
#[derive(Debug, Clone)]
pub struct OutgoingMessage {
    /// Target channel ID
    pub channel_id: String,
    /// Message being replied to
    pub reply_to: Option<String>,
    /// Text body
    pub text: String,
}
