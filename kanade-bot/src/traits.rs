//! Channel traits.

use crate::message::{Attachment, GatewayEvent, OutgoingMessage};
use async_trait::async_trait;

/// Result type for channel operations.
pub type ChannelResult<T> = Result<T, ChannelError>;

/// Channel error type.
#[derive(Debug, thiserror::Error)]
pub enum ChannelError {
    #[error("Authentication failed: {0}")]
    Auth(String),

    #[error("Connection failed: {0}")]
    Connection(String),

    #[error("Message send failed: {0}")]
    SendFailed(String),

    #[error("Invalid message: {0}")]
    InvalidMessage(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

/// Messaging platform adapter.
#[async_trait]
pub trait Channel: Send + Sync {
    /// Get the channel name.
    fn name(&self) -> &'static str;

    /// Verify credentials.
    async fn init(&self) -> ChannelResult<()>;

    /// Send a reply; returns the ID of the last message sent.
    async fn send(&self, message: OutgoingMessage) -> ChannelResult<String>;

    /// Show the typing indicator in a channel.
    async fn start_typing(&self, channel_id: &str) -> ChannelResult<()>;

    /// Answer a slash-command invocation.
    async fn respond_to_command(&self, id: &str, token: &str, text: &str) -> ChannelResult<()>;

    /// Connect and deliver events until the connection ends.
    async fn listen(&self, tx: tokio::sync::mpsc::Sender<GatewayEvent>) -> ChannelResult<()>;

    /// Shutdown the channel gracefully.
    async fn shutdown(&self) -> ChannelResult<()>;
}

/// Reads attachment payloads into memory.
#[async_trait]
pub trait AttachmentReader: Send + Sync {
    async fn read(&self, attachment: &Attachment) -> ChannelResult<Vec<u8>>;
}
