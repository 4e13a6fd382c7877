//! Turns a mention into a reply.
//!
//! One exchange holds the user's [`UserEntry`](kanade_memory::UserEntry) from
//! activity recording until the reply is stored, so a user's messages are
//! answered one at a time while other users proceed.

use crate::message::Attachment;
use crate::provider::ModelProvider;
use crate::traits::AttachmentReader;
use chrono::Utc;
use kanade_common::config::{BotConfig, PersonaConfig};
use kanade_common::util::truncate_with_ellipsis;
use kanade_memory::{MemoryStore, Turn};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Reply when the user's session could not be created.
pub const SESSION_ERROR_REPLY: &str = "Error. Try again.";

/// Reply when the model call failed, timed out or came back empty.
pub const REMOTE_ERROR_REPLY: &str = "System issue. Please repeat.";

/// Answers mentions using the conversation store and a model provider.
pub struct Responder {
    store: Arc<MemoryStore>,
    provider: Arc<dyn ModelProvider>,
    attachments: Arc<dyn AttachmentReader>,
    persona: PersonaConfig,
    timeout: Duration,
}

impl Responder {
    pub fn new(
        store: Arc<MemoryStore>,
        provider: Arc<dyn ModelProvider>,
        attachments: Arc<dyn AttachmentReader>,
        persona: PersonaConfig,
        timeout: Duration,
    ) -> Self {
        Self {
            store,
            provider,
            attachments,
            persona,
            timeout,
        }
    }

    pub fn from_config(
        config: &BotConfig,
        store: Arc<MemoryStore>,
        provider: Arc<dyn ModelProvider>,
        attachments: Arc<dyn AttachmentReader>,
    ) -> Self {
        Self::new(
            store,
            provider,
            attachments,
            config.persona.clone(),
            Duration::from_secs(config.model.timeout_secs.max(1)),
        )
    }

    pub fn store(&self) -> &Arc<MemoryStore> {
        &self.store
    }

    /// Trimmed request text, or the greeting when nothing is left.
    pub fn normalize_text(&self, text: &str) -> String {
        let trimmed = text.trim();
        if trimmed.is_empty() {
            self.persona.greeting.clone()
        } else {
            trimmed.to_string()
        }
    }

    /// Produce the reply for one mention.
    ///
    /// `text` should already have the bot's own mention removed. Failures are
    /// turned into one of the fixed fallback replies and never returned.
    pub async fn respond(&self, user_id: &str, text: &str, attachments: &[Attachment]) -> String {
        let start = Instant::now();
        let text = self.normalize_text(text);

        let mut entry = self.store.entry(user_id).await;
        let count = entry.record_activity(Utc::now());

        let created = entry
            .ensure_conversation(|| self.provider.priming(&self.persona))
            .map(|_| ());
        if let Err(e) = created {
            tracing::warn!(user_id = %user_id, error = %e, "Session creation failed");
            return SESSION_ERROR_REPLY.to_string();
        }

        let request = self.build_request(text, attachments).await;
        let Some(contents) = entry.conversation().map(|c| c.contents_with(&request)) else {
            return SESSION_ERROR_REPLY.to_string();
        };

        let reply = match tokio::time::timeout(self.timeout, self.provider.generate(&contents)).await {
            Ok(Ok(reply)) if !reply.trim().is_empty() => reply.trim().to_string(),
            Ok(Ok(_)) => {
                tracing::warn!(user_id = %user_id, "Model returned an empty reply");
                return REMOTE_ERROR_REPLY.to_string();
            }
            Ok(Err(e)) => {
                tracing::warn!(user_id = %user_id, error = %e, "Model call failed");
                return REMOTE_ERROR_REPLY.to_string();
            }
            Err(_) => {
                tracing::warn!(
                    user_id = %user_id,
                    timeout_secs = self.timeout.as_secs(),
                    "Model call timed out"
                );
                return REMOTE_ERROR_REPLY.to_string();
            }
        };

        if let Err(e) = entry.append_exchange(request, Turn::assistant(reply.clone())) {
            tracing::warn!(user_id = %user_id, error = %e, "Reply not stored");
        }

        tracing::info!(
            user_id = %user_id,
            message_count = count,
            history_turns = entry.conversation().map_or(0, |c| c.turn_count()),
            latency_ms = start.elapsed().as_millis() as u64,
            reply = %truncate_with_ellipsis(&reply, 80),
            "Reply generated"
        );

        reply
    }

    /// Request turn with every readable image attachment.
    async fn build_request(&self, text: String, attachments: &[Attachment]) -> Turn {
        let mut request = Turn::user(text);

        for attachment in attachments {
            let Some(mime_type) = attachment.mime_type().filter(|_| attachment.is_image()) else {
                tracing::debug!(filename = %attachment.filename, "Ignoring non-image attachment");
                continue;
            };
            match self.attachments.read(attachment).await {
                Ok(bytes) => request = request.with_image(mime_type, bytes),
                Err(e) => {
                    tracing::warn!(filename = %attachment.filename, error = %e, "Skipping attachment");
                }
            }
        }

        request
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::{persona_turns, ProviderError};
    use crate::traits::{ChannelError, ChannelResult};
    use async_trait::async_trait;
    use kanade_memory::Part;
    use std::sync::Mutex;

    /// Replies with canned results and records what it was sent.
    struct ScriptedProvider {
        replies: Mutex<Vec<Result<String, ProviderError>>>,
        seen: Mutex<Vec<Vec<Turn>>>,
        can_prime: bool,
        delay: Option<Duration>,
    }

    impl ScriptedProvider {
        fn new(replies: Vec<Result<String, ProviderError>>) -> Self {
            Self {
                replies: Mutex::new(replies),
                seen: Mutex::new(Vec::new()),
                can_prime: true,
                delay: None,
            }
        }
    }

    #[async_trait]
    impl ModelProvider for ScriptedProvider {
        fn name(&self) -> &str {
            "scripted"
        }

        fn priming(&self, persona: &PersonaConfig) -> Result<Vec<Turn>, ProviderError> {
            if self.can_prime {
                Ok(persona_turns(persona))
            } else {
                Err(ProviderError::new("scripted", "none", "no key"))
            }
        }

        async fn generate(&self, contents: &[Turn]) -> Result<String, ProviderError> {
            self.seen.lock().unwrap().push(contents.to_vec());
            if let Some(delay) = self.delay {
                tokio::time::sleep(delay).await;
            }
            let mut replies = self.replies.lock().unwrap();
            if replies.is_empty() {
                Ok("ok".into())
            } else {
                replies.remove(0)
            }
        }
    }

    struct FakeReader;

    #[async_trait]
    impl AttachmentReader for FakeReader {
        async fn read(&self, attachment: &Attachment) -> ChannelResult<Vec<u8>> {
            if attachment.filename.starts_with("broken") {
                Err(ChannelError::Connection("reset".into()))
            } else {
                Ok(attachment.filename.as_bytes().to_vec())
            }
        }
    }

    fn responder(provider: ScriptedProvider) -> (Responder, Arc<ScriptedProvider>) {
        let provider = Arc::new(provider);
        let responder = Responder::new(
            Arc::new(MemoryStore::new(20)),
            Arc::clone(&provider) as Arc<dyn ModelProvider>,
            Arc::new(FakeReader),
            PersonaConfig::default(),
            Duration::from_secs(5),
        );
        (responder, provider)
    }

    fn attachment(filename: &str, content_type: &str) -> Attachment {
        Attachment {
            url: format!("https://cdn.example/{filename}"),
            filename: filename.into(),
            content_type: Some(content_type.into()),
            size_bytes: None,
        }
    }

    #[tokio::test]
    async fn test_reply_is_trimmed_and_stored() {
        let (responder, _) = responder(ScriptedProvider::new(vec![Ok("  Hello.\n".into())]));

        let reply = responder.respond("u1", "hi", &[]).await;
        assert_eq!(reply, "Hello.");

        let history = responder.store().history("u1").await.unwrap();
        assert_eq!(history.len(), 4);
        assert_eq!(history[2], Turn::user("hi"));
        assert_eq!(history[3], Turn::assistant("Hello."));
        assert_eq!(responder.store().message_count("u1"), Some(1));
    }

    #[tokio::test]
    async fn test_empty_text_becomes_greeting() {
        let (responder, provider) = responder(ScriptedProvider::new(vec![]));

        responder.respond("u1", "   ", &[]).await;

        let seen = provider.seen.lock().unwrap();
        assert_eq!(seen[0].last().unwrap().text(), "Hey");
    }

    #[tokio::test]
    async fn test_model_sees_priming_history_and_request() {
        let (responder, provider) = responder(ScriptedProvider::new(vec![]));

        responder.respond("u1", "first", &[]).await;
        responder.respond("u1", "second", &[]).await;

        let seen = provider.seen.lock().unwrap();
        let texts: Vec<String> = seen[1].iter().map(Turn::text).collect();
        assert_eq!(texts.len(), 5);
        assert_eq!(texts[1], "Understood.");
        assert_eq!(&texts[2..], ["first", "ok", "second"]);
    }

    #[tokio::test]
    async fn test_remote_failure_leaves_history_and_counts_message() {
        let (responder, _) = responder(ScriptedProvider::new(vec![
            Ok("one".into()),
            Err(ProviderError::new("scripted", "m", "boom")),
        ]));

        responder.respond("u1", "a", &[]).await;
        let reply = responder.respond("u1", "b", &[]).await;

        assert_eq!(reply, REMOTE_ERROR_REPLY);
        assert_eq!(responder.store().history("u1").await.unwrap().len(), 4);
        assert_eq!(responder.store().message_count("u1"), Some(2));
    }

    #[tokio::test]
    async fn test_blank_reply_is_a_remote_failure() {
        let (responder, _) = responder(ScriptedProvider::new(vec![Ok(" \n ".into())]));

        assert_eq!(responder.respond("u1", "a", &[]).await, REMOTE_ERROR_REPLY);
        assert_eq!(responder.store().history("u1").await.unwrap().len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_is_a_remote_failure() {
        let mut provider = ScriptedProvider::new(vec![Ok("late".into())]);
        provider.delay = Some(Duration::from_secs(60));
        let (responder, _) = responder(provider);

        assert_eq!(responder.respond("u1", "a", &[]).await, REMOTE_ERROR_REPLY);
        assert_eq!(responder.store().history("u1").await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_session_creation_failure() {
        let mut provider = ScriptedProvider::new(vec![]);
        provider.can_prime = false;
        let (responder, provider) = responder(provider);

        assert_eq!(responder.respond("u1", "a", &[]).await, SESSION_ERROR_REPLY);
        assert!(provider.seen.lock().unwrap().is_empty());
        assert!(responder.store().history("u1").await.is_none());
        assert_eq!(responder.store().message_count("u1"), Some(1));
    }

    #[tokio::test]
    async fn test_only_readable_images_are_attached() {
        let (responder, provider) = responder(ScriptedProvider::new(vec![]));
        let attachments = vec![
            attachment("cat.png", "image/png"),
            attachment("notes.pdf", "application/pdf"),
            attachment("broken.jpg", "image/jpeg"),
            attachment("dog.webp", "image/webp; x=1"),
        ];

        responder.respond("u1", "look", &attachments).await;

        let seen = provider.seen.lock().unwrap();
        let request = seen[0].last().unwrap();
        assert_eq!(request.image_count(), 2);
        let mimes: Vec<&str> = request
            .parts
            .iter()
            .filter_map(|p| match p {
                Part::Image { mime_type, .. } => Some(mime_type.as_str()),
                Part::Text(_) => None,
            })
            .collect();
        assert_eq!(mimes, ["image/png", "image/webp"]);
    }
}
