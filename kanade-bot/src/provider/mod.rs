//! Generative model abstraction.
//!
//! The responder talks to the model through [`ModelProvider`] so the Gemini
//! client can be swapped for a scripted one in tests.

mod gemini;

pub use gemini::GeminiProvider;

use async_trait::async_trait;
use kanade_common::config::PersonaConfig;
use kanade_memory::Turn;

// ============================================================================
// Provider Trait
// ============================================================================

/// A remote generative model.
#[async_trait]
pub trait ModelProvider: Send + Sync {
    /// Get the provider name.
    fn name(&self) -> &str;

    /// Seed turns for a new conversation.
    ///
    /// Fails when the provider cannot serve requests at all (for example when
    /// no API key is configured), which keeps the user from getting a session.
    fn priming(&self, persona: &PersonaConfig) -> Result<Vec<Turn>, ProviderError>;

    /// Generate a reply to `contents` (priming, history and the new request).
    async fn generate(&self, contents: &[Turn]) -> Result<String, ProviderError>;
}

/// Persona turns in the order every conversation starts with.
pub fn persona_turns(persona: &PersonaConfig) -> Vec<Turn> {
    vec![
        Turn::user(persona.system_prompt.clone()),
        Turn::assistant(persona.acknowledgment.clone()),
    ]
}

/// Error from a provider.
#[derive(Debug, Clone)]
pub struct ProviderError {
    pub provider: String,
    pub model: String,
    pub message: String,
    pub status_code: Option<u16>,
}

impl ProviderError {
    pub fn new(provider: impl Into<String>, model: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            provider: provider.into(),
            model: model.into(),
            message: message.into(),
            status_code: None,
        }
    }

    pub fn with_status(mut self, status: u16) -> Self {
        self.status_code = Some(status);
        self
    }
}

impl std::fmt::Display for ProviderError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}:{}] {}", self.provider, self.model, self.message)
    }
}

impl std::error::Error for ProviderError {}
