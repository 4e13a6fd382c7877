//! Google Gemini provider.
//!
//! Calls the `generateContent` endpoint with the whole conversation on every
//! request. Images travel as base64 `inline_data` parts.

use super::{persona_turns, ModelProvider, ProviderError};
use async_trait::async_trait;
use base64::Engine;
use kanade_common::config::{ModelConfig, PersonaConfig};
use kanade_common::util::{sanitize_for_log, truncate_with_ellipsis};
use kanade_memory::{Part as TurnPart, Role, Turn};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};

const PROVIDER_NAME: &str = "gemini";

/// Gemini `generateContent` client.
pub struct GeminiProvider {
    api_key: Option<String>,
    model: String,
    base_url: String,
    temperature: f64,
    max_output_tokens: i64,
    client: Client,
}

// ══════════════════════════════════════════════════════════════════════════════
// API REQUEST/RESPONSE TYPES
// ══════════════════════════════════════════════════════════════════════════════

#[derive(Debug, Serialize)]
struct GenerateContentRequest {
    contents: Vec<Content>,
    #[serde(skip_serializing_if = "Option::is_none")]
    system_instruction: Option<Content>,
    #[serde(rename = "generationConfig")]
    generation_config: GenerationConfig,
}

#[derive(Debug, Serialize)]
struct Content {
    #[serde(skip_serializing_if = "Option::is_none")]
    role: Option<&'static str>,
    parts: Vec<Part>,
}

#[derive(Debug, Serialize)]
#[serde(untagged)]
enum Part {
    Text { text: String },
    InlineData { inline_data: InlineData },
}

#[derive(Debug, Serialize)]
struct InlineData {
    mime_type: String,
    data: String,
}

#[derive(Debug, Serialize)]
struct GenerationConfig {
    temperature: f64,
    #[serde(rename = "maxOutputTokens")]
    max_output_tokens: i64,
}

#[derive(Debug, Deserialize)]
struct GenerateContentResponse {
    candidates: Option<Vec<Candidate>>,
    error: Option<ApiError>,
}

#[derive(Debug, Deserialize)]
struct Candidate {
    content: Option<CandidateContent>,
    #[serde(rename = "finishReason")]
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct CandidateContent {
    #[serde(default)]
    parts: Vec<ResponsePart>,
}

#[derive(Debug, Deserialize)]
struct ResponsePart {
    text: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ApiError {
    message: String,
}

impl GeminiProvider {
    /// Create a provider for `model` with default generation settings.
    pub fn new(api_key: Option<&str>, model: &str) -> Self {
        let config = ModelConfig {
            api_key: api_key.map(String::from),
            model: model.to_string(),
            ..ModelConfig::default()
        };
        Self::from_config(&config)
    }

    pub fn from_config(config: &ModelConfig) -> Self {
        Self {
            api_key: config.api_key.clone().filter(|k| !k.trim().is_empty()),
            model: config.model.clone(),
            base_url: config.base_url.trim_end_matches('/').to_string(),
            temperature: config.temperature,
            max_output_tokens: config.max_output_tokens,
            client: Client::builder()
                .timeout(Duration::from_secs(config.timeout_secs.max(1)))
                .connect_timeout(Duration::from_secs(10))
                .build()
                .unwrap_or_else(|_| Client::new()),
        }
    }

    /// Point the provider at a different API host.
    pub fn with_base_url(mut self, base_url: &str) -> Self {
        self.base_url = base_url.trim_end_matches('/').to_string();
        self
    }

    pub fn has_api_key(&self) -> bool {
        self.api_key.is_some()
    }

    fn error(&self, message: impl Into<String>) -> ProviderError {
        ProviderError::new(PROVIDER_NAME, self.model.clone(), message)
    }

    fn model_path(&self) -> String {
        if self.model.starts_with("models/") {
            self.model.clone()
        } else {
            format!("models/{}", self.model)
        }
    }

    fn build_request(&self, turns: &[Turn]) -> GenerateContentRequest {
        let mut system_parts = Vec::new();
        let mut contents = Vec::new();

        for turn in turns {
            let parts = turn.parts.iter().map(convert_part).collect::<Vec<_>>();
            match turn.role {
                Role::System => system_parts.extend(parts),
                Role::User => contents.push(Content {
                    role: Some("user"),
                    parts,
                }),
                Role::Assistant => contents.push(Content {
                    role: Some("model"),
                    parts,
                }),
            }
        }

        GenerateContentRequest {
            contents,
            system_instruction: (!system_parts.is_empty()).then(|| Content {
                role: None,
                parts: system_parts,
            }),
            generation_config: GenerationConfig {
                temperature: self.temperature,
                max_output_tokens: self.max_output_tokens,
            },
        }
    }
}

fn convert_part(part: &TurnPart) -> Part {
    match part {
        TurnPart::Text(text) => Part::Text { text: text.clone() },
        TurnPart::Image { mime_type, data } => Part::InlineData {
            inline_data: InlineData {
                mime_type: mime_type.clone(),
                data: base64::engine::general_purpose::STANDARD.encode(data),
            },
        },
    }
}

#[async_trait]
impl ModelProvider for GeminiProvider {
    fn name(&self) -> &str {
        PROVIDER_NAME
    }

    fn priming(&self, persona: &PersonaConfig) -> Result<Vec<Turn>, ProviderError> {
        if self.api_key.is_none() {
            return Err(self.error("Gemini API key not found. Set GEMINI_API_KEY."));
        }
        Ok(persona_turns(persona))
    }

    async fn generate(&self, contents: &[Turn]) -> Result<String, ProviderError> {
        let start = Instant::now();

        let api_key = self
            .api_key
            .as_ref()
            .ok_or_else(|| self.error("Gemini API key not found. Set GEMINI_API_KEY."))?;

        let request = self.build_request(contents);
        let url = format!(
            "{}/v1beta/{}:generateContent?key={api_key}",
            self.base_url,
            self.model_path()
        );

        let response = self
            .client
            .post(&url)
            .json(&request)
            .send()
            .await
            .map_err(|e| {
                let kind = if e.is_timeout() { "Request timed out" } else { "Request failed" };
                self.error(format!("{kind}: {}", e.without_url()))
            })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(self
                .error(format!(
                    "API error ({}): {}",
                    status.as_u16(),
                    truncate_with_ellipsis(&sanitize_for_log(&body), 300)
                ))
                .with_status(status.as_u16()));
        }

        let result: GenerateContentResponse = response
            .json()
            .await
            .map_err(|e| self.error(format!("Failed to parse response: {}", e.without_url())))?;

        if let Some(err) = result.error {
            return Err(self.error(format!("API error: {}", err.message)));
        }

        let candidate = result
            .candidates
            .and_then(|c| c.into_iter().next())
            .ok_or_else(|| self.error("No response from Gemini"))?;

        let text = candidate
            .content
            .map(|c| {
                c.parts
                    .into_iter()
                    .filter_map(|p| p.text)
                    .collect::<Vec<_>>()
                    .join("")
            })
            .unwrap_or_default();

        tracing::debug!(
            model = %self.model,
            turns = contents.len(),
            finish_reason = candidate.finish_reason.as_deref().unwrap_or("unknown"),
            latency_ms = start.elapsed().as_millis() as u64,
            "Gemini response received"
        );

        Ok(text)
    }
}
