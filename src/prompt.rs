//! Prompt preparation for background generation

use crate::config::OpenRouterConfig;
use crate::error::{FuseError, Result};
use crate::retry::ensure_success;
use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};

/// Quality keywords appended to user prompts
pub const DEFAULT_PROMPT_SUFFIX: &str =
    "masterpiece, best quality, ultra-detailed, photorealistic, 8k, sharp focus";

const OPENROUTER_SERVICE: &str = "OpenRouter";

const EXPANSION_INSTRUCTIONS: &str = "You write prompts for a text-to-image model. \
The image is a background plate that a photographed subject will later be composited onto. \
Rewrite the user's idea as one vivid English sentence describing only the scene: setting, \
lighting, time of day, lens and mood. Do not describe any person or foreground subject. \
Answer with the prompt only.";

/// Append the quality suffix to a trimmed prompt
pub fn enhance_prompt(prompt: &str, suffix: &str) -> String {
    let prompt = prompt.trim().trim_end_matches(',').trim_end();
    if suffix.trim().is_empty() {
        prompt.to_string()
    } else {
        format!("{}, {}", prompt, suffix.trim())
    }
}

/// Rewrites a short user idea into a detailed generation prompt
#[async_trait]
pub trait PromptExpander: Send + Sync {
    async fn expand(&self, prompt: &str) -> Result<String>;

    fn name(&self) -> &'static str;
}

/// OpenRouter chat completions
#[derive(Debug, Clone)]
pub struct OpenRouterExpander {
    client: Client,
    config: OpenRouterConfig,
}

#[derive(Debug, Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage<'a>>,
    temperature: f32,
    max_tokens: u32,
}

#[derive(Debug, Serialize)]
struct ChatMessage<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    #[serde(default)]
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatChoiceMessage,
}

#[derive(Debug, Deserialize)]
struct ChatChoiceMessage {
    #[serde(default)]
    content: Option<String>,
}

impl OpenRouterExpander {
    pub fn new(client: Client, config: OpenRouterConfig) -> Self {
        Self { client, config }
    }
}

#[async_trait]
impl PromptExpander for OpenRouterExpander {
    async fn expand(&self, prompt: &str) -> Result<String> {
        let url = format!(
            "{}/api/v1/chat/completions",
            self.config.base_url.trim_end_matches('/')
        );
        let request = ChatRequest {
            model: &self.config.model,
            messages: vec![
                ChatMessage {
                    role: "system",
                    content: EXPANSION_INSTRUCTIONS,
                },
                ChatMessage {
                    role: "user",
                    content: prompt,
                },
            ],
            temperature: 0.7,
            max_tokens: 200,
        };

        let response = self
            .client
            .post(&url)
            .bearer_auth(&self.config.api_key)
            .json(&request)
            .send()
            .await
            .map_err(|e| FuseError::network_error("OpenRouter request failed", e))?;
        let response = ensure_success(OPENROUTER_SERVICE, response).await?;

        let body: ChatResponse = response
            .json()
            .await
            .map_err(|e| FuseError::network_error("Failed to read OpenRouter response", e))?;

        let content = body
            .choices
            .into_iter()
            .next()
            .and_then(|choice| choice.message.content)
            .map(|text| clean_completion(&text))
            .unwrap_or_default();

        if content.is_empty() {
            return Err(FuseError::upstream(
                OPENROUTER_SERVICE,
                200,
                "completion contained no text",
            ));
        }
        Ok(content)
    }

    fn name(&self) -> &'static str {
        "openrouter"
    }
}

/// Strip whitespace and wrapping quotes models like to add
fn clean_completion(text: &str) -> String {
    text.trim()
        .trim_matches(|c| c == '"' || c == '\'' || c == '`')
        .trim()
        .to_string()
}
