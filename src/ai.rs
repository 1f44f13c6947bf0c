use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::config::env_var;
use crate::models::{Profile, ScoredPosting};

// --- Provider trait ---

pub trait AIProvider {
    fn complete(&self, system: &str, prompt: &str, max_tokens: u32) -> Result<String>;
    fn model_name(&self) -> &str;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProviderKind {
    Anthropic,
    OpenAI,
}

pub fn resolve_model(name: &str) -> Result<(ProviderKind, String)> {
    let kind = match name {
        n if n.starts_with("gpt-") || n.starts_with("o3") || n.starts_with("o4") => ProviderKind::OpenAI,
        n if n.starts_with("claude-") => ProviderKind::Anthropic,
        "sonnet" => return Ok((ProviderKind::Anthropic, "claude-sonnet-4-5".to_string())),
        "haiku" => return Ok((ProviderKind::Anthropic, "claude-haiku-4-5".to_string())),
        _ => {
            return Err(anyhow!(
                "Unknown model '{}'. Use an OpenAI model (gpt-*, o3*) or an Anthropic model (claude-*, sonnet, haiku)",
                name
            ))
        }
    };
    Ok((kind, name.to_string()))
}

pub fn create_provider(model: &str) -> Result<Box<dyn AIProvider>> {
    let (kind, model_id) = resolve_model(model)?;
    match kind {
        ProviderKind::OpenAI => Ok(Box::new(OpenAIProvider::new(model_id)?)),
        ProviderKind::Anthropic => Ok(Box::new(AnthropicProvider::new(model_id)?)),
    }
}

fn http_client() -> Result<reqwest::blocking::Client> {
    reqwest::blocking::Client::builder()
        .timeout(Duration::from_secs(60))
        .build()
        .context("Failed to build HTTP client")
}

// --- OpenAI provider ---

const OPENAI_API_URL: &str = "https://api.openai.com/v1/chat/completions";

#[derive(Debug, Serialize)]
struct ChatMessage<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Debug, Serialize)]
struct OpenAIRequest<'a> {
    model: &'a str,
    max_tokens: u32,
    temperature: f32,
    messages: Vec<ChatMessage<'a>>,
}

#[derive(Debug, Deserialize)]
struct OpenAIResponseMessage {
    content: String,
}

#[derive(Debug, Deserialize)]
struct OpenAIChoice {
    message: OpenAIResponseMessage,
}

#[derive(Debug, Deserialize)]
struct OpenAIResponse {
    choices: Vec<OpenAIChoice>,
}

pub struct OpenAIProvider {
    api_key: String,
    model_id: String,
    client: reqwest::blocking::Client,
}

impl OpenAIProvider {
    pub fn new(model_id: String) -> Result<Self> {
        let api_key = env_var("OPENAI_API_KEY")?;
        Ok(Self { api_key, model_id, client: http_client()? })
    }
}

impl AIProvider for OpenAIProvider {
    fn complete(&self, system: &str, prompt: &str, max_tokens: u32) -> Result<String> {
        let request = OpenAIRequest {
            model: &self.model_id,
            max_tokens,
            temperature: 0.7,
            messages: vec![
                ChatMessage { role: "system", content: system },
                ChatMessage { role: "user", content: prompt },
            ],
        };

        let response = self
            .client
            .post(OPENAI_API_URL)
            .bearer_auth(&self.api_key)
            .json(&request)
            .send()
            .context("Failed to send request to OpenAI API")?;

        if !response.status().is_success() {
            let status = response.status();
            let error_text = response.text().unwrap_or_default();
            return Err(anyhow!("OpenAI API returned {}: {}", status, error_text));
        }

        let api_response: OpenAIResponse = response
            .json()
            .context("Failed to parse OpenAI API response")?;

        api_response
            .choices
            .into_iter()
            .next()
            .map(|choice| choice.message.content.trim().to_string())
            .ok_or_else(|| anyhow!("No choices in OpenAI API response"))
    }

    fn model_name(&self) -> &str {
        &self.model_id
    }
}

// --- Anthropic provider ---

const ANTHROPIC_API_URL: &str = "https://api.anthropic.com/v1/messages";

#[derive(Debug, Serialize)]
struct AnthropicRequest<'a> {
    model: &'a str,
    max_tokens: u32,
    system: &'a str,
    messages: Vec<ChatMessage<'a>>,
}

#[derive(Debug, Deserialize)]
struct AnthropicContentBlock {
    #[serde(default)]
    text: String,
}

#[derive(Debug, Deserialize)]
struct AnthropicResponse {
    content: Vec<AnthropicContentBlock>,
}

pub struct AnthropicProvider {
    api_key: String,
    model_id: String,
    client: reqwest::blocking::Client,
}

impl AnthropicProvider {
    pub fn new(model_id: String) -> Result<Self> {
        let api_key = env_var("ANTHROPIC_API_KEY")?;
        Ok(Self { api_key, model_id, client: http_client()? })
    }
}

impl AIProvider for AnthropicProvider {
    fn complete(&self, system: &str, prompt: &str, max_tokens: u32) -> Result<String> {
        let request = AnthropicRequest {
            model: &self.model_id,
            max_tokens,
            system,
            messages: vec![ChatMessage { role: "user", content: prompt }],
        };

        let response = self
            .client
            .post(ANTHROPIC_API_URL)
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", "2023-06-01")
            .json(&request)
            .send()
            .context("Failed to send request to Anthropic API")?;

        if !response.status().is_success() {
            let status = response.status();
            let error_text = response.text().unwrap_or_default();
            return Err(anyhow!("Anthropic API returned {}: {}", status, error_text));
        }

        let api_response: AnthropicResponse = response
            .json()
            .context("Failed to parse Anthropic API response")?;

        let text: String = api_response.content.into_iter().map(|b| b.text).collect();
        if text.trim().is_empty() {
            return Err(anyhow!("No content in Anthropic API response"));
        }
        Ok(text.trim().to_string())
    }

    fn model_name(&self) -> &str {
        &self.model_id
    }
}

// --- Cover letters ---

const COVER_LETTER_SYSTEM: &str =
    "You are a professional career coach helping write concise, compelling cover letters.";

pub fn cover_letter_prompt(job: &ScoredPosting, profile: &Profile) -> String {
    let p = &job.posting;
    let description: String = p.description.chars().take(300).collect();
    format!(
        "Generate a professional cover letter for this job application:\n\n\
        Job Title: {}\n\
        Company: {}\n\
        Job Description: {}\n\n\
        My Skills: {}\n\
        Matched Skills: {}\n\n\
        Requirements:\n\
        - Keep it concise (3-4 paragraphs)\n\
        - Highlight relevant skills and experience\n\
        - Show enthusiasm for the role\n\
        - Professional but friendly tone\n\
        - Do NOT include placeholders like [Your Name]\n\n\
        Generate only the cover letter body, no subject line or signature.\n",
        p.title,
        p.company,
        description,
        profile.skills.join(", "),
        job.matched_skills.join(", "),
    )
}

/// What the pipeline needs from a cover letter generator.
pub trait CoverLetterWriter {
    fn write(&self, job: &ScoredPosting, profile: &Profile) -> Result<String>;
}

pub struct AiCoverLetterWriter {
    provider: Box<dyn AIProvider>,
}

impl AiCoverLetterWriter {
    pub fn new(provider: Box<dyn AIProvider>) -> Self {
        Self { provider }
    }
}

impl CoverLetterWriter for AiCoverLetterWriter {
    fn write(&self, job: &ScoredPosting, profile: &Profile) -> Result<String> {
        tracing::debug!(model = self.provider.model_name(), id = %job.posting.id, "generating cover letter");
        self.provider
            .complete(COVER_LETTER_SYSTEM, &cover_letter_prompt(job, profile), 500)
    }
}
