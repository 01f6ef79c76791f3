// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025 Jonathan D. A. Jewell <hyperpolymath>

//! Summarization oracle: file summaries and free-text folder suggestions

use async_trait::async_trait;
use minijinja::{context, Environment};
use once_cell::sync::Lazy;
use regex::Regex;
use tracing::{debug, warn};

use crate::config::{EngineConfig, PromptConfig};
use crate::extract::{self, collapse_whitespace, truncate_chars};
use crate::ollama::{GenerateOptions, OllamaClient};
use crate::placement::normalize::MAX_DEPTH;
use crate::Result;

/// Characters of extracted text sent for summarization
pub const SUMMARY_SAMPLE_CHARS: usize = 6000;

/// Length of the content-prefix fallback summary
const FALLBACK_SUMMARY_CHARS: usize = 400;

static SUMMARY_TAG: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?is)<summary>(.*?)</summary>").unwrap());

/// Everything the oracle sees when asked for a folder
#[derive(Debug, Clone, Copy)]
pub struct PathRequest<'a> {
    pub filename: &'a str,
    pub summary: &'a str,
    /// Serialized placement context, already within budget
    pub context_json: &'a str,
    /// Strongest existing directories, best first
    pub candidates: &'a [String],
}

#[async_trait]
pub trait Summarizer: Send + Sync {
    /// Short semantic summary of extracted text
    async fn summarize(&self, filename: &str, text: &str) -> Result<String>;

    /// Short semantic summary of an image
    async fn summarize_image(&self, filename: &str, bytes: &[u8]) -> Result<String>;

    /// Raw model answer naming a folder; may be tagged, JSON or plain text
    async fn suggest_path(&self, request: &PathRequest<'_>) -> Result<String>;
}

/// Collapsed content prefix, or the filename when there is no content
pub fn fallback_summary(filename: &str, content: &str) -> String {
    let collapsed = collapse_whitespace(content);
    if collapsed.is_empty() {
        extract::placeholder_text(filename)
    } else {
        truncate_chars(&collapsed, FALLBACK_SUMMARY_CHARS).to_string()
    }
}

/// Text inside `<summary>` tags, or the whole trimmed answer
pub fn extract_summary(text: &str) -> String {
    match SUMMARY_TAG.captures(text).and_then(|c| c.get(1)) {
        Some(m) => m.as_str().trim().to_string(),
        None => text.trim().to_string(),
    }
}

/// Summarize, falling back to a content prefix when the oracle fails
pub async fn summarize_or_fallback(summarizer: &dyn Summarizer, filename: &str, text: &str) -> String {
    let sample = truncate_chars(text, SUMMARY_SAMPLE_CHARS);
    match summarizer.summarize(filename, sample).await {
        Ok(summary) if !summary.trim().is_empty() => summary,
        Ok(_) => fallback_summary(filename, sample),
        Err(e) => {
            warn!(filename, error = %e, "Summarizer unavailable, using content prefix");
            fallback_summary(filename, sample)
        }
    }
}

/// Summarize an image, falling back to a description of its name
pub async fn summarize_image_or_fallback(
    summarizer: &dyn Summarizer,
    filename: &str,
    bytes: &[u8],
) -> String {
    match summarizer.summarize_image(filename, bytes).await {
        Ok(summary) if !summary.trim().is_empty() => summary,
        Ok(_) => extract::image_placeholder(filename),
        Err(e) => {
            warn!(filename, error = %e, "Vision summary failed, using filename");
            extract::image_placeholder(filename)
        }
    }
}

/// Summarizer backed by a local Ollama server
pub struct OllamaSummarizer {
    client: OllamaClient,
    engine: EngineConfig,
    prompts: PromptConfig,
    templates: Environment<'static>,
}

impl OllamaSummarizer {
    pub fn new(client: OllamaClient, engine: EngineConfig, prompts: PromptConfig) -> Self {
        Self {
            client,
            engine,
            prompts,
            templates: Environment::new(),
        }
    }

    async fn generate(&self, prompt: &str, num_predict: i32) -> Result<String> {
        let response = self
            .client
            .generate_with_retry(
                &self.engine.models.text,
                prompt,
                Some(GenerateOptions::deterministic(num_predict)),
                self.engine.retries,
            )
            .await?;
        Ok(response.trim().to_string())
    }
}

#[async_trait]
impl Summarizer for OllamaSummarizer {
    async fn summarize(&self, filename: &str, text: &str) -> Result<String> {
        let prompt = self.templates.render_str(
            &self.prompts.summary,
            context! { filename => filename, content => text },
        )?;
        let raw = self.generate(&prompt, 180).await?;
        Ok(extract_summary(&raw))
    }

    async fn summarize_image(&self, filename: &str, bytes: &[u8]) -> Result<String> {
        let prompt = self
            .templates
            .render_str(&self.prompts.image, context! { filename => filename })?;

        let owned = bytes.to_vec();
        let encoded =
            tokio::task::spawn_blocking(move || extract::image::encode_for_vision(&owned)).await?;

        debug!(filename, model = %self.engine.models.vision, "Requesting image summary");
        let raw = self
            .client
            .generate_with_image(
                &self.engine.models.vision,
                &prompt,
                &encoded,
                Some(GenerateOptions::deterministic(140)),
            )
            .await?;
        Ok(extract_summary(&raw))
    }

    async fn suggest_path(&self, request: &PathRequest<'_>) -> Result<String> {
        let candidates = serde_json::to_string(request.candidates)?;
        let prompt = self.templates.render_str(
            &self.prompts.path,
            context! {
                filename => request.filename,
                summary => request.summary,
                candidates => candidates,
                context => request.context_json,
                max_depth => MAX_DEPTH,
            },
        )?;
        self.generate(&prompt, 80).await
    }
}
