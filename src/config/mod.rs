// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025 Jonathan D. A. Jewell <hyperpolymath>

//! Configuration management for Archivist

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::placement::context::MIN_CONTEXT_BUDGET;
use crate::{ArchivistError, Result};

/// Name of the directory inside the archive root that holds index storage.
pub const INDEX_DIR_NAME: &str = ".archivist";

/// Main application configuration
#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct AppConfig {
    /// Drop folder monitored for new items
    #[serde(default = "default_input_dir")]
    pub input_dir: PathBuf,

    /// Curated output tree
    #[serde(default = "default_archive_dir")]
    pub archive_dir: PathBuf,

    /// Whether the input watcher runs at all
    #[serde(default = "default_true")]
    pub watch_input: bool,

    /// AI engine configuration
    #[serde(default)]
    pub ai_engine: EngineConfig,

    /// Ingestion tuning
    #[serde(default)]
    pub ingest: IngestConfig,

    /// Placement context tuning
    #[serde(default)]
    pub placement: PlacementConfig,

    /// Reconciliation scheduling
    #[serde(default)]
    pub reconcile: ReconcileConfig,

    /// Search reranking
    #[serde(default)]
    pub search: SearchConfig,

    /// Prompt templates (minijinja)
    #[serde(default)]
    pub prompts: PromptConfig,

    /// HTTP API settings
    #[serde(default)]
    pub web: WebConfig,

    /// Storage locations
    #[serde(default)]
    pub database: DatabaseConfig,
}

#[derive(Debug, Deserialize, Serialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum EmbedderKind {
    /// Embeddings from the Ollama embedding model
    Ollama,
    /// Deterministic offline feature hashing
    Hash,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct EngineConfig {
    #[serde(default = "default_engine_url")]
    pub url: String,
    #[serde(default)]
    pub models: ModelConfig,
    #[serde(default = "default_timeout")]
    pub timeout_secs: u64,
    #[serde(default = "default_retries")]
    pub retries: u32,
    #[serde(default = "default_embedder")]
    pub embedder: EmbedderKind,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct ModelConfig {
    #[serde(default = "default_text_model")]
    pub text: String,
    #[serde(default = "default_vision_model")]
    pub vision: String,
    #[serde(default = "default_embedding_model")]
    pub embedding: String,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct IngestConfig {
    /// Size of the ingestion worker pool
    #[serde(default = "default_workers")]
    pub workers: usize,
    /// Interval between size polls while a file settles
    #[serde(default = "default_settle_interval_ms")]
    pub settle_interval_ms: u64,
    /// Give up waiting for a growing file after this long and ingest anyway
    #[serde(default = "default_settle_max_secs")]
    pub settle_max_secs: u64,
    /// Delay before a newly created folder is treated as complete
    #[serde(default = "default_folder_settle_secs")]
    pub folder_settle_secs: u64,
    /// Upper bound on one ingestion task
    #[serde(default = "default_ingest_timeout_secs")]
    pub timeout_secs: u64,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct PlacementConfig {
    /// Character budget for the serialized placement context
    #[serde(default = "default_context_budget")]
    pub context_budget_chars: usize,
    /// Seconds a built placement context stays valid
    #[serde(default = "default_context_ttl_secs")]
    pub context_ttl_secs: u64,
    /// Entry cap for the rendered tree in the largest preset
    #[serde(default = "default_tree_entries")]
    pub max_tree_entries: usize,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct ReconcileConfig {
    #[serde(default = "default_startup_delay_ms")]
    pub startup_delay_ms: u64,
    /// Debounce for archive-watcher triggered passes
    #[serde(default = "default_reconcile_debounce_ms")]
    pub debounce_ms: u64,
    /// Pause before the single coalesced follow-up pass
    #[serde(default = "default_follow_up_delay_ms")]
    pub follow_up_delay_ms: u64,
    /// Archive events applied to the index concurrently
    #[serde(default = "default_index_workers")]
    pub index_workers: usize,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct SearchConfig {
    #[serde(default = "default_fetch_factor")]
    pub fetch_factor: usize,
    #[serde(default = "default_fetch_floor")]
    pub fetch_floor: usize,
    #[serde(default = "default_path_cache_ttl_secs")]
    pub path_cache_ttl_secs: u64,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct PromptConfig {
    #[serde(default = "default_summary_prompt")]
    pub summary: String,
    #[serde(default = "default_image_prompt")]
    pub image: String,
    #[serde(default = "default_path_prompt")]
    pub path: String,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct WebConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_web_host")]
    pub host: String,
    #[serde(default = "default_web_port")]
    pub port: u16,
}

#[derive(Debug, Deserialize, Serialize, Clone, Default)]
pub struct DatabaseConfig {
    /// Vector index database; defaults to `<archive>/.archivist/index.db`
    #[serde(default)]
    pub index_path: Option<PathBuf>,
    /// Move log database; defaults to `<archive>/.archivist/moves.db`
    #[serde(default)]
    pub move_log_path: Option<PathBuf>,
}

// Default value functions
fn home_dir() -> PathBuf {
    std::env::var_os("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("."))
}
fn default_input_dir() -> PathBuf { home_dir().join("Desktop").join("Input") }
fn default_archive_dir() -> PathBuf { home_dir().join("Desktop").join("Archive") }
fn default_true() -> bool { true }
fn default_engine_url() -> String { "http://localhost:11434".to_string() }
fn default_timeout() -> u64 { 45 }
fn default_retries() -> u32 { 2 }
fn default_embedder() -> EmbedderKind { EmbedderKind::Ollama }
fn default_text_model() -> String { "llama3".to_string() }
fn default_vision_model() -> String { "moondream".to_string() }
fn default_embedding_model() -> String { "nomic-embed-text".to_string() }
fn default_workers() -> usize { 3 }
fn default_settle_interval_ms() -> u64 { 2000 }
fn default_settle_max_secs() -> u64 { 600 }
fn default_folder_settle_secs() -> u64 { 10 }
fn default_ingest_timeout_secs() -> u64 { 300 }
fn default_context_budget() -> usize { 16_000 }
fn default_context_ttl_secs() -> u64 { 5 }
fn default_tree_entries() -> usize { 1200 }
fn default_startup_delay_ms() -> u64 { 500 }
fn default_reconcile_debounce_ms() -> u64 { 1500 }
fn default_follow_up_delay_ms() -> u64 { 1000 }
fn default_index_workers() -> usize { 4 }
fn default_fetch_factor() -> usize { 8 }
fn default_fetch_floor() -> usize { 60 }
fn default_path_cache_ttl_secs() -> u64 { 10 }
fn default_web_host() -> String { "127.0.0.1".to_string() }
fn default_web_port() -> u16 { 8000 }

fn default_summary_prompt() -> String {
    "Summarize this file in 2-3 concise sentences for downstream folder \
     classification and semantic search.\n\
     Return XML only in this format:\n<summary>...</summary>\n\n\
     <file-name>{{ filename }}</file-name>\n<content>{{ content }}</content>"
        .to_string()
}

fn default_image_prompt() -> String {
    "Describe this image in 2 concise sentences for search indexing and folder \
     classification. Mention the subject, setting and any visible text.\n\
     Return XML only:\n<summary>...</summary>\n\n<file-name>{{ filename }}</file-name>"
        .to_string()
}

fn default_path_prompt() -> String {
    "You organize local files into clean folders for semantic retrieval.\n\n\
     Rules:\n\
     - Return only a folder path, never a filename.\n\
     - Keep paths concise (1 to {{ max_depth }} levels).\n\
     - Use concise folder names in TitleCase.\n\
     - Prefer existing directories first. If a new folder is needed, extend an \
     existing path instead of creating a brand-new top-level root.\n\n\
     Pick the best folder path for this file.\n\
     Return JSON only: {\"path\": \"Top/Sub\"}\n\n\
     Decision order (strict):\n\
     1) Reuse an existing path when it already fits.\n\
     2) If needed, extend an existing path with new subfolders.\n\
     3) Only create a brand-new top-level root when no existing branch can reasonably fit.\n\n\
     Constraints:\n\
     - No filename in the path.\n\
     - Prefer topical folders over file-type buckets (for example, `Taxes/2025` not `Documents/Taxes`).\n\
     - Files in `unindexed_archive_files` are on disk but not yet embedded; \
     files in `db_only_index_records` are stale index records.\n\
     - `top-existing-candidates` is a shortlist of the strongest existing directories.\n\n\
     <file-name>{{ filename }}</file-name>\n\
     <summary>{{ summary }}</summary>\n\
     <top-existing-candidates>{{ candidates }}</top-existing-candidates>\n\
     <placement-context-json>{{ context }}</placement-context-json>"
        .to_string()
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            input_dir: default_input_dir(),
            archive_dir: default_archive_dir(),
            watch_input: true,
            ai_engine: EngineConfig::default(),
            ingest: IngestConfig::default(),
            placement: PlacementConfig::default(),
            reconcile: ReconcileConfig::default(),
            search: SearchConfig::default(),
            prompts: PromptConfig::default(),
            web: WebConfig::default(),
            database: DatabaseConfig::default(),
        }
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            url: default_engine_url(),
            models: ModelConfig::default(),
            timeout_secs: default_timeout(),
            retries: default_retries(),
            embedder: default_embedder(),
        }
    }
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            text: default_text_model(),
            vision: default_vision_model(),
            embedding: default_embedding_model(),
        }
    }
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            workers: default_workers(),
            settle_interval_ms: default_settle_interval_ms(),
            settle_max_secs: default_settle_max_secs(),
            folder_settle_secs: default_folder_settle_secs(),
            timeout_secs: default_ingest_timeout_secs(),
        }
    }
}

impl Default for PlacementConfig {
    fn default() -> Self {
        Self {
            context_budget_chars: default_context_budget(),
            context_ttl_secs: default_context_ttl_secs(),
            max_tree_entries: default_tree_entries(),
        }
    }
}

impl Default for ReconcileConfig {
    fn default() -> Self {
        Self {
            startup_delay_ms: default_startup_delay_ms(),
            debounce_ms: default_reconcile_debounce_ms(),
            follow_up_delay_ms: default_follow_up_delay_ms(),
            index_workers: default_index_workers(),
        }
    }
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self {
            fetch_factor: default_fetch_factor(),
            fetch_floor: default_fetch_floor(),
            path_cache_ttl_secs: default_path_cache_ttl_secs(),
        }
    }
}

impl Default for PromptConfig {
    fn default() -> Self {
        Self {
            summary: default_summary_prompt(),
            image: default_image_prompt(),
            path: default_path_prompt(),
        }
    }
}

impl Default for WebConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            host: default_web_host(),
            port: default_web_port(),
        }
    }
}

impl IngestConfig {
    pub fn settle_interval(&self) -> Duration {
        Duration::from_millis(self.settle_interval_ms)
    }

    pub fn settle_max(&self) -> Duration {
        Duration::from_secs(self.settle_max_secs)
    }

    pub fn folder_settle(&self) -> Duration {
        Duration::from_secs(self.folder_settle_secs)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

impl AppConfig {
    /// Load configuration: `.env`, then the JSON file, then environment overrides
    pub fn load(path: &Path) -> Result<Self> {
        let _ = dotenvy::dotenv();

        let mut config = if path.exists() {
            let content = std::fs::read_to_string(path)?;
            serde_json::from_str(&content)
                .map_err(|e| ArchivistError::Config(format!("Failed to parse config: {}", e)))?
        } else {
            tracing::info!("Config file not found at {:?}, using defaults", path);
            Self::default()
        };

        config.apply_env(|key| std::env::var(key).ok());
        Ok(config)
    }

    /// Apply environment overrides through a lookup function
    pub fn apply_env<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(dir) = lookup("ARCHIVE_DIR").filter(|v| !v.trim().is_empty()) {
            self.archive_dir = PathBuf::from(dir);
        }
        if let Some(dir) = lookup("INPUT_DIR").filter(|v| !v.trim().is_empty()) {
            self.input_dir = PathBuf::from(dir);
        }
        if let Some(flag) = lookup("WATCH_INPUT_DIR") {
            self.watch_input = matches!(
                flag.trim().to_ascii_lowercase().as_str(),
                "1" | "true" | "yes" | "on"
            );
        }
        if let Some(url) = lookup("OLLAMA_BASE_URL").filter(|v| !v.trim().is_empty()) {
            self.ai_engine.url = url;
        }
        if let Some(model) = lookup("OLLAMA_MODEL").filter(|v| !v.trim().is_empty()) {
            self.ai_engine.models.text = model;
        }
        if let Some(host) = lookup("HOST").filter(|v| !v.trim().is_empty()) {
            self.web.host = host;
        }
        if let Some(port) = lookup("PORT").and_then(|v| v.trim().parse().ok()) {
            self.web.port = port;
        }
    }

    /// Save configuration to a JSON file
    pub fn save(&self, path: &Path) -> Result<()> {
        let content = serde_json::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Reject layouts the watchers cannot handle
    pub fn validate(&self) -> Result<()> {
        if self.ingest.workers == 0 {
            return Err(ArchivistError::Config("ingest.workers must be at least 1".to_string()));
        }
        if self.placement.context_budget_chars < MIN_CONTEXT_BUDGET {
            return Err(ArchivistError::Config(format!(
                "placement.context_budget_chars must be at least {}",
                MIN_CONTEXT_BUDGET
            )));
        }
        if self.reconcile.index_workers == 0 {
            return Err(ArchivistError::Config(
                "reconcile.index_workers must be at least 1".to_string(),
            ));
        }
        if self.input_dir == self.archive_dir {
            return Err(ArchivistError::Config(
                "input_dir and archive_dir must differ".to_string(),
            ));
        }
        if self.input_dir.starts_with(&self.archive_dir) || self.archive_dir.starts_with(&self.input_dir) {
            return Err(ArchivistError::Config(
                "input_dir and archive_dir must not be nested inside each other".to_string(),
            ));
        }
        Ok(())
    }

    /// Directory holding index storage inside the archive
    pub fn index_dir(&self) -> PathBuf {
        self.archive_dir.join(INDEX_DIR_NAME)
    }

    pub fn index_path(&self) -> PathBuf {
        self.database
            .index_path
            .clone()
            .unwrap_or_else(|| self.index_dir().join("index.db"))
    }

    pub fn move_log_path(&self) -> PathBuf {
        self.database
            .move_log_path
            .clone()
            .unwrap_or_else(|| self.index_dir().join("moves.db"))
    }

    /// Create the input, archive and index directories if missing
    pub fn ensure_dirs(&self) -> Result<()> {
        std::fs::create_dir_all(&self.archive_dir)?;
        std::fs::create_dir_all(&self.input_dir)?;
        std::fs::create_dir_all(self.index_dir())?;
        Ok(())
    }
}
