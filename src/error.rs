// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025 Jonathan D. A. Jewell <hyperpolymath>

//! Error types for Archivist

use std::path::PathBuf;

use thiserror::Error;

/// Result type alias for Archivist operations
pub type Result<T> = std::result::Result<T, ArchivistError>;

/// Archivist error types
#[derive(Error, Debug)]
pub enum ArchivistError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("File system error: {0}")]
    FileSystem(#[from] std::io::Error),

    #[error("API error: {0}")]
    Api(#[from] reqwest::Error),

    #[error("Watch error: {0}")]
    Watch(#[from] notify::Error),

    #[error("Ollama not available: {0}")]
    OllamaUnavailable(String),

    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Template error: {0}")]
    Template(#[from] minijinja::Error),

    #[error("Image error: {0}")]
    Image(#[from] image::ImageError),

    #[error("Extraction error: {0}")]
    Extraction(String),

    #[error("Unsupported file type: {0}")]
    UnsupportedFileType(String),

    #[error("Index error: {0}")]
    Index(String),

    #[error("Placement error: {0}")]
    Placement(String),

    #[error("Source disappeared: {0}")]
    SourceGone(PathBuf),

    #[error("Timed out after {0}s")]
    Timeout(u64),

    #[error("Background task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}

impl ArchivistError {
    /// True when the error means the ingested item no longer exists.
    pub fn is_source_gone(&self) -> bool {
        match self {
            Self::SourceGone(_) => true,
            Self::FileSystem(e) => e.kind() == std::io::ErrorKind::NotFound,
            _ => false,
        }
    }
}
