// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025 Jonathan D. A. Jewell <hyperpolymath>

//! Content extraction: bytes plus a filename in, plain text out

pub mod document;
pub mod image;
pub mod pdf;

use std::path::Path;
use tracing::debug;

use crate::{ArchivistError, Result};

pub const IMAGE_EXTENSIONS: &[&str] = &[
    "jpg", "jpeg", "png", "gif", "bmp", "webp", "heic", "heif", "tiff",
];
pub const AUDIO_EXTENSIONS: &[&str] = &["mp3", "wav", "m4a", "flac", "aac", "ogg"];
pub const VIDEO_EXTENSIONS: &[&str] = &["mp4", "mov", "mkv", "avi", "webm", "wmv", "flv"];
pub const ARCHIVE_EXTENSIONS: &[&str] = &["zip", "tar", "gz", "7z", "rar"];
pub const CODE_EXTENSIONS: &[&str] = &[
    "py", "js", "ts", "tsx", "jsx", "go", "rs", "java", "c", "cpp", "h", "swift", "kt", "rb",
    "php", "css", "html", "json", "yaml", "yml", "toml", "sql",
];

/// Coarse file classes used for placement buckets and search boosts
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileKind {
    Image,
    Audio,
    Video,
    Archive,
    Code,
    Other,
}

/// Lowercased extension without the dot, empty if there is none
pub fn extension_of(filename: &str) -> String {
    Path::new(filename)
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_ascii_lowercase())
        .unwrap_or_default()
}

pub fn classify(filename: &str) -> FileKind {
    let ext = extension_of(filename);
    let ext = ext.as_str();
    if IMAGE_EXTENSIONS.contains(&ext) {
        FileKind::Image
    } else if AUDIO_EXTENSIONS.contains(&ext) {
        FileKind::Audio
    } else if VIDEO_EXTENSIONS.contains(&ext) {
        FileKind::Video
    } else if ARCHIVE_EXTENSIONS.contains(&ext) {
        FileKind::Archive
    } else if CODE_EXTENSIONS.contains(&ext) {
        FileKind::Code
    } else {
        FileKind::Other
    }
}

pub fn is_image(filename: &str) -> bool {
    classify(filename) == FileKind::Image
}

/// Extracts text for one family of formats
pub trait FormatExtractor: Send + Sync {
    /// Name of this extractor
    fn name(&self) -> &'static str;

    /// File extensions this extractor handles
    fn supported_extensions(&self) -> &[&str];

    fn can_handle(&self, filename: &str) -> bool {
        let ext = extension_of(filename);
        self.supported_extensions()
            .iter()
            .any(|e| e.eq_ignore_ascii_case(&ext))
    }

    fn extract(&self, filename: &str, bytes: &[u8]) -> Result<String>;
}

/// Turns raw file bytes into text for summarization and indexing
pub trait ContentExtractor: Send + Sync {
    fn extract_text(&self, filename: &str, bytes: &[u8]) -> Result<String>;
}

/// Registry of the built-in format extractors
pub struct DefaultExtractor {
    extractors: Vec<Box<dyn FormatExtractor>>,
}

impl DefaultExtractor {
    pub fn new() -> Self {
        let mut registry = Self {
            extractors: Vec::new(),
        };
        registry.register(Box::new(pdf::PdfExtractor));
        registry.register(Box::new(document::OfficeExtractor));
        registry.register(Box::new(document::SpreadsheetExtractor));
        registry.register(Box::new(document::PlainTextExtractor));
        registry
    }

    pub fn register(&mut self, extractor: Box<dyn FormatExtractor>) {
        self.extractors.push(extractor);
    }
}

impl Default for DefaultExtractor {
    fn default() -> Self {
        Self::new()
    }
}

impl ContentExtractor for DefaultExtractor {
    fn extract_text(&self, filename: &str, bytes: &[u8]) -> Result<String> {
        let extractor = self
            .extractors
            .iter()
            .find(|e| e.can_handle(filename))
            .ok_or_else(|| ArchivistError::UnsupportedFileType(extension_of(filename)))?;

        debug!(filename, extractor = extractor.name(), "Extracting text");
        extractor.extract(filename, bytes)
    }
}

/// Placeholder text for files whose content cannot be read
pub fn placeholder_text(filename: &str) -> String {
    format!("File named {}", filename)
}

/// Text describing an image by its name alone
pub fn image_placeholder(filename: &str) -> String {
    let stem = Path::new(filename)
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or(filename);
    format!("Image file named {}", stem.replace(['_', '-'], " "))
}

/// Text stored in the vector index for a file
///
/// Images are indexed by name. Everything else uses the extracted text and
/// falls back to a placeholder when extraction fails or yields nothing.
pub fn index_document(extractor: &dyn ContentExtractor, filename: &str, bytes: &[u8]) -> String {
    if is_image(filename) {
        return image_placeholder(filename);
    }
    match extractor.extract_text(filename, bytes) {
        Ok(text) if !text.trim().is_empty() => text,
        Ok(_) => placeholder_text(filename),
        Err(e) => {
            debug!(filename, error = %e, "Extraction failed, using placeholder");
            placeholder_text(filename)
        }
    }
}

/// Collapse whitespace runs to single spaces
pub fn collapse_whitespace(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Truncate to at most `max` characters on a char boundary
pub fn truncate_chars(text: &str, max: usize) -> &str {
    match text.char_indices().nth(max) {
        Some((idx, _)) => &text[..idx],
        None => text,
    }
}
