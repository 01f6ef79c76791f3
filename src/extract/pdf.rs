// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025 Jonathan D. A. Jewell <hyperpolymath>

//! PDF text extraction

use super::FormatExtractor;
use crate::{ArchivistError, Result};

/// Extractor for PDF files
pub struct PdfExtractor;

impl FormatExtractor for PdfExtractor {
    fn name(&self) -> &'static str {
        "pdf"
    }

    fn supported_extensions(&self) -> &[&str] {
        &["pdf"]
    }

    fn extract(&self, _filename: &str, bytes: &[u8]) -> Result<String> {
        // The parser panics on some malformed files
        let text = std::panic::catch_unwind(|| pdf_extract::extract_text_from_mem(bytes))
            .map_err(|_| ArchivistError::Extraction("PDF parser panicked".to_string()))?
            .map_err(|e| ArchivistError::Extraction(format!("PDF text extraction failed: {}", e)))?;

        // Page breaks carry no meaning for classification
        Ok(text.replace('\n', " "))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn garbage_is_an_extraction_error() {
        let err = PdfExtractor.extract("broken.pdf", b"not a pdf").unwrap_err();
        assert!(matches!(err, ArchivistError::Extraction(_)));
    }
}
