//! Text extraction seam.
//!
//! Parsing binary document formats is an external concern; the pipeline only
//! needs *some* extractor that turns raw bytes into normalized text plus an
//! optional page count. The built-in implementation handles plain text.

use crate::error::{PipelineError, Result};

/// Result of extracting a document's text.
#[derive(Debug, Clone)]
pub struct ExtractedText {
    pub text: String,
    pub page_count: Option<u32>,
}

/// Turns uploaded bytes into text the pipeline can chunk and embed.
pub trait TextExtractor: Send + Sync {
    /// Whether this extractor handles the given filename.
    fn supports(&self, filename: &str) -> bool;

    fn extract(&self, filename: &str, bytes: &[u8]) -> Result<ExtractedText>;
}

/// Plain-text extractor: UTF-8, with a lossy Latin-1 fallback for legacy
/// encodings. Never fails on content, only on empty input.
pub struct PlainTextExtractor;

impl TextExtractor for PlainTextExtractor {
    fn supports(&self, filename: &str) -> bool {
        let lower = filename.to_lowercase();
        lower.ends_with(".txt") || lower.ends_with(".md") || !lower.contains('.')
    }

    fn extract(&self, filename: &str, bytes: &[u8]) -> Result<ExtractedText> {
        let text = match std::str::from_utf8(bytes) {
            Ok(s) => s.to_string(),
            // Latin-1 maps every byte to a codepoint, so this cannot fail.
            Err(_) => bytes.iter().map(|&b| b as char).collect(),
        };
        let text = normalize_text(&text);
        if text.is_empty() {
            return Err(PipelineError::InvalidRequest(format!(
                "no extractable text in {}",
                filename
            )));
        }
        Ok(ExtractedText {
            text,
            page_count: None,
        })
    }
}

/// Normalize line endings and strip trailing whitespace per line, capping
/// runs of blank lines at two.
pub fn normalize_text(text: &str) -> String {
    let unified = text.replace("\r\n", "\n").replace('\r', "\n");
    let mut out = String::with_capacity(unified.len());
    let mut blank_run = 0usize;
    for line in unified.lines() {
        let line = line.trim_end();
        if line.is_empty() {
            blank_run += 1;
            if blank_run > 2 {
                continue;
            }
        } else {
            blank_run = 0;
        }
        out.push_str(line);
        out.push('\n');
    }
    out.trim().to_string()
}
