//! EPUB Parser (C5).
//!
//! Runs CPU-bound zip/XHTML parsing off the request-handling path: callers
//! invoke [`parse`] inside `spawn_blocking` from the ingestion pipeline
//! rather than awaiting it on a request task.

use scraper::{Html, Selector};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ParseError {
    #[error("archive is not a valid EPUB container")]
    MalformedArchive,
    #[error("archive exceeds the configured size or entry-count limit")]
    ResourceLimitExceeded,
    #[error("no readable spine content found")]
    EmptySpine,
}

#[derive(Debug, Clone)]
pub struct ParsedChapter {
    pub idx: usize,
    pub title: String,
    pub content: String,
}

/// Defends the in-process zip parser against the resource-exhaustion vector
/// called out in the design notes: a strict ceiling on both total
/// uncompressed size and spine entry count.
#[derive(Debug, Clone, Copy)]
pub struct ParseLimits {
    pub max_uncompressed_bytes: u64,
    pub max_spine_entries: usize,
}

impl Default for ParseLimits {
    fn default() -> Self {
        Self {
            max_uncompressed_bytes: 256 * 1024 * 1024,
            max_spine_entries: 10_000,
        }
    }
}

/// `parse(bytes) -> ordered chapters`. Chapters are emitted in spine order
/// with a dense `idx` starting at 0; HTML is stripped down to plain text.
pub fn parse(bytes: &[u8], limits: ParseLimits) -> Result<Vec<ParsedChapter>, ParseError> {
    if bytes.len() as u64 > limits.max_uncompressed_bytes {
        return Err(ParseError::ResourceLimitExceeded);
    }

    let cursor = std::io::Cursor::new(bytes);
    let mut doc = epub::doc::EpubDoc::from_reader(cursor).map_err(|_| ParseError::MalformedArchive)?;

    let spine_len = doc.spine.len();
    if spine_len > limits.max_spine_entries {
        return Err(ParseError::ResourceLimitExceeded);
    }
    if spine_len == 0 {
        return Err(ParseError::EmptySpine);
    }

    let body_selector = Selector::parse("body").unwrap();
    let title_selector = Selector::parse("title, h1, h2").unwrap();

    let mut chapters = Vec::with_capacity(spine_len);
    let mut total_uncompressed: u64 = 0;
    for idx in 0..spine_len {
        doc.set_current_page(idx);
        let Some((content_bytes, _mime)) = doc.get_current_str() else {
            continue;
        };
        // Checked per spine entry as it's decompressed, not once against the
        // compressed archive length: a small archive can still expand past
        // the limit across its entries.
        total_uncompressed += content_bytes.len() as u64;
        if total_uncompressed > limits.max_uncompressed_bytes {
            return Err(ParseError::ResourceLimitExceeded);
        }
        let html = Html::parse_document(&content_bytes);

        let title = html
            .select(&title_selector)
            .next()
            .map(|el| el.text().collect::<String>().trim().to_string())
            .filter(|s| !s.is_empty())
            .unwrap_or_else(|| format!("Chapter {}", idx + 1));

        let text: String = html
            .select(&body_selector)
            .next()
            .map(|el| {
                el.text()
                    .collect::<Vec<_>>()
                    .join(" ")
                    .split_whitespace()
                    .collect::<Vec<_>>()
                    .join(" ")
            })
            .unwrap_or_default();

        if text.is_empty() {
            continue;
        }

        chapters.push(ParsedChapter {
            idx: chapters.len(),
            title,
            content: text,
        });
    }

    if chapters.is_empty() {
        return Err(ParseError::EmptySpine);
    }
    Ok(chapters)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_oversized_archives_before_parsing() {
        let limits = ParseLimits {
            max_uncompressed_bytes: 4,
            ..Default::default()
        };
        let result = parse(b"not actually checked past the size gate", limits);
        assert!(matches!(result, Err(ParseError::ResourceLimitExceeded)));
    }

    #[test]
    fn rejects_non_epub_bytes() {
        let result = parse(b"definitely not a zip", ParseLimits::default());
        assert!(matches!(result, Err(ParseError::MalformedArchive)));
    }
}
