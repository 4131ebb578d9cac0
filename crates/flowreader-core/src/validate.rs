//! Input Validator & Sanitizer (C3).

use once_cell::sync::Lazy;
use regex::Regex;
use uuid::Uuid;

use crate::domain::{ContextScope, Intent};
use crate::error::{AppError, AppResult};

pub const SELECTION_TEXT_MAX: usize = 1000;
pub const NOTE_CONTENT_MAX: usize = 4000;
pub const MAX_PAGE_LIMIT: u32 = 100;

static SCRIPT_TAG: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?is)<script.*?>.*?</script>").unwrap());
static EVENT_HANDLER_ATTR: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"(?i)\s(on[a-z]+)\s*=\s*("[^"]*"|'[^']*'|[^\s>]+)"#).unwrap());

pub fn parse_uuid(field: &str, value: &str) -> AppResult<Uuid> {
    Uuid::parse_str(value)
        .map_err(|_| AppError::validation(field, "must be a well-formed UUID (RFC 4122)"))
}

pub fn validate_string_len(field: &str, value: &str, max_len: usize) -> AppResult<()> {
    if value.chars().count() > max_len {
        return Err(AppError::validation(
            field,
            format!("must be at most {max_len} characters"),
        ));
    }
    Ok(())
}

/// Strips `<script>` blocks and inline event-handler attributes while
/// otherwise preserving the original text (§4.3: "original semantics
/// preserved otherwise").
pub fn sanitize_text(input: &str) -> String {
    let no_scripts = SCRIPT_TAG.replace_all(input, "");
    EVENT_HANDLER_ATTR.replace_all(&no_scripts, "").into_owned()
}

pub fn validate_file_name(field: &str, file_name: &str) -> AppResult<()> {
    if file_name.contains("..") || file_name.contains('/') || file_name.chars().any(|c| c.is_control()) {
        return Err(AppError::validation(field, "contains an unsafe path segment"));
    }
    if !file_name.to_lowercase().ends_with(".epub") {
        return Err(AppError::validation(field, "must have an .epub extension"));
    }
    Ok(())
}

pub fn validate_upload_size(field: &str, size_bytes: u64, max_bytes: u64) -> AppResult<()> {
    if size_bytes > max_bytes {
        return Err(AppError::validation(
            field,
            format!("must be at most {max_bytes} bytes"),
        ));
    }
    Ok(())
}

pub fn parse_intent(field: &str, value: &str) -> AppResult<Intent> {
    Ok(match value {
        "translate" => Intent::Translate,
        "explain" => Intent::Explain,
        "analyze" => Intent::Analyze,
        "ask" => Intent::Ask,
        "enhance" => Intent::Enhance,
        "summarize" => Intent::Summarize,
        "question" => Intent::Question,
        other => {
            return Err(AppError::validation(
                field,
                format!("`{other}` is not a recognized intent"),
            ))
        }
    })
}

pub fn parse_context_scope(field: &str, value: &str) -> AppResult<ContextScope> {
    Ok(match value {
        "selection" => ContextScope::Selection,
        "recent_dialog" => ContextScope::RecentDialog,
        "chapter" => ContextScope::Chapter,
        other => {
            return Err(AppError::validation(
                field,
                format!("`{other}` is not a recognized context scope"),
            ))
        }
    })
}

/// `limit ∈ [1,100]`, `offset ≥ 0` (offset is unsigned so only the upper
/// bound on limit needs checking).
pub fn validate_pagination(limit: u32, _offset: u32) -> AppResult<()> {
    if limit < 1 || limit > MAX_PAGE_LIMIT {
        return Err(AppError::validation(
            "limit",
            format!("must be between 1 and {MAX_PAGE_LIMIT}"),
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn selection_boundary_1000_accepted_1001_rejected() {
        let at_limit = "a".repeat(SELECTION_TEXT_MAX);
        assert!(validate_string_len("selection.text", &at_limit, SELECTION_TEXT_MAX).is_ok());
        let over_limit = "a".repeat(SELECTION_TEXT_MAX + 1);
        assert!(validate_string_len("selection.text", &over_limit, SELECTION_TEXT_MAX).is_err());
    }

    #[test]
    fn pagination_boundaries() {
        assert!(validate_pagination(0, 0).is_err());
        assert!(validate_pagination(101, 0).is_err());
        assert!(validate_pagination(1, 0).is_ok());
        assert!(validate_pagination(100, 0).is_ok());
    }

    #[test]
    fn sanitizer_strips_script_tags_and_handlers() {
        let dirty = r#"<p onclick="evil()">hi</p><script>bad()</script>"#;
        let clean = sanitize_text(dirty);
        assert!(!clean.contains("<script>"));
        assert!(!clean.contains("onclick"));
        assert!(clean.contains("hi"));
    }

    #[test]
    fn file_name_traversal_rejected() {
        assert!(validate_file_name("fileName", "../../etc/passwd.epub").is_err());
        assert!(validate_file_name("fileName", "book.txt").is_err());
        assert!(validate_file_name("fileName", "book.epub").is_ok());
    }
}
