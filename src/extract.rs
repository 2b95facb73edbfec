//! Structured extraction from free-form model output
//!
//! Every model call expected to yield structured output goes through the
//! same ladder: strict JSON, then a fenced ```json block, then the widest
//! `{...}` slice in the prose. The pipeline never blocks on a parse
//! failure; callers fall back to a schema-specific default.

use serde::de::DeserializeOwned;

/// Parse a typed value out of raw model output.
///
/// Returns `None` when no candidate slice deserializes; the caller decides
/// the fallback.
pub fn parse_json_loose<T: DeserializeOwned>(raw: &str) -> Option<T> {
    let trimmed = raw.trim();

    if let Ok(value) = serde_json::from_str::<T>(trimmed) {
        return Some(value);
    }

    if let Some(block) = fenced_block(trimmed) {
        if let Ok(value) = serde_json::from_str::<T>(block) {
            return Some(value);
        }
    }

    if let Some(slice) = brace_slice(trimmed) {
        if let Ok(value) = serde_json::from_str::<T>(slice) {
            return Some(value);
        }
    }

    None
}

/// Content of the first fenced code block, tolerating a `json` language tag.
fn fenced_block(raw: &str) -> Option<&str> {
    let start = raw.find("```")?;
    let after_fence = &raw[start + 3..];
    let body_start = after_fence.find('\n')? + 1;
    let body = &after_fence[body_start..];
    let end = body.find("```")?;
    Some(body[..end].trim())
}

/// Widest slice from the first `{` to the last `}`.
fn brace_slice(raw: &str) -> Option<&str> {
    let start = raw.find('{')?;
    let end = raw.rfind('}')?;
    if end > start {
        Some(&raw[start..=end])
    } else {
        None
    }
}
