//! LLM provider abstraction for sentiment/impact analysis.
//!
//! Grounded on the teacher's `LlmProvider` trait shape (`generate` over an
//! OpenAI-compatible request/response pair); narrowed to the one primitive
//! the worker pool needs and changed to return `LlmError` so callers can
//! classify failures into retry vs. terminal without downcasting `anyhow`.

use serde::{Deserialize, Serialize};

use crate::error::LlmError;

/// Core trait for LLM providers (local or remote).
#[async_trait::async_trait]
pub trait LlmProvider: Send + Sync {
    /// Generate a completion for a given prompt.
    async fn generate(&self, request: LlmRequest) -> Result<LlmResponse, LlmError>;
}

/// Request structure for LLM generation.
#[derive(Debug, Clone)]
pub struct LlmRequest {
    pub prompt: String,
    pub max_tokens: Option<usize>,
    pub temperature: Option<f32>,
    pub timeout_seconds: Option<u64>,
}

/// Response from LLM generation.
#[derive(Debug, Clone)]
pub struct LlmResponse {
    pub content: String,
    pub usage: UsageMetadata,
    pub model: String,
}

/// Token usage metadata.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UsageMetadata {
    pub prompt_tokens: usize,
    pub completion_tokens: usize,
    pub total_tokens: usize,
}

pub mod remote;

/// Pull a JSON object out of an LLM response that may be wrapped in a
/// markdown code fence or surrounded by prose. Tries the fenced block
/// first, then falls back to the outermost `{...}` span.
pub fn extract_json_from_text(text: &str) -> Option<String> {
    let trimmed = text.trim();

    if let Some(fence_start) = trimmed.find("```") {
        let after_fence = &trimmed[fence_start + 3..];
        let after_lang = after_fence.strip_prefix("json").unwrap_or(after_fence);
        if let Some(fence_end) = after_lang.find("```") {
            let candidate = after_lang[..fence_end].trim();
            if !candidate.is_empty() {
                return Some(candidate.to_string());
            }
        }
    }

    let first = trimmed.find('{')?;
    let last = trimmed.rfind('}')?;
    if last > first {
        Some(trimmed[first..=last].to_string())
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extracts_from_fenced_code_block() {
        let text = "Here is the result:\n```json\n{\"a\": 1}\n```\nThanks.";
        assert_eq!(extract_json_from_text(text).unwrap(), "{\"a\": 1}");
    }

    #[test]
    fn extracts_raw_json_without_fence() {
        let text = "Sure, here you go: {\"a\": 1, \"b\": [1,2]} -- done";
        assert_eq!(
            extract_json_from_text(text).unwrap(),
            "{\"a\": 1, \"b\": [1,2]}"
        );
    }

    #[test]
    fn returns_none_when_no_braces_present() {
        assert!(extract_json_from_text("no json here").is_none());
    }
}
