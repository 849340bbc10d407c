//! Completion request types and the `LanguageModel` trait.

use std::fmt;
use std::sync::LazyLock;

use async_trait::async_trait;
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::Result;

/// Which pipeline stage issued a completion.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PromptPurpose {
    Decompose,
    SynthesizeQuery,
    Formalize,
    Refine,
    GenerateTrace,
}

impl fmt::Display for PromptPurpose {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            PromptPurpose::Decompose => "decompose",
            PromptPurpose::SynthesizeQuery => "synthesize_query",
            PromptPurpose::Formalize => "formalize",
            PromptPurpose::Refine => "refine",
            PromptPurpose::GenerateTrace => "generate_trace",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompletionRequest {
    pub purpose: PromptPurpose,
    pub system: String,
    pub user: String,
    pub temperature: f32,
    /// Ask the endpoint for a JSON object reply.
    pub json_mode: bool,
}

impl CompletionRequest {
    /// A JSON-mode request at temperature zero.
    pub fn structured(
        purpose: PromptPurpose,
        system: impl Into<String>,
        user: impl Into<String>,
    ) -> Self {
        Self {
            purpose,
            system: system.into(),
            user: user.into(),
            temperature: 0.0,
            json_mode: true,
        }
    }

    /// A free-text request.
    pub fn text(purpose: PromptPurpose, system: impl Into<String>, user: impl Into<String>) -> Self {
        Self {
            purpose,
            system: system.into(),
            user: user.into(),
            temperature: 0.0,
            json_mode: false,
        }
    }
}

/// An opaque text-completion service.
#[async_trait]
pub trait LanguageModel: Send + Sync {
    /// Identifier used in logs and reports.
    fn name(&self) -> &str;

    async fn complete(&self, request: &CompletionRequest) -> Result<String>;
}

static FENCE_RE: LazyLock<Option<Regex>> =
    LazyLock::new(|| Regex::new(r"(?s)```[A-Za-z0-9_-]*[ \t]*\n?(.*?)```").ok());

/// Strip a surrounding Markdown code fence, if any, from a model reply.
pub fn strip_code_fences(reply: &str) -> &str {
    let body = FENCE_RE
        .as_ref()
        .and_then(|re| re.captures(reply))
        .and_then(|c| c.get(1));
    match body {
        Some(body) => body.as_str().trim(),
        None => reply.trim(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strips_json_fences() {
        let reply = "Here you go:\n```json\n{\"claims\": []}\n```\n";
        assert_eq!(strip_code_fences(reply), "{\"claims\": []}");
    }

    #[test]
    fn leaves_plain_replies_alone() {
        assert_eq!(strip_code_fences("  {\"a\": 1}\n"), "{\"a\": 1}");
    }

    #[test]
    fn purpose_serialises_snake_case() {
        let json = serde_json::to_string(&PromptPurpose::SynthesizeQuery).unwrap();
        assert_eq!(json, "\"synthesize_query\"");
        assert_eq!(PromptPurpose::GenerateTrace.to_string(), "generate_trace");
    }

    #[test]
    fn structured_requests_use_json_mode() {
        let req = CompletionRequest::structured(PromptPurpose::Decompose, "sys", "user");
        assert!(req.json_mode);
        assert_eq!(req.temperature, 0.0);
        assert!(!CompletionRequest::text(PromptPurpose::Refine, "s", "u").json_mode);
    }
}
