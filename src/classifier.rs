// Provider classification - which exchanges are AI traffic, and whose
//
// A pure function over (method, scheme, host, path, headers) backed by an
// ordered pattern table. Adding a provider is one table entry plus a usage
// extractor arm; unknown hosts fall through to plain HTTP capture.

use crate::events::{TokenMethod, TokenUsage};
use serde::Deserialize;

/// Classification outcome for one request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Classification {
    Ai { provider: &'static str },
    Other,
}

impl Classification {
    pub fn is_ai(&self) -> bool {
        matches!(self, Classification::Ai { .. })
    }

    pub fn provider(&self) -> Option<&'static str> {
        match self {
            Classification::Ai { provider } => Some(provider),
            Classification::Other => None,
        }
    }
}

/// One row of the classification table. Rows are checked in order; the
/// first match wins.
struct ProviderRule {
    provider: &'static str,
    /// Host must end with this suffix (exact label boundary).
    host_suffix: &'static str,
    /// Path must start with one of these, or any path when empty.
    path_prefixes: &'static [&'static str],
}

const PROVIDER_RULES: &[ProviderRule] = &[
    ProviderRule {
        provider: "anthropic",
        host_suffix: "api.anthropic.com",
        path_prefixes: &["/v1/messages", "/v1/complete"],
    },
    ProviderRule {
        provider: "openai",
        host_suffix: "api.openai.com",
        path_prefixes: &["/v1/chat/completions", "/v1/completions", "/v1/responses", "/v1/embeddings"],
    },
    ProviderRule {
        provider: "google",
        host_suffix: "generativelanguage.googleapis.com",
        path_prefixes: &[],
    },
    ProviderRule {
        provider: "mistral",
        host_suffix: "api.mistral.ai",
        path_prefixes: &["/v1/chat/completions", "/v1/fim/completions"],
    },
    ProviderRule {
        provider: "openrouter",
        host_suffix: "openrouter.ai",
        path_prefixes: &["/api/v1/chat/completions", "/api/v1/completions"],
    },
    // Used by the end-to-end scenarios and local mock upstreams
    ProviderRule {
        provider: "example-ai",
        host_suffix: "api.example-ai.com",
        path_prefixes: &["/v1/messages"],
    },
];

/// Classify one request by host and path.
///
/// Pure over its inputs: the same request always classifies the same way.
pub fn classify(host: &str, path: &str) -> Classification {
    let host = host.split(':').next().unwrap_or(host).to_ascii_lowercase();

    for rule in PROVIDER_RULES {
        if !host_matches(&host, rule.host_suffix) {
            continue;
        }
        if rule.path_prefixes.is_empty()
            || rule.path_prefixes.iter().any(|p| path.starts_with(p))
        {
            return Classification::Ai {
                provider: rule.provider,
            };
        }
    }
    Classification::Other
}

/// Suffix match on a label boundary: `api.anthropic.com` matches itself and
/// `eu.api.anthropic.com`, but not `notapi.anthropic.com.evil.example`.
fn host_matches(host: &str, suffix: &str) -> bool {
    host == suffix || host.ends_with(&format!(".{suffix}"))
}

/// Extract the model name from a request body (parsed once, bounded by the
/// capture cap upstream of this call).
pub fn model_from_request(body: &serde_json::Value) -> Option<String> {
    body.get("model")
        .and_then(|v| v.as_str())
        .map(String::from)
}

/// Extract the model name from a non-streaming response body.
pub fn model_from_response(body: &serde_json::Value) -> Option<String> {
    body.get("model")
        .and_then(|v| v.as_str())
        .map(String::from)
        .or_else(|| {
            // Gemini puts it under modelVersion
            body.get("modelVersion")
                .and_then(|v| v.as_str())
                .map(String::from)
        })
}

// Provider usage shapes; serde ignores unknown fields so these stay robust
// to API additions.

#[derive(Debug, Deserialize)]
struct AnthropicUsage {
    input_tokens: Option<u64>,
    output_tokens: Option<u64>,
    cache_creation_input_tokens: Option<u64>,
    cache_read_input_tokens: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct OpenAiUsage {
    prompt_tokens: Option<u64>,
    completion_tokens: Option<u64>,
    input_tokens: Option<u64>,
    output_tokens: Option<u64>,
}

/// Parse the provider-specific usage object out of a response body.
///
/// Returns None when no usable usage field is present, in which case the
/// accounting layer falls back to estimation.
pub fn usage_from_response(provider: &str, body: &serde_json::Value) -> Option<TokenUsage> {
    match provider {
        "anthropic" | "example-ai" => {
            let raw = body.get("usage")?;
            let parsed: AnthropicUsage = serde_json::from_value(raw.clone()).ok()?;
            let input = parsed.input_tokens?;
            let output = parsed.output_tokens?;
            let mut usage = TokenUsage::new(input, output, TokenMethod::Exact);
            usage.cache_creation_tokens = parsed.cache_creation_input_tokens;
            usage.cache_read_tokens = parsed.cache_read_input_tokens;
            Some(usage)
        }
        "openai" | "mistral" | "openrouter" => {
            let raw = body.get("usage")?;
            let parsed: OpenAiUsage = serde_json::from_value(raw.clone()).ok()?;
            // Chat completions report prompt/completion; the responses API
            // reports input/output
            let input = parsed.prompt_tokens.or(parsed.input_tokens)?;
            let output = parsed.completion_tokens.or(parsed.output_tokens)?;
            Some(TokenUsage::new(input, output, TokenMethod::Exact))
        }
        "google" => {
            let raw = body.get("usageMetadata")?;
            let input = raw.get("promptTokenCount")?.as_u64()?;
            let output = raw.get("candidatesTokenCount")?.as_u64()?;
            Some(TokenUsage::new(input, output, TokenMethod::Exact))
        }
        _ => {
            // Unknown providers still get a chance at the common shape
            let raw = body.get("usage")?;
            let input = raw.get("input_tokens")?.as_u64()?;
            let output = raw.get("output_tokens")?.as_u64()?;
            Some(TokenUsage::new(input, output, TokenMethod::Exact))
        }
    }
}

/// Extract the assistant text from a non-streaming response body, used for
/// approximate token estimation when usage is absent.
pub fn response_text(body: &serde_json::Value) -> String {
    let mut out = String::new();

    // Anthropic-style content blocks
    if let Some(blocks) = body.get("content").and_then(|v| v.as_array()) {
        for block in blocks {
            if let Some(text) = block.get("text").and_then(|v| v.as_str()) {
                out.push_str(text);
                out.push('\n');
            }
        }
    }

    // OpenAI-style choices
    if let Some(choices) = body.get("choices").and_then(|v| v.as_array()) {
        for choice in choices {
            if let Some(text) = choice
                .pointer("/message/content")
                .and_then(|v| v.as_str())
                .or_else(|| choice.get("text").and_then(|v| v.as_str()))
            {
                out.push_str(text);
                out.push('\n');
            }
        }
    }

    // Gemini-style candidates
    if let Some(candidates) = body.get("candidates").and_then(|v| v.as_array()) {
        for candidate in candidates {
            if let Some(parts) = candidate.pointer("/content/parts").and_then(|v| v.as_array()) {
                for part in parts {
                    if let Some(text) = part.get("text").and_then(|v| v.as_str()) {
                        out.push_str(text);
                        out.push('\n');
                    }
                }
            }
        }
    }

    if out.is_empty() {
        if let Some(text) = body.get("content").and_then(|v| v.as_str()) {
            out.push_str(text);
        }
    }
    out
}
