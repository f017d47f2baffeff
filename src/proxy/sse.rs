// SSE (Server-Sent Events) stream assembly
//
// Streaming AI responses arrive as `data:` lines. The proxy forwards them
// untouched and accumulates the captured text here; at stream end the
// accumulated lines are assembled into one logical message so the response
// event carries the full assistant text and the final usage figures.
//
// Two stream dialects are understood:
// - Anthropic-style: message_start / content_block_delta / message_delta,
//   with usage split across message_start (input) and message_delta (output)
// - OpenAI-style: chunk objects with choices[].delta.content and a final
//   chunk carrying `usage`
//
// Usage objects are merged key-wise as they appear; the last-seen value per
// key wins, which matches cumulative reporting in both dialects.

use serde_json::{Map, Value};

/// Check if a response is SSE based on its content-type value.
pub fn is_sse_content_type(content_type: &str) -> bool {
    content_type.contains("text/event-stream")
}

/// The logical message assembled from an SSE capture.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SseAssembly {
    pub model: Option<String>,
    pub text: String,
    pub usage: Option<Value>,
    /// Number of data events seen; zero means the capture held no SSE
    pub event_count: usize,
}

impl SseAssembly {
    /// Rebuild a response-shaped JSON object so the usage and model
    /// extractors treat streamed and unstreamed responses identically.
    pub fn to_response_json(&self) -> Value {
        let mut object = Map::new();
        if let Some(model) = &self.model {
            object.insert("model".into(), Value::String(model.clone()));
        }
        object.insert(
            "content".into(),
            serde_json::json!([{ "type": "text", "text": self.text }]),
        );
        if let Some(usage) = &self.usage {
            object.insert("usage".into(), usage.clone());
        }
        Value::Object(object)
    }
}

/// Assemble accumulated SSE text into one logical message.
pub fn assemble(body: &str) -> SseAssembly {
    let mut assembly = SseAssembly::default();

    for line in body.lines() {
        let Some(data) = parse_sse_data_line(line.trim()) else {
            continue;
        };
        assembly.event_count += 1;

        let event_type = data.get("type").and_then(|v| v.as_str()).unwrap_or("");
        match event_type {
            "message_start" => {
                if let Some(message) = data.get("message") {
                    if let Some(model) = message.get("model").and_then(|v| v.as_str()) {
                        assembly.model = Some(model.to_string());
                    }
                    if let Some(usage) = message.get("usage") {
                        merge_usage(&mut assembly.usage, usage);
                    }
                }
            }
            "content_block_delta" => {
                if let Some(text) = data.pointer("/delta/text").and_then(|v| v.as_str()) {
                    assembly.text.push_str(text);
                }
            }
            "message_delta" => {
                if let Some(usage) = data.get("usage") {
                    merge_usage(&mut assembly.usage, usage);
                }
            }
            _ => {
                // OpenAI-style chunks carry no `type`; look for delta text
                // and trailing usage on the chunk object itself
                if let Some(choices) = data.get("choices").and_then(|v| v.as_array()) {
                    for choice in choices {
                        if let Some(text) =
                            choice.pointer("/delta/content").and_then(|v| v.as_str())
                        {
                            assembly.text.push_str(text);
                        }
                    }
                }
                if let Some(model) = data.get("model").and_then(|v| v.as_str()) {
                    if assembly.model.is_none() {
                        assembly.model = Some(model.to_string());
                    }
                }
                if let Some(usage) = data.get("usage") {
                    if !usage.is_null() {
                        merge_usage(&mut assembly.usage, usage);
                    }
                }
            }
        }
    }

    assembly
}

/// Merge one usage object over the accumulated one; last seen per key wins.
fn merge_usage(accumulated: &mut Option<Value>, incoming: &Value) {
    let Some(incoming_map) = incoming.as_object() else {
        return;
    };
    match accumulated {
        Some(Value::Object(existing)) => {
            for (key, value) in incoming_map {
                existing.insert(key.clone(), value.clone());
            }
        }
        _ => *accumulated = Some(incoming.clone()),
    }
}

/// Extract the JSON payload of one `data:` line. Comments, blank lines, and
/// the `[DONE]` terminator yield None.
fn parse_sse_data_line(line: &str) -> Option<Value> {
    let json_str = line.strip_prefix("data:")?.trim();
    if json_str.is_empty() || json_str == "[DONE]" {
        return None;
    }
    serde_json::from_str(json_str).ok()
}
