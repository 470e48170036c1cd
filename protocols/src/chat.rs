//! OpenAI chat-completion request/response types.
//!
//! Only the fields the gateway inspects are modeled; everything else in the
//! client payload is ignored on parse and forwarded verbatim to the backend.

use serde::{Deserialize, Serialize};

/// Chat-completion request as received from the client.
///
/// `model` and `messages` are deserialized leniently (missing treated as
/// empty) so validation can produce precise errors instead of generic
/// missing-field failures.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ChatCompletionRequest {
    #[serde(default)]
    pub model: String,
    #[serde(default)]
    pub messages: Vec<ChatMessage>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub stream: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub top_p: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub n: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stop: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    #[serde(default)]
    pub role: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<MessageContent>,
}

/// Message content is either a plain string or a list of multimodal parts.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MessageContent {
    Text(String),
    Parts(Vec<ContentPart>),
}

/// A single multimodal content part. Part kinds the gateway does not know
/// about parse into an empty shell and are skipped during prompt extraction.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ContentPart {
    #[serde(rename = "type", default)]
    pub part_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_url: Option<ImageUrl>,
}

pub const PART_TYPE_TEXT: &str = "text";
pub const PART_TYPE_IMAGE_URL: &str = "image_url";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ImageUrl {
    #[serde(default)]
    pub url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

/// Token usage block from a non-stream completion response.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct ChatUsage {
    #[serde(default)]
    pub prompt_tokens: u64,
    #[serde(default)]
    pub completion_tokens: u64,
    #[serde(default)]
    pub total_tokens: u64,
}

/// Lenient envelope for pulling `usage` out of an arbitrary response body.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct UsageEnvelope {
    #[serde(default)]
    pub usage: Option<ChatUsage>,
}

/// Per-request accounting surfaced to the access log at request end.
#[derive(Debug, Clone, Default, Serialize)]
pub struct LlmLogItems {
    #[serde(skip_serializing_if = "String::is_empty")]
    pub model_name: String,
    #[serde(skip_serializing_if = "is_zero")]
    pub input_tokens: u64,
    #[serde(skip_serializing_if = "is_zero")]
    pub output_tokens: u64,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub error_message: String,
}

fn is_zero(v: &u64) -> bool {
    *v == 0
}
