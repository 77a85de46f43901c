//! OpenAI-compatible request bodies.
//!
//! Only the fields the dispatcher needs are typed. Everything else is kept
//! in a flattened `rest` map so that engine-specific extensions survive a
//! decode/encode cycle untouched.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Returns the first `n` Unicode code points of `s`.
pub fn first_n_chars(s: &str, n: usize) -> String {
    s.chars().take(n).collect()
}

/// `prompt` of a completion request: str, list[str], list[int] or list[list[int]].
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(untagged)]
pub enum PromptInput {
    String(String),
    StringArray(Vec<String>),
    IntArray(Vec<i64>),
    IntArrayArray(Vec<Vec<i64>>),
    Other(Value),
}

impl PromptInput {
    /// The first textual prompt, or an empty string for token prompts.
    pub fn first_text(&self) -> &str {
        match self {
            PromptInput::String(s) => s,
            PromptInput::StringArray(arr) => arr.first().map(String::as_str).unwrap_or(""),
            PromptInput::Other(Value::Array(items)) => {
                items.first().and_then(Value::as_str).unwrap_or("")
            }
            _ => "",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct CompletionRequest {
    pub model: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prompt: Option<PromptInput>,
    #[serde(flatten)]
    pub rest: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct ContentPart {
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(flatten)]
    pub rest: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(untagged)]
pub enum MessageContent {
    Text(String),
    Parts(Vec<ContentPart>),
    Other(Value),
}

impl MessageContent {
    /// Plain text of the message; array content is the concatenation of its text parts.
    pub fn text(&self) -> String {
        match self {
            MessageContent::Text(s) => s.clone(),
            MessageContent::Parts(parts) => parts
                .iter()
                .filter_map(|p| p.text.as_deref())
                .collect::<String>(),
            MessageContent::Other(_) => String::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct ChatMessage {
    #[serde(default)]
    pub role: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<MessageContent>,
    #[serde(flatten)]
    pub rest: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct ChatCompletionRequest {
    pub model: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub messages: Option<Vec<ChatMessage>>,
    #[serde(flatten)]
    pub rest: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct EmbeddingRequest {
    pub model: String,
    #[serde(flatten)]
    pub rest: Map<String, Value>,
}

/// A decoded JSON inference request, keyed by the route it arrived on.
#[derive(Debug, Clone, PartialEq)]
pub enum InferenceRequest {
    Completion(CompletionRequest),
    ChatCompletion(ChatCompletionRequest),
    Embedding(EmbeddingRequest),
}

impl InferenceRequest {
    pub const COMPLETIONS_PATH: &'static str = "/v1/completions";
    pub const CHAT_COMPLETIONS_PATH: &'static str = "/v1/chat/completions";
    pub const EMBEDDINGS_PATH: &'static str = "/v1/embeddings";

    /// Decode `body` according to `path`. `None` means the path carries no JSON model field.
    pub fn from_slice(path: &str, body: &[u8]) -> Option<serde_json::Result<Self>> {
        let decoded = match path {
            Self::COMPLETIONS_PATH => serde_json::from_slice(body).map(Self::Completion),
            Self::CHAT_COMPLETIONS_PATH => serde_json::from_slice(body).map(Self::ChatCompletion),
            Self::EMBEDDINGS_PATH => serde_json::from_slice(body).map(Self::Embedding),
            _ => return None,
        };
        Some(decoded)
    }

    pub fn model(&self) -> &str {
        match self {
            Self::Completion(r) => &r.model,
            Self::ChatCompletion(r) => &r.model,
            Self::Embedding(r) => &r.model,
        }
    }

    pub fn set_model(&mut self, model: String) {
        match self {
            Self::Completion(r) => r.model = model,
            Self::ChatCompletion(r) => r.model = model,
            Self::Embedding(r) => r.model = model,
        }
    }

    /// Leading `n` code points of the request's primary text, used as the
    /// prefix-hash key.
    pub fn prefix(&self, n: usize) -> String {
        match self {
            Self::Completion(r) => r
                .prompt
                .as_ref()
                .map(|p| first_n_chars(p.first_text(), n))
                .unwrap_or_default(),
            Self::ChatCompletion(r) => r
                .messages
                .iter()
                .flatten()
                .find(|m| m.role == "user")
                .and_then(|m| m.content.as_ref())
                .map(|c| first_n_chars(&c.text(), n))
                .unwrap_or_default(),
            Self::Embedding(_) => String::new(),
        }
    }

    pub fn to_vec(&self) -> serde_json::Result<Vec<u8>> {
        match self {
            Self::Completion(r) => serde_json::to_vec(r),
            Self::ChatCompletion(r) => serde_json::to_vec(r),
            Self::Embedding(r) => serde_json::to_vec(r),
        }
    }
}
