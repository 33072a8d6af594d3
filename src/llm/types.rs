//! Wire types of the inbound chat request and the outbound chunk envelope.

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Author of one conversation turn.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
    System,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
}

impl ChatMessage {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
        }
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: content.into(),
        }
    }
}

/// A named, optionally valued switch attached to a model selection: a
/// credential (`apiKey`) or a boolean feature such as `useSearchGrounding`.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct Capability {
    pub name: String,
    #[serde(default)]
    pub value: Option<Value>,
}

impl Capability {
    pub fn new(name: impl Into<String>, value: impl Into<Value>) -> Self {
        Self {
            name: name.into(),
            value: Some(value.into()),
        }
    }

    /// The value as a non-empty string, if it is one.
    pub fn text(&self) -> Option<&str> {
        self.value
            .as_ref()
            .and_then(Value::as_str)
            .map(str::trim)
            .filter(|s| !s.is_empty())
    }

    /// `true` only for an explicit boolean `true`.
    pub fn is_enabled(&self) -> bool {
        matches!(self.value, Some(Value::Bool(true)))
    }
}

/// The model the client picked. The provider stays a raw string until
/// validation so that an unknown provider can be reported as such.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ModelSelection {
    pub provider: String,
    pub name: String,
    #[serde(default)]
    pub capabilities: Vec<Capability>,
}

/// Body of `POST /api/chat`. Unknown fields (labels, descriptions, UI state
/// the browser sends along) are ignored.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatRequest {
    pub messages: Vec<ChatMessage>,
    pub model: ModelSelection,
    #[serde(default)]
    pub capabilities: Vec<Capability>,
    #[serde(default)]
    pub thread_id: Option<String>,
}

/// One normalized unit of output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamChunk {
    /// Position in the stream, starting at 0.
    pub seq: u64,
    /// Completion id, shared by every chunk of one response.
    pub id: String,
    /// Unix seconds at which the chunk was produced.
    pub created: i64,
    pub model: String,
    pub delta: String,
    pub finish_reason: Option<String>,
}

#[derive(Serialize)]
struct WireChunk<'a> {
    id: &'a str,
    object: &'static str,
    created: i64,
    model: &'a str,
    seq: u64,
    choices: [WireChoice<'a>; 1],
}

#[derive(Serialize)]
struct WireChoice<'a> {
    index: u32,
    delta: WireDelta<'a>,
    finish_reason: Option<&'a str>,
}

#[derive(Serialize)]
struct WireDelta<'a> {
    content: &'a str,
}

impl StreamChunk {
    /// The chunk as an OpenAI-style `chat.completion.chunk` object.
    pub fn to_json(&self) -> String {
        let wire = WireChunk {
            id: &self.id,
            object: "chat.completion.chunk",
            created: self.created,
            model: &self.model,
            seq: self.seq,
            choices: [WireChoice {
                index: 0,
                delta: WireDelta {
                    content: &self.delta,
                },
                finish_reason: self.finish_reason.as_deref(),
            }],
        };
        // Only strings and integers: serialization cannot fail.
        serde_json::to_string(&wire).unwrap_or_default()
    }

    /// The chunk framed as one server-sent event: `data: <json>\n\n`.
    pub fn to_sse(&self) -> Bytes {
        Bytes::from(format!("data: {}\n\n", self.to_json()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_accepts_browser_payload() {
        let body = r#"{
            "messages": [
                {"role": "system", "content": "be brief"},
                {"role": "user", "content": "hi", "id": "m1"}
            ],
            "model": {
                "name": "openrouter/openai/gpt-4o",
                "label": "GPT-4o (via OpenRouter)",
                "provider": "openrouter",
                "requiresApiKey": true,
                "capabilities": [{"name": "apiKey", "value": "sk-or-1"}]
            },
            "capabilities": [{"name": "useSearchGrounding", "value": true, "friendlyName": "Search"}],
            "threadId": "t-9"
        }"#;
        let req: ChatRequest = serde_json::from_str(body).unwrap();
        assert_eq!(req.messages.len(), 2);
        assert_eq!(req.messages[0].role, Role::System);
        assert_eq!(req.model.provider, "openrouter");
        assert_eq!(req.model.capabilities[0].text(), Some("sk-or-1"));
        assert!(req.capabilities[0].is_enabled());
        assert_eq!(req.thread_id.as_deref(), Some("t-9"));
    }

    #[test]
    fn capabilities_are_optional() {
        let body = r#"{"messages":[],"model":{"provider":"google","name":"gemini-2.0-flash"}}"#;
        let req: ChatRequest = serde_json::from_str(body).unwrap();
        assert!(req.capabilities.is_empty());
        assert!(req.model.capabilities.is_empty());
        assert!(req.thread_id.is_none());
    }

    #[test]
    fn capability_value_shapes() {
        let missing: Capability = serde_json::from_str(r#"{"name":"apiKey"}"#).unwrap();
        assert_eq!(missing.text(), None);
        assert!(!missing.is_enabled());

        let blank = Capability::new("apiKey", "   ");
        assert_eq!(blank.text(), None);

        let flag = Capability::new("useSearchGrounding", true);
        assert!(flag.is_enabled());
        assert_eq!(flag.text(), None);
    }

    #[test]
    fn chunk_envelope_shape() {
        let chunk = StreamChunk {
            seq: 3,
            id: "chatcmpl-abc".into(),
            created: 1_700_000_000,
            model: "openai/gpt-4o".into(),
            delta: "Hi".into(),
            finish_reason: None,
        };
        let value: Value = serde_json::from_str(&chunk.to_json()).unwrap();
        assert_eq!(value["object"], "chat.completion.chunk");
        assert_eq!(value["seq"], 3);
        assert_eq!(value["choices"][0]["delta"]["content"], "Hi");
        assert!(value["choices"][0]["finish_reason"].is_null());

        let sse = chunk.to_sse();
        assert!(sse.starts_with(b"data: {"));
        assert!(sse.ends_with(b"}\n\n"));
    }
}
