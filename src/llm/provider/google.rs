//! Google Generative Language API (`streamGenerateContent`).

use async_trait::async_trait;
use secrecy::ExposeSecret;
use serde::Serialize;
use serde_json::{Value, json};
use tracing::debug;

use super::{ProviderAdapter, UpstreamReply, UpstreamRequest, byte_stream, content_type, ensure_success};
use crate::llm::catalog::Provider;
use crate::llm::error::ProxyError;
use crate::llm::normalize::{Dialect, Framing};
use crate::llm::types::Role;
use crate::llm::validate::ValidationError;

pub const DEFAULT_BASE_URL: &str = "https://generativelanguage.googleapis.com";

/// Capability that turns on Google Search grounding.
pub const SEARCH_GROUNDING: &str = "useSearchGrounding";

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct GenerateContentRequest {
    contents: Vec<Content>,
    #[serde(skip_serializing_if = "Option::is_none")]
    system_instruction: Option<Content>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    tools: Vec<Value>,
}

#[derive(Debug, Serialize)]
struct Content {
    #[serde(skip_serializing_if = "Option::is_none")]
    role: Option<&'static str>,
    parts: Vec<Part>,
}

#[derive(Debug, Serialize)]
struct Part {
    text: String,
}

impl Content {
    fn text(role: Option<&'static str>, text: String) -> Self {
        Self {
            role,
            parts: vec![Part { text }],
        }
    }
}

fn is_gemma(model: &str) -> bool {
    model.to_ascii_lowercase().starts_with("gemma-")
}

/// Gemini takes system text as `systemInstruction`. Gemma models reject that
/// field, so there the system text is prepended to the first user turn.
fn build_request(request: &UpstreamRequest) -> GenerateContentRequest {
    let system_text = request
        .messages
        .iter()
        .filter(|m| m.role == Role::System)
        .map(|m| m.content.trim())
        .filter(|t| !t.is_empty())
        .collect::<Vec<_>>()
        .join("\n\n");

    let mut contents: Vec<Content> = request
        .messages
        .iter()
        .filter_map(|m| match m.role {
            Role::User => Some(Content::text(Some("user"), m.content.clone())),
            Role::Assistant => Some(Content::text(Some("model"), m.content.clone())),
            Role::System => None,
        })
        .collect();

    let mut system_instruction = None;
    if !system_text.is_empty() {
        if is_gemma(&request.model) {
            let prefix = Part {
                text: format!("{system_text}\n\n"),
            };
            let first_is_user = contents.first().is_some_and(|c| c.role == Some("user"));
            if first_is_user {
                contents[0].parts.insert(0, prefix);
            } else {
                contents.insert(
                    0,
                    Content {
                        role: Some("user"),
                        parts: vec![prefix],
                    },
                );
            }
        } else {
            system_instruction = Some(Content::text(None, system_text));
        }
    }

    let mut tools = Vec::new();
    if request.has_feature(SEARCH_GROUNDING) {
        tools.push(json!({ "google_search": {} }));
    }

    GenerateContentRequest {
        contents,
        system_instruction,
        tools,
    }
}

pub struct GoogleAdapter {
    client: reqwest::Client,
    base_url: String,
}

impl GoogleAdapter {
    pub fn new(client: reqwest::Client, base_url: &str) -> Self {
        Self {
            client,
            base_url: base_url.trim_end_matches('/').to_owned(),
        }
    }

    fn endpoint(&self, model: &str) -> String {
        format!(
            "{}/v1beta/models/{model}:streamGenerateContent?alt=sse",
            self.base_url
        )
    }
}

#[async_trait]
impl ProviderAdapter for GoogleAdapter {
    fn provider(&self) -> Provider {
        Provider::Google
    }

    async fn send(&self, request: &UpstreamRequest) -> Result<UpstreamReply, ProxyError> {
        let key = request
            .credential
            .as_ref()
            .ok_or_else(|| ValidationError::MissingCredential(request.model.clone()))?;
        let body = build_request(request);
        debug!(
            model = %request.model,
            turns = body.contents.len(),
            grounding = !body.tools.is_empty(),
            "opening google stream"
        );

        let response = self
            .client
            .post(self.endpoint(&request.model))
            .header("x-goog-api-key", key.expose_secret())
            .header(reqwest::header::ACCEPT, "text/event-stream")
            .json(&body)
            .send()
            .await?;
        let response = ensure_success(response).await?;

        Ok(UpstreamReply {
            content_type: content_type(&response),
            framing: Framing::Passthrough(Dialect::GeminiCandidates),
            body: byte_stream(response),
        })
    }
}
