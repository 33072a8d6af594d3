//! OpenRouter's OpenAI-compatible chat completions API.

use async_trait::async_trait;
use secrecy::ExposeSecret;
use serde::Serialize;
use tracing::debug;

use super::{ProviderAdapter, UpstreamReply, UpstreamRequest, byte_stream, ensure_success};
use crate::llm::catalog::Provider;
use crate::llm::error::ProxyError;
use crate::llm::normalize::{Dialect, Framing};
use crate::llm::types::ChatMessage;
use crate::llm::validate::ValidationError;

pub const DEFAULT_BASE_URL: &str = "https://openrouter.ai/api/v1";

/// Catalog names carry an `openrouter/` prefix that OpenRouter itself does
/// not know about.
fn upstream_model(name: &str) -> &str {
    name.strip_prefix("openrouter/").unwrap_or(name)
}

#[derive(Debug, Serialize)]
struct CompletionRequest<'a> {
    model: &'a str,
    messages: &'a [ChatMessage],
    stream: bool,
}

pub struct OpenRouterAdapter {
    client: reqwest::Client,
    base_url: String,
    referer: Option<String>,
    title: Option<String>,
}

impl OpenRouterAdapter {
    pub fn new(client: reqwest::Client, base_url: &str) -> Self {
        Self {
            client,
            base_url: base_url.trim_end_matches('/').to_owned(),
            referer: None,
            title: None,
        }
    }

    /// Attribution headers OpenRouter shows on its leaderboards.
    pub fn with_attribution(mut self, referer: Option<String>, title: Option<String>) -> Self {
        self.referer = referer;
        self.title = title;
        self
    }
}

#[async_trait]
impl ProviderAdapter for OpenRouterAdapter {
    fn provider(&self) -> Provider {
        Provider::OpenRouter
    }

    async fn send(&self, request: &UpstreamRequest) -> Result<UpstreamReply, ProxyError> {
        let key = request
            .credential
            .as_ref()
            .ok_or_else(|| ValidationError::MissingCredential(request.model.clone()))?;
        let model = upstream_model(&request.model);
        debug!(model, turns = request.messages.len(), "opening openrouter stream");

        let mut builder = self
            .client
            .post(format!("{}/chat/completions", self.base_url))
            .bearer_auth(key.expose_secret())
            .header(reqwest::header::ACCEPT, "text/event-stream")
            .json(&CompletionRequest {
                model,
                messages: &request.messages,
                stream: true,
            });
        if let Some(referer) = &self.referer {
            builder = builder.header("HTTP-Referer", referer);
        }
        if let Some(title) = &self.title {
            builder = builder.header("X-Title", title);
        }

        let response = ensure_success(builder.send().await?).await?;
        Ok(UpstreamReply {
            body: byte_stream(response),
            framing: Framing::Reframe(Dialect::OpenAiChoices),
            content_type: "text/event-stream".to_owned(),
        })
    }
}
