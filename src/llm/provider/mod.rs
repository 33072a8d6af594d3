//! Provider adapters and the lookup table that dispatches to them.
//!
//! Adding a provider means writing one [`ProviderAdapter`] and registering
//! it. Nothing else in the relay branches on the provider.

pub mod google;
pub mod openrouter;

use std::collections::HashMap;
use std::io;
use std::sync::Arc;

use async_trait::async_trait;
use futures::TryStreamExt;
use secrecy::SecretString;

pub use google::GoogleAdapter;
pub use openrouter::OpenRouterAdapter;

use super::catalog::Provider;
use super::error::ProxyError;
use super::normalize::{ByteStream, Framing};
use super::types::ChatMessage;

/// Everything an adapter needs to open one upstream stream.
#[derive(Debug, Clone)]
pub struct UpstreamRequest {
    /// Model name as listed in the catalog.
    pub model: String,
    pub messages: Vec<ChatMessage>,
    pub credential: Option<SecretString>,
    /// Boolean capabilities the caller enabled.
    pub features: Vec<String>,
}

impl UpstreamRequest {
    pub fn has_feature(&self, name: &str) -> bool {
        self.features.iter().any(|f| f == name)
    }
}

/// An upstream that answered with a success status and is now streaming.
pub struct UpstreamReply {
    pub body: ByteStream,
    pub framing: Framing,
    /// Content type to send to the client.
    pub content_type: String,
}

#[async_trait]
pub trait ProviderAdapter: Send + Sync {
    fn provider(&self) -> Provider;

    /// Opens the upstream stream. Resolves once the response head arrived;
    /// a non-success status is reported as [`ProxyError::UpstreamStatus`].
    async fn send(&self, request: &UpstreamRequest) -> Result<UpstreamReply, ProxyError>;
}

/// Provider → adapter table.
#[derive(Clone, Default)]
pub struct ProviderRegistry {
    adapters: HashMap<Provider, Arc<dyn ProviderAdapter>>,
}

impl ProviderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `adapter` under the provider it reports, replacing any
    /// adapter registered for it before.
    pub fn register(mut self, adapter: Arc<dyn ProviderAdapter>) -> Self {
        self.adapters.insert(adapter.provider(), adapter);
        self
    }

    pub fn get(&self, provider: Provider) -> Result<Arc<dyn ProviderAdapter>, ProxyError> {
        self.adapters
            .get(&provider)
            .cloned()
            .ok_or(ProxyError::MissingAdapter(provider))
    }

    pub fn providers(&self) -> impl Iterator<Item = Provider> + '_ {
        self.adapters.keys().copied()
    }
}

/// Turns a non-success response into [`ProxyError::UpstreamStatus`] carrying
/// the upstream body.
pub(crate) async fn ensure_success(response: reqwest::Response) -> Result<reqwest::Response, ProxyError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    tracing::warn!(status = status.as_u16(), body_len = body.len(), "upstream refused request");
    Err(ProxyError::UpstreamStatus {
        status: status.as_u16(),
        body,
    })
}

pub(crate) fn byte_stream(response: reqwest::Response) -> ByteStream {
    Box::pin(response.bytes_stream().map_err(io::Error::other))
}

pub(crate) fn content_type(response: &reqwest::Response) -> String {
    response
        .headers()
        .get(reqwest::header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("text/event-stream")
        .to_owned()
}

#[cfg(test)]
mod tests {
    use futures::stream;

    use super::*;
    use crate::llm::normalize::Dialect;

    struct Canned(Provider);

    #[async_trait]
    impl ProviderAdapter for Canned {
        fn provider(&self) -> Provider {
            self.0
        }

        async fn send(&self, _request: &UpstreamRequest) -> Result<UpstreamReply, ProxyError> {
            Ok(UpstreamReply {
                body: Box::pin(stream::empty::<Result<bytes::Bytes, io::Error>>()),
                framing: Framing::Reframe(Dialect::OpenAiChoices),
                content_type: "text/event-stream".into(),
            })
        }
    }

    #[test]
    fn lookup_by_provider() {
        let registry = ProviderRegistry::new().register(Arc::new(Canned(Provider::OpenRouter)));
        assert_eq!(
            registry.get(Provider::OpenRouter).unwrap().provider(),
            Provider::OpenRouter
        );
        assert!(matches!(
            registry.get(Provider::Google),
            Err(ProxyError::MissingAdapter(Provider::Google))
        ));
        assert_eq!(registry.providers().collect::<Vec<_>>(), vec![Provider::OpenRouter]);
    }

    #[test]
    fn features_lookup() {
        let request = UpstreamRequest {
            model: "m".into(),
            messages: Vec::new(),
            credential: None,
            features: vec!["useSearchGrounding".into()],
        };
        assert!(request.has_feature("useSearchGrounding"));
        assert!(!request.has_feature("useTools"));
    }
}
