//! Request validation: turns an untrusted [`ChatRequest`] into a
//! [`ValidatedRequest`] the dispatcher can act on, or refuses it before any
//! upstream traffic happens.

use std::collections::HashMap;

use secrecy::SecretString;
use thiserror::Error;

use super::catalog::{CREDENTIAL_CAPABILITY, CapabilityKind, ModelCatalog, ModelSpec, Provider};
use super::provider::UpstreamRequest;
use super::types::{Capability, ChatRequest};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("provider '{0}' is not supported")]
    UnsupportedProvider(String),

    #[error("model '{model}' is not offered by provider '{provider}'")]
    UnsupportedModel { provider: Provider, model: String },

    #[error("model '{0}' requires an API key")]
    MissingCredential(String),

    #[error("the conversation has no messages")]
    EmptyConversation,
}

impl ValidationError {
    /// Short label for the `error` field of the JSON error body.
    pub fn summary(&self) -> &'static str {
        match self {
            ValidationError::UnsupportedProvider(_) => "Unsupported provider",
            ValidationError::UnsupportedModel { .. } => "Unsupported model",
            ValidationError::MissingCredential(_) => "API key required",
            ValidationError::EmptyConversation => "Empty conversation",
        }
    }
}

/// Keys the operator configured, used when a request brings none.
#[derive(Debug, Clone, Default)]
pub struct ServerCredentials {
    keys: HashMap<Provider, SecretString>,
}

impl ServerCredentials {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, provider: Provider, key: SecretString) -> Self {
        self.keys.insert(provider, key);
        self
    }

    pub fn get(&self, provider: Provider) -> Option<&SecretString> {
        self.keys.get(&provider)
    }
}

/// A request that passed validation.
#[derive(Debug, Clone)]
pub struct ValidatedRequest {
    pub provider: Provider,
    pub upstream: UpstreamRequest,
    /// Thread the finished assistant message is persisted to, if any.
    pub thread_id: Option<String>,
}

/// Picks the credential for a call: a key on the model selection wins over
/// one in the request-level list.
pub fn request_credential<'a>(
    model_capabilities: &'a [Capability],
    request_capabilities: &'a [Capability],
) -> Option<&'a str> {
    model_capabilities
        .iter()
        .chain(request_capabilities)
        .filter(|c| c.name == CREDENTIAL_CAPABILITY)
        .find_map(Capability::text)
}

/// Boolean capabilities switched on by the caller that the model declares.
fn enabled_features(spec: &ModelSpec, request: &ChatRequest) -> Vec<String> {
    let mut features: Vec<String> = Vec::new();
    for capability in request.model.capabilities.iter().chain(&request.capabilities) {
        let declared = spec
            .capability(&capability.name)
            .is_some_and(|c| c.kind == CapabilityKind::Boolean);
        if declared && capability.is_enabled() && !features.contains(&capability.name) {
            features.push(capability.name.clone());
        }
    }
    features
}

pub fn validate(
    request: ChatRequest,
    catalog: &ModelCatalog,
    server: &ServerCredentials,
) -> Result<ValidatedRequest, ValidationError> {
    let provider: Provider = request
        .model
        .provider
        .parse()
        .map_err(|_| ValidationError::UnsupportedProvider(request.model.provider.clone()))?;

    let spec = catalog
        .find(provider, &request.model.name)
        .ok_or_else(|| ValidationError::UnsupportedModel {
            provider,
            model: request.model.name.clone(),
        })?;

    if request.messages.is_empty() {
        return Err(ValidationError::EmptyConversation);
    }

    let supplied = request_credential(&request.model.capabilities, &request.capabilities)
        .map(|key| SecretString::from(key.to_owned()));
    let credential = match (supplied, spec.requires_api_key()) {
        (Some(key), _) => Some(key),
        (None, true) => return Err(ValidationError::MissingCredential(spec.name.to_owned())),
        (None, false) => server.get(provider).cloned(),
    };

    let features = enabled_features(spec, &request);

    Ok(ValidatedRequest {
        provider,
        upstream: UpstreamRequest {
            model: spec.name.to_owned(),
            messages: request.messages,
            credential,
            features,
        },
        thread_id: request.thread_id.filter(|id| !id.is_empty()),
    })
}
