//! The set of providers and models the relay will forward to.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Name of the capability that carries a per-request API key.
pub const CREDENTIAL_CAPABILITY: &str = "apiKey";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Provider {
    Google,
    OpenRouter,
}

impl Provider {
    pub const ALL: [Provider; 2] = [Provider::Google, Provider::OpenRouter];

    pub fn as_str(&self) -> &'static str {
        match self {
            Provider::Google => "google",
            Provider::OpenRouter => "openrouter",
        }
    }
}

impl fmt::Display for Provider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnknownProvider(pub String);

impl FromStr for Provider {
    type Err = UnknownProvider;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Provider::ALL
            .into_iter()
            .find(|p| p.as_str() == s)
            .ok_or_else(|| UnknownProvider(s.to_owned()))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum CapabilityKind {
    Boolean,
    Password,
}

/// Declares a capability a model accepts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CapabilitySpec {
    pub name: &'static str,
    pub friendly_name: &'static str,
    pub description: &'static str,
    #[serde(rename = "type")]
    pub kind: CapabilityKind,
    pub required: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub default_value: Option<bool>,
}

impl CapabilitySpec {
    pub const fn toggle(
        name: &'static str,
        friendly_name: &'static str,
        description: &'static str,
        default_value: bool,
    ) -> Self {
        Self {
            name,
            friendly_name,
            description,
            kind: CapabilityKind::Boolean,
            required: false,
            default_value: Some(default_value),
        }
    }

    pub const fn api_key() -> Self {
        Self {
            name: CREDENTIAL_CAPABILITY,
            friendly_name: "API Key",
            description: "Your provider API key",
            kind: CapabilityKind::Password,
            required: true,
            default_value: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ModelSpec {
    pub name: &'static str,
    pub label: &'static str,
    pub description: &'static str,
    pub provider: Provider,
    pub capabilities: Vec<CapabilitySpec>,
}

impl ModelSpec {
    /// Whether the caller must supply the model's key.
    pub fn requires_api_key(&self) -> bool {
        self.capability(CREDENTIAL_CAPABILITY)
            .is_some_and(|c| c.required)
    }

    pub fn capability(&self, name: &str) -> Option<&CapabilitySpec> {
        self.capabilities.iter().find(|c| c.name == name)
    }
}

fn openrouter(name: &'static str, label: &'static str, description: &'static str) -> ModelSpec {
    ModelSpec {
        name,
        label,
        description,
        provider: Provider::OpenRouter,
        capabilities: vec![CapabilitySpec::api_key()],
    }
}

/// An ordered, read-only model list.
#[derive(Debug, Clone)]
pub struct ModelCatalog {
    models: Vec<ModelSpec>,
}

impl ModelCatalog {
    pub fn new(models: Vec<ModelSpec>) -> Self {
        Self { models }
    }

    /// The models the relay ships with.
    pub fn builtin() -> Self {
        Self::new(vec![
            ModelSpec {
                name: "gemini-2.0-flash",
                label: "Gemini 2.0 Flash",
                description: "Fast multimodal model from Google",
                provider: Provider::Google,
                capabilities: vec![CapabilitySpec::toggle(
                    "useSearchGrounding",
                    "Search Grounding",
                    "Ground answers in Google Search results",
                    false,
                )],
            },
            ModelSpec {
                name: "gemini-2.0-flash-lite",
                label: "Gemini 2.0 Flash Lite",
                description: "Cost-efficient Gemini model",
                provider: Provider::Google,
                capabilities: vec![CapabilitySpec::toggle(
                    "useTools",
                    "Tools",
                    "Allow the model to call tools",
                    true,
                )],
            },
            ModelSpec {
                name: "gemma-3-27b-it",
                label: "Gemma 3 27B",
                description: "Open-weights instruction-tuned model",
                provider: Provider::Google,
                capabilities: Vec::new(),
            },
            openrouter(
                "openrouter/openai/gpt-4o",
                "GPT-4o (via OpenRouter)",
                "OpenAI's flagship model",
            ),
            openrouter(
                "openrouter/openai/gpt-4-turbo",
                "GPT-4 Turbo (via OpenRouter)",
                "OpenAI GPT-4 Turbo",
            ),
            openrouter(
                "openrouter/anthropic/claude-3-opus",
                "Claude 3 Opus (via OpenRouter)",
                "Anthropic's most capable Claude 3 model",
            ),
            openrouter(
                "openrouter/anthropic/claude-3-sonnet",
                "Claude 3 Sonnet (via OpenRouter)",
                "Balanced Claude 3 model",
            ),
            openrouter(
                "openrouter/mistralai/mistral-large-latest",
                "Mistral Large (via OpenRouter)",
                "Mistral's largest model",
            ),
            openrouter(
                "openrouter/mistralai/mixtral-8x7b-instruct",
                "Mixtral 8x7B (via OpenRouter)",
                "Sparse mixture-of-experts model",
            ),
            openrouter(
                "openrouter/mistralai/mistral-7b-instruct",
                "Mistral 7B (via OpenRouter)",
                "Small instruction-tuned Mistral",
            ),
            openrouter(
                "openrouter/huggingfaceh4/zephyr-7b-beta",
                "Zephyr 7B (via OpenRouter)",
                "Fine-tuned Mistral 7B",
            ),
            openrouter(
                "deepseek/deepseek-r1:free",
                "DeepSeek R1 (via OpenRouter)",
                "DeepSeek reasoning model, free tier",
            ),
        ])
    }

    pub fn find(&self, provider: Provider, name: &str) -> Option<&ModelSpec> {
        self.models
            .iter()
            .find(|m| m.provider == provider && m.name == name)
    }

    pub fn for_provider(&self, provider: Provider) -> impl Iterator<Item = &ModelSpec> {
        self.models.iter().filter(move |m| m.provider == provider)
    }

    pub fn iter(&self) -> impl Iterator<Item = &ModelSpec> {
        self.models.iter()
    }

    pub fn len(&self) -> usize {
        self.models.len()
    }

    pub fn is_empty(&self) -> bool {
        self.models.is_empty()
    }
}

impl Default for ModelCatalog {
    fn default() -> Self {
        Self::builtin()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn provider_names() {
        assert_eq!("google".parse::<Provider>(), Ok(Provider::Google));
        assert_eq!("openrouter".parse::<Provider>(), Ok(Provider::OpenRouter));
        assert_eq!(
            "anthropic".parse::<Provider>(),
            Err(UnknownProvider("anthropic".into()))
        );
        assert_eq!(Provider::OpenRouter.to_string(), "openrouter");
    }

    #[test]
    fn builtin_lookup() {
        let catalog = ModelCatalog::builtin();
        let flash = catalog.find(Provider::Google, "gemini-2.0-flash").unwrap();
        assert!(!flash.requires_api_key());
        assert!(flash.capability("useSearchGrounding").is_some());

        let gpt = catalog
            .find(Provider::OpenRouter, "openrouter/openai/gpt-4o")
            .unwrap();
        assert!(gpt.requires_api_key());

        // Names are scoped by provider.
        assert!(catalog.find(Provider::Google, "openrouter/openai/gpt-4o").is_none());
        assert_eq!(catalog.for_provider(Provider::Google).count(), 3);
        assert_eq!(catalog.for_provider(Provider::OpenRouter).count(), 9);
    }

    #[test]
    fn serializes_like_the_browser_model_list() {
        let catalog = ModelCatalog::builtin();
        let flash = catalog.find(Provider::Google, "gemini-2.0-flash").unwrap();
        let json = serde_json::to_value(flash).unwrap();
        assert_eq!(json["provider"], "google");
        assert_eq!(json["capabilities"][0]["friendlyName"], "Search Grounding");
        assert_eq!(json["capabilities"][0]["type"], "boolean");
        assert_eq!(json["capabilities"][0]["defaultValue"], false);
    }
}
