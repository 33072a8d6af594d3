//! HTTP surface of the relay: shared state, routes and the middleware stack.
//!
//! | Route                                  | Handler                 |
//! |----------------------------------------|-------------------------|
//! | `POST /api/chat`                       | [`chat::handle`]        |
//! | `GET  /api/generatethreadname`         | [`title::handle`]       |
//! | `GET  /api/models`                     | [`models::list`]        |
//! | `GET  /api/models/:provider`           | [`models::by_provider`] |
//! | `GET  /health`                         | [`models::health`]      |
//!
//! Everything under `/api/` requires a session.

pub mod chat;
pub mod models;
pub mod title;

use std::sync::Arc;
use std::time::Duration;

use tracing::{info, warn};

use crate::Router;
use crate::config::{Config, TitleConfig};
use crate::database::{HttpMessageStore, MemoryStore, MessageStore};
use crate::llm::provider::{GoogleAdapter, OpenRouterAdapter};
use crate::llm::{ModelCatalog, Provider, ProviderRegistry, ServerCredentials};
use crate::middleware::{LoggerMiddleware, Pipeline, Service};
use crate::security::{
    CorsMiddleware, DevSessionLookup, HttpSessionLookup, SessionLookup, SessionMiddleware,
};

/// Prefix of the routes that require a session.
pub const PROTECTED_PREFIX: &str = "/api/";

/// User id of the session granted when no auth service is configured.
pub const DEV_USER_ID: &str = "local-dev";

/// Collaborators shared by every handler.
pub struct AppState {
    pub catalog: ModelCatalog,
    pub providers: ProviderRegistry,
    pub credentials: ServerCredentials,
    pub messages: Arc<dyn MessageStore>,
    pub idle_timeout: Option<Duration>,
    pub titles: TitleConfig,
}

impl AppState {
    /// Builds the state from configuration, wiring real upstream adapters.
    pub fn from_config(config: &Config, client: &reqwest::Client) -> Self {
        let providers = ProviderRegistry::new()
            .register(Arc::new(GoogleAdapter::new(client.clone(), &config.google.base_url)))
            .register(Arc::new(
                OpenRouterAdapter::new(client.clone(), &config.openrouter.base_url)
                    .with_attribution(
                        config.openrouter.referer.clone(),
                        config.openrouter.title.clone(),
                    ),
            ));

        let mut credentials = ServerCredentials::new();
        match &config.google.api_key {
            Some(key) => credentials = credentials.with(Provider::Google, key.clone()),
            None => warn!("no google api key configured, google models will be refused"),
        }

        let messages: Arc<dyn MessageStore> = match &config.store.url {
            Some(url) => {
                info!(url = %url, "persisting messages to remote store");
                Arc::new(HttpMessageStore::new(client.clone(), url, config.store.token.clone()))
            }
            None => {
                warn!(
                    "no message store configured, threads and messages are kept in memory \
                     and lost on restart"
                );
                Arc::new(MemoryStore::new().creating_threads())
            }
        };

        Self {
            catalog: ModelCatalog::builtin(),
            providers,
            credentials,
            messages,
            idle_timeout: config.idle_timeout(),
            titles: config.titles.clone(),
        }
    }
}

/// The session lookup the configuration asks for.
pub fn session_lookup(config: &Config, client: &reqwest::Client) -> Arc<dyn SessionLookup> {
    match &config.auth.url {
        Some(url) => {
            info!(url = %url, "resolving sessions against auth service");
            Arc::new(HttpSessionLookup::new(client.clone(), url))
        }
        None => {
            warn!(user = DEV_USER_ID, "no auth service configured, every request is signed in");
            Arc::new(DevSessionLookup::new(DEV_USER_ID))
        }
    }
}

pub fn router(state: Arc<AppState>) -> Router {
    let mut router = Router::new();

    let s = Arc::clone(&state);
    router.post("/api/chat", move |ctx| chat::handle(ctx, Arc::clone(&s)));

    let s = Arc::clone(&state);
    router.get("/api/generatethreadname", move |ctx| {
        title::handle(ctx, Arc::clone(&s))
    });

    let s = Arc::clone(&state);
    router.get("/api/models", move |ctx| models::list(ctx, Arc::clone(&s)));

    let s = Arc::clone(&state);
    router.get("/api/models/:provider", move |ctx| {
        models::by_provider(ctx, Arc::clone(&s))
    });

    router.get("/health", models::health);
    router
}

/// Logger → CORS → session → router.
pub fn service(
    state: Arc<AppState>,
    sessions: Arc<dyn SessionLookup>,
    cors_origins: &[String],
) -> Service {
    Pipeline::new(router(state))
        .layer(LoggerMiddleware)
        .layer(CorsMiddleware::new(cors_origins.iter().cloned()))
        .layer(SessionMiddleware::new(sessions, PROTECTED_PREFIX))
        .into_service()
}

/// Builds the complete request handler from configuration.
pub fn build(config: &Config) -> Result<Service, reqwest::Error> {
    let client = reqwest::Client::builder()
        .connect_timeout(config.connect_timeout())
        .build()?;
    let state = Arc::new(AppState::from_config(config, &client));
    let sessions = session_lookup(config, &client);
    Ok(service(state, sessions, &config.server.cors_origins))
}
