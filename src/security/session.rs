//! Session resolution against the external auth service.
//!
//! The relay never authenticates anyone itself. It forwards the caller's
//! identity headers to the auth service and trusts the answer.

use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use thiserror::Error;

use crate::{
    Response, StatusCode,
    context::Context,
    http::Headers,
    middleware::{Middleware, Next},
};

/// The authenticated caller of one request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Session {
    pub user_id: String,
    pub active_organization_id: Option<String>,
}

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("auth service unreachable: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("auth service answered {status}")]
    Status { status: u16 },
}

/// Resolves request headers to a [`Session`], or `None` when the caller is
/// not signed in.
#[async_trait]
pub trait SessionLookup: Send + Sync {
    async fn lookup(&self, headers: &Headers) -> Result<Option<Session>, SessionError>;
}

/// Asks a better-auth style service: `GET {base}/api/auth/get-session`.
pub struct HttpSessionLookup {
    client: reqwest::Client,
    endpoint: String,
}

impl HttpSessionLookup {
    pub fn new(client: reqwest::Client, base_url: &str) -> Self {
        Self {
            client,
            endpoint: format!("{}/api/auth/get-session", base_url.trim_end_matches('/')),
        }
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct SessionEnvelope {
    session: SessionBody,
    user: UserBody,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct SessionBody {
    #[serde(default)]
    active_organization_id: Option<String>,
}

#[derive(Deserialize)]
struct UserBody {
    id: String,
}

#[async_trait]
impl SessionLookup for HttpSessionLookup {
    async fn lookup(&self, headers: &Headers) -> Result<Option<Session>, SessionError> {
        let mut identity = headers.identity().peekable();
        if identity.peek().is_none() {
            return Ok(None);
        }

        let mut request = self
            .client
            .get(&self.endpoint)
            .timeout(Duration::from_secs(10));
        for (name, value) in identity {
            request = request.header(name, value);
        }

        let response = request.send().await?;
        match response.status().as_u16() {
            401 | 403 => return Ok(None),
            s if !(200..300).contains(&s) => return Err(SessionError::Status { status: s }),
            _ => {}
        }

        let envelope: Option<SessionEnvelope> = response.json().await?;
        Ok(envelope.map(|env| Session {
            user_id: env.user.id,
            active_organization_id: env.session.active_organization_id,
        }))
    }
}

/// Grants every request the same local session. Used when no auth service
/// is configured.
pub struct DevSessionLookup {
    session: Session,
}

impl DevSessionLookup {
    pub fn new(user_id: impl Into<String>) -> Self {
        Self {
            session: Session {
                user_id: user_id.into(),
                active_organization_id: None,
            },
        }
    }
}

#[async_trait]
impl SessionLookup for DevSessionLookup {
    async fn lookup(&self, _headers: &Headers) -> Result<Option<Session>, SessionError> {
        Ok(Some(self.session.clone()))
    }
}

/// Rejects requests under `prefix` that carry no valid session and stores
/// the resolved [`Session`] in the request extensions.
pub struct SessionMiddleware {
    lookup: Arc<dyn SessionLookup>,
    prefix: String,
}

impl SessionMiddleware {
    pub fn new(lookup: Arc<dyn SessionLookup>, prefix: impl Into<String>) -> Self {
        Self {
            lookup,
            prefix: prefix.into(),
        }
    }
}

impl Middleware for SessionMiddleware {
    fn handle(&self, mut ctx: Context, next: Next) -> Pin<Box<dyn Future<Output = Response> + Send>> {
        let lookup = Arc::clone(&self.lookup);
        let protected = ctx.request().path().starts_with(&self.prefix);

        Box::pin(async move {
            if !protected {
                return next.run(ctx).await;
            }
            let resolved = lookup.lookup(ctx.request().headers()).await;
            match resolved {
                Ok(Some(session)) => {
                    tracing::debug!(user = %session.user_id, "session resolved");
                    ctx.extensions_mut().insert(session);
                    next.run(ctx).await
                }
                Ok(None) => Response::json(
                    StatusCode::Unauthorized,
                    &serde_json::json!({ "error": "Unauthorized" }),
                ),
                Err(e) => {
                    tracing::error!(error = %e, "session lookup failed");
                    Response::error(
                        StatusCode::ServiceUnavailable,
                        "Session lookup failed",
                        e.to_string(),
                    )
                }
            }
        })
    }
}
