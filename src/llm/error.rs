use std::io;
use std::time::Duration;

use thiserror::Error;

use super::catalog::Provider;
use super::validate::ValidationError;
use crate::{Response, StatusCode};

/// Everything that can go wrong between accepting a chat request and
/// finishing its stream.
#[derive(Debug, Error)]
pub enum ProxyError {
    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error("no adapter registered for provider '{0}'")]
    MissingAdapter(Provider),

    #[error("upstream answered {status}")]
    UpstreamStatus { status: u16, body: String },

    #[error("upstream request failed: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("upstream stream failed: {0}")]
    StreamRead(#[source] io::Error),

    #[error("upstream sent nothing for {0:?}")]
    IdleTimeout(Duration),
}

impl ProxyError {
    /// Status reported to the client when the error happens before any
    /// byte of the stream was sent.
    pub fn status(&self) -> StatusCode {
        match self {
            ProxyError::Validation(_) | ProxyError::MissingAdapter(_) => StatusCode::BadRequest,
            ProxyError::UpstreamStatus { status, .. } => StatusCode::from_u16(*status)
                .filter(|s| s.is_client_error())
                .unwrap_or(StatusCode::BadRequest),
            ProxyError::Transport(_) | ProxyError::StreamRead(_) => StatusCode::BadGateway,
            ProxyError::IdleTimeout(_) => StatusCode::GatewayTimeout,
        }
    }

    pub fn into_response(self) -> Response {
        let status = self.status();
        match self {
            ProxyError::Validation(e) => Response::error(status, e.summary(), e.to_string()),
            ProxyError::MissingAdapter(p) => {
                Response::error(status, "Unsupported provider", format!("no adapter for {p}"))
            }
            ProxyError::UpstreamStatus { body, .. } => {
                Response::error(status, "Upstream request failed", body)
            }
            other => Response::error(status, "Upstream unavailable", other.to_string()),
        }
    }
}

impl From<ProxyError> for io::Error {
    fn from(err: ProxyError) -> Self {
        match err {
            ProxyError::StreamRead(e) => e,
            ProxyError::IdleTimeout(_) => io::Error::new(io::ErrorKind::TimedOut, err),
            other => io::Error::other(other),
        }
    }
}
