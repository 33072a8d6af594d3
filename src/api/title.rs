//! `GET /api/generatethreadname?threadId=…`
//!
//! Names a thread after its first exchange. Only a thread still called
//! [`DEFAULT_THREAD_NAME`] holding exactly one question and one answer is
//! renamed; any other thread is reported as not found.

use std::sync::Arc;

use futures::StreamExt;
use thiserror::Error;
use tracing::{debug, info, warn};

use super::AppState;
use crate::context::Context;
use crate::database::{DEFAULT_THREAD_NAME, StoreError};
use crate::llm::{ChatMessage, NormalizeOptions, ProxyError, UpstreamRequest, normalize};
use crate::{Response, StatusCode};

const TITLE_PROMPT: &str = "You are a thread title generator. Summarize the message in a short, catchy title (3-5 words). No punctuation. No markdown.";

#[derive(Debug, Error)]
pub enum TitleError {
    #[error("thread not found or already named")]
    NotEligible,

    #[error("the model returned an empty title")]
    EmptyTitle,

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Upstream(#[from] ProxyError),
}

pub async fn handle(ctx: Context, state: Arc<AppState>) -> Response {
    let Some(thread_id) = ctx.request().query_param("threadId").filter(|id| !id.is_empty()) else {
        return Response::error(StatusCode::BadRequest, "Missing threadId", "threadId query parameter is required");
    };

    debug!(
        user = ctx.session().map(|s| s.user_id.as_str()).unwrap_or("-"),
        thread = thread_id,
        "title requested"
    );

    match generate_title(thread_id, &state).await {
        Ok(name) => Response::json(StatusCode::Ok, &serde_json::json!({ "name": name })),
        Err(TitleError::NotEligible) => Response::json(
            StatusCode::NotFound,
            &serde_json::json!({ "error": "Thread not found or not New Chat" }),
        ),
        Err(TitleError::Upstream(e)) => {
            warn!(thread = thread_id, error = %e, "title generation failed");
            e.into_response()
        }
        Err(e) => {
            warn!(thread = thread_id, error = %e, "title generation failed");
            Response::error(StatusCode::BadGateway, "Title generation failed", e.to_string())
        }
    }
}

/// Generates a title for `thread_id`, stores it and returns it.
pub async fn generate_title(thread_id: &str, state: &AppState) -> Result<String, TitleError> {
    let thread = state
        .messages
        .find_thread(thread_id)
        .await?
        .filter(|t| t.name == DEFAULT_THREAD_NAME && t.messages.len() == 2)
        .ok_or(TitleError::NotEligible)?;

    let provider = state.titles.provider;
    let adapter = state.providers.get(provider)?;
    let request = UpstreamRequest {
        model: state.titles.model.clone(),
        messages: vec![ChatMessage::user(format!(
            "{TITLE_PROMPT}\n\nMessage: {}",
            thread.messages[0].text
        ))],
        credential: state.credentials.get(provider).cloned(),
        features: Vec::new(),
    };
    let reply = adapter.send(&request).await?;

    let mut stream = normalize(
        reply.body,
        reply.framing,
        NormalizeOptions {
            model: request.model,
            idle_timeout: state.idle_timeout,
        },
    );
    let mut raw = String::new();
    while let Some(item) = stream.next().await {
        raw.push_str(item?.text());
    }

    let title = clean_title(&raw);
    if title.is_empty() {
        return Err(TitleError::EmptyTitle);
    }
    state.messages.rename_thread(&thread.id, &title).await?;
    info!(thread = %thread.id, title = %title, "thread renamed");
    Ok(title)
}

/// Strips the markdown, quotes and punctuation models add despite being told
/// not to, and collapses whitespace.
fn clean_title(raw: &str) -> String {
    raw.split_whitespace()
        .map(|word| {
            word.trim_matches(|c: char| !c.is_alphanumeric() && c != '\'' && c != '-')
                .trim_matches('\'')
        })
        .filter(|word| !word.is_empty())
        .collect::<Vec<_>>()
        .join(" ")
}
