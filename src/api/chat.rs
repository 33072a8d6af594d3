//! `POST /api/chat`: validate, dispatch, stream.

use std::io;
use std::sync::Arc;

use futures::StreamExt;
use tracing::{debug, info, warn};

use super::AppState;
use crate::context::Context;
use crate::http::BodyStream;
use crate::llm::{
    ChatRequest, Emission, Finisher, Framing, NormalizeOptions, ProxyError, finish_on_success,
    normalize, validate,
};
use crate::{Response, StatusCode};

pub async fn handle(ctx: Context, state: Arc<AppState>) -> Response {
    let request: ChatRequest = match ctx.json() {
        Ok(request) => request,
        Err(e) => {
            return Response::error(StatusCode::BadRequest, "Invalid request body", e.to_string());
        }
    };

    let user = ctx.session().map(|s| s.user_id.as_str()).unwrap_or("-");
    debug!(user, thread = ?request.thread_id, "chat request received");

    match stream_chat(request, &state).await {
        Ok(response) => response,
        Err(e) => {
            warn!(
                request_id = ctx.request_id().unwrap_or("-"),
                user,
                error = %e,
                "chat request refused"
            );
            e.into_response()
        }
    }
}

/// Runs the pipeline up to the first upstream byte. Anything that fails
/// before that point is returned as an error; later failures end the stream.
pub async fn stream_chat(request: ChatRequest, state: &AppState) -> Result<Response, ProxyError> {
    let validated = validate(request, &state.catalog, &state.credentials)?;
    let adapter = state.providers.get(validated.provider)?;

    info!(
        provider = %validated.provider,
        model = %validated.upstream.model,
        turns = validated.upstream.messages.len(),
        features = ?validated.upstream.features,
        "proxying chat completion"
    );
    let reply = adapter.send(&validated.upstream).await?;

    let emissions = normalize(
        reply.body,
        reply.framing,
        NormalizeOptions {
            model: validated.upstream.model,
            idle_timeout: state.idle_timeout,
        },
    );
    let finisher = validated
        .thread_id
        .map(|thread| Finisher::new(Arc::clone(&state.messages), thread));
    let body: BodyStream = Box::pin(
        finish_on_success(emissions, finisher)
            .map(|item| item.map(Emission::into_bytes).map_err(io::Error::from)),
    );

    Ok(match reply.framing {
        Framing::Reframe(_) => Response::sse(body),
        Framing::Passthrough(_) => Response::event_stream(body, reply.content_type),
    })
}
