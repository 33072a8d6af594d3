//! Model listing and the health probe.

use std::sync::Arc;

use serde_json::json;

use super::AppState;
use crate::context::Context;
use crate::llm::{ModelSpec, Provider, malformed_events_total};
use crate::{Response, StatusCode};

pub async fn list(_ctx: Context, state: Arc<AppState>) -> Response {
    let models: Vec<&ModelSpec> = state.catalog.iter().collect();
    Response::json(StatusCode::Ok, &json!({ "models": models }))
}

pub async fn by_provider(ctx: Context, state: Arc<AppState>) -> Response {
    let name = ctx.params().get("provider").unwrap_or_default();
    let Ok(provider) = name.parse::<Provider>() else {
        return Response::error(
            StatusCode::NotFound,
            "Unsupported provider",
            format!("unknown provider '{name}'"),
        );
    };
    let models: Vec<&ModelSpec> = state.catalog.for_provider(provider).collect();
    Response::json(StatusCode::Ok, &json!({ "provider": provider, "models": models }))
}

pub async fn health(_ctx: Context) -> Response {
    Response::json(
        StatusCode::Ok,
        &json!({ "status": "ok", "malformed_events": malformed_events_total() }),
    )
}
