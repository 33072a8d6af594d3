//! Middleware pipeline: composable before/after request handler logic.
//!
//! ## Core types
//!
//! - [`Middleware`]: trait implemented by all middleware.
//! - [`Next`]: cursor into the remaining chain; call [`Next::run`] to advance.
//!   When the chain is exhausted the request reaches the [`Router`].
//! - [`Pipeline`]: an ordered middleware stack in front of a router.
//! - [`LoggerMiddleware`]: request id assignment and access logging.

use std::{future::Future, pin::Pin, sync::Arc};

use tokio::time::Instant;
use uuid::Uuid;

use crate::context::{Context, RequestId};
use crate::{Request, Response, Router};

/// A type-erased, reference-counted middleware function.
pub type MiddlewareHandler = Arc<
    dyn Fn(Context, Next) -> Pin<Box<dyn Future<Output = Response> + Send>> + Send + Sync + 'static,
>;

/// Converts a [`Middleware`] implementation into a [`MiddlewareHandler`].
pub fn from_middleware<M>(middleware: Arc<M>) -> MiddlewareHandler
where
    M: Middleware + 'static,
{
    Arc::new(move |ctx: Context, next: Next| middleware.handle(ctx, next))
}

/// A cursor into the remaining middleware chain for a single request.
///
/// `Next` is consumed by [`run`](Self::run), so a middleware can forward a
/// request at most once.
pub struct Next {
    middlewares: Arc<[MiddlewareHandler]>,
    endpoint: Arc<Router>,
    // Tracks which middleware to invoke on the next `run` call.
    index: usize,
}

impl Next {
    fn new(middlewares: Arc<[MiddlewareHandler]>, endpoint: Arc<Router>) -> Self {
        Self {
            middlewares,
            endpoint,
            index: 0,
        }
    }

    /// Invokes the next middleware, or the router once every layer has run.
    pub async fn run(mut self, ctx: Context) -> Response {
        if let Some(handler) = self.middlewares.get(self.index).cloned() {
            self.index += 1;
            handler(ctx, self).await
        } else {
            self.endpoint.route(ctx).await
        }
    }
}

/// The core trait for all middleware.
///
/// Implementors may pass through (`next.run(ctx).await`), short-circuit by
/// returning a response without calling `next`, or decorate the downstream
/// response.
pub trait Middleware: Send + Sync {
    fn handle(&self, ctx: Context, next: Next) -> Pin<Box<dyn Future<Output = Response> + Send>>;
}

/// An ordered middleware stack terminated by a [`Router`].
///
/// Layers run in the order they were added: the first layer sees the request
/// first and the response last.
///
/// # Examples
///
/// ```rust,no_run
/// use chatrelay::{Router, middleware::{LoggerMiddleware, Pipeline}};
///
/// let pipeline = Pipeline::new(Router::new()).layer(LoggerMiddleware);
/// ```
pub struct Pipeline {
    middlewares: Vec<MiddlewareHandler>,
    router: Arc<Router>,
}

impl Pipeline {
    pub fn new(router: Router) -> Self {
        Self {
            middlewares: Vec::new(),
            router: Arc::new(router),
        }
    }

    /// Appends a middleware layer.
    #[must_use]
    pub fn layer<M: Middleware + 'static>(mut self, middleware: M) -> Self {
        self.middlewares.push(from_middleware(Arc::new(middleware)));
        self
    }

    pub fn len(&self) -> usize {
        self.middlewares.len()
    }

    pub fn is_empty(&self) -> bool {
        self.middlewares.is_empty()
    }

    /// Freezes the layer list into a shareable request handler.
    pub fn into_service(self) -> Service {
        Service {
            middlewares: self.middlewares.into(),
            router: self.router,
        }
    }
}

/// A frozen [`Pipeline`], cheap to clone into every connection task.
#[derive(Clone)]
pub struct Service {
    middlewares: Arc<[MiddlewareHandler]>,
    router: Arc<Router>,
}

impl Service {
    /// Runs `request` through every layer and the router.
    pub async fn call(&self, request: Request) -> Response {
        let next = Next::new(Arc::clone(&self.middlewares), Arc::clone(&self.router));
        next.run(Context::new(request)).await
    }
}

/// Assigns a request id and logs `METHOD /path - STATUS (duration)` once the
/// downstream handler has produced its response.
///
/// For a streaming response the duration covers time to first byte, not the
/// whole stream.
pub struct LoggerMiddleware;

impl Middleware for LoggerMiddleware {
    fn handle(&self, mut ctx: Context, next: Next) -> Pin<Box<dyn Future<Output = Response> + Send>> {
        Box::pin(async move {
            let start = Instant::now();
            let request_id = ctx
                .request()
                .headers()
                .get("x-request-id")
                .map(str::to_owned)
                .unwrap_or_else(|| Uuid::new_v4().to_string());
            ctx.extensions_mut().insert(RequestId(request_id.clone()));
            let method = ctx.request().method().as_str().to_string();
            let path = ctx.request().path().to_string();

            let mut response = next.run(ctx).await;
            response.add_header("X-Request-Id", &request_id);

            let duration = start.elapsed();
            let status = response.status().as_u16();
            tracing::info!(
                request_id = %request_id,
                streaming = response.is_streaming(),
                "{} {} - {} ({:?})",
                method,
                path,
                status,
                duration
            );

            response
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::StatusCode;

    struct Deny;

    impl Middleware for Deny {
        fn handle(&self, _ctx: Context, _next: Next) -> Pin<Box<dyn Future<Output = Response> + Send>> {
            Box::pin(async { Response::new(StatusCode::Forbidden) })
        }
    }

    struct Tag(&'static str);

    impl Middleware for Tag {
        fn handle(&self, ctx: Context, next: Next) -> Pin<Box<dyn Future<Output = Response> + Send>> {
            let tag = self.0;
            Box::pin(async move {
                let mut res = next.run(ctx).await;
                res.add_header("X-Layer", tag);
                res
            })
        }
    }

    fn request(path: &str) -> Request {
        Request::parse(format!("GET {path} HTTP/1.1\r\n\r\n").as_bytes()).unwrap()
    }

    fn router() -> Router {
        let mut router = Router::new();
        router.get("/ok", |ctx: Context| async move {
            let id = ctx.request_id().unwrap_or("none").to_owned();
            Response::new(StatusCode::Ok).body(id)
        });
        router
    }

    #[tokio::test]
    async fn empty_pipeline_reaches_router() {
        let service = Pipeline::new(router()).into_service();
        let res = service.call(request("/ok")).await;
        assert_eq!(res.status(), StatusCode::Ok);
    }

    #[tokio::test]
    async fn short_circuit_skips_router() {
        let service = Pipeline::new(router()).layer(Deny).into_service();
        let res = service.call(request("/ok")).await;
        assert_eq!(res.status(), StatusCode::Forbidden);
    }

    #[tokio::test]
    async fn layers_decorate_in_reverse_order() {
        let service = Pipeline::new(router())
            .layer(Tag("outer"))
            .layer(Tag("inner"))
            .into_service();
        let res = service.call(request("/ok")).await;
        let tags: Vec<_> = res
            .headers()
            .iter()
            .filter(|(n, _)| *n == "X-Layer")
            .map(|(_, v)| v.to_owned())
            .collect();
        assert_eq!(tags, vec!["inner", "outer"]);
    }

    #[tokio::test]
    async fn logger_assigns_request_id() {
        let service = Pipeline::new(router()).layer(LoggerMiddleware).into_service();
        let res = service.call(request("/ok")).await;
        let header = res.headers().get("x-request-id").unwrap().to_owned();
        assert!(res.into_bytes().ends_with(header.as_bytes()));
    }

    #[tokio::test]
    async fn logger_honours_incoming_request_id() {
        let service = Pipeline::new(router()).layer(LoggerMiddleware).into_service();
        let req = Request::parse(b"GET /ok HTTP/1.1\r\nX-Request-Id: abc\r\n\r\n").unwrap();
        let res = service.call(req).await;
        assert_eq!(res.headers().get("x-request-id"), Some("abc"));
    }
}
