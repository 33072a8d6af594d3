//! Request routing. Maps URL patterns and HTTP methods to handler functions.
//!
//! Two pattern styles are supported:
//!
//! | Pattern              | Example match              | Captured params              |
//! |----------------------|----------------------------|------------------------------|
//! | `/api/chat`          | `/api/chat`                | *(none)*                     |
//! | `/api/threads/:id`   | `/api/threads/42`          | `id → "42"`                  |
//!
//! Trailing slashes are normalized on both patterns and incoming paths.
//! Routes are matched in registration order; the first route whose method and
//! pattern both match wins. A path that matches under a different method gets
//! `405`, an unknown path gets `404`; both answer with the JSON error body.

use std::pin::Pin;
use std::sync::Arc;

use crate::context::{Context, PathParams};
use crate::{Method, Response, StatusCode};

/// Type-erased, heap-allocated async handler.
pub type Handler =
    Arc<dyn Fn(Context) -> Pin<Box<dyn Future<Output = Response> + Send>> + Send + Sync + 'static>;

/// Conversion trait for async handler functions.
///
/// Any `Fn(Context) -> impl Future<Output = Response> + Send` that is also
/// `Send + Sync + 'static` implements this trait via the blanket impl below.
pub trait IntoHandler: Send + Sync + 'static {
    fn call(&self, ctx: Context) -> Pin<Box<dyn Future<Output = Response> + Send>>;
}

impl<T, F> IntoHandler for T
where
    T: Fn(Context) -> F + Send + Sync + 'static,
    F: Future<Output = Response> + Send + 'static,
{
    fn call(&self, ctx: Context) -> Pin<Box<dyn Future<Output = Response> + Send>> {
        Box::pin((self)(ctx))
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Segment {
    Static(String),
    Parameter(String),
}

// Compiled representation of a route pattern string.
#[derive(Debug, Clone)]
enum Pattern {
    Exact(String),
    Parameterized(Vec<Segment>),
}

fn trim_trailing_slash(path: &str) -> &str {
    if path != "/" && path.ends_with('/') {
        &path[..path.len() - 1]
    } else {
        path
    }
}

impl Pattern {
    fn parse(pattern: &str) -> Self {
        let pattern = trim_trailing_slash(pattern);

        if !pattern.contains(':') {
            return Pattern::Exact(pattern.to_string());
        }

        let segments = pattern
            .split('/')
            .filter(|s| !s.is_empty())
            .map(|s| match s.strip_prefix(':') {
                Some(name) => Segment::Parameter(name.to_string()),
                None => Segment::Static(s.to_string()),
            })
            .collect();
        Pattern::Parameterized(segments)
    }

    fn matches(&self, path: &str) -> Option<PathParams> {
        let path = trim_trailing_slash(path);

        match self {
            Pattern::Exact(p) => (p == path).then(PathParams::new),
            Pattern::Parameterized(segments) => {
                let path_segments: Vec<&str> = path.split('/').filter(|s| !s.is_empty()).collect();
                if segments.len() != path_segments.len() {
                    return None;
                }

                let mut params = PathParams::new();
                for (seg, path_seg) in segments.iter().zip(path_segments) {
                    match seg {
                        Segment::Static(s) if s != path_seg => return None,
                        Segment::Static(_) => {}
                        Segment::Parameter(name) => {
                            params.insert(name.clone(), path_seg.to_string());
                        }
                    }
                }
                Some(params)
            }
        }
    }
}

struct Route {
    method: Method,
    pattern: Pattern,
    handler: Handler,
}

/// HTTP request router; the innermost layer of a
/// [`Pipeline`](crate::middleware::Pipeline).
///
/// # Examples
///
/// ```rust,no_run
/// use chatrelay::{Router, Response, StatusCode};
///
/// let mut router = Router::new();
/// router.get("/health", |_ctx| async { Response::new(StatusCode::Ok) });
/// router.post("/api/chat", |_ctx| async { Response::new(StatusCode::Ok) });
/// assert_eq!(router.len(), 2);
/// ```
#[derive(Default)]
pub struct Router {
    routes: Vec<Route>,
}

impl Router {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler for `GET` requests matching `path`.
    pub fn get(&mut self, path: &str, handler: impl IntoHandler) {
        self.add_route(Method::Get, path, handler);
    }

    /// Register a handler for `POST` requests matching `path`.
    pub fn post(&mut self, path: &str, handler: impl IntoHandler) {
        self.add_route(Method::Post, path, handler);
    }

    fn add_route(&mut self, method: Method, path: &str, handler: impl IntoHandler) {
        let handler: Handler = Arc::new(move |ctx| handler.call(ctx));
        self.routes.push(Route {
            method,
            pattern: Pattern::parse(path),
            handler,
        });
    }

    pub fn len(&self) -> usize {
        self.routes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }

    /// Dispatch `ctx` to the first matching route and return its response.
    pub async fn route(&self, mut ctx: Context) -> Response {
        let mut path_known = false;

        for route in &self.routes {
            let Some(params) = route.pattern.matches(ctx.request().path()) else {
                continue;
            };
            if &route.method != ctx.request().method() {
                path_known = true;
                continue;
            }
            ctx.set_params(params);
            return (route.handler)(ctx).await;
        }

        if path_known {
            Response::error(
                StatusCode::MethodNotAllowed,
                "Method not allowed",
                format!("{} {}", ctx.request().method(), ctx.request().path()),
            )
        } else {
            Response::error(StatusCode::NotFound, "Not found", ctx.request().path())
        }
    }
}
