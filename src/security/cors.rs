//! Cross-Origin Resource Sharing for the browser client.

use std::pin::Pin;

use crate::{
    Method, Response, StatusCode,
    context::Context,
    middleware::{Middleware, Next},
};

/// CORS middleware. Answers preflight requests itself and adds the
/// `Access-Control-*` headers to every other response.
///
/// - No `Origin`, or an origin outside the allow-list: the request passes
///   through unmodified.
/// - `OPTIONS` preflight: short-circuited with `204 No Content`; the session
///   check and the handler never run.
/// - Anything else: the handler runs and the CORS headers are appended.
///
/// An origin named in the allow-list is echoed back with `Vary: Origin` and
/// `Access-Control-Allow-Credentials: true`, so the browser sends the session
/// cookie along. Browsers never send credentials to a `*` origin; with the
/// wildcard only callers passing `Authorization` can sign in cross-origin.
///
/// `X-Request-Id` is exposed so the browser can correlate a failed stream
/// with server logs.
///
/// # Examples
///
/// ```rust
/// use chatrelay::security::CorsMiddleware;
///
/// let cors = CorsMiddleware::new(["https://chat.example.com"]);
/// let open = CorsMiddleware::new(["*"]);
/// ```
pub struct CorsMiddleware {
    allowed_origins: Vec<String>,
    allowed_methods: String,
    allowed_headers: String,
}

impl CorsMiddleware {
    pub fn new<I, S>(origins: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            allowed_origins: origins.into_iter().map(Into::into).collect(),
            allowed_methods: "GET, POST, OPTIONS".to_owned(),
            allowed_headers: "Content-Type, Authorization".to_owned(),
        }
    }

    fn resolve_origin(&self, origin: &str) -> Option<String> {
        if self.allowed_origins.iter().any(|o| o == "*") {
            Some("*".to_owned())
        } else if self.allowed_origins.iter().any(|o| o == origin) {
            Some(origin.to_owned())
        } else {
            None
        }
    }
}

impl Middleware for CorsMiddleware {
    fn handle(&self, ctx: Context, next: Next) -> Pin<Box<dyn Future<Output = Response> + Send>> {
        let allow_origin = ctx
            .request()
            .headers()
            .get("origin")
            .and_then(|origin| self.resolve_origin(origin));
        let methods = self.allowed_methods.clone();
        let headers = self.allowed_headers.clone();

        Box::pin(async move {
            let Some(allow_origin) = allow_origin else {
                return next.run(ctx).await;
            };
            let specific = allow_origin != "*";

            let mut resp = if ctx.request().method() == &Method::Options {
                Response::new(StatusCode::NoContent).header("Access-Control-Max-Age", "3600")
            } else {
                next.run(ctx).await
            };
            resp.add_header("Access-Control-Allow-Origin", allow_origin);
            resp.add_header("Access-Control-Allow-Methods", methods);
            resp.add_header("Access-Control-Allow-Headers", headers);
            resp.add_header("Access-Control-Expose-Headers", "X-Request-Id");
            if specific {
                resp.add_header("Access-Control-Allow-Credentials", "true");
                resp.add_header("Vary", "Origin");
            }
            resp
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::middleware::Pipeline;
    use crate::{Request, Router};

    fn service(origins: &[&str]) -> crate::middleware::Service {
        let mut router = Router::new();
        router.post("/api/chat", |_ctx| async { Response::new(StatusCode::Ok) });
        Pipeline::new(router)
            .layer(CorsMiddleware::new(origins.iter().copied()))
            .into_service()
    }

    fn request(method: &str, origin: Option<&str>) -> Request {
        let origin = origin
            .map(|o| format!("Origin: {o}\r\n"))
            .unwrap_or_default();
        Request::parse(format!("{method} /api/chat HTTP/1.1\r\n{origin}\r\n").as_bytes()).unwrap()
    }

    #[tokio::test]
    async fn preflight_short_circuits() {
        let res = service(&["https://app.test"])
            .call(request("OPTIONS", Some("https://app.test")))
            .await;
        assert_eq!(res.status(), StatusCode::NoContent);
        assert_eq!(
            res.headers().get("access-control-allow-origin"),
            Some("https://app.test")
        );
        assert_eq!(res.headers().get("vary"), Some("Origin"));
        assert_eq!(
            res.headers().get("access-control-allow-credentials"),
            Some("true")
        );
    }

    #[tokio::test]
    async fn wildcard_has_no_vary() {
        let res = service(&["*"]).call(request("POST", Some("https://any.test"))).await;
        assert_eq!(res.status(), StatusCode::Ok);
        assert_eq!(res.headers().get("access-control-allow-origin"), Some("*"));
        assert!(!res.headers().contains("vary"));
        assert!(!res.headers().contains("access-control-allow-credentials"));
    }

    #[tokio::test]
    async fn unknown_origin_passes_through_undecorated() {
        let res = service(&["https://app.test"])
            .call(request("POST", Some("https://evil.test")))
            .await;
        assert_eq!(res.status(), StatusCode::Ok);
        assert!(!res.headers().contains("access-control-allow-origin"));
    }

    #[tokio::test]
    async fn no_origin_passes_through() {
        let res = service(&["*"]).call(request("POST", None)).await;
        assert!(!res.headers().contains("access-control-allow-origin"));
    }
}
