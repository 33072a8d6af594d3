//! HTTP/1.1 response builder.
//!
//! A [`Response`] carries either a fully buffered body, written with
//! `Content-Length`, or a [`BodyStream`] that the server writes with
//! `Transfer-Encoding: chunked`, flushing after every chunk.

use std::fmt;
use std::io;
use std::pin::Pin;

use bytes::{BufMut, Bytes, BytesMut};
use futures::Stream;
use serde::Serialize;

use super::{Headers, StatusCode};

/// A streaming response body.
///
/// Each `Ok` item is written as one chunk. An `Err` item aborts the response:
/// the connection is closed without the terminating zero-length chunk so the
/// client can tell an error apart from a clean end.
pub type BodyStream = Pin<Box<dyn Stream<Item = Result<Bytes, io::Error>> + Send>>;

/// Response payload.
pub enum Body {
    Full(Vec<u8>),
    Stream(BodyStream),
}

impl fmt::Debug for Body {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Full(bytes) => f.debug_tuple("Full").field(&bytes.len()).finish(),
            Self::Stream(_) => f.write_str("Stream(..)"),
        }
    }
}

/// An HTTP/1.1 response, ready to be serialized and sent.
///
/// # Examples
///
/// ```
/// use chatrelay::http::{Response, StatusCode};
///
/// let response = Response::json(StatusCode::Ok, &serde_json::json!({"status": "ok"}));
///
/// let bytes = response.into_bytes();
/// let text = std::str::from_utf8(&bytes).unwrap();
/// assert!(text.starts_with("HTTP/1.1 200 OK\r\n"));
/// assert!(text.contains("Content-Type: application/json\r\n"));
/// assert!(text.ends_with(r#"{"status":"ok"}"#));
/// ```
#[derive(Debug)]
pub struct Response {
    status: StatusCode,
    headers: Headers,
    body: Body,
    keep_alive: bool,
}

impl Response {
    /// Creates a new response with the given status and an empty body.
    pub fn new(status: StatusCode) -> Self {
        Self {
            status,
            headers: Headers::new(),
            body: Body::Full(Vec::new()),
            keep_alive: true,
        }
    }

    /// Serializes `value` as the JSON body.
    pub fn json<T: Serialize + ?Sized>(status: StatusCode, value: &T) -> Self {
        match serde_json::to_vec(value) {
            Ok(body) => Self::new(status)
                .header("Content-Type", "application/json")
                .body_bytes(body),
            Err(e) => {
                tracing::error!(error = %e, "failed to serialize JSON response");
                Self::new(StatusCode::InternalServerError)
            }
        }
    }

    /// The `{error, details}` body every failing endpoint answers with.
    pub fn error(status: StatusCode, error: impl Into<String>, details: impl Into<String>) -> Self {
        Self::json(
            status,
            &serde_json::json!({ "error": error.into(), "details": details.into() }),
        )
    }

    /// A chunked streaming response.
    pub fn stream(status: StatusCode, body: BodyStream) -> Self {
        Self {
            status,
            headers: Headers::new(),
            body: Body::Stream(body),
            keep_alive: true,
        }
    }

    /// A `text/event-stream` response with proxy buffering disabled.
    pub fn sse(body: BodyStream) -> Self {
        Self::event_stream(body, "text/event-stream")
    }

    /// Like [`sse`](Self::sse) with an explicit content type, for bodies
    /// relayed as-is from another server.
    pub fn event_stream(body: BodyStream, content_type: impl Into<String>) -> Self {
        Self::stream(StatusCode::Ok, body)
            .header("Content-Type", content_type)
            .header("Cache-Control", "no-cache")
            .header("X-Accel-Buffering", "no")
    }

    /// Appends a response header. Multiple calls with the same name are additive.
    #[must_use]
    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name, value);
        self
    }

    /// Appends a header in-place. Intended for middleware that decorates a
    /// downstream response without consuming it.
    pub fn add_header(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.headers.insert(name, value);
    }

    /// Sets the response body from a string.
    #[must_use]
    pub fn body(mut self, body: impl Into<String>) -> Self {
        self.body = Body::Full(body.into().into_bytes());
        self
    }

    /// Sets the response body from raw bytes.
    #[must_use]
    pub fn body_bytes(mut self, body: impl Into<Vec<u8>>) -> Self {
        self.body = Body::Full(body.into());
        self
    }

    /// Controls whether the `Connection: keep-alive` or `Connection: close` header is written.
    #[must_use]
    pub fn keep_alive(mut self, keep_alive: bool) -> Self {
        self.keep_alive = keep_alive;
        self
    }

    pub fn status(&self) -> StatusCode {
        self.status
    }

    pub fn headers(&self) -> &Headers {
        &self.headers
    }

    /// Returns `true` when the body is a stream.
    pub fn is_streaming(&self) -> bool {
        matches!(self.body, Body::Stream(_))
    }

    /// Returns the `Connection` disposition requested for this response.
    pub fn is_keep_alive(&self) -> bool {
        self.keep_alive
    }

    /// Splits the response into its serialized head and its body.
    ///
    /// Automatically adds:
    /// - `Content-Type: text/plain; charset=utf-8` if a buffered body is
    ///   non-empty and no `Content-Type` header was set.
    /// - `Content-Length: <n>` for buffered bodies, `Transfer-Encoding: chunked`
    ///   for streams.
    /// - `Connection: keep-alive` or `Connection: close`.
    pub fn into_parts(mut self) -> (BytesMut, Body) {
        let framing = match &self.body {
            Body::Full(bytes) => {
                if !bytes.is_empty() && !self.headers.contains("content-type") {
                    self.headers
                        .insert("Content-Type", "text/plain; charset=utf-8");
                }
                ("Content-Length", bytes.len().to_string())
            }
            Body::Stream(_) => ("Transfer-Encoding", "chunked".to_owned()),
        };

        let connection = if self.keep_alive {
            "keep-alive"
        } else {
            "close"
        };
        self.headers.set("Connection", connection);

        let mut head = BytesMut::with_capacity(128 + self.headers.len() * 64);
        head.put(
            format!(
                "HTTP/1.1 {} {}\r\n",
                self.status.as_u16(),
                self.status.canonical_reason()
            )
            .as_bytes(),
        );
        for (name, value) in self.headers.iter() {
            head.put(format!("{name}: {value}\r\n").as_bytes());
        }
        // Framing header is always the last one before the blank line.
        head.put(format!("{}: {}\r\n", framing.0, framing.1).as_bytes());
        head.put(&b"\r\n"[..]);

        (head, self.body)
    }

    /// Serializes a buffered response into HTTP/1.1 wire format.
    ///
    /// For a streaming response only the head is returned; use
    /// [`into_parts`](Self::into_parts) to get at the body.
    pub fn into_bytes(self) -> BytesMut {
        let (mut head, body) = self.into_parts();
        if let Body::Full(bytes) = body {
            head.put(bytes.as_slice());
        }
        head
    }
}

impl Default for Response {
    fn default() -> Self {
        Self::new(StatusCode::Ok)
    }
}

/// Encodes one chunk of a `Transfer-Encoding: chunked` body.
pub fn encode_chunk(data: &[u8]) -> BytesMut {
    let mut buf = BytesMut::with_capacity(data.len() + 12);
    buf.put(format!("{:x}\r\n", data.len()).as_bytes());
    buf.put(data);
    buf.put(&b"\r\n"[..]);
    buf
}

/// The zero-length chunk that ends a chunked body.
pub const LAST_CHUNK: &[u8] = b"0\r\n\r\n";
