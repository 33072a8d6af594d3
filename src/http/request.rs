//! HTTP/1.1 request parsing using the [`httparse`] crate.

use std::collections::HashMap;

use bytes::Bytes;
use serde::de::DeserializeOwned;
use thiserror::Error;

use super::{Headers, Method};

/// Errors that can occur while parsing an HTTP/1.1 request.
#[derive(Debug, Error)]
pub enum RequestError {
    #[error("request is incomplete, more data needed")]
    Incomplete,

    #[error("HTTP parse error: {0}")]
    Parse(#[from] httparse::Error),

    #[error("missing required field: {field}")]
    MissingField { field: &'static str },

    #[error("invalid Content-Length header")]
    InvalidContentLength,

    #[error("request body exceeds maximum allowed size of {max_bytes} bytes")]
    BodyTooLarge { max_bytes: usize },
}

/// The request line and headers of a request whose body may not have fully
/// arrived yet.
#[derive(Debug)]
pub struct RequestHead {
    request: Request,
    body_offset: usize,
    content_length: usize,
}

impl RequestHead {
    /// Byte offset in the read buffer at which the body starts.
    pub fn body_offset(&self) -> usize {
        self.body_offset
    }

    /// Total number of buffered bytes the complete request occupies.
    pub fn total_len(&self) -> usize {
        self.body_offset + self.content_length
    }

    /// Attaches the body (exactly `Content-Length` bytes) and yields the request.
    pub fn into_request(mut self, body: Bytes) -> Request {
        self.request.body = body;
        self.request
    }
}

/// A fully parsed HTTP/1.1 request.
///
/// # Examples
///
/// ```
/// use chatrelay::http::request::Request;
///
/// let raw = b"GET /api/generatethreadname?threadId=t1 HTTP/1.1\r\nHost: localhost\r\n\r\n";
/// let request = Request::parse(raw).unwrap();
///
/// assert_eq!(request.method().as_str(), "GET");
/// assert_eq!(request.path(), "/api/generatethreadname");
/// assert_eq!(request.query_param("threadId"), Some("t1"));
/// assert_eq!(request.headers().get("host"), Some("localhost"));
/// ```
#[derive(Debug)]
pub struct Request {
    method: Method,
    path: String,
    /// HTTP minor version: 0 for HTTP/1.0, 1 for HTTP/1.1.
    version: u8,
    headers: Headers,
    query: Option<String>,
    body: Bytes,
    params: HashMap<String, String>,
}

impl Request {
    /// Maximum number of headers we support per request.
    const MAX_HEADERS: usize = 64;

    /// Parses the request line and headers out of `buf`.
    ///
    /// The returned [`RequestHead`] knows how many bytes the full request
    /// needs; the caller waits for them and then calls
    /// [`RequestHead::into_request`].
    ///
    /// # Errors
    ///
    /// - [`RequestError::Incomplete`]: the header block has not fully arrived.
    /// - [`RequestError::Parse`]: the data is malformed.
    /// - [`RequestError::BodyTooLarge`]: `Content-Length` exceeds `max_body`.
    pub fn parse_head(buf: &[u8], max_body: usize) -> Result<RequestHead, RequestError> {
        let mut headers = [httparse::EMPTY_HEADER; Self::MAX_HEADERS];
        let mut raw_req = httparse::Request::new(&mut headers);

        let body_offset = match raw_req.parse(buf)? {
            httparse::Status::Complete(offset) => offset,
            httparse::Status::Partial => return Err(RequestError::Incomplete),
        };

        let Ok(method) = raw_req
            .method
            .ok_or(RequestError::MissingField { field: "method" })?
            .parse::<Method>();

        let raw_path = raw_req
            .path
            .ok_or(RequestError::MissingField { field: "path" })?;

        let (path, query) = match raw_path.split_once('?') {
            Some((path, query)) => (path.to_owned(), Some(query.to_owned())),
            None => (raw_path.to_owned(), None),
        };

        let version = raw_req
            .version
            .ok_or(RequestError::MissingField { field: "version" })?;

        let mut header_map = Headers::with_capacity(raw_req.headers.len());
        for header in raw_req.headers.iter() {
            if let Ok(value) = std::str::from_utf8(header.value) {
                header_map.insert(header.name, value);
            }
        }

        let content_length = match header_map.get("content-length") {
            Some(raw) => raw
                .trim()
                .parse::<usize>()
                .map_err(|_| RequestError::InvalidContentLength)?,
            None => 0,
        };
        if content_length > max_body {
            return Err(RequestError::BodyTooLarge {
                max_bytes: max_body,
            });
        }

        let params = query.as_deref().map(parse_query_string).unwrap_or_default();

        Ok(RequestHead {
            request: Self {
                method,
                path,
                version,
                headers: header_map,
                query,
                body: Bytes::new(),
                params,
            },
            body_offset,
            content_length,
        })
    }

    /// Parses a complete request held entirely in `buf`.
    ///
    /// Convenience for tests and one-shot callers; bytes past `Content-Length`
    /// are ignored.
    pub fn parse(buf: &[u8]) -> Result<Self, RequestError> {
        let head = Self::parse_head(buf, usize::MAX)?;
        if buf.len() < head.total_len() {
            return Err(RequestError::Incomplete);
        }
        let body = Bytes::copy_from_slice(&buf[head.body_offset()..head.total_len()]);
        Ok(head.into_request(body))
    }

    /// Returns the HTTP method.
    pub fn method(&self) -> &Method {
        &self.method
    }

    /// Returns the request path (without the query string).
    pub fn path(&self) -> &str {
        &self.path
    }

    /// Returns the HTTP minor version number (0 = HTTP/1.0, 1 = HTTP/1.1).
    pub fn version(&self) -> u8 {
        self.version
    }

    /// Returns the request headers.
    pub fn headers(&self) -> &Headers {
        &self.headers
    }

    /// Returns the raw query string (without the leading `?`), if any.
    pub fn query_string(&self) -> Option<&str> {
        self.query.as_deref()
    }

    /// Returns a parsed query parameter value by key.
    pub fn query_param(&self, key: &str) -> Option<&str> {
        self.params.get(key).map(String::as_str)
    }

    /// Returns the request body bytes.
    pub fn body(&self) -> &Bytes {
        &self.body
    }

    /// Deserializes the body as JSON.
    pub fn json<T: DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        serde_json::from_slice(&self.body)
    }

    /// Returns `true` if the connection should be kept alive after this request.
    ///
    /// HTTP/1.1 defaults to keep-alive. HTTP/1.0 defaults to close unless
    /// `Connection: keep-alive` is explicitly set.
    pub fn is_keep_alive(&self) -> bool {
        match self.headers.get("connection") {
            Some(conn) => conn.eq_ignore_ascii_case("keep-alive"),
            None => self.version == 1,
        }
    }
}

/// Parses a URL query string (`key=value&key2=value2`) into a `HashMap`.
///
/// `+` decodes to a space; percent-escapes are left as-is since thread and
/// model identifiers never carry them.
fn parse_query_string(query: &str) -> HashMap<String, String> {
    query
        .split('&')
        .filter(|pair| !pair.is_empty())
        .map(|pair| {
            let (key, value) = pair.split_once('=').unwrap_or((pair, ""));
            (key.replace('+', " "), value.replace('+', " "))
        })
        .collect()
}
