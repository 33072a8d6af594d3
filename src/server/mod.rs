//! Async TCP server using Tokio.
//!
//! Accepts TCP connections and dispatches HTTP/1.1 requests to a handler
//! function. Connections are persistent by default. Streaming responses are
//! written with chunked transfer encoding; while a stream is being written the
//! server keeps reading the socket, and a client that hangs up causes the body
//! stream (and whatever upstream connection it owns) to be dropped at once.

use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;

use bytes::BytesMut;
use futures::StreamExt;
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, error, info, warn};

use crate::http::{
    Body, BodyStream, StatusCode,
    request::{Request, RequestError},
    response::{LAST_CHUNK, Response, encode_chunk},
};

/// Errors produced by the server.
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to bind to {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },
}

/// Default cap on a request body (8 MiB).
pub const DEFAULT_MAX_REQUEST_BYTES: usize = 8 * 1024 * 1024;

/// Header blocks larger than this are rejected before they finish arriving.
const MAX_HEAD_BYTES: usize = 64 * 1024;

/// Initial read buffer capacity per connection.
const INITIAL_BUF_SIZE: usize = 4096;

/// The HTTP server.
///
/// # Examples
///
/// ```rust,no_run
/// use chatrelay::server::Server;
/// use chatrelay::http::{Request, Response, StatusCode};
///
/// #[tokio::main]
/// async fn main() -> Result<(), Box<dyn std::error::Error>> {
///     let server = Server::bind("127.0.0.1:8080").await?;
///     server.run(|_req: Request| async {
///         Response::new(StatusCode::Ok).body("ok")
///     }).await?;
///     Ok(())
/// }
/// ```
pub struct Server {
    listener: TcpListener,
    local_addr: SocketAddr,
    max_request_bytes: usize,
}

impl Server {
    /// Binds the server to the given TCP address.
    ///
    /// # Errors
    ///
    /// Returns [`ServerError::Bind`] if the address cannot be bound.
    pub async fn bind(addr: impl AsRef<str>) -> Result<Self, ServerError> {
        let addr = addr.as_ref();
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| ServerError::Bind {
                addr: addr.to_owned(),
                source: e,
            })?;
        let local_addr = listener.local_addr()?;
        Ok(Self {
            listener,
            local_addr,
            max_request_bytes: DEFAULT_MAX_REQUEST_BYTES,
        })
    }

    /// Overrides the request body cap; larger bodies are answered with `413`.
    #[must_use]
    pub fn max_request_bytes(mut self, max: usize) -> Self {
        self.max_request_bytes = max;
        self
    }

    /// Returns the local address the server is bound to.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Accepts connections forever, dispatching requests to `handler`.
    ///
    /// # Errors
    ///
    /// Returns [`ServerError::Io`] if the TCP listener itself fails.
    pub async fn run<H, F>(self, handler: H) -> Result<(), ServerError>
    where
        H: Fn(Request) -> F + Send + Sync + 'static,
        F: Future<Output = Response> + Send + 'static,
    {
        self.run_until(handler, std::future::pending()).await
    }

    /// Like [`run`](Self::run), but stops accepting once `shutdown` resolves.
    ///
    /// Connections already accepted keep running on their own tasks.
    pub async fn run_until<H, F, S>(self, handler: H, shutdown: S) -> Result<(), ServerError>
    where
        H: Fn(Request) -> F + Send + Sync + 'static,
        F: Future<Output = Response> + Send + 'static,
        S: Future<Output = ()>,
    {
        let handler = Arc::new(handler);
        let max_request_bytes = self.max_request_bytes;
        info!(address = %self.local_addr, "chatrelay listening");

        tokio::pin!(shutdown);
        loop {
            let accepted = tokio::select! {
                accepted = self.listener.accept() => accepted,
                () = &mut shutdown => {
                    info!("shutdown requested, no longer accepting connections");
                    return Ok(());
                }
            };

            let (stream, peer_addr) = match accepted {
                Ok(pair) => pair,
                Err(e) => {
                    error!(error = %e, "failed to accept connection");
                    continue;
                }
            };

            debug!(peer = %peer_addr, "connection accepted");
            let handler = Arc::clone(&handler);

            tokio::spawn(async move {
                if let Err(e) =
                    handle_connection(stream, peer_addr, handler, max_request_bytes).await
                {
                    warn!(peer = %peer_addr, error = %e, "connection closed with error");
                }
            });
        }
    }
}

/// How a streamed body ended.
#[derive(Debug, PartialEq, Eq)]
enum StreamEnd {
    /// Body exhausted; terminator written, connection reusable.
    Completed,
    /// Body yielded an error; connection must close without terminator.
    Aborted,
    /// Client hung up mid-stream.
    ClientGone,
    /// Client kept sending past the read limit while the body was streaming.
    Overrun,
}

/// Handles a single TCP connection over its lifetime.
async fn handle_connection<H, F>(
    mut stream: TcpStream,
    peer_addr: SocketAddr,
    handler: Arc<H>,
    max_request_bytes: usize,
) -> io::Result<()>
where
    H: Fn(Request) -> F + Send + Sync + 'static,
    F: Future<Output = Response> + Send + 'static,
{
    let mut buf = BytesMut::with_capacity(INITIAL_BUF_SIZE);

    loop {
        // Pipelined requests may already be buffered; parse before reading.
        let head = match Request::parse_head(&buf, max_request_bytes) {
            Ok(head) => head,
            Err(RequestError::Incomplete) => {
                if buf.len() > MAX_HEAD_BYTES {
                    warn!(peer = %peer_addr, "header block too large, sending 413");
                    reject(&mut stream, StatusCode::PayloadTooLarge, "Request headers too large")
                        .await?;
                    break;
                }
                if stream.read_buf(&mut buf).await? == 0 {
                    debug!(peer = %peer_addr, "connection closed by peer");
                    break;
                }
                continue;
            }
            Err(e @ RequestError::BodyTooLarge { .. }) => {
                warn!(peer = %peer_addr, error = %e, "request too large, sending 413");
                reject(&mut stream, StatusCode::PayloadTooLarge, &e.to_string()).await?;
                break;
            }
            Err(e) => {
                warn!(peer = %peer_addr, error = %e, "bad request, sending 400");
                reject(&mut stream, StatusCode::BadRequest, &e.to_string()).await?;
                break;
            }
        };

        while buf.len() < head.total_len() {
            if stream.read_buf(&mut buf).await? == 0 {
                debug!(peer = %peer_addr, "peer closed before sending full body");
                return Ok(());
            }
        }

        let mut raw = buf.split_to(head.total_len());
        let body = raw.split_off(head.body_offset()).freeze();
        let request = head.into_request(body);
        let keep_alive = request.is_keep_alive();

        debug!(
            peer = %peer_addr,
            method = %request.method(),
            path = %request.path(),
            "dispatching request"
        );

        let response = handler(request).await;
        let keep_alive = keep_alive && response.is_keep_alive();
        let (head_bytes, body) = response.keep_alive(keep_alive).into_parts();
        stream.write_all(&head_bytes).await?;

        match body {
            Body::Full(bytes) => {
                stream.write_all(&bytes).await?;
                stream.flush().await?;
            }
            Body::Stream(body) => {
                let limit = MAX_HEAD_BYTES + max_request_bytes;
                let end = write_stream(&mut stream, &mut buf, body, limit).await?;
                match end {
                    StreamEnd::Completed => {}
                    StreamEnd::Aborted => {
                        warn!(peer = %peer_addr, "response stream failed, closing connection");
                        break;
                    }
                    StreamEnd::ClientGone => {
                        debug!(peer = %peer_addr, "client disconnected mid-stream, upstream dropped");
                        break;
                    }
                    StreamEnd::Overrun => {
                        warn!(
                            peer = %peer_addr,
                            buffered = buf.len(),
                            "client sent too much data during a stream, closing connection"
                        );
                        break;
                    }
                }
            }
        }

        if !keep_alive {
            debug!(peer = %peer_addr, "Connection: close, shutting down");
            break;
        }
    }

    Ok(())
}

enum Step {
    Item(Option<Result<bytes::Bytes, io::Error>>),
    Read(io::Result<usize>),
}

/// Writes `body` as chunked encoding, flushing after every chunk.
///
/// A zero-byte read from the client means it went away; the body is dropped
/// on return in every case. A client that half-closes its write side is
/// treated as gone too. Pipelined bytes read meanwhile stay in `buf`, up to
/// `read_limit`.
async fn write_stream(
    stream: &mut TcpStream,
    buf: &mut BytesMut,
    mut body: BodyStream,
    read_limit: usize,
) -> io::Result<StreamEnd> {
    loop {
        let step = tokio::select! {
            item = body.next() => Step::Item(item),
            read = stream.read_buf(buf) => Step::Read(read),
        };

        match step {
            Step::Item(Some(Ok(chunk))) => {
                if chunk.is_empty() {
                    continue;
                }
                stream.write_all(&encode_chunk(&chunk)).await?;
                stream.flush().await?;
            }
            Step::Item(Some(Err(e))) => {
                debug!(error = %e, "body stream yielded an error");
                return Ok(StreamEnd::Aborted);
            }
            Step::Item(None) => {
                stream.write_all(LAST_CHUNK).await?;
                stream.flush().await?;
                return Ok(StreamEnd::Completed);
            }
            Step::Read(Ok(0)) => return Ok(StreamEnd::ClientGone),
            Step::Read(Ok(_)) if buf.len() > read_limit => return Ok(StreamEnd::Overrun),
            Step::Read(Ok(_)) => {}
            Step::Read(Err(e)) => return Err(e),
        }
    }
}

async fn reject(stream: &mut TcpStream, status: StatusCode, details: &str) -> io::Result<()> {
    let response = Response::error(status, status.canonical_reason(), details).keep_alive(false);
    stream.write_all(&response.into_bytes()).await?;
    stream.flush().await
}
