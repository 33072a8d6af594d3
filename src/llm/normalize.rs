//! Upstream byte stream → normalized outbound stream.
//!
//! The normalizer owns the upstream body for as long as it runs. Dropping the
//! returned stream (the client went away, or the handler gave up) drops the
//! upstream body with it, which closes the upstream connection.

use std::io;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use bytes::Bytes;
use chrono::Utc;
use futures::{Stream, StreamExt};
use serde_json::Value;
use tracing::{debug, warn};
use uuid::Uuid;

use super::error::ProxyError;
use super::framer::{Segment, SseFramer};
use super::types::StreamChunk;

pub type ByteStream = Pin<Box<dyn Stream<Item = Result<Bytes, io::Error>> + Send>>;

pub type EmissionStream = Pin<Box<dyn Stream<Item = Result<Emission, ProxyError>> + Send>>;

static MALFORMED_EVENTS: AtomicU64 = AtomicU64::new(0);

/// Events skipped because their payload was not valid JSON, since startup.
pub fn malformed_events_total() -> u64 {
    MALFORMED_EVENTS.load(Ordering::Relaxed)
}

/// Where the text delta lives inside one upstream event payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dialect {
    /// `choices[0].delta.content`
    OpenAiChoices,
    /// `candidates[0].content.parts[*].text`, concatenated.
    GeminiCandidates,
}

impl Dialect {
    /// Extracts the text delta of one event payload. `Ok(None)` means the
    /// event is valid but carries no text.
    pub fn extract_delta(self, payload: &str) -> Result<Option<String>, serde_json::Error> {
        let event: Value = serde_json::from_str(payload)?;
        let text = match self {
            Dialect::OpenAiChoices => event
                .pointer("/choices/0/delta/content")
                .and_then(Value::as_str)
                .map(str::to_owned),
            Dialect::GeminiCandidates => event
                .pointer("/candidates/0/content/parts")
                .and_then(Value::as_array)
                .map(|parts| {
                    parts
                        .iter()
                        .filter_map(|p| p.get("text").and_then(Value::as_str))
                        .collect::<String>()
                }),
        };
        Ok(text.filter(|t| !t.is_empty()))
    }
}

/// How upstream events are handed to the client.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Framing {
    /// Each text delta is re-emitted as a [`StreamChunk`] event.
    Reframe(Dialect),
    /// Upstream bytes are forwarded unchanged; the dialect is only used to
    /// recover the text for persistence.
    Passthrough(Dialect),
}

impl Framing {
    pub fn dialect(self) -> Dialect {
        match self {
            Framing::Reframe(d) | Framing::Passthrough(d) => d,
        }
    }
}

/// One item of the outbound stream.
#[derive(Debug, Clone, PartialEq)]
pub enum Emission {
    Chunk(StreamChunk),
    Forward { bytes: Bytes, text: String },
}

impl Emission {
    /// Assistant text carried by this emission.
    pub fn text(&self) -> &str {
        match self {
            Emission::Chunk(chunk) => &chunk.delta,
            Emission::Forward { text, .. } => text,
        }
    }

    /// Bytes written to the client.
    pub fn into_bytes(self) -> Bytes {
        match self {
            Emission::Chunk(chunk) => chunk.to_sse(),
            Emission::Forward { bytes, .. } => bytes,
        }
    }
}

#[derive(Debug, Clone)]
pub struct NormalizeOptions {
    /// Model name stamped on every chunk.
    pub model: String,
    /// Longest silence tolerated between two upstream reads.
    pub idle_timeout: Option<Duration>,
}

/// Builds consecutive chunks of one completion.
struct ChunkSequence {
    id: String,
    model: String,
    next_seq: u64,
}

impl ChunkSequence {
    fn new(model: String) -> Self {
        Self {
            id: format!("chatcmpl-{}", Uuid::new_v4().simple()),
            model,
            next_seq: 0,
        }
    }

    fn next(&mut self, delta: String) -> StreamChunk {
        let seq = self.next_seq;
        self.next_seq += 1;
        StreamChunk {
            seq,
            id: self.id.clone(),
            created: Utc::now().timestamp(),
            model: self.model.clone(),
            delta,
            finish_reason: None,
        }
    }
}

fn interpret(segment: Segment, dialect: Dialect, malformed: &mut u64) -> Option<String> {
    let Segment::Data(payload) = segment else {
        return None;
    };
    match dialect.extract_delta(&payload) {
        Ok(delta) => delta,
        Err(e) => {
            *malformed += 1;
            MALFORMED_EVENTS.fetch_add(1, Ordering::Relaxed);
            warn!(error = %e, payload_len = payload.len(), "skipping malformed upstream event");
            None
        }
    }
}

/// Drains every complete event. Returns the deltas in order and whether the
/// sentinel was reached.
fn drain(framer: &mut SseFramer, dialect: Dialect, malformed: &mut u64) -> (Vec<String>, bool) {
    let mut deltas = Vec::new();
    while let Some(segment) = framer.next_segment() {
        if segment == Segment::Done {
            return (deltas, true);
        }
        deltas.extend(interpret(segment, dialect, malformed));
    }
    (deltas, false)
}

/// Turns an upstream event stream into the outbound stream.
///
/// The returned stream ends after the `[DONE]` sentinel or when the upstream
/// ends. A read failure or idle timeout is yielded as the final item.
pub fn normalize(upstream: ByteStream, framing: Framing, options: NormalizeOptions) -> EmissionStream {
    let dialect = framing.dialect();
    let NormalizeOptions {
        model,
        idle_timeout,
    } = options;

    Box::pin(async_stream::stream! {
        let mut upstream = upstream;
        let mut framer = SseFramer::new();
        let mut chunks = ChunkSequence::new(model);
        let mut malformed = 0u64;

        loop {
            let next = match idle_timeout {
                Some(limit) => match tokio::time::timeout(limit, upstream.next()).await {
                    Ok(next) => next,
                    Err(_) => {
                        framer.fail();
                        warn!(?limit, "upstream went idle");
                        yield Err(ProxyError::IdleTimeout(limit));
                        break;
                    }
                },
                None => upstream.next().await,
            };

            match next {
                Some(Ok(bytes)) => {
                    framer.push(&bytes);
                    let (deltas, done) = drain(&mut framer, dialect, &mut malformed);
                    match framing {
                        Framing::Reframe(_) => {
                            for delta in deltas {
                                yield Ok(Emission::Chunk(chunks.next(delta)));
                            }
                        }
                        Framing::Passthrough(_) => {
                            yield Ok(Emission::Forward { bytes, text: deltas.concat() });
                        }
                    }
                    if done {
                        debug!("upstream sent the done sentinel");
                        break;
                    }
                }
                Some(Err(e)) => {
                    framer.fail();
                    warn!(error = %e, "upstream read failed");
                    yield Err(ProxyError::StreamRead(e));
                    break;
                }
                None => {
                    let tail = framer
                        .finish()
                        .and_then(|segment| interpret(segment, dialect, &mut malformed));
                    if let Some(delta) = tail {
                        match framing {
                            Framing::Reframe(_) => {
                                yield Ok(Emission::Chunk(chunks.next(delta)));
                            }
                            Framing::Passthrough(_) => {
                                yield Ok(Emission::Forward { bytes: Bytes::new(), text: delta });
                            }
                        }
                    }
                    debug!("upstream closed without the done sentinel");
                    break;
                }
            }
        }

        if malformed > 0 {
            debug!(malformed, "stream finished with skipped events");
        }
    })
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::AtomicUsize;

    use futures::stream;

    use super::*;

    fn upstream(parts: Vec<&'static [u8]>) -> ByteStream {
        Box::pin(stream::iter(
            parts
                .into_iter()
                .map(|p| Ok::<_, io::Error>(Bytes::from_static(p))),
        ))
    }

    fn options() -> NormalizeOptions {
        NormalizeOptions {
            model: "openai/gpt-4o".into(),
            idle_timeout: None,
        }
    }

    async fn collect(stream: EmissionStream) -> Vec<Result<Emission, ProxyError>> {
        stream.collect().await
    }

    fn deltas(items: &[Result<Emission, ProxyError>]) -> Vec<String> {
        items
            .iter()
            .filter_map(|i| i.as_ref().ok())
            .map(|e| e.text().to_owned())
            .collect()
    }

    #[test]
    fn dialects_extract_text() {
        let openai = r#"{"choices":[{"delta":{"content":"Hi"}}]}"#;
        assert_eq!(
            Dialect::OpenAiChoices.extract_delta(openai).unwrap(),
            Some("Hi".into())
        );
        let role_only = r#"{"choices":[{"delta":{"role":"assistant","content":""}}]}"#;
        assert_eq!(Dialect::OpenAiChoices.extract_delta(role_only).unwrap(), None);

        let gemini = r#"{"candidates":[{"content":{"role":"model","parts":[{"text":"Hel"},{"text":"lo"}]}}]}"#;
        assert_eq!(
            Dialect::GeminiCandidates.extract_delta(gemini).unwrap(),
            Some("Hello".into())
        );
        assert!(Dialect::GeminiCandidates.extract_delta("{oops").is_err());
    }

    #[tokio::test]
    async fn reframes_single_delta_and_stops_at_sentinel() {
        let polled = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&polled);
        let parts: Vec<&'static [u8]> = vec![
            b"data: {\"choices\":[{\"delta\":{\"content\":\"Hi\"}}]}\n\ndata: [DONE]\n\n",
            b"data: {\"choices\":[{\"delta\":{\"content\":\"never\"}}]}\n\n",
        ];
        let body: ByteStream = Box::pin(stream::iter(parts).map(move |p| {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok::<_, io::Error>(Bytes::from_static(p))
        }));

        let items = collect(normalize(body, Framing::Reframe(Dialect::OpenAiChoices), options())).await;
        assert_eq!(items.len(), 1);
        let Ok(Emission::Chunk(chunk)) = &items[0] else {
            panic!("expected a chunk, got {:?}", items[0]);
        };
        assert_eq!(chunk.delta, "Hi");
        assert_eq!(chunk.seq, 0);
        assert_eq!(chunk.model, "openai/gpt-4o");
        // The read after the sentinel was never requested.
        assert_eq!(polled.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn one_chunk_per_delta_with_increasing_seq() {
        let body = upstream(vec![
            b"data: {\"choices\":[{\"delta\":{\"content\":\"a\"}}]}\n\ndata: {\"choices\":[{\"delta\":{\"content\":\"b\"}}]}\n\n",
            b"data: {\"choices\":[{\"delta\":{\"content\":\"c\"}}]}\n\ndata: [DONE]\n\n",
        ]);
        let items = collect(normalize(body, Framing::Reframe(Dialect::OpenAiChoices), options())).await;
        let chunks: Vec<&StreamChunk> = items
            .iter()
            .map(|i| match i {
                Ok(Emission::Chunk(c)) => c,
                other => panic!("unexpected {other:?}"),
            })
            .collect();
        assert_eq!(
            chunks.iter().map(|c| c.seq).collect::<Vec<_>>(),
            vec![0, 1, 2]
        );
        assert!(chunks.iter().all(|c| c.id == chunks[0].id));
        assert_eq!(deltas(&items).concat(), "abc");
    }

    #[tokio::test]
    async fn malformed_event_is_skipped() {
        let before = malformed_events_total();
        let body = upstream(vec![
            b"data: {\"choices\":[{\"delta\":{\"content\":\"A\"}}]}\n\n",
            b"data: {not json\n\n",
            b"data: {\"choices\":[{\"delta\":{\"content\":\"B\"}}]}\n\ndata: [DONE]\n\n",
        ]);
        let items = collect(normalize(body, Framing::Reframe(Dialect::OpenAiChoices), options())).await;
        assert!(items.iter().all(Result::is_ok));
        assert_eq!(deltas(&items), vec!["A".to_owned(), "B".to_owned()]);
        assert!(malformed_events_total() > before);
    }

    #[tokio::test]
    async fn multibyte_delta_split_across_reads() {
        let event = "data: {\"choices\":[{\"delta\":{\"content\":\"naïve ✓\"}}]}\n\n".as_bytes();
        let split = event.iter().position(|&b| b == 0xE2).unwrap() + 1;
        let (head, tail) = event.split_at(split);
        let body: ByteStream = Box::pin(stream::iter(vec![
            Ok::<_, io::Error>(Bytes::copy_from_slice(head)),
            Ok(Bytes::copy_from_slice(tail)),
            Ok(Bytes::from_static(b"data: [DONE]\n\n")),
        ]));
        let items = collect(normalize(body, Framing::Reframe(Dialect::OpenAiChoices), options())).await;
        assert_eq!(deltas(&items), vec!["naïve ✓".to_owned()]);
    }

    #[tokio::test]
    async fn unterminated_tail_is_flushed_at_end() {
        let body = upstream(vec![b"data: {\"choices\":[{\"delta\":{\"content\":\"end\"}}]}"]);
        let items = collect(normalize(body, Framing::Reframe(Dialect::OpenAiChoices), options())).await;
        assert_eq!(deltas(&items), vec!["end".to_owned()]);
    }

    #[tokio::test]
    async fn read_failure_ends_stream_with_error() {
        let body: ByteStream = Box::pin(stream::iter(vec![
            Ok(Bytes::from_static(
                b"data: {\"choices\":[{\"delta\":{\"content\":\"x\"}}]}\n\n",
            )),
            Err(io::Error::new(io::ErrorKind::ConnectionReset, "reset")),
            Ok(Bytes::from_static(b"data: [DONE]\n\n")),
        ]));
        let items = collect(normalize(body, Framing::Reframe(Dialect::OpenAiChoices), options())).await;
        assert_eq!(items.len(), 2);
        assert!(items[0].is_ok());
        assert!(matches!(items[1], Err(ProxyError::StreamRead(_))));
    }

    #[tokio::test]
    async fn passthrough_forwards_bytes_unchanged() {
        let first: &'static [u8] =
            b"data: {\"candidates\":[{\"content\":{\"parts\":[{\"text\":\"Hel\"}]}}]}\r\n\r\n";
        let second: &'static [u8] =
            b"data: {\"candidates\":[{\"content\":{\"parts\":[{\"text\":\"lo\"}]}}]}\r\n\r\n";
        let body = upstream(vec![first, second]);
        let items = collect(normalize(
            body,
            Framing::Passthrough(Dialect::GeminiCandidates),
            options(),
        ))
        .await;

        let forwarded: Vec<u8> = items
            .iter()
            .filter_map(|i| i.as_ref().ok())
            .flat_map(|e| e.clone().into_bytes().to_vec())
            .collect();
        assert_eq!(forwarded, [first, second].concat());
        assert_eq!(deltas(&items).concat(), "Hello");
    }

    #[tokio::test(start_paused = true)]
    async fn idle_upstream_times_out() {
        let body: ByteStream = Box::pin(
            stream::iter(vec![Ok::<_, io::Error>(Bytes::from_static(
                b"data: {\"choices\":[{\"delta\":{\"content\":\"x\"}}]}\n\n",
            ))])
            .chain(stream::pending()),
        );
        let opts = NormalizeOptions {
            idle_timeout: Some(Duration::from_secs(5)),
            ..options()
        };
        let items = collect(normalize(body, Framing::Reframe(Dialect::OpenAiChoices), opts)).await;
        assert_eq!(items.len(), 2);
        assert!(matches!(items[1], Err(ProxyError::IdleTimeout(d)) if d == Duration::from_secs(5)));
    }

    #[tokio::test]
    async fn dropping_the_stream_drops_the_upstream() {
        struct DropFlag(Arc<AtomicUsize>);
        impl Drop for DropFlag {
            fn drop(&mut self) {
                self.0.fetch_add(1, Ordering::SeqCst);
            }
        }

        let dropped = Arc::new(AtomicUsize::new(0));
        let flag = DropFlag(Arc::clone(&dropped));
        let body: ByteStream = Box::pin(
            stream::iter(vec![Ok::<_, io::Error>(Bytes::from_static(
                b"data: {\"choices\":[{\"delta\":{\"content\":\"x\"}}]}\n\n",
            ))])
            .chain(stream::pending())
            .map(move |item| {
                let _keep = &flag;
                item
            }),
        );

        let mut out = normalize(body, Framing::Reframe(Dialect::OpenAiChoices), options());
        assert!(out.next().await.is_some());
        assert_eq!(dropped.load(Ordering::SeqCst), 0);
        drop(out);
        assert_eq!(dropped.load(Ordering::SeqCst), 1);
    }
}
