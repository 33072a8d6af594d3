//! Persists the assistant turn once a stream has completed normally.

use std::sync::Arc;

use futures::StreamExt;
use tracing::{debug, error, info};

use super::normalize::EmissionStream;
use super::types::Role;
use crate::database::{MessageStore, NewMessage};

/// Where a finished assistant message goes.
pub struct Finisher {
    store: Arc<dyn MessageStore>,
    thread_id: String,
}

impl Finisher {
    pub fn new(store: Arc<dyn MessageStore>, thread_id: impl Into<String>) -> Self {
        Self {
            store,
            thread_id: thread_id.into(),
        }
    }

    async fn persist(self, text: String) {
        let chars = text.chars().count();
        let message = NewMessage {
            thread_id: self.thread_id,
            text,
            role: Role::Assistant,
        };
        match self.store.create(message).await {
            Ok(record) => {
                info!(thread = %record.thread_id, message = %record.id, chars, "assistant message persisted");
            }
            Err(e) => error!(error = %e, "failed to persist assistant message"),
        }
    }
}

/// Wraps `inner` so that, after it ends without error, the concatenated text
/// of every emission is persisted exactly once.
///
/// The write is handed to its own task as the wrapped stream ends, so a slow
/// store never holds back the end of the response and a client that hangs up
/// afterwards cannot cancel it. A failed or abandoned stream persists
/// nothing, and persistence errors are only logged. Must be polled inside a
/// Tokio runtime.
pub fn finish_on_success(inner: EmissionStream, finisher: Option<Finisher>) -> EmissionStream {
    Box::pin(async_stream::stream! {
        let mut inner = inner;
        let mut text = String::new();
        let mut failed = false;

        while let Some(item) = inner.next().await {
            match item {
                Ok(emission) => {
                    text.push_str(emission.text());
                    yield Ok(emission);
                }
                Err(e) => {
                    failed = true;
                    yield Err(e);
                    break;
                }
            }
        }
        drop(inner);

        match finisher {
            Some(_) if failed => debug!("stream failed, assistant message not persisted"),
            Some(finisher) => {
                tokio::spawn(finisher.persist(text));
            }
            None => debug!("no thread attached, nothing to persist"),
        }
    })
}

#[cfg(test)]
mod tests {
    use std::io;
    use std::time::{Duration, Instant};

    use async_trait::async_trait;
    use bytes::Bytes;
    use futures::stream;

    use super::*;
    use crate::database::{MemoryStore, MessageRecord, StoreError, ThreadRecord};
    use crate::llm::error::ProxyError;
    use crate::llm::normalize::{ByteStream, Dialect, Emission, Framing, NormalizeOptions, normalize};

    fn reframed(parts: Vec<Result<Bytes, io::Error>>) -> EmissionStream {
        let body: ByteStream = Box::pin(stream::iter(parts));
        normalize(
            body,
            Framing::Reframe(Dialect::OpenAiChoices),
            NormalizeOptions {
                model: "m".into(),
                idle_timeout: None,
            },
        )
    }

    /// Waits for the spawned write to land in `thread`.
    async fn persisted(store: &MemoryStore, thread: &str) -> Vec<MessageRecord> {
        tokio::time::timeout(Duration::from_secs(2), async {
            loop {
                let messages = store.find_many(thread).await.unwrap();
                if !messages.is_empty() {
                    return messages;
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("assistant message should be persisted")
    }

    /// Store whose writes take a while to be acknowledged.
    struct SlowStore {
        inner: MemoryStore,
        delay: Duration,
    }

    #[async_trait]
    impl MessageStore for SlowStore {
        async fn create(&self, message: NewMessage) -> Result<MessageRecord, StoreError> {
            tokio::time::sleep(self.delay).await;
            self.inner.create(message).await
        }

        async fn find_many(&self, thread_id: &str) -> Result<Vec<MessageRecord>, StoreError> {
            self.inner.find_many(thread_id).await
        }

        async fn find_thread(&self, thread_id: &str) -> Result<Option<ThreadRecord>, StoreError> {
            self.inner.find_thread(thread_id).await
        }

        async fn rename_thread(&self, thread_id: &str, name: &str) -> Result<(), StoreError> {
            self.inner.rename_thread(thread_id, name).await
        }
    }

    fn event(text: &str) -> Result<Bytes, io::Error> {
        Ok(Bytes::from(format!(
            "data: {{\"choices\":[{{\"delta\":{{\"content\":\"{text}\"}}}}]}}\n\n"
        )))
    }

    #[tokio::test]
    async fn persists_concatenated_deltas_once() {
        let store = Arc::new(MemoryStore::new());
        let thread = store.create_thread().await;

        let stream = finish_on_success(
            reframed(vec![
                event("Hel"),
                event("lo, "),
                event("world"),
                Ok(Bytes::from_static(b"data: [DONE]\n\n")),
            ]),
            Some(Finisher::new(store.clone(), thread.clone())),
        );
        let items: Vec<Result<Emission, ProxyError>> = stream.collect().await;
        let streamed: String = items
            .iter()
            .map(|i| i.as_ref().unwrap().text().to_owned())
            .collect();

        let messages = persisted(&store, &thread).await;
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].role, Role::Assistant);
        assert_eq!(messages[0].text, "Hello, world");
        assert_eq!(messages[0].text, streamed);
    }

    #[tokio::test]
    async fn failed_stream_is_not_persisted() {
        let store = Arc::new(MemoryStore::new());
        let thread = store.create_thread().await;

        let stream = finish_on_success(
            reframed(vec![
                event("partial"),
                Err(io::Error::new(io::ErrorKind::UnexpectedEof, "cut")),
            ]),
            Some(Finisher::new(store.clone(), thread.clone())),
        );
        let items: Vec<_> = stream.collect().await;
        assert!(items.last().unwrap().is_err());
        assert!(store.find_many(&thread).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn abandoned_stream_is_not_persisted() {
        let store = Arc::new(MemoryStore::new());
        let thread = store.create_thread().await;

        let mut stream = finish_on_success(
            reframed(vec![event("a"), event("b"), event("c")]),
            Some(Finisher::new(store.clone(), thread.clone())),
        );
        assert!(stream.next().await.is_some());
        drop(stream);
        assert!(store.find_many(&thread).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn store_failure_does_not_surface() {
        let store = Arc::new(MemoryStore::new());
        let stream = finish_on_success(
            reframed(vec![event("x"), Ok(Bytes::from_static(b"data: [DONE]\n\n"))]),
            Some(Finisher::new(store, "no-such-thread")),
        );
        let items: Vec<_> = stream.collect().await;
        assert_eq!(items.len(), 1);
        assert!(items[0].is_ok());
    }

    #[tokio::test]
    async fn slow_store_does_not_hold_back_stream_end() {
        let slow = Arc::new(SlowStore {
            inner: MemoryStore::new(),
            delay: Duration::from_millis(500),
        });
        let thread = slow.inner.create_thread().await;

        let mut stream = finish_on_success(
            reframed(vec![event("Hi"), Ok(Bytes::from_static(b"data: [DONE]\n\n"))]),
            Some(Finisher::new(slow.clone(), thread.clone())),
        );
        assert_eq!(stream.next().await.unwrap().unwrap().text(), "Hi");

        let started = Instant::now();
        assert!(stream.next().await.is_none());
        assert!(started.elapsed() < Duration::from_millis(250));

        // Dropping the consumer does not cancel the write.
        drop(stream);
        let messages = persisted(&slow.inner, &thread).await;
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].text, "Hi");
    }
}
