//! Message persistence for finished assistant turns.
//!
//! The relational schema lives with the web application; the relay only sees
//! it through [`MessageStore`]. Two implementations ship:
//!
//! - [`MemoryStore`]: process-local, for development and tests.
//! - [`HttpMessageStore`]: the web application's own REST endpoints,
//!   authenticated with a service token: `POST /api/messages`,
//!   `GET /api/threads/:id` and `PATCH /api/threads/:id` for renames.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::llm::Role;

/// Name every freshly created thread starts with.
pub const DEFAULT_THREAD_NAME: &str = "New Chat";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("thread {0} not found")]
    ThreadNotFound(String),

    #[error("message store unreachable: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("message store answered {status}: {body}")]
    Status { status: u16, body: String },
}

/// A message to persist.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NewMessage {
    pub thread_id: String,
    pub text: String,
    pub role: Role,
}

/// A persisted message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageRecord {
    pub id: String,
    pub thread_id: String,
    pub text: String,
    pub role: Role,
    pub created_at: DateTime<Utc>,
}

/// A thread together with its messages in creation order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ThreadRecord {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub messages: Vec<MessageRecord>,
}

#[async_trait]
pub trait MessageStore: Send + Sync {
    async fn create(&self, message: NewMessage) -> Result<MessageRecord, StoreError>;

    async fn find_many(&self, thread_id: &str) -> Result<Vec<MessageRecord>, StoreError>;

    async fn find_thread(&self, thread_id: &str) -> Result<Option<ThreadRecord>, StoreError>;

    async fn rename_thread(&self, thread_id: &str, name: &str) -> Result<(), StoreError>;
}

/// In-process store. Threads must be created with
/// [`create_thread`](Self::create_thread) before messages can be added,
/// unless the store was built with
/// [`creating_threads`](Self::creating_threads).
#[derive(Default)]
pub struct MemoryStore {
    threads: RwLock<HashMap<String, ThreadRecord>>,
    create_missing: bool,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes the first message for an unknown thread id create that thread,
    /// named [`DEFAULT_THREAD_NAME`]. Used when no web application owns the
    /// threads.
    pub fn creating_threads(mut self) -> Self {
        self.create_missing = true;
        self
    }

    /// Creates an empty thread named [`DEFAULT_THREAD_NAME`] and returns its id.
    pub async fn create_thread(&self) -> String {
        let id = Uuid::new_v4().to_string();
        self.threads.write().await.insert(
            id.clone(),
            ThreadRecord {
                id: id.clone(),
                name: DEFAULT_THREAD_NAME.to_owned(),
                messages: Vec::new(),
            },
        );
        id
    }
}

#[async_trait]
impl MessageStore for MemoryStore {
    async fn create(&self, message: NewMessage) -> Result<MessageRecord, StoreError> {
        let mut threads = self.threads.write().await;
        if self.create_missing && !threads.contains_key(&message.thread_id) {
            threads.insert(
                message.thread_id.clone(),
                ThreadRecord {
                    id: message.thread_id.clone(),
                    name: DEFAULT_THREAD_NAME.to_owned(),
                    messages: Vec::new(),
                },
            );
        }
        let thread = threads
            .get_mut(&message.thread_id)
            .ok_or_else(|| StoreError::ThreadNotFound(message.thread_id.clone()))?;
        let record = MessageRecord {
            id: Uuid::new_v4().to_string(),
            thread_id: message.thread_id,
            text: message.text,
            role: message.role,
            created_at: Utc::now(),
        };
        thread.messages.push(record.clone());
        Ok(record)
    }

    async fn find_many(&self, thread_id: &str) -> Result<Vec<MessageRecord>, StoreError> {
        Ok(self
            .threads
            .read()
            .await
            .get(thread_id)
            .map(|t| t.messages.clone())
            .unwrap_or_default())
    }

    async fn find_thread(&self, thread_id: &str) -> Result<Option<ThreadRecord>, StoreError> {
        Ok(self.threads.read().await.get(thread_id).cloned())
    }

    async fn rename_thread(&self, thread_id: &str, name: &str) -> Result<(), StoreError> {
        let mut threads = self.threads.write().await;
        let thread = threads
            .get_mut(thread_id)
            .ok_or_else(|| StoreError::ThreadNotFound(thread_id.to_owned()))?;
        thread.name = name.to_owned();
        Ok(())
    }
}

/// Store backed by the web application's REST endpoints.
pub struct HttpMessageStore {
    client: reqwest::Client,
    base_url: String,
    token: Option<SecretString>,
}

impl HttpMessageStore {
    pub fn new(client: reqwest::Client, base_url: &str, token: Option<SecretString>) -> Self {
        Self {
            client,
            base_url: base_url.trim_end_matches('/').to_owned(),
            token,
        }
    }

    fn request(&self, method: reqwest::Method, path: &str) -> reqwest::RequestBuilder {
        let builder = self
            .client
            .request(method, format!("{}{path}", self.base_url))
            .timeout(Duration::from_secs(15));
        match &self.token {
            Some(token) => builder.bearer_auth(token.expose_secret()),
            None => builder,
        }
    }
}

async fn check(response: reqwest::Response) -> Result<reqwest::Response, StoreError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    Err(StoreError::Status {
        status: status.as_u16(),
        body,
    })
}

#[async_trait]
impl MessageStore for HttpMessageStore {
    async fn create(&self, message: NewMessage) -> Result<MessageRecord, StoreError> {
        let response = self
            .request(reqwest::Method::POST, "/api/messages")
            .json(&message)
            .send()
            .await?;
        Ok(check(response).await?.json().await?)
    }

    async fn find_many(&self, thread_id: &str) -> Result<Vec<MessageRecord>, StoreError> {
        Ok(self
            .find_thread(thread_id)
            .await?
            .map(|thread| thread.messages)
            .unwrap_or_default())
    }

    async fn find_thread(&self, thread_id: &str) -> Result<Option<ThreadRecord>, StoreError> {
        let response = self
            .request(reqwest::Method::GET, &format!("/api/threads/{thread_id}"))
            .send()
            .await?;
        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(None);
        }
        // A missing thread is answered with `200 null`.
        Ok(check(response).await?.json::<Option<ThreadRecord>>().await?)
    }

    async fn rename_thread(&self, thread_id: &str, name: &str) -> Result<(), StoreError> {
        let response = self
            .request(reqwest::Method::PATCH, &format!("/api/threads/{thread_id}"))
            .json(&serde_json::json!({ "name": name }))
            .send()
            .await?;
        check(response).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn memory_store_round_trip() {
        let store = MemoryStore::new();
        let thread = store.create_thread().await;

        store
            .create(NewMessage {
                thread_id: thread.clone(),
                text: "hello".into(),
                role: Role::User,
            })
            .await
            .unwrap();
        store
            .create(NewMessage {
                thread_id: thread.clone(),
                text: "hi there".into(),
                role: Role::Assistant,
            })
            .await
            .unwrap();

        let messages = store.find_many(&thread).await.unwrap();
        let texts: Vec<_> = messages.iter().map(|m| m.text.as_str()).collect();
        assert_eq!(texts, vec!["hello", "hi there"]);
        assert_eq!(messages[1].role, Role::Assistant);

        let found = store.find_thread(&thread).await.unwrap().unwrap();
        assert_eq!(found.name, DEFAULT_THREAD_NAME);
    }

    #[tokio::test]
    async fn memory_store_rejects_unknown_thread() {
        let store = MemoryStore::new();
        let err = store
            .create(NewMessage {
                thread_id: "missing".into(),
                text: "x".into(),
                role: Role::User,
            })
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::ThreadNotFound(id) if id == "missing"));
        assert!(store.find_thread("missing").await.unwrap().is_none());
        assert!(store.find_many("missing").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn creating_store_opens_threads_on_first_message() {
        let store = MemoryStore::new().creating_threads();
        for (role, text) in [(Role::User, "hi"), (Role::Assistant, "hello")] {
            store
                .create(NewMessage {
                    thread_id: "browser-thread".into(),
                    text: text.into(),
                    role,
                })
                .await
                .unwrap();
        }

        let thread = store.find_thread("browser-thread").await.unwrap().unwrap();
        assert_eq!(thread.name, DEFAULT_THREAD_NAME);
        assert_eq!(thread.messages.len(), 2);
        assert!(store.find_thread("other").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn memory_store_rename() {
        let store = MemoryStore::new();
        let thread = store.create_thread().await;
        store.rename_thread(&thread, "Rust Streams").await.unwrap();
        assert_eq!(
            store.find_thread(&thread).await.unwrap().unwrap().name,
            "Rust Streams"
        );
        assert!(store.rename_thread("nope", "x").await.is_err());
    }

    /// Serves a fixed web-app thread API and records what was asked of it.
    async fn spawn_web_app(
        thread: serde_json::Value,
    ) -> (String, std::sync::Arc<std::sync::Mutex<Vec<String>>>) {
        use crate::{Request, Response, Server, StatusCode};

        let seen = std::sync::Arc::new(std::sync::Mutex::new(Vec::new()));
        let log = std::sync::Arc::clone(&seen);
        let server = Server::bind("127.0.0.1:0").await.unwrap();
        let base = format!("http://{}", server.local_addr());
        tokio::spawn(server.run(move |req: Request| {
            log.lock().unwrap().push(format!(
                "{} {} {}",
                req.method(),
                req.path(),
                String::from_utf8_lossy(req.body())
            ));
            let thread = thread.clone();
            async move { Response::json(StatusCode::Ok, &thread) }
        }));
        (base, seen)
    }

    #[tokio::test]
    async fn http_store_reads_null_as_missing_thread() {
        let (base, seen) = spawn_web_app(serde_json::Value::Null).await;
        let store = HttpMessageStore::new(reqwest::Client::new(), &base, Some("svc".to_owned().into()));

        assert!(store.find_thread("missing").await.unwrap().is_none());
        assert!(store.find_many("missing").await.unwrap().is_empty());
        assert_eq!(seen.lock().unwrap()[0], "GET /api/threads/missing ");
    }

    #[tokio::test]
    async fn http_store_reads_and_renames_thread() {
        let (base, seen) = spawn_web_app(serde_json::json!({
            "id": "t1",
            "name": "New Chat",
            "messages": [{
                "id": "m1",
                "threadId": "t1",
                "text": "hello",
                "role": "user",
                "createdAt": "2025-01-01T00:00:00Z"
            }]
        }))
        .await;
        let store = HttpMessageStore::new(reqwest::Client::new(), &base, None);

        let thread = store.find_thread("t1").await.unwrap().unwrap();
        assert_eq!(thread.name, DEFAULT_THREAD_NAME);
        assert_eq!(thread.messages[0].text, "hello");

        store.rename_thread("t1", "Greetings").await.unwrap();
        assert_eq!(
            seen.lock().unwrap()[1],
            r#"PATCH /api/threads/t1 {"name":"Greetings"}"#
        );
    }

    #[test]
    fn new_message_wire_shape() {
        let json = serde_json::to_value(NewMessage {
            thread_id: "t1".into(),
            text: "answer".into(),
            role: Role::Assistant,
        })
        .unwrap();
        assert_eq!(
            json,
            serde_json::json!({"threadId": "t1", "text": "answer", "role": "assistant"})
        );
    }
}
