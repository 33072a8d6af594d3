//! # chatrelay
//!
//! A streaming chat-completion relay. The browser posts a conversation to
//! `POST /api/chat`; the relay validates it, opens a streaming request to the
//! selected model provider, and relays the answer as server-sent events while
//! it arrives. When the stream completes, the assistant message is persisted.
//!
//! The HTTP/1.1 server, router and middleware stack are built on Tokio
//! directly; upstream calls go through `reqwest`.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use chatrelay::{Server, api, config::Config};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = Config::load()?;
//!     let service = api::build(&config)?;
//!     let server = Server::bind(&config.server.bind).await?;
//!     server
//!         .run(move |req| {
//!             let service = service.clone();
//!             async move { service.call(req).await }
//!         })
//!         .await?;
//!     Ok(())
//! }
//! ```

pub mod api;
pub mod config;
pub mod context;
pub mod database;
pub mod http;
pub mod llm;
pub mod middleware;
pub mod router;
pub mod security;
pub mod server;

pub use http::{Headers, Method, Request, Response, StatusCode};
pub use router::Router;
pub use server::{Server, ServerError};
