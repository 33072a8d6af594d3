//! Chat-completion relay core.
//!
//! A request flows through four stages:
//!
//! 1. [`validate()`] checks the provider, model, credential and conversation.
//! 2. The [`ProviderRegistry`] picks the adapter that opens the upstream stream.
//! 3. [`normalize()`] frames upstream server-sent events and re-emits text
//!    deltas, or forwards the upstream bytes unchanged.
//! 4. [`finish_on_success()`] persists the assistant message once the stream
//!    ended cleanly.

pub mod catalog;
pub mod error;
pub mod finisher;
pub mod framer;
pub mod normalize;
pub mod provider;
pub mod types;
pub mod validate;

pub use catalog::{CREDENTIAL_CAPABILITY, ModelCatalog, ModelSpec, Provider};
pub use error::ProxyError;
pub use finisher::{Finisher, finish_on_success};
pub use framer::{FramerState, Segment, SseFramer};
pub use normalize::{
    ByteStream, Dialect, Emission, EmissionStream, Framing, NormalizeOptions,
    malformed_events_total, normalize,
};
pub use provider::{ProviderAdapter, ProviderRegistry, UpstreamReply, UpstreamRequest};
pub use types::{Capability, ChatMessage, ChatRequest, ModelSelection, Role, StreamChunk};
pub use validate::{ServerCredentials, ValidatedRequest, ValidationError, validate};
