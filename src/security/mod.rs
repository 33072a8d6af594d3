//! Security middleware: CORS and session resolution.

mod cors;
mod session;

pub use cors::CorsMiddleware;
pub use session::{
    DevSessionLookup, HttpSessionLookup, Session, SessionError, SessionLookup, SessionMiddleware,
};
