//! HTTP and WebSocket surface for okvm.
//!
//! Every endpoint resolves the caller's client key first and answers on
//! behalf of that client's session. Chat turns stream as NDJSON over
//! `POST /api/chat` or as text frames over `/ws`.

pub mod error;
pub mod identity;
pub mod server;
mod ws;

pub use error::ApiError;
pub use identity::ClientIdentity;
pub use server::{AppState, GatewayServer, NDJSON};
