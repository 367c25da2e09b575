//! Network transports for server mode.
//!
//! Only HTTP is provided: a REST surface for publish/query/conflicts/stats and
//! a WebSocket channel per worker connection that carries hub events.

pub mod http;

pub use http::{router, serve, shutdown_signal, ApiError, AppState};
