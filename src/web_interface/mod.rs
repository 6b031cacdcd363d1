//! Web interface subsystem.
//!
//! The HTTP/JSON admin surface and the per-session stream transports.
//!
//! Components:
//! - `routes`: API filters and the shared [`AppState`].
//! - `terminal`: WebSocket upgrade endpoints binding bridges.
//! - `web_server`: server wiring with graceful shutdown.
//! - `types`: request/response bodies and input validation.

pub mod routes;
pub mod terminal;
pub mod types;
pub mod web_server;

pub use routes::AppState;
pub use web_server::WebServer;
