//! Hublot: a browser-to-container terminal broker.
//!
//! Clients create ephemeral Docker-backed shell sessions over a JSON
//! API, then stream terminal bytes to them over a WebSocket. Subsystems:
//!
//! - `container_runtime`: capability interface over the container engine.
//! - `storage`: SQLite-backed session metadata, audit, and rate limits.
//! - `anonymity`: supervisor for the optional SOCKS5 egress proxy.
//! - `session_management`: the lifecycle state machine and sweeper.
//! - `pty_bridge`: the per-session client/PTY byte pump.
//! - `web_interface`: HTTP API and WebSocket transports.

pub mod anonymity;
pub mod configuration;
pub mod container_runtime;
pub mod error_handling;
pub mod pty_bridge;
pub mod session_management;
pub mod storage;
pub mod web_interface;

pub use anonymity::EgressSupervisor;
pub use configuration::Config;
pub use container_runtime::{ContainerRuntime, DockerRuntime};
pub use pty_bridge::PtyBridge;
pub use session_management::{Session, SessionManager, SessionStatus};
pub use storage::MetadataStore;
pub use web_interface::{AppState, WebServer};
