//! PTY bridge subsystem.
//!
//! Frame grammar and the concurrent byte pump binding one client stream
//! to one container PTY.

pub mod bridge;
pub mod frames;
#[cfg(test)]
mod tests;

pub use bridge::{BridgeConfig, BridgeOutcome, PtyBridge, TransportMode};
pub use frames::{classify_text, ControlMessage, InboundFrame};
