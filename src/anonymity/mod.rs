//! Anonymizing egress subsystem.
//!
//! Supervises the loopback SOCKS5 proxy subprocess that containers use
//! for outbound traffic while anonymity is enabled.

pub mod supervisor;

pub use supervisor::{AnonymityStatus, EgressSupervisor, ProxyState};
