//! Error handling subsystem.
//!
//! One error enum per subsystem with hand-written `Display` impls and
//! conversions at the seams.

pub mod types;

pub use types::{ContainerError, ProxyError, SessionError, StorageError};
