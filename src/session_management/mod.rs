//! Session management subsystem.
//!
//! Owns the lifecycle state machine for every session and the background
//! sweeper that retires expired ones.
//!
//! Re-exports:
//! - [`SessionManager`]: create/attach/delete plus the sweeper.
//! - [`Session`], [`SessionStatus`]: the domain model.

pub mod session;
pub mod session_manager;
#[cfg(test)]
mod tests;

pub use session::{Session, SessionStatus};
pub use session_manager::{AttachedSession, AttachmentEnd, SessionManager};
