//! Storage subsystem.
//!
//! Durable record of sessions, audit events, rate-limit counters, and
//! optional container metrics, backed by SQLite through SeaORM.
//!
//! Components:
//! - `store`: the [`MetadataStore`] with compare-and-set transitions.
//! - `entities`: SeaORM entity models.
//! - `types`: audit kinds, records, and metric samples.

pub mod entities;
pub mod store;
pub mod types;

pub use store::MetadataStore;
pub use types::{AuditKind, AuditRecord, MetricSample, SecuritySeverity};
