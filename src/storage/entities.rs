//! SeaORM entity models for the SQLite schema.
//!
//! Timestamps are RFC3339 TEXT, UUIDs are TEXT; the store module owns the
//! conversions to and from domain types.

use sea_orm::entity::prelude::*;

// sessions table
#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel)]
#[sea_orm(table_name = "sessions")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: String,
    pub user_id: String,
    pub image: String,
    pub status: String,
    pub container_ref: Option<String>,
    pub memory_bytes: i64,
    pub cpu_shares: i64,
    pub pids_max: i64,
    pub created_at: String,
    pub last_activity_at: String,
    pub detached_at: Option<String>,
    pub expires_at: Option<String>,
    /// JSON-encoded opaque key-value map.
    pub metadata: String,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}

pub mod audit_logs {
    use sea_orm::entity::prelude::*;

    #[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel)]
    #[sea_orm(table_name = "audit_logs")]
    pub struct Model {
        #[sea_orm(primary_key)]
        pub seq: i64,
        pub session_id: Option<String>,
        pub user_id: String,
        pub kind: String,
        /// JSON-encoded bounded payload.
        pub payload: String,
        pub created_at: String,
    }

    #[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
    pub enum Relation {}

    impl ActiveModelBehavior for ActiveModel {}
}

pub mod rate_limits {
    use sea_orm::entity::prelude::*;

    #[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel)]
    #[sea_orm(table_name = "rate_limits")]
    pub struct Model {
        #[sea_orm(primary_key)]
        pub seq: i64,
        pub identifier: String,
        pub endpoint: String,
        pub window_start: String,
        pub request_count: i64,
    }

    #[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
    pub enum Relation {}

    impl ActiveModelBehavior for ActiveModel {}
}

pub mod container_metrics {
    use sea_orm::entity::prelude::*;

    #[derive(Clone, Debug, PartialEq, DeriveEntityModel)]
    #[sea_orm(table_name = "container_metrics")]
    pub struct Model {
        #[sea_orm(primary_key)]
        pub seq: i64,
        pub session_id: String,
        pub cpu_percent: Option<f64>,
        pub memory_usage_bytes: Option<i64>,
        pub memory_limit_bytes: Option<i64>,
        pub recorded_at: String,
    }

    #[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
    pub enum Relation {}

    impl ActiveModelBehavior for ActiveModel {}
}

pub mod security_events {
    use sea_orm::entity::prelude::*;

    #[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel)]
    #[sea_orm(table_name = "security_events")]
    pub struct Model {
        #[sea_orm(primary_key)]
        pub seq: i64,
        pub session_id: Option<String>,
        pub user_id: String,
        pub kind: String,
        pub severity: String,
        pub detail: Option<String>,
        pub created_at: String,
    }

    #[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
    pub enum Relation {}

    impl ActiveModelBehavior for ActiveModel {}
}
