//! SQLite-backed metadata store.
//!
//! The store is the single authoritative shared state of the broker:
//! every session status change flows through a compare-and-set here, so
//! the session manager itself can stay stateless and crash-safe.

use std::collections::HashMap;

use chrono::{DateTime, Duration as ChronoDuration, SecondsFormat, Timelike, Utc};
use log::debug;
use sea_orm::sea_query::{Expr, OnConflict};
use sea_orm::{
    ColumnTrait, ConnectOptions, ConnectionTrait, Database, DatabaseConnection, DbBackend,
    EntityTrait, PaginatorTrait, QueryFilter, QueryOrder, QuerySelect, Set, Statement,
};
use uuid::Uuid;

use crate::error_handling::types::StorageError;
use crate::session_management::session::{Session, SessionStatus};
use crate::storage::entities::{
    self, audit_logs, container_metrics, rate_limits, security_events,
};
use crate::storage::types::{AuditKind, AuditRecord, MetricSample, SecuritySeverity};

const SCHEMA: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS sessions (
        id TEXT PRIMARY KEY,
        user_id TEXT NOT NULL,
        image TEXT NOT NULL,
        status TEXT NOT NULL,
        container_ref TEXT,
        memory_bytes INTEGER NOT NULL,
        cpu_shares INTEGER NOT NULL,
        pids_max INTEGER NOT NULL,
        created_at TEXT NOT NULL,
        last_activity_at TEXT NOT NULL,
        detached_at TEXT,
        expires_at TEXT,
        metadata TEXT NOT NULL
    );
    "#,
    "CREATE INDEX IF NOT EXISTS idx_sessions_user_id ON sessions(user_id);",
    "CREATE INDEX IF NOT EXISTS idx_sessions_status ON sessions(status);",
    "CREATE INDEX IF NOT EXISTS idx_sessions_expires_at ON sessions(expires_at) WHERE expires_at IS NOT NULL;",
    r#"
    CREATE TABLE IF NOT EXISTS audit_logs (
        seq INTEGER PRIMARY KEY AUTOINCREMENT,
        session_id TEXT,
        user_id TEXT NOT NULL,
        kind TEXT NOT NULL,
        payload TEXT NOT NULL,
        created_at TEXT NOT NULL
    );
    "#,
    "CREATE INDEX IF NOT EXISTS idx_audit_logs_created_at ON audit_logs(created_at);",
    r#"
    CREATE TABLE IF NOT EXISTS rate_limits (
        seq INTEGER PRIMARY KEY AUTOINCREMENT,
        identifier TEXT NOT NULL,
        endpoint TEXT NOT NULL,
        window_start TEXT NOT NULL,
        request_count INTEGER NOT NULL,
        UNIQUE(identifier, endpoint, window_start)
    );
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS container_metrics (
        seq INTEGER PRIMARY KEY AUTOINCREMENT,
        session_id TEXT NOT NULL,
        cpu_percent REAL,
        memory_usage_bytes INTEGER,
        memory_limit_bytes INTEGER,
        recorded_at TEXT NOT NULL
    );
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS security_events (
        seq INTEGER PRIMARY KEY AUTOINCREMENT,
        session_id TEXT,
        user_id TEXT NOT NULL,
        kind TEXT NOT NULL,
        severity TEXT NOT NULL,
        detail TEXT,
        created_at TEXT NOT NULL
    );
    "#,
];

pub struct MetadataStore {
    conn: DatabaseConnection,
}

impl MetadataStore {
    /// Opens (creating if needed) the database file at `path`.
    pub async fn connect(path: &str) -> Result<Self, StorageError> {
        let dsn = format!("sqlite://{}?mode=rwc", path);
        Self::connect_dsn(&dsn).await
    }

    /// A private in-memory database; used by tests.
    pub async fn connect_in_memory() -> Result<Self, StorageError> {
        Self::connect_dsn("sqlite::memory:").await
    }

    async fn connect_dsn(dsn: &str) -> Result<Self, StorageError> {
        let mut options = ConnectOptions::new(dsn.to_string());
        options.sqlx_logging(false);
        if dsn.contains(":memory:") {
            // Pooled in-memory connections each see their own database;
            // pin the pool to one connection so the schema survives.
            options.max_connections(1).min_connections(1);
        }

        let conn = Database::connect(options)
            .await
            .map_err(|e| StorageError::ConnectionFailed(e.to_string()))?;

        for statement in SCHEMA {
            conn.execute(Statement::from_string(
                DbBackend::Sqlite,
                statement.to_string(),
            ))
            .await?;
        }

        debug!("Metadata store ready at {}", dsn);
        Ok(Self { conn })
    }

    // ------------------------------------------------------------------
    // Sessions
    // ------------------------------------------------------------------

    /// Inserts a new session row; fails with `Conflict` when the id exists.
    pub async fn insert_session(&self, session: &Session) -> Result<(), StorageError> {
        if entities::Entity::find_by_id(session.id.to_string())
            .one(&self.conn)
            .await?
            .is_some()
        {
            return Err(StorageError::Conflict);
        }

        entities::Entity::insert(to_model(session))
            .exec(&self.conn)
            .await
            .map_err(|_| StorageError::Conflict)?;
        Ok(())
    }

    pub async fn get_session(&self, id: Uuid) -> Result<Option<Session>, StorageError> {
        match entities::Entity::find_by_id(id.to_string())
            .one(&self.conn)
            .await?
        {
            Some(model) => Ok(Some(from_model(model)?)),
            None => Ok(None),
        }
    }

    pub async fn list_by_user(
        &self,
        user_id: &str,
        limit: u64,
    ) -> Result<Vec<Session>, StorageError> {
        let rows = entities::Entity::find()
            .filter(entities::Column::UserId.eq(user_id))
            .order_by_desc(entities::Column::CreatedAt)
            .limit(limit)
            .all(&self.conn)
            .await?;
        rows.into_iter().map(from_model).collect()
    }

    /// Sessions counting against the user's quota (not yet terminal).
    pub async fn count_live_by_user(&self, user_id: &str) -> Result<i64, StorageError> {
        let count = entities::Entity::find()
            .filter(entities::Column::UserId.eq(user_id))
            .filter(entities::Column::Status.is_not_in(vec![
                SessionStatus::Terminated.as_str(),
                SessionStatus::Failed.as_str(),
            ]))
            .count(&self.conn)
            .await?;
        Ok(count as i64)
    }

    pub async fn sessions_with_status(
        &self,
        statuses: &[SessionStatus],
    ) -> Result<Vec<Session>, StorageError> {
        let names: Vec<&str> = statuses.iter().map(|s| s.as_str()).collect();
        let rows = entities::Entity::find()
            .filter(entities::Column::Status.is_in(names))
            .all(&self.conn)
            .await?;
        rows.into_iter().map(from_model).collect()
    }

    /// Detached sessions whose `expires_at` has passed.
    pub async fn expired_detached(&self, now: DateTime<Utc>) -> Result<Vec<Uuid>, StorageError> {
        let rows = entities::Entity::find()
            .filter(entities::Column::Status.eq(SessionStatus::Detached.as_str()))
            .filter(entities::Column::ExpiresAt.is_not_null())
            .filter(entities::Column::ExpiresAt.lt(fmt_ts(now)))
            .all(&self.conn)
            .await?;
        ids_of(rows)
    }

    /// Ready sessions that were never attached before `cutoff`.
    pub async fn expired_ready(&self, cutoff: DateTime<Utc>) -> Result<Vec<Uuid>, StorageError> {
        let rows = entities::Entity::find()
            .filter(entities::Column::Status.eq(SessionStatus::Ready.as_str()))
            .filter(entities::Column::CreatedAt.lt(fmt_ts(cutoff)))
            .all(&self.conn)
            .await?;
        ids_of(rows)
    }

    /// Terminated rows past the audit-visibility grace window.
    pub async fn stale_terminated(&self, cutoff: DateTime<Utc>) -> Result<Vec<Uuid>, StorageError> {
        let rows = entities::Entity::find()
            .filter(entities::Column::Status.eq(SessionStatus::Terminated.as_str()))
            .filter(entities::Column::LastActivityAt.lt(fmt_ts(cutoff)))
            .all(&self.conn)
            .await?;
        ids_of(rows)
    }

    pub async fn delete(&self, id: Uuid) -> Result<(), StorageError> {
        entities::Entity::delete_by_id(id.to_string())
            .exec(&self.conn)
            .await?;
        Ok(())
    }

    /// Unconditionally refreshes `last_activity_at`.
    pub async fn touch(&self, id: Uuid, now: DateTime<Utc>) -> Result<(), StorageError> {
        entities::Entity::update_many()
            .col_expr(entities::Column::LastActivityAt, Expr::value(fmt_ts(now)))
            .filter(entities::Column::Id.eq(id.to_string()))
            .exec(&self.conn)
            .await?;
        Ok(())
    }

    /// Compare-and-set status transition. The losing side of a race
    /// observes `StalePrecondition`.
    pub async fn update_status(
        &self,
        id: Uuid,
        from: SessionStatus,
        to: SessionStatus,
        now: DateTime<Utc>,
    ) -> Result<Session, StorageError> {
        self.cas(id, from, to, now, |update| update).await
    }

    /// `Creating -> Ready`, recording the engine-assigned container.
    pub async fn mark_ready(
        &self,
        id: Uuid,
        container_ref: &str,
        now: DateTime<Utc>,
    ) -> Result<Session, StorageError> {
        let container_ref = container_ref.to_string();
        self.cas(id, SessionStatus::Creating, SessionStatus::Ready, now, |update| {
            update.col_expr(
                entities::Column::ContainerRef,
                Expr::value(Some(container_ref)),
            )
        })
        .await
    }

    /// `Ready|Detached -> Attached`, clearing detach bookkeeping.
    pub async fn mark_attached(
        &self,
        id: Uuid,
        from: SessionStatus,
        now: DateTime<Utc>,
    ) -> Result<Session, StorageError> {
        self.cas(id, from, SessionStatus::Attached, now, |update| {
            update
                .col_expr(entities::Column::DetachedAt, Expr::value(Option::<String>::None))
                .col_expr(entities::Column::ExpiresAt, Expr::value(Option::<String>::None))
        })
        .await
    }

    /// `from -> Detached`, stamping the eviction deadline.
    pub async fn mark_detached(
        &self,
        id: Uuid,
        from: SessionStatus,
        expires_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<Session, StorageError> {
        self.cas(id, from, SessionStatus::Detached, now, |update| {
            update
                .col_expr(entities::Column::DetachedAt, Expr::value(Some(fmt_ts(now))))
                .col_expr(
                    entities::Column::ExpiresAt,
                    Expr::value(Some(fmt_ts(expires_at))),
                )
        })
        .await
    }

    /// `from -> Terminated`, releasing the container reference.
    pub async fn mark_terminated(
        &self,
        id: Uuid,
        from: SessionStatus,
        now: DateTime<Utc>,
    ) -> Result<Session, StorageError> {
        self.cas(id, from, SessionStatus::Terminated, now, |update| {
            update.col_expr(
                entities::Column::ContainerRef,
                Expr::value(Option::<String>::None),
            )
        })
        .await
    }

    /// `from -> Failed`. `clear_ref` is false when cleanup was abandoned
    /// and the handle is intentionally left for the orphan reaper.
    pub async fn mark_failed(
        &self,
        id: Uuid,
        from: SessionStatus,
        clear_ref: bool,
        now: DateTime<Utc>,
    ) -> Result<Session, StorageError> {
        self.cas(id, from, SessionStatus::Failed, now, |update| {
            if clear_ref {
                update.col_expr(
                    entities::Column::ContainerRef,
                    Expr::value(Option::<String>::None),
                )
            } else {
                update
            }
        })
        .await
    }

    async fn cas<F>(
        &self,
        id: Uuid,
        from: SessionStatus,
        to: SessionStatus,
        now: DateTime<Utc>,
        extra: F,
    ) -> Result<Session, StorageError>
    where
        F: FnOnce(
            sea_orm::UpdateMany<entities::Entity>,
        ) -> sea_orm::UpdateMany<entities::Entity>,
    {
        let update = entities::Entity::update_many()
            .col_expr(entities::Column::Status, Expr::value(to.as_str()))
            .col_expr(entities::Column::LastActivityAt, Expr::value(fmt_ts(now)));

        let result = extra(update)
            .filter(entities::Column::Id.eq(id.to_string()))
            .filter(entities::Column::Status.eq(from.as_str()))
            .exec(&self.conn)
            .await?;

        if result.rows_affected == 0 {
            return Err(StorageError::StalePrecondition);
        }

        self.get_session(id).await?.ok_or(StorageError::NotFound)
    }

    // ------------------------------------------------------------------
    // Audit and security events
    // ------------------------------------------------------------------

    pub async fn append_audit(
        &self,
        session_id: Option<Uuid>,
        user_id: &str,
        kind: AuditKind,
        payload: serde_json::Value,
        now: DateTime<Utc>,
    ) -> Result<(), StorageError> {
        let row = audit_logs::ActiveModel {
            session_id: Set(session_id.map(|id| id.to_string())),
            user_id: Set(user_id.to_string()),
            kind: Set(kind.as_str().to_string()),
            payload: Set(payload.to_string()),
            created_at: Set(fmt_ts(now)),
            ..Default::default()
        };
        audit_logs::Entity::insert(row).exec(&self.conn).await?;
        debug!("Audit {} for user {}", kind, user_id);
        Ok(())
    }

    pub async fn audit_for_session(
        &self,
        session_id: Uuid,
        limit: u64,
    ) -> Result<Vec<AuditRecord>, StorageError> {
        let rows = audit_logs::Entity::find()
            .filter(audit_logs::Column::SessionId.eq(session_id.to_string()))
            .order_by_desc(audit_logs::Column::Seq)
            .limit(limit)
            .all(&self.conn)
            .await?;
        rows.into_iter().map(audit_record).collect()
    }

    pub async fn recent_audit(&self, limit: u64) -> Result<Vec<AuditRecord>, StorageError> {
        let rows = audit_logs::Entity::find()
            .order_by_desc(audit_logs::Column::Seq)
            .limit(limit)
            .all(&self.conn)
            .await?;
        rows.into_iter().map(audit_record).collect()
    }

    pub async fn append_security(
        &self,
        session_id: Option<Uuid>,
        user_id: &str,
        kind: &str,
        severity: SecuritySeverity,
        detail: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<(), StorageError> {
        let row = security_events::ActiveModel {
            session_id: Set(session_id.map(|id| id.to_string())),
            user_id: Set(user_id.to_string()),
            kind: Set(kind.to_string()),
            severity: Set(severity.as_str().to_string()),
            detail: Set(detail.map(|d| d.to_string())),
            created_at: Set(fmt_ts(now)),
            ..Default::default()
        };
        security_events::Entity::insert(row).exec(&self.conn).await?;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Rate limiting
    // ------------------------------------------------------------------

    /// Atomically bumps the counter for the current window and returns
    /// the post-increment count.
    pub async fn incr_rate(
        &self,
        identifier: &str,
        endpoint: &str,
        now: DateTime<Utc>,
    ) -> Result<i64, StorageError> {
        let window = fmt_ts(minute_window(now));

        let row = rate_limits::ActiveModel {
            identifier: Set(identifier.to_string()),
            endpoint: Set(endpoint.to_string()),
            window_start: Set(window.clone()),
            request_count: Set(1),
            ..Default::default()
        };

        rate_limits::Entity::insert(row)
            .on_conflict(
                OnConflict::columns([
                    rate_limits::Column::Identifier,
                    rate_limits::Column::Endpoint,
                    rate_limits::Column::WindowStart,
                ])
                .value(
                    rate_limits::Column::RequestCount,
                    Expr::col(rate_limits::Column::RequestCount).add(1),
                )
                .to_owned(),
            )
            .exec(&self.conn)
            .await?;

        let count = rate_limits::Entity::find()
            .filter(rate_limits::Column::Identifier.eq(identifier))
            .filter(rate_limits::Column::Endpoint.eq(endpoint))
            .filter(rate_limits::Column::WindowStart.eq(window))
            .one(&self.conn)
            .await?
            .map(|row| row.request_count)
            .unwrap_or(0);

        Ok(count)
    }

    // ------------------------------------------------------------------
    // Metrics and retention
    // ------------------------------------------------------------------

    pub async fn append_metrics(
        &self,
        sample: &MetricSample,
        now: DateTime<Utc>,
    ) -> Result<(), StorageError> {
        let row = container_metrics::ActiveModel {
            session_id: Set(sample.session_id.to_string()),
            cpu_percent: Set(sample.cpu_percent),
            memory_usage_bytes: Set(sample.memory_usage_bytes),
            memory_limit_bytes: Set(sample.memory_limit_bytes),
            recorded_at: Set(fmt_ts(now)),
            ..Default::default()
        };
        container_metrics::Entity::insert(row).exec(&self.conn).await?;
        Ok(())
    }

    /// Drops audit/metric/security rows older than 24 h and rate-limit
    /// windows older than 1 h.
    pub async fn purge_expired(&self, now: DateTime<Utc>) -> Result<(), StorageError> {
        let day_ago = fmt_ts(now - ChronoDuration::hours(24));
        let hour_ago = fmt_ts(now - ChronoDuration::hours(1));

        audit_logs::Entity::delete_many()
            .filter(audit_logs::Column::CreatedAt.lt(day_ago.clone()))
            .exec(&self.conn)
            .await?;
        container_metrics::Entity::delete_many()
            .filter(container_metrics::Column::RecordedAt.lt(day_ago.clone()))
            .exec(&self.conn)
            .await?;
        security_events::Entity::delete_many()
            .filter(security_events::Column::CreatedAt.lt(day_ago))
            .exec(&self.conn)
            .await?;
        rate_limits::Entity::delete_many()
            .filter(rate_limits::Column::WindowStart.lt(hour_ago))
            .exec(&self.conn)
            .await?;
        Ok(())
    }
}

// ----------------------------------------------------------------------
// Conversions
// ----------------------------------------------------------------------

fn fmt_ts(ts: DateTime<Utc>) -> String {
    // Fixed-width so lexicographic TEXT comparison matches time order.
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_ts(raw: &str) -> Result<DateTime<Utc>, StorageError> {
    DateTime::parse_from_rfc3339(raw)
        .map(|ts| ts.with_timezone(&Utc))
        .map_err(|e| StorageError::CorruptRecord(format!("bad timestamp {}: {}", raw, e)))
}

fn minute_window(now: DateTime<Utc>) -> DateTime<Utc> {
    now.with_second(0)
        .and_then(|ts| ts.with_nanosecond(0))
        .unwrap_or(now)
}

fn ids_of(rows: Vec<entities::Model>) -> Result<Vec<Uuid>, StorageError> {
    rows.iter()
        .map(|row| {
            Uuid::parse_str(&row.id)
                .map_err(|e| StorageError::CorruptRecord(format!("bad uuid {}: {}", row.id, e)))
        })
        .collect()
}

fn to_model(session: &Session) -> entities::ActiveModel {
    entities::ActiveModel {
        id: Set(session.id.to_string()),
        user_id: Set(session.user_id.clone()),
        image: Set(session.image.clone()),
        status: Set(session.status.as_str().to_string()),
        container_ref: Set(session.container_ref.clone()),
        memory_bytes: Set(session.resource_limits.memory_bytes),
        cpu_shares: Set(session.resource_limits.cpu_shares),
        pids_max: Set(session.resource_limits.pids_max),
        created_at: Set(fmt_ts(session.created_at)),
        last_activity_at: Set(fmt_ts(session.last_activity_at)),
        detached_at: Set(session.detached_at.map(fmt_ts)),
        expires_at: Set(session.expires_at.map(fmt_ts)),
        metadata: Set(serde_json::to_string(&session.metadata).unwrap_or_else(|_| "{}".to_string())),
    }
}

fn from_model(model: entities::Model) -> Result<Session, StorageError> {
    let status = SessionStatus::parse(&model.status)
        .ok_or_else(|| StorageError::CorruptRecord(format!("bad status {}", model.status)))?;
    let metadata: HashMap<String, String> = serde_json::from_str(&model.metadata)
        .map_err(|e| StorageError::CorruptRecord(format!("bad metadata: {}", e)))?;

    Ok(Session {
        id: Uuid::parse_str(&model.id)
            .map_err(|e| StorageError::CorruptRecord(format!("bad uuid {}: {}", model.id, e)))?,
        user_id: model.user_id,
        image: model.image,
        status,
        container_ref: model.container_ref,
        resource_limits: crate::container_runtime::types::ResourceLimits {
            memory_bytes: model.memory_bytes,
            cpu_shares: model.cpu_shares,
            pids_max: model.pids_max,
        },
        created_at: parse_ts(&model.created_at)?,
        last_activity_at: parse_ts(&model.last_activity_at)?,
        detached_at: model.detached_at.as_deref().map(parse_ts).transpose()?,
        expires_at: model.expires_at.as_deref().map(parse_ts).transpose()?,
        metadata,
    })
}

fn audit_record(model: audit_logs::Model) -> Result<AuditRecord, StorageError> {
    Ok(AuditRecord {
        seq: model.seq,
        session_id: model
            .session_id
            .as_deref()
            .map(Uuid::parse_str)
            .transpose()
            .map_err(|e| StorageError::CorruptRecord(format!("bad uuid: {}", e)))?,
        user_id: model.user_id,
        kind: model.kind,
        payload: serde_json::from_str(&model.payload)
            .map_err(|e| StorageError::CorruptRecord(format!("bad payload: {}", e)))?,
        created_at: parse_ts(&model.created_at)?,
    })
}
