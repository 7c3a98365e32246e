//! Postgres-backed aggregation store.
//!
//! Groups live in `reducer_groups`, their members in `reducer_members`
//! (one row per member, primary key `(correlation_id, event_id)`, so
//! de-duplication is enforced by the database as well as by the domain).
//!
//! ## Atomicity
//!
//! | Operation | Mechanism |
//! |-----------|-----------|
//! | `register_member` | `INSERT .. ON CONFLICT DO NOTHING` for the group, then `SELECT .. FOR UPDATE` and the member insert in the same transaction |
//! | `try_complete` / `try_dismiss` | `UPDATE .. WHERE status = 'open'` (one winner) |
//! | `mark_trigger_scheduled` | `UPDATE .. WHERE NOT trigger_scheduled` |
//! | `purge_finalized` | `UPDATE .. SET compacted_at .. RETURNING` and the member delete in one transaction |
//!
//! ## Error Mapping
//!
//! | SQLx Error | PostgreSQL Error Code | StoreError |
//! |------------|----------------------|------------|
//! | Database (unique violation) | `23505` | `ConcurrentModification` |
//! | Database (serialization failure / deadlock) | `40001` / `40P01` | `ConcurrentModification` |
//! | Database (other) | Any other | `Unavailable` |
//! | Io / Tls / PoolTimedOut / PoolClosed | N/A | `Unavailable` |
//! | Decode / ColumnDecode | N/A | `Corrupt` |
//!
//! ## Runtime
//!
//! The `AggregationStore` trait is synchronous. Inside a tokio runtime the
//! trait impl bridges into the async inherent methods with `block_in_place`.
//! That needs a multi-threaded runtime: on a current-thread runtime the sync
//! methods fail with `Unavailable` and callers must use the async methods.
//! On plain threads, such as the trigger dispatcher, it blocks on the runtime
//! the store was created on.

use std::future::Future;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use sqlx::{FromRow, PgPool, Postgres, Row, Transaction};
use tokio::runtime::{Handle, RuntimeFlavor};
use tracing::{debug, instrument};

use docreduce_core::{
    CorrelationId, Group, GroupSeed, GroupStatus, MemberDisposition, MemberEventId, MemberRef,
    StrategyKind,
};

use super::query::GroupQuery;
use super::r#trait::{AggregationStore, Registration, StoreError, Transition};

/// Schema statements, applied in order by [`PostgresAggregationStore::ensure_schema`].
const SCHEMA: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS reducer_groups (
        correlation_id    TEXT PRIMARY KEY,
        strategy_kind     TEXT NOT NULL,
        status            TEXT NOT NULL DEFAULT 'open',
        expected_count    BIGINT NULL,
        deadline_at       TIMESTAMPTZ NULL,
        created_at        TIMESTAMPTZ NOT NULL,
        dismiss_after     TIMESTAMPTZ NOT NULL,
        trigger_scheduled BOOLEAN NOT NULL DEFAULT FALSE,
        finalized_at      TIMESTAMPTZ NULL,
        published_at      TIMESTAMPTZ NULL,
        compacted_at      TIMESTAMPTZ NULL,
        version           BIGINT NOT NULL DEFAULT 0
    )
    "#,
    "ALTER TABLE reducer_groups ADD COLUMN IF NOT EXISTS compacted_at TIMESTAMPTZ NULL",
    r#"
    CREATE TABLE IF NOT EXISTS reducer_members (
        correlation_id   TEXT NOT NULL REFERENCES reducer_groups (correlation_id) ON DELETE CASCADE,
        event_id         TEXT NOT NULL,
        position         INTEGER NOT NULL,
        arrived_at       TIMESTAMPTZ NOT NULL,
        source_metadata  JSONB NOT NULL DEFAULT 'null'::jsonb,
        document_pointer TEXT NOT NULL,
        PRIMARY KEY (correlation_id, event_id)
    )
    "#,
    "CREATE INDEX IF NOT EXISTS reducer_groups_status_dismiss_idx ON reducer_groups (status, dismiss_after)",
    "CREATE INDEX IF NOT EXISTS reducer_groups_finalized_idx ON reducer_groups (finalized_at) WHERE status <> 'open'",
];

const GROUP_COLUMNS: &str = "correlation_id, strategy_kind, status, expected_count, deadline_at, \
     created_at, dismiss_after, trigger_scheduled, finalized_at, published_at, compacted_at, version";

const MEMBER_COLUMNS: &str =
    "correlation_id, event_id, arrived_at, source_metadata, document_pointer";

/// Postgres-backed aggregation store.
///
/// `Send + Sync`; clones share the same pool.
#[derive(Debug, Clone)]
pub struct PostgresAggregationStore {
    pool: Arc<PgPool>,
    /// Runtime the store was created on, used by sync callers on plain threads.
    runtime: Option<Handle>,
}

impl PostgresAggregationStore {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool: Arc::new(pool),
            runtime: Handle::try_current().ok(),
        }
    }

    /// Connect to `database_url` and make sure the tables exist.
    pub async fn connect(database_url: &str) -> Result<Self, StoreError> {
        let pool = PgPool::connect(database_url)
            .await
            .map_err(|e| map_sqlx_error("connect", e))?;
        let store = Self::new(pool);
        store.ensure_schema().await?;
        Ok(store)
    }

    /// Create tables and indexes if missing. Idempotent.
    pub async fn ensure_schema(&self) -> Result<(), StoreError> {
        for statement in SCHEMA {
            sqlx::query(statement)
                .execute(&*self.pool)
                .await
                .map_err(|e| map_sqlx_error("ensure_schema", e))?;
        }
        Ok(())
    }

    #[instrument(skip(self, member, seed), fields(correlation_id = %correlation_id, event_id = %member.event_id), err)]
    pub async fn register(
        &self,
        correlation_id: &CorrelationId,
        member: MemberRef,
        seed: GroupSeed,
    ) -> Result<Registration, StoreError> {
        let mut tx = self.begin("register_member").await?;

        // First arrival wins: later seeds are discarded by the conflict clause.
        let inserted = sqlx::query(
            r#"
            INSERT INTO reducer_groups
                (correlation_id, strategy_kind, status, expected_count, deadline_at, created_at, dismiss_after)
            VALUES ($1, $2, 'open', $3, $4, $5, $6)
            ON CONFLICT (correlation_id) DO NOTHING
            "#,
        )
        .bind(correlation_id.as_str())
        .bind(seed.strategy_kind.as_str())
        .bind(seed.expected_count.map(i64::from))
        .bind(seed.deadline_at)
        .bind(seed.created_at)
        .bind(seed.dismiss_after)
        .execute(&mut *tx)
        .await
        .map_err(|e| map_sqlx_error("register_member", e))?;
        let is_new_group = inserted.rows_affected() == 1;

        // Serializes concurrent registrations for the same correlation id.
        let mut group = fetch_group_for_update(&mut tx, correlation_id)
            .await?
            .ok_or_else(|| StoreError::NotFound(correlation_id.clone()))?;

        let disposition = group.append(member.clone());
        if disposition == MemberDisposition::Added {
            let position = i32::try_from(group.member_count() - 1)
                .map_err(|_| StoreError::Corrupt("member position overflow".to_string()))?;

            sqlx::query(
                r#"
                INSERT INTO reducer_members
                    (correlation_id, event_id, position, arrived_at, source_metadata, document_pointer)
                VALUES ($1, $2, $3, $4, $5, $6)
                "#,
            )
            .bind(correlation_id.as_str())
            .bind(member.event_id.as_str())
            .bind(position)
            .bind(member.arrived_at)
            .bind(&member.source_metadata)
            .bind(&member.document_pointer)
            .execute(&mut *tx)
            .await
            .map_err(|e| map_sqlx_error("register_member", e))?;

            sqlx::query("UPDATE reducer_groups SET version = $2 WHERE correlation_id = $1")
                .bind(correlation_id.as_str())
                .bind(to_db_version(group.version)?)
                .execute(&mut *tx)
                .await
                .map_err(|e| map_sqlx_error("register_member", e))?;
        }

        tx.commit()
            .await
            .map_err(|e| map_sqlx_error("register_member", e))?;

        debug!(?disposition, is_new_group, members = group.member_count(), "member registered");
        Ok(Registration {
            group,
            is_new_group,
            disposition,
        })
    }

    #[instrument(skip(self), fields(correlation_id = %correlation_id, status = %status), err)]
    pub async fn finalize(
        &self,
        correlation_id: &CorrelationId,
        status: GroupStatus,
        at: DateTime<Utc>,
    ) -> Result<Transition, StoreError> {
        if !status.is_terminal() {
            return Err(StoreError::InvalidTransition(format!(
                "cannot finalize group '{correlation_id}' into {status}"
            )));
        }

        let mut tx = self.begin("finalize").await?;

        let updated = sqlx::query(
            r#"
            UPDATE reducer_groups
            SET status = $2, finalized_at = $3, version = version + 1
            WHERE correlation_id = $1 AND status = 'open'
            "#,
        )
        .bind(correlation_id.as_str())
        .bind(status.as_str())
        .bind(at)
        .execute(&mut *tx)
        .await
        .map_err(|e| map_sqlx_error("finalize", e))?;

        let group = fetch_group(&mut tx, correlation_id)
            .await?
            .ok_or_else(|| StoreError::NotFound(correlation_id.clone()))?;

        tx.commit().await.map_err(|e| map_sqlx_error("finalize", e))?;

        Ok(Transition {
            won: updated.rows_affected() == 1,
            group,
        })
    }

    #[instrument(skip(self), fields(correlation_id = %correlation_id), err)]
    pub async fn set_trigger_scheduled(
        &self,
        correlation_id: &CorrelationId,
    ) -> Result<bool, StoreError> {
        let updated = sqlx::query(
            r#"
            UPDATE reducer_groups
            SET trigger_scheduled = TRUE, version = version + 1
            WHERE correlation_id = $1 AND NOT trigger_scheduled
            "#,
        )
        .bind(correlation_id.as_str())
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("mark_trigger_scheduled", e))?;

        if updated.rows_affected() == 1 {
            return Ok(true);
        }
        if self.exists(correlation_id).await? {
            Ok(false)
        } else {
            Err(StoreError::NotFound(correlation_id.clone()))
        }
    }

    #[instrument(skip(self), fields(correlation_id = %correlation_id), err)]
    pub async fn set_published(
        &self,
        correlation_id: &CorrelationId,
        at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let updated = sqlx::query(
            r#"
            UPDATE reducer_groups
            SET published_at = COALESCE(published_at, $2),
                version = version + CASE WHEN published_at IS NULL THEN 1 ELSE 0 END
            WHERE correlation_id = $1 AND status = 'completed'
            "#,
        )
        .bind(correlation_id.as_str())
        .bind(at)
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("mark_published", e))?;

        if updated.rows_affected() == 1 {
            return Ok(());
        }
        match self.load_group(correlation_id).await? {
            None => Err(StoreError::NotFound(correlation_id.clone())),
            Some(group) => Err(StoreError::InvalidTransition(format!(
                "cannot publish group '{correlation_id}' in status {}",
                group.status
            ))),
        }
    }

    #[instrument(skip(self), fields(correlation_id = %correlation_id), err)]
    pub async fn load_group(
        &self,
        correlation_id: &CorrelationId,
    ) -> Result<Option<Group>, StoreError> {
        let mut tx = self.begin("load").await?;
        let group = fetch_group(&mut tx, correlation_id).await?;
        tx.commit().await.map_err(|e| map_sqlx_error("load", e))?;
        Ok(group)
    }

    /// Scan groups matching `query`, ordered by creation time.
    #[instrument(skip(self), err)]
    pub async fn list_groups(&self, query: &GroupQuery) -> Result<Vec<Group>, StoreError> {
        let limit = i64::try_from(query.limit).unwrap_or(i64::MAX);

        // COALESCE-style optional filters keep this a single prepared statement.
        let sql = format!(
            r#"
            SELECT {GROUP_COLUMNS}
            FROM reducer_groups
            WHERE ($1::text IS NULL OR status = $1)
              AND ($2::text IS NULL OR strategy_kind = $2)
              AND ($3::timestamptz IS NULL OR dismiss_after <= $3)
              AND ($4::timestamptz IS NULL OR deadline_at <= $4)
              AND (NOT $5 OR published_at IS NULL)
            ORDER BY created_at ASC, correlation_id ASC
            LIMIT $6
            "#
        );

        let rows = sqlx::query(&sql)
            .bind(query.status.map(GroupStatus::as_str))
            .bind(query.strategy_kind.map(StrategyKind::as_str))
            .bind(query.dismiss_after_at_or_before)
            .bind(query.deadline_at_or_before)
            .bind(query.unpublished_only)
            .bind(limit)
            .fetch_all(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("list", e))?;

        let mut groups = rows
            .iter()
            .map(|row| GroupRow::from_row(row).map_err(|e| map_sqlx_error("list", e)))
            .map(|row| row.and_then(GroupRow::into_group))
            .collect::<Result<Vec<_>, _>>()?;
        if groups.is_empty() {
            return Ok(groups);
        }

        let ids: Vec<String> = groups
            .iter()
            .map(|g| g.correlation_id.as_str().to_string())
            .collect();
        let member_rows = sqlx::query(&format!(
            "SELECT {MEMBER_COLUMNS} FROM reducer_members \
             WHERE correlation_id = ANY($1) ORDER BY correlation_id, position ASC"
        ))
        .bind(&ids)
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("list", e))?;

        for row in &member_rows {
            let member = MemberRow::from_row(row).map_err(|e| map_sqlx_error("list", e))?;
            if let Some(group) = groups
                .iter_mut()
                .find(|g| g.correlation_id.as_str() == member.correlation_id)
            {
                group.members.push(member.into_member_ref()?);
            }
        }

        Ok(groups)
    }

    /// Compact settled groups finalized before `before`: the group row stays
    /// as a tombstone, its member rows are deleted.
    #[instrument(skip(self), err)]
    pub async fn purge(
        &self,
        before: DateTime<Utc>,
        at: DateTime<Utc>,
    ) -> Result<usize, StoreError> {
        let mut tx = self.begin("purge_finalized").await?;

        let compacted: Vec<String> = sqlx::query_scalar(
            r#"
            UPDATE reducer_groups
            SET compacted_at = $2, version = version + 1
            WHERE status <> 'open'
              AND finalized_at < $1
              AND compacted_at IS NULL
              AND (status = 'dismissed' OR published_at IS NOT NULL)
            RETURNING correlation_id
            "#,
        )
        .bind(before)
        .bind(at)
        .fetch_all(&mut *tx)
        .await
        .map_err(|e| map_sqlx_error("purge_finalized", e))?;

        if !compacted.is_empty() {
            sqlx::query("DELETE FROM reducer_members WHERE correlation_id = ANY($1)")
                .bind(&compacted)
                .execute(&mut *tx)
                .await
                .map_err(|e| map_sqlx_error("purge_finalized", e))?;
        }

        tx.commit()
            .await
            .map_err(|e| map_sqlx_error("purge_finalized", e))?;

        debug!(compacted = compacted.len(), "finalized groups compacted");
        Ok(compacted.len())
    }

    async fn exists(&self, correlation_id: &CorrelationId) -> Result<bool, StoreError> {
        let row = sqlx::query("SELECT 1 FROM reducer_groups WHERE correlation_id = $1")
            .bind(correlation_id.as_str())
            .fetch_optional(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("exists", e))?;
        Ok(row.is_some())
    }

    async fn begin(&self, operation: &str) -> Result<Transaction<'static, Postgres>, StoreError> {
        self.pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error(operation, e))
    }

    fn block_on<T>(
        &self,
        fut: impl Future<Output = Result<T, StoreError>>,
    ) -> Result<T, StoreError> {
        match Handle::try_current() {
            Ok(handle) => match handle.runtime_flavor() {
                RuntimeFlavor::MultiThread => {
                    tokio::task::block_in_place(|| handle.block_on(fut))
                }
                // block_in_place panics here, and blocking would starve the driver.
                _ => Err(StoreError::Unavailable(
                    "PostgresAggregationStore sync methods need a multi-threaded tokio runtime"
                        .to_string(),
                )),
            },
            Err(_) => match &self.runtime {
                Some(handle) => handle.block_on(fut),
                None => Err(StoreError::Unavailable(
                    "PostgresAggregationStore requires a tokio runtime".to_string(),
                )),
            },
        }
    }
}

async fn fetch_group_for_update(
    tx: &mut Transaction<'static, Postgres>,
    correlation_id: &CorrelationId,
) -> Result<Option<Group>, StoreError> {
    fetch_group_with(tx, correlation_id, " FOR UPDATE").await
}

async fn fetch_group(
    tx: &mut Transaction<'static, Postgres>,
    correlation_id: &CorrelationId,
) -> Result<Option<Group>, StoreError> {
    fetch_group_with(tx, correlation_id, "").await
}

async fn fetch_group_with(
    tx: &mut Transaction<'static, Postgres>,
    correlation_id: &CorrelationId,
    lock: &str,
) -> Result<Option<Group>, StoreError> {
    let row = sqlx::query(&format!(
        "SELECT {GROUP_COLUMNS} FROM reducer_groups WHERE correlation_id = $1{lock}"
    ))
    .bind(correlation_id.as_str())
    .fetch_optional(&mut **tx)
    .await
    .map_err(|e| map_sqlx_error("load", e))?;

    let Some(row) = row else {
        return Ok(None);
    };
    let mut group = GroupRow::from_row(&row)
        .map_err(|e| map_sqlx_error("load", e))?
        .into_group()?;

    let member_rows = sqlx::query(&format!(
        "SELECT {MEMBER_COLUMNS} FROM reducer_members WHERE correlation_id = $1 ORDER BY position ASC"
    ))
    .bind(correlation_id.as_str())
    .fetch_all(&mut **tx)
    .await
    .map_err(|e| map_sqlx_error("load", e))?;

    group.members = member_rows
        .iter()
        .map(|row| {
            MemberRow::from_row(row)
                .map_err(|e| map_sqlx_error("load", e))
                .and_then(MemberRow::into_member_ref)
        })
        .collect::<Result<_, _>>()?;

    Ok(Some(group))
}

fn to_db_version(version: u64) -> Result<i64, StoreError> {
    i64::try_from(version).map_err(|_| StoreError::Corrupt(format!("version {version} overflows BIGINT")))
}

/// Map SQLx errors to StoreError.
fn map_sqlx_error(operation: &str, err: sqlx::Error) -> StoreError {
    match err {
        sqlx::Error::Database(db_err) => {
            let msg = format!("database error in {}: {}", operation, db_err.message());
            match db_err.code().as_deref() {
                // Unique violation, serialization failure, deadlock
                Some("23505") | Some("40001") | Some("40P01") => {
                    StoreError::ConcurrentModification(msg)
                }
                _ => StoreError::Unavailable(msg),
            }
        }
        decode @ (sqlx::Error::Decode(_)
        | sqlx::Error::ColumnDecode { .. }
        | sqlx::Error::ColumnNotFound(_)) => {
            StoreError::Corrupt(format!("failed to decode row in {}: {}", operation, decode))
        }
        other => StoreError::Unavailable(format!("sqlx error in {}: {}", operation, other)),
    }
}

// SQLx row types

#[derive(Debug)]
struct GroupRow {
    correlation_id: String,
    strategy_kind: String,
    status: String,
    expected_count: Option<i64>,
    deadline_at: Option<DateTime<Utc>>,
    created_at: DateTime<Utc>,
    dismiss_after: DateTime<Utc>,
    trigger_scheduled: bool,
    finalized_at: Option<DateTime<Utc>>,
    published_at: Option<DateTime<Utc>>,
    compacted_at: Option<DateTime<Utc>>,
    version: i64,
}

impl<'r> FromRow<'r, sqlx::postgres::PgRow> for GroupRow {
    fn from_row(row: &'r sqlx::postgres::PgRow) -> Result<Self, sqlx::Error> {
        Ok(GroupRow {
            correlation_id: row.try_get("correlation_id")?,
            strategy_kind: row.try_get("strategy_kind")?,
            status: row.try_get("status")?,
            expected_count: row.try_get("expected_count")?,
            deadline_at: row.try_get("deadline_at")?,
            created_at: row.try_get("created_at")?,
            dismiss_after: row.try_get("dismiss_after")?,
            trigger_scheduled: row.try_get("trigger_scheduled")?,
            finalized_at: row.try_get("finalized_at")?,
            published_at: row.try_get("published_at")?,
            compacted_at: row.try_get("compacted_at")?,
            version: row.try_get("version")?,
        })
    }
}

impl GroupRow {
    /// Members are loaded separately and start empty.
    fn into_group(self) -> Result<Group, StoreError> {
        let expected_count = self
            .expected_count
            .map(u32::try_from)
            .transpose()
            .map_err(|_| StoreError::Corrupt(format!("expected_count out of range for '{}'", self.correlation_id)))?;

        Ok(Group {
            correlation_id: CorrelationId::new(self.correlation_id)?,
            strategy_kind: StrategyKind::parse(&self.strategy_kind)?,
            status: GroupStatus::parse(&self.status)?,
            members: Vec::new(),
            expected_count,
            deadline_at: self.deadline_at,
            created_at: self.created_at,
            dismiss_after: self.dismiss_after,
            trigger_scheduled: self.trigger_scheduled,
            finalized_at: self.finalized_at,
            published_at: self.published_at,
            compacted_at: self.compacted_at,
            version: u64::try_from(self.version)
                .map_err(|_| StoreError::Corrupt(format!("negative version {}", self.version)))?,
        })
    }
}

#[derive(Debug)]
struct MemberRow {
    correlation_id: String,
    event_id: String,
    arrived_at: DateTime<Utc>,
    source_metadata: serde_json::Value,
    document_pointer: String,
}

impl<'r> FromRow<'r, sqlx::postgres::PgRow> for MemberRow {
    fn from_row(row: &'r sqlx::postgres::PgRow) -> Result<Self, sqlx::Error> {
        Ok(MemberRow {
            correlation_id: row.try_get("correlation_id")?,
            event_id: row.try_get("event_id")?,
            arrived_at: row.try_get("arrived_at")?,
            source_metadata: row.try_get("source_metadata")?,
            document_pointer: row.try_get("document_pointer")?,
        })
    }
}

impl MemberRow {
    fn into_member_ref(self) -> Result<MemberRef, StoreError> {
        Ok(MemberRef::new(
            MemberEventId::new(self.event_id)?,
            self.arrived_at,
            self.source_metadata,
            self.document_pointer,
        ))
    }
}

impl AggregationStore for PostgresAggregationStore {
    fn register_member(
        &self,
        correlation_id: &CorrelationId,
        member: MemberRef,
        seed: GroupSeed,
    ) -> Result<Registration, StoreError> {
        self.block_on(self.register(correlation_id, member, seed))
    }

    fn try_complete(
        &self,
        correlation_id: &CorrelationId,
        at: DateTime<Utc>,
    ) -> Result<Transition, StoreError> {
        self.block_on(self.finalize(correlation_id, GroupStatus::Completed, at))
    }

    fn try_dismiss(
        &self,
        correlation_id: &CorrelationId,
        at: DateTime<Utc>,
    ) -> Result<Transition, StoreError> {
        self.block_on(self.finalize(correlation_id, GroupStatus::Dismissed, at))
    }

    fn mark_trigger_scheduled(&self, correlation_id: &CorrelationId) -> Result<bool, StoreError> {
        self.block_on(self.set_trigger_scheduled(correlation_id))
    }

    fn mark_published(
        &self,
        correlation_id: &CorrelationId,
        at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        self.block_on(self.set_published(correlation_id, at))
    }

    fn load(&self, correlation_id: &CorrelationId) -> Result<Option<Group>, StoreError> {
        self.block_on(self.load_group(correlation_id))
    }

    fn list(&self, query: &GroupQuery) -> Result<Vec<Group>, StoreError> {
        self.block_on(self.list_groups(query))
    }

    fn purge_finalized(
        &self,
        before: DateTime<Utc>,
        at: DateTime<Utc>,
    ) -> Result<usize, StoreError> {
        self.block_on(self.purge(before, at))
    }
}
