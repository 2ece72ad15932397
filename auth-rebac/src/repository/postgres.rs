//! PostgreSQL-backed tuple store
//!
//! Tuples are stored as versioned rows (`created_version`, `deleted_version`).
//! A single-row version counter is locked `FOR UPDATE` by every commit, which
//! serializes commits and makes the head token advance exactly once per
//! transaction. Readers never take that lock; they filter rows by version.
//!
//! The same row carries the snapshot watermark. Each read runs in a
//! `REPEATABLE READ` transaction that checks the watermark and queries rows
//! against one database snapshot, and compaction raises the watermark and
//! deletes rows in one transaction, so a read either sees the rows of its
//! snapshot or fails with `SnapshotExpired`.

use crate::{
    error::{RebacError, Result},
    models::*,
    repository::TupleStore,
};
use async_trait::async_trait;
use sqlx::{postgres::PgRow, Executor, PgPool, Postgres, Row, Transaction};
use tracing::{debug, info};

const MIGRATIONS: [&str; 2] = [
    include_str!("../../migrations/0001_relation_tuples.sql"),
    include_str!("../../migrations/0002_snapshot_watermark.sql"),
];

/// PostgreSQL-backed tuple store
pub struct PostgresTupleStore {
    pool: PgPool,
}

impl PostgresTupleStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn from_connection_string(connection_string: &str) -> Result<Self> {
        let pool = PgPool::connect(connection_string)
            .await
            .map_err(|e| RebacError::StorageError(format!("Failed to connect: {}", e)))?;

        Ok(Self::new(pool))
    }

    /// Create the tuple tables if they do not exist
    pub async fn migrate(&self) -> Result<()> {
        for migration in MIGRATIONS {
            self.pool.execute(migration).await?;
        }
        info!("Relation tuple schema is up to date");
        Ok(())
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Read-only transaction pinned to one database snapshot, after checking
    /// that `snapshot` is not below the watermark
    async fn read_transaction(&self, snapshot: SnapshotToken) -> Result<Transaction<'_, Postgres>> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("SET TRANSACTION ISOLATION LEVEL REPEATABLE READ, READ ONLY")
            .execute(&mut *tx)
            .await?;

        let watermark: i64 = sqlx::query_scalar("SELECT watermark FROM rebac_versions WHERE id = 1")
            .fetch_one(&mut *tx)
            .await?;
        ensure_readable(snapshot, from_db_version(watermark)?)?;
        Ok(tx)
    }

    async fn modified_at(
        tx: &mut Transaction<'_, Postgres>,
        tuple: &RelationTuple,
    ) -> Result<Option<SnapshotToken>> {
        let (subject_namespace, subject_id, subject_relation) = subject_columns(&tuple.subject);
        let version: Option<i64> = sqlx::query_scalar(
            r#"
            SELECT modified_version FROM rebac_tuple_modifications
            WHERE namespace = $1 AND object = $2 AND relation = $3
              AND subject_namespace = $4 AND subject_id = $5 AND subject_relation = $6
            "#,
        )
        .bind(&tuple.namespace)
        .bind(&tuple.object)
        .bind(&tuple.relation)
        .bind(subject_namespace)
        .bind(subject_id)
        .bind(subject_relation)
        .fetch_optional(&mut **tx)
        .await?;

        version.map(from_db_version).transpose()
    }

    /// Apply one op at `version`; returns whether a row changed
    async fn apply(
        tx: &mut Transaction<'_, Postgres>,
        op: &TupleOp,
        version: i64,
    ) -> Result<bool> {
        let tuple = &op.tuple;
        let (subject_namespace, subject_id, subject_relation) = subject_columns(&tuple.subject);

        let result = match op.action {
            TupleAction::Insert => {
                sqlx::query(
                    r#"
                    INSERT INTO rebac_relation_tuples (
                        namespace, object, relation,
                        subject_namespace, subject_id, subject_relation,
                        created_version
                    ) VALUES ($1, $2, $3, $4, $5, $6, $7)
                    ON CONFLICT (namespace, object, relation, subject_namespace, subject_id, subject_relation)
                        WHERE deleted_version IS NULL
                    DO NOTHING
                    "#,
                )
                .bind(&tuple.namespace)
                .bind(&tuple.object)
                .bind(&tuple.relation)
                .bind(subject_namespace)
                .bind(subject_id)
                .bind(subject_relation)
                .bind(version)
                .execute(&mut **tx)
                .await?
            }
            TupleAction::Delete => {
                sqlx::query(
                    r#"
                    UPDATE rebac_relation_tuples SET deleted_version = $7
                    WHERE namespace = $1 AND object = $2 AND relation = $3
                      AND subject_namespace = $4 AND subject_id = $5 AND subject_relation = $6
                      AND deleted_version IS NULL
                    "#,
                )
                .bind(&tuple.namespace)
                .bind(&tuple.object)
                .bind(&tuple.relation)
                .bind(subject_namespace)
                .bind(subject_id)
                .bind(subject_relation)
                .bind(version)
                .execute(&mut **tx)
                .await?
            }
        };

        if result.rows_affected() == 0 {
            return Ok(false);
        }

        sqlx::query(
            r#"
            INSERT INTO rebac_tuple_modifications (
                namespace, object, relation,
                subject_namespace, subject_id, subject_relation,
                modified_version
            ) VALUES ($1, $2, $3, $4, $5, $6, $7)
            ON CONFLICT (namespace, object, relation, subject_namespace, subject_id, subject_relation)
            DO UPDATE SET modified_version = EXCLUDED.modified_version
            "#,
        )
        .bind(&tuple.namespace)
        .bind(&tuple.object)
        .bind(&tuple.relation)
        .bind(subject_namespace)
        .bind(subject_id)
        .bind(subject_relation)
        .bind(version)
        .execute(&mut **tx)
        .await?;

        Ok(true)
    }
}

#[async_trait]
impl TupleStore for PostgresTupleStore {
    async fn commit(&self, transaction: WriteTransaction) -> Result<SnapshotToken> {
        let mut tx = self.pool.begin().await?;

        let (head, watermark): (i64, i64) =
            sqlx::query_as("SELECT head, watermark FROM rebac_versions WHERE id = 1 FOR UPDATE")
                .fetch_one(&mut *tx)
                .await?;
        // Modifications at or below the watermark are no longer tracked
        ensure_readable(transaction.base, from_db_version(watermark)?)?;

        for op in &transaction.ops {
            if let Some(modified_at) = Self::modified_at(&mut tx, &op.tuple).await? {
                if modified_at > transaction.base {
                    // Dropping `tx` rolls back and releases the counter lock
                    return Err(RebacError::Conflict {
                        tuple: op.tuple.to_string(),
                        base: transaction.base,
                        modified_at,
                    });
                }
            }
        }

        let version = head + 1;
        let mut changed = 0;
        for op in &transaction.ops {
            if Self::apply(&mut tx, op, version).await? {
                changed += 1;
            }
        }

        sqlx::query("UPDATE rebac_versions SET head = $1 WHERE id = 1")
            .bind(version)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;

        debug!(
            snapshot = version,
            ops = transaction.ops.len(),
            changed,
            "Committed tuple batch to PostgreSQL"
        );
        from_db_version(version)
    }

    async fn scan(
        &self,
        namespace: &str,
        object: &str,
        relation: &str,
        snapshot: SnapshotToken,
    ) -> Result<Vec<Subject>> {
        let mut tx = self.read_transaction(snapshot).await?;
        let rows = sqlx::query(
            r#"
            SELECT subject_namespace, subject_id, subject_relation
            FROM rebac_relation_tuples
            WHERE namespace = $1 AND object = $2 AND relation = $3
              AND created_version <= $4
              AND (deleted_version IS NULL OR deleted_version > $4)
            ORDER BY subject_namespace, subject_id, subject_relation
            "#,
        )
        .bind(namespace)
        .bind(object)
        .bind(relation)
        .bind(to_db_version(snapshot)?)
        .fetch_all(&mut *tx)
        .await?;

        rows.iter().map(subject_from_row).collect()
    }

    async fn exists(&self, tuple: &RelationTuple, snapshot: SnapshotToken) -> Result<bool> {
        let (subject_namespace, subject_id, subject_relation) = subject_columns(&tuple.subject);
        let mut tx = self.read_transaction(snapshot).await?;
        let exists: bool = sqlx::query_scalar(
            r#"
            SELECT EXISTS(
                SELECT 1 FROM rebac_relation_tuples
                WHERE namespace = $1 AND object = $2 AND relation = $3
                  AND subject_namespace = $4 AND subject_id = $5 AND subject_relation = $6
                  AND created_version <= $7
                  AND (deleted_version IS NULL OR deleted_version > $7)
            )
            "#,
        )
        .bind(&tuple.namespace)
        .bind(&tuple.object)
        .bind(&tuple.relation)
        .bind(subject_namespace)
        .bind(subject_id)
        .bind(subject_relation)
        .bind(to_db_version(snapshot)?)
        .fetch_one(&mut *tx)
        .await?;

        Ok(exists)
    }

    async fn read_tuples(
        &self,
        query: &TupleQuery,
        snapshot: SnapshotToken,
    ) -> Result<Vec<RelationTuple>> {
        let subject = query.subject.as_ref().map(subject_columns);
        let mut tx = self.read_transaction(snapshot).await?;

        let rows = sqlx::query(
            r#"
            SELECT namespace, object, relation, subject_namespace, subject_id, subject_relation
            FROM rebac_relation_tuples
            WHERE namespace = $1
              AND ($2::TEXT IS NULL OR object = $2)
              AND ($3::TEXT IS NULL OR relation = $3)
              AND ($4::TEXT IS NULL OR (subject_namespace = $4 AND subject_id = $5 AND subject_relation = $6))
              AND created_version <= $7
              AND (deleted_version IS NULL OR deleted_version > $7)
            ORDER BY object, relation, subject_namespace, subject_id, subject_relation
            "#,
        )
        .bind(&query.namespace)
        .bind(query.object.as_deref())
        .bind(query.relation.as_deref())
        .bind(subject.map(|(ns, _, _)| ns))
        .bind(subject.map(|(_, id, _)| id))
        .bind(subject.map(|(_, _, rel)| rel))
        .bind(to_db_version(snapshot)?)
        .fetch_all(&mut *tx)
        .await?;

        rows.iter()
            .map(|row| {
                Ok(RelationTuple::new(
                    &row.try_get::<String, _>("namespace")?,
                    &row.try_get::<String, _>("object")?,
                    &row.try_get::<String, _>("relation")?,
                    subject_from_row(row)?,
                ))
            })
            .collect()
    }

    async fn latest(&self) -> Result<SnapshotToken> {
        let head: i64 = sqlx::query_scalar("SELECT head FROM rebac_versions WHERE id = 1")
            .fetch_one(&self.pool)
            .await?;
        from_db_version(head)
    }

    async fn snapshot_range(&self) -> Result<SnapshotRange> {
        let (head, watermark): (i64, i64) =
            sqlx::query_as("SELECT head, watermark FROM rebac_versions WHERE id = 1")
                .fetch_one(&self.pool)
                .await?;
        Ok(SnapshotRange {
            watermark: from_db_version(watermark)?,
            head: from_db_version(head)?,
        })
    }

    async fn compact(&self, watermark: SnapshotToken) -> Result<CompactionReport> {
        let mut tx = self.pool.begin().await?;

        let target: i64 = sqlx::query_scalar(
            r#"
            UPDATE rebac_versions
            SET watermark = GREATEST(watermark, LEAST($1, head))
            WHERE id = 1
            RETURNING watermark
            "#,
        )
        .bind(to_db_version(watermark)?)
        .fetch_one(&mut *tx)
        .await?;

        let result = sqlx::query(
            "DELETE FROM rebac_relation_tuples WHERE deleted_version IS NOT NULL AND deleted_version <= $1",
        )
        .bind(target)
        .execute(&mut *tx)
        .await?;

        let untracked = sqlx::query("DELETE FROM rebac_tuple_modifications WHERE modified_version <= $1")
            .bind(target)
            .execute(&mut *tx)
            .await?
            .rows_affected();

        tx.commit().await?;

        let watermark = from_db_version(target)?;
        let removed = usize::try_from(result.rows_affected()).unwrap_or(usize::MAX);
        info!(watermark = %watermark, removed, untracked, "Compacted PostgreSQL tuple store");
        Ok(CompactionReport { watermark, removed })
    }
}

fn ensure_readable(snapshot: SnapshotToken, watermark: SnapshotToken) -> Result<()> {
    if snapshot < watermark {
        return Err(RebacError::SnapshotExpired {
            requested: snapshot,
            watermark,
        });
    }
    Ok(())
}

/// `(subject_namespace, subject_id, subject_relation)` columns of a subject
fn subject_columns(subject: &Subject) -> (&str, &str, &str) {
    match subject {
        Subject::Id { namespace, id } => (namespace, id, ""),
        Subject::Set(set) => (&set.namespace, &set.object, &set.relation),
    }
}

fn subject_from_row(row: &PgRow) -> Result<Subject> {
    let namespace: String = row.try_get("subject_namespace")?;
    let id: String = row.try_get("subject_id")?;
    let relation: String = row.try_get("subject_relation")?;

    Ok(if relation.is_empty() {
        Subject::id(&namespace, &id)
    } else {
        Subject::set(&namespace, &id, &relation)
    })
}

fn to_db_version(token: SnapshotToken) -> Result<i64> {
    i64::try_from(token.version())
        .map_err(|_| RebacError::InvalidConsistencyToken(token.to_string()))
}

fn from_db_version(version: i64) -> Result<SnapshotToken> {
    u64::try_from(version)
        .map(SnapshotToken)
        .map_err(|_| RebacError::StorageError(format!("Negative version {} in store", version)))
}
