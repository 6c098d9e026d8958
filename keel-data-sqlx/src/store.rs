//! SQLite document store.

use keel_data::query::Body;
use keel_data::{Change, DataError, Document, DocumentQuery, Expr, Reference, Store, StoreTransaction};
use sqlx::sqlite::{SqliteConnection, SqlitePool, SqlitePoolOptions};
use sqlx::{Connection, Sqlite, Transaction};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use uuid::Uuid;

use crate::config::SqliteConfig;
use crate::error::{SqlxErrorExt, SqlxResult};
use crate::sql::{bind_params, build_count, build_select, json_path, SqlValue, REFERENCES_TABLE, TABLE};

/// [`Store`] backed by one SQLite table of JSON documents.
///
/// Store operations run on pooled connections in autocommit mode. Each
/// [`begin`](Store::begin) checks out a connection of its own, so work done
/// through a [`SqliteTransaction`] is invisible to everyone else until it
/// commits, and rolling it back never touches their writes. Every `apply`
/// runs in its own savepoint (or its own transaction outside one), so a
/// failing change set leaves nothing behind.
///
/// ```ignore
/// let store = SqliteStore::connect(&SqliteConfig::default()).await?;
/// let context = DbContext::new(store).into_shared();
/// ```
#[derive(Clone)]
pub struct SqliteStore {
    pool: SqlitePool,
    open: Arc<AtomicUsize>,
}

impl SqliteStore {
    /// Wrap an existing pool. Call [`migrate`](SqliteStore::migrate) before
    /// use.
    pub fn new(pool: SqlitePool) -> Self {
        Self {
            pool,
            open: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Open a pool from `config` and create the schema.
    ///
    /// An in-memory database lives as long as one connection to it does, so
    /// for those the pool keeps a connection that is never recycled.
    pub async fn connect(config: &SqliteConfig) -> SqlxResult<Self> {
        let mut options = SqlitePoolOptions::new().max_connections(config.max_connections);
        if config.is_in_memory() {
            options = options
                .min_connections(1)
                .idle_timeout(None)
                .max_lifetime(None);
        }
        let pool = options
            .connect(&config.url)
            .await
            .map_err(|e| e.into_data_error())?;
        tracing::debug!(url = %config.url, "sqlite pool opened");
        let store = Self::new(pool);
        store.migrate().await?;
        Ok(store)
    }

    pub async fn migrate(&self) -> SqlxResult<()> {
        sqlx::query(&format!(
            r#"
            CREATE TABLE IF NOT EXISTS {TABLE} (
                seq INTEGER PRIMARY KEY AUTOINCREMENT,
                kind TEXT NOT NULL,
                id TEXT NOT NULL,
                version INTEGER NOT NULL,
                body TEXT NOT NULL,
                UNIQUE (kind, id)
            );
            CREATE TABLE IF NOT EXISTS {REFERENCES_TABLE} (
                kind TEXT NOT NULL,
                field TEXT NOT NULL,
                target TEXT NOT NULL,
                PRIMARY KEY (kind, field)
            );
            "#
        ))
        .execute(&self.pool)
        .await
        .map_err(|e| e.into_data_error())?;
        Ok(())
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// `true` while any transaction handle is still open.
    pub fn in_transaction(&self) -> bool {
        self.open.load(Ordering::SeqCst) > 0
    }
}

impl Store for SqliteStore {
    type Transaction = SqliteTransaction;

    async fn fetch(&self, kind: &str, query: &DocumentQuery) -> Result<Vec<Document>, DataError> {
        let (sql, params) = build_select(kind, query)?;
        let mut conn = self.pool.acquire().await.map_err(|e| e.into_data_error())?;
        select_documents(&mut *conn, &sql, &params).await
    }

    async fn count(&self, kind: &str, filter: Option<&Expr>) -> Result<u64, DataError> {
        let mut conn = self.pool.acquire().await.map_err(|e| e.into_data_error())?;
        count_documents(&mut *conn, kind, filter).await
    }

    async fn find(&self, kind: &str, id: Uuid) -> Result<Option<Document>, DataError> {
        let mut conn = self.pool.acquire().await.map_err(|e| e.into_data_error())?;
        find_document(&mut *conn, kind, id).await
    }

    async fn apply(&self, changes: &[Change]) -> Result<(), DataError> {
        let mut scope = self.pool.begin().await.map_err(|e| e.into_data_error())?;
        apply_changes(&mut scope, changes).await?;
        scope.commit().await.map_err(|e| e.into_data_error())
    }

    async fn begin(&self) -> Result<SqliteTransaction, DataError> {
        let tx = self.pool.begin().await.map_err(|e| e.into_data_error())?;
        self.open.fetch_add(1, Ordering::SeqCst);
        Ok(SqliteTransaction {
            tx: Some(tx),
            open: self.open.clone(),
        })
    }
}

/// Run `changes` inside `scope`. The caller commits; dropping `scope` after
/// an error rolls it back.
async fn apply_changes(
    scope: &mut Transaction<'_, Sqlite>,
    changes: &[Change],
) -> Result<(), DataError> {
    for change in changes {
        apply_change(&mut **scope, change).await?;
    }
    tracing::debug!(changes = changes.len(), "change set applied");
    Ok(())
}

async fn count_documents(
    conn: &mut SqliteConnection,
    kind: &str,
    filter: Option<&Expr>,
) -> SqlxResult<u64> {
    let (sql, params) = build_count(kind, filter)?;
    let total: i64 = bind_params!(sqlx::query_scalar::<_, i64>(&sql), &params)
        .fetch_one(&mut *conn)
        .await
        .map_err(|e| e.into_data_error())?;
    Ok(total.max(0) as u64)
}

async fn select_documents(
    conn: &mut SqliteConnection,
    sql: &str,
    params: &[SqlValue],
) -> SqlxResult<Vec<Document>> {
    let rows = bind_params!(sqlx::query_as::<_, (String, i64, String)>(sql), params)
        .fetch_all(&mut *conn)
        .await
        .map_err(|e| e.into_data_error())?;
    rows.into_iter().map(decode).collect()
}

async fn find_document(
    conn: &mut SqliteConnection,
    kind: &str,
    id: Uuid,
) -> SqlxResult<Option<Document>> {
    let row = sqlx::query_as::<_, (String, i64, String)>(&format!(
        "SELECT id, version, body FROM {TABLE} WHERE kind = ? AND id = ?"
    ))
    .bind(kind)
    .bind(id.to_string())
    .fetch_optional(&mut *conn)
    .await
    .map_err(|e| e.into_data_error())?;
    row.map(decode).transpose()
}

fn decode((id, version, body): (String, i64, String)) -> SqlxResult<Document> {
    let id = Uuid::parse_str(&id)
        .map_err(|e| DataError::Other(format!("stored document id {id:?} is not a uuid: {e}")))?;
    Ok(Document {
        id,
        version: version.max(0) as u64,
        body: serde_json::from_str(&body)?,
    })
}

async fn apply_change(conn: &mut SqliteConnection, change: &Change) -> SqlxResult<()> {
    match change {
        Change::Insert {
            kind,
            id,
            body,
            references,
        } => {
            register_references(conn, kind, references).await?;
            check_references(conn, kind, references, body).await?;
            sqlx::query(&format!(
                "INSERT INTO {TABLE} (kind, id, version, body) VALUES (?, ?, 1, ?)"
            ))
            .bind(*kind)
            .bind(id.to_string())
            .bind(serde_json::to_string(body)?)
            .execute(&mut *conn)
            .await
            .map_err(|e| match e.into_data_error() {
                DataError::Constraint(_) => {
                    DataError::Constraint(format!("duplicate key {id} in {kind}"))
                }
                other => other,
            })?;
        }
        Change::Update {
            kind,
            id,
            expected_version,
            fields,
            references,
        } => {
            let current = find_document(conn, kind, *id)
                .await?
                .ok_or_else(|| DataError::Concurrency(format!("{kind} {id} no longer exists")))?;
            if current.version != *expected_version {
                return Err(DataError::Concurrency(format!(
                    "{kind} {id} was modified (expected version {expected_version}, found {})",
                    current.version
                )));
            }
            let mut body = current.body;
            body.extend(fields.clone());
            register_references(conn, kind, references).await?;
            check_references(conn, kind, references, &body).await?;

            let result = sqlx::query(&format!(
                "UPDATE {TABLE} SET body = ?, version = version + 1 \
                 WHERE kind = ? AND id = ? AND version = ?"
            ))
            .bind(serde_json::to_string(&body)?)
            .bind(*kind)
            .bind(id.to_string())
            .bind(*expected_version as i64)
            .execute(&mut *conn)
            .await
            .map_err(|e| e.into_data_error())?;
            if result.rows_affected() == 0 {
                return Err(DataError::Concurrency(format!("{kind} {id} was modified")));
            }
        }
        Change::Delete {
            kind,
            id,
            expected_version,
        } => {
            check_not_referenced(conn, kind, *id).await?;
            let result = sqlx::query(&format!(
                "DELETE FROM {TABLE} WHERE kind = ? AND id = ? AND version = ?"
            ))
            .bind(*kind)
            .bind(id.to_string())
            .bind(*expected_version as i64)
            .execute(&mut *conn)
            .await
            .map_err(|e| e.into_data_error())?;
            if result.rows_affected() == 0 {
                return Err(DataError::Concurrency(format!(
                    "{kind} {id} was modified or no longer exists"
                )));
            }
        }
    }
    Ok(())
}

/// Remember which kinds point at which, so deletes can be restricted.
async fn register_references(
    conn: &mut SqliteConnection,
    kind: &str,
    references: &[Reference],
) -> SqlxResult<()> {
    for reference in references {
        sqlx::query(&format!(
            "INSERT OR IGNORE INTO {REFERENCES_TABLE} (kind, field, target) VALUES (?, ?, ?)"
        ))
        .bind(kind)
        .bind(reference.field)
        .bind(reference.target)
        .execute(&mut *conn)
        .await
        .map_err(|e| e.into_data_error())?;
    }
    Ok(())
}

async fn check_references(
    conn: &mut SqliteConnection,
    kind: &str,
    references: &[Reference],
    body: &Body,
) -> SqlxResult<()> {
    for reference in references {
        let value = keel_data::query::lookup(body, reference.field);
        if value.is_null() {
            continue;
        }
        let target_id = value.as_str().map(str::to_string).unwrap_or_else(|| value.to_string());
        let exists = sqlx::query_scalar::<_, i64>(&format!(
            "SELECT COUNT(*) FROM {TABLE} WHERE kind = ? AND id = ?"
        ))
        .bind(reference.target)
        .bind(&target_id)
        .fetch_one(&mut *conn)
        .await
        .map_err(|e| e.into_data_error())?;
        if exists == 0 {
            return Err(DataError::Constraint(format!(
                "{kind}.{} references missing {} {target_id}",
                reference.field, reference.target
            )));
        }
    }
    Ok(())
}

async fn check_not_referenced(conn: &mut SqliteConnection, kind: &str, id: Uuid) -> SqlxResult<()> {
    let referrers = sqlx::query_as::<_, (String, String)>(&format!(
        "SELECT kind, field FROM {REFERENCES_TABLE} WHERE target = ?"
    ))
    .bind(kind)
    .fetch_all(&mut *conn)
    .await
    .map_err(|e| e.into_data_error())?;

    for (referrer, field) in referrers {
        let count = sqlx::query_scalar::<_, i64>(&format!(
            "SELECT COUNT(*) FROM {TABLE} WHERE kind = ? AND json_extract(body, ?) = ?"
        ))
        .bind(&referrer)
        .bind(json_path(&field))
        .bind(id.to_string())
        .fetch_one(&mut *conn)
        .await
        .map_err(|e| e.into_data_error())?;
        if count > 0 {
            return Err(DataError::Constraint(format!(
                "{kind} {id} is still referenced by {count} {referrer} row(s) through {field}"
            )));
        }
    }
    Ok(())
}

/// An open transaction on a connection of its own.
///
/// Dropping it without `commit` or `rollback` drops the underlying sqlx
/// transaction, which rolls it back when the connection returns to the pool.
pub struct SqliteTransaction {
    tx: Option<Transaction<'static, Sqlite>>,
    open: Arc<AtomicUsize>,
}

impl SqliteTransaction {
    fn active(&mut self) -> Result<&mut Transaction<'static, Sqlite>, DataError> {
        self.tx
            .as_mut()
            .ok_or_else(|| DataError::invalid_state("transaction already finished"))
    }

    fn finish(&mut self) -> Option<Transaction<'static, Sqlite>> {
        let tx = self.tx.take();
        if tx.is_some() {
            self.open.fetch_sub(1, Ordering::SeqCst);
        }
        tx
    }
}

impl StoreTransaction for SqliteTransaction {
    async fn fetch(&mut self, kind: &str, query: &DocumentQuery) -> Result<Vec<Document>, DataError> {
        let (sql, params) = build_select(kind, query)?;
        select_documents(&mut **self.active()?, &sql, &params).await
    }

    async fn count(&mut self, kind: &str, filter: Option<&Expr>) -> Result<u64, DataError> {
        count_documents(&mut **self.active()?, kind, filter).await
    }

    async fn find(&mut self, kind: &str, id: Uuid) -> Result<Option<Document>, DataError> {
        find_document(&mut **self.active()?, kind, id).await
    }

    async fn apply(&mut self, changes: &[Change]) -> Result<(), DataError> {
        let tx = self.active()?;
        let mut savepoint = Connection::begin(&mut **tx)
            .await
            .map_err(|e| e.into_data_error())?;
        apply_changes(&mut savepoint, changes).await?;
        savepoint.commit().await.map_err(|e| e.into_data_error())
    }

    async fn commit(&mut self) -> Result<(), DataError> {
        let tx = self
            .finish()
            .ok_or_else(|| DataError::invalid_state("transaction already finished"))?;
        tx.commit().await.map_err(|e| e.into_data_error())
    }

    async fn rollback(&mut self) -> Result<(), DataError> {
        match self.finish() {
            Some(tx) => tx.rollback().await.map_err(|e| e.into_data_error()),
            None => Ok(()),
        }
    }
}

impl Drop for SqliteTransaction {
    fn drop(&mut self) {
        if self.finish().is_some() {
            tracing::debug!("sqlite transaction dropped without commit, rolling back");
        }
    }
}
