//! The KV transaction adapter contract (§4.2) and its sole concrete
//! implementation, targeting SQLite through `sqlx`.
//!
//! This is the "authoritative" tier: it never looks at the mutation log and
//! knows nothing about CDC. The overlay transaction wraps it.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use doc_core::{CollectionMeta, Comparator, Condition, DbError, DbResult, Row};
use serde_json::Value;
use sqlx::sqlite::{SqlitePoolOptions, SqliteRow};
use sqlx::{Row as _, Sqlite, SqlitePool};

/// Raw collection storage operations, independent of the overlay/mutation log.
#[async_trait]
pub trait KvTransaction: Send + Sized {
    async fn get_by_key(&mut self, collection: &str, key: &str) -> DbResult<Option<Value>>;
    async fn get_all(&mut self, collection: &str) -> DbResult<Vec<Row>>;
    async fn get_by_condition(&mut self, collection: &str, condition: &Condition) -> DbResult<Vec<Row>>;
    async fn insert(&mut self, collection: &str, key: &str, value: Value) -> DbResult<()>;
    async fn update(&mut self, collection: &str, key: &str, value: Value) -> DbResult<()>;
    async fn upsert(&mut self, collection: &str, key: &str, value: Value) -> DbResult<()>;
    async fn delete(&mut self, collection: &str, key: &str) -> DbResult<()>;
    async fn clear(&mut self, collection: &str) -> DbResult<()>;
    async fn commit(self) -> DbResult<()>;
    async fn rollback(self) -> DbResult<()>;
    fn is_active(&self) -> bool;
}

#[async_trait]
pub trait KvStore: Send + Sync {
    type Transaction: KvTransaction;

    async fn begin(&self) -> DbResult<Self::Transaction>;
}

/// Opens collection tables and their declared secondary indexes on first use.
pub struct SqliteStore {
    pool: SqlitePool,
    collections: Arc<HashMap<String, CollectionMeta>>,
}

impl SqliteStore {
    pub async fn connect(database_url: &str, collections: Vec<CollectionMeta>) -> DbResult<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect(database_url)
            .await
            .map_err(storage_err)?;

        let store = Self {
            pool,
            collections: Arc::new(
                collections.into_iter().map(|c| (c.name.clone(), c)).collect(),
            ),
        };
        store.run_migrations().await?;
        Ok(store)
    }

    async fn run_migrations(&self) -> DbResult<()> {
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS __meta (key TEXT PRIMARY KEY, value TEXT NOT NULL)",
        )
        .execute(&self.pool)
        .await
        .map_err(storage_err)?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS __mutations (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                mutation_name TEXT NOT NULL,
                mutation_args TEXT NOT NULL,
                changes TEXT NOT NULL,
                collections_affected TEXT NOT NULL,
                is_completed INTEGER NOT NULL DEFAULT 0,
                is_pushed INTEGER NOT NULL DEFAULT 0,
                remote_push_attempts INTEGER NOT NULL DEFAULT 0,
                local_resolver_result TEXT,
                server_mutation_id INTEGER
            )",
        )
        .execute(&self.pool)
        .await
        .map_err(storage_err)?;

        for meta in self.collections.values() {
            validate_identifier(&meta.name)?;
            sqlx::query(&format!(
                "CREATE TABLE IF NOT EXISTS \"{}\" (key TEXT PRIMARY KEY, value TEXT NOT NULL)",
                meta.name
            ))
            .execute(&self.pool)
            .await
            .map_err(storage_err)?;

            for index in &meta.indexes {
                validate_identifier(&index.field)?;
                sqlx::query(&format!(
                    "CREATE INDEX IF NOT EXISTS \"{}__idx_{}\" ON \"{}\" (json_extract(value, '$.{}'))",
                    meta.name, index.field, meta.name, index.field
                ))
                .execute(&self.pool)
                .await
                .map_err(storage_err)?;
            }
        }

        Ok(())
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

#[async_trait]
impl KvStore for SqliteStore {
    type Transaction = SqliteTransaction;

    async fn begin(&self) -> DbResult<SqliteTransaction> {
        let tx = self.pool.begin().await.map_err(storage_err)?;
        Ok(SqliteTransaction { tx: Some(tx), collections: self.collections.clone() })
    }
}

/// An open SQLite transaction over both user collections and `__meta`.
/// `__mutations` is driven directly by `mutation_log`, which reaches into
/// `raw()` — the mutation log is append/update-only and needs SQL shapes
/// (lowest unpushed id, bulk GC-by-threshold) the generic interface doesn't
/// express.
pub struct SqliteTransaction {
    tx: Option<sqlx::Transaction<'static, Sqlite>>,
    collections: Arc<HashMap<String, CollectionMeta>>,
}

impl SqliteTransaction {
    pub(crate) fn raw(&mut self) -> &mut sqlx::Transaction<'static, Sqlite> {
        self.tx.as_mut().expect("transaction used after commit/rollback")
    }
}

fn validate_identifier(name: &str) -> DbResult<()> {
    let ok = !name.is_empty()
        && name.chars().next().is_some_and(|c| c.is_ascii_alphabetic() || c == '_')
        && name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_');
    if ok {
        Ok(())
    } else {
        Err(DbError::Internal(format!("invalid collection/field identifier: {name}")))
    }
}

fn storage_err(e: sqlx::Error) -> DbError {
    DbError::Internal(format!("storage error: {e}"))
}

fn row_to_value(row: &SqliteRow) -> DbResult<Value> {
    let text: String = row.try_get("value").map_err(storage_err)?;
    serde_json::from_str(&text).map_err(DbError::Serialization)
}

fn condition_sql(collection: &str, condition: &Condition) -> DbResult<String> {
    validate_identifier(collection)?;
    validate_identifier(&condition.field)?;
    let op = match condition.comparator {
        Comparator::Eq => "=",
        Comparator::Lt => "<",
        Comparator::Lte => "<=",
        Comparator::Gt => ">",
        Comparator::Gte => ">=",
    };
    Ok(format!(
        "SELECT key, value FROM \"{collection}\" WHERE json_extract(value, '$.{}') {op} ?",
        condition.field
    ))
}

#[async_trait]
impl KvTransaction for SqliteTransaction {
    async fn get_by_key(&mut self, collection: &str, key: &str) -> DbResult<Option<Value>> {
        validate_identifier(collection)?;
        let row = sqlx::query(&format!("SELECT value FROM \"{collection}\" WHERE key = ?"))
            .bind(key)
            .fetch_optional(&mut *self.raw())
            .await
            .map_err(storage_err)?;
        row.as_ref().map(row_to_value).transpose()
    }

    async fn get_all(&mut self, collection: &str) -> DbResult<Vec<Row>> {
        validate_identifier(collection)?;
        let rows = sqlx::query(&format!("SELECT key, value FROM \"{collection}\""))
            .fetch_all(&mut *self.raw())
            .await
            .map_err(storage_err)?;
        rows.iter()
            .map(|r| {
                Ok(Row {
                    key: r.try_get("key").map_err(storage_err)?,
                    value: row_to_value(r)?,
                })
            })
            .collect()
    }

    async fn get_by_condition(&mut self, collection: &str, condition: &Condition) -> DbResult<Vec<Row>> {
        let sql = condition_sql(collection, condition)?;
        let query = sqlx::query(&sql);
        let query = match &condition.value {
            Value::Number(n) if n.is_i64() => query.bind(n.as_i64().unwrap()),
            Value::Number(n) => query.bind(n.as_f64().unwrap_or_default()),
            Value::String(s) => query.bind(s.clone()),
            _ => return Err(DbError::InvalidCondition("condition value must be scalar".into())),
        };
        let rows = query.fetch_all(&mut *self.raw()).await.map_err(storage_err)?;
        rows.iter()
            .map(|r| {
                Ok(Row {
                    key: r.try_get("key").map_err(storage_err)?,
                    value: row_to_value(r)?,
                })
            })
            .collect()
    }

    async fn insert(&mut self, collection: &str, key: &str, value: Value) -> DbResult<()> {
        validate_identifier(collection)?;
        let text = serde_json::to_string(&value).map_err(DbError::Serialization)?;
        let result = sqlx::query(&format!(
            "INSERT INTO \"{collection}\" (key, value) VALUES (?, ?)"
        ))
        .bind(key)
        .bind(text)
        .execute(&mut *self.raw())
        .await;

        match result {
            Ok(_) => Ok(()),
            Err(sqlx::Error::Database(e)) if e.is_unique_violation() => Err(DbError::DuplicateKey {
                collection: collection.to_string(),
                key: key.to_string(),
            }),
            Err(e) => Err(storage_err(e)),
        }
    }

    async fn update(&mut self, collection: &str, key: &str, value: Value) -> DbResult<()> {
        validate_identifier(collection)?;
        let text = serde_json::to_string(&value).map_err(DbError::Serialization)?;
        let result = sqlx::query(&format!("UPDATE \"{collection}\" SET value = ? WHERE key = ?"))
            .bind(text)
            .bind(key)
            .execute(&mut *self.raw())
            .await
            .map_err(storage_err)?;
        if result.rows_affected() == 0 {
            return Err(DbError::KeyNotFound {
                collection: collection.to_string(),
                key: key.to_string(),
            });
        }
        Ok(())
    }

    async fn upsert(&mut self, collection: &str, key: &str, value: Value) -> DbResult<()> {
        validate_identifier(collection)?;
        let text = serde_json::to_string(&value).map_err(DbError::Serialization)?;
        sqlx::query(&format!(
            "INSERT INTO \"{collection}\" (key, value) VALUES (?, ?)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value"
        ))
        .bind(key)
        .bind(text)
        .execute(&mut *self.raw())
        .await
        .map_err(storage_err)?;
        Ok(())
    }

    async fn delete(&mut self, collection: &str, key: &str) -> DbResult<()> {
        validate_identifier(collection)?;
        let result = sqlx::query(&format!("DELETE FROM \"{collection}\" WHERE key = ?"))
            .bind(key)
            .execute(&mut *self.raw())
            .await
            .map_err(storage_err)?;
        if result.rows_affected() == 0 {
            return Err(DbError::KeyNotFound {
                collection: collection.to_string(),
                key: key.to_string(),
            });
        }
        Ok(())
    }

    async fn clear(&mut self, collection: &str) -> DbResult<()> {
        validate_identifier(collection)?;
        sqlx::query(&format!("DELETE FROM \"{collection}\""))
            .execute(&mut *self.raw())
            .await
            .map_err(storage_err)?;
        Ok(())
    }

    async fn commit(mut self) -> DbResult<()> {
        let tx = self.tx.take().expect("transaction used after commit/rollback");
        tx.commit().await.map_err(storage_err)
    }

    async fn rollback(mut self) -> DbResult<()> {
        let tx = self.tx.take().expect("transaction used after commit/rollback");
        tx.rollback().await.map_err(storage_err)
    }

    fn is_active(&self) -> bool {
        self.tx.is_some()
    }
}

impl SqliteTransaction {
    pub fn collection_meta(&self, name: &str) -> Option<&CollectionMeta> {
        self.collections.get(name)
    }
}
