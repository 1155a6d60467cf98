//! Direct SQL access to `__mutations`, the append-only log of user mutations.
//!
//! Kept separate from `store::SqliteTransaction`'s generic collection
//! interface: the log needs shapes (lowest unpushed id, bulk GC by
//! server-acked threshold) the `{key,value}` contract doesn't express, and
//! giving it its own physical schema avoids JSON-filtering every row in
//! application code.

use doc_core::{Mutation, PendingChange};
use serde_json::Value;
use sqlx::Row;

use crate::errors::{ClientError, ClientResult};
use crate::store::SqliteTransaction;

fn storage_err(e: sqlx::Error) -> ClientError {
    ClientError::Storage(e)
}

fn row_to_mutation(row: &sqlx::sqlite::SqliteRow) -> ClientResult<Mutation> {
    let changes_json: String = row.try_get("changes").map_err(storage_err)?;
    let changes: Vec<PendingChange> = serde_json::from_str(&changes_json)?;
    let collections_json: String = row.try_get("collections_affected").map_err(storage_err)?;
    let collections_affected: Vec<String> = serde_json::from_str(&collections_json)?;
    let args_json: String = row.try_get("mutation_args").map_err(storage_err)?;
    let local_resolver_result: Option<String> =
        row.try_get("local_resolver_result").map_err(storage_err)?;

    Ok(Mutation {
        id: row.try_get("id").map_err(storage_err)?,
        mutation_name: row.try_get("mutation_name").map_err(storage_err)?,
        mutation_args: serde_json::from_str(&args_json)?,
        changes,
        collections_affected,
        is_completed: row.try_get::<i64, _>("is_completed").map_err(storage_err)? != 0,
        is_pushed: row.try_get::<i64, _>("is_pushed").map_err(storage_err)? != 0,
        remote_push_attempts: row.try_get::<i64, _>("remote_push_attempts").map_err(storage_err)? as u32,
        local_resolver_result: local_resolver_result
            .map(|s| serde_json::from_str(&s))
            .transpose()?,
        server_mutation_id: row.try_get("server_mutation_id").map_err(storage_err)?,
    })
}

/// Inserts a fresh, incomplete mutation row and returns its assigned id.
pub async fn begin_mutation(
    tx: &mut SqliteTransaction,
    mutation_name: &str,
    mutation_args: &Value,
) -> ClientResult<i64> {
    let args_json = serde_json::to_string(mutation_args)?;
    let result = sqlx::query(
        "INSERT INTO __mutations (mutation_name, mutation_args, changes, collections_affected)
         VALUES (?, ?, '[]', '[]')",
    )
    .bind(mutation_name)
    .bind(args_json)
    .execute(&mut *tx.raw())
    .await
    .map_err(storage_err)?;
    Ok(result.last_insert_rowid())
}

pub async fn get_mutation(tx: &mut SqliteTransaction, id: i64) -> ClientResult<Mutation> {
    let row = sqlx::query("SELECT * FROM __mutations WHERE id = ?")
        .bind(id)
        .fetch_optional(&mut *tx.raw())
        .await
        .map_err(storage_err)?
        .ok_or(ClientError::MutationRowMissing(id))?;
    row_to_mutation(&row)
}

/// Appends one recorded change and persists the mutation row (§4.6).
pub async fn append_change(
    tx: &mut SqliteTransaction,
    id: i64,
    change: PendingChange,
) -> ClientResult<()> {
    let mut mutation = get_mutation(tx, id).await?;
    mutation.record(change);
    persist(tx, &mutation).await
}

/// Finalizes a mutation as locally committed, attaching the caller-visible
/// resolver payload (§4.6).
pub async fn complete_mutation(
    tx: &mut SqliteTransaction,
    id: i64,
    local_resolver_result: Value,
) -> ClientResult<Mutation> {
    let mut mutation = get_mutation(tx, id).await?;
    mutation.is_completed = true;
    mutation.local_resolver_result = Some(local_resolver_result);
    persist(tx, &mutation).await?;
    Ok(mutation)
}

async fn persist(tx: &mut SqliteTransaction, mutation: &Mutation) -> ClientResult<()> {
    let changes_json = serde_json::to_string(&mutation.changes)?;
    let collections_json = serde_json::to_string(&mutation.collections_affected)?;
    let args_json = serde_json::to_string(&mutation.mutation_args)?;
    let result_json = mutation
        .local_resolver_result
        .as_ref()
        .map(serde_json::to_string)
        .transpose()?;

    sqlx::query(
        "UPDATE __mutations SET
            mutation_name = ?, mutation_args = ?, changes = ?, collections_affected = ?,
            is_completed = ?, is_pushed = ?, remote_push_attempts = ?,
            local_resolver_result = ?, server_mutation_id = ?
         WHERE id = ?",
    )
    .bind(&mutation.mutation_name)
    .bind(args_json)
    .bind(changes_json)
    .bind(collections_json)
    .bind(mutation.is_completed as i64)
    .bind(mutation.is_pushed as i64)
    .bind(mutation.remote_push_attempts as i64)
    .bind(result_json)
    .bind(mutation.server_mutation_id)
    .bind(mutation.id)
    .execute(&mut *tx.raw())
    .await
    .map_err(storage_err)?;
    Ok(())
}

/// All mutation rows with `is_completed = true`, ordered for deterministic
/// overlay folding (§4.3.1).
pub async fn completed_mutations(tx: &mut SqliteTransaction) -> ClientResult<Vec<Mutation>> {
    let rows = sqlx::query("SELECT * FROM __mutations WHERE is_completed = 1 ORDER BY id")
        .fetch_all(&mut *tx.raw())
        .await
        .map_err(storage_err)?;
    rows.iter().map(row_to_mutation).collect()
}

/// Lowest-`id` mutation that has not yet been pushed, if any (§4.7 push loop).
pub async fn lowest_unpushed(tx: &mut SqliteTransaction) -> ClientResult<Option<Mutation>> {
    let row = sqlx::query(
        "SELECT * FROM __mutations WHERE is_completed = 1 AND is_pushed = 0 ORDER BY id LIMIT 1",
    )
    .fetch_optional(&mut *tx.raw())
    .await
    .map_err(storage_err)?;
    row.as_ref().map(row_to_mutation).transpose()
}

pub async fn has_unpushed(tx: &mut SqliteTransaction) -> ClientResult<bool> {
    Ok(unpushed_count(tx).await? > 0)
}

/// Count of completed, not-yet-pushed mutations (`Database::pending_mutation_count`).
pub async fn unpushed_count(tx: &mut SqliteTransaction) -> ClientResult<i64> {
    let count: i64 = sqlx::query_scalar(
        "SELECT COUNT(*) FROM __mutations WHERE is_completed = 1 AND is_pushed = 0",
    )
    .fetch_one(&mut *tx.raw())
    .await
    .map_err(storage_err)?;
    Ok(count)
}

pub async fn mark_pushed(
    tx: &mut SqliteTransaction,
    id: i64,
    server_mutation_id: i64,
) -> ClientResult<()> {
    sqlx::query("UPDATE __mutations SET is_pushed = 1, server_mutation_id = ? WHERE id = ?")
        .bind(server_mutation_id)
        .bind(id)
        .execute(&mut *tx.raw())
        .await
        .map_err(storage_err)?;
    Ok(())
}

pub async fn record_push_attempt(tx: &mut SqliteTransaction, id: i64) -> ClientResult<u32> {
    sqlx::query("UPDATE __mutations SET remote_push_attempts = remote_push_attempts + 1 WHERE id = ?")
        .bind(id)
        .execute(&mut *tx.raw())
        .await
        .map_err(storage_err)?;
    let attempts: i64 = sqlx::query_scalar("SELECT remote_push_attempts FROM __mutations WHERE id = ?")
        .bind(id)
        .fetch_one(&mut *tx.raw())
        .await
        .map_err(storage_err)?;
    Ok(attempts as u32)
}

/// Deletes a mutation row outright, returning it so callers can derive its
/// GC-inverting CDC (§4.3.4) before it's gone.
pub async fn delete_mutation(tx: &mut SqliteTransaction, id: i64) -> ClientResult<Mutation> {
    let mutation = get_mutation(tx, id).await?;
    sqlx::query("DELETE FROM __mutations WHERE id = ?")
        .bind(id)
        .execute(&mut *tx.raw())
        .await
        .map_err(storage_err)?;
    Ok(mutation)
}

/// Deletes every pushed mutation whose `server_mutation_id` is at or below
/// the threshold the server has confirmed processing (§4.7 pull).
pub async fn delete_acknowledged(
    tx: &mut SqliteTransaction,
    last_processed_mutation_id: i64,
) -> ClientResult<Vec<Mutation>> {
    let rows = sqlx::query(
        "SELECT * FROM __mutations WHERE is_pushed = 1 AND server_mutation_id <= ?",
    )
    .bind(last_processed_mutation_id)
    .fetch_all(&mut *tx.raw())
    .await
    .map_err(storage_err)?;
    let mutations: Vec<Mutation> = rows.iter().map(row_to_mutation).collect::<ClientResult<_>>()?;

    sqlx::query("DELETE FROM __mutations WHERE is_pushed = 1 AND server_mutation_id <= ?")
        .bind(last_processed_mutation_id)
        .execute(&mut *tx.raw())
        .await
        .map_err(storage_err)?;

    Ok(mutations)
}
