use crate::domain::{BlockNumber, BlockTxRecord, IndexState};
use crate::error::{IndexError, IndexResult, is_unique_violation};
use crate::store::sqlite::schema::Schema;
use sqlx::{Executor, Sqlite, SqliteConnection};

/// Bookkeeping tables; `_audit_*` tables belong to the audit log.
pub async fn create_tables(conn: &mut SqliteConnection, schema: &Schema) -> IndexResult<()> {
    sqlx::query(&format!(
        "CREATE TABLE IF NOT EXISTS {} (
            id INTEGER PRIMARY KEY CHECK (id = 1),
            block_number INTEGER NOT NULL CHECK (block_number >= 0),
            block_hash TEXT NOT NULL,
            is_replay INTEGER NOT NULL,
            handler_version_name TEXT NOT NULL
        )",
        schema.index_state()
    ))
    .execute(&mut *conn)
    .await?;

    sqlx::query(&format!(
        "CREATE TABLE IF NOT EXISTS {} (
            block_number INTEGER PRIMARY KEY CHECK (block_number >= 0),
            txid INTEGER NOT NULL
        )",
        schema.block_tx()
    ))
    .execute(&mut *conn)
    .await?;

    Ok(())
}

pub async fn get_index_state<'c, E>(
    executor: E,
    schema: &Schema,
) -> IndexResult<Option<IndexState>>
where
    E: Executor<'c, Database = Sqlite>,
{
    sqlx::query_as(&format!(
        "SELECT block_number, block_hash, handler_version_name, is_replay FROM {} WHERE id = 1",
        schema.index_state()
    ))
    .fetch_optional(executor)
    .await
    .map_err(decode_error)
}

pub async fn save_index_state<'c, E>(
    executor: E,
    schema: &Schema,
    state: &IndexState,
) -> IndexResult<()>
where
    E: Executor<'c, Database = Sqlite>,
{
    sqlx::query(&format!(
        "INSERT INTO {} (id, block_number, block_hash, is_replay, handler_version_name)
        VALUES (1, ?, ?, ?, ?)
        ON CONFLICT (id) DO UPDATE SET
            block_number = excluded.block_number,
            block_hash = excluded.block_hash,
            is_replay = excluded.is_replay,
            handler_version_name = excluded.handler_version_name",
        schema.index_state()
    ))
    .bind(state.block_number)
    .bind(&state.block_hash)
    .bind(state.is_replay)
    .bind(&state.handler_version_name)
    .execute(executor)
    .await?;
    Ok(())
}

pub async fn save_block_tx<'c, E>(
    executor: E,
    schema: &Schema,
    record: &BlockTxRecord,
) -> IndexResult<()>
where
    E: Executor<'c, Database = Sqlite>,
{
    sqlx::query(&format!(
        "INSERT INTO {} (block_number, txid) VALUES (?, ?)",
        schema.block_tx()
    ))
    .bind(record.block_number)
    .bind(record.transaction_id)
    .execute(executor)
    .await
    .map(|_| ())
    .map_err(|err| {
        if is_unique_violation(&err) {
            IndexError::Consistency(format!(
                "block {} already has a recorded transaction",
                record.block_number
            ))
        } else {
            err.into()
        }
    })
}

/// Records above `block_number`, highest block first.
pub async fn list_block_tx_above<'c, E>(
    executor: E,
    schema: &Schema,
    block_number: BlockNumber,
) -> IndexResult<Vec<BlockTxRecord>>
where
    E: Executor<'c, Database = Sqlite>,
{
    sqlx::query_as(&format!(
        "SELECT block_number, txid FROM {} WHERE block_number > ? ORDER BY block_number DESC",
        schema.block_tx()
    ))
    .bind(block_number)
    .fetch_all(executor)
    .await
    .map_err(decode_error)
}

pub async fn list_block_tx<'c, E>(executor: E, schema: &Schema) -> IndexResult<Vec<BlockTxRecord>>
where
    E: Executor<'c, Database = Sqlite>,
{
    sqlx::query_as(&format!(
        "SELECT block_number, txid FROM {} ORDER BY block_number",
        schema.block_tx()
    ))
    .fetch_all(executor)
    .await
    .map_err(decode_error)
}

/// Lowest record at or above `block_number`.
pub async fn first_block_tx_from<'c, E>(
    executor: E,
    schema: &Schema,
    block_number: BlockNumber,
) -> IndexResult<Option<BlockTxRecord>>
where
    E: Executor<'c, Database = Sqlite>,
{
    sqlx::query_as(&format!(
        "SELECT block_number, txid FROM {} WHERE block_number >= ? ORDER BY block_number LIMIT 1",
        schema.block_tx()
    ))
    .bind(block_number)
    .fetch_optional(executor)
    .await
    .map_err(decode_error)
}

pub async fn drop_block_tx<'c, E>(
    executor: E,
    schema: &Schema,
    block_number: BlockNumber,
) -> IndexResult<u64>
where
    E: Executor<'c, Database = Sqlite>,
{
    let rows = sqlx::query(&format!(
        "DELETE FROM {} WHERE block_number = ?",
        schema.block_tx()
    ))
    .bind(block_number)
    .execute(executor)
    .await?
    .rows_affected();

    Ok(rows)
}

// a stored row that doesn't decode (e.g. a negative block number) is a broken
// invariant rather than a storage failure
fn decode_error(err: sqlx::Error) -> IndexError {
    match err {
        sqlx::Error::ColumnDecode { .. } | sqlx::Error::Decode(_) => {
            IndexError::Consistency(err.to_string())
        }
        other => other.into(),
    }
}
