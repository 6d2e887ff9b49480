use crate::domain::{Block, TxContext};
use crate::error::{HandlerError, IndexResult};
use crate::store::BlockHandler;
use crate::store::sqlite::{AuditLog, BlockTx, SqliteIndexStore};

pub const PAYLOAD_TABLE: &str = "block_payloads";

/// Stores every block's payload as a json row, keyed by the block that wrote it.
pub struct PayloadHandler;

impl PayloadHandler {
    /// Creates the payload table and puts it under change tracking.
    pub async fn prepare<A: AuditLog>(store: &SqliteIndexStore<A>) -> IndexResult<()> {
        sqlx::query(&format!(
            "CREATE TABLE IF NOT EXISTS {} (
                block_number INTEGER NOT NULL,
                block_hash TEXT NOT NULL,
                payload TEXT NOT NULL
            )",
            store.schema().table(PAYLOAD_TABLE)?
        ))
        .execute(store.pool())
        .await?;

        store.track_table(PAYLOAD_TABLE).await
    }
}

#[async_trait::async_trait]
impl BlockHandler for PayloadHandler {
    async fn handle(
        &self,
        tx: &mut BlockTx<'_>,
        ctx: &TxContext,
        block: &Block,
    ) -> Result<(), HandlerError> {
        let table = tx.table(PAYLOAD_TABLE)?;
        tx.execute(
            sqlx::query(&format!(
                "INSERT INTO {table} (block_number, block_hash, payload) VALUES (?, ?, ?)"
            ))
            .bind(block.number)
            .bind(&block.hash)
            .bind(block.payload.to_string()),
        )
        .await?;

        tracing::debug!(
            block_number = block.number.0,
            transaction_id = ctx.transaction_id.0,
            "Payload stored"
        );
        Ok(())
    }
}
