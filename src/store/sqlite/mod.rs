pub mod audit;
pub mod config;
mod handle;
mod query;
pub mod schema;

pub use audit::{AuditLog, TriggerAuditLog};
pub use handle::BlockTx;
pub use schema::Schema;

use crate::domain::{Block, BlockNumber, BlockTxRecord, IndexState, TxContext};
use crate::error::{IndexError, IndexResult};
use crate::store::sqlite::config::DatabaseConfig;
use crate::store::sqlite::schema::{BLOCK_TX_TABLE, INDEX_STATE_TABLE};
use crate::store::{BlockHandler, IndexStore, RollbackObserver};
use itertools::Itertools;
use sqlx::Pool;
use sqlx::sqlite::SqlitePoolOptions;
use tokio::sync::Mutex;

/// Transactional index over one sqlite schema.
///
/// Apply and rollback are serialized through `write_lock`; run a single store
/// per schema so the lock covers every writer in this process.
pub struct SqliteIndexStore<A = TriggerAuditLog> {
    pool: Pool<sqlx::Sqlite>,
    schema: Schema,
    audit: A,
    write_lock: Mutex<()>,
}

impl SqliteIndexStore<TriggerAuditLog> {
    pub async fn init(config: DatabaseConfig) -> IndexResult<Self> {
        let schema = Schema::new(config.schema)?;

        let mut options = SqlitePoolOptions::new().max_connections(config.max_connections);
        if let Some(path) = config.attach_path {
            let alias = schema.name().to_string();
            options = options.after_connect(move |conn, _meta| {
                let path = path.clone();
                let alias = alias.clone();
                Box::pin(async move {
                    sqlx::query(&format!("ATTACH DATABASE ? AS \"{alias}\""))
                        .bind(path)
                        .execute(conn)
                        .await?;
                    Ok(())
                })
            });
        }
        let pool = options.connect(config.database_url.as_ref()).await?;

        Self::with_audit_log(pool, schema, TriggerAuditLog).await
    }
}

impl<A: AuditLog> SqliteIndexStore<A> {
    /// Wraps an existing pool and makes sure the schema is set up.
    pub async fn with_audit_log(
        pool: Pool<sqlx::Sqlite>,
        schema: Schema,
        audit: A,
    ) -> IndexResult<Self> {
        let store = Self {
            pool,
            schema,
            audit,
            write_lock: Mutex::new(()),
        };
        store.setup().await?;
        Ok(store)
    }

    /// Idempotently creates the bookkeeping and audit tables. The bookkeeping
    /// tables are tracked too, so undoing a block restores the previous cursor.
    pub async fn setup(&self) -> IndexResult<()> {
        let mut tx = self.pool.begin().await?;
        query::create_tables(&mut *tx, &self.schema).await?;
        self.audit.install(&mut *tx, &self.schema).await?;
        self.audit
            .track_table(&mut *tx, &self.schema, INDEX_STATE_TABLE)
            .await?;
        self.audit
            .track_table(&mut *tx, &self.schema, BLOCK_TX_TABLE)
            .await?;
        tx.commit().await?;

        tracing::info!(schema = self.schema.name(), "Index schema ready");
        Ok(())
    }

    /// Puts a handler-owned table under change tracking so its rows roll back
    /// with the blocks that wrote them.
    pub async fn track_table(&self, table: &str) -> IndexResult<()> {
        let mut tx = self.pool.begin().await?;
        self.audit.track_table(&mut *tx, &self.schema, table).await?;
        tx.commit().await?;
        Ok(())
    }

    /// All block → transaction records, lowest block first.
    pub async fn block_tx_records(&self) -> IndexResult<Vec<BlockTxRecord>> {
        query::list_block_tx(&self.pool, &self.schema).await
    }

    pub fn schema(&self) -> &Schema {
        &self.schema
    }

    pub fn pool(&self) -> &Pool<sqlx::Sqlite> {
        &self.pool
    }

    pub fn audit_log(&self) -> &A {
        &self.audit
    }

    /// Undoes one block in its own transaction. The audit log restores the rows
    /// and the cursor; the record is dropped here in case the audit log didn't.
    async fn undo_block(&self, record: &BlockTxRecord) -> IndexResult<()> {
        let mut tx = self.pool.begin().await?;
        let own_id = self
            .audit
            .register_transaction(&mut *tx, &self.schema)
            .await?;
        let reverted = self
            .audit
            .undo(&mut *tx, &self.schema, record.transaction_id)
            .await?;
        query::drop_block_tx(&mut *tx, &self.schema, record.block_number).await?;
        self.audit
            .release_transaction(&mut *tx, &self.schema, own_id)
            .await?;
        tx.commit().await?;

        tracing::debug!(
            block_number = record.block_number.0,
            transaction_id = record.transaction_id.0,
            reverted,
            "Block undone"
        );
        Ok(())
    }
}

#[async_trait::async_trait]
impl<A: AuditLog> IndexStore for SqliteIndexStore<A> {
    async fn apply_block(
        &self,
        block: &Block,
        is_replay: bool,
        handler_version_name: &str,
        handler: &dyn BlockHandler,
    ) -> IndexResult<()> {
        let _guard = self.write_lock.lock().await;

        // sqlite transactions are serializable, a concurrent writer surfaces
        // as a busy/locked error which maps to IndexError::Conflict
        let mut tx = self.pool.begin().await?;

        // the first block may start anywhere, later ones must extend the cursor
        let cursor = query::get_index_state(&mut *tx, &self.schema)
            .await?
            .unwrap_or_default();
        if !cursor.is_genesis() && block.number != cursor.block_number + 1 {
            return Err(IndexError::Consistency(format!(
                "block {} does not follow cursor block {}",
                block.number, cursor.block_number
            )));
        }

        let transaction_id = self
            .audit
            .register_transaction(&mut *tx, &self.schema)
            .await?;
        let ctx = TxContext { transaction_id };

        let handled = {
            let mut handle = BlockTx::new(&mut *tx, &self.schema);
            handler.handle(&mut handle, &ctx, block).await
        };
        if let Err(err) = handled {
            let err = IndexError::from_handler(err);
            if let Err(rollback_err) = tx.rollback().await {
                tracing::warn!(
                    "Failed to roll back block {:?}: {:?}",
                    block.number,
                    rollback_err
                );
            }
            tracing::warn!("Block {:?} was not applied: {}", block.number, err);
            return Err(err);
        }

        let state = IndexState {
            block_number: block.number,
            block_hash: block.hash.clone(),
            handler_version_name: handler_version_name.to_string(),
            is_replay,
        };
        query::save_index_state(&mut *tx, &self.schema, &state).await?;
        query::save_block_tx(
            &mut *tx,
            &self.schema,
            &BlockTxRecord {
                block_number: block.number,
                transaction_id,
            },
        )
        .await?;
        self.audit
            .release_transaction(&mut *tx, &self.schema, transaction_id)
            .await?;
        tx.commit().await?;

        tracing::info!(
            "Applied block {:?} ({}) in transaction {}",
            block.number,
            block.hash,
            transaction_id
        );
        Ok(())
    }

    async fn rollback_to(
        &self,
        target: BlockNumber,
        observer: &dyn RollbackObserver,
    ) -> IndexResult<usize> {
        let _guard = self.write_lock.lock().await;

        let (cursor, records, lowest_retained) = {
            let mut tx = self.pool.begin().await?;
            let cursor = query::get_index_state(&mut *tx, &self.schema)
                .await?
                .unwrap_or_default();
            let records = query::list_block_tx_above(&mut *tx, &self.schema, target).await?;
            // transaction ids grow with the block number, the lowest one decides
            let lowest_retained = match records.last() {
                Some(lowest) => {
                    self.audit
                        .retains(&mut *tx, &self.schema, lowest.transaction_id)
                        .await?
                }
                None => true,
            };
            tx.commit().await?;
            (cursor, records, lowest_retained)
        };

        check_suffix(&cursor, &records)?;
        if !lowest_retained {
            return Err(IndexError::Consistency(format!(
                "undo history below block {} was pruned, cannot roll back to {}",
                cursor.block_number, target
            )));
        }

        let mut undone = 0;
        for record in &records {
            observer.rolling_back(record);
            if let Err(source) = self.undo_block(record).await {
                tracing::error!(
                    "Rollback to {:?} stopped at block {:?} after undoing {} block(s): {}",
                    target,
                    record.block_number,
                    undone,
                    source
                );
                return Err(IndexError::RollbackFailure {
                    block_number: record.block_number,
                    transaction_id: record.transaction_id,
                    undone,
                    source: Box::new(source),
                });
            }
            undone += 1;
        }

        observer.rollback_complete(target, undone);
        Ok(undone)
    }

    async fn load_cursor(&self) -> IndexResult<IndexState> {
        Ok(query::get_index_state(&self.pool, &self.schema)
            .await?
            .unwrap_or_default())
    }

    async fn prune_below(&self, block_number: BlockNumber) -> IndexResult<u64> {
        let _guard = self.write_lock.lock().await;

        let mut tx = self.pool.begin().await?;
        let Some(horizon) =
            query::first_block_tx_from(&mut *tx, &self.schema, block_number).await?
        else {
            return Ok(0);
        };
        let dropped = self
            .audit
            .prune(&mut *tx, &self.schema, horizon.transaction_id)
            .await?;
        tx.commit().await?;

        tracing::info!(
            below = block_number.0,
            horizon = horizon.block_number.0,
            dropped,
            "Pruned undo history"
        );
        Ok(dropped)
    }
}

/// Records above the rollback target must be the contiguous, descending tail
/// ending at the cursor, otherwise undoing them would leave a hole.
fn check_suffix(cursor: &IndexState, records: &[BlockTxRecord]) -> IndexResult<()> {
    let Some(highest) = records.first() else {
        return Ok(());
    };
    if highest.block_number != cursor.block_number {
        return Err(IndexError::Consistency(format!(
            "highest recorded block {} does not match cursor block {}",
            highest.block_number, cursor.block_number
        )));
    }
    if let Some((upper, lower)) = records
        .iter()
        .tuple_windows()
        .find(|(upper, lower)| lower.block_number.0 + 1 != upper.block_number.0)
    {
        return Err(IndexError::Consistency(format!(
            "recorded blocks are not contiguous between {} and {}",
            lower.block_number, upper.block_number
        )));
    }
    Ok(())
}
