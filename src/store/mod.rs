use crate::domain::{Block, BlockNumber, BlockTxRecord, IndexState, TxContext};
use crate::error::{HandlerError, IndexResult};

pub mod sqlite;

pub use sqlite::BlockTx;

/// Driver-facing api of the transactional index: the only entry points that
/// touch the cursor and the block → transaction mapping.
#[async_trait::async_trait]
pub trait IndexStore: Send + Sync {
    /// Applies one block inside a single serializable transaction: the handler's
    /// mutations, the cursor upsert and the block → transaction record commit together.
    async fn apply_block(
        &self,
        block: &Block,
        is_replay: bool,
        handler_version_name: &str,
        handler: &dyn BlockHandler,
    ) -> IndexResult<()>;

    /// Undoes every block above `target`, highest first. Returns how many were undone.
    async fn rollback_to(
        &self,
        target: BlockNumber,
        observer: &dyn RollbackObserver,
    ) -> IndexResult<usize>;

    /// Current cursor, or the pre-genesis default for a fresh schema.
    async fn load_cursor(&self) -> IndexResult<IndexState>;

    /// Drops the undo history of blocks below `block_number`. Rolling back
    /// past it is refused afterwards. Returns the number of dropped row changes.
    async fn prune_below(&self, block_number: BlockNumber) -> IndexResult<u64>;
}

/// Turns one block into row mutations.
#[async_trait::async_trait]
pub trait BlockHandler: Send + Sync {
    async fn handle(
        &self,
        tx: &mut BlockTx<'_>,
        ctx: &TxContext,
        block: &Block,
    ) -> Result<(), HandlerError>;
}

/// Hook invoked while a rollback walks down the recorded blocks.
pub trait RollbackObserver: Send + Sync {
    fn rolling_back(&self, record: &BlockTxRecord);

    fn rollback_complete(&self, target: BlockNumber, undone: usize);
}

#[derive(Debug, Default, Clone, Copy)]
pub struct TracingObserver;

impl RollbackObserver for TracingObserver {
    fn rolling_back(&self, record: &BlockTxRecord) {
        tracing::info!(
            block_number = record.block_number.0,
            transaction_id = record.transaction_id.0,
            "Rolling back block"
        );
    }

    fn rollback_complete(&self, target: BlockNumber, undone: usize) {
        tracing::info!(target_block = target.0, undone, "Rollback complete");
    }
}
