use crate::domain::{Block, BlockNumber};

pub mod config;
pub mod json;

/// A source of ordered blocks the indexer follows.
#[async_trait::async_trait]
pub trait BlockReader: Send + Sync {
    /// Number of the newest block the source can serve.
    async fn head_block_number(&self) -> eyre::Result<BlockNumber>;

    /// The block at `number` as the source currently sees it, `None` if it doesn't exist (yet).
    async fn get_block(&self, number: BlockNumber) -> eyre::Result<Option<Block>>;
}
