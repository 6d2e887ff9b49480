use crate::domain::{Block, BlockNumber};
use crate::reader::BlockReader;
use eyre::eyre;
use std::path::Path;

/// Serves blocks from an in-memory chain, block `n` at position `n - 1`.
///
/// Loaded from a JSON array of blocks; mostly useful for replaying fixtures.
#[derive(Debug, Clone, Default)]
pub struct JsonBlockReader {
    blocks: Vec<Block>,
}

impl JsonBlockReader {
    pub fn new(blocks: Vec<Block>) -> Self {
        Self { blocks }
    }

    pub async fn from_file(path: impl AsRef<Path>) -> eyre::Result<Self> {
        let path = path.as_ref();
        let raw = tokio::fs::read(path)
            .await
            .map_err(|e| eyre!("Failed to read blocks file {}: {}", path.display(), e))?;
        let blocks: Vec<Block> = serde_json::from_slice(&raw)?;
        tracing::info!("Loaded {} blocks from {}", blocks.len(), path.display());
        Ok(Self::new(blocks))
    }
}

#[async_trait::async_trait]
impl BlockReader for JsonBlockReader {
    async fn head_block_number(&self) -> eyre::Result<BlockNumber> {
        let Some(last) = self.blocks.last() else {
            return Ok(BlockNumber(0));
        };
        let position = self.blocks.len() as u64;
        if last.number.0 != position {
            return Err(eyre!(
                "Block at position {} indicates position {} incorrectly",
                position,
                last.number
            ));
        }
        Ok(last.number)
    }

    async fn get_block(&self, number: BlockNumber) -> eyre::Result<Option<Block>> {
        let Some(index) = number.0.checked_sub(1) else {
            return Ok(None);
        };
        let Some(block) = self.blocks.get(index as usize) else {
            return Ok(None);
        };
        if block.number != number {
            return Err(eyre!(
                "Block at position {} indicates position {} incorrectly",
                number,
                block.number
            ));
        }
        Ok(Some(block.clone()))
    }
}
