use crate::domain::{BlockHash, BlockNumber, IndexState};
use crate::error::IndexError;
use crate::reader::BlockReader;
use crate::store::{BlockHandler, IndexStore, TracingObserver};
use envconfig::Envconfig;
use std::cmp::max;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::MissedTickBehavior;

const DEFAULT_RUN_INTERVAL_MS: u64 = 1000;

/// Follows a block reader and keeps the index on its canonical chain: forks
/// are rolled back block by block, then the new branch is applied forward.
pub struct BlockIndexer {
    cfg: IndexerConfig,
    reader: Arc<dyn BlockReader>,
    store: Arc<dyn IndexStore>,
    handler: Arc<dyn BlockHandler>,
}

#[derive(Debug, Default, Clone, Copy, Eq, PartialEq)]
pub struct TickOutcome {
    pub rolled_back: usize,
    pub applied: usize,
    pub tip: BlockNumber,
}

impl BlockIndexer {
    pub fn new(
        cfg: IndexerConfig,
        reader: Arc<dyn BlockReader>,
        store: Arc<dyn IndexStore>,
        handler: Arc<dyn BlockHandler>,
    ) -> Self {
        Self {
            cfg,
            reader,
            store,
            handler,
        }
    }

    /// Ticks forever. Failed ticks are logged and retried on the next one.
    pub async fn run(&self) -> eyre::Result<()> {
        let period = Duration::from_millis(
            self.cfg
                .run_interval_ms
                .unwrap_or(DEFAULT_RUN_INTERVAL_MS),
        );
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            ticker.tick().await;
            match self.tick().await {
                Ok(_) => {}
                Err(e) if is_retryable(&e) => {
                    tracing::warn!("Index is busy, retrying in {:?}: {}", period, e);
                }
                Err(e) => tracing::error!("Tick failed: {:?}", e),
            }
        }
    }

    pub async fn tick(&self) -> eyre::Result<TickOutcome> {
        let (cursor, rolled_back) = self.reconcile_tip().await?;

        let head = self.reader.head_block_number().await?;
        // the start block only matters for an empty index
        let start = if cursor.is_genesis() {
            max(cursor.block_number + 1, self.cfg.start_block)
        } else {
            cursor.block_number + 1
        };

        tracing::info!(
            "Local tip {:?}, start block {:?}, reader head {:?}",
            cursor.block_number,
            start,
            head
        );

        let mut outcome = TickOutcome {
            rolled_back,
            applied: 0,
            tip: cursor.block_number,
        };

        let mut tip_hash: Option<BlockHash> = (!cursor.is_genesis()).then_some(cursor.block_hash);

        let mut number = start;
        while number <= head {
            let Some(block) = self.reader.get_block(number).await? else {
                tracing::warn!("Block {:?} is not available yet", number);
                break;
            };

            if let Some(expected) = &tip_hash {
                if !block.parent_hash.0.is_empty() && &block.parent_hash != expected {
                    tracing::warn!(
                        "Block {:?} does not extend local tip {}, reconciling on next tick",
                        number,
                        expected
                    );
                    break;
                }
            }

            self.store
                .apply_block(
                    &block,
                    self.cfg.replay,
                    &self.cfg.handler_version,
                    self.handler.as_ref(),
                )
                .await?;

            outcome.applied += 1;
            outcome.tip = block.number;
            tip_hash = Some(block.hash);
            number = number + 1;
        }

        if let Some(depth) = self.cfg.finality_depth {
            if let Some(horizon) = outcome.tip.0.checked_sub(depth).filter(|h| *h > 0) {
                self.store.prune_below(BlockNumber(horizon)).await?;
            }
        }

        tracing::info!(
            "Tick done: rolled back {}, applied {}, tip {:?}",
            outcome.rolled_back,
            outcome.applied,
            outcome.tip
        );

        Ok(outcome)
    }

    /// Rewinds the local tip until its hash matches the reader's block at the
    /// same height. Forks are expected to be shallow, so one block at a time is
    /// fine; the audit log restores the previous cursor on every step.
    async fn reconcile_tip(&self) -> eyre::Result<(IndexState, usize)> {
        let mut rolled_back = 0;
        loop {
            let cursor = self.store.load_cursor().await?;
            if cursor.is_genesis() {
                return Ok((cursor, rolled_back));
            }

            match self.reader.get_block(cursor.block_number).await? {
                Some(remote) if remote.hash == cursor.block_hash => {
                    return Ok((cursor, rolled_back));
                }
                Some(_) => tracing::info!(
                    "Fork detected at {:?}, rolling back by 1",
                    cursor.block_number
                ),
                None => tracing::warn!(
                    "Remote block not found at {:?}, rolling back by 1",
                    cursor.block_number
                ),
            }

            let target = cursor.block_number - 1;
            let undone = self.store.rollback_to(target, &TracingObserver).await?;
            if undone == 0 {
                return Err(eyre::eyre!(
                    "Cursor at {:?} has no recorded transaction to roll back",
                    cursor.block_number
                ));
            }
            rolled_back += undone;
        }
    }
}

#[derive(Debug, Clone, Envconfig)]
pub struct IndexerConfig {
    #[envconfig(from = "INDEX_HANDLER_VERSION", default = "v1")]
    pub handler_version: String,
    #[envconfig(from = "INDEX_START_BLOCK", default = "1")]
    pub start_block: BlockNumber,
    /// marks every applied block as part of a historical replay
    #[envconfig(from = "INDEX_REPLAY", default = "false")]
    pub replay: bool,
    /// keep following the reader at this interval, tick once when unset
    #[envconfig(from = "INDEX_RUN_INTERVAL_MS")]
    pub run_interval_ms: Option<u64>,
    /// blocks this far below the tip can no longer be rolled back, keep all when unset
    #[envconfig(from = "INDEX_FINALITY_DEPTH")]
    pub finality_depth: Option<u64>,
}

fn is_retryable(err: &eyre::Report) -> bool {
    err.downcast_ref::<IndexError>()
        .is_some_and(IndexError::is_retryable)
}

#[cfg(test)]
mod tests {
    use crate::domain::{Block, BlockHash, BlockNumber, BlockTxRecord, IndexState, TxContext};
    use crate::error::{HandlerError, IndexResult};
    use crate::indexer::{BlockIndexer, IndexerConfig, TickOutcome};
    use crate::reader::json::JsonBlockReader;
    use crate::store::{BlockHandler, BlockTx, IndexStore, RollbackObserver};
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    fn chain(hashes: &[&str]) -> Vec<Block> {
        let mut parent = String::new();
        hashes
            .iter()
            .enumerate()
            .map(|(i, hash)| {
                let block = Block {
                    number: BlockNumber(i as u64 + 1),
                    hash: BlockHash::from(*hash),
                    parent_hash: BlockHash(parent.clone()),
                    payload: serde_json::Value::Null,
                };
                parent = hash.to_string();
                block
            })
            .collect()
    }

    fn cfg() -> IndexerConfig {
        IndexerConfig {
            handler_version: "v1".to_string(),
            start_block: BlockNumber(1),
            replay: false,
            run_interval_ms: None,
            finality_depth: None,
        }
    }

    struct NoopHandler;

    #[async_trait::async_trait]
    impl BlockHandler for NoopHandler {
        async fn handle(
            &self,
            _tx: &mut BlockTx<'_>,
            _ctx: &TxContext,
            _block: &Block,
        ) -> Result<(), HandlerError> {
            Ok(())
        }
    }

    /// Keeps the applied chain in memory and records rollback targets.
    pub struct MockStore {
        pub applied: Mutex<Vec<(Block, bool, String)>>,
        pub rollbacks: Mutex<Vec<BlockNumber>>,
        pub prunes: Mutex<Vec<BlockNumber>>,
    }

    impl MockStore {
        pub fn new(initial: Vec<Block>) -> Self {
            Self {
                applied: Mutex::new(
                    initial
                        .into_iter()
                        .map(|b| (b, false, "v1".to_string()))
                        .collect(),
                ),
                rollbacks: Mutex::new(vec![]),
                prunes: Mutex::new(vec![]),
            }
        }

        pub fn hashes(&self) -> Vec<String> {
            self.applied
                .lock()
                .unwrap()
                .iter()
                .map(|(b, _, _)| b.hash.0.clone())
                .collect()
        }

        pub fn rollbacks(&self) -> Vec<BlockNumber> {
            self.rollbacks.lock().unwrap().clone()
        }
    }

    #[async_trait::async_trait]
    impl IndexStore for MockStore {
        async fn apply_block(
            &self,
            block: &Block,
            is_replay: bool,
            handler_version_name: &str,
            _handler: &dyn BlockHandler,
        ) -> IndexResult<()> {
            let mut guard = self.applied.lock().unwrap();
            guard.push((block.clone(), is_replay, handler_version_name.to_string()));
            Ok(())
        }

        async fn rollback_to(
            &self,
            target: BlockNumber,
            observer: &dyn RollbackObserver,
        ) -> IndexResult<usize> {
            self.rollbacks.lock().unwrap().push(target);
            let mut guard = self.applied.lock().unwrap();
            let mut undone = 0;
            while guard.last().is_some_and(|(b, _, _)| b.number > target) {
                if let Some((block, _, _)) = guard.pop() {
                    observer.rolling_back(&BlockTxRecord {
                        block_number: block.number,
                        transaction_id: crate::domain::TransactionId(block.number.0 as i64),
                    });
                    undone += 1;
                }
            }
            observer.rollback_complete(target, undone);
            Ok(undone)
        }

        async fn prune_below(&self, block_number: BlockNumber) -> IndexResult<u64> {
            self.prunes.lock().unwrap().push(block_number);
            Ok(0)
        }

        async fn load_cursor(&self) -> IndexResult<IndexState> {
            let guard = self.applied.lock().unwrap();
            Ok(guard
                .last()
                .map(|(b, is_replay, version)| IndexState {
                    block_number: b.number,
                    block_hash: b.hash.clone(),
                    handler_version_name: version.clone(),
                    is_replay: *is_replay,
                })
                .unwrap_or_default())
        }
    }

    fn indexer(cfg: IndexerConfig, remote: Vec<Block>, store: Arc<MockStore>) -> BlockIndexer {
        BlockIndexer::new(
            cfg,
            Arc::new(JsonBlockReader::new(remote)),
            store,
            Arc::new(NoopHandler),
        )
    }

    #[tokio::test]
    async fn test_indexes_from_genesis() -> eyre::Result<()> {
        let store = Arc::new(MockStore::new(vec![]));
        let indexer = indexer(cfg(), chain(&["a", "b", "c"]), store.clone());

        let outcome = indexer.tick().await?;

        assert_eq!(
            outcome,
            TickOutcome {
                rolled_back: 0,
                applied: 3,
                tip: BlockNumber(3),
            }
        );
        assert_eq!(store.hashes(), vec!["a", "b", "c"]);
        assert!(store.rollbacks().is_empty());

        // nothing new on the next tick
        let outcome = indexer.tick().await?;
        assert_eq!(outcome.applied, 0);
        assert_eq!(outcome.tip, BlockNumber(3));
        Ok(())
    }

    #[tokio::test]
    async fn test_rolls_back_to_fork_point_and_reapplies() -> eyre::Result<()> {
        let store = Arc::new(MockStore::new(chain(&["a", "b", "c"])));
        let indexer = indexer(cfg(), chain(&["a", "b2", "c2", "d2"]), store.clone());

        let outcome = indexer.tick().await?;

        assert_eq!(store.rollbacks(), vec![BlockNumber(2), BlockNumber(1)]);
        assert_eq!(outcome.rolled_back, 2);
        assert_eq!(outcome.applied, 3);
        assert_eq!(store.hashes(), vec!["a", "b2", "c2", "d2"]);
        Ok(())
    }

    #[tokio::test]
    async fn test_rolls_back_when_remote_chain_is_shorter() -> eyre::Result<()> {
        let store = Arc::new(MockStore::new(chain(&["a", "b", "c"])));
        let indexer = indexer(cfg(), chain(&["a", "b"]), store.clone());

        let outcome = indexer.tick().await?;

        assert_eq!(store.rollbacks(), vec![BlockNumber(2)]);
        assert_eq!(outcome.rolled_back, 1);
        assert_eq!(outcome.applied, 0);
        assert_eq!(store.hashes(), vec!["a", "b"]);
        Ok(())
    }

    #[tokio::test]
    async fn test_stops_at_block_not_extending_tip() -> eyre::Result<()> {
        let store = Arc::new(MockStore::new(vec![]));
        let mut remote = chain(&["a", "b", "c"]);
        remote[2].parent_hash = BlockHash::from("elsewhere");
        let indexer = indexer(cfg(), remote, store.clone());

        let outcome = indexer.tick().await?;

        assert_eq!(outcome.applied, 2);
        assert_eq!(store.hashes(), vec!["a", "b"]);
        Ok(())
    }

    #[tokio::test]
    async fn test_starts_at_configured_block_and_flags_replay() -> eyre::Result<()> {
        let store = Arc::new(MockStore::new(vec![]));
        let cfg = IndexerConfig {
            handler_version: "v2".to_string(),
            start_block: BlockNumber(3),
            replay: true,
            run_interval_ms: None,
            finality_depth: None,
        };
        let indexer = indexer(cfg, chain(&["a", "b", "c", "d"]), store.clone());

        indexer.tick().await?;

        assert_eq!(store.hashes(), vec!["c", "d"]);
        let applied = store.applied.lock().unwrap();
        assert!(applied.iter().all(|(_, is_replay, version)| *is_replay && version == "v2"));
        Ok(())
    }

    #[tokio::test]
    async fn test_prunes_below_finality_depth() -> eyre::Result<()> {
        let store = Arc::new(MockStore::new(vec![]));
        let cfg = IndexerConfig {
            finality_depth: Some(2),
            ..cfg()
        };
        let indexer = indexer(cfg, chain(&["a", "b", "c", "d", "e"]), store.clone());

        indexer.tick().await?;

        assert_eq!(*store.prunes.lock().unwrap(), vec![BlockNumber(3)]);
        Ok(())
    }

    #[tokio::test]
    async fn test_no_pruning_while_tip_is_shallow() -> eyre::Result<()> {
        let store = Arc::new(MockStore::new(vec![]));
        let cfg = IndexerConfig {
            finality_depth: Some(5),
            ..cfg()
        };
        let indexer = indexer(cfg, chain(&["a", "b", "c"]), store.clone());

        indexer.tick().await?;

        assert!(store.prunes.lock().unwrap().is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn test_start_block_is_ignored_once_indexed() -> eyre::Result<()> {
        let store = Arc::new(MockStore::new(chain(&["a", "b"])));
        let cfg = IndexerConfig {
            start_block: BlockNumber(4),
            ..cfg()
        };
        let indexer = indexer(cfg, chain(&["a", "b", "c", "d"]), store.clone());

        indexer.tick().await?;

        assert_eq!(store.hashes(), vec!["a", "b", "c", "d"]);
        Ok(())
    }

    #[tokio::test]
    async fn test_run_keeps_ticking() -> eyre::Result<()> {
        let store = Arc::new(MockStore::new(vec![]));
        let cfg = IndexerConfig {
            run_interval_ms: Some(10),
            ..cfg()
        };
        let indexer = indexer(cfg, chain(&["a", "b"]), store.clone());

        let result = tokio::time::timeout(Duration::from_millis(100), indexer.run()).await;

        assert!(result.is_err(), "run never returns on its own");
        assert_eq!(store.hashes(), vec!["a", "b"]);
        Ok(())
    }
}
