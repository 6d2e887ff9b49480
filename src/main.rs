use block_tx_indexer::config::Config;
use block_tx_indexer::handler::PayloadHandler;
use block_tx_indexer::indexer::BlockIndexer;
use block_tx_indexer::reader::json::JsonBlockReader;
use block_tx_indexer::store::sqlite::SqliteIndexStore;
use envconfig::Envconfig;
use std::sync::Arc;

#[tokio::main]
async fn main() -> eyre::Result<()> {
    // a missing .env is fine, everything can come from the environment
    dotenvy::dotenv().ok();

    let config = Config::init_from_env()?;

    tracing_subscriber::fmt()
        .with_max_level(config.log_level)
        .init();

    let reader = JsonBlockReader::from_file(&config.reader.blocks_file).await?;

    let store = SqliteIndexStore::init(config.db).await?;
    PayloadHandler::prepare(&store).await?;

    let indexer = BlockIndexer::new(
        config.indexer.clone(),
        Arc::new(reader),
        Arc::new(store),
        Arc::new(PayloadHandler),
    );

    match config.indexer.run_interval_ms {
        Some(_) => indexer.run().await,
        None => {
            indexer.tick().await?;
            Ok(())
        }
    }
}
