use crate::indexer::IndexerConfig;
use crate::reader::config::ReaderConfig;
use crate::store::sqlite::config::DatabaseConfig;
use envconfig::Envconfig;
use tracing::level_filters::LevelFilter;

#[derive(Debug, Clone, Envconfig)]
pub struct Config {
    #[envconfig(nested)]
    pub reader: ReaderConfig,
    #[envconfig(nested)]
    pub db: DatabaseConfig,
    #[envconfig(nested)]
    pub indexer: IndexerConfig,
    #[envconfig(from = "INDEX_LOG_LEVEL", default = "info")]
    pub log_level: LevelFilter,
}
