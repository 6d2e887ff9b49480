use envconfig::Envconfig;
use std::path::PathBuf;

#[derive(Debug, Clone, Envconfig)]
pub struct ReaderConfig {
    #[envconfig(from = "INDEX_BLOCKS_FILE")]
    pub blocks_file: PathBuf,
}
