use envconfig::Envconfig;

#[derive(Debug, Clone, Envconfig)]
pub struct DatabaseConfig {
    #[envconfig(from = "DATABASE_URL")]
    pub database_url: String,
    /// sqlite database name the index lives in, `main` or the attach alias
    #[envconfig(from = "INDEX_DB_SCHEMA", default = "main")]
    pub schema: String,
    /// database file attached as `schema` on every pooled connection
    #[envconfig(from = "INDEX_DB_ATTACH_PATH")]
    pub attach_path: Option<String>,
    #[envconfig(from = "INDEX_DB_MAX_CONNECTIONS", default = "5")]
    pub max_connections: u32,
}
