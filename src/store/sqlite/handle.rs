use crate::error::IndexResult;
use crate::store::sqlite::schema::Schema;
use sqlx::query::Query;
use sqlx::sqlite::{SqliteArguments, SqliteQueryResult, SqliteRow};
use sqlx::{Sqlite, SqliteConnection};

type SqliteQuery<'q> = Query<'q, Sqlite, SqliteArguments<'q>>;

/// Transactional handle given to a block handler.
///
/// Every statement runs inside the block's transaction. Commit and rollback
/// stay with the apply engine, the handler only reads and writes rows.
pub struct BlockTx<'t> {
    conn: &'t mut SqliteConnection,
    schema: &'t Schema,
}

impl<'t> BlockTx<'t> {
    pub(crate) fn new(conn: &'t mut SqliteConnection, schema: &'t Schema) -> Self {
        Self { conn, schema }
    }

    pub fn schema(&self) -> &Schema {
        self.schema
    }

    /// `"schema"."table"` for use in handler sql.
    pub fn table(&self, name: &str) -> IndexResult<String> {
        self.schema.table(name)
    }

    pub async fn execute<'q>(
        &mut self,
        query: SqliteQuery<'q>,
    ) -> Result<SqliteQueryResult, sqlx::Error> {
        query.execute(&mut *self.conn).await
    }

    pub async fn fetch_all<'q>(
        &mut self,
        query: SqliteQuery<'q>,
    ) -> Result<Vec<SqliteRow>, sqlx::Error> {
        query.fetch_all(&mut *self.conn).await
    }

    pub async fn fetch_one<'q>(
        &mut self,
        query: SqliteQuery<'q>,
    ) -> Result<SqliteRow, sqlx::Error> {
        query.fetch_one(&mut *self.conn).await
    }

    pub async fn fetch_optional<'q>(
        &mut self,
        query: SqliteQuery<'q>,
    ) -> Result<Option<SqliteRow>, sqlx::Error> {
        query.fetch_optional(&mut *self.conn).await
    }
}
