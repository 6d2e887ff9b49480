use crate::domain::TransactionId;
use crate::error::{IndexError, IndexResult};
use crate::store::sqlite::schema::{Schema, validate_identifier};
use itertools::Itertools;
use serde_json::Value;
use sqlx::query::Query;
use sqlx::sqlite::SqliteArguments;
use sqlx::{Sqlite, SqliteConnection};
use std::collections::HashMap;

const CONTEXT_TABLE: &str = "_audit_context";
const TRANSACTION_TABLE: &str = "_audit_transaction";
const EVENT_TABLE: &str = "_audit_event";

/// Change-tracking substrate: tags every tracked row mutation with the
/// registered transaction id and can revert everything recorded under an id.
///
/// All methods run on the caller's connection so they take part in the
/// caller's open transaction.
#[async_trait::async_trait]
pub trait AuditLog: Send + Sync {
    /// Creates the audit tables in `schema`. Idempotent.
    async fn install(&self, conn: &mut SqliteConnection, schema: &Schema) -> IndexResult<()>;

    /// Starts recording every insert, update and delete on `table`. Idempotent.
    async fn track_table(
        &self,
        conn: &mut SqliteConnection,
        schema: &Schema,
        table: &str,
    ) -> IndexResult<()>;

    /// Assigns an id to the open transaction; must precede any tracked mutation.
    async fn register_transaction(
        &self,
        conn: &mut SqliteConnection,
        schema: &Schema,
    ) -> IndexResult<TransactionId>;

    /// Clears the registration, must run before commit.
    async fn release_transaction(
        &self,
        conn: &mut SqliteConnection,
        schema: &Schema,
        transaction_id: TransactionId,
    ) -> IndexResult<()>;

    /// Reverts every mutation recorded under `transaction_id`, newest first.
    /// Returns the number of reverted row changes.
    async fn undo(
        &self,
        conn: &mut SqliteConnection,
        schema: &Schema,
        transaction_id: TransactionId,
    ) -> IndexResult<u64>;

    /// Whether `transaction_id` can still be undone.
    async fn retains(
        &self,
        conn: &mut SqliteConnection,
        schema: &Schema,
        transaction_id: TransactionId,
    ) -> IndexResult<bool>;

    /// Forgets every transaction older than `before`; those can no longer be
    /// undone. Returns the number of dropped row changes.
    async fn prune(
        &self,
        conn: &mut SqliteConnection,
        schema: &Schema,
        before: TransactionId,
    ) -> IndexResult<u64>;
}

/// Trigger based audit log living inside the schema it tracks.
///
/// Tracked tables need rowids (no `WITHOUT ROWID`) and must not hold BLOB
/// values, prior row images are kept as `json_object(..)` text. `REPLACE`
/// conflict resolution bypasses delete triggers and must not be used on them.
#[derive(Debug, Default, Clone, Copy)]
pub struct TriggerAuditLog;

#[derive(Debug, Copy, Clone, Eq, PartialEq, sqlx::Type)]
#[sqlx(rename_all = "UPPERCASE")]
enum AuditOperation {
    Insert,
    Update,
    Delete,
}

#[derive(Debug, sqlx::FromRow)]
struct AuditEvent {
    table_name: String,
    operation: AuditOperation,
    row_id: i64,
    prior_row_id: Option<i64>,
    old_row: Option<String>,
}

#[derive(Debug, sqlx::FromRow)]
struct ColumnInfo {
    name: String,
    #[sqlx(rename = "type")]
    declared_type: String,
    pk: i64,
}

#[async_trait::async_trait]
impl AuditLog for TriggerAuditLog {
    async fn install(&self, conn: &mut SqliteConnection, schema: &Schema) -> IndexResult<()> {
        let statements = [
            format!(
                "CREATE TABLE IF NOT EXISTS {} (
                    id INTEGER PRIMARY KEY CHECK (id = 1),
                    transaction_id INTEGER,
                    suspended INTEGER NOT NULL DEFAULT 0
                )",
                schema.qualified(CONTEXT_TABLE)
            ),
            format!(
                "INSERT OR IGNORE INTO {} (id, transaction_id, suspended) VALUES (1, NULL, 0)",
                schema.qualified(CONTEXT_TABLE)
            ),
            format!(
                "CREATE TABLE IF NOT EXISTS {} (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    registered_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP
                )",
                schema.qualified(TRANSACTION_TABLE)
            ),
            format!(
                "CREATE TABLE IF NOT EXISTS {} (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    transaction_id INTEGER NOT NULL,
                    table_name TEXT NOT NULL,
                    operation TEXT NOT NULL CHECK (operation IN ('INSERT', 'UPDATE', 'DELETE')),
                    row_id INTEGER NOT NULL,
                    prior_row_id INTEGER,
                    old_row TEXT
                )",
                schema.qualified(EVENT_TABLE)
            ),
            format!(
                "CREATE INDEX IF NOT EXISTS {} ON \"{EVENT_TABLE}\" (transaction_id)",
                schema.qualified("_audit_event_transaction_idx")
            ),
        ];
        for sql in &statements {
            sqlx::query(sql).execute(&mut *conn).await?;
        }
        Ok(())
    }

    async fn track_table(
        &self,
        conn: &mut SqliteConnection,
        schema: &Schema,
        table: &str,
    ) -> IndexResult<()> {
        validate_identifier(table)?;
        let columns = table_columns(&mut *conn, schema, table).await?;
        if columns.is_empty() {
            return Err(IndexError::Consistency(format!(
                "cannot track {schema}.{table}: table does not exist"
            )));
        }
        for column in &columns {
            validate_identifier(&column.name)?;
        }

        let old_image = format!(
            "json_object({})",
            columns
                .iter()
                .map(|c| format!("'{0}', OLD.\"{0}\"", c.name))
                .join(", ")
        );
        let triggers = [
            (AuditOperation::Insert, "NEW.rowid", "NULL", "NULL".to_string()),
            (AuditOperation::Update, "NEW.rowid", "OLD.rowid", old_image.clone()),
            (AuditOperation::Delete, "OLD.rowid", "NULL", old_image),
        ];

        for (operation, row_id, prior_row_id, old_row) in triggers {
            let op = operation.as_str();
            let sql = format!(
                "CREATE TRIGGER IF NOT EXISTS {trigger} AFTER {op} ON \"{table}\"
                WHEN (SELECT suspended FROM {CONTEXT_TABLE} WHERE id = 1) = 0
                BEGIN
                    SELECT RAISE(ABORT, 'audit: {table} changed outside a registered transaction')
                    WHERE (SELECT transaction_id FROM {CONTEXT_TABLE} WHERE id = 1) IS NULL;
                    INSERT INTO {EVENT_TABLE}
                        (transaction_id, table_name, operation, row_id, prior_row_id, old_row)
                    VALUES (
                        (SELECT transaction_id FROM {CONTEXT_TABLE} WHERE id = 1),
                        '{table}', '{op}', {row_id}, {prior_row_id}, {old_row}
                    );
                END",
                trigger = schema.qualified(&format!("_audit_{table}_{}", op.to_lowercase())),
            );
            sqlx::query(&sql).execute(&mut *conn).await?;
        }

        tracing::debug!(schema = schema.name(), table, "Tracking table changes");
        Ok(())
    }

    async fn register_transaction(
        &self,
        conn: &mut SqliteConnection,
        schema: &Schema,
    ) -> IndexResult<TransactionId> {
        let id = sqlx::query(&format!(
            "INSERT INTO {} DEFAULT VALUES",
            schema.qualified(TRANSACTION_TABLE)
        ))
        .execute(&mut *conn)
        .await?
        .last_insert_rowid();

        sqlx::query(&format!(
            "UPDATE {} SET transaction_id = ? WHERE id = 1",
            schema.qualified(CONTEXT_TABLE)
        ))
        .bind(id)
        .execute(&mut *conn)
        .await?;

        Ok(TransactionId(id))
    }

    async fn release_transaction(
        &self,
        conn: &mut SqliteConnection,
        schema: &Schema,
        transaction_id: TransactionId,
    ) -> IndexResult<()> {
        let released = sqlx::query(&format!(
            "UPDATE {} SET transaction_id = NULL WHERE id = 1 AND transaction_id = ?",
            schema.qualified(CONTEXT_TABLE)
        ))
        .bind(transaction_id)
        .execute(&mut *conn)
        .await?
        .rows_affected();

        if released == 0 {
            return Err(IndexError::Consistency(format!(
                "audit transaction {transaction_id} is not the registered one in {schema}"
            )));
        }
        Ok(())
    }

    async fn undo(
        &self,
        conn: &mut SqliteConnection,
        schema: &Schema,
        transaction_id: TransactionId,
    ) -> IndexResult<u64> {
        if !self.retains(&mut *conn, schema, transaction_id).await? {
            return Err(IndexError::Consistency(format!(
                "audit transaction {transaction_id} was pruned from {schema}"
            )));
        }

        let events: Vec<AuditEvent> = sqlx::query_as(&format!(
            "SELECT table_name, operation, row_id, prior_row_id, old_row
            FROM {} WHERE transaction_id = ? ORDER BY id DESC",
            schema.qualified(EVENT_TABLE)
        ))
        .bind(transaction_id)
        .fetch_all(&mut *conn)
        .await?;

        set_suspended(&mut *conn, schema, true).await?;

        let mut aliases: HashMap<String, Option<String>> = HashMap::new();
        for event in &events {
            validate_identifier(&event.table_name)?;
            if !aliases.contains_key(&event.table_name) {
                let alias = rowid_alias(&mut *conn, schema, &event.table_name).await?;
                aliases.insert(event.table_name.clone(), alias);
            }
            let alias = aliases.get(&event.table_name).and_then(Option::as_deref);
            revert(&mut *conn, schema, event, alias).await?;
        }

        sqlx::query(&format!(
            "DELETE FROM {} WHERE transaction_id = ?",
            schema.qualified(EVENT_TABLE)
        ))
        .bind(transaction_id)
        .execute(&mut *conn)
        .await?;

        set_suspended(&mut *conn, schema, false).await?;

        Ok(events.len() as u64)
    }

    async fn retains(
        &self,
        conn: &mut SqliteConnection,
        schema: &Schema,
        transaction_id: TransactionId,
    ) -> IndexResult<bool> {
        let found: Option<i64> = sqlx::query_scalar(&format!(
            "SELECT id FROM {} WHERE id = ?",
            schema.qualified(TRANSACTION_TABLE)
        ))
        .bind(transaction_id)
        .fetch_optional(&mut *conn)
        .await?;
        Ok(found.is_some())
    }

    async fn prune(
        &self,
        conn: &mut SqliteConnection,
        schema: &Schema,
        before: TransactionId,
    ) -> IndexResult<u64> {
        let events = sqlx::query(&format!(
            "DELETE FROM {} WHERE transaction_id < ?",
            schema.qualified(EVENT_TABLE)
        ))
        .bind(before)
        .execute(&mut *conn)
        .await?
        .rows_affected();

        // AUTOINCREMENT keeps pruned ids from being handed out again
        sqlx::query(&format!(
            "DELETE FROM {} WHERE id < ?",
            schema.qualified(TRANSACTION_TABLE)
        ))
        .bind(before)
        .execute(&mut *conn)
        .await?;

        tracing::debug!(
            schema = schema.name(),
            before = before.0,
            events,
            "Pruned audit history"
        );
        Ok(events)
    }
}

impl AuditOperation {
    fn as_str(&self) -> &'static str {
        match self {
            AuditOperation::Insert => "INSERT",
            AuditOperation::Update => "UPDATE",
            AuditOperation::Delete => "DELETE",
        }
    }
}

async fn revert(
    conn: &mut SqliteConnection,
    schema: &Schema,
    event: &AuditEvent,
    rowid_alias: Option<&str>,
) -> IndexResult<()> {
    let table = schema.qualified(&event.table_name);

    if event.operation == AuditOperation::Insert {
        sqlx::query(&format!("DELETE FROM {table} WHERE rowid = ?"))
            .bind(event.row_id)
            .execute(&mut *conn)
            .await?;
        return Ok(());
    }

    let image = old_row_image(event)?;
    for column in image.keys() {
        validate_identifier(column)?;
    }
    // an INTEGER PRIMARY KEY column restores the rowid by itself
    let restore_rowid = rowid_alias.is_none();

    let sql = match event.operation {
        AuditOperation::Update => {
            let mut assignments = image.keys().map(|c| format!("\"{c}\" = ?")).collect_vec();
            if restore_rowid {
                assignments.push("rowid = ?".to_string());
            }
            format!(
                "UPDATE {table} SET {} WHERE rowid = ?",
                assignments.join(", ")
            )
        }
        _ => {
            let mut columns = image.keys().map(|c| format!("\"{c}\"")).collect_vec();
            if restore_rowid {
                columns.push("rowid".to_string());
            }
            format!(
                "INSERT INTO {table} ({}) VALUES ({})",
                columns.join(", "),
                columns.iter().map(|_| "?").join(", ")
            )
        }
    };

    let mut query = sqlx::query(&sql);
    for value in image.values() {
        query = bind_json(query, value);
    }
    query = match event.operation {
        AuditOperation::Update => {
            let prior = event.prior_row_id.unwrap_or(event.row_id);
            if restore_rowid {
                query = query.bind(prior);
            }
            query.bind(event.row_id)
        }
        _ if restore_rowid => query.bind(event.row_id),
        _ => query,
    };
    query.execute(&mut *conn).await?;
    Ok(())
}

fn old_row_image(event: &AuditEvent) -> IndexResult<serde_json::Map<String, Value>> {
    let raw = event.old_row.as_deref().ok_or_else(|| {
        IndexError::Consistency(format!(
            "audit event on {} at rowid {} has no prior row image",
            event.table_name, event.row_id
        ))
    })?;
    match serde_json::from_str(raw) {
        Ok(Value::Object(map)) => Ok(map),
        _ => Err(IndexError::Consistency(format!(
            "audit event on {} at rowid {} has a malformed row image",
            event.table_name, event.row_id
        ))),
    }
}

fn bind_json<'q>(
    query: Query<'q, Sqlite, SqliteArguments<'q>>,
    value: &Value,
) -> Query<'q, Sqlite, SqliteArguments<'q>> {
    match value {
        Value::Null => query.bind(None::<i64>),
        Value::Bool(b) => query.bind(*b),
        Value::Number(n) => match n.as_i64() {
            Some(i) => query.bind(i),
            None => query.bind(n.as_f64()),
        },
        Value::String(s) => query.bind(s.clone()),
        other => query.bind(other.to_string()),
    }
}

async fn set_suspended(
    conn: &mut SqliteConnection,
    schema: &Schema,
    suspended: bool,
) -> IndexResult<()> {
    sqlx::query(&format!(
        "UPDATE {} SET suspended = ? WHERE id = 1",
        schema.qualified(CONTEXT_TABLE)
    ))
    .bind(suspended)
    .execute(&mut *conn)
    .await?;
    Ok(())
}

async fn table_columns(
    conn: &mut SqliteConnection,
    schema: &Schema,
    table: &str,
) -> IndexResult<Vec<ColumnInfo>> {
    let columns =
        sqlx::query_as("SELECT name, type, pk FROM pragma_table_info(?, ?) ORDER BY cid")
            .bind(table)
            .bind(schema.name())
            .fetch_all(&mut *conn)
            .await?;
    Ok(columns)
}

async fn rowid_alias(
    conn: &mut SqliteConnection,
    schema: &Schema,
    table: &str,
) -> IndexResult<Option<String>> {
    let columns = table_columns(conn, schema, table).await?;
    let mut keys = columns.into_iter().filter(|c| c.pk > 0);
    match (keys.next(), keys.next()) {
        (Some(key), None) if key.declared_type.eq_ignore_ascii_case("INTEGER") => {
            Ok(Some(key.name))
        }
        _ => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sqlx::{Connection, Row};

    async fn in_mem_conn() -> eyre::Result<SqliteConnection> {
        let mut conn = SqliteConnection::connect(":memory:").await?;
        let schema = Schema::main();
        TriggerAuditLog.install(&mut conn, &schema).await?;
        sqlx::query(
            "CREATE TABLE accounts (name TEXT NOT NULL UNIQUE, balance INTEGER NOT NULL, note TEXT)",
        )
        .execute(&mut conn)
        .await?;
        sqlx::query("CREATE TABLE tags (id INTEGER PRIMARY KEY, label TEXT NOT NULL)")
            .execute(&mut conn)
            .await?;
        TriggerAuditLog
            .track_table(&mut conn, &schema, "accounts")
            .await?;
        TriggerAuditLog.track_table(&mut conn, &schema, "tags").await?;
        Ok(conn)
    }

    async fn accounts(
        conn: &mut SqliteConnection,
    ) -> eyre::Result<Vec<(String, i64, Option<String>)>> {
        let rows = sqlx::query("SELECT name, balance, note FROM accounts ORDER BY rowid")
            .fetch_all(conn)
            .await?;
        Ok(rows
            .into_iter()
            .map(|r| (r.get("name"), r.get("balance"), r.get("note")))
            .collect())
    }

    async fn with_registered<F>(
        conn: &mut SqliteConnection,
        statements: F,
    ) -> eyre::Result<TransactionId>
    where
        F: IntoIterator<Item = &'static str>,
    {
        let schema = Schema::main();
        let id = TriggerAuditLog
            .register_transaction(&mut *conn, &schema)
            .await?;
        for sql in statements {
            sqlx::query(sql).execute(&mut *conn).await?;
        }
        TriggerAuditLog
            .release_transaction(&mut *conn, &schema, id)
            .await?;
        Ok(id)
    }

    #[tokio::test]
    async fn test_undo_reverts_insert_update_delete() -> eyre::Result<()> {
        let mut conn = in_mem_conn().await?;
        let schema = Schema::main();

        with_registered(
            &mut conn,
            [
                "INSERT INTO accounts (name, balance, note) VALUES ('alice', 10, NULL)",
                "INSERT INTO accounts (name, balance, note) VALUES ('bob', 5, 'first')",
            ],
        )
        .await?;
        let before = accounts(&mut conn).await?;

        let second = with_registered(
            &mut conn,
            [
                "UPDATE accounts SET balance = 99, note = 'changed' WHERE name = 'alice'",
                "DELETE FROM accounts WHERE name = 'bob'",
                "INSERT INTO accounts (name, balance, note) VALUES ('carol', 1, NULL)",
            ],
        )
        .await?;
        assert_ne!(accounts(&mut conn).await?, before);

        let reverted = TriggerAuditLog.undo(&mut conn, &schema, second).await?;
        assert_eq!(reverted, 3);
        assert_eq!(accounts(&mut conn).await?, before);

        let remaining: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM _audit_event WHERE transaction_id = ?")
                .bind(second)
                .fetch_one(&mut conn)
                .await?;
        assert_eq!(remaining, 0, "undone events are consumed");
        Ok(())
    }

    #[tokio::test]
    async fn test_undo_restores_rowid_alias_rows() -> eyre::Result<()> {
        let mut conn = in_mem_conn().await?;
        let schema = Schema::main();

        with_registered(&mut conn, ["INSERT INTO tags (id, label) VALUES (7, 'seven')"]).await?;
        let id = with_registered(
            &mut conn,
            [
                "UPDATE tags SET id = 8, label = 'eight' WHERE id = 7",
                "INSERT INTO tags (id, label) VALUES (9, 'nine')",
            ],
        )
        .await?;

        TriggerAuditLog.undo(&mut conn, &schema, id).await?;

        let rows: Vec<(i64, String)> = sqlx::query_as("SELECT id, label FROM tags ORDER BY id")
            .fetch_all(&mut conn)
            .await?;
        assert_eq!(rows, vec![(7, "seven".to_string())]);
        Ok(())
    }

    #[tokio::test]
    async fn test_unregistered_writes_are_rejected() -> eyre::Result<()> {
        let mut conn = in_mem_conn().await?;

        let result = sqlx::query("INSERT INTO accounts (name, balance) VALUES ('mallory', 1)")
            .execute(&mut conn)
            .await;
        assert!(result.is_err(), "tracked tables need a registered transaction");
        assert!(accounts(&mut conn).await?.is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn test_release_requires_registered_id() -> eyre::Result<()> {
        let mut conn = in_mem_conn().await?;
        let schema = Schema::main();

        let id = TriggerAuditLog
            .register_transaction(&mut conn, &schema)
            .await?;
        let wrong = TransactionId(id.0 + 100);
        let err = TriggerAuditLog
            .release_transaction(&mut conn, &schema, wrong)
            .await
            .unwrap_err();
        assert!(matches!(err, IndexError::Consistency(_)));
        TriggerAuditLog
            .release_transaction(&mut conn, &schema, id)
            .await?;
        Ok(())
    }

    #[tokio::test]
    async fn test_prune_forgets_older_transactions() -> eyre::Result<()> {
        let mut conn = in_mem_conn().await?;
        let schema = Schema::main();

        let first = with_registered(
            &mut conn,
            ["INSERT INTO accounts (name, balance, note) VALUES ('alice', 10, NULL)"],
        )
        .await?;
        let second = with_registered(
            &mut conn,
            ["UPDATE accounts SET balance = 11 WHERE name = 'alice'"],
        )
        .await?;

        let dropped = TriggerAuditLog.prune(&mut conn, &schema, second).await?;
        assert_eq!(dropped, 1);
        assert!(!TriggerAuditLog.retains(&mut conn, &schema, first).await?);
        assert!(TriggerAuditLog.retains(&mut conn, &schema, second).await?);

        let err = TriggerAuditLog
            .undo(&mut conn, &schema, first)
            .await
            .unwrap_err();
        assert!(matches!(err, IndexError::Consistency(_)));

        // the retained transaction still undoes
        TriggerAuditLog.undo(&mut conn, &schema, second).await?;
        let balance: i64 = sqlx::query_scalar("SELECT balance FROM accounts WHERE name = 'alice'")
            .fetch_one(&mut conn)
            .await?;
        assert_eq!(balance, 10);

        // ids are never reused after pruning
        let next = TriggerAuditLog
            .register_transaction(&mut conn, &schema)
            .await?;
        assert!(next.0 > second.0);
        Ok(())
    }

    #[tokio::test]
    async fn test_tracking_a_missing_table_fails() -> eyre::Result<()> {
        let mut conn = in_mem_conn().await?;
        let err = TriggerAuditLog
            .track_table(&mut conn, &Schema::main(), "nope")
            .await
            .unwrap_err();
        assert!(matches!(err, IndexError::Consistency(_)));
        Ok(())
    }
}
