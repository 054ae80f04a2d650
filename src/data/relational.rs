use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Map, Value};

use super::records::{Direction, RecordDataAccess, RecordStore, Table, WriteOp};
use super::Filter;
use crate::error::{StorageError, StorageResult};
use crate::host::{commands, invoke_as, InvokeChannel};

/// A `RecordStore` backed by SQLite inside the host process.
///
/// Nothing here talks to the database directly, statements are built here
/// and executed by the host through the `sqlite:*` commands.
#[derive(Clone)]
pub struct SqliteRecords {
    host: Arc<dyn InvokeChannel>,
}

pub type SqliteDataAccess = RecordDataAccess<SqliteRecords>;

impl SqliteRecords {
    pub fn new(host: Arc<dyn InvokeChannel>) -> Self {
        Self { host }
    }

    async fn rows(&self, sql: String, params: Vec<Value>, table: Table) -> StorageResult<Vec<Value>> {
        let rows: Vec<Value> =
            invoke_as(self.host.as_ref(), commands::SQLITE_ALL, json!([sql, params])).await?;
        Ok(rows.into_iter().map(|row| from_row(table, row)).collect())
    }

    async fn row(&self, sql: String, params: Vec<Value>) -> StorageResult<Value> {
        self.host
            .invoke(commands::SQLITE_GET, json!([sql, params]))
            .await
    }
}

impl SqliteDataAccess {
    pub fn with_host(host: Arc<dyn InvokeChannel>) -> Self {
        RecordDataAccess::new(SqliteRecords::new(host))
    }
}

#[derive(serde::Deserialize)]
struct Changes {
    changes: u64,
}

/// Quotes an identifier, the column lists are fixed so this only guards
/// the reserved `type` column.
#[inline]
fn quoted(column: &str) -> String {
    format!("\"{}\"", column)
}

/// Converts a JSON value into a statement parameter for `column`.
fn to_param(table: Table, column: &str, value: Value) -> Value {
    if table.json_columns().contains(&column) && !value.is_null() {
        return Value::String(value.to_string());
    }

    value
}

/// Converts a row read back from SQLite into the record's JSON shape.
fn from_row(table: Table, row: Value) -> Value {
    let mut fields = match row {
        Value::Object(fields) => fields,
        other => return other,
    };

    for column in table.json_columns() {
        if let Some(Value::String(text)) = fields.get(*column) {
            match serde_json::from_str::<Value>(text) {
                Ok(parsed) => {
                    fields.insert(column.to_string(), parsed);
                }
                Err(e) => warn!("{}.{} holds invalid json: {}", table, column, e),
            }
        }
    }

    for column in table.bool_columns() {
        if let Some(Value::Number(n)) = fields.get(*column) {
            let flag = n.as_i64().map(|v| v != 0).unwrap_or(false);
            fields.insert(column.to_string(), Value::Bool(flag));
        }
    }

    Value::Object(fields)
}

/// `WHERE a = ? AND b = ?` for the filter, empty when there is no filter.
fn where_clause(table: Table, filter: &Filter) -> StorageResult<(String, Vec<Value>)> {
    table.check_fields(filter)?;
    if filter.is_empty() {
        return Ok((String::new(), vec![]));
    }

    let clause = filter
        .keys()
        .map(|k| format!("{} = ?", quoted(k)))
        .collect::<Vec<_>>()
        .join(" AND ");

    let params = filter
        .iter()
        .map(|(k, v)| to_param(table, k, v.clone()))
        .collect();

    Ok((format!(" WHERE {}", clause), params))
}

fn insert_statement(verb: &str, table: Table, record: Map<String, Value>) -> StorageResult<Value> {
    table.check_fields(&record)?;
    if record.is_empty() {
        return Err(StorageError::invalid(format!("empty {} record", table)));
    }

    let columns = record.keys().map(|k| quoted(k)).collect::<Vec<_>>().join(", ");
    let placeholders = vec!["?"; record.len()].join(", ");
    let params: Vec<Value> = record
        .into_iter()
        .map(|(k, v)| to_param(table, &k, v))
        .collect();

    let sql = format!(
        "{} INTO {} ({}) VALUES ({})",
        verb,
        table.name(),
        columns,
        placeholders
    );

    Ok(json!([sql, params]))
}

fn statement(op: WriteOp) -> StorageResult<Value> {
    match op {
        WriteOp::Insert { table, record } => insert_statement("INSERT", table, record),
        WriteOp::Upsert { table, record } => insert_statement("INSERT OR REPLACE", table, record),
        WriteOp::Update { table, key, patch } => {
            table.check_fields(&patch)?;
            if patch.is_empty() {
                return Err(StorageError::invalid(format!("empty {} update", table)));
            }

            let assignments = patch
                .keys()
                .map(|k| format!("{} = ?", quoted(k)))
                .collect::<Vec<_>>()
                .join(", ");

            let mut params: Vec<Value> = patch
                .into_iter()
                .map(|(k, v)| to_param(table, &k, v))
                .collect();
            params.push(Value::String(key));

            let sql = format!(
                "UPDATE {} SET {} WHERE {} = ?",
                table.name(),
                assignments,
                quoted(table.key_column())
            );
            Ok(json!([sql, params]))
        }
        WriteOp::DeleteWhere { table, filter } => {
            let (clause, params) = where_clause(table, &filter)?;
            let sql = format!("DELETE FROM {}{}", table.name(), clause);
            Ok(json!([sql, params]))
        }
    }
}

#[async_trait]
impl RecordStore for SqliteRecords {
    fn name(&self) -> &'static str {
        "sqlite"
    }

    async fn select(&self, table: Table, filter: &Filter) -> StorageResult<Vec<Value>> {
        let (clause, params) = where_clause(table, filter)?;
        let sql = format!(
            "SELECT * FROM {}{} ORDER BY {} ASC",
            table.name(),
            clause,
            quoted(table.key_column())
        );
        self.rows(sql, params, table).await
    }

    async fn select_page(
        &self,
        table: Table,
        filter: &Filter,
        offset: usize,
        limit: usize,
    ) -> StorageResult<Vec<Value>> {
        let (clause, mut params) = where_clause(table, filter)?;
        params.push(Value::from(limit.min(i64::MAX as usize) as i64));
        params.push(Value::from(offset.min(i64::MAX as usize) as i64));

        let sql = format!(
            "SELECT * FROM {}{} ORDER BY {} ASC LIMIT ? OFFSET ?",
            table.name(),
            clause,
            quoted(table.key_column())
        );
        self.rows(sql, params, table).await
    }

    async fn find(&self, table: Table, key: &str) -> StorageResult<Option<Value>> {
        let sql = format!(
            "SELECT * FROM {} WHERE {} = ?",
            table.name(),
            quoted(table.key_column())
        );

        match self.row(sql, vec![Value::from(key)]).await? {
            Value::Null => Ok(None),
            row => Ok(Some(from_row(table, row))),
        }
    }

    async fn neighbour(
        &self,
        table: Table,
        key: &str,
        direction: Direction,
    ) -> StorageResult<Option<String>> {
        let (cmp, order) = match direction {
            Direction::Next => (">", "ASC"),
            Direction::Previous => ("<", "DESC"),
        };

        let column = quoted(table.key_column());
        let sql = format!(
            "SELECT {col} AS key FROM {table} WHERE {col} {cmp} ? ORDER BY {col} {order} LIMIT 1",
            col = column,
            table = table.name(),
            cmp = cmp,
            order = order,
        );

        let row = self.row(sql, vec![Value::from(key)]).await?;
        Ok(row.get("key").and_then(Value::as_str).map(String::from))
    }

    async fn apply(&self, ops: Vec<WriteOp>) -> StorageResult<u64> {
        let mut statements = ops
            .into_iter()
            .map(statement)
            .collect::<StorageResult<Vec<Value>>>()?;

        let result: Changes = match statements.len() {
            0 => return Ok(0),
            1 => {
                let single = statements.remove(0);
                invoke_as(self.host.as_ref(), commands::SQLITE_RUN, single).await?
            }
            _ => {
                invoke_as(
                    self.host.as_ref(),
                    commands::SQLITE_BATCH,
                    Value::Array(statements),
                )
                .await?
            }
        };

        Ok(result.changes)
    }
}
