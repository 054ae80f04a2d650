use serde::Deserialize;
use serde_json::{Map, Value};
use sqlx::query::Query;
use sqlx::sqlite::{Sqlite, SqliteArguments, SqlitePool, SqlitePoolOptions, SqliteRow};
use sqlx::{Column, Row, TypeInfo, ValueRef};

use crate::error::{StorageError, StorageResult};

/// The configuration for the host's SQLite database.
///
/// The `connection_uri` should be formatted as a direct connect
/// uri. e.g.
/// `sqlite://labelstore.db`
///
/// The `pool_size` determined the *maximum* amount of pool connections.
#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    pub connection_uri: String,
    pub pool_size: u32,
}

const SCHEMA: &[&str] = &[
    r#"CREATE TABLE IF NOT EXISTS projects (
        id TEXT PRIMARY KEY,
        name TEXT NOT NULL,
        description TEXT,
        type TEXT,
        status TEXT,
        settings TEXT,
        metadata TEXT,
        createdAt TEXT,
        updatedAt TEXT,
        lastModified TEXT
    )"#,
    r#"CREATE TABLE IF NOT EXISTS images (
        id TEXT PRIMARY KEY,
        projectId TEXT NOT NULL,
        name TEXT NOT NULL,
        data TEXT NOT NULL,
        width INTEGER NOT NULL,
        height INTEGER NOT NULL,
        url TEXT,
        createdAt TEXT,
        updatedAt TEXT
    )"#,
    r#"CREATE TABLE IF NOT EXISTS labels (
        id TEXT PRIMARY KEY,
        name TEXT NOT NULL,
        description TEXT,
        category TEXT,
        isAIGenerated INTEGER,
        projectId TEXT,
        color TEXT NOT NULL,
        createdAt TEXT,
        updatedAt TEXT
    )"#,
    r#"CREATE TABLE IF NOT EXISTS annotations (
        id TEXT PRIMARY KEY,
        imageId TEXT NOT NULL,
        labelId TEXT,
        name TEXT NOT NULL,
        type TEXT NOT NULL,
        coordinates TEXT NOT NULL,
        color TEXT,
        isAIGenerated INTEGER,
        createdAt TEXT,
        updatedAt TEXT
    )"#,
    r#"CREATE TABLE IF NOT EXISTS settings (
        key TEXT PRIMARY KEY,
        value TEXT NOT NULL
    )"#,
    r#"CREATE TABLE IF NOT EXISTS history (
        id TEXT PRIMARY KEY,
        labels TEXT NOT NULL,
        historyIndex INTEGER NOT NULL,
        canUndo INTEGER NOT NULL,
        canRedo INTEGER NOT NULL
    )"#,
    r#"CREATE TABLE IF NOT EXISTS ai_models (
        id TEXT PRIMARY KEY,
        name TEXT NOT NULL,
        description TEXT,
        version TEXT,
        createdAt TEXT,
        updatedAt TEXT,
        modelPath TEXT,
        configPath TEXT,
        modelSize INTEGER,
        isCustom INTEGER
    )"#,
];

/// A single statement and its positional parameters.
#[derive(Debug, Clone, Deserialize)]
pub struct Statement(pub String, #[serde(default)] pub Vec<Value>);

#[derive(Clone)]
pub struct SqliteDatabase {
    pool: SqlitePool,
}

impl SqliteDatabase {
    pub async fn connect(cfg: DatabaseConfig) -> StorageResult<Self> {
        info!("connecting to sqlite database @ {}", &cfg.connection_uri);

        let pool = SqlitePoolOptions::new()
            .max_connections(cfg.pool_size)
            .connect(&cfg.connection_uri)
            .await
            .map_err(|e| StorageError::configuration(format!("cannot open database: {}", e)))?;

        let db = Self { pool };
        db.ensure_tables().await?;
        Ok(db)
    }

    /// A private in-memory database, one connection so every query
    /// sees the same data.
    pub async fn in_memory() -> StorageResult<Self> {
        Self::connect(DatabaseConfig {
            connection_uri: "sqlite::memory:".to_string(),
            pool_size: 1,
        })
        .await
    }

    pub async fn ensure_tables(&self) -> StorageResult<()> {
        for qry in SCHEMA {
            sqlx::query(qry)
                .execute(&self.pool)
                .await
                .map_err(|e| StorageError::configuration(e.to_string()))?;
        }

        debug!("ensured {} tables exist", SCHEMA.len());
        Ok(())
    }

    #[instrument(skip(self, params), level = "debug")]
    pub async fn get(&self, sql: &str, params: Vec<Value>) -> StorageResult<Value> {
        let row = bind_params(sqlx::query(sql), params)
            .fetch_optional(&self.pool)
            .await
            .map_err(StorageError::transport)?;

        match row {
            Some(row) => row_to_json(&row),
            None => Ok(Value::Null),
        }
    }

    #[instrument(skip(self, params), level = "debug")]
    pub async fn all(&self, sql: &str, params: Vec<Value>) -> StorageResult<Value> {
        let rows = bind_params(sqlx::query(sql), params)
            .fetch_all(&self.pool)
            .await
            .map_err(StorageError::transport)?;

        rows.iter()
            .map(row_to_json)
            .collect::<StorageResult<Vec<Value>>>()
            .map(Value::Array)
    }

    #[instrument(skip(self, params), level = "debug")]
    pub async fn run(&self, sql: &str, params: Vec<Value>) -> StorageResult<u64> {
        let result = bind_params(sqlx::query(sql), params)
            .execute(&self.pool)
            .await
            .map_err(StorageError::write)?;

        Ok(result.rows_affected())
    }

    /// Runs every statement inside one transaction, either all of them
    /// apply or none do.
    pub async fn batch(&self, statements: Vec<Statement>) -> StorageResult<u64> {
        let mut tx = self.pool.begin().await.map_err(StorageError::write)?;

        let mut changes = 0;
        for Statement(sql, params) in statements {
            debug!("executing batched statement {}", &sql);
            let result = bind_params(sqlx::query(&sql), params)
                .execute(&mut *tx)
                .await
                .map_err(StorageError::write)?;
            changes += result.rows_affected();
        }

        tx.commit().await.map_err(StorageError::write)?;
        Ok(changes)
    }
}

fn bind_params<'q>(
    mut qry: Query<'q, Sqlite, SqliteArguments<'q>>,
    params: Vec<Value>,
) -> Query<'q, Sqlite, SqliteArguments<'q>> {
    for value in params {
        qry = match value {
            Value::Null => qry.bind(Option::<String>::None),
            Value::Bool(v) => qry.bind(v),
            Value::Number(n) => match n.as_i64() {
                Some(v) => qry.bind(v),
                None => qry.bind(n.as_f64().unwrap_or_default()),
            },
            Value::String(v) => qry.bind(v),
            other => qry.bind(other.to_string()),
        };
    }

    qry
}

fn row_to_json(row: &SqliteRow) -> StorageResult<Value> {
    let mut out = Map::with_capacity(row.columns().len());

    for column in row.columns() {
        let idx = column.ordinal();
        let raw = row.try_get_raw(idx).map_err(StorageError::transport)?;

        let value = if raw.is_null() {
            Value::Null
        } else {
            let kind = raw.type_info().name().to_string();
            match kind.as_str() {
                "INTEGER" | "BOOLEAN" => {
                    Value::from(row.try_get::<i64, _>(idx).map_err(StorageError::transport)?)
                }
                "REAL" => Value::from(row.try_get::<f64, _>(idx).map_err(StorageError::transport)?),
                "BLOB" => {
                    let data: Vec<u8> = row.try_get(idx).map_err(StorageError::transport)?;
                    Value::String(base64::encode(data))
                }
                _ => Value::String(row.try_get::<String, _>(idx).map_err(StorageError::transport)?),
            }
        };

        out.insert(column.name().to_string(), value);
    }

    Ok(Value::Object(out))
}
