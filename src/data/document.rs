use std::collections::BTreeMap;
use std::ops::Bound;
use std::sync::Arc;

use async_trait::async_trait;
use hashbrown::HashMap;
use once_cell::sync::OnceCell;
use parking_lot::RwLock;
use serde_json::{Map, Value};

use super::records::{Direction, RecordDataAccess, RecordStore, Table, WriteOp};
use super::Filter;
use crate::error::{StorageError, StorageResult};

static SHARED: OnceCell<Arc<DocumentDb>> = OnceCell::new();

type Collection = BTreeMap<String, Map<String, Value>>;

/// The in-process document database, the stand-in for the browser's
/// IndexedDB. Collections are ordered by key.
#[derive(Default)]
pub struct DocumentDb {
    collections: RwLock<HashMap<Table, Collection>>,
}

impl DocumentDb {
    pub fn new() -> Self {
        Self::default()
    }

    /// The process wide database, created on first use.
    pub fn shared() -> Arc<Self> {
        SHARED.get_or_init(|| Arc::new(Self::new())).clone()
    }

    pub fn clear(&self) {
        self.collections.write().clear();
    }
}

/// A `RecordStore` over a `DocumentDb`.
#[derive(Clone)]
pub struct DocumentStore {
    db: Arc<DocumentDb>,
}

pub type DocumentDataAccess = RecordDataAccess<DocumentStore>;

impl DocumentStore {
    pub fn new(db: Arc<DocumentDb>) -> Self {
        Self { db }
    }
}

impl DocumentDataAccess {
    /// Data access over the process wide document database.
    pub fn shared() -> Self {
        RecordDataAccess::new(DocumentStore::new(DocumentDb::shared()))
    }
}

fn matches_filter(record: &Map<String, Value>, filter: &Filter) -> bool {
    filter
        .iter()
        .all(|(k, v)| record.get(k).unwrap_or(&Value::Null) == v)
}

fn record_key(table: Table, record: &Map<String, Value>) -> StorageResult<String> {
    match record.get(table.key_column()) {
        Some(Value::String(key)) if !key.is_empty() => Ok(key.clone()),
        _ => Err(StorageError::invalid(format!(
            "{} records need a non-empty {:?}",
            table,
            table.key_column()
        ))),
    }
}

/// Applies one op to the staged collections.
fn apply_op(staged: &mut HashMap<Table, Collection>, op: WriteOp) -> StorageResult<u64> {
    match op {
        WriteOp::Insert { table, record } => {
            let key = record_key(table, &record)?;
            let collection = staged.entry(table).or_default();
            if collection.contains_key(&key) {
                return Err(StorageError::write(format!(
                    "{} {} already exists",
                    table, key
                )));
            }
            collection.insert(key, record);
            Ok(1)
        }
        WriteOp::Upsert { table, record } => {
            let key = record_key(table, &record)?;
            staged.entry(table).or_default().insert(key, record);
            Ok(1)
        }
        WriteOp::Update { table, key, patch } => {
            let record = match staged.entry(table).or_default().get_mut(&key) {
                Some(record) => record,
                None => return Ok(0),
            };
            for (field, value) in patch {
                record.insert(field, value);
            }
            Ok(1)
        }
        WriteOp::DeleteWhere { table, filter } => {
            let collection = staged.entry(table).or_default();
            let before = collection.len();
            collection.retain(|_, record| !matches_filter(record, &filter));
            Ok((before - collection.len()) as u64)
        }
    }
}

#[async_trait]
impl RecordStore for DocumentStore {
    fn name(&self) -> &'static str {
        "document"
    }

    async fn select(&self, table: Table, filter: &Filter) -> StorageResult<Vec<Value>> {
        let collections = self.db.collections.read();
        let rows = collections
            .get(&table)
            .map(|c| {
                c.values()
                    .filter(|r| matches_filter(r, filter))
                    .cloned()
                    .map(Value::Object)
                    .collect()
            })
            .unwrap_or_default();

        Ok(rows)
    }

    async fn select_page(
        &self,
        table: Table,
        filter: &Filter,
        offset: usize,
        limit: usize,
    ) -> StorageResult<Vec<Value>> {
        let collections = self.db.collections.read();
        let rows = collections
            .get(&table)
            .map(|c| {
                c.values()
                    .filter(|r| matches_filter(r, filter))
                    .skip(offset)
                    .take(limit)
                    .cloned()
                    .map(Value::Object)
                    .collect()
            })
            .unwrap_or_default();

        Ok(rows)
    }

    async fn find(&self, table: Table, key: &str) -> StorageResult<Option<Value>> {
        let collections = self.db.collections.read();
        Ok(collections
            .get(&table)
            .and_then(|c| c.get(key))
            .cloned()
            .map(Value::Object))
    }

    async fn neighbour(
        &self,
        table: Table,
        key: &str,
        direction: Direction,
    ) -> StorageResult<Option<String>> {
        let collections = self.db.collections.read();
        let collection = match collections.get(&table) {
            Some(c) => c,
            None => return Ok(None),
        };

        let bounds = (Bound::Excluded(key), Bound::Unbounded);
        let found = match direction {
            Direction::Next => collection.range::<str, _>(bounds).next(),
            Direction::Previous => collection
                .range::<str, _>((Bound::Unbounded, Bound::Excluded(key)))
                .next_back(),
        };

        Ok(found.map(|(k, _)| k.clone()))
    }

    async fn apply(&self, ops: Vec<WriteOp>) -> StorageResult<u64> {
        let mut collections = self.db.collections.write();

        // Stage copies of the touched collections so a failing op leaves
        // nothing behind.
        let mut staged: HashMap<Table, Collection> = HashMap::new();
        for op in ops.iter() {
            let table = match op {
                WriteOp::Insert { table, .. }
                | WriteOp::Upsert { table, .. }
                | WriteOp::Update { table, .. }
                | WriteOp::DeleteWhere { table, .. } => *table,
            };
            staged
                .entry(table)
                .or_insert_with(|| collections.get(&table).cloned().unwrap_or_default());
        }

        let mut changes = 0;
        for op in ops {
            changes += apply_op(&mut staged, op)?;
        }

        collections.extend(staged);
        Ok(changes)
    }
}
