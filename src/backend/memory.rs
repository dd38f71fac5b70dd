//! In-memory backend
//!
//! Keeps every collection as a vector of rows. Besides embedding, it records
//! how often each collection was read and can be told to fail, which is what
//! the cache tests lean on.

use std::sync::Mutex;

use async_trait::async_trait;
use dashmap::DashMap;
use serde_json::Value;
use uuid::Uuid;

use super::{merge_row, sort_rows, Collection, DataAccess, Filter, Query, Row, WriteOp};
use crate::error::RepoError;
use crate::quest::User;

pub struct MemoryBackend {
    tables: DashMap<Collection, Vec<Row>>,
    fetch_counts: DashMap<Collection, usize>,
    read_failures: DashMap<Collection, RepoError>,
    write_failures: DashMap<Collection, RepoError>,
    user: Mutex<Result<Option<User>, RepoError>>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self {
            tables: DashMap::new(),
            fetch_counts: DashMap::new(),
            read_failures: DashMap::new(),
            write_failures: DashMap::new(),
            user: Mutex::new(Ok(None)),
        }
    }

    /// Append rows to a collection; non-object values are ignored
    pub fn seed(&self, collection: Collection, rows: Vec<Value>) {
        let mut table = self.tables.entry(collection).or_default();
        table.extend(rows.into_iter().filter_map(|value| match value {
            Value::Object(row) => Some(row),
            _ => None,
        }));
    }

    /// All rows currently stored, in insertion order
    pub fn rows(&self, collection: Collection) -> Vec<Row> {
        self.tables
            .get(&collection)
            .map(|table| table.clone())
            .unwrap_or_default()
    }

    pub fn sign_in(&self, user: User) {
        *self.user.lock().unwrap_or_else(|e| e.into_inner()) = Ok(Some(user));
    }

    pub fn sign_out(&self) {
        *self.user.lock().unwrap_or_else(|e| e.into_inner()) = Ok(None);
    }

    /// Make the identity lookup itself fail
    pub fn fail_identity(&self, error: RepoError) {
        *self.user.lock().unwrap_or_else(|e| e.into_inner()) = Err(error);
    }

    /// Make every read of `collection` fail until cleared
    pub fn fail_reads(&self, collection: Collection, error: RepoError) {
        self.read_failures.insert(collection, error);
    }

    /// Make every write to `collection` fail until cleared
    pub fn fail_writes(&self, collection: Collection, error: RepoError) {
        self.write_failures.insert(collection, error);
    }

    pub fn clear_failures(&self) {
        self.read_failures.clear();
        self.write_failures.clear();
    }

    /// Number of reads issued against `collection`
    pub fn fetch_count(&self, collection: Collection) -> usize {
        self.fetch_counts.get(&collection).map(|c| *c).unwrap_or(0)
    }

    fn matching(table: &[Row], filters: &[Filter]) -> Vec<usize> {
        table
            .iter()
            .enumerate()
            .filter(|(_, row)| filters.iter().all(|f| f.matches(row)))
            .map(|(i, _)| i)
            .collect()
    }
}

impl Default for MemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl DataAccess for MemoryBackend {
    async fn current_user(&self) -> Result<Option<User>, RepoError> {
        tokio::task::yield_now().await;
        self.user.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    async fn fetch(&self, query: &Query) -> Result<Vec<Row>, RepoError> {
        *self.fetch_counts.entry(query.collection).or_insert(0) += 1;

        // Suspend like a real request so concurrent callers interleave
        tokio::task::yield_now().await;

        if let Some(error) = self.read_failures.get(&query.collection) {
            return Err(error.clone());
        }

        let mut rows: Vec<Row> = self
            .tables
            .get(&query.collection)
            .map(|table| {
                table
                    .iter()
                    .filter(|row| query.filters.iter().all(|f| f.matches(row)))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default();

        if let Some(ref order) = query.order {
            sort_rows(&mut rows, order);
        }

        Ok(rows)
    }

    async fn write(&self, collection: Collection, op: WriteOp) -> Result<Vec<Row>, RepoError> {
        tokio::task::yield_now().await;

        if let Some(error) = self.write_failures.get(&collection) {
            return Err(error.clone());
        }

        let key_field = collection.key_field();
        let mut table = self.tables.entry(collection).or_default();

        match op {
            WriteOp::Insert(mut row) => {
                if !row.contains_key(key_field) {
                    row.insert(key_field.to_string(), Value::String(Uuid::new_v4().to_string()));
                }
                let key = &row[key_field];
                if table.iter().any(|existing| existing.get(key_field) == Some(key)) {
                    return Err(RepoError::Database(format!(
                        "duplicate key {} in {}",
                        key,
                        collection.as_str()
                    )));
                }
                table.push(row.clone());
                Ok(vec![row])
            }
            WriteOp::Update { filters, patch } => {
                let mut updated = Vec::new();
                for i in Self::matching(&table, &filters) {
                    merge_row(&mut table[i], &patch);
                    updated.push(table[i].clone());
                }
                Ok(updated)
            }
            WriteOp::Upsert { mut row, on_conflict } => {
                let conflict: Vec<Filter> = on_conflict
                    .iter()
                    .map(|field| Filter::eq(field, row.get(field).cloned().unwrap_or(Value::Null)))
                    .collect();

                if let Some(&i) = Self::matching(&table, &conflict).first() {
                    merge_row(&mut table[i], &row);
                    return Ok(vec![table[i].clone()]);
                }

                if !row.contains_key(key_field) {
                    row.insert(key_field.to_string(), Value::String(Uuid::new_v4().to_string()));
                }
                table.push(row.clone());
                Ok(vec![row])
            }
            WriteOp::Delete { filters } => {
                let mut removed = Vec::new();
                table.retain(|row| {
                    if filters.iter().all(|f| f.matches(row)) {
                        removed.push(row.clone());
                        false
                    } else {
                        true
                    }
                });
                Ok(removed)
            }
        }
    }
}
