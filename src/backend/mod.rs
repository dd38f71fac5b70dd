//! Data-access port
//!
//! The hosted backend is consumed as a generic tabular store: filtered and
//! ordered reads on named collections, plus insert/update/upsert/delete and an
//! authenticated-identity accessor. Nothing above this module knows about SQL.

use std::cmp::Ordering;
use std::str::FromStr;

use async_trait::async_trait;
use serde_json::{Map, Value};

use crate::error::RepoError;
use crate::quest::User;

pub mod memory;
pub mod sqlite;

pub use memory::MemoryBackend;
pub use sqlite::SqliteBackend;

/// A row as returned by the backend, before typed decoding
pub type Row = Map<String, Value>;

/// Named collections the quest core reads and writes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Collection {
    Quests,
    Regions,
    Categories,
    Claims,
    UnlockedCategories,
    SecretUnlockConfigs,
    Characters,
    Users,
    HeroicFeats,
}

impl Collection {
    pub const ALL: [Collection; 9] = [
        Collection::Quests,
        Collection::Regions,
        Collection::Categories,
        Collection::Claims,
        Collection::UnlockedCategories,
        Collection::SecretUnlockConfigs,
        Collection::Characters,
        Collection::Users,
        Collection::HeroicFeats,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Collection::Quests => "quests",
            Collection::Regions => "regions",
            Collection::Categories => "categories",
            Collection::Claims => "claims",
            Collection::UnlockedCategories => "unlocked_categories",
            Collection::SecretUnlockConfigs => "secret_unlock_configs",
            Collection::Characters => "characters",
            Collection::Users => "users",
            Collection::HeroicFeats => "heroic_feats",
        }
    }


    /// Field holding the row's primary key
    pub fn key_field(&self) -> &'static str {
        match self {
            Collection::Characters => "character_id",
            Collection::Categories => "name",
            _ => "id",
        }
    }
}

impl FromStr for Collection {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|c| c.as_str() == s)
            .ok_or_else(|| format!("unknown collection: {}", s))
    }
}

/// Equality filter on a single field
#[derive(Debug, Clone, PartialEq)]
pub struct Filter {
    pub field: String,
    pub value: Value,
}

impl Filter {
    pub fn eq(field: &str, value: impl Into<Value>) -> Self {
        Self {
            field: field.to_string(),
            value: value.into(),
        }
    }

    pub fn matches(&self, row: &Row) -> bool {
        let actual = row.get(&self.field).unwrap_or(&Value::Null);
        values_equal(actual, &self.value)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Order {
    pub field: String,
    pub ascending: bool,
}

/// A read against one collection
#[derive(Debug, Clone, PartialEq)]
pub struct Query {
    pub collection: Collection,
    pub filters: Vec<Filter>,
    pub order: Option<Order>,
}

impl Query {
    pub fn new(collection: Collection) -> Self {
        Self {
            collection,
            filters: Vec::new(),
            order: None,
        }
    }

    pub fn eq(mut self, field: &str, value: impl Into<Value>) -> Self {
        self.filters.push(Filter::eq(field, value));
        self
    }

    pub fn order_by(mut self, field: &str, ascending: bool) -> Self {
        self.order = Some(Order {
            field: field.to_string(),
            ascending,
        });
        self
    }
}

/// A write against one collection
#[derive(Debug, Clone, PartialEq)]
pub enum WriteOp {
    Insert(Row),
    /// Merge `patch` into every row matching `filters`
    Update { filters: Vec<Filter>, patch: Row },
    /// Insert, or merge into the row whose `on_conflict` fields all match
    Upsert { row: Row, on_conflict: Vec<String> },
    Delete { filters: Vec<Filter> },
}

/// The remote data-access collaborator
#[async_trait]
pub trait DataAccess: Send + Sync {
    /// Currently authenticated user
    ///
    /// `Ok(None)` means nobody is signed in. Implementations may also report a
    /// missing session as `RepoError::Unauthorized`; callers treat both alike.
    async fn current_user(&self) -> Result<Option<User>, RepoError>;

    async fn fetch(&self, query: &Query) -> Result<Vec<Row>, RepoError>;

    /// Apply `op` and return the affected rows as stored
    async fn write(&self, collection: Collection, op: WriteOp) -> Result<Vec<Row>, RepoError>;
}

/// Compare JSON values the way the backend compares column values
///
/// Numbers compare numerically so `1` and `1.0` are equal.
pub fn values_equal(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => x.as_f64() == y.as_f64(),
        _ => a == b,
    }
}

/// Total order used for `Order` clauses: nulls first, then booleans, numbers,
/// strings; arrays and objects compare by their JSON text
pub fn compare_values(a: &Value, b: &Value) -> Ordering {
    fn rank(v: &Value) -> u8 {
        match v {
            Value::Null => 0,
            Value::Bool(_) => 1,
            Value::Number(_) => 2,
            Value::String(_) => 3,
            Value::Array(_) | Value::Object(_) => 4,
        }
    }

    match (a, b) {
        (Value::Bool(x), Value::Bool(y)) => x.cmp(y),
        (Value::Number(x), Value::Number(y)) => x
            .as_f64()
            .unwrap_or(0.0)
            .partial_cmp(&y.as_f64().unwrap_or(0.0))
            .unwrap_or(Ordering::Equal),
        (Value::String(x), Value::String(y)) => x.cmp(y),
        (Value::Null, Value::Null) => Ordering::Equal,
        _ if rank(a) == rank(b) => a.to_string().cmp(&b.to_string()),
        _ => rank(a).cmp(&rank(b)),
    }
}

/// Stable sort of rows by an `Order` clause
pub fn sort_rows(rows: &mut [Row], order: &Order) {
    rows.sort_by(|a, b| {
        let left = a.get(&order.field).unwrap_or(&Value::Null);
        let right = b.get(&order.field).unwrap_or(&Value::Null);
        let ordering = compare_values(left, right);
        if order.ascending {
            ordering
        } else {
            ordering.reverse()
        }
    });
}

/// Merge `patch` into `row`, overwriting existing fields
pub fn merge_row(row: &mut Row, patch: &Row) {
    for (key, value) in patch {
        row.insert(key.clone(), value.clone());
    }
}
