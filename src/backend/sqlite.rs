use std::sync::RwLock;

use argon2::{
    password_hash::{rand_core::OsRng, PasswordHash, PasswordHasher, PasswordVerifier, SaltString},
    Argon2,
};
use async_trait::async_trait;
use serde_json::Value;
use sqlx::sqlite::{SqliteArguments, SqliteConnection, SqlitePool, SqlitePoolOptions};
use sqlx::{Row as _, Sqlite};
use uuid::Uuid;

use super::{merge_row, Collection, DataAccess, Filter, Order, Query, Row, WriteOp};
use crate::error::RepoError;
use crate::quest::User;

type SqliteQuery<'q> = sqlx::query::Query<'q, Sqlite, SqliteArguments<'q>>;

/// SQLite-backed document store standing in for the hosted backend
///
/// Every collection lives in one `records` table as JSON bodies keyed by
/// (collection, id); filters and ordering go through `json_extract`.
pub struct SqliteBackend {
    pool: SqlitePool,
    user: RwLock<Option<User>>,
}

impl SqliteBackend {
    pub async fn new(database_url: &str) -> Result<Self, RepoError> {
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect(database_url)
            .await?;

        // Run migrations
        Self::migrate(&pool).await?;

        Ok(Self {
            pool,
            user: RwLock::new(None),
        })
    }

    async fn migrate(pool: &SqlitePool) -> Result<(), sqlx::Error> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS records (
                collection TEXT NOT NULL,
                id TEXT NOT NULL,
                body TEXT NOT NULL,
                created_at DATETIME DEFAULT CURRENT_TIMESTAMP,
                PRIMARY KEY(collection, id)
            )
            "#,
        )
        .execute(pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS auth_users (
                id TEXT PRIMARY KEY,
                email TEXT UNIQUE NOT NULL,
                password_hash TEXT NOT NULL,
                created_at DATETIME DEFAULT CURRENT_TIMESTAMP,
                last_login DATETIME
            )
            "#,
        )
        .execute(pool)
        .await?;

        tracing::info!("Database migrations complete");
        Ok(())
    }

    /// Create an account with a hashed password and its `users` profile row
    pub async fn register(&self, email: &str, password: &str) -> Result<User, RepoError> {
        // Hash the password with Argon2
        let salt = SaltString::generate(&mut OsRng);
        let password_hash = Argon2::default()
            .hash_password(password.as_bytes(), &salt)
            .map_err(|e| RepoError::Database(format!("Failed to hash password: {}", e)))?
            .to_string();

        let id = Uuid::new_v4().to_string();
        sqlx::query("INSERT INTO auth_users (id, email, password_hash) VALUES (?, ?, ?)")
            .bind(&id)
            .bind(email)
            .bind(&password_hash)
            .execute(&self.pool)
            .await
            .map_err(|e| {
                if e.to_string().contains("UNIQUE constraint failed") {
                    RepoError::Database("Email already registered".to_string())
                } else {
                    RepoError::from(e)
                }
            })?;

        let mut profile = Row::new();
        profile.insert("id".to_string(), Value::String(id.clone()));
        profile.insert("email".to_string(), Value::String(email.to_string()));
        self.write(Collection::Users, WriteOp::Insert(profile)).await?;

        tracing::info!("Registered user: {} (id: {})", email, id);
        Ok(User {
            id,
            email: Some(email.to_string()),
        })
    }

    /// Verify credentials and make the user the current identity
    pub async fn sign_in(&self, email: &str, password: &str) -> Result<User, RepoError> {
        let row = sqlx::query("SELECT id, password_hash FROM auth_users WHERE email = ?")
            .bind(email)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| RepoError::Unauthorized("Invalid login credentials".to_string()))?;

        let id: String = row.try_get("id")?;
        let stored: String = row.try_get("password_hash")?;

        let parsed = PasswordHash::new(&stored)
            .map_err(|e| RepoError::Database(format!("Corrupt password hash: {}", e)))?;
        if Argon2::default()
            .verify_password(password.as_bytes(), &parsed)
            .is_err()
        {
            return Err(RepoError::Unauthorized("Invalid login credentials".to_string()));
        }

        sqlx::query("UPDATE auth_users SET last_login = CURRENT_TIMESTAMP WHERE id = ?")
            .bind(&id)
            .execute(&self.pool)
            .await?;

        let user = User {
            id,
            email: Some(email.to_string()),
        };
        *self.user.write().unwrap_or_else(|e| e.into_inner()) = Some(user.clone());
        tracing::info!("Signed in: {}", email);
        Ok(user)
    }

    /// Re-establish a previously signed-in user; unknown ids leave nobody signed in
    pub async fn restore_session(&self, user_id: &str) -> Result<Option<User>, RepoError> {
        let row = sqlx::query("SELECT id, email FROM auth_users WHERE id = ?")
            .bind(user_id)
            .fetch_optional(&self.pool)
            .await?;

        let user = match row {
            Some(row) => Some(User {
                id: row.try_get("id")?,
                email: row.try_get("email")?,
            }),
            None => None,
        };

        *self.user.write().unwrap_or_else(|e| e.into_inner()) = user.clone();
        Ok(user)
    }

    pub fn sign_out(&self) {
        *self.user.write().unwrap_or_else(|e| e.into_inner()) = None;
    }

    async fn select_rows(
        conn: &mut SqliteConnection,
        collection: Collection,
        filters: &[Filter],
        order: Option<&Order>,
    ) -> Result<Vec<(String, Row)>, RepoError> {
        let mut sql = String::from("SELECT id, body FROM records WHERE collection = ?");
        for filter in filters {
            if filter.value.is_null() {
                sql.push_str(" AND json_extract(body, ?) IS NULL");
            } else {
                sql.push_str(" AND json_extract(body, ?) = ?");
            }
        }
        match order {
            Some(order) if order.ascending => sql.push_str(" ORDER BY json_extract(body, ?) ASC, rowid"),
            Some(_) => sql.push_str(" ORDER BY json_extract(body, ?) DESC, rowid"),
            None => sql.push_str(" ORDER BY rowid"),
        }

        let mut query = sqlx::query(&sql).bind(collection.as_str());
        for filter in filters {
            query = query.bind(json_path(&filter.field));
            if !filter.value.is_null() {
                query = bind_value(query, &filter.value);
            }
        }
        if let Some(order) = order {
            query = query.bind(json_path(&order.field));
        }

        let rows = query.fetch_all(&mut *conn).await?;
        rows.iter()
            .map(|r| {
                let id: String = r.try_get("id")?;
                let body: String = r.try_get("body")?;
                let row: Row = serde_json::from_str(&body)?;
                Ok((id, row))
            })
            .collect()
    }

    async fn insert_row(
        conn: &mut SqliteConnection,
        collection: Collection,
        mut row: Row,
    ) -> Result<Row, RepoError> {
        let key_field = collection.key_field();
        let id = match row.get(key_field) {
            Some(Value::String(s)) => s.clone(),
            Some(Value::Null) | None => {
                let id = Uuid::new_v4().to_string();
                row.insert(key_field.to_string(), Value::String(id.clone()));
                id
            }
            Some(other) => other.to_string(),
        };

        sqlx::query("INSERT INTO records (collection, id, body) VALUES (?, ?, ?)")
            .bind(collection.as_str())
            .bind(&id)
            .bind(serde_json::to_string(&row)?)
            .execute(&mut *conn)
            .await
            .map_err(|e| {
                if e.to_string().contains("UNIQUE constraint failed") {
                    RepoError::Database(format!("duplicate key {} in {}", id, collection.as_str()))
                } else {
                    RepoError::from(e)
                }
            })?;

        Ok(row)
    }

    async fn replace_body(
        conn: &mut SqliteConnection,
        collection: Collection,
        id: &str,
        row: &Row,
    ) -> Result<(), RepoError> {
        sqlx::query("UPDATE records SET body = ? WHERE collection = ? AND id = ?")
            .bind(serde_json::to_string(row)?)
            .bind(collection.as_str())
            .bind(id)
            .execute(&mut *conn)
            .await?;
        Ok(())
    }
}

fn json_path(field: &str) -> String {
    format!("$.\"{}\"", field.replace('"', ""))
}

fn bind_value<'q>(query: SqliteQuery<'q>, value: &Value) -> SqliteQuery<'q> {
    match value {
        Value::Bool(b) => query.bind(*b as i64),
        Value::Number(n) => match n.as_i64() {
            Some(i) => query.bind(i),
            None => query.bind(n.as_f64().unwrap_or(0.0)),
        },
        Value::String(s) => query.bind(s.clone()),
        other => query.bind(other.to_string()),
    }
}

#[async_trait]
impl DataAccess for SqliteBackend {
    async fn current_user(&self) -> Result<Option<User>, RepoError> {
        Ok(self.user.read().unwrap_or_else(|e| e.into_inner()).clone())
    }

    async fn fetch(&self, query: &Query) -> Result<Vec<Row>, RepoError> {
        let mut conn = self.pool.acquire().await?;
        let rows = Self::select_rows(
            &mut conn,
            query.collection,
            &query.filters,
            query.order.as_ref(),
        )
        .await?;
        Ok(rows.into_iter().map(|(_, row)| row).collect())
    }

    async fn write(&self, collection: Collection, op: WriteOp) -> Result<Vec<Row>, RepoError> {
        let mut tx = self.pool.begin().await?;

        let affected = match op {
            WriteOp::Insert(row) => vec![Self::insert_row(&mut tx, collection, row).await?],
            WriteOp::Update { filters, patch } => {
                let mut updated = Vec::new();
                for (id, mut row) in Self::select_rows(&mut tx, collection, &filters, None).await? {
                    merge_row(&mut row, &patch);
                    Self::replace_body(&mut tx, collection, &id, &row).await?;
                    updated.push(row);
                }
                updated
            }
            WriteOp::Upsert { row, on_conflict } => {
                let conflict: Vec<Filter> = on_conflict
                    .iter()
                    .map(|field| Filter::eq(field, row.get(field).cloned().unwrap_or(Value::Null)))
                    .collect();

                let existing = Self::select_rows(&mut tx, collection, &conflict, None).await?;
                match existing.into_iter().next() {
                    Some((id, mut stored)) => {
                        merge_row(&mut stored, &row);
                        Self::replace_body(&mut tx, collection, &id, &stored).await?;
                        vec![stored]
                    }
                    None => vec![Self::insert_row(&mut tx, collection, row).await?],
                }
            }
            WriteOp::Delete { filters } => {
                let doomed = Self::select_rows(&mut tx, collection, &filters, None).await?;
                for (id, _) in &doomed {
                    sqlx::query("DELETE FROM records WHERE collection = ? AND id = ?")
                        .bind(collection.as_str())
                        .bind(id)
                        .execute(&mut *tx)
                        .await?;
                }
                doomed.into_iter().map(|(_, row)| row).collect()
            }
        };

        tx.commit().await?;
        Ok(affected)
    }
}
