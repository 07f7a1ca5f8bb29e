use std::path::Path;
use std::sync::{Arc, PoisonError};

use async_trait::async_trait;
use rusqlite::{Connection, ErrorCode};
use rusqlite::types::ValueRef;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::{debug, warn};

use crate::error::SQLError;
use crate::traits::{Row, SQLStore, Value};

/// Pragmas applied to every connection the engine opens.
///
/// `case_sensitive_like` keeps `like` distinct from `ilike`.
const CONNECTION_PRAGMAS: &str = "PRAGMA foreign_keys=ON; PRAGMA case_sensitive_like=ON;";

/// SqliteStore is a SQLStore implementation backed by rusqlite (bundled SQLite).
///
/// Statements are serialized on a single connection. A transaction checks the
/// connection out and holds it until released.
pub struct SqliteStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteStore {
    /// Open or create a SQLite database at the given path.
    pub fn open(path: &Path) -> Result<Self, SQLError> {
        let conn = Connection::open(path).map_err(|e| SQLError::Connection(e.to_string()))?;

        // Enable WAL mode for better concurrent read performance.
        conn.execute_batch("PRAGMA journal_mode=WAL;")
            .map_err(|e| SQLError::Connection(e.to_string()))?;
        conn.execute_batch(CONNECTION_PRAGMAS)
            .map_err(|e| SQLError::Connection(e.to_string()))?;

        debug!("opened sqlite database at {}", path.display());
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Create an in-memory SQLite database (useful for tests).
    pub fn open_in_memory() -> Result<Self, SQLError> {
        let conn =
            Connection::open_in_memory().map_err(|e| SQLError::Connection(e.to_string()))?;
        conn.execute_batch(CONNECTION_PRAGMAS)
            .map_err(|e| SQLError::Connection(e.to_string()))?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }
}

#[async_trait]
impl SQLStore for SqliteStore {
    async fn query(&self, sql: &str, params: &[Value]) -> Result<Vec<Row>, SQLError> {
        let conn = self.conn.lock().await;
        run_query(&conn, sql, params)
    }

    async fn exec(&self, sql: &str, params: &[Value]) -> Result<u64, SQLError> {
        let conn = self.conn.lock().await;
        run_exec(&conn, sql, params)
    }

    async fn checkout(&self) -> Result<Arc<dyn SQLStore>, SQLError> {
        let guard = Arc::clone(&self.conn).lock_owned().await;
        debug!("connection checked out");
        Ok(Arc::new(SqliteConnection {
            conn: std::sync::Mutex::new(Some(guard)),
        }))
    }
}

/// A connection checked out of a [`SqliteStore`].
///
/// Every other caller of the store waits until this handle is released.
/// Releasing rolls back a transaction left open, and any use after release
/// fails with [`SQLError::Released`].
pub struct SqliteConnection {
    conn: std::sync::Mutex<Option<OwnedMutexGuard<Connection>>>,
}

impl SqliteConnection {
    fn with_conn<T>(
        &self,
        f: impl FnOnce(&Connection) -> Result<T, SQLError>,
    ) -> Result<T, SQLError> {
        let slot = self.conn.lock().unwrap_or_else(PoisonError::into_inner);
        match slot.as_ref() {
            Some(conn) => f(conn),
            None => Err(SQLError::Released),
        }
    }
}

#[async_trait]
impl SQLStore for SqliteConnection {
    async fn query(&self, sql: &str, params: &[Value]) -> Result<Vec<Row>, SQLError> {
        self.with_conn(|conn| run_query(conn, sql, params))
    }

    async fn exec(&self, sql: &str, params: &[Value]) -> Result<u64, SQLError> {
        self.with_conn(|conn| run_exec(conn, sql, params))
    }

    async fn checkout(&self) -> Result<Arc<dyn SQLStore>, SQLError> {
        Err(SQLError::Connection(
            "connection is already checked out".into(),
        ))
    }

    fn release(&self) {
        let mut slot = self.conn.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(conn) = slot.take() {
            if !conn.is_autocommit() {
                warn!("connection released inside an open transaction, rolling back");
                if let Err(e) = conn.execute_batch("ROLLBACK") {
                    warn!("rollback on release failed: {}", e);
                }
            }
            debug!("connection released");
        }
    }
}

impl Drop for SqliteConnection {
    fn drop(&mut self) {
        self.release();
    }
}

/// Convert our Value enum to rusqlite's ToSql.
fn bind_params(params: &[Value]) -> Vec<Box<dyn rusqlite::types::ToSql + '_>> {
    params
        .iter()
        .map(|v| -> Box<dyn rusqlite::types::ToSql + '_> {
            match v {
                Value::Null => Box::new(rusqlite::types::Null),
                Value::Integer(i) => Box::new(*i),
                Value::Real(f) => Box::new(*f),
                Value::Text(s) => Box::new(s.as_str()),
                Value::Blob(b) => Box::new(b.as_slice()),
            }
        })
        .collect()
}

fn run_query(conn: &Connection, sql: &str, params: &[Value]) -> Result<Vec<Row>, SQLError> {
    debug!(sql, params = params.len(), "query");
    let bound = bind_params(params);
    let param_refs: Vec<&dyn rusqlite::types::ToSql> = bound.iter().map(|b| b.as_ref()).collect();

    let mut stmt = conn
        .prepare(sql)
        .map_err(|e| SQLError::Query(e.to_string()))?;

    let column_names: Vec<String> = stmt
        .column_names()
        .iter()
        .map(|s| s.to_string())
        .collect();

    let mut rows = stmt
        .query(param_refs.as_slice())
        .map_err(query_error)?;

    let mut result = Vec::new();
    while let Some(row) = rows.next().map_err(query_error)? {
        let mut columns = Vec::with_capacity(column_names.len());
        for (i, name) in column_names.iter().enumerate() {
            let val = row
                .get_ref(i)
                .map(row_value)
                .map_err(|e| SQLError::Query(e.to_string()))?;
            columns.push((name.clone(), val));
        }
        result.push(Row { columns });
    }
    Ok(result)
}

fn run_exec(conn: &Connection, sql: &str, params: &[Value]) -> Result<u64, SQLError> {
    debug!(sql, params = params.len(), "exec");
    let bound = bind_params(params);
    let param_refs: Vec<&dyn rusqlite::types::ToSql> = bound.iter().map(|b| b.as_ref()).collect();

    let affected = conn
        .execute(sql, param_refs.as_slice())
        .map_err(|e| match e.sqlite_error_code() {
            Some(ErrorCode::ConstraintViolation) => SQLError::Constraint(e.to_string()),
            _ => SQLError::Execution(e.to_string()),
        })?;

    Ok(affected as u64)
}

/// Errors raised while stepping a statement. `INSERT .. RETURNING` fails here.
fn query_error(e: rusqlite::Error) -> SQLError {
    match e.sqlite_error_code() {
        Some(ErrorCode::ConstraintViolation) => SQLError::Constraint(e.to_string()),
        _ => SQLError::Query(e.to_string()),
    }
}

/// Extract a Value from a borrowed SQLite column value.
fn row_value(value: ValueRef<'_>) -> Value {
    match value {
        ValueRef::Null => Value::Null,
        ValueRef::Integer(i) => Value::Integer(i),
        ValueRef::Real(f) => Value::Real(f),
        ValueRef::Text(t) => Value::Text(String::from_utf8_lossy(t).into_owned()),
        ValueRef::Blob(b) => Value::Blob(b.to_vec()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn store_with_table() -> SqliteStore {
        let store = SqliteStore::open_in_memory().unwrap();
        store
            .exec(
                "CREATE TABLE items (id INTEGER PRIMARY KEY AUTOINCREMENT, name TEXT, qty REAL)",
                &[],
            )
            .await
            .unwrap();
        store
    }

    #[tokio::test]
    async fn insert_returning_and_query() {
        let store = store_with_table().await;
        let rows = store
            .query(
                "INSERT INTO items (name, qty) VALUES (?1, ?2) RETURNING *",
                &[Value::from("bolt"), Value::Real(2.5)],
            )
            .await
            .unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].get_i64("id"), Some(1));
        assert_eq!(rows[0].get_str("name"), Some("bolt"));
        assert_eq!(rows[0].get_f64("qty"), Some(2.5));

        let affected = store
            .exec("DELETE FROM items WHERE id = ?1", &[Value::Integer(1)])
            .await
            .unwrap();
        assert_eq!(affected, 1);
    }

    #[tokio::test]
    async fn like_is_case_sensitive() {
        let store = store_with_table().await;
        store
            .exec("INSERT INTO items (name) VALUES ('Bolt')", &[])
            .await
            .unwrap();
        let rows = store
            .query("SELECT * FROM items WHERE name LIKE ?1", &[Value::from("bolt")])
            .await
            .unwrap();
        assert!(rows.is_empty());
    }

    #[tokio::test]
    async fn checkout_release_rolls_back_open_transaction() {
        let store = store_with_table().await;
        let conn = store.checkout().await.unwrap();
        conn.exec("BEGIN", &[]).await.unwrap();
        conn.exec("INSERT INTO items (name) VALUES ('nut')", &[])
            .await
            .unwrap();
        conn.release();

        assert!(conn.query("SELECT 1", &[]).await.is_err());
        let rows = store.query("SELECT * FROM items", &[]).await.unwrap();
        assert!(rows.is_empty());
    }

    #[tokio::test]
    async fn nested_checkout_is_refused() {
        let store = store_with_table().await;
        let conn = store.checkout().await.unwrap();
        assert!(conn.checkout().await.is_err());
    }

    #[tokio::test]
    async fn constraint_violations_are_classified() {
        let store = SqliteStore::open_in_memory().unwrap();
        store
            .exec("CREATE TABLE codes (code TEXT NOT NULL UNIQUE)", &[])
            .await
            .unwrap();
        store.exec("INSERT INTO codes VALUES ('a')", &[]).await.unwrap();

        let err = store.exec("INSERT INTO codes VALUES ('a')", &[]).await.unwrap_err();
        assert!(err.is_constraint());
        let err = store
            .query("INSERT INTO codes VALUES (NULL) RETURNING *", &[])
            .await
            .unwrap_err();
        assert!(err.is_constraint());
        let err = store.query("SELECT * FROM missing", &[]).await.unwrap_err();
        assert!(matches!(err, SQLError::Query(_)));
    }

    #[tokio::test]
    async fn file_backed_store() {
        let dir = tempfile::tempdir().unwrap();
        let store = SqliteStore::open(&dir.path().join("test.db")).unwrap();
        store
            .exec("CREATE TABLE t (id INTEGER PRIMARY KEY)", &[])
            .await
            .unwrap();
        store.exec("INSERT INTO t (id) VALUES (7)", &[]).await.unwrap();
        let rows = store.query("SELECT id FROM t", &[]).await.unwrap();
        assert_eq!(rows[0].get_i64("id"), Some(7));
    }
}
