//! SQLite implementation of the cache store.

use chrono::{DateTime, Utc};
use color_eyre::{eyre::eyre, Result};
use rusqlite::{params, Connection, OptionalExtension};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

use super::traits::{CacheStore, CachedEntry, StoredKey};
use crate::upstream::{Headers, ProxyResponse, RequestKey};

/// SQLite-based cache store.
pub struct SqliteStore {
  conn: Mutex<Connection>,
}

impl SqliteStore {
  /// Open the store at `path`, or at the default location when `None`.
  pub fn open_at(path: Option<&Path>) -> Result<Self> {
    let path = match path {
      Some(p) => p.to_path_buf(),
      None => Self::default_path()?,
    };

    // Ensure parent directory exists
    if let Some(parent) = path.parent() {
      std::fs::create_dir_all(parent)
        .map_err(|e| eyre!("Failed to create cache directory: {}", e))?;
    }

    let conn = Connection::open(&path)
      .map_err(|e| eyre!("Failed to open cache database at {}: {}", path.display(), e))?;

    Self::with_connection(conn)
  }

  /// A throwaway database that lives as long as the store.
  pub fn open_in_memory() -> Result<Self> {
    let conn = Connection::open_in_memory()
      .map_err(|e| eyre!("Failed to open in-memory cache database: {}", e))?;
    Self::with_connection(conn)
  }

  fn with_connection(conn: Connection) -> Result<Self> {
    let storage = Self {
      conn: Mutex::new(conn),
    };
    storage.run_migrations()?;
    Ok(storage)
  }

  /// Get the default database path.
  pub fn default_path() -> Result<PathBuf> {
    let data_dir = dirs::data_dir()
      .or_else(|| dirs::home_dir().map(|p| p.join(".local/share")))
      .ok_or_else(|| eyre!("Could not determine data directory"))?;

    Ok(data_dir.join("storefront-cache").join("cache.db"))
  }

  fn conn(&self) -> Result<MutexGuard<'_, Connection>> {
    self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))
  }

  /// Run database migrations for cache tables.
  fn run_migrations(&self) -> Result<()> {
    self
      .conn()?
      .execute_batch(CACHE_SCHEMA)
      .map_err(|e| eyre!("Failed to run cache migrations: {}", e))?;

    Ok(())
  }
}

/// Schema for cache tables.
const CACHE_SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS namespaces (
    name TEXT PRIMARY KEY,
    created_at TEXT NOT NULL
);

-- id doubles as insertion order within a namespace
CREATE TABLE IF NOT EXISTS entries (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    namespace TEXT NOT NULL,
    key_hash TEXT NOT NULL,
    method TEXT NOT NULL,
    url TEXT NOT NULL,
    status INTEGER NOT NULL,
    headers TEXT NOT NULL,
    body BLOB NOT NULL,
    cached_at TEXT NOT NULL,
    UNIQUE (namespace, key_hash)
);

CREATE INDEX IF NOT EXISTS idx_entries_namespace ON entries(namespace, id);
"#;

/// Run `f` inside a transaction, rolling back if it fails.
fn in_transaction<T>(conn: &Connection, f: impl FnOnce(&Connection) -> Result<T>) -> Result<T> {
  conn
    .execute("BEGIN TRANSACTION", [])
    .map_err(|e| eyre!("Failed to begin transaction: {}", e))?;

  match f(conn) {
    Ok(value) => {
      conn
        .execute("COMMIT", [])
        .map_err(|e| eyre!("Failed to commit transaction: {}", e))?;
      Ok(value)
    }
    Err(err) => {
      let _ = conn.execute("ROLLBACK", []);
      Err(err)
    }
  }
}

fn ensure_namespace(conn: &Connection, namespace: &str) -> Result<()> {
  conn
    .execute(
      "INSERT OR IGNORE INTO namespaces (name, created_at) VALUES (?, ?)",
      params![namespace, Utc::now().to_rfc3339()],
    )
    .map_err(|e| eyre!("Failed to create namespace {}: {}", namespace, e))?;
  Ok(())
}

fn insert_entry(
  conn: &Connection,
  namespace: &str,
  key: &RequestKey,
  response: &ProxyResponse,
) -> Result<()> {
  let digest = key.digest();
  let headers = serde_json::to_string(&response.headers)
    .map_err(|e| eyre!("Failed to serialize headers: {}", e))?;

  // Replacing moves the entry to the back of the insertion order
  conn
    .execute(
      "DELETE FROM entries WHERE namespace = ? AND key_hash = ?",
      params![namespace, digest],
    )
    .map_err(|e| eyre!("Failed to replace entry {}: {}", key, e))?;

  conn
    .execute(
      "INSERT INTO entries (namespace, key_hash, method, url, status, headers, body, cached_at)
       VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
      params![
        namespace,
        digest,
        key.method,
        key.url,
        response.status,
        headers,
        response.body.as_ref(),
        Utc::now().to_rfc3339()
      ],
    )
    .map_err(|e| eyre!("Failed to store entry {}: {}", key, e))?;

  Ok(())
}

impl CacheStore for SqliteStore {
  fn open(&self, namespace: &str) -> Result<()> {
    ensure_namespace(&*self.conn()?, namespace)
  }

  fn namespaces(&self) -> Result<Vec<String>> {
    let conn = self.conn()?;
    let mut stmt = conn
      .prepare("SELECT name FROM namespaces ORDER BY rowid")
      .map_err(|e| eyre!("Failed to prepare query: {}", e))?;

    let names = stmt
      .query_map([], |row| row.get(0))
      .map_err(|e| eyre!("Failed to list namespaces: {}", e))?
      .collect::<rusqlite::Result<Vec<String>>>()
      .map_err(|e| eyre!("Failed to read namespace: {}", e))?;

    Ok(names)
  }

  fn get(&self, namespace: &str, key: &RequestKey) -> Result<Option<CachedEntry>> {
    let conn = self.conn()?;
    let mut stmt = conn
      .prepare(
        "SELECT status, headers, body, cached_at FROM entries
         WHERE namespace = ? AND key_hash = ?",
      )
      .map_err(|e| eyre!("Failed to prepare query: {}", e))?;

    let row: Option<(u16, String, Vec<u8>, String)> = stmt
      .query_row(params![namespace, key.digest()], |row| {
        Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?))
      })
      .optional()
      .map_err(|e| eyre!("Failed to look up {}: {}", key, e))?;

    match row {
      Some((status, headers, body, cached_at)) => {
        let headers: Headers = serde_json::from_str(&headers)
          .map_err(|e| eyre!("Failed to deserialize headers of {}: {}", key, e))?;
        Ok(Some(CachedEntry {
          response: ProxyResponse {
            status,
            headers,
            body: body.into(),
          },
          cached_at: parse_datetime(&cached_at)?,
        }))
      }
      None => Ok(None),
    }
  }

  fn put(&self, namespace: &str, key: &RequestKey, response: &ProxyResponse) -> Result<()> {
    let conn = self.conn()?;
    in_transaction(&conn, |conn| {
      ensure_namespace(conn, namespace)?;
      insert_entry(conn, namespace, key, response)
    })
  }

  fn put_all(&self, namespace: &str, entries: &[(RequestKey, ProxyResponse)]) -> Result<()> {
    let conn = self.conn()?;
    in_transaction(&conn, |conn| {
      ensure_namespace(conn, namespace)?;
      for (key, response) in entries {
        insert_entry(conn, namespace, key, response)?;
      }
      Ok(())
    })
  }

  fn delete(&self, namespace: &str, key: &RequestKey) -> Result<bool> {
    let removed = self
      .conn()?
      .execute(
        "DELETE FROM entries WHERE namespace = ? AND key_hash = ?",
        params![namespace, key.digest()],
      )
      .map_err(|e| eyre!("Failed to delete entry {}: {}", key, e))?;

    Ok(removed > 0)
  }

  fn keys(&self, namespace: &str) -> Result<Vec<StoredKey>> {
    let conn = self.conn()?;
    let mut stmt = conn
      .prepare(
        "SELECT method, url, cached_at FROM entries
         WHERE namespace = ?
         ORDER BY id",
      )
      .map_err(|e| eyre!("Failed to prepare key query: {}", e))?;

    let rows = stmt
      .query_map(params![namespace], |row| {
        Ok((
          row.get::<_, String>(0)?,
          row.get::<_, String>(1)?,
          row.get::<_, String>(2)?,
        ))
      })
      .map_err(|e| eyre!("Failed to list keys of {}: {}", namespace, e))?
      .collect::<rusqlite::Result<Vec<_>>>()
      .map_err(|e| eyre!("Failed to read key of {}: {}", namespace, e))?;

    rows
      .into_iter()
      .map(|(method, url, cached_at)| {
        Ok(StoredKey {
          key: RequestKey { method, url },
          cached_at: parse_datetime(&cached_at)?,
        })
      })
      .collect()
  }

  fn delete_namespace(&self, namespace: &str) -> Result<bool> {
    let conn = self.conn()?;
    in_transaction(&conn, |conn| {
      conn
        .execute("DELETE FROM entries WHERE namespace = ?", params![namespace])
        .map_err(|e| eyre!("Failed to clear namespace {}: {}", namespace, e))?;
      let removed = conn
        .execute("DELETE FROM namespaces WHERE name = ?", params![namespace])
        .map_err(|e| eyre!("Failed to delete namespace {}: {}", namespace, e))?;
      Ok(removed > 0)
    })
  }
}

/// Parse an RFC 3339 timestamp written by this store.
fn parse_datetime(s: &str) -> Result<DateTime<Utc>> {
  DateTime::parse_from_rfc3339(s)
    .map(|dt| dt.with_timezone(&Utc))
    .map_err(|e| eyre!("Failed to parse datetime '{}': {}", s, e))
}
