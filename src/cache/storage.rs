//! SQLite implementation of cache storage.

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use tracing::debug;
use url::Url;

use super::traits::{CacheStorage, CachedResponse, Request, RequestMode, Response};
use crate::error::{Error, Result};

/// SQLite-based cache storage implementation.
///
/// Besides the caches themselves, the database carries a small key/value
/// table the registration uses to remember which worker versions are live.
pub struct SqliteStorage {
  conn: Mutex<Connection>,
}

impl SqliteStorage {
  /// Open (or create) the cache database at `path`.
  pub fn open(path: &Path) -> Result<Self> {
    // Ensure parent directory exists
    if let Some(parent) = path.parent() {
      std::fs::create_dir_all(parent)?;
    }

    let conn = Connection::open(path)?;
    debug!(path = %path.display(), "Opened cache database");
    Self::with_connection(conn)
  }

  /// Database that lives only as long as this value.
  #[cfg(test)]
  pub fn open_in_memory() -> Result<Self> {
    Self::with_connection(Connection::open_in_memory()?)
  }

  fn with_connection(conn: Connection) -> Result<Self> {
    let storage = Self {
      conn: Mutex::new(conn),
    };
    storage.run_migrations()?;
    Ok(storage)
  }

  fn conn(&self) -> Result<MutexGuard<'_, Connection>> {
    self
      .conn
      .lock()
      .map_err(|e| Error::LockPoisoned(e.to_string()))
  }

  /// Run database migrations for cache tables.
  fn run_migrations(&self) -> Result<()> {
    self.conn()?.execute_batch(CACHE_SCHEMA)?;
    Ok(())
  }

  /// Read a registration value.
  pub fn get_meta(&self, key: &str) -> Result<Option<String>> {
    let conn = self.conn()?;
    let value = conn
      .query_row(
        "SELECT value FROM registration WHERE key = ?",
        params![key],
        |row| row.get(0),
      )
      .optional()?;
    Ok(value)
  }

  /// Write a registration value; `None` removes it.
  pub fn set_meta(&self, key: &str, value: Option<&str>) -> Result<()> {
    let conn = self.conn()?;
    match value {
      Some(value) => conn.execute(
        "INSERT OR REPLACE INTO registration (key, value) VALUES (?, ?)",
        params![key, value],
      )?,
      None => conn.execute("DELETE FROM registration WHERE key = ?", params![key])?,
    };
    Ok(())
  }
}

/// Schema for cache tables.
const CACHE_SCHEMA: &str = r#"
-- Named cache stores
CREATE TABLE IF NOT EXISTS caches (
    name TEXT PRIMARY KEY,
    created_at TEXT NOT NULL DEFAULT (datetime('now'))
);

-- Stored responses, keyed by hash of method + URL
CREATE TABLE IF NOT EXISTS cache_entries (
    cache_name TEXT NOT NULL,
    request_key TEXT NOT NULL,
    method TEXT NOT NULL,
    url TEXT NOT NULL,
    status INTEGER NOT NULL,
    headers TEXT NOT NULL,
    body BLOB NOT NULL,
    cached_at TEXT NOT NULL DEFAULT (datetime('now')),
    PRIMARY KEY (cache_name, request_key)
);

CREATE INDEX IF NOT EXISTS idx_cache_entries_url ON cache_entries(cache_name, url);

-- Active / waiting worker versions
CREATE TABLE IF NOT EXISTS registration (
    key TEXT PRIMARY KEY,
    value TEXT NOT NULL
);
"#;

fn insert_entry(
  conn: &Connection,
  cache: &str,
  request: &Request,
  response: &Response,
) -> Result<()> {
  let headers = serde_json::to_string(&response.headers)?;
  conn.execute(
    "INSERT OR REPLACE INTO cache_entries (cache_name, request_key, method, url, status, headers, body, cached_at)
     VALUES (?, ?, ?, ?, ?, ?, ?, datetime('now'))",
    params![
      cache,
      request.cache_key(),
      request.method,
      request.cache_url().as_str(),
      response.status,
      headers,
      response.body,
    ],
  )?;
  Ok(())
}

impl CacheStorage for SqliteStorage {
  fn open(&self, cache: &str) -> Result<()> {
    self.conn()?.execute(
      "INSERT OR IGNORE INTO caches (name) VALUES (?)",
      params![cache],
    )?;
    Ok(())
  }

  fn has(&self, cache: &str) -> Result<bool> {
    let conn = self.conn()?;
    let found: Option<i64> = conn
      .query_row(
        "SELECT 1 FROM caches WHERE name = ?",
        params![cache],
        |row| row.get(0),
      )
      .optional()?;
    Ok(found.is_some())
  }

  fn cache_names(&self) -> Result<Vec<String>> {
    let conn = self.conn()?;
    let mut stmt = conn.prepare("SELECT name FROM caches ORDER BY name")?;
    let names = stmt
      .query_map([], |row| row.get(0))?
      .collect::<rusqlite::Result<Vec<String>>>()?;
    Ok(names)
  }

  fn delete_cache(&self, cache: &str) -> Result<bool> {
    let mut conn = self.conn()?;
    let tx = conn.transaction()?;
    tx.execute(
      "DELETE FROM cache_entries WHERE cache_name = ?",
      params![cache],
    )?;
    let removed = tx.execute("DELETE FROM caches WHERE name = ?", params![cache])?;
    tx.commit()?;
    Ok(removed > 0)
  }

  fn match_request(&self, cache: &str, request: &Request) -> Result<Option<CachedResponse>> {
    let conn = self.conn()?;
    let row: Option<(u16, String, Vec<u8>, DateTime<Utc>)> = conn
      .query_row(
        "SELECT status, headers, body, cached_at FROM cache_entries
         WHERE cache_name = ? AND request_key = ?",
        params![cache, request.cache_key()],
        |row| {
          let cached_at: String = row.get(3)?;
          let cached_at = parse_datetime(&cached_at).map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(3, rusqlite::types::Type::Text, Box::new(e))
          })?;
          Ok((row.get(0)?, row.get(1)?, row.get(2)?, cached_at))
        },
      )
      .optional()?;

    match row {
      Some((status, headers, body, cached_at)) => {
        let headers: Vec<(String, String)> = serde_json::from_str(&headers)?;
        Ok(Some(CachedResponse {
          response: Response {
            status,
            headers,
            body,
          },
          cached_at,
        }))
      }
      None => Ok(None),
    }
  }

  fn put(&self, cache: &str, request: &Request, response: &Response) -> Result<()> {
    let mut conn = self.conn()?;
    let tx = conn.transaction()?;
    tx.execute(
      "INSERT OR IGNORE INTO caches (name) VALUES (?)",
      params![cache],
    )?;
    insert_entry(&tx, cache, request, response)?;
    tx.commit()?;
    Ok(())
  }

  fn replace_all(&self, cache: &str, entries: &[(Request, Response)]) -> Result<()> {
    let mut conn = self.conn()?;
    let tx = conn.transaction()?;
    tx.execute(
      "INSERT OR IGNORE INTO caches (name) VALUES (?)",
      params![cache],
    )?;
    tx.execute(
      "DELETE FROM cache_entries WHERE cache_name = ?",
      params![cache],
    )?;
    for (request, response) in entries {
      insert_entry(&tx, cache, request, response)?;
    }
    tx.commit()?;
    Ok(())
  }

  fn keys(&self, cache: &str) -> Result<Vec<Request>> {
    let conn = self.conn()?;
    let mut stmt =
      conn.prepare("SELECT method, url FROM cache_entries WHERE cache_name = ? ORDER BY url")?;
    let rows = stmt
      .query_map(params![cache], |row| Ok((row.get(0)?, row.get(1)?)))?
      .collect::<rusqlite::Result<Vec<(String, String)>>>()?;

    rows
      .into_iter()
      .map(|(method, url)| {
        Ok(Request {
          method,
          url: Url::parse(&url)?,
          mode: RequestMode::Subresource,
        })
      })
      .collect()
  }

  fn len(&self, cache: &str) -> Result<usize> {
    let conn = self.conn()?;
    let count: i64 = conn.query_row(
      "SELECT COUNT(*) FROM cache_entries WHERE cache_name = ?",
      params![cache],
      |row| row.get(0),
    )?;
    Ok(count as usize)
  }
}

/// Parse a datetime string from SQLite format.
fn parse_datetime(s: &str) -> std::result::Result<DateTime<Utc>, chrono::ParseError> {
  // SQLite stores as "YYYY-MM-DD HH:MM:SS"
  chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S").map(|dt| dt.and_utc())
}
