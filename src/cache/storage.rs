//! Namespace storage trait, a SQLite implementation and an in-memory one.

use chrono::{DateTime, Utc};
use color_eyre::{eyre::eyre, Result};
use rusqlite::{params, Connection, OptionalExtension};
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};

use super::key::RequestKey;
use super::traits::CacheEntry;
use crate::net::ResponseSnapshot;

/// Trait for namespace storage backends.
///
/// Every namespace is an independent key → entry map. Writes are upserts
/// into an existing namespace; writing to one that was never opened, or was
/// deleted, is an error.
pub trait CacheStorage: Send + Sync {
  /// Create the namespace if it does not exist yet.
  fn open_namespace(&self, name: &str) -> Result<()>;

  /// Names of all existing namespaces.
  fn namespace_names(&self) -> Result<Vec<String>>;

  /// Delete a namespace and all of its entries. Returns whether it existed.
  fn delete_namespace(&self, name: &str) -> Result<bool>;

  /// Get a single entry.
  fn get(&self, namespace: &str, key: &RequestKey) -> Result<Option<CacheEntry>>;

  /// Insert or replace a single entry. Fails if the namespace is missing.
  fn put(&self, namespace: &str, key: &RequestKey, entry: &CacheEntry) -> Result<()>;

  /// Delete a single entry. Returns whether it existed.
  fn delete(&self, namespace: &str, key: &RequestKey) -> Result<bool>;

  /// All keys of a namespace, oldest-listed first.
  ///
  /// The order approximates insertion order but is not guaranteed to match it.
  fn keys(&self, namespace: &str) -> Result<Vec<RequestKey>>;
}

/// Handle to one opened namespace.
#[derive(Clone)]
pub struct Namespace {
  storage: Arc<dyn CacheStorage>,
  name: String,
}

impl Namespace {
  /// Handle to `name` without touching storage. Writes fail until the
  /// namespace is opened.
  pub fn new(storage: Arc<dyn CacheStorage>, name: &str) -> Self {
    Self {
      storage,
      name: name.to_string(),
    }
  }

  /// Open (creating if needed) the namespace called `name`.
  pub fn open(storage: Arc<dyn CacheStorage>, name: &str) -> Result<Self> {
    storage.open_namespace(name)?;
    Ok(Self::new(storage, name))
  }

  pub fn name(&self) -> &str {
    &self.name
  }

  pub fn lookup(&self, key: &RequestKey) -> Result<Option<CacheEntry>> {
    self.storage.get(&self.name, key)
  }

  /// Snapshot `response` under `key`, replacing any previous entry.
  pub fn store(&self, key: &RequestKey, response: &ResponseSnapshot) -> Result<()> {
    self
      .storage
      .put(&self.name, key, &CacheEntry::new(response.clone()))
  }

  pub fn remove(&self, key: &RequestKey) -> Result<bool> {
    self.storage.delete(&self.name, key)
  }

  pub fn keys(&self) -> Result<Vec<RequestKey>> {
    self.storage.keys(&self.name)
  }

  pub fn len(&self) -> Result<usize> {
    Ok(self.keys()?.len())
  }

  pub fn is_empty(&self) -> Result<bool> {
    Ok(self.len()? == 0)
  }
}

/// SQLite-based storage implementation.
pub struct SqliteStorage {
  conn: Mutex<Connection>,
}

impl SqliteStorage {
  /// Open the storage at the default location.
  pub fn open() -> Result<Self> {
    Self::open_at(&Self::default_path()?)
  }

  /// Open the storage at an explicit path.
  pub fn open_at(path: &Path) -> Result<Self> {
    // Ensure parent directory exists
    if let Some(parent) = path.parent() {
      std::fs::create_dir_all(parent)
        .map_err(|e| eyre!("Failed to create cache directory: {}", e))?;
    }

    let conn = Connection::open(path)
      .map_err(|e| eyre!("Failed to open cache database at {}: {}", path.display(), e))?;

    Self::with_connection(conn)
  }

  /// Storage that lives only as long as this value.
  pub fn in_memory() -> Result<Self> {
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

    Ok(data_dir.join("offcache").join("cache.db"))
  }

  fn conn(&self) -> Result<MutexGuard<'_, Connection>> {
    self.conn.lock().map_err(|e| eyre!("Lock poisoned: {}", e))
  }

  /// Run database migrations for cache tables.
  fn run_migrations(&self) -> Result<()> {
    self
      .conn()?
      .execute_batch(CACHE_SCHEMA)
      .map_err(|e| eyre!("Failed to run cache migrations: {}", e))
  }
}

/// Schema for cache tables.
const CACHE_SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS namespaces (
    name TEXT PRIMARY KEY,
    created_at TEXT NOT NULL DEFAULT (datetime('now'))
);

-- One row per cached response; rowid order is the listing order
CREATE TABLE IF NOT EXISTS entries (
    namespace TEXT NOT NULL,
    request_key TEXT NOT NULL,
    status INTEGER NOT NULL,
    headers TEXT NOT NULL,
    body BLOB NOT NULL,
    stored_at TEXT NOT NULL,
    PRIMARY KEY (namespace, request_key)
);
"#;

impl CacheStorage for SqliteStorage {
  fn open_namespace(&self, name: &str) -> Result<()> {
    self
      .conn()?
      .execute(
        "INSERT OR IGNORE INTO namespaces (name) VALUES (?)",
        params![name],
      )
      .map_err(|e| eyre!("Failed to open namespace {}: {}", name, e))?;
    Ok(())
  }

  fn namespace_names(&self) -> Result<Vec<String>> {
    let conn = self.conn()?;
    let mut stmt = conn
      .prepare("SELECT name FROM namespaces ORDER BY name")
      .map_err(|e| eyre!("Failed to prepare query: {}", e))?;

    let names = stmt
      .query_map([], |row| row.get(0))
      .map_err(|e| eyre!("Failed to list namespaces: {}", e))?
      .collect::<rusqlite::Result<Vec<String>>>()
      .map_err(|e| eyre!("Failed to read namespace name: {}", e))?;

    Ok(names)
  }

  fn delete_namespace(&self, name: &str) -> Result<bool> {
    let conn = self.conn()?;
    let tx = conn
      .unchecked_transaction()
      .map_err(|e| eyre!("Failed to begin transaction: {}", e))?;

    tx.execute("DELETE FROM entries WHERE namespace = ?", params![name])
      .map_err(|e| eyre!("Failed to delete entries of {}: {}", name, e))?;
    let removed = tx
      .execute("DELETE FROM namespaces WHERE name = ?", params![name])
      .map_err(|e| eyre!("Failed to delete namespace {}: {}", name, e))?;

    tx.commit()
      .map_err(|e| eyre!("Failed to commit transaction: {}", e))?;

    Ok(removed > 0)
  }

  fn get(&self, namespace: &str, key: &RequestKey) -> Result<Option<CacheEntry>> {
    let conn = self.conn()?;
    let row: Option<(u16, String, Vec<u8>, String)> = conn
      .query_row(
        "SELECT status, headers, body, stored_at FROM entries
         WHERE namespace = ? AND request_key = ?",
        params![namespace, key.as_str()],
        |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?)),
      )
      .optional()
      .map_err(|e| eyre!("Failed to read entry {}: {}", key, e))?;

    match row {
      Some((status, headers, body, stored_at)) => {
        let headers = serde_json::from_str(&headers)
          .map_err(|e| eyre!("Failed to deserialize headers of {}: {}", key, e))?;
        Ok(Some(CacheEntry {
          response: ResponseSnapshot {
            status,
            headers,
            body,
          },
          stored_at: parse_datetime(&stored_at)?,
        }))
      }
      None => Ok(None),
    }
  }

  fn put(&self, namespace: &str, key: &RequestKey, entry: &CacheEntry) -> Result<()> {
    let conn = self.conn()?;
    let headers = serde_json::to_string(&entry.response.headers)
      .map_err(|e| eyre!("Failed to serialize headers: {}", e))?;

    let tx = conn
      .unchecked_transaction()
      .map_err(|e| eyre!("Failed to begin transaction: {}", e))?;

    let exists: bool = tx
      .query_row(
        "SELECT EXISTS(SELECT 1 FROM namespaces WHERE name = ?)",
        params![namespace],
        |row| row.get(0),
      )
      .map_err(|e| eyre!("Failed to look up namespace {}: {}", namespace, e))?;
    if !exists {
      return Err(eyre!("Namespace {} does not exist", namespace));
    }

    tx.execute(
      "INSERT OR REPLACE INTO entries (namespace, request_key, status, headers, body, stored_at)
       VALUES (?, ?, ?, ?, ?, ?)",
      params![
        namespace,
        key.as_str(),
        entry.response.status,
        headers,
        entry.response.body,
        entry.stored_at.to_rfc3339()
      ],
    )
    .map_err(|e| eyre!("Failed to store entry {}: {}", key, e))?;

    tx.commit()
      .map_err(|e| eyre!("Failed to commit transaction: {}", e))?;

    Ok(())
  }

  fn delete(&self, namespace: &str, key: &RequestKey) -> Result<bool> {
    let removed = self
      .conn()?
      .execute(
        "DELETE FROM entries WHERE namespace = ? AND request_key = ?",
        params![namespace, key.as_str()],
      )
      .map_err(|e| eyre!("Failed to delete entry {}: {}", key, e))?;
    Ok(removed > 0)
  }

  fn keys(&self, namespace: &str) -> Result<Vec<RequestKey>> {
    let conn = self.conn()?;
    let mut stmt = conn
      .prepare("SELECT request_key FROM entries WHERE namespace = ? ORDER BY rowid")
      .map_err(|e| eyre!("Failed to prepare query: {}", e))?;

    let keys = stmt
      .query_map(params![namespace], |row| row.get(0))
      .map_err(|e| eyre!("Failed to list keys of {}: {}", namespace, e))?
      .collect::<rusqlite::Result<Vec<String>>>()
      .map_err(|e| eyre!("Failed to read key: {}", e))?;

    Ok(keys.into_iter().map(RequestKey::from_stored).collect())
  }
}

/// Parse a timestamp written by `put`.
fn parse_datetime(s: &str) -> Result<DateTime<Utc>> {
  DateTime::parse_from_rfc3339(s)
    .map(|dt| dt.with_timezone(&Utc))
    .map_err(|e| eyre!("Failed to parse datetime '{}': {}", s, e))
}

/// In-process storage. Keys list in first-insertion order.
#[derive(Default)]
pub struct MemoryStorage {
  namespaces: Mutex<BTreeMap<String, MemoryNamespace>>,
}

#[derive(Default)]
struct MemoryNamespace {
  order: Vec<RequestKey>,
  entries: HashMap<RequestKey, CacheEntry>,
}

impl MemoryStorage {
  pub fn new() -> Self {
    Self::default()
  }

  fn namespaces(&self) -> Result<MutexGuard<'_, BTreeMap<String, MemoryNamespace>>> {
    self.namespaces.lock().map_err(|e| eyre!("Lock poisoned: {}", e))
  }
}

impl CacheStorage for MemoryStorage {
  fn open_namespace(&self, name: &str) -> Result<()> {
    self.namespaces()?.entry(name.to_string()).or_default();
    Ok(())
  }

  fn namespace_names(&self) -> Result<Vec<String>> {
    Ok(self.namespaces()?.keys().cloned().collect())
  }

  fn delete_namespace(&self, name: &str) -> Result<bool> {
    Ok(self.namespaces()?.remove(name).is_some())
  }

  fn get(&self, namespace: &str, key: &RequestKey) -> Result<Option<CacheEntry>> {
    Ok(
      self
        .namespaces()?
        .get(namespace)
        .and_then(|ns| ns.entries.get(key).cloned()),
    )
  }

  fn put(&self, namespace: &str, key: &RequestKey, entry: &CacheEntry) -> Result<()> {
    let mut namespaces = self.namespaces()?;
    let ns = namespaces
      .get_mut(namespace)
      .ok_or_else(|| eyre!("Namespace {} does not exist", namespace))?;
    if ns.entries.insert(key.clone(), entry.clone()).is_none() {
      ns.order.push(key.clone());
    }
    Ok(())
  }

  fn delete(&self, namespace: &str, key: &RequestKey) -> Result<bool> {
    let mut namespaces = self.namespaces()?;
    let Some(ns) = namespaces.get_mut(namespace) else {
      return Ok(false);
    };
    if ns.entries.remove(key).is_none() {
      return Ok(false);
    }
    ns.order.retain(|k| k != key);
    Ok(true)
  }

  fn keys(&self, namespace: &str) -> Result<Vec<RequestKey>> {
    Ok(
      self
        .namespaces()?
        .get(namespace)
        .map(|ns| ns.order.clone())
        .unwrap_or_default(),
    )
  }
}
