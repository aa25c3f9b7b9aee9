//! Cache storage trait and its SQLite and in-memory implementations.

use color_eyre::{eyre::eyre, Result};
use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;
use std::sync::Mutex;

use super::http::Response;

/// Named partitions of (request key → response) entries.
///
/// Partitions and entries both keep insertion order. Writing an existing key
/// replaces the response and moves the entry to the newest position.
pub trait CacheStorage: Send + Sync {
  /// Partition names in creation order.
  fn partition_names(&self) -> Result<Vec<String>>;

  /// Create the partition if it does not exist yet.
  fn open_partition(&self, partition: &str) -> Result<()>;

  fn has_partition(&self, partition: &str) -> Result<bool>;

  /// Delete a partition with all its entries. Returns whether it existed.
  fn delete_partition(&self, partition: &str) -> Result<bool>;

  /// Look a key up in one partition.
  fn get(&self, partition: &str, key: &str) -> Result<Option<Response>>;

  /// Look a key up across all partitions, oldest partition first.
  fn match_any(&self, key: &str) -> Result<Option<Response>>;

  /// Store a response, creating the partition when needed.
  fn put(&self, partition: &str, key: &str, response: &Response) -> Result<()>;

  /// Entry keys of a partition, oldest first.
  fn keys(&self, partition: &str) -> Result<Vec<String>>;

  /// Delete one entry. Returns whether it existed.
  fn delete(&self, partition: &str, key: &str) -> Result<bool>;
}

/// Storage implementation that keeps everything in process memory.
#[derive(Default)]
pub struct MemoryStorage {
  partitions: Mutex<Vec<MemoryPartition>>,
}

struct MemoryPartition {
  name: String,
  entries: Vec<(String, Response)>,
}

impl MemoryStorage {
  pub fn new() -> Self {
    Self::default()
  }

  fn with_partitions<T>(&self, f: impl FnOnce(&mut Vec<MemoryPartition>) -> T) -> Result<T> {
    let mut partitions = self
      .partitions
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;
    Ok(f(&mut partitions))
  }
}

impl CacheStorage for MemoryStorage {
  fn partition_names(&self) -> Result<Vec<String>> {
    self.with_partitions(|parts| parts.iter().map(|p| p.name.clone()).collect())
  }

  fn open_partition(&self, partition: &str) -> Result<()> {
    self.with_partitions(|parts| {
      if !parts.iter().any(|p| p.name == partition) {
        parts.push(MemoryPartition {
          name: partition.to_string(),
          entries: Vec::new(),
        });
      }
    })
  }

  fn has_partition(&self, partition: &str) -> Result<bool> {
    self.with_partitions(|parts| parts.iter().any(|p| p.name == partition))
  }

  fn delete_partition(&self, partition: &str) -> Result<bool> {
    self.with_partitions(|parts| {
      let before = parts.len();
      parts.retain(|p| p.name != partition);
      parts.len() != before
    })
  }

  fn get(&self, partition: &str, key: &str) -> Result<Option<Response>> {
    self.with_partitions(|parts| {
      parts
        .iter()
        .find(|p| p.name == partition)
        .and_then(|p| p.entries.iter().find(|(k, _)| k == key))
        .map(|(_, r)| r.clone())
    })
  }

  fn match_any(&self, key: &str) -> Result<Option<Response>> {
    self.with_partitions(|parts| {
      parts
        .iter()
        .find_map(|p| p.entries.iter().find(|(k, _)| k == key))
        .map(|(_, r)| r.clone())
    })
  }

  fn put(&self, partition: &str, key: &str, response: &Response) -> Result<()> {
    self.with_partitions(|parts| {
      let index = match parts.iter().position(|p| p.name == partition) {
        Some(index) => index,
        None => {
          parts.push(MemoryPartition {
            name: partition.to_string(),
            entries: Vec::new(),
          });
          parts.len() - 1
        }
      };
      let entries = &mut parts[index].entries;
      entries.retain(|(k, _)| k != key);
      entries.push((key.to_string(), response.clone()));
    })
  }

  fn keys(&self, partition: &str) -> Result<Vec<String>> {
    self.with_partitions(|parts| {
      parts
        .iter()
        .find(|p| p.name == partition)
        .map(|p| p.entries.iter().map(|(k, _)| k.clone()).collect())
        .unwrap_or_default()
    })
  }

  fn delete(&self, partition: &str, key: &str) -> Result<bool> {
    self.with_partitions(|parts| {
      parts
        .iter_mut()
        .find(|p| p.name == partition)
        .map(|p| {
          let before = p.entries.len();
          p.entries.retain(|(k, _)| k != key);
          p.entries.len() != before
        })
        .unwrap_or(false)
    })
  }
}

/// SQLite-based cache storage implementation.
pub struct SqliteStorage {
  conn: Mutex<Connection>,
}

impl SqliteStorage {
  /// Open (or create) the cache database at `path`.
  pub fn open(path: &Path) -> Result<Self> {
    // Ensure parent directory exists
    if let Some(parent) = path.parent() {
      std::fs::create_dir_all(parent)
        .map_err(|e| eyre!("Failed to create cache directory: {}", e))?;
    }

    let conn = Connection::open(path)
      .map_err(|e| eyre!("Failed to open cache database at {}: {}", path.display(), e))?;

    Self::from_connection(conn)
  }

  /// Cache database that lives only as long as this value.
  pub fn in_memory() -> Result<Self> {
    let conn = Connection::open_in_memory()
      .map_err(|e| eyre!("Failed to open in-memory cache database: {}", e))?;
    Self::from_connection(conn)
  }

  fn from_connection(conn: Connection) -> Result<Self> {
    let storage = Self {
      conn: Mutex::new(conn),
    };
    storage.run_migrations()?;
    Ok(storage)
  }

  /// Run database migrations for cache tables.
  fn run_migrations(&self) -> Result<()> {
    let conn = self.lock()?;

    conn
      .execute_batch(CACHE_SCHEMA)
      .map_err(|e| eyre!("Failed to run cache migrations: {}", e))?;

    Ok(())
  }

  fn lock(&self) -> Result<std::sync::MutexGuard<'_, Connection>> {
    self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))
  }
}

/// Schema for cache tables.
const CACHE_SCHEMA: &str = r#"
PRAGMA foreign_keys = ON;

-- Partitions in creation order
CREATE TABLE IF NOT EXISTS cache_partitions (
    seq INTEGER PRIMARY KEY AUTOINCREMENT,
    name TEXT NOT NULL UNIQUE
);

-- Entries; seq grows on every write so it encodes insertion order
CREATE TABLE IF NOT EXISTS cache_entries (
    partition TEXT NOT NULL,
    request_key TEXT NOT NULL,
    seq INTEGER NOT NULL,
    status INTEGER NOT NULL,
    headers TEXT NOT NULL,
    body BLOB NOT NULL,
    cached_at TEXT NOT NULL DEFAULT (datetime('now')),
    PRIMARY KEY (partition, request_key),
    FOREIGN KEY (partition) REFERENCES cache_partitions(name) ON DELETE CASCADE
);

CREATE INDEX IF NOT EXISTS idx_cache_entries_order
    ON cache_entries(partition, seq);
"#;

fn row_to_response(status: u16, headers: String, body: Vec<u8>) -> Result<Response> {
  let headers: Vec<(String, String)> = serde_json::from_str(&headers)
    .map_err(|e| eyre!("Failed to deserialize cached headers: {}", e))?;
  Ok(Response {
    status,
    headers,
    body,
  })
}

type EntryRow = (u16, String, Vec<u8>);

impl CacheStorage for SqliteStorage {
  fn partition_names(&self) -> Result<Vec<String>> {
    let conn = self.lock()?;
    let mut stmt = conn
      .prepare("SELECT name FROM cache_partitions ORDER BY seq")
      .map_err(|e| eyre!("Failed to prepare query: {}", e))?;
    let names = stmt
      .query_map([], |row| row.get(0))
      .map_err(|e| eyre!("Failed to list partitions: {}", e))?
      .collect::<rusqlite::Result<Vec<String>>>()
      .map_err(|e| eyre!("Failed to read partition name: {}", e))?;
    Ok(names)
  }

  fn open_partition(&self, partition: &str) -> Result<()> {
    let conn = self.lock()?;
    conn
      .execute(
        "INSERT OR IGNORE INTO cache_partitions (name) VALUES (?)",
        params![partition],
      )
      .map_err(|e| eyre!("Failed to open partition {}: {}", partition, e))?;
    Ok(())
  }

  fn has_partition(&self, partition: &str) -> Result<bool> {
    let conn = self.lock()?;
    let found: Option<i64> = conn
      .query_row(
        "SELECT 1 FROM cache_partitions WHERE name = ?",
        params![partition],
        |row| row.get(0),
      )
      .optional()
      .map_err(|e| eyre!("Failed to query partition {}: {}", partition, e))?;
    Ok(found.is_some())
  }

  fn delete_partition(&self, partition: &str) -> Result<bool> {
    let mut conn = self.lock()?;
    let tx = conn
      .transaction()
      .map_err(|e| eyre!("Failed to begin transaction: {}", e))?;
    tx.execute(
      "DELETE FROM cache_entries WHERE partition = ?",
      params![partition],
    )
    .map_err(|e| eyre!("Failed to delete entries of {}: {}", partition, e))?;
    let removed = tx
      .execute(
        "DELETE FROM cache_partitions WHERE name = ?",
        params![partition],
      )
      .map_err(|e| eyre!("Failed to delete partition {}: {}", partition, e))?;
    tx.commit()
      .map_err(|e| eyre!("Failed to commit transaction: {}", e))?;
    Ok(removed > 0)
  }

  fn get(&self, partition: &str, key: &str) -> Result<Option<Response>> {
    let conn = self.lock()?;
    let row: Option<EntryRow> = conn
      .query_row(
        "SELECT status, headers, body FROM cache_entries
         WHERE partition = ? AND request_key = ?",
        params![partition, key],
        |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
      )
      .optional()
      .map_err(|e| eyre!("Failed to query cache entry: {}", e))?;

    row
      .map(|(status, headers, body)| row_to_response(status, headers, body))
      .transpose()
  }

  fn match_any(&self, key: &str) -> Result<Option<Response>> {
    let conn = self.lock()?;
    let row: Option<EntryRow> = conn
      .query_row(
        "SELECT e.status, e.headers, e.body FROM cache_entries e
         INNER JOIN cache_partitions p ON p.name = e.partition
         WHERE e.request_key = ?
         ORDER BY p.seq
         LIMIT 1",
        params![key],
        |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
      )
      .optional()
      .map_err(|e| eyre!("Failed to query cache entry: {}", e))?;

    row
      .map(|(status, headers, body)| row_to_response(status, headers, body))
      .transpose()
  }

  fn put(&self, partition: &str, key: &str, response: &Response) -> Result<()> {
    let headers = serde_json::to_string(&response.headers)
      .map_err(|e| eyre!("Failed to serialize headers: {}", e))?;

    let mut conn = self.lock()?;
    let tx = conn
      .transaction()
      .map_err(|e| eyre!("Failed to begin transaction: {}", e))?;

    tx.execute(
      "INSERT OR IGNORE INTO cache_partitions (name) VALUES (?)",
      params![partition],
    )
    .map_err(|e| eyre!("Failed to open partition {}: {}", partition, e))?;

    let seq: i64 = tx
      .query_row(
        "SELECT COALESCE(MAX(seq), 0) + 1 FROM cache_entries",
        [],
        |row| row.get(0),
      )
      .map_err(|e| eyre!("Failed to allocate entry sequence: {}", e))?;

    tx.execute(
      "INSERT OR REPLACE INTO cache_entries (partition, request_key, seq, status, headers, body, cached_at)
       VALUES (?, ?, ?, ?, ?, ?, datetime('now'))",
      params![partition, key, seq, response.status, headers, response.body],
    )
    .map_err(|e| eyre!("Failed to store cache entry: {}", e))?;

    tx.commit()
      .map_err(|e| eyre!("Failed to commit transaction: {}", e))?;
    Ok(())
  }

  fn keys(&self, partition: &str) -> Result<Vec<String>> {
    let conn = self.lock()?;
    let mut stmt = conn
      .prepare("SELECT request_key FROM cache_entries WHERE partition = ? ORDER BY seq")
      .map_err(|e| eyre!("Failed to prepare query: {}", e))?;
    let keys = stmt
      .query_map(params![partition], |row| row.get(0))
      .map_err(|e| eyre!("Failed to list cache keys: {}", e))?
      .collect::<rusqlite::Result<Vec<String>>>()
      .map_err(|e| eyre!("Failed to read cache key: {}", e))?;
    Ok(keys)
  }

  fn delete(&self, partition: &str, key: &str) -> Result<bool> {
    let conn = self.lock()?;
    let removed = conn
      .execute(
        "DELETE FROM cache_entries WHERE partition = ? AND request_key = ?",
        params![partition, key],
      )
      .map_err(|e| eyre!("Failed to delete cache entry: {}", e))?;
    Ok(removed > 0)
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  fn storages() -> Vec<Box<dyn CacheStorage>> {
    vec![
      Box::new(MemoryStorage::new()),
      Box::new(SqliteStorage::in_memory().unwrap()),
    ]
  }

  fn body(text: &str) -> Response {
    Response::new(200, text.as_bytes().to_vec())
  }

  #[test]
  fn test_keys_follow_insertion_order() {
    for storage in storages() {
      for key in ["a", "b", "c"] {
        storage.put("p", key, &body(key)).unwrap();
      }
      assert_eq!(storage.keys("p").unwrap(), vec!["a", "b", "c"]);
    }
  }

  #[test]
  fn test_overwrite_replaces_and_moves_to_newest() {
    for storage in storages() {
      storage.put("p", "a", &body("1")).unwrap();
      storage.put("p", "b", &body("2")).unwrap();
      storage.put("p", "a", &body("3")).unwrap();

      assert_eq!(storage.keys("p").unwrap(), vec!["b", "a"]);
      assert_eq!(storage.get("p", "a").unwrap(), Some(body("3")));
    }
  }

  #[test]
  fn test_headers_survive_storage() {
    for storage in storages() {
      let response = body("{}").with_header("Content-Type", "application/json");
      storage.put("p", "k", &response).unwrap();
      let stored = storage.get("p", "k").unwrap().unwrap();
      assert_eq!(stored.header("content-type"), Some("application/json"));
    }
  }

  #[test]
  fn test_match_any_prefers_oldest_partition() {
    for storage in storages() {
      storage.open_partition("first").unwrap();
      storage.put("second", "k", &body("second")).unwrap();
      storage.put("first", "k", &body("first")).unwrap();

      assert_eq!(storage.match_any("k").unwrap(), Some(body("first")));
      assert_eq!(storage.match_any("missing").unwrap(), None);
    }
  }

  #[test]
  fn test_delete_partition_drops_entries() {
    for storage in storages() {
      storage.put("old", "k", &body("x")).unwrap();
      storage.put("new", "j", &body("y")).unwrap();

      assert!(storage.delete_partition("old").unwrap());
      assert!(!storage.delete_partition("old").unwrap());
      assert_eq!(storage.partition_names().unwrap(), vec!["new"]);
      assert_eq!(storage.match_any("k").unwrap(), None);
      assert!(storage.keys("old").unwrap().is_empty());
    }
  }

  #[test]
  fn test_delete_entry() {
    for storage in storages() {
      storage.put("p", "k", &body("x")).unwrap();
      assert!(storage.delete("p", "k").unwrap());
      assert!(!storage.delete("p", "k").unwrap());
      assert!(storage.has_partition("p").unwrap());
      assert!(!storage.has_partition("q").unwrap());
    }
  }

  #[test]
  fn test_sqlite_storage_persists_on_disk() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("cache").join("cache.db");
    {
      let storage = SqliteStorage::open(&path).unwrap();
      storage.put("p", "k", &body("x")).unwrap();
    }
    let storage = SqliteStorage::open(&path).unwrap();
    assert_eq!(storage.get("p", "k").unwrap(), Some(body("x")));
  }
}
