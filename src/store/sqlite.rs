//! Transactional record backend on SQLite.
//!
//! # Responsibility
//! - Keep one table per collection, keyed by an auto-assigned `id`, with a
//!   secondary index on `date`.
//! - Wrap every write in a single-collection transaction.
//!
//! # Invariants
//! - Schema version is tracked via `PRAGMA user_version`.
//! - Upgrades only create missing tables; existing ones are never touched.
//! - The connection is opened on first use and kept for the backend lifetime.

use once_cell::sync::OnceCell;
use rusqlite::types::Value as SqlValue;
use rusqlite::{params, Connection, Transaction};
use serde_json::{Map, Value};
use std::path::PathBuf;
use std::sync::{Mutex, MutexGuard};
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

use super::error::{StoreError, StoreResult};
use super::record::{now_millis, Collection, Record, RecordId};
use super::traits::{BackendKind, Capabilities, RecordBackend};

/// Declared schema version. Bump when the collection list changes.
pub const SCHEMA_VERSION: u32 = 2;

/// File name of the record database inside the data directory.
pub const DB_FILE_NAME: &str = "records.db";

#[derive(Debug, Clone)]
enum Location {
  File(PathBuf),
  Memory,
}

/// SQLite-backed transactional record store.
pub struct SqliteBackend {
  location: Location,
  conn: OnceCell<Mutex<Connection>>,
}

impl SqliteBackend {
  /// Backend stored at `path`. Nothing is opened until the first call.
  pub fn new(path: impl Into<PathBuf>) -> Self {
    Self {
      location: Location::File(path.into()),
      conn: OnceCell::new(),
    }
  }

  /// Backend living in a private in-memory database.
  pub fn in_memory() -> Self {
    Self {
      location: Location::Memory,
      conn: OnceCell::new(),
    }
  }

  fn conn(&self) -> StoreResult<MutexGuard<'_, Connection>> {
    let cell = self
      .conn
      .get_or_try_init(|| self.open().map(Mutex::new))?;
    cell
      .lock()
      .map_err(|e| StoreError::Task(format!("connection lock poisoned: {e}")))
  }

  fn open(&self) -> StoreResult<Connection> {
    let started_at = Instant::now();
    let mode = match self.location {
      Location::File(_) => "file",
      Location::Memory => "memory",
    };
    info!(mode, "opening record store");

    let opened = match &self.location {
      Location::File(path) => {
        if let Some(parent) = path.parent() {
          std::fs::create_dir_all(parent)?;
        }
        Connection::open(path)
      }
      Location::Memory => Connection::open_in_memory(),
    };

    let mut conn = opened.map_err(|err| {
      error!(mode, error = %err, "record store open failed");
      StoreError::Open(err)
    })?;

    conn
      .busy_timeout(Duration::from_secs(5))
      .map_err(StoreError::Open)?;
    if let Err(err) = apply_schema(&mut conn, SCHEMA_VERSION) {
      error!(mode, error = %err, "record store schema bootstrap failed");
      return Err(err);
    }

    info!(
      mode,
      duration_ms = started_at.elapsed().as_millis() as u64,
      "record store ready"
    );
    Ok(conn)
  }

  /// Run `op` in a read-write transaction on one collection.
  ///
  /// The transaction is rolled back when `op` fails or the commit fails.
  fn write<T>(
    &self,
    collection: Collection,
    op: impl FnOnce(&Transaction<'_>) -> rusqlite::Result<T>,
  ) -> StoreResult<T> {
    let mut conn = self.conn()?;
    let tx = conn
      .transaction()
      .map_err(|e| StoreError::transaction(collection, e))?;
    let value = op(&tx).map_err(|e| StoreError::transaction(collection, e))?;
    tx.commit()
      .map_err(|e| StoreError::transaction(collection, e))?;
    Ok(value)
  }
}

impl RecordBackend for SqliteBackend {
  fn kind(&self) -> BackendKind {
    BackendKind::Transactional
  }

  /// Opening the database is the probe: a file that cannot be opened or
  /// migrated reports no capabilities, so selection falls back.
  fn capabilities(&self) -> Capabilities {
    match self.conn() {
      Ok(_) => Capabilities::ALL,
      Err(err) => {
        warn!(error = %err, "record store unusable");
        Capabilities::NONE
      }
    }
  }

  fn get_all(&self, collection: Collection) -> StoreResult<Vec<Record>> {
    let conn = self.conn()?;
    let sql = format!("SELECT id, doc FROM \"{}\" ORDER BY id", collection.name());

    // Every collection table exists once the schema is applied on open.
    let rows: Vec<(RecordId, String)> = conn
      .prepare(&sql)
      .and_then(|mut stmt| {
        let rows = stmt
          .query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?
          .collect::<rusqlite::Result<Vec<_>>>();
        rows
      })
      .map_err(|e| StoreError::transaction(collection, e))?;

    rows
      .into_iter()
      .map(|(id, doc)| {
        let fields: Map<String, Value> = serde_json::from_str(&doc)?;
        Ok(Record {
          id: Some(id),
          fields,
        })
      })
      .collect()
  }

  fn add(&self, collection: Collection, mut record: Record) -> StoreResult<Record> {
    record.ensure_date(now_millis());
    let doc = serde_json::to_string(&record.fields)?;
    let date = date_column(&record);
    let explicit_id = record.id;

    let id = self.write(collection, |tx| {
      tx.execute(
        &format!(
          "INSERT INTO \"{}\" (id, date, doc) VALUES (?1, ?2, ?3)",
          collection.name()
        ),
        params![explicit_id, date, doc],
      )?;
      Ok(tx.last_insert_rowid())
    })?;

    debug!(%collection, id, "record added");
    record.id = Some(id);
    Ok(record)
  }

  fn put(&self, collection: Collection, record: Record) -> StoreResult<Record> {
    let Some(id) = record.id else {
      return Err(StoreError::InvalidArgument(format!(
        "put into `{collection}` requires a record id"
      )));
    };
    let doc = serde_json::to_string(&record.fields)?;
    let date = date_column(&record);

    self.write(collection, |tx| {
      tx.execute(
        &format!(
          "INSERT INTO \"{}\" (id, date, doc) VALUES (?1, ?2, ?3)
           ON CONFLICT(id) DO UPDATE SET date = excluded.date, doc = excluded.doc",
          collection.name()
        ),
        params![id, date, doc],
      )
    })?;

    debug!(%collection, id, "record stored");
    Ok(record)
  }

  fn delete(&self, collection: Collection, id: RecordId) -> StoreResult<()> {
    let removed = self.write(collection, |tx| {
      tx.execute(
        &format!("DELETE FROM \"{}\" WHERE id = ?1", collection.name()),
        params![id],
      )
    })?;
    debug!(%collection, id, removed, "record deleted");
    Ok(())
  }

  fn clear(&self, collection: Collection) -> StoreResult<()> {
    self.write(collection, |tx| {
      tx.execute(&format!("DELETE FROM \"{}\"", collection.name()), [])
    })?;
    Ok(())
  }
}

/// Bring the schema up to `version`, creating any missing collection tables.
pub fn apply_schema(conn: &mut Connection, version: u32) -> StoreResult<()> {
  let current = current_user_version(conn)?;

  if current > version {
    return Err(StoreError::UnsupportedSchemaVersion {
      db_version: current,
      latest_supported: version,
    });
  }

  if current == version {
    return Ok(());
  }

  let tx = conn.transaction().map_err(StoreError::Open)?;
  for collection in Collection::ALL {
    tx.execute_batch(&collection_ddl(collection))
      .map_err(StoreError::Open)?;
  }
  tx.execute_batch(&format!("PRAGMA user_version = {version};"))
    .map_err(StoreError::Open)?;
  tx.commit().map_err(StoreError::Open)?;

  info!(from = current, to = version, "record store schema upgraded");
  Ok(())
}

fn collection_ddl(collection: Collection) -> String {
  let name = collection.name();
  format!(
    "CREATE TABLE IF NOT EXISTS \"{name}\" (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        date,
        doc TEXT NOT NULL
    );
    CREATE INDEX IF NOT EXISTS \"{name}_by_date\" ON \"{name}\"(date);"
  )
}

fn current_user_version(conn: &Connection) -> StoreResult<u32> {
  conn
    .query_row("PRAGMA user_version;", [], |row| row.get::<_, u32>(0))
    .map_err(StoreError::Open)
}

/// Index value for the `date` column. Only scalars are indexable.
fn date_column(record: &Record) -> SqlValue {
  match record.date() {
    Some(Value::Number(n)) => n
      .as_i64()
      .map(SqlValue::Integer)
      .or_else(|| n.as_f64().map(SqlValue::Real))
      .unwrap_or(SqlValue::Null),
    Some(Value::String(s)) => SqlValue::Text(s.clone()),
    _ => SqlValue::Null,
  }
}
