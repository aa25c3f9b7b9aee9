//! Fallback record backend over a flat string key-value store.
//!
//! Each collection lives under one key as a serialized JSON array. Every
//! write reads the whole array, edits it and writes it back. Writes through
//! one backend are serialized; separate processes sharing a file are not,
//! and the last rewrite of a collection wins.

use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Mutex;
use tracing::debug;
use uuid::Uuid;

use super::error::{StoreError, StoreResult};
use super::record::{now_millis, Collection, Record, RecordId};
use super::traits::{BackendKind, Capabilities, RecordBackend};

/// Prefix of the per-collection keys.
pub const KEY_PREFIX: &str = "lv_";

/// Minimal string key-value store.
pub trait KvStore: Send + Sync {
  fn get_item(&self, key: &str) -> StoreResult<Option<String>>;
  fn set_item(&self, key: &str, value: String) -> StoreResult<()>;
  fn remove_item(&self, key: &str) -> StoreResult<()>;
}

/// Process-local key-value store.
#[derive(Default)]
pub struct MemoryKv {
  items: Mutex<HashMap<String, String>>,
}

impl MemoryKv {
  pub fn new() -> Self {
    Self::default()
  }
}

impl KvStore for MemoryKv {
  fn get_item(&self, key: &str) -> StoreResult<Option<String>> {
    Ok(lock(&self.items)?.get(key).cloned())
  }

  fn set_item(&self, key: &str, value: String) -> StoreResult<()> {
    lock(&self.items)?.insert(key.to_string(), value);
    Ok(())
  }

  fn remove_item(&self, key: &str) -> StoreResult<()> {
    lock(&self.items)?.remove(key);
    Ok(())
  }
}

/// Key-value store persisted as a single JSON object on disk.
///
/// Nothing is cached in memory: every call reads the file, so several
/// instances on one path see each other's writes. Changes rewrite the whole
/// file (write to a sibling temp file, then rename).
pub struct FileKv {
  path: PathBuf,
  guard: Mutex<()>,
}

impl FileKv {
  pub fn open(path: impl Into<PathBuf>) -> StoreResult<Self> {
    let path = path.into();
    if let Some(parent) = path.parent() {
      std::fs::create_dir_all(parent)?;
    }
    Ok(Self {
      path,
      guard: Mutex::new(()),
    })
  }

  fn read(&self) -> StoreResult<BTreeMap<String, String>> {
    match std::fs::read_to_string(&self.path) {
      Ok(contents) if contents.trim().is_empty() => Ok(BTreeMap::new()),
      Ok(contents) => Ok(serde_json::from_str(&contents)?),
      Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(BTreeMap::new()),
      Err(err) => Err(err.into()),
    }
  }

  fn flush(&self, items: &BTreeMap<String, String>) -> StoreResult<()> {
    let tmp = self
      .path
      .with_extension(format!("{}.tmp", Uuid::new_v4().simple()));
    std::fs::write(&tmp, serde_json::to_vec(items)?)?;
    if let Err(err) = std::fs::rename(&tmp, &self.path) {
      let _ = std::fs::remove_file(&tmp);
      return Err(err.into());
    }
    Ok(())
  }
}

impl KvStore for FileKv {
  fn get_item(&self, key: &str) -> StoreResult<Option<String>> {
    let _guard = lock(&self.guard)?;
    Ok(self.read()?.remove(key))
  }

  fn set_item(&self, key: &str, value: String) -> StoreResult<()> {
    let _guard = lock(&self.guard)?;
    let mut items = self.read()?;
    items.insert(key.to_string(), value);
    self.flush(&items)
  }

  fn remove_item(&self, key: &str) -> StoreResult<()> {
    let _guard = lock(&self.guard)?;
    let mut items = self.read()?;
    if items.remove(key).is_some() {
      self.flush(&items)?;
    }
    Ok(())
  }
}

/// Issues record ids from the clock plus a random sub-millisecond offset.
///
/// Ids are `millis * 1000 + offset` with `offset` in `0..1000`, and never
/// go backwards within a process, so two inserts in the same millisecond
/// cannot collide.
#[derive(Debug, Default)]
pub struct IdGenerator {
  last: AtomicI64,
}

impl IdGenerator {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn next_id(&self) -> RecordId {
    let candidate = now_millis() * 1000 + random_offset();
    let previous = self
      .last
      .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |last| {
        Some(candidate.max(last + 1))
      })
      .unwrap_or_else(|last| last);
    candidate.max(previous + 1)
  }
}

fn random_offset() -> i64 {
  (Uuid::new_v4().as_u128() % 1000) as i64
}

/// Record backend that stores each collection as one serialized array.
///
/// Writes are read-modify-write of a whole collection, so they are
/// serialized through `writer`.
pub struct FlatBackend<K: KvStore> {
  kv: K,
  ids: IdGenerator,
  writer: Mutex<()>,
}

impl<K: KvStore> FlatBackend<K> {
  pub fn new(kv: K) -> Self {
    Self {
      kv,
      ids: IdGenerator::new(),
      writer: Mutex::new(()),
    }
  }

  fn key(collection: Collection) -> String {
    format!("{KEY_PREFIX}{}", collection.name())
  }

  fn load(&self, collection: Collection) -> StoreResult<Vec<Record>> {
    match self.kv.get_item(&Self::key(collection))? {
      Some(raw) => Ok(serde_json::from_str(&raw)?),
      None => Ok(Vec::new()),
    }
  }

  fn save(&self, collection: Collection, records: &[Record]) -> StoreResult<()> {
    self
      .kv
      .set_item(&Self::key(collection), serde_json::to_string(records)?)
  }

  fn upsert(&self, collection: Collection, record: Record) -> StoreResult<Record> {
    let _writer = lock(&self.writer)?;
    let mut records = self.load(collection)?;
    match records.iter_mut().find(|r| r.id == record.id) {
      Some(existing) => *existing = record.clone(),
      None => records.push(record.clone()),
    }
    self.save(collection, &records)?;
    debug!(%collection, id = ?record.id, "record stored");
    Ok(record)
  }
}

impl<K: KvStore> RecordBackend for FlatBackend<K> {
  fn kind(&self) -> BackendKind {
    BackendKind::Flat
  }

  fn capabilities(&self) -> Capabilities {
    Capabilities::ALL
  }

  fn get_all(&self, collection: Collection) -> StoreResult<Vec<Record>> {
    self.load(collection)
  }

  fn add(&self, collection: Collection, mut record: Record) -> StoreResult<Record> {
    record.ensure_date(now_millis());
    if record.id.is_none() {
      record.id = Some(self.ids.next_id());
    }
    self.upsert(collection, record)
  }

  fn put(&self, collection: Collection, record: Record) -> StoreResult<Record> {
    if record.id.is_none() {
      return Err(StoreError::InvalidArgument(format!(
        "put into `{collection}` requires a record id"
      )));
    }
    self.upsert(collection, record)
  }

  fn delete(&self, collection: Collection, id: RecordId) -> StoreResult<()> {
    let _writer = lock(&self.writer)?;
    let mut records = self.load(collection)?;
    let before = records.len();
    records.retain(|r| r.id != Some(id));
    if records.len() != before {
      self.save(collection, &records)?;
    }
    Ok(())
  }

  fn clear(&self, collection: Collection) -> StoreResult<()> {
    let _writer = lock(&self.writer)?;
    self.kv.remove_item(&Self::key(collection))
  }
}

fn lock<T>(mutex: &Mutex<T>) -> StoreResult<std::sync::MutexGuard<'_, T>> {
  mutex
    .lock()
    .map_err(|e| StoreError::Task(format!("key-value lock poisoned: {e}")))
}
