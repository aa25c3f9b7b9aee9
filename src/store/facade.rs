//! Backend-agnostic CRUD entry point used by all feature logic.

use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{info, warn};

use super::error::{StoreError, StoreResult};
use super::flat::{FileKv, FlatBackend};
use super::record::{Collection, Record, RecordId};
use super::sqlite::{SqliteBackend, DB_FILE_NAME};
use super::traits::{BackendKind, RecordBackend};
use crate::config::{BackendPreference, StorageConfig};

/// Every collection with its records, as produced by [`StorageFacade::export_all`].
pub type Snapshot = BTreeMap<Collection, Vec<Record>>;

/// Parse an exported snapshot. Keys that name no known collection are
/// skipped.
pub fn parse_snapshot(json: &[u8]) -> StoreResult<Snapshot> {
  let raw: BTreeMap<String, Value> = serde_json::from_slice(json)?;
  let mut snapshot = Snapshot::new();
  for (name, records) in raw {
    match name.parse::<Collection>() {
      Ok(collection) => {
        snapshot.insert(collection, serde_json::from_value(records)?);
      }
      Err(_) => warn!(collection = %name, "skipping unknown collection in snapshot"),
    }
  }
  Ok(snapshot)
}

/// File name of the flat backend's key-value file inside the data directory.
pub const FLAT_FILE_NAME: &str = "records.json";

/// Unified record storage.
///
/// The backend is chosen once, at construction; callers never learn which
/// one served a call.
#[derive(Clone)]
pub struct StorageFacade {
  backend: Arc<dyn RecordBackend>,
}

impl StorageFacade {
  /// Pick `primary` when it reports all four capabilities, else build the
  /// fallback. The fallback is only constructed when it is chosen.
  pub fn select<F>(primary: Option<Arc<dyn RecordBackend>>, fallback: F) -> StoreResult<Self>
  where
    F: FnOnce() -> StoreResult<Arc<dyn RecordBackend>>,
  {
    let backend = match primary {
      Some(primary) if primary.capabilities().is_complete() => primary,
      Some(primary) => {
        warn!(
          rejected = %primary.kind(),
          "transactional backend unavailable, using flat fallback"
        );
        fallback()?
      }
      None => fallback()?,
    };
    info!(backend = %backend.kind(), "record storage selected");
    Ok(Self { backend })
  }

  /// Build the facade described by `config`.
  pub fn open(config: &StorageConfig) -> StoreResult<Self> {
    let data_dir = config.data_dir();
    let flat = || -> StoreResult<Arc<dyn RecordBackend>> {
      let kv = FileKv::open(data_dir.join(FLAT_FILE_NAME))?;
      Ok(Arc::new(FlatBackend::new(kv)))
    };

    match config.backend {
      BackendPreference::Flat => Self::select(None, flat),
      BackendPreference::Sqlite => Ok(Self {
        backend: Arc::new(SqliteBackend::new(data_dir.join(DB_FILE_NAME))),
      }),
      BackendPreference::Auto => Self::select(
        Some(Arc::new(SqliteBackend::new(data_dir.join(DB_FILE_NAME)))),
        flat,
      ),
    }
  }

  pub fn backend_kind(&self) -> BackendKind {
    self.backend.kind()
  }

  /// All records of `collection`; empty when there are none.
  pub async fn get_all(&self, collection: Collection) -> StoreResult<Vec<Record>> {
    self.run(move |b| b.get_all(collection)).await
  }

  /// Insert `record`, returning it with its assigned id.
  pub async fn add(&self, collection: Collection, record: Record) -> StoreResult<Record> {
    self.run(move |b| b.add(collection, record)).await
  }

  /// Upsert `record` by id. Fails with `InvalidArgument` when the id is missing.
  pub async fn put(&self, collection: Collection, record: Record) -> StoreResult<Record> {
    if record.id.is_none() {
      return Err(StoreError::InvalidArgument(format!(
        "put into `{collection}` requires a record id"
      )));
    }
    self.run(move |b| b.put(collection, record)).await
  }

  /// Remove the record with `id`; absent ids are ignored.
  pub async fn del(&self, collection: Collection, id: RecordId) -> StoreResult<()> {
    self.run(move |b| b.delete(collection, id)).await
  }

  pub async fn clear(&self, collection: Collection) -> StoreResult<()> {
    self.run(move |b| b.clear(collection)).await
  }

  /// Dump every collection.
  pub async fn export_all(&self) -> StoreResult<Snapshot> {
    self
      .run(|b| {
        Collection::ALL
          .into_iter()
          .map(|c| -> StoreResult<(Collection, Vec<Record>)> { Ok((c, b.get_all(c)?)) })
          .collect()
      })
      .await
  }

  /// Load a snapshot, optionally wiping each imported collection first.
  ///
  /// Records carrying an id are upserted; records without one are added.
  /// Returns the number of records written.
  pub async fn import_all(&self, snapshot: Snapshot, wipe: bool) -> StoreResult<usize> {
    let written = self
      .run(move |b| {
        let mut written = 0usize;
        for (collection, records) in snapshot {
          if wipe {
            b.clear(collection)?;
          }
          for record in records {
            if record.id.is_some() {
              b.put(collection, record)?;
            } else {
              b.add(collection, record)?;
            }
            written += 1;
          }
        }
        Ok(written)
      })
      .await?;
    info!(written, wipe, "snapshot imported");
    Ok(written)
  }

  async fn run<T, F>(&self, op: F) -> StoreResult<T>
  where
    T: Send + 'static,
    F: FnOnce(&dyn RecordBackend) -> StoreResult<T> + Send + 'static,
  {
    let backend = Arc::clone(&self.backend);
    tokio::task::spawn_blocking(move || op(backend.as_ref()))
      .await
      .map_err(|e| StoreError::Task(e.to_string()))?
  }
}
