//! The CRUD contract shared by every record backend.

use serde::Serialize;
use std::fmt::{Display, Formatter};

use super::error::StoreResult;
use super::record::{Collection, Record, RecordId};

/// Which concrete engine serves a facade.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
  /// Keyed store with per-collection transactions (SQLite).
  Transactional,
  /// Whole-collection serialize/deserialize over a flat key-value store.
  Flat,
}

impl Display for BackendKind {
  fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
    match self {
      Self::Transactional => f.write_str("transactional"),
      Self::Flat => f.write_str("flat"),
    }
  }
}

/// Operations a backend reports it can serve.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Capabilities {
  pub get_all: bool,
  pub add: bool,
  pub put: bool,
  pub delete: bool,
}

impl Capabilities {
  pub const ALL: Capabilities = Capabilities {
    get_all: true,
    add: true,
    put: true,
    delete: true,
  };

  pub const NONE: Capabilities = Capabilities {
    get_all: false,
    add: false,
    put: false,
    delete: false,
  };

  /// A backend is only usable when it serves all four operations.
  pub fn is_complete(&self) -> bool {
    self.get_all && self.add && self.put && self.delete
  }
}

/// Storage engine behind the facade.
///
/// Calls are blocking; the facade moves them onto the blocking pool.
pub trait RecordBackend: Send + Sync {
  fn kind(&self) -> BackendKind;

  /// Probe what this backend can serve in the current environment.
  fn capabilities(&self) -> Capabilities;

  /// All records of a collection, empty when the collection holds none.
  fn get_all(&self, collection: Collection) -> StoreResult<Vec<Record>>;

  /// Insert a record, assigning an id when it has none.
  fn add(&self, collection: Collection, record: Record) -> StoreResult<Record>;

  /// Replace the record with the same id, or append it. Requires an id.
  fn put(&self, collection: Collection, record: Record) -> StoreResult<Record>;

  /// Remove a record. Absent ids are a no-op.
  fn delete(&self, collection: Collection, id: RecordId) -> StoreResult<()>;

  /// Remove every record of a collection.
  fn clear(&self, collection: Collection) -> StoreResult<()>;
}
