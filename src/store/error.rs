//! Error taxonomy for record storage.

use std::error::Error;
use std::fmt::{Display, Formatter};

use super::record::Collection;

pub type StoreResult<T> = Result<T, StoreError>;

#[derive(Debug)]
pub enum StoreError {
  /// The caller passed something the contract rejects (missing id on upsert,
  /// unknown collection name).
  InvalidArgument(String),
  /// A transaction was aborted or failed to commit. Nothing was changed.
  TransactionFailure {
    collection: Collection,
    detail: String,
  },
  /// The backend could not be opened or its schema could not be applied.
  Open(rusqlite::Error),
  UnsupportedSchemaVersion {
    db_version: u32,
    latest_supported: u32,
  },
  Serialization(serde_json::Error),
  Io(std::io::Error),
  /// The blocking task running a backend call was cancelled or panicked.
  Task(String),
}

impl StoreError {
  pub fn transaction(collection: Collection, err: impl Display) -> Self {
    Self::TransactionFailure {
      collection,
      detail: err.to_string(),
    }
  }
}

impl Display for StoreError {
  fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
    match self {
      Self::InvalidArgument(msg) => write!(f, "invalid argument: {msg}"),
      Self::TransactionFailure { collection, detail } => {
        write!(f, "transaction on `{collection}` failed: {detail}")
      }
      Self::Open(err) => write!(f, "failed to open record store: {err}"),
      Self::UnsupportedSchemaVersion {
        db_version,
        latest_supported,
      } => write!(
        f,
        "record store schema version {db_version} is newer than supported {latest_supported}"
      ),
      Self::Serialization(err) => write!(f, "record serialization failed: {err}"),
      Self::Io(err) => write!(f, "record store I/O failed: {err}"),
      Self::Task(msg) => write!(f, "storage task failed: {msg}"),
    }
  }
}

impl Error for StoreError {
  fn source(&self) -> Option<&(dyn Error + 'static)> {
    match self {
      Self::Open(err) => Some(err),
      Self::Serialization(err) => Some(err),
      Self::Io(err) => Some(err),
      Self::InvalidArgument(_)
      | Self::TransactionFailure { .. }
      | Self::UnsupportedSchemaVersion { .. }
      | Self::Task(_) => None,
    }
  }
}

impl From<serde_json::Error> for StoreError {
  fn from(value: serde_json::Error) -> Self {
    Self::Serialization(value)
  }
}

impl From<std::io::Error> for StoreError {
  fn from(value: std::io::Error) -> Self {
    Self::Io(value)
  }
}
