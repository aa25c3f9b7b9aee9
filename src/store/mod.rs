//! Offline record storage.
//!
//! This module provides the persistence layer every feature writes through:
//! - A fixed set of collections holding JSON-shaped records keyed by `id`
//! - A transactional SQLite backend with a non-destructive schema upgrade
//! - A flat key-value fallback that emulates the same contract
//! - [`StorageFacade`], which picks one backend at construction and exposes
//!   `get_all` / `add` / `put` / `del`

mod error;
mod facade;
pub mod flat;
mod record;
pub mod sqlite;
mod traits;

pub use error::{StoreError, StoreResult};
pub use facade::{parse_snapshot, Snapshot, StorageFacade};
pub use record::{now_millis, Collection, Record, RecordId, DATE_FIELD};
pub use traits::{BackendKind, Capabilities, RecordBackend};
