//! Oldest-first bounding of a cache partition.

use color_eyre::Result;
use tracing::debug;

use super::storage::CacheStorage;

/// Keeps a partition at or below `max_entries` by deleting the entries that
/// were inserted first. Reads do not refresh an entry's position.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EvictionPolicy {
  max_entries: usize,
}

impl EvictionPolicy {
  pub fn new(max_entries: usize) -> Self {
    Self { max_entries }
  }

  /// Trim `partition`, returning how many entries were removed.
  pub fn apply(&self, storage: &dyn CacheStorage, partition: &str) -> Result<usize> {
    let mut removed = 0;
    loop {
      let keys = storage.keys(partition)?;
      if keys.len() <= self.max_entries {
        break;
      }
      if !storage.delete(partition, &keys[0])? {
        // Someone else removed it between the two calls; re-read.
        continue;
      }
      removed += 1;
    }
    if removed > 0 {
      debug!(partition, removed, max = self.max_entries, "cache partition trimmed");
    }
    Ok(removed)
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::cache::http::Response;
  use crate::cache::storage::{MemoryStorage, SqliteStorage};

  fn fill(storage: &dyn CacheStorage, n: usize) {
    for i in 0..n {
      storage
        .put("p", &format!("k{i}"), &Response::new(200, Vec::new()))
        .unwrap();
    }
  }

  #[test]
  fn test_keeps_most_recent_entries() {
    let storages: Vec<Box<dyn CacheStorage>> = vec![
      Box::new(MemoryStorage::new()),
      Box::new(SqliteStorage::in_memory().unwrap()),
    ];
    for storage in storages {
      fill(storage.as_ref(), 12);
      let removed = EvictionPolicy::new(5).apply(storage.as_ref(), "p").unwrap();
      assert_eq!(removed, 7);
      assert_eq!(
        storage.keys("p").unwrap(),
        vec!["k7", "k8", "k9", "k10", "k11"]
      );
    }
  }

  #[test]
  fn test_is_idempotent() {
    let storage = MemoryStorage::new();
    fill(&storage, 4);
    let policy = EvictionPolicy::new(2);
    assert_eq!(policy.apply(&storage, "p").unwrap(), 2);
    assert_eq!(policy.apply(&storage, "p").unwrap(), 0);
    assert_eq!(storage.keys("p").unwrap(), vec!["k2", "k3"]);
  }

  #[test]
  fn test_reads_do_not_refresh_recency() {
    let storage = MemoryStorage::new();
    fill(&storage, 3);
    storage.get("p", "k0").unwrap();
    EvictionPolicy::new(2).apply(&storage, "p").unwrap();
    assert_eq!(storage.keys("p").unwrap(), vec!["k1", "k2"]);
  }

  #[test]
  fn test_missing_partition_is_fine() {
    let storage = MemoryStorage::new();
    assert_eq!(EvictionPolicy::new(0).apply(&storage, "none").unwrap(), 0);
  }
}
