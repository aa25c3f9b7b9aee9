//! Command-line handlers and collection-name lookup.

use color_eyre::{eyre::eyre, Result};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use url::Url;

use crate::cache::{
  CacheStorage, Fetcher, HttpFetcher, LifecycleManager, Request, SqliteStorage, Worker,
};
use crate::config::Config;
use crate::store::{parse_snapshot, Collection, Record, RecordId, StorageFacade};

/// Cache database file, kept next to the record store by default.
pub const CACHE_DB_FILE_NAME: &str = "cache.db";

/// Short names accepted on the command line for each collection.
pub const COLLECTION_ALIASES: &[(Collection, &[&str])] = &[
  (Collection::Journal, &["j", "entries"]),
  (Collection::Tasks, &["t", "task", "todo"]),
  (Collection::Habits, &["h", "habit"]),
  (Collection::Metrics, &["m", "metric"]),
  (Collection::Mood, &["moods"]),
  (Collection::Goals, &["g", "goal"]),
  (Collection::Resources, &["r", "resource", "links"]),
  (Collection::Files, &["f", "file"]),
  (Collection::Nutrition, &["n", "food", "meals"]),
  (Collection::FocusSessions, &["focus", "fs", "sessions"]),
];

/// Resolve a collection from its name, an alias, or an unambiguous prefix.
pub fn resolve_collection(input: &str) -> Result<Collection> {
  let input_lower = input.to_lowercase();
  if input_lower.is_empty() {
    return Err(eyre!("Collection name is empty"));
  }

  let mut matches: Vec<(Collection, u32)> = Vec::new();
  for &(collection, aliases) in COLLECTION_ALIASES {
    let name = collection.name().to_lowercase();

    // Exact match on name
    if name == input_lower {
      matches.push((collection, 0));
      continue;
    }

    // Exact match on alias
    if aliases.contains(&input_lower.as_str()) {
      matches.push((collection, 1));
      continue;
    }

    // Prefix match on name
    if name.starts_with(&input_lower) {
      matches.push((collection, 2));
    }
  }

  matches.sort_by_key(|(_, priority)| *priority);
  match matches.as_slice() {
    [] => Err(eyre!("Unknown collection: {}", input)),
    [(only, _)] => Ok(*only),
    [(first, p1), (_, p2), ..] if p1 < p2 => Ok(*first),
    _ => Err(eyre!(
      "Ambiguous collection {}: matches {}",
      input,
      matches
        .iter()
        .map(|(c, _)| c.name())
        .collect::<Vec<_>>()
        .join(", ")
    )),
  }
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
  let out = serde_json::to_string_pretty(value)
    .map_err(|e| eyre!("Failed to serialize output: {}", e))?;
  println!("{}", out);
  Ok(())
}

fn parse_record(json: &str) -> Result<Record> {
  let value: serde_json::Value =
    serde_json::from_str(json).map_err(|e| eyre!("Invalid record JSON: {}", e))?;
  Ok(Record::from_value(value)?)
}

pub async fn records_list(config: &Config, collection: &str) -> Result<()> {
  let facade = StorageFacade::open(&config.storage)?;
  let records = facade.get_all(resolve_collection(collection)?).await?;
  print_json(&records)
}

pub async fn records_add(config: &Config, collection: &str, json: &str) -> Result<()> {
  let facade = StorageFacade::open(&config.storage)?;
  let record = facade
    .add(resolve_collection(collection)?, parse_record(json)?)
    .await?;
  print_json(&record)
}

pub async fn records_put(config: &Config, collection: &str, json: &str) -> Result<()> {
  let facade = StorageFacade::open(&config.storage)?;
  let record = facade
    .put(resolve_collection(collection)?, parse_record(json)?)
    .await?;
  print_json(&record)
}

pub async fn records_del(config: &Config, collection: &str, id: RecordId) -> Result<()> {
  let facade = StorageFacade::open(&config.storage)?;
  facade.del(resolve_collection(collection)?, id).await?;
  Ok(())
}

pub async fn records_clear(config: &Config, collection: &str) -> Result<()> {
  let facade = StorageFacade::open(&config.storage)?;
  facade.clear(resolve_collection(collection)?).await?;
  Ok(())
}

pub async fn records_export(config: &Config, output: Option<&Path>) -> Result<()> {
  let facade = StorageFacade::open(&config.storage)?;
  let snapshot = facade.export_all().await?;
  match output {
    Some(path) => {
      let json = serde_json::to_vec_pretty(&snapshot)
        .map_err(|e| eyre!("Failed to serialize snapshot: {}", e))?;
      std::fs::write(path, json)
        .map_err(|e| eyre!("Failed to write snapshot {}: {}", path.display(), e))?;
      Ok(())
    }
    None => print_json(&snapshot),
  }
}

pub async fn records_import(config: &Config, input: &Path, wipe: bool) -> Result<()> {
  let contents = std::fs::read(input)
    .map_err(|e| eyre!("Failed to read snapshot {}: {}", input.display(), e))?;
  let snapshot = parse_snapshot(&contents)
    .map_err(|e| eyre!("Failed to parse snapshot {}: {}", input.display(), e))?;

  let facade = StorageFacade::open(&config.storage)?;
  let imported = facade.import_all(snapshot, wipe).await?;
  print_json(&serde_json::json!({ "imported": imported }))
}

fn cache_storage(config: &Config) -> Result<Arc<dyn CacheStorage>> {
  let path: PathBuf = config.cache_dir().join(CACHE_DB_FILE_NAME);
  Ok(Arc::new(SqliteStorage::open(&path)?))
}

type CacheParts = (Arc<dyn CacheStorage>, Arc<dyn Fetcher>, LifecycleManager);

fn cache_manager(config: &Config) -> Result<CacheParts> {
  let storage = cache_storage(config)?;
  let fetcher: Arc<dyn Fetcher> = Arc::new(HttpFetcher::new()?);
  let manager = LifecycleManager::new(Arc::clone(&fetcher), config.cache.navigation_preload);
  Ok((storage, fetcher, manager))
}

pub async fn cache_install(config: &Config) -> Result<()> {
  let (storage, fetcher, manager) = cache_manager(config)?;
  let worker = Arc::new(Worker::from_config(&config.cache, storage, fetcher)?);
  let state = manager.install(Arc::clone(&worker)).await?;
  print_json(&serde_json::json!({
    "version": worker.version(),
    "state": format!("{:?}", state),
  }))
}

pub fn cache_prune(config: &Config) -> Result<()> {
  let storage = cache_storage(config)?;
  let fetcher: Arc<dyn Fetcher> = Arc::new(HttpFetcher::new()?);
  let worker = Worker::from_config(&config.cache, storage, fetcher)?;
  print_json(&worker.prune()?)
}

pub async fn cache_fetch(config: &Config, url: &str, navigate: bool) -> Result<()> {
  let url = Url::parse(url).map_err(|e| eyre!("Invalid URL {}: {}", url, e))?;
  let (storage, fetcher, manager) = cache_manager(config)?;
  manager.restore(Arc::new(Worker::from_config(&config.cache, storage, fetcher)?));

  let request = if navigate {
    Request::navigate(url)
  } else {
    Request::get(url)
  };
  let client = manager.connect();
  let served = client.fetch(request).await;
  print_json(&serde_json::json!({
    "status": served.response.status,
    "source": format!("{:?}", served.source),
    "bytes": served.response.body.len(),
  }))
}

pub fn cache_partitions(config: &Config) -> Result<()> {
  let storage = cache_storage(config)?;
  let mut partitions = serde_json::Map::new();
  for name in storage.partition_names()? {
    let entries = storage.keys(&name)?.len();
    partitions.insert(name, entries.into());
  }
  print_json(&partitions)
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_exact_name() {
    assert_eq!(resolve_collection("tasks").unwrap(), Collection::Tasks);
    assert_eq!(
      resolve_collection("focusSessions").unwrap(),
      Collection::FocusSessions
    );
  }

  #[test]
  fn test_alias() {
    assert_eq!(resolve_collection("fs").unwrap(), Collection::FocusSessions);
    assert_eq!(resolve_collection("todo").unwrap(), Collection::Tasks);
  }

  #[test]
  fn test_unique_prefix() {
    assert_eq!(resolve_collection("nut").unwrap(), Collection::Nutrition);
    assert_eq!(resolve_collection("JOUR").unwrap(), Collection::Journal);
  }

  #[test]
  fn test_alias_beats_prefix() {
    // "m" is the metrics alias and a prefix of mood/metrics
    assert_eq!(resolve_collection("m").unwrap(), Collection::Metrics);
  }

  #[test]
  fn test_shared_prefix_narrowed() {
    assert_eq!(resolve_collection("mo").unwrap(), Collection::Mood);
    assert_eq!(resolve_collection("fi").unwrap(), Collection::Files);
  }

  #[test]
  fn test_unknown() {
    assert!(resolve_collection("workouts").is_err());
    assert!(resolve_collection("").is_err());
  }
}
