//! Install/activate sequencing for versioned cache deployments.
//!
//! A [`Worker`] owns one cache version. The [`LifecycleManager`] moves
//! workers through `Installing → Waiting → Active`:
//! - install precaches the shell manifest; any failed asset aborts the
//!   install and leaves the previous version active
//! - a waiting worker activates when it asked to skip waiting, when the
//!   `SKIP_WAITING` message arrives, or when no client is left on the old one
//! - activation prunes every partition the new version does not own, enables
//!   navigation preload and claims every connected [`Client`]

use color_eyre::{eyre::eyre, Result};
use futures::future::{try_join_all, FutureExt};
use serde::Deserialize;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock, Weak};
use tracing::{debug, info, warn};

use super::http::{FetchOptions, Fetcher, Request, Response};
use super::router::{FetchEvent, FetchRouter, PreloadResponse};
use super::storage::CacheStorage;
use super::traits::Served;
use super::versions::{CacheVersionSet, Manifest};
use crate::config::CacheConfig;

/// Where a worker is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleState {
  Parsed,
  Installing,
  Waiting,
  Active,
  /// Failed to install, or replaced by a newer version.
  Redundant,
}

/// Messages accepted from the page side.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ControlMessage {
  SkipWaiting,
  #[serde(other)]
  Unknown,
}

/// One deployable cache version and its router.
pub struct Worker {
  router: FetchRouter,
  state: Mutex<LifecycleState>,
  skip_waiting: AtomicBool,
}

impl Worker {
  pub fn new(router: FetchRouter) -> Self {
    Self {
      router,
      state: Mutex::new(LifecycleState::Parsed),
      skip_waiting: AtomicBool::new(false),
    }
  }

  /// Worker for the version described by `config`.
  pub fn from_config(
    config: &CacheConfig,
    storage: Arc<dyn CacheStorage>,
    fetcher: Arc<dyn Fetcher>,
  ) -> Result<Self> {
    let versions = CacheVersionSet::new(&config.prefix, &config.version);
    let manifest = Manifest::from_config(config)?;
    let router = FetchRouter::new(storage, fetcher, versions, manifest)
      .with_limits(config.runtime_max_entries, config.api_max_entries);
    let worker = Self::new(router);
    if config.skip_waiting_on_install {
      worker.skip_waiting();
    }
    Ok(worker)
  }

  pub fn version(&self) -> &str {
    self.router.versions().version()
  }

  pub fn router(&self) -> &FetchRouter {
    &self.router
  }

  pub fn state(&self) -> LifecycleState {
    *self.lock_state()
  }

  /// Ask to be activated as soon as installation finishes.
  pub fn skip_waiting(&self) {
    self.skip_waiting.store(true, Ordering::SeqCst);
  }

  fn wants_skip_waiting(&self) -> bool {
    self.skip_waiting.load(Ordering::SeqCst)
  }

  fn set_state(&self, state: LifecycleState) {
    *self.lock_state() = state;
  }

  fn lock_state(&self) -> MutexGuard<'_, LifecycleState> {
    self.state.lock().unwrap_or_else(PoisonError::into_inner)
  }

  /// Fetch the whole manifest, then write it into the static partition.
  ///
  /// Nothing is written unless every asset was fetched with a 2xx status.
  async fn precache(&self) -> Result<usize> {
    let manifest = self.router.manifest();
    let fetcher = self.router.fetcher();
    let storage = self.router.storage();
    let partition = self.router.versions().static_name();

    let requests = manifest
      .precache
      .iter()
      .map(|path| {
        manifest
          .resolve(path)
          .map(Request::get)
          .map_err(|e| eyre!("Invalid precache path {}: {}", path, e))
      })
      .collect::<Result<Vec<_>>>()?;

    let fetched = try_join_all(requests.into_iter().map(|request| async move {
      let response = fetcher.fetch(&request, FetchOptions::default()).await?;
      if !response.is_ok() {
        return Err(eyre!(
          "Precache of {} returned status {}",
          request.url,
          response.status
        ));
      }
      Ok::<_, color_eyre::Report>((request, response))
    }))
    .await?;

    let existed = storage.has_partition(partition)?;
    storage.open_partition(partition)?;
    for (request, response) in &fetched {
      if let Err(err) = storage.put(partition, &request.cache_key(), response) {
        if !existed {
          let _ = storage.delete_partition(partition);
        }
        return Err(err);
      }
    }
    Ok(fetched.len())
  }

  /// Delete every partition this version does not own.
  pub fn prune(&self) -> Result<Vec<String>> {
    let storage = self.router.storage();
    let versions = self.router.versions();
    let mut pruned = Vec::new();
    for name in storage.partition_names()? {
      if !versions.owns(&name) && storage.delete_partition(&name)? {
        pruned.push(name);
      }
    }
    Ok(pruned)
  }
}

struct ClientSlot {
  id: u64,
  controller: RwLock<Option<Arc<Worker>>>,
}

struct Shared {
  fetcher: Arc<dyn Fetcher>,
  preload_supported: bool,
  preload_enabled: AtomicBool,
  active: RwLock<Option<Arc<Worker>>>,
  waiting: RwLock<Option<Arc<Worker>>>,
  clients: Mutex<Vec<Weak<ClientSlot>>>,
  next_client_id: AtomicU64,
}

/// Registration holding the active and waiting workers.
#[derive(Clone)]
pub struct LifecycleManager {
  shared: Arc<Shared>,
}

impl LifecycleManager {
  /// `fetcher` serves clients that have no controller yet and navigation
  /// preloads. `preload_supported` gates navigation preload.
  pub fn new(fetcher: Arc<dyn Fetcher>, preload_supported: bool) -> Self {
    Self {
      shared: Arc::new(Shared {
        fetcher,
        preload_supported,
        preload_enabled: AtomicBool::new(false),
        active: RwLock::new(None),
        waiting: RwLock::new(None),
        clients: Mutex::new(Vec::new()),
        next_client_id: AtomicU64::new(1),
      }),
    }
  }

  pub fn active(&self) -> Option<Arc<Worker>> {
    read(&self.shared.active).clone()
  }

  pub fn waiting(&self) -> Option<Arc<Worker>> {
    read(&self.shared.waiting).clone()
  }

  pub fn navigation_preload_enabled(&self) -> bool {
    self.shared.preload_enabled.load(Ordering::SeqCst)
  }

  /// Install `worker` and activate it if nothing holds it back.
  ///
  /// On failure the worker becomes redundant and the active version is
  /// left untouched.
  pub async fn install(&self, worker: Arc<Worker>) -> Result<LifecycleState> {
    worker.set_state(LifecycleState::Installing);
    info!(version = worker.version(), "installing cache version");

    let count = match worker.precache().await {
      Ok(count) => count,
      Err(err) => {
        worker.set_state(LifecycleState::Redundant);
        warn!(version = worker.version(), error = %err, "cache install failed");
        return Err(err);
      }
    };

    worker.set_state(LifecycleState::Waiting);
    if let Some(previous) = write(&self.shared.waiting).replace(Arc::clone(&worker)) {
      previous.set_state(LifecycleState::Redundant);
    }
    info!(version = worker.version(), precached = count, "cache version installed");

    let no_active = self.active().is_none();
    if no_active || worker.wants_skip_waiting() || self.live_clients() == 0 {
      self.activate_waiting();
    }
    Ok(worker.state())
  }

  /// Resume a version installed by an earlier process without re-fetching
  /// its manifest.
  pub fn restore(&self, worker: Arc<Worker>) {
    worker.set_state(LifecycleState::Active);
    self.enable_navigation_preload();
    if let Some(previous) = write(&self.shared.active).replace(Arc::clone(&worker)) {
      previous.set_state(LifecycleState::Redundant);
    }
    self.claim(&worker);
    debug!(version = worker.version(), "cache version restored");
  }

  /// Activate the waiting worker now. Returns whether one was waiting.
  pub fn skip_waiting(&self) -> bool {
    match self.waiting() {
      Some(worker) => {
        worker.skip_waiting();
        self.activate_waiting();
        true
      }
      None => false,
    }
  }

  /// Handle a JSON control message from a client.
  pub fn handle_message(&self, raw: &str) -> Result<bool> {
    let message: ControlMessage =
      serde_json::from_str(raw).map_err(|e| eyre!("Invalid control message: {}", e))?;
    match message {
      ControlMessage::SkipWaiting => Ok(self.skip_waiting()),
      ControlMessage::Unknown => {
        debug!(raw, "ignoring unknown control message");
        Ok(false)
      }
    }
  }

  /// Register a new client, controlled by the active worker if any.
  pub fn connect(&self) -> Client {
    let slot = Arc::new(ClientSlot {
      id: self.shared.next_client_id.fetch_add(1, Ordering::SeqCst),
      controller: RwLock::new(self.active()),
    });
    lock(&self.shared.clients).push(Arc::downgrade(&slot));
    Client {
      slot,
      manager: self.clone(),
    }
  }

  fn activate_waiting(&self) {
    let Some(worker) = write(&self.shared.waiting).take() else {
      return;
    };

    let pruned = match worker.prune() {
      Ok(pruned) => pruned,
      Err(err) => {
        warn!(version = worker.version(), error = %err, "pruning old cache versions failed");
        Vec::new()
      }
    };
    self.enable_navigation_preload();

    if let Some(previous) = write(&self.shared.active).replace(Arc::clone(&worker)) {
      previous.set_state(LifecycleState::Redundant);
    }
    worker.set_state(LifecycleState::Active);
    let claimed = self.claim(&worker);

    info!(
      version = worker.version(),
      pruned = ?pruned,
      claimed,
      "cache version activated"
    );
  }

  fn enable_navigation_preload(&self) {
    if self.shared.preload_supported {
      self.shared.preload_enabled.store(true, Ordering::SeqCst);
    } else {
      debug!("navigation preload unsupported, skipping");
    }
  }

  /// Point every connected client at `worker`. Returns how many were claimed.
  fn claim(&self, worker: &Arc<Worker>) -> usize {
    let mut clients = lock(&self.shared.clients);
    clients.retain(|slot| slot.strong_count() > 0);
    let mut claimed = 0;
    for slot in clients.iter().filter_map(Weak::upgrade) {
      *write(&slot.controller) = Some(Arc::clone(worker));
      claimed += 1;
    }
    claimed
  }

  fn live_clients(&self) -> usize {
    lock(&self.shared.clients)
      .iter()
      .filter(|slot| slot.strong_count() > 0)
      .count()
  }

  fn release(&self, id: u64) {
    let remaining = {
      let mut clients = lock(&self.shared.clients);
      clients.retain(|slot| slot.upgrade().is_some_and(|s| s.id != id));
      clients.len()
    };
    if remaining == 0 && self.waiting().is_some() {
      debug!("last client released, activating waiting version");
      self.activate_waiting();
    }
  }
}

/// A consumer whose requests route through its controlling worker.
pub struct Client {
  slot: Arc<ClientSlot>,
  manager: LifecycleManager,
}

impl Client {
  pub fn id(&self) -> u64 {
    self.slot.id
  }

  /// Version of the worker currently controlling this client.
  pub fn controller_version(&self) -> Option<String> {
    read(&self.slot.controller)
      .as_ref()
      .map(|w| w.version().to_string())
  }

  pub async fn fetch(&self, request: Request) -> Served {
    let controller = read(&self.slot.controller).clone();
    let shared = &self.manager.shared;

    let Some(worker) = controller else {
      return match shared.fetcher.fetch(&request, FetchOptions::default()).await {
        Ok(response) => Served::network(response),
        Err(err) => {
          debug!(url = %request.url, error = %err, "uncontrolled request failed");
          Served::placeholder(Response::offline_page())
        }
      };
    };

    let mut event = FetchEvent::new(request);
    if event.request.is_navigation() && self.manager.navigation_preload_enabled() {
      let preload = start_preload(Arc::clone(&shared.fetcher), event.request.clone());
      event = event.with_preload(preload);
    }
    worker.router().handle(event).await
  }
}

impl Drop for Client {
  fn drop(&mut self) {
    self.manager.release(self.slot.id);
  }
}

/// Start the navigation request right away, alongside routing.
fn start_preload(fetcher: Arc<dyn Fetcher>, request: Request) -> PreloadResponse {
  let handle =
    tokio::spawn(async move { fetcher.fetch(&request, FetchOptions::default()).await });
  async move {
    handle
      .await
      .map_err(|e| eyre!("Navigation preload task failed: {}", e))?
      .map(Some)
  }
  .boxed()
}

fn read<T>(lock: &RwLock<T>) -> std::sync::RwLockReadGuard<'_, T> {
  lock.read().unwrap_or_else(PoisonError::into_inner)
}

fn write<T>(lock: &RwLock<T>) -> std::sync::RwLockWriteGuard<'_, T> {
  lock.write().unwrap_or_else(PoisonError::into_inner)
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
  mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
