//! Request classification and the four caching strategies.
//!
//! Every GET request is routed to exactly one policy:
//! 1. Navigations: network (or preload) first, then exact cache match, then shell
//! 2. Allow-listed API hosts: network first, then cache, then an offline payload
//! 3. Same-origin static assets: stale-while-revalidate
//! 4. Other same-origin requests: cache first, refreshed in the background
//!
//! Anything else goes straight to the network without touching the cache.
//! Cache writes are best-effort and never change the response returned.

use color_eyre::Result;
use futures::future::BoxFuture;
use reqwest::Method;
use std::sync::Arc;
use tracing::{debug, warn};

use super::eviction::EvictionPolicy;
use super::http::{FetchOptions, Fetcher, Request, Response};
use super::storage::CacheStorage;
use super::traits::Served;
use super::versions::{CacheVersionSet, Manifest};
use crate::config::{DEFAULT_API_MAX_ENTRIES, DEFAULT_RUNTIME_MAX_ENTRIES};

/// Policy chosen for a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Route {
  /// Not cached at all: non-GET or foreign, non-API hosts.
  Passthrough,
  Navigation,
  Api,
  StaticAsset,
  SameOrigin,
}

/// Result of a navigation preload: `Ok(None)` when no preload response is
/// available.
pub type PreloadResponse = BoxFuture<'static, Result<Option<Response>>>;

/// A request to serve, optionally with a preload already in flight.
pub struct FetchEvent {
  pub request: Request,
  pub preload: Option<PreloadResponse>,
}

impl FetchEvent {
  pub fn new(request: Request) -> Self {
    Self {
      request,
      preload: None,
    }
  }

  pub fn with_preload(mut self, preload: PreloadResponse) -> Self {
    self.preload = Some(preload);
    self
  }
}

/// Routes requests for one cache version.
///
/// Cheap to clone; clones share storage and network.
#[derive(Clone)]
pub struct FetchRouter {
  storage: Arc<dyn CacheStorage>,
  fetcher: Arc<dyn Fetcher>,
  versions: Arc<CacheVersionSet>,
  manifest: Arc<Manifest>,
  runtime_policy: EvictionPolicy,
  api_policy: EvictionPolicy,
}

impl FetchRouter {
  pub fn new(
    storage: Arc<dyn CacheStorage>,
    fetcher: Arc<dyn Fetcher>,
    versions: CacheVersionSet,
    manifest: Manifest,
  ) -> Self {
    Self {
      storage,
      fetcher,
      versions: Arc::new(versions),
      manifest: Arc::new(manifest),
      runtime_policy: EvictionPolicy::new(DEFAULT_RUNTIME_MAX_ENTRIES),
      api_policy: EvictionPolicy::new(DEFAULT_API_MAX_ENTRIES),
    }
  }

  /// Override the entry bounds of the runtime and api partitions.
  pub fn with_limits(mut self, runtime_max_entries: usize, api_max_entries: usize) -> Self {
    self.runtime_policy = EvictionPolicy::new(runtime_max_entries);
    self.api_policy = EvictionPolicy::new(api_max_entries);
    self
  }

  pub fn versions(&self) -> &CacheVersionSet {
    &self.versions
  }

  pub fn manifest(&self) -> &Manifest {
    &self.manifest
  }

  pub fn storage(&self) -> &Arc<dyn CacheStorage> {
    &self.storage
  }

  pub fn fetcher(&self) -> &Arc<dyn Fetcher> {
    &self.fetcher
  }

  pub fn classify(&self, request: &Request) -> Route {
    if request.method != Method::GET {
      return Route::Passthrough;
    }
    if request.is_navigation() {
      return Route::Navigation;
    }
    if self.manifest.is_api_host(&request.url) {
      return Route::Api;
    }
    if !self.manifest.is_same_origin(&request.url) {
      return Route::Passthrough;
    }
    if self.manifest.has_static_extension(&request.url) {
      Route::StaticAsset
    } else {
      Route::SameOrigin
    }
  }

  /// Serve a request. Always produces a response.
  pub async fn handle(&self, event: FetchEvent) -> Served {
    let route = self.classify(&event.request);
    debug!(url = %event.request.url, ?route, "routing request");
    match route {
      Route::Passthrough => self.passthrough(&event.request).await,
      Route::Navigation => self.navigation(event).await,
      Route::Api => self.network_first(&event.request).await,
      Route::StaticAsset => self.stale_while_revalidate(&event.request).await,
      Route::SameOrigin => self.cache_first(&event.request).await,
    }
  }

  async fn passthrough(&self, request: &Request) -> Served {
    match self.fetcher.fetch(request, FetchOptions::default()).await {
      Ok(response) => Served::network(response),
      Err(err) => {
        debug!(url = %request.url, error = %err, "uncached request failed");
        Served::placeholder(Response::offline_page())
      }
    }
  }

  async fn navigation(&self, event: FetchEvent) -> Served {
    let FetchEvent { request, preload } = event;

    let preloaded = match preload {
      Some(preload) => preload.await,
      None => Ok(None),
    };
    let network = match preloaded {
      Ok(Some(response)) => Ok(Served::preload(response)),
      Ok(None) => self
        .fetcher
        .fetch(&request, FetchOptions::no_store())
        .await
        .map(Served::network),
      Err(err) => Err(err),
    };

    match network {
      Ok(served) => {
        self.store(self.versions.runtime_name(), &request, &served.response);
        self.trim(self.versions.runtime_name(), self.runtime_policy);
        served
      }
      Err(err) => {
        debug!(url = %request.url, error = %err, "navigation offline, falling back to cache");
        match self.lookup(&request) {
          Some(cached) => Served::cache(cached),
          None => self.shell_or_offline(),
        }
      }
    }
  }

  async fn network_first(&self, request: &Request) -> Served {
    match self.fetcher.fetch(request, FetchOptions::no_store()).await {
      Ok(response) => {
        self.store(self.versions.api_name(), request, &response);
        self.trim(self.versions.api_name(), self.api_policy);
        Served::network(response)
      }
      Err(err) => {
        debug!(url = %request.url, error = %err, "api request offline");
        match self.lookup(request) {
          Some(cached) => Served::cache(cached),
          None => Served::placeholder(Response::offline_json()),
        }
      }
    }
  }

  async fn stale_while_revalidate(&self, request: &Request) -> Served {
    let partition = self.versions.static_name().to_string();
    let cached = self.lookup_in(&partition, request);

    // The revalidation runs to completion even when the cached copy is served.
    let router = self.clone();
    let revalidate_request = request.clone();
    let revalidation = tokio::spawn(async move {
      match router
        .fetcher
        .fetch(&revalidate_request, FetchOptions::default())
        .await
      {
        Ok(response) => {
          router.store(&partition, &revalidate_request, &response);
          Some(response)
        }
        Err(err) => {
          debug!(url = %revalidate_request.url, error = %err, "revalidation failed");
          None
        }
      }
    });

    if let Some(cached) = cached {
      return Served::cache(cached);
    }

    match revalidation.await {
      Ok(Some(response)) => Served::network(response),
      Ok(None) => self.shell_or_offline(),
      Err(err) => {
        warn!(url = %request.url, error = %err, "revalidation task failed");
        self.shell_or_offline()
      }
    }
  }

  async fn cache_first(&self, request: &Request) -> Served {
    if let Some(cached) = self.lookup(request) {
      let router = self.clone();
      let request = request.clone();
      tokio::spawn(async move {
        match router.fetcher.fetch(&request, FetchOptions::default()).await {
          Ok(response) => {
            router.store(router.versions.runtime_name(), &request, &response);
            router.trim(router.versions.runtime_name(), router.runtime_policy);
          }
          Err(err) => debug!(url = %request.url, error = %err, "background refresh failed"),
        }
      });
      return Served::cache(cached);
    }

    match self.fetcher.fetch(request, FetchOptions::default()).await {
      Ok(response) => {
        self.store(self.versions.runtime_name(), request, &response);
        self.trim(self.versions.runtime_name(), self.runtime_policy);
        Served::network(response)
      }
      Err(err) => {
        debug!(url = %request.url, error = %err, "same-origin request offline");
        self.shell_or_offline()
      }
    }
  }

  /// The cached shell page, or a synthesized offline page if even that is gone.
  fn shell_or_offline(&self) -> Served {
    let shell = match self.manifest.shell_url() {
      Ok(url) => self.match_key(url.as_str()),
      Err(err) => {
        warn!(shell = %self.manifest.shell, error = %err, "invalid shell path");
        None
      }
    };
    match shell {
      Some(response) => Served::shell(response),
      None => {
        warn!("no cached shell available, serving offline page");
        Served::placeholder(Response::offline_page())
      }
    }
  }

  fn lookup(&self, request: &Request) -> Option<Response> {
    self.match_key(&request.cache_key())
  }

  fn match_key(&self, key: &str) -> Option<Response> {
    match self.storage.match_any(key) {
      Ok(found) => found,
      Err(err) => {
        warn!(key, error = %err, "cache lookup failed");
        None
      }
    }
  }

  fn lookup_in(&self, partition: &str, request: &Request) -> Option<Response> {
    match self.storage.get(partition, &request.cache_key()) {
      Ok(found) => found,
      Err(err) => {
        warn!(partition, url = %request.url, error = %err, "cache lookup failed");
        None
      }
    }
  }

  fn store(&self, partition: &str, request: &Request, response: &Response) {
    if let Err(err) = self.storage.put(partition, &request.cache_key(), response) {
      warn!(partition, url = %request.url, error = %err, "cache write failed");
    }
  }

  fn trim(&self, partition: &str, policy: EvictionPolicy) {
    if let Err(err) = policy.apply(self.storage.as_ref(), partition) {
      warn!(partition, error = %err, "cache trim failed");
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::cache::storage::MemoryStorage;
  use crate::cache::testing::{text, ScriptedFetcher};
  use crate::cache::traits::ServedFrom;
  use crate::config::CacheConfig;
  use color_eyre::eyre::eyre;
  use futures::FutureExt;
  use std::time::Duration;
  use url::Url;

  const ORIGIN: &str = "http://localhost:8080/";

  struct Harness {
    storage: Arc<MemoryStorage>,
    fetcher: Arc<ScriptedFetcher>,
    router: FetchRouter,
  }

  fn harness() -> Harness {
    let storage = Arc::new(MemoryStorage::new());
    let fetcher = Arc::new(ScriptedFetcher::new());
    let manifest = Manifest::from_config(&CacheConfig::default()).unwrap();
    let router = FetchRouter::new(
      storage.clone(),
      fetcher.clone(),
      CacheVersionSet::new("lv", "v1"),
      manifest,
    );
    Harness {
      storage,
      fetcher,
      router,
    }
  }

  fn url(path: &str) -> Url {
    Url::parse(ORIGIN).unwrap().join(path).unwrap()
  }

  fn get(path: &str) -> FetchEvent {
    FetchEvent::new(Request::get(url(path)))
  }

  fn navigate(path: &str) -> FetchEvent {
    FetchEvent::new(Request::navigate(url(path)))
  }

  fn ok(body: &str) -> Response {
    Response::new(200, body.as_bytes().to_vec())
  }

  async fn wait_for(mut condition: impl FnMut() -> bool) {
    for _ in 0..100 {
      if condition() {
        return;
      }
      tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("condition not met in time");
  }

  #[test]
  fn test_classification() {
    let h = harness();
    let r = &h.router;
    assert_eq!(r.classify(&Request::get(url("./styles.css"))), Route::StaticAsset);
    assert_eq!(r.classify(&Request::get(url("./notes"))), Route::SameOrigin);
    assert_eq!(r.classify(&Request::get(url("./app.js?v=3"))), Route::SameOrigin);
    assert_eq!(r.classify(&Request::navigate(url("./notes"))), Route::Navigation);
    assert_eq!(
      r.classify(&Request::get(Url::parse("https://api.open-meteo.com/v1/forecast").unwrap())),
      Route::Api
    );
    assert_eq!(
      r.classify(&Request::get(Url::parse("https://cdn.example.com/lib.js").unwrap())),
      Route::Passthrough
    );
    assert_eq!(
      r.classify(&Request::get(url("./styles.css")).with_method(Method::POST)),
      Route::Passthrough
    );
  }

  #[tokio::test]
  async fn test_static_asset_served_from_cache_when_network_fails() {
    let h = harness();
    let key = url("./styles.css");
    h.storage.put("lv-static-v1", key.as_str(), &ok("old css")).unwrap();
    h.fetcher.set_offline(true);

    let served = h.router.handle(get("./styles.css")).await;
    assert_eq!(served.source, ServedFrom::Cache);
    assert_eq!(text(&served.response), "old css");
  }

  #[tokio::test]
  async fn test_static_asset_revalidates_in_background() {
    let h = harness();
    let key = url("./app.js");
    h.storage.put("lv-static-v1", key.as_str(), &ok("v1")).unwrap();
    h.fetcher.serve_text(key.as_str(), "v2");

    let served = h.router.handle(get("./app.js")).await;
    assert_eq!(text(&served.response), "v1");

    let storage = h.storage.clone();
    wait_for(|| {
      storage
        .get("lv-static-v1", key.as_str())
        .unwrap()
        .is_some_and(|r| text(&r) == "v2")
    })
    .await;
  }

  #[tokio::test]
  async fn test_static_asset_without_cache_waits_for_network() {
    let h = harness();
    let key = url("./icons/icon-192.png");
    h.fetcher.serve_text(key.as_str(), "png");

    let served = h.router.handle(get("./icons/icon-192.png")).await;
    assert_eq!(served.source, ServedFrom::Network);
    assert_eq!(
      h.storage.get("lv-static-v1", key.as_str()).unwrap(),
      Some(ok("png"))
    );
  }

  #[tokio::test]
  async fn test_static_asset_without_cache_or_network_serves_shell() {
    let h = harness();
    h.storage
      .put("lv-static-v1", url("./index.html").as_str(), &ok("shell"))
      .unwrap();
    h.fetcher.set_offline(true);

    let served = h.router.handle(get("./missing.js")).await;
    assert_eq!(served.source, ServedFrom::Shell);
    assert_eq!(text(&served.response), "shell");
  }

  #[tokio::test]
  async fn test_api_offline_without_cache_returns_placeholder() {
    let h = harness();
    h.fetcher.set_offline(true);
    let request = Request::get(Url::parse("https://api.quotable.io/random").unwrap());

    let served = h.router.handle(FetchEvent::new(request)).await;
    assert_eq!(served.source, ServedFrom::Placeholder);
    assert_eq!(served.response.header("Content-Type"), Some("application/json"));
    let payload: serde_json::Value = serde_json::from_slice(&served.response.body).unwrap();
    assert_eq!(payload["offline"], serde_json::json!(true));
  }

  #[tokio::test]
  async fn test_api_online_bypasses_http_cache_and_bounds_partition() {
    let h = harness();
    let router = h.router.clone().with_limits(50, 2);
    for i in 0..3 {
      let target = format!("https://api.open-meteo.com/v1/forecast?i={i}");
      h.fetcher.serve_text(&target, "{}");
      let served = router
        .handle(FetchEvent::new(Request::get(Url::parse(&target).unwrap())))
        .await;
      assert_eq!(served.source, ServedFrom::Network);
    }

    assert!(h.fetcher.calls().iter().all(|(_, opts)| opts.bypass_http_cache));
    assert_eq!(
      h.storage.keys("lv-api-v1").unwrap(),
      vec![
        "https://api.open-meteo.com/v1/forecast?i=1",
        "https://api.open-meteo.com/v1/forecast?i=2"
      ]
    );
  }

  #[tokio::test]
  async fn test_api_offline_with_cache_serves_cached() {
    let h = harness();
    let target = "https://api.quotable.io/random";
    h.storage.put("lv-api-v1", target, &ok("quote")).unwrap();
    h.fetcher.set_offline(true);

    let served = h
      .router
      .handle(FetchEvent::new(Request::get(Url::parse(target).unwrap())))
      .await;
    assert_eq!(served.source, ServedFrom::Cache);
    assert_eq!(text(&served.response), "quote");
  }

  #[tokio::test]
  async fn test_navigation_offline_without_match_serves_shell() {
    let h = harness();
    h.storage
      .put("lv-static-v1", url("./index.html").as_str(), &ok("shell"))
      .unwrap();
    h.fetcher.set_offline(true);

    let served = h.router.handle(navigate("./habits")).await;
    assert_eq!(served.source, ServedFrom::Shell);
    assert_eq!(text(&served.response), "shell");
  }

  #[tokio::test]
  async fn test_navigation_offline_prefers_exact_match() {
    let h = harness();
    h.storage
      .put("lv-static-v1", url("./index.html").as_str(), &ok("shell"))
      .unwrap();
    h.storage
      .put("lv-runtime-v1", url("./habits").as_str(), &ok("habits page"))
      .unwrap();
    h.fetcher.set_offline(true);

    let served = h.router.handle(navigate("./habits")).await;
    assert_eq!(served.source, ServedFrom::Cache);
    assert_eq!(text(&served.response), "habits page");
  }

  #[tokio::test]
  async fn test_navigation_online_stores_in_runtime() {
    let h = harness();
    h.fetcher.serve_text(url("./tasks").as_str(), "tasks page");

    let served = h.router.handle(navigate("./tasks")).await;
    assert_eq!(served.source, ServedFrom::Network);
    assert!(h.fetcher.calls()[0].1.bypass_http_cache);
    assert_eq!(
      h.storage.get("lv-runtime-v1", url("./tasks").as_str()).unwrap(),
      Some(ok("tasks page"))
    );
  }

  #[tokio::test]
  async fn test_navigation_uses_preload_response() {
    let h = harness();
    let event = navigate("./goals").with_preload(
      async { Ok::<_, color_eyre::Report>(Some(ok("preloaded"))) }.boxed(),
    );

    let served = h.router.handle(event).await;
    assert_eq!(served.source, ServedFrom::Preload);
    assert_eq!(text(&served.response), "preloaded");
    assert_eq!(h.fetcher.call_count(), 0);
  }

  #[tokio::test]
  async fn test_failed_preload_falls_back_to_cache() {
    let h = harness();
    h.storage
      .put("lv-runtime-v1", url("./goals").as_str(), &ok("cached goals"))
      .unwrap();
    let event = navigate("./goals").with_preload(
      async { Err::<Option<Response>, _>(eyre!("preload failed")) }.boxed(),
    );

    let served = h.router.handle(event).await;
    assert_eq!(served.source, ServedFrom::Cache);
  }

  #[tokio::test]
  async fn test_exhausted_fallbacks_synthesize_offline_page() {
    let h = harness();
    h.fetcher.set_offline(true);

    let served = h.router.handle(navigate("./")).await;
    assert_eq!(served.source, ServedFrom::Placeholder);
    assert_eq!(served.response.status, 503);
  }

  #[tokio::test]
  async fn test_same_origin_cached_returns_without_waiting_for_refresh() {
    let h = harness();
    let key = url("./api/summary");
    h.storage.put("lv-runtime-v1", key.as_str(), &ok("cached")).unwrap();
    h.fetcher.serve_text(key.as_str(), "fresh");
    h.fetcher.set_delay(Duration::from_secs(30));

    let served = tokio::time::timeout(
      Duration::from_millis(500),
      h.router.handle(get("./api/summary")),
    )
    .await
    .expect("cached response must not wait on the network");
    assert_eq!(served.source, ServedFrom::Cache);
    assert_eq!(text(&served.response), "cached");
  }

  #[tokio::test]
  async fn test_same_origin_refresh_updates_runtime() {
    let h = harness();
    let key = url("./api/summary");
    h.storage.put("lv-runtime-v1", key.as_str(), &ok("cached")).unwrap();
    h.fetcher.serve_text(key.as_str(), "fresh");

    h.router.handle(get("./api/summary")).await;
    let storage = h.storage.clone();
    wait_for(|| {
      storage
        .get("lv-runtime-v1", key.as_str())
        .unwrap()
        .is_some_and(|r| text(&r) == "fresh")
    })
    .await;
  }

  #[tokio::test]
  async fn test_same_origin_miss_fetches_stores_and_trims() {
    let h = harness();
    let router = h.router.clone().with_limits(2, 30);
    for i in 0..3 {
      let path = format!("./page/{i}");
      h.fetcher.serve_text(url(&path).as_str(), "body");
      let served = router.handle(get(&path)).await;
      assert_eq!(served.source, ServedFrom::Network);
    }
    assert_eq!(
      h.storage.keys("lv-runtime-v1").unwrap(),
      vec![url("./page/1").to_string(), url("./page/2").to_string()]
    );
  }

  #[tokio::test]
  async fn test_non_get_passes_through_uncached() {
    let h = harness();
    h.fetcher.serve_text(url("./sync").as_str(), "accepted");
    let request = Request::get(url("./sync")).with_method(Method::POST);

    let served = h.router.handle(FetchEvent::new(request)).await;
    assert_eq!(served.source, ServedFrom::Network);
    assert!(h.storage.partition_names().unwrap().is_empty());
  }
}
