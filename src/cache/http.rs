//! Requests, responses and the network seam.

use async_trait::async_trait;
use color_eyre::{eyre::eyre, Result};
use reqwest::header::{CACHE_CONTROL, PRAGMA};
use reqwest::Method;
use serde::{Deserialize, Serialize};
use url::Url;

/// How a request was initiated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestMode {
  /// Full-page load.
  Navigate,
  /// Anything loaded by a page (scripts, images, API calls).
  Subresource,
}

/// An outgoing request as seen by the router.
#[derive(Debug, Clone)]
pub struct Request {
  pub method: Method,
  pub url: Url,
  pub mode: RequestMode,
}

impl Request {
  pub fn get(url: Url) -> Self {
    Self {
      method: Method::GET,
      url,
      mode: RequestMode::Subresource,
    }
  }

  pub fn navigate(url: Url) -> Self {
    Self {
      method: Method::GET,
      url,
      mode: RequestMode::Navigate,
    }
  }

  pub fn with_method(mut self, method: Method) -> Self {
    self.method = method;
    self
  }

  pub fn is_navigation(&self) -> bool {
    self.mode == RequestMode::Navigate
  }

  /// Key under which the response is cached: the URL without its fragment.
  pub fn cache_key(&self) -> String {
    let mut url = self.url.clone();
    url.set_fragment(None);
    url.into()
  }
}

/// A captured response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Response {
  pub status: u16,
  pub headers: Vec<(String, String)>,
  pub body: Vec<u8>,
}

impl Response {
  pub fn new(status: u16, body: impl Into<Vec<u8>>) -> Self {
    Self {
      status,
      headers: Vec::new(),
      body: body.into(),
    }
  }

  pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
    self.headers.push((name.into(), value.into()));
    self
  }

  /// True for 2xx statuses.
  pub fn is_ok(&self) -> bool {
    (200..300).contains(&self.status)
  }

  pub fn header(&self, name: &str) -> Option<&str> {
    self
      .headers
      .iter()
      .find(|(k, _)| k.eq_ignore_ascii_case(name))
      .map(|(_, v)| v.as_str())
  }

  /// Placeholder returned for API calls when neither network nor cache can answer.
  pub fn offline_json() -> Self {
    Self::new(200, br#"{"offline":true}"#.to_vec()).with_header("Content-Type", "application/json")
  }

  /// Last-resort page when even the cached shell is missing.
  pub fn offline_page() -> Self {
    Self::new(503, b"offline".to_vec()).with_header("Content-Type", "text/plain; charset=utf-8")
  }
}

/// Per-fetch options.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FetchOptions {
  /// Skip any shared HTTP cache between us and the origin.
  pub bypass_http_cache: bool,
}

impl FetchOptions {
  pub fn no_store() -> Self {
    Self {
      bypass_http_cache: true,
    }
  }
}

/// Network access. Any returned response, whatever its status, is a success;
/// `Err` means the network itself failed.
#[async_trait]
pub trait Fetcher: Send + Sync {
  async fn fetch(&self, request: &Request, options: FetchOptions) -> Result<Response>;
}

/// [`Fetcher`] backed by `reqwest`.
#[derive(Clone)]
pub struct HttpFetcher {
  client: reqwest::Client,
}

impl HttpFetcher {
  pub fn new() -> Result<Self> {
    let client = reqwest::Client::builder()
      .user_agent(concat!("lifevault/", env!("CARGO_PKG_VERSION")))
      .build()
      .map_err(|e| eyre!("Failed to build HTTP client: {}", e))?;
    Ok(Self { client })
  }
}

#[async_trait]
impl Fetcher for HttpFetcher {
  async fn fetch(&self, request: &Request, options: FetchOptions) -> Result<Response> {
    let mut builder = self
      .client
      .request(request.method.clone(), request.url.clone());
    if options.bypass_http_cache {
      builder = builder
        .header(CACHE_CONTROL, "no-store")
        .header(PRAGMA, "no-cache");
    }

    let response = builder
      .send()
      .await
      .map_err(|e| eyre!("Network request to {} failed: {}", request.url, e))?;

    let status = response.status().as_u16();
    let headers = response
      .headers()
      .iter()
      .filter_map(|(name, value)| {
        value
          .to_str()
          .ok()
          .map(|v| (name.as_str().to_string(), v.to_string()))
      })
      .collect();
    let body = response
      .bytes()
      .await
      .map_err(|e| eyre!("Failed to read body from {}: {}", request.url, e))?
      .to_vec();

    Ok(Response {
      status,
      headers,
      body,
    })
  }
}
