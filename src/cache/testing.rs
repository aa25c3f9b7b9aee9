//! Scripted network double shared by the cache tests.

use async_trait::async_trait;
use color_eyre::{eyre::eyre, Result};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use super::http::{FetchOptions, Fetcher, Request, Response};

/// Answers from a fixed table of URL → response. Unknown URLs get a 404.
#[derive(Default)]
pub struct ScriptedFetcher {
  responses: Mutex<HashMap<String, Response>>,
  offline: AtomicBool,
  delay: Mutex<Option<Duration>>,
  calls: Mutex<Vec<(String, FetchOptions)>>,
}

impl ScriptedFetcher {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn serve(&self, url: &str, response: Response) {
    self
      .responses
      .lock()
      .unwrap()
      .insert(url.to_string(), response);
  }

  pub fn serve_text(&self, url: &str, text: &str) {
    self.serve(url, Response::new(200, text.as_bytes().to_vec()));
  }

  pub fn set_offline(&self, offline: bool) {
    self.offline.store(offline, Ordering::SeqCst);
  }

  pub fn set_delay(&self, delay: Duration) {
    *self.delay.lock().unwrap() = Some(delay);
  }

  pub fn calls(&self) -> Vec<(String, FetchOptions)> {
    self.calls.lock().unwrap().clone()
  }

  pub fn call_count(&self) -> usize {
    self.calls.lock().unwrap().len()
  }
}

#[async_trait]
impl Fetcher for ScriptedFetcher {
  async fn fetch(&self, request: &Request, options: FetchOptions) -> Result<Response> {
    self
      .calls
      .lock()
      .unwrap()
      .push((request.url.to_string(), options));

    let delay = *self.delay.lock().unwrap();
    if let Some(delay) = delay {
      tokio::time::sleep(delay).await;
    }

    if self.offline.load(Ordering::SeqCst) {
      return Err(eyre!("network unreachable: {}", request.url));
    }

    let response = self
      .responses
      .lock()
      .unwrap()
      .get(request.url.as_str())
      .cloned();
    Ok(response.unwrap_or_else(|| Response::new(404, b"not found".to_vec())))
  }
}

/// Body of a response as UTF-8 text.
pub fn text(response: &Response) -> String {
  String::from_utf8_lossy(&response.body).into_owned()
}
