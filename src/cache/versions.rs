//! Versioned partition names and the precache manifest.

use url::Url;

use crate::config::CacheConfig;

/// Names of the three partitions owned by one deployed version.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheVersionSet {
  version: String,
  static_name: String,
  runtime_name: String,
  api_name: String,
}

impl CacheVersionSet {
  pub fn new(prefix: &str, version: &str) -> Self {
    Self {
      version: version.to_string(),
      static_name: format!("{prefix}-static-{version}"),
      runtime_name: format!("{prefix}-runtime-{version}"),
      api_name: format!("{prefix}-api-{version}"),
    }
  }

  pub fn version(&self) -> &str {
    &self.version
  }

  /// Precached shell assets and stale-while-revalidate writes.
  pub fn static_name(&self) -> &str {
    &self.static_name
  }

  /// Navigations and other same-origin responses.
  pub fn runtime_name(&self) -> &str {
    &self.runtime_name
  }

  /// Third-party API responses.
  pub fn api_name(&self) -> &str {
    &self.api_name
  }

  pub fn names(&self) -> [&str; 3] {
    [&self.static_name, &self.runtime_name, &self.api_name]
  }

  /// Whether `partition` belongs to this version.
  pub fn owns(&self, partition: &str) -> bool {
    self.names().contains(&partition)
  }
}

/// What gets precached and which requests qualify for which policy.
#[derive(Debug, Clone)]
pub struct Manifest {
  /// Origin the application is served from; relative paths resolve against it.
  pub origin: Url,
  /// Shell asset paths fetched at install time.
  pub precache: Vec<String>,
  /// Path of the entry page served when nothing better is available.
  pub shell: String,
  /// Filename suffixes served stale-while-revalidate.
  pub static_extensions: Vec<String>,
  /// External hosts served network-first.
  pub api_hosts: Vec<String>,
}

impl Manifest {
  pub fn from_config(config: &CacheConfig) -> color_eyre::Result<Self> {
    let origin = Url::parse(&config.origin).map_err(|e| {
      color_eyre::eyre::eyre!("Invalid cache origin {}: {}", config.origin, e)
    })?;
    Ok(Self {
      origin,
      precache: config.precache.clone(),
      shell: config.shell.clone(),
      static_extensions: config.static_extensions.clone(),
      api_hosts: config.api_hosts.clone(),
    })
  }

  /// Resolve a manifest path (e.g. `./index.html`) against the origin.
  pub fn resolve(&self, path: &str) -> Result<Url, url::ParseError> {
    self.origin.join(path)
  }

  pub fn shell_url(&self) -> Result<Url, url::ParseError> {
    self.resolve(&self.shell)
  }

  pub fn is_same_origin(&self, url: &Url) -> bool {
    url.origin() == self.origin.origin()
  }

  pub fn is_api_host(&self, url: &Url) -> bool {
    url
      .host_str()
      .is_some_and(|host| self.api_hosts.iter().any(|h| h.eq_ignore_ascii_case(host)))
  }

  /// Suffix match on the whole URL, case-sensitive. A query string hides
  /// the extension, so cache-busted assets go to the bounded runtime
  /// partition instead of the static one.
  pub fn has_static_extension(&self, url: &Url) -> bool {
    let mut url = url.clone();
    url.set_fragment(None);
    self
      .static_extensions
      .iter()
      .any(|ext| url.as_str().ends_with(ext.as_str()))
  }
}
