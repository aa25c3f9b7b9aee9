//! Core types describing what the router served and where it came from.

use super::http::Response;

/// A response handed back to the requester, with its provenance.
#[derive(Debug, Clone)]
pub struct Served {
  /// The actual response
  pub response: Response,
  /// Where the response came from
  pub source: ServedFrom,
}

impl Served {
  pub fn network(response: Response) -> Self {
    Self {
      response,
      source: ServedFrom::Network,
    }
  }

  pub fn preload(response: Response) -> Self {
    Self {
      response,
      source: ServedFrom::Preload,
    }
  }

  pub fn cache(response: Response) -> Self {
    Self {
      response,
      source: ServedFrom::Cache,
    }
  }

  pub fn shell(response: Response) -> Self {
    Self {
      response,
      source: ServedFrom::Shell,
    }
  }

  pub fn placeholder(response: Response) -> Self {
    Self {
      response,
      source: ServedFrom::Placeholder,
    }
  }
}

/// Indicates where a served response came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServedFrom {
  /// Fresh response from the network
  Network,
  /// Response of a navigation preload started alongside the request
  Preload,
  /// Exact match from a cache partition
  Cache,
  /// The cached application shell, standing in for a missing page
  Shell,
  /// Synthesized offline response
  Placeholder,
}
