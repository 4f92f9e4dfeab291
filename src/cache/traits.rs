//! Core types for the versioned response cache.

use chrono::{DateTime, Utc};
use reqwest::Method;
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::fmt;
use url::Url;

use crate::net::{Request, Response};

/// Tag identifying one cache generation.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct CacheVersion(String);

impl CacheVersion {
  pub fn new(tag: impl Into<String>) -> Self {
    Self(tag.into())
  }

  /// The version baked into this build.
  pub fn built_in() -> Self {
    Self(concat!("relay-sw-v", env!("CARGO_PKG_VERSION")).to_string())
  }

  pub fn as_str(&self) -> &str {
    &self.0
  }
}

impl fmt::Display for CacheVersion {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(&self.0)
  }
}

/// Normalized request identity: method plus URL without fragment.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RequestKey {
  pub method: Method,
  pub url: Url,
}

impl RequestKey {
  pub fn new(method: Method, mut url: Url) -> Self {
    url.set_fragment(None);
    Self { method, url }
  }

  pub fn get(url: Url) -> Self {
    Self::new(Method::GET, url)
  }

  pub fn from_request(request: &Request) -> Self {
    Self::new(request.method.clone(), request.url.clone())
  }

  /// SHA256 hash for stable, fixed-length storage keys.
  pub fn cache_hash(&self) -> String {
    let mut hasher = Sha256::new();
    hasher.update(self.method.as_str().as_bytes());
    hasher.update(b" ");
    hasher.update(self.url.as_str().as_bytes());
    hex::encode(hasher.finalize())
  }

  /// Rebuild the request this identity was captured from.
  pub fn to_request(&self) -> Request {
    Request {
      method: self.method.clone(),
      url: self.url.clone(),
      headers: BTreeMap::new(),
      body: None,
    }
  }
}

impl fmt::Display for RequestKey {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "{} {}", self.method, self.url)
  }
}

/// A captured response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheEntry {
  pub status: u16,
  pub headers: BTreeMap<String, String>,
  pub body: Vec<u8>,
  pub cached_at: DateTime<Utc>,
}

impl CacheEntry {
  pub fn from_response(response: &Response, cached_at: DateTime<Utc>) -> Self {
    Self {
      status: response.status,
      headers: response.headers.clone(),
      body: response.body.clone(),
      cached_at,
    }
  }

  pub fn to_response(&self) -> Response {
    Response {
      status: self.status,
      headers: self.headers.clone(),
      body: self.body.clone(),
    }
  }

  pub fn is_success(&self) -> bool {
    (200..300).contains(&self.status)
  }
}

/// A response handed back to the page, including where it came from.
#[derive(Debug, Clone)]
pub struct Served {
  /// The response itself
  pub response: Response,
  /// Where the response came from
  pub source: ServeSource,
  /// When the response was cached (if from cache)
  pub cached_at: Option<DateTime<Utc>>,
}

impl Served {
  /// Fresh data from the network.
  pub fn from_network(response: Response) -> Self {
    Self {
      response,
      source: ServeSource::Network,
      cached_at: None,
    }
  }

  /// A stored copy of this exact request.
  pub fn from_cache(entry: CacheEntry) -> Self {
    Self {
      response: entry.to_response(),
      source: ServeSource::Cache,
      cached_at: Some(entry.cached_at),
    }
  }

  /// The app's base document standing in for an unreachable asset.
  pub fn offline_shell(entry: CacheEntry) -> Self {
    Self {
      response: entry.to_response(),
      source: ServeSource::OfflineShell,
      cached_at: Some(entry.cached_at),
    }
  }

  /// Synthetic offline marker.
  pub fn offline() -> Self {
    Self {
      response: Response::offline(),
      source: ServeSource::Offline,
      cached_at: None,
    }
  }

  /// Whether the service was actually reached for this response.
  pub fn is_live(&self) -> bool {
    self.source == ServeSource::Network
  }
}

/// Indicates where a served response came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServeSource {
  /// Live response from the network
  Network,
  /// Stored copy of the same request
  Cache,
  /// Cached base document served in place of an unreachable asset
  OfflineShell,
  /// Network unavailable and nothing cached - synthetic 503
  Offline,
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_request_key_drops_fragment() {
    let a = RequestKey::get(Url::parse("https://chat.example.com/app.js#v1").unwrap());
    let b = RequestKey::get(Url::parse("https://chat.example.com/app.js").unwrap());
    assert_eq!(a, b);
    assert_eq!(a.cache_hash(), b.cache_hash());
  }

  #[test]
  fn test_request_key_method_is_part_of_identity() {
    let url = Url::parse("https://chat.example.com/api/messages").unwrap();
    let get = RequestKey::new(Method::GET, url.clone());
    let post = RequestKey::new(Method::POST, url);
    assert_ne!(get.cache_hash(), post.cache_hash());
    assert_eq!(get.cache_hash().len(), 64);
  }
}
