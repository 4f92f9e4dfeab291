//! Request classification and the cache-first / network-first strategies.

use reqwest::Method;
use std::sync::Arc;
use url::{Origin, Url};

use crate::cache::{CacheEntry, CacheStore, CacheVersion, RequestKey, Served};
use crate::clock::Clock;
use crate::config::Config;
use crate::net::{Network, Request, Response};

/// Strategy chosen for a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Route {
  /// Static assets: serve the stored copy, go to the network only on a miss
  CacheFirst,
  /// API and realtime paths: prefer live data, fall back to the stored copy
  NetworkFirst,
  /// Cross-origin: not intercepted
  Passthrough,
}

/// Picks and runs a fetch strategy for each intercepted request.
#[derive(Clone)]
pub struct Router {
  origin: Origin,
  network_first_prefixes: Vec<String>,
  offline_shell: Url,
  store: Arc<dyn CacheStore>,
  network: Arc<dyn Network>,
  clock: Arc<dyn Clock>,
}

impl Router {
  pub fn new(
    config: &Config,
    store: Arc<dyn CacheStore>,
    network: Arc<dyn Network>,
    clock: Arc<dyn Clock>,
  ) -> color_eyre::Result<Self> {
    Ok(Self {
      origin: config.origin.origin(),
      network_first_prefixes: config.routing.network_first_prefixes.clone(),
      offline_shell: config.resolve(&config.cache.offline_shell)?,
      store,
      network,
      clock,
    })
  }

  /// Classify a request by origin and path prefix.
  pub fn route(&self, request: &Request) -> Route {
    if request.url.origin() != self.origin {
      return Route::Passthrough;
    }

    let path = request.url.path();
    if self
      .network_first_prefixes
      .iter()
      .any(|prefix| path.starts_with(prefix.as_str()))
    {
      Route::NetworkFirst
    } else {
      Route::CacheFirst
    }
  }

  /// Answer a request under the given cache version.
  ///
  /// Returns `None` when the request is not intercepted and should go
  /// straight to the network.
  pub async fn handle(&self, version: &CacheVersion, request: &Request) -> Option<Served> {
    let route = self.route(request);
    tracing::debug!(url = %request.url, method = %request.method, ?route, "routing request");

    match route {
      Route::Passthrough => None,
      Route::CacheFirst => Some(self.cache_first(version, request).await),
      Route::NetworkFirst => Some(self.network_first(version, request).await),
    }
  }

  async fn cache_first(&self, version: &CacheVersion, request: &Request) -> Served {
    let key = RequestKey::from_request(request);

    if let Some(entry) = self.lookup(version, &key) {
      return Served::from_cache(entry);
    }

    match self.network.fetch(request).await {
      Ok(response) => {
        self.store_response(version, &key, &response);
        Served::from_network(response)
      }
      Err(err) => {
        tracing::warn!(url = %request.url, "asset unreachable, serving offline shell: {}", err);
        match self.lookup(version, &RequestKey::get(self.offline_shell.clone())) {
          Some(shell) => Served::offline_shell(shell),
          None => {
            tracing::warn!(shell = %self.offline_shell, "offline shell missing from cache");
            Served::offline()
          }
        }
      }
    }
  }

  async fn network_first(&self, version: &CacheVersion, request: &Request) -> Served {
    let key = RequestKey::from_request(request);

    match self.network.fetch(request).await {
      Ok(response) => {
        self.store_response(version, &key, &response);
        Served::from_network(response)
      }
      Err(err) => {
        tracing::warn!(url = %request.url, "network unavailable: {}", err);
        match self.lookup(version, &key) {
          Some(entry) => Served::from_cache(entry),
          None => Served::offline(),
        }
      }
    }
  }

  /// Storage trouble degrades to a miss rather than failing the request.
  fn lookup(&self, version: &CacheVersion, key: &RequestKey) -> Option<CacheEntry> {
    match self.store.get(version, key) {
      Ok(entry) => entry,
      Err(err) => {
        tracing::warn!(%key, "cache read failed: {}", err);
        None
      }
    }
  }

  fn store_response(&self, version: &CacheVersion, key: &RequestKey, response: &Response) {
    // The platform cache only holds GET responses
    if key.method != Method::GET || !response.is_success() {
      return;
    }
    let entry = CacheEntry::from_response(response, self.clock.now());
    if let Err(err) = self.store.put(version, key, &entry) {
      tracing::warn!(%key, "cache write failed: {}", err);
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::cache::{ServeSource, SqliteCacheStore};
  use crate::clock::ManualClock;
  use crate::db::Database;
  use crate::net::StubNetwork;

  struct Fixture {
    router: Router,
    store: Arc<SqliteCacheStore>,
    network: Arc<StubNetwork>,
    version: CacheVersion,
  }

  fn fixture() -> Fixture {
    let config = Config::for_tests();
    let store = Arc::new(SqliteCacheStore::new(Arc::new(
      Database::open_in_memory().unwrap(),
    )));
    let network = Arc::new(StubNetwork::new());
    let router = Router::new(
      &config,
      store.clone(),
      network.clone(),
      Arc::new(ManualClock::new()),
    )
    .unwrap();
    Fixture {
      router,
      store,
      network,
      version: CacheVersion::new("v1"),
    }
  }

  fn get(url: &str) -> Request {
    Request::get(Url::parse(url).unwrap())
  }

  fn seed(f: &Fixture, url: &str, body: &str) {
    let response = Response {
      status: 200,
      headers: Default::default(),
      body: body.as_bytes().to_vec(),
    };
    let entry = CacheEntry::from_response(&response, chrono::Utc::now());
    f.store
      .put(&f.version, &RequestKey::get(Url::parse(url).unwrap()), &entry)
      .unwrap();
  }

  #[test]
  fn test_route_classification() {
    let f = fixture();
    assert_eq!(
      f.router.route(&get("https://chat.example.com/app.js")),
      Route::CacheFirst
    );
    assert_eq!(
      f.router.route(&get("https://chat.example.com/api/messages")),
      Route::NetworkFirst
    );
    assert_eq!(
      f.router.route(&get("https://chat.example.com/ws?session=1")),
      Route::NetworkFirst
    );
    assert_eq!(
      f.router.route(&get("https://cdn.example.net/lib.js")),
      Route::Passthrough
    );
    // Same host, different scheme is a different origin
    assert_eq!(
      f.router.route(&get("http://chat.example.com/app.js")),
      Route::Passthrough
    );
  }

  #[tokio::test]
  async fn test_cache_first_hit_skips_network() {
    let f = fixture();
    seed(&f, "https://chat.example.com/app.js", "cached");

    let served = f
      .router
      .handle(&f.version, &get("https://chat.example.com/app.js"))
      .await
      .unwrap();

    assert_eq!(served.source, ServeSource::Cache);
    assert_eq!(served.response.text(), "cached");
    assert_eq!(f.network.call_count(), 0);
  }

  #[tokio::test]
  async fn test_cache_first_miss_fetches_and_stores() {
    let f = fixture();
    f.network.respond("https://chat.example.com/app.js", 200, "fresh");

    let served = f
      .router
      .handle(&f.version, &get("https://chat.example.com/app.js"))
      .await
      .unwrap();
    assert_eq!(served.source, ServeSource::Network);

    // Second request is served from the cache
    let again = f
      .router
      .handle(&f.version, &get("https://chat.example.com/app.js"))
      .await
      .unwrap();
    assert_eq!(again.source, ServeSource::Cache);
    assert_eq!(again.response.text(), "fresh");
    assert_eq!(f.network.call_count(), 1);
  }

  #[tokio::test]
  async fn test_cache_first_does_not_store_errors() {
    let f = fixture();
    f.network.respond("https://chat.example.com/gone.png", 404, "missing");

    let served = f
      .router
      .handle(&f.version, &get("https://chat.example.com/gone.png"))
      .await
      .unwrap();
    assert_eq!(served.response.status, 404);
    assert!(f.store.keys(&f.version).unwrap().is_empty());
  }

  #[tokio::test]
  async fn test_cache_first_offline_serves_shell() {
    let f = fixture();
    seed(&f, "https://chat.example.com/index.html", "<shell>");
    f.network.set_offline(true);

    let served = f
      .router
      .handle(&f.version, &get("https://chat.example.com/chat/42"))
      .await
      .unwrap();
    assert_eq!(served.source, ServeSource::OfflineShell);
    assert_eq!(served.response.text(), "<shell>");
  }

  #[tokio::test]
  async fn test_cache_first_offline_without_shell_is_synthetic() {
    let f = fixture();
    f.network.set_offline(true);

    let served = f
      .router
      .handle(&f.version, &get("https://chat.example.com/chat/42"))
      .await
      .unwrap();
    assert_eq!(served.source, ServeSource::Offline);
    assert_eq!(served.response.status, 503);
  }

  #[tokio::test]
  async fn test_network_first_returns_live_and_updates_cache() {
    let f = fixture();
    seed(&f, "https://chat.example.com/api/me", "stale");
    f.network.respond("https://chat.example.com/api/me", 200, "live");

    let served = f
      .router
      .handle(&f.version, &get("https://chat.example.com/api/me"))
      .await
      .unwrap();
    assert!(served.is_live());
    assert_eq!(served.response.text(), "live");

    let key = RequestKey::get(Url::parse("https://chat.example.com/api/me").unwrap());
    let stored = f.store.get(&f.version, &key).unwrap().unwrap();
    assert_eq!(stored.body, b"live");
  }

  #[tokio::test]
  async fn test_network_first_offline_uses_cached_copy() {
    let f = fixture();
    seed(&f, "https://chat.example.com/api/me", "stale");
    f.network.set_offline(true);

    let served = f
      .router
      .handle(&f.version, &get("https://chat.example.com/api/me"))
      .await
      .unwrap();
    assert_eq!(served.source, ServeSource::Cache);
    assert_eq!(served.response.text(), "stale");
  }

  #[tokio::test]
  async fn test_network_first_offline_without_cache_is_503() {
    let f = fixture();
    f.network.set_offline(true);

    let served = f
      .router
      .handle(&f.version, &get("https://chat.example.com/api/history"))
      .await
      .unwrap();
    assert_eq!(served.source, ServeSource::Offline);
    assert_eq!(served.response.status, 503);
    let body: serde_json::Value = served.response.json().unwrap();
    assert!(body.get("error").is_some());
  }

  #[tokio::test]
  async fn test_network_first_server_error_is_returned_live() {
    let f = fixture();
    seed(&f, "https://chat.example.com/api/me", "stale");
    f.network.respond("https://chat.example.com/api/me", 500, "boom");

    let served = f
      .router
      .handle(&f.version, &get("https://chat.example.com/api/me"))
      .await
      .unwrap();
    // Reachable but errored is not the same as offline
    assert_eq!(served.source, ServeSource::Network);
    assert_eq!(served.response.status, 500);
  }

  #[tokio::test]
  async fn test_post_is_never_cached() {
    let f = fixture();
    f.network.respond("https://chat.example.com/api/messages", 201, "{}");
    let url = Url::parse("https://chat.example.com/api/messages").unwrap();
    let request = Request::post_json(url, &serde_json::json!({"text": "hi"})).unwrap();

    let served = f.router.handle(&f.version, &request).await.unwrap();
    assert_eq!(served.response.status, 201);
    assert!(f.store.keys(&f.version).unwrap().is_empty());
  }

  #[tokio::test]
  async fn test_cross_origin_is_not_intercepted() {
    let f = fixture();
    let served = f
      .router
      .handle(&f.version, &get("https://cdn.example.net/lib.js"))
      .await;
    assert!(served.is_none());
    assert_eq!(f.network.call_count(), 0);
  }
}
