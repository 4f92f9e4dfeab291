//! Replays deferred outbound messages when a sync opportunity arrives.

use color_eyre::Result;
use std::sync::Arc;
use url::Url;

use crate::cache::{CacheStore, CacheVersion};
use crate::config::Config;
use crate::net::{Network, Request};
use crate::queue::OfflineQueue;

/// Outcome of one sync pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SyncReport {
  pub replayed: usize,
  pub failed: usize,
}

/// Re-issues cached message requests and queued messages, best-effort.
#[derive(Clone)]
pub struct BackgroundSync {
  tag: String,
  message_url: Url,
  store: Arc<dyn CacheStore>,
  network: Arc<dyn Network>,
  queue: OfflineQueue,
}

impl BackgroundSync {
  pub fn new(
    config: &Config,
    store: Arc<dyn CacheStore>,
    network: Arc<dyn Network>,
    queue: OfflineQueue,
  ) -> Result<Self> {
    Ok(Self {
      tag: config.sync.tag.clone(),
      message_url: config.resolve(&config.sync.message_endpoint)?,
      store,
      network,
      queue,
    })
  }

  /// Handle a sync signal. Returns `None` for tags this worker does not own.
  pub async fn on_sync(&self, tag: &str, version: Option<&CacheVersion>) -> Result<Option<SyncReport>> {
    if tag != self.tag {
      tracing::debug!(%tag, "ignoring sync for unknown tag");
      return Ok(None);
    }

    let mut report = SyncReport::default();
    if let Some(version) = version {
      self.replay_cached(version, &mut report).await?;
    }
    self.replay_queued(&mut report).await?;

    tracing::info!(replayed = report.replayed, failed = report.failed, "sync finished");
    Ok(Some(report))
  }

  async fn replay_cached(&self, version: &CacheVersion, report: &mut SyncReport) -> Result<()> {
    let endpoint = self.message_url.as_str();
    let keys = self.store.keys(version)?;

    for key in keys.iter().filter(|k| k.url.as_str().contains(endpoint)) {
      match self.network.fetch(&key.to_request()).await {
        Ok(response) if response.is_success() => report.replayed += 1,
        Ok(response) => {
          tracing::warn!(%key, status = response.status, "failed to sync");
          report.failed += 1;
        }
        Err(err) => {
          tracing::warn!(%key, "failed to sync: {}", err);
          report.failed += 1;
        }
      }
    }
    Ok(())
  }

  async fn replay_queued(&self, report: &mut SyncReport) -> Result<()> {
    for message in self.queue.drain()? {
      let request = Request::post_json(self.message_url.clone(), &message.payload)?;
      match self.network.fetch(&request).await {
        Ok(response) if response.is_success() => {
          self.queue.remove(message.id)?;
          report.replayed += 1;
        }
        Ok(response) => {
          tracing::warn!(id = message.id, status = response.status, "queued message rejected, keeping it");
          report.failed += 1;
        }
        Err(err) => {
          tracing::warn!(id = message.id, "failed to send queued message: {}", err);
          report.failed += 1;
        }
      }
    }
    Ok(())
  }
}
