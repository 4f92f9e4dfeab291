//! Install / activate state machine for one worker build.
//!
//! ```text
//! Installing ──install ok──▶ Waiting ──activate──▶ Active
//!     │                         ▲
//!     └──install failed──▶ Redundant
//!
//! previous Active ──newer version installing──▶ Superseded ──newer activates──▶ (deleted)
//! ```

use chrono::{DateTime, Utc};
use color_eyre::{eyre::eyre, Result};
use futures::future::try_join_all;
use std::sync::Arc;
use tokio::sync::watch;
use url::Url;

use crate::cache::{CacheEntry, CacheStore, CacheVersion, RequestKey};
use crate::clock::Clock;
use crate::db::Database;
use crate::net::{Network, Request};

use super::clients::Clients;

/// Storage key remembering which version last activated.
pub const ACTIVE_VERSION_KEY: &str = "active_cache_version";

/// Lifecycle state of a worker version.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleState {
  /// Pre-populating its cache.
  Installing,
  /// Installed, waiting to take over.
  Waiting,
  /// Serving requests.
  Active,
  /// A newer version is installing; still serving until it activates.
  Superseded,
  /// Install failed; never serves.
  Redundant,
}

/// A cache version and where it is in its lifecycle.
#[derive(Debug, Clone)]
pub struct WorkerVersion {
  pub version: CacheVersion,
  pub state: LifecycleState,
  /// Time of last state change.
  pub state_changed_at: DateTime<Utc>,
}

/// Everything the controller touches.
#[derive(Clone)]
pub struct LifecycleDeps {
  pub store: Arc<dyn CacheStore>,
  pub network: Arc<dyn Network>,
  pub clients: Arc<Clients>,
  pub db: Arc<Database>,
  pub clock: Arc<dyn Clock>,
}

/// Owns the install/activate transitions of the built version.
pub struct Lifecycle {
  current: WorkerVersion,
  previous: Option<WorkerVersion>,
  manifest: Vec<Url>,
  skip_waiting: bool,
  skip_requested: bool,
  deps: LifecycleDeps,
  state_tx: watch::Sender<LifecycleState>,
}

/// The manifest fetch of one install, run without the controller borrowed.
pub struct Precache {
  version: CacheVersion,
  manifest: Vec<Url>,
  network: Arc<dyn Network>,
  store: Arc<dyn CacheStore>,
  clock: Arc<dyn Clock>,
}

impl Precache {
  /// Fetch every asset, then store them all at once under the new version.
  pub async fn run(self) -> Result<()> {
    let fetches = self.manifest.iter().map(|url| {
      let network = self.network.clone();
      async move {
        let response = network.fetch(&Request::get(url.clone())).await?;
        if !response.is_success() {
          return Err(eyre!("{} answered {}", url, response.status));
        }
        Ok::<_, color_eyre::Report>((RequestKey::get(url.clone()), response))
      }
    });
    let fetched = try_join_all(fetches).await?;

    let now = self.clock.now();
    let entries: Vec<(RequestKey, CacheEntry)> = fetched
      .into_iter()
      .map(|(key, response)| (key, CacheEntry::from_response(&response, now)))
      .collect();
    self.store.put_all(&self.version, &entries)
  }
}

impl Lifecycle {
  /// Restore from storage. A build whose version already activated starts out
  /// `Active`; anything else starts `Installing` with the old version still serving.
  pub fn restore(
    version: CacheVersion,
    manifest: Vec<Url>,
    skip_waiting: bool,
    deps: LifecycleDeps,
  ) -> Result<Self> {
    let now = deps.clock.now();
    let persisted = deps
      .db
      .kv_get(ACTIVE_VERSION_KEY)?
      .map(|v| CacheVersion::new(v.value));

    let (state, previous) = match persisted {
      Some(tag) if tag == version => (LifecycleState::Active, None),
      Some(tag) => {
        tracing::info!(old = %tag, new = %version, "newer version found, superseding");
        let previous = WorkerVersion {
          version: tag,
          state: LifecycleState::Superseded,
          state_changed_at: now,
        };
        (LifecycleState::Installing, Some(previous))
      }
      None => (LifecycleState::Installing, None),
    };

    let (state_tx, _) = watch::channel(state);

    Ok(Self {
      current: WorkerVersion {
        version,
        state,
        state_changed_at: now,
      },
      previous,
      manifest,
      skip_waiting,
      skip_requested: false,
      deps,
      state_tx,
    })
  }

  pub fn state(&self) -> LifecycleState {
    self.current.state
  }

  pub fn current(&self) -> &WorkerVersion {
    &self.current
  }

  pub fn previous(&self) -> Option<&WorkerVersion> {
    self.previous.as_ref()
  }

  /// Watch state changes of the built version.
  pub fn subscribe(&self) -> watch::Receiver<LifecycleState> {
    self.state_tx.subscribe()
  }

  /// The version requests should be answered from right now, if any.
  pub fn serving_version(&self) -> Option<&CacheVersion> {
    if self.current.state == LifecycleState::Active {
      return Some(&self.current.version);
    }
    self
      .previous
      .as_ref()
      .filter(|p| matches!(p.state, LifecycleState::Active | LifecycleState::Superseded))
      .map(|p| &p.version)
  }

  /// Whether a successful install should be followed by activation right away.
  pub fn activates_immediately(&self) -> bool {
    self.skip_waiting || self.skip_requested
  }

  fn set_state(&mut self, state: LifecycleState) {
    self.current.state = state;
    self.current.state_changed_at = self.deps.clock.now();
    self.state_tx.send_replace(state);
  }

  /// Check the version may install and detach the manifest fetch, so it can
  /// run while the previous version keeps serving.
  ///
  /// Any asset that fails to fetch aborts the install: [`Self::finish_install`]
  /// marks the version `Redundant` and the previously active version keeps serving.
  pub fn begin_install(&self) -> Result<Precache> {
    if self.current.state != LifecycleState::Installing {
      return Err(eyre!(
        "Cannot install {} in state {:?}",
        self.current.version,
        self.current.state
      ));
    }
    tracing::info!(version = %self.current.version, assets = self.manifest.len(), "installing");

    Ok(Precache {
      version: self.current.version.clone(),
      manifest: self.manifest.clone(),
      network: self.deps.network.clone(),
      store: self.deps.store.clone(),
      clock: self.deps.clock.clone(),
    })
  }

  /// Record the result of a [`Precache::run`].
  pub fn finish_install(&mut self, result: Result<()>) -> Result<()> {
    if self.current.state != LifecycleState::Installing {
      return Err(eyre!(
        "Install of {} finished in state {:?}",
        self.current.version,
        self.current.state
      ));
    }
    if let Err(err) = result {
      return Err(self.fail_install(err));
    }

    self.set_state(LifecycleState::Waiting);
    tracing::info!(version = %self.current.version, "installed, waiting to activate");
    Ok(())
  }

  fn fail_install(&mut self, err: color_eyre::Report) -> color_eyre::Report {
    tracing::error!(version = %self.current.version, "install failed: {}", err);
    if let Err(cleanup) = self.deps.store.delete_version(self.current.version.as_str()) {
      tracing::warn!("failed to discard partial cache: {}", cleanup);
    }
    self.set_state(LifecycleState::Redundant);
    if let Some(previous) = self.previous.as_mut() {
      previous.state = LifecycleState::Active;
      previous.state_changed_at = self.deps.clock.now();
    }
    eyre!("Install of {} failed: {}", self.current.version, err)
  }

  /// Take over: purge every other cache version, remember this one, and claim open pages.
  pub async fn activate(&mut self) -> Result<()> {
    match self.current.state {
      LifecycleState::Active => return Ok(()),
      LifecycleState::Waiting => {}
      state => {
        return Err(eyre!(
          "Cannot activate {} in state {:?}",
          self.current.version,
          state
        ))
      }
    }

    let current = self.current.version.clone();
    for tag in self.deps.store.list_versions()? {
      if tag != current.as_str() {
        tracing::info!(%tag, "deleting old cache");
        self.deps.store.delete_version(&tag)?;
      }
    }
    self.deps.db.kv_set(ACTIVE_VERSION_KEY, current.as_str())?;

    if let Some(previous) = self.previous.take() {
      tracing::info!(old = %previous.version, "previous version retired");
    }
    self.skip_requested = false;
    self.set_state(LifecycleState::Active);

    let claimed = self.deps.clients.claim().await;
    tracing::info!(version = %current, claimed, "activated");
    Ok(())
  }

  /// Foreground asked a waiting version to take over now.
  pub async fn skip_waiting(&mut self) -> Result<()> {
    match self.current.state {
      LifecycleState::Waiting => self.activate().await,
      LifecycleState::Installing => {
        self.skip_requested = true;
        Ok(())
      }
      _ => Ok(()),
    }
  }

  /// The last page held by the old version closed.
  pub async fn clients_closed(&mut self) -> Result<()> {
    if self.current.state == LifecycleState::Waiting && self.deps.clients.len().await == 0 {
      self.activate().await?;
    }
    Ok(())
  }
}
