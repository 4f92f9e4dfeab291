//! The background worker: its events, the handler table, and the runtime loop.
//!
//! Events arrive through a [`WorkerHandle`]. Lifecycle events and control
//! messages are handled one at a time in arrival order on a lane of their
//! own; fetch, push, click and sync handlers are spawned so their completions
//! may interleave, including with an install in progress. Every handler's
//! future is awaited to completion before its reply is sent.

pub mod clients;
pub mod lifecycle;
pub mod push;
pub mod router;
pub mod sync;

use color_eyre::{eyre::eyre, Result};
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot, watch, Mutex};
use tokio::task::{JoinHandle, JoinSet};
use url::Url;

use crate::cache::{CacheVersion, Served};
use crate::config::{Config, NotificationConfig};
use crate::net::Request;
use crate::queue::OfflineQueue;

use clients::Clients;
use lifecycle::{Lifecycle, LifecycleDeps, LifecycleState, WorkerVersion};
use push::{ClickOutcome, NotificationTray, Shown};
use router::Router;
use sync::{BackgroundSync, SyncReport};

/// Pending events the runtime will buffer before senders wait.
const EVENT_BUFFER: usize = 64;

/// Messages a foreground page can post to the worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum ControlMessage {
  /// Activate a waiting version now
  SkipWaiting,
}

impl ControlMessage {
  /// Unknown message types yield `None`.
  pub fn parse(message: &serde_json::Value) -> Option<Self> {
    serde_json::from_value(message.clone()).ok()
  }
}

#[derive(Debug, Clone)]
pub enum WorkerEvent {
  Install,
  Activate,
  Fetch(Request),
  Push(Option<Vec<u8>>),
  NotificationClick { tag: String, action: Option<String> },
  Sync { tag: String },
  Message(ControlMessage),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
  Install,
  Activate,
  Fetch,
  Push,
  NotificationClick,
  Sync,
  Message,
}

impl EventKind {
  /// Handled on the lifecycle lane, never concurrently with each other.
  fn is_serial(self) -> bool {
    matches!(self, Self::Install | Self::Activate | Self::Message)
  }
}

impl WorkerEvent {
  pub fn kind(&self) -> EventKind {
    match self {
      Self::Install => EventKind::Install,
      Self::Activate => EventKind::Activate,
      Self::Fetch(_) => EventKind::Fetch,
      Self::Push(_) => EventKind::Push,
      Self::NotificationClick { .. } => EventKind::NotificationClick,
      Self::Sync { .. } => EventKind::Sync,
      Self::Message(_) => EventKind::Message,
    }
  }
}

/// What a handler produced.
#[derive(Debug)]
pub enum EventOutcome {
  Lifecycle(LifecycleState),
  /// `None` means the request was not intercepted
  Fetched(Option<Served>),
  Pushed { tag: String, shown: Shown },
  Clicked(ClickOutcome),
  /// `None` means the tag belongs to someone else
  Synced(Option<SyncReport>),
  /// No handler registered for the event
  Ignored,
}

/// Shared state every handler works against.
pub struct Worker {
  router: Router,
  lifecycle: Mutex<Lifecycle>,
  sync: BackgroundSync,
  tray: Arc<NotificationTray>,
  clients: Arc<Clients>,
  notifications: NotificationConfig,
  app_root: Url,
}

impl Worker {
  pub fn new(
    config: &Config,
    deps: LifecycleDeps,
    queue: OfflineQueue,
    tray: Arc<NotificationTray>,
  ) -> Result<Self> {
    let manifest = config
      .cache
      .manifest
      .iter()
      .map(|path| config.resolve(path))
      .collect::<Result<Vec<_>>>()?;

    let router = Router::new(
      config,
      deps.store.clone(),
      deps.network.clone(),
      deps.clock.clone(),
    )?;
    let sync = BackgroundSync::new(config, deps.store.clone(), deps.network.clone(), queue)?;
    let clients = deps.clients.clone();
    let lifecycle = Lifecycle::restore(
      config.cache_version(),
      manifest,
      config.lifecycle.skip_waiting,
      deps,
    )?;

    Ok(Self {
      router,
      lifecycle: Mutex::new(lifecycle),
      sync,
      tray,
      clients,
      notifications: config.notifications.clone(),
      app_root: config.resolve(&config.notifications.app_root)?,
    })
  }

  pub fn clients(&self) -> &Arc<Clients> {
    &self.clients
  }

  pub fn tray(&self) -> &Arc<NotificationTray> {
    &self.tray
  }

  pub async fn state(&self) -> LifecycleState {
    self.lifecycle.lock().await.state()
  }

  /// Readiness signal for the foreground.
  pub async fn subscribe_state(&self) -> watch::Receiver<LifecycleState> {
    self.lifecycle.lock().await.subscribe()
  }

  /// The built version and, during an upgrade, the one it replaces.
  pub async fn versions(&self) -> Vec<WorkerVersion> {
    let lifecycle = self.lifecycle.lock().await;
    std::iter::once(lifecycle.current().clone())
      .chain(lifecycle.previous().cloned())
      .collect()
  }

  pub async fn serving_version(&self) -> Option<CacheVersion> {
    self.lifecycle.lock().await.serving_version().cloned()
  }

  /// A page went away. A waiting version may take over once none are left.
  pub async fn page_closed(&self, id: &str) -> Result<()> {
    self.clients.disconnect(id).await;
    self.lifecycle.lock().await.clients_closed().await
  }

  async fn on_install(&self) -> Result<EventOutcome> {
    let precache = {
      let lifecycle = self.lifecycle.lock().await;
      if lifecycle.state() == LifecycleState::Active {
        tracing::debug!(version = %lifecycle.current().version, "already active, nothing to install");
        return Ok(EventOutcome::Lifecycle(LifecycleState::Active));
      }
      lifecycle.begin_install()?
    };

    // The previous version keeps answering fetches meanwhile
    let result = precache.run().await;

    let mut lifecycle = self.lifecycle.lock().await;
    lifecycle.finish_install(result)?;
    if lifecycle.activates_immediately() {
      lifecycle.activate().await?;
    }
    Ok(EventOutcome::Lifecycle(lifecycle.state()))
  }

  async fn on_activate(&self) -> Result<EventOutcome> {
    let mut lifecycle = self.lifecycle.lock().await;
    lifecycle.activate().await?;
    Ok(EventOutcome::Lifecycle(lifecycle.state()))
  }

  async fn on_fetch(&self, request: Request) -> Result<EventOutcome> {
    let served = match self.serving_version().await {
      Some(version) => self.router.handle(&version, &request).await,
      None => {
        tracing::debug!(url = %request.url, "no active version, not intercepting");
        None
      }
    };
    Ok(EventOutcome::Fetched(served))
  }

  async fn on_push(&self, payload: Option<Vec<u8>>) -> Result<EventOutcome> {
    let intent = push::parse_push(payload.as_deref(), &self.notifications);
    let tag = intent.tag.clone();
    let shown = self.tray.show(intent);
    Ok(EventOutcome::Pushed { tag, shown })
  }

  async fn on_notification_click(&self, tag: &str, action: Option<&str>) -> Result<EventOutcome> {
    let notification = self
      .tray
      .get(tag)
      .ok_or_else(|| eyre!("No notification with tag {}", tag))?;
    let outcome =
      push::handle_click(&notification, action, &self.tray, &self.clients, &self.app_root).await?;
    Ok(EventOutcome::Clicked(outcome))
  }

  async fn on_sync(&self, tag: &str) -> Result<EventOutcome> {
    let version = self.serving_version().await;
    let report = self.sync.on_sync(tag, version.as_ref()).await?;
    Ok(EventOutcome::Synced(report))
  }

  async fn on_message(&self, message: ControlMessage) -> Result<EventOutcome> {
    let mut lifecycle = self.lifecycle.lock().await;
    match message {
      ControlMessage::SkipWaiting => lifecycle.skip_waiting().await?,
    }
    Ok(EventOutcome::Lifecycle(lifecycle.state()))
  }
}

/// A boxed handler future
type Handler =
  Box<dyn Fn(Arc<Worker>, WorkerEvent) -> BoxFuture<'static, Result<EventOutcome>> + Send + Sync>;

/// Handlers keyed by event kind.
pub struct Dispatcher {
  handlers: HashMap<EventKind, Handler>,
}

impl Dispatcher {
  /// A table with no handlers. Every event is ignored.
  pub fn empty() -> Self {
    Self {
      handlers: HashMap::new(),
    }
  }

  /// Register (or replace) the handler for one kind of event.
  pub fn on<F, Fut>(&mut self, kind: EventKind, handler: F) -> &mut Self
  where
    F: Fn(Arc<Worker>, WorkerEvent) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<EventOutcome>> + Send + 'static,
  {
    let boxed: Handler = Box::new(
      move |worker, event| -> BoxFuture<'static, Result<EventOutcome>> {
        Box::pin(handler(worker, event))
      },
    );
    self.handlers.insert(kind, boxed);
    self
  }

  /// The handlers the worker ships with.
  pub fn standard() -> Self {
    let mut table = Self::empty();
    table
      .on(EventKind::Install, |worker, _| async move {
        worker.on_install().await
      })
      .on(EventKind::Activate, |worker, _| async move {
        worker.on_activate().await
      })
      .on(EventKind::Fetch, |worker, event| async move {
        match event {
          WorkerEvent::Fetch(request) => worker.on_fetch(request).await,
          other => Err(misrouted(&other)),
        }
      })
      .on(EventKind::Push, |worker, event| async move {
        match event {
          WorkerEvent::Push(payload) => worker.on_push(payload).await,
          other => Err(misrouted(&other)),
        }
      })
      .on(EventKind::NotificationClick, |worker, event| async move {
        match event {
          WorkerEvent::NotificationClick { tag, action } => {
            worker.on_notification_click(&tag, action.as_deref()).await
          }
          other => Err(misrouted(&other)),
        }
      })
      .on(EventKind::Sync, |worker, event| async move {
        match event {
          WorkerEvent::Sync { tag } => worker.on_sync(&tag).await,
          other => Err(misrouted(&other)),
        }
      })
      .on(EventKind::Message, |worker, event| async move {
        match event {
          WorkerEvent::Message(message) => worker.on_message(message).await,
          other => Err(misrouted(&other)),
        }
      });
    table
  }

  pub fn dispatch(
    &self,
    worker: Arc<Worker>,
    event: WorkerEvent,
  ) -> BoxFuture<'static, Result<EventOutcome>> {
    match self.handlers.get(&event.kind()) {
      Some(handler) => handler(worker, event),
      None => {
        tracing::debug!(kind = ?event.kind(), "no handler registered");
        Box::pin(async { Ok(EventOutcome::Ignored) })
      }
    }
  }
}

fn misrouted(event: &WorkerEvent) -> color_eyre::Report {
  eyre!("Handler received a {:?} event", event.kind())
}

type Reply = oneshot::Sender<Result<EventOutcome>>;

struct Envelope {
  event: WorkerEvent,
  reply: Reply,
}

/// Sends events to a running worker. Dropping every handle stops the runtime
/// once in-flight handlers finish.
#[derive(Clone)]
pub struct WorkerHandle {
  tx: mpsc::Sender<Envelope>,
}

impl WorkerHandle {
  /// Deliver an event and wait until its handler has completed.
  pub async fn send(&self, event: WorkerEvent) -> Result<EventOutcome> {
    let (reply, rx) = oneshot::channel();
    self
      .tx
      .send(Envelope { event, reply })
      .await
      .map_err(|_| eyre!("Worker has stopped"))?;
    rx.await
      .map_err(|_| eyre!("Worker dropped the event before completing it"))?
  }

  pub async fn fetch(&self, request: Request) -> Result<Option<Served>> {
    match self.send(WorkerEvent::Fetch(request)).await? {
      EventOutcome::Fetched(served) => Ok(served),
      other => Err(eyre!("Unexpected fetch outcome: {:?}", other)),
    }
  }
}

/// Start the runtime loop for `worker`.
pub fn spawn(worker: Arc<Worker>, dispatcher: Dispatcher) -> (WorkerHandle, JoinHandle<()>) {
  let (tx, rx) = mpsc::channel(EVENT_BUFFER);
  let task = tokio::spawn(run(worker, dispatcher, rx));
  (WorkerHandle { tx }, task)
}

async fn run(worker: Arc<Worker>, dispatcher: Dispatcher, mut rx: mpsc::Receiver<Envelope>) {
  let (lane_tx, lane_rx) = mpsc::unbounded_channel();
  let lane = tokio::spawn(run_serial(lane_rx));
  let mut in_flight = JoinSet::new();

  loop {
    tokio::select! {
      envelope = rx.recv() => {
        let Some(Envelope { event, reply }) = envelope else {
          break;
        };
        let kind = event.kind();
        let handled = dispatcher.dispatch(worker.clone(), event);
        if kind.is_serial() {
          if let Err(mpsc::error::SendError((_, reply))) = lane_tx.send((handled, reply)) {
            let _ = reply.send(Err(eyre!("Lifecycle lane has stopped")));
          }
        } else {
          in_flight.spawn(async move {
            let _ = reply.send(handled.await);
          });
        }
      }
      Some(joined) = in_flight.join_next(), if !in_flight.is_empty() => {
        if let Err(err) = joined {
          tracing::error!("event handler panicked: {}", err);
        }
      }
    }
  }

  drop(lane_tx);
  let pending = in_flight.len();
  if pending > 0 {
    tracing::debug!(pending, "waiting for in-flight handlers");
  }
  while let Some(joined) = in_flight.join_next().await {
    if let Err(err) = joined {
      tracing::error!("event handler panicked: {}", err);
    }
  }
  if let Err(err) = lane.await {
    tracing::error!("lifecycle lane panicked: {}", err);
  }
  tracing::info!("worker stopped");
}

/// Lifecycle handlers, one after another in arrival order.
async fn run_serial(
  mut rx: mpsc::UnboundedReceiver<(BoxFuture<'static, Result<EventOutcome>>, Reply)>,
) {
  while let Some((handled, reply)) = rx.recv().await {
    let _ = reply.send(handled.await);
  }
}
