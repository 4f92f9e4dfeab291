use crate::attachment::{Attachment, AttachmentSession};
use crate::cache::{CacheStore, CacheVersion, SqliteCacheStore};
use crate::clock::{Clock, SystemClock};
use crate::config::Config;
use crate::db::Database;
use crate::net::{HttpNetwork, Network, Request};
use crate::queue::OfflineQueue;
use crate::subscription::{
  self, HttpPushService, NotificationPermissions, SubscriptionManager, TerminalPrompt,
};
use crate::worker::clients::Clients;
use crate::worker::lifecycle::{LifecycleDeps, LifecycleState};
use crate::worker::push::{self, NotificationTray};
use crate::worker::{
  self, ControlMessage, Dispatcher, EventOutcome, Worker, WorkerEvent, WorkerHandle,
};
use color_eyre::{eyre::eyre, Result};
use reqwest::Method;
use serde_json::{json, Value};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::task::JoinHandle;
use url::Url;

/// A CLI command
#[derive(Debug, Clone)]
pub enum Command {
  Start,
  Fetch { url: String, method: String },
  Versions,
  QueueAdd { text: String, attach: Vec<PathBuf> },
  QueueList,
  QueueClear,
  Sync { tag: Option<String> },
  Push { payload: Option<String>, click: Option<String> },
  Notify { sender: Option<String>, text: Option<String> },
  SkipWaiting,
  Permission,
  Subscribe { key: Option<String> },
  Unsubscribe,
  Subscription,
}

/// Everything a command may need, wired against the configured origin
pub struct App {
  config: Config,
  db: Arc<Database>,
  store: Arc<dyn CacheStore>,
  network: Arc<dyn Network>,
  queue: OfflineQueue,
  worker: Arc<Worker>,
  handle: WorkerHandle,
  runtime: JoinHandle<()>,
}

impl App {
  pub async fn new(config: Config) -> Result<Self> {
    let db = Arc::new(Database::open(config.database.as_deref())?);
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let store: Arc<dyn CacheStore> = Arc::new(SqliteCacheStore::new(db.clone()));
    let network: Arc<dyn Network> = Arc::new(HttpNetwork::new(config.timeout())?);
    let queue = OfflineQueue::new(db.clone(), clock.clone());

    let deps = LifecycleDeps {
      store: store.clone(),
      network: network.clone(),
      clients: Arc::new(Clients::new()),
      db: db.clone(),
      clock,
    };
    let worker = Arc::new(Worker::new(
      &config,
      deps,
      queue.clone(),
      Arc::new(NotificationTray::new()),
    )?);
    let (handle, runtime) = worker::spawn(worker.clone(), Dispatcher::standard());

    Ok(Self {
      config,
      db,
      store,
      network,
      queue,
      worker,
      handle,
      runtime,
    })
  }

  pub async fn run(self, command: Command) -> Result<()> {
    let result = self.execute(command).await;

    // Let in-flight handlers finish before exiting
    drop(self.handle);
    if let Err(err) = self.runtime.await {
      tracing::error!("worker runtime failed: {}", err);
    }
    result
  }

  async fn execute(&self, command: Command) -> Result<()> {
    match command {
      Command::Start => self.start().await,
      Command::Fetch { url, method } => self.fetch(&url, &method).await,
      Command::Versions => self.versions().await,
      Command::QueueAdd { text, attach } => self.queue_add(text, attach).await,
      Command::QueueList => self.queue_list(),
      Command::QueueClear => {
        self.queue.clear()?;
        println!("Offline queue cleared");
        Ok(())
      }
      Command::Sync { tag } => self.sync(tag).await,
      Command::Push { payload, click } => self.push(payload, click).await,
      Command::Notify { sender, text } => self.notify(sender, text),
      Command::SkipWaiting => {
        self.boot().await;
        let outcome = self
          .handle
          .send(WorkerEvent::Message(ControlMessage::SkipWaiting))
          .await?;
        println!("{:?}", outcome);
        Ok(())
      }
      Command::Permission => {
        let decided = self.permissions().request().await?;
        println!("Notification permission: {:?}", decided);
        Ok(())
      }
      Command::Subscribe { key } => self.subscribe(key).await,
      Command::Unsubscribe => {
        self.boot().await;
        let removed = self.subscriptions().await?.unsubscribe().await?;
        println!("{}", if removed { "Unsubscribed" } else { "No subscription" });
        Ok(())
      }
      Command::Subscription => {
        self.boot().await;
        match self.subscriptions().await?.get_subscription().await? {
          Some(record) => println!("{}", serde_json::to_string_pretty(&record)?),
          None => println!("No subscription"),
        }
        Ok(())
      }
    }
  }

  /// Install the built version. With no pages open nothing holds a waiting
  /// version back, so it activates right away.
  async fn install(&self) -> Result<LifecycleState> {
    let state = match self.handle.send(WorkerEvent::Install).await? {
      EventOutcome::Lifecycle(state) => state,
      other => return Err(eyre!("Unexpected install outcome: {:?}", other)),
    };
    if state != LifecycleState::Waiting || self.worker.clients().len().await > 0 {
      return Ok(state);
    }
    match self.handle.send(WorkerEvent::Activate).await? {
      EventOutcome::Lifecycle(state) => Ok(state),
      other => Err(eyre!("Unexpected activate outcome: {:?}", other)),
    }
  }

  /// Bring the worker up. A failed install leaves the previous version serving.
  async fn boot(&self) {
    match self.install().await {
      Ok(state) => tracing::debug!(?state, "worker booted"),
      Err(err) => tracing::warn!("install failed: {}", err),
    }
  }

  async fn start(&self) -> Result<()> {
    let state = self.install().await?;
    println!("{}: {:?}", self.config.cache_version(), state);
    Ok(())
  }

  async fn fetch(&self, url: &str, method: &str) -> Result<()> {
    self.boot().await;

    let url = Url::parse(url).or_else(|_| self.config.resolve(url))?;
    let method = Method::from_bytes(method.to_uppercase().as_bytes())
      .map_err(|e| eyre!("Invalid method {}: {}", method, e))?;
    let request = Request {
      method,
      ..Request::get(url)
    };

    let response = match self.handle.fetch(request.clone()).await? {
      Some(served) => {
        println!("source: {:?} (live: {})", served.source, served.is_live());
        if let Some(cached_at) = served.cached_at {
          println!("cached at: {}", cached_at.to_rfc3339());
        }
        served.response
      }
      None => {
        println!("source: passthrough");
        self.network.fetch(&request).await?
      }
    };

    println!("status: {}", response.status);
    println!();
    println!("{}", response.text());
    Ok(())
  }

  async fn versions(&self) -> Result<()> {
    let serving = self.worker.serving_version().await;
    let known = self.worker.versions().await;
    for tag in self.store.list_versions()? {
      let marker = match &serving {
        Some(version) if version.as_str() == tag => "*",
        _ => " ",
      };
      let version = CacheVersion::new(tag.clone());
      let entries = self.store.keys(&version)?.len();
      match known.iter().find(|v| v.version == version) {
        Some(v) => println!(
          "{} {} ({} entries) {:?} since {}",
          marker,
          tag,
          entries,
          v.state,
          v.state_changed_at.to_rfc3339()
        ),
        None => println!("{} {} ({} entries)", marker, tag, entries),
      }
    }
    Ok(())
  }

  async fn queue_add(&self, text: String, attach: Vec<PathBuf>) -> Result<()> {
    let mut session = AttachmentSession::new();
    for path in &attach {
      session.add(Attachment::read(path).await?);
    }

    let mut payload = json!({ "text": text });
    if !session.is_empty() {
      payload["attachments"] = session.to_payload();
    }
    let queued = self.queue.enqueue(payload)?;
    println!(
      "Queued message {} with {} attachment(s) ({} waiting)",
      queued.id,
      session.len(),
      self.queue.len()?
    );
    Ok(())
  }

  fn queue_list(&self) -> Result<()> {
    let messages = self.queue.drain()?;
    if messages.is_empty() {
      println!("Offline queue is empty");
    }
    for message in messages {
      println!(
        "{:>4}  {}  {}",
        message.id,
        message.timestamp.to_rfc3339(),
        message.payload
      );
    }
    Ok(())
  }

  async fn sync(&self, tag: Option<String>) -> Result<()> {
    self.boot().await;
    let tag = tag.unwrap_or_else(|| self.config.sync.tag.clone());
    match self.handle.send(WorkerEvent::Sync { tag: tag.clone() }).await? {
      EventOutcome::Synced(Some(report)) => {
        println!("replayed: {}, failed: {}", report.replayed, report.failed)
      }
      EventOutcome::Synced(None) => println!("Nothing registered for tag {}", tag),
      other => println!("{:?}", other),
    }
    Ok(())
  }

  async fn push(&self, payload: Option<String>, click: Option<String>) -> Result<()> {
    let event = WorkerEvent::Push(payload.map(String::into_bytes));
    let tag = match self.handle.send(event).await? {
      EventOutcome::Pushed { tag, shown } => {
        if let Some(intent) = self.worker.tray().get(&tag) {
          println!("{}", serde_json::to_string_pretty(&intent)?);
        }
        println!("{:?}", shown);
        tag
      }
      other => return Err(eyre!("Unexpected push outcome: {:?}", other)),
    };

    if let Some(action) = click {
      let action = (action != "open").then_some(action);
      let outcome = self
        .handle
        .send(WorkerEvent::NotificationClick { tag, action })
        .await?;
      println!("{:?}", outcome);
      if let EventOutcome::Clicked(
        push::ClickOutcome::Focused { client_id, .. } | push::ClickOutcome::Opened { client_id, .. },
      ) = outcome
      {
        for message in self.worker.clients().take_messages(&client_id).await {
          println!("{} <- {}", client_id, message);
        }
      }
    }
    Ok(())
  }

  fn notify(&self, sender: Option<String>, text: Option<String>) -> Result<()> {
    let mut message = serde_json::Map::new();
    if let Some(sender) = sender {
      message.insert("sender".to_string(), Value::String(sender));
    }
    if let Some(text) = text {
      message.insert("text".to_string(), Value::String(text));
    }

    let intent = push::message_notification(&Value::Object(message), &self.config.notifications);
    let permission = self.permissions().current()?;
    match self.worker.tray().show_if_permitted(permission, intent) {
      Some(shown) => println!("{:?}", shown),
      None => println!("Notifications are not permitted ({:?})", permission),
    }
    Ok(())
  }

  async fn subscribe(&self, key: Option<String>) -> Result<()> {
    let key = match key {
      Some(key) => key,
      None => Config::get_server_key()?,
    };
    self.boot().await;

    let record = self.subscriptions().await?.subscribe(&key).await?;
    println!("{}", serde_json::to_string_pretty(&record)?);

    if let Some(backend) = &self.config.push.backend_url {
      let client = reqwest::Client::builder()
        .timeout(self.config.timeout())
        .build()
        .map_err(|e| eyre!("Failed to create HTTP client: {}", e))?;
      subscription::share_with_backend(&client, backend, &record).await?;
      println!("Shared with {}", backend);
    }
    Ok(())
  }

  fn permissions(&self) -> NotificationPermissions {
    NotificationPermissions::new(Arc::new(TerminalPrompt), self.db.clone())
  }

  /// Push registration needs an active worker; waiting here would never end.
  async fn subscriptions(&self) -> Result<SubscriptionManager> {
    let state = self.worker.state().await;
    if state != LifecycleState::Active {
      return Err(eyre!("Worker is not active ({:?})", state));
    }
    let service_url = self
      .config
      .push
      .service_url
      .clone()
      .ok_or_else(|| eyre!("push.service_url is not configured"))?;
    let service = HttpPushService::new(service_url, self.db.clone(), self.config.timeout())?;
    let ready = self.worker.subscribe_state().await;
    Ok(SubscriptionManager::new(
      Arc::new(service),
      self.permissions(),
      ready,
    ))
  }
}
