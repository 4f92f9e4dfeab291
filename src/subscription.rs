//! Foreground side of push: notification permission and the push subscription.

use async_trait::async_trait;
use base64::alphabet;
use base64::engine::general_purpose::{GeneralPurpose, GeneralPurposeConfig, URL_SAFE_NO_PAD};
use base64::engine::DecodePaddingMode;
use base64::Engine;
use color_eyre::{eyre::eyre, Result};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use url::Url;

use crate::db::Database;
use crate::worker::lifecycle::LifecycleState;
use crate::worker::push::Permission;

/// Storage key for the current push subscription.
pub const SUBSCRIPTION_KEY: &str = "push_subscription";
/// Storage key for the user's notification decision.
pub const PERMISSION_KEY: &str = "notification_permission";

/// URL-safe alphabet that accepts keys with or without `=` padding.
const URL_SAFE_LENIENT: GeneralPurpose = GeneralPurpose::new(
  &alphabet::URL_SAFE,
  GeneralPurposeConfig::new().with_decode_padding_mode(DecodePaddingMode::Indifferent),
);

/// A subscription issued by the push service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PushSubscriptionRecord {
  pub endpoint: String,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub expiration_time: Option<i64>,
  pub keys: SubscriptionKeys,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubscriptionKeys {
  pub p256dh: String,
  pub auth: String,
}

/// Parameters for a new subscription.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscribeOptions {
  /// Every push must result in a visible notification
  pub user_visible_only: bool,
  pub application_server_key: Vec<u8>,
}

/// Decode a URL-safe base64 server key. Padding is optional.
pub fn decode_server_key(key: &str) -> Result<Vec<u8>> {
  URL_SAFE_LENIENT
    .decode(key.trim())
    .map_err(|e| eyre!("Invalid server key: {}", e))
}

/// Encode bytes as URL-safe base64 without padding.
pub fn encode_server_key(bytes: &[u8]) -> String {
  URL_SAFE_NO_PAD.encode(bytes)
}

/// The platform push service.
#[async_trait]
pub trait PushService: Send + Sync {
  async fn subscribe(&self, options: &SubscribeOptions) -> Result<PushSubscriptionRecord>;
  async fn unsubscribe(&self, subscription: &PushSubscriptionRecord) -> Result<()>;
  async fn current(&self) -> Result<Option<PushSubscriptionRecord>>;
}

/// Asks the user whether notifications are allowed.
#[async_trait]
pub trait PermissionPrompt: Send + Sync {
  async fn prompt(&self) -> Result<Permission>;
}

/// Prompts on the terminal. Anything but `y`/`yes` denies.
pub struct TerminalPrompt;

#[async_trait]
impl PermissionPrompt for TerminalPrompt {
  async fn prompt(&self) -> Result<Permission> {
    use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};

    let mut stdout = tokio::io::stdout();
    stdout.write_all(b"Allow notifications? [y/N] ").await?;
    stdout.flush().await?;

    let mut answer = String::new();
    BufReader::new(tokio::io::stdin())
      .read_line(&mut answer)
      .await?;

    Ok(match answer.trim().to_lowercase().as_str() {
      "y" | "yes" => Permission::Granted,
      _ => Permission::Denied,
    })
  }
}

/// Push service reached over HTTP. The current record is kept in the local
/// database.
pub struct HttpPushService {
  client: reqwest::Client,
  service_url: Url,
  db: Arc<Database>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct SubscribeBody {
  user_visible_only: bool,
  application_server_key: String,
}

impl HttpPushService {
  pub fn new(service_url: Url, db: Arc<Database>, timeout: Duration) -> Result<Self> {
    let client = reqwest::Client::builder()
      .timeout(timeout)
      .build()
      .map_err(|e| eyre!("Failed to create HTTP client: {}", e))?;
    Ok(Self {
      client,
      service_url,
      db,
    })
  }

  fn subscriptions_url(&self) -> Result<Url> {
    self
      .service_url
      .join("subscriptions")
      .map_err(|e| eyre!("Invalid push service URL: {}", e))
  }

  fn store(&self, record: &PushSubscriptionRecord) -> Result<()> {
    let json = serde_json::to_string(record)
      .map_err(|e| eyre!("Failed to serialize subscription: {}", e))?;
    self.db.kv_set(SUBSCRIPTION_KEY, &json)
  }
}

#[async_trait]
impl PushService for HttpPushService {
  async fn subscribe(&self, options: &SubscribeOptions) -> Result<PushSubscriptionRecord> {
    let body = SubscribeBody {
      user_visible_only: options.user_visible_only,
      application_server_key: encode_server_key(&options.application_server_key),
    };
    let response = self
      .client
      .post(self.subscriptions_url()?)
      .json(&body)
      .send()
      .await
      .map_err(|e| eyre!("Failed to reach push service: {}", e))?
      .error_for_status()
      .map_err(|e| eyre!("Push service refused subscription: {}", e))?;

    let record: PushSubscriptionRecord = response
      .json()
      .await
      .map_err(|e| eyre!("Invalid subscription from push service: {}", e))?;
    self.store(&record)?;
    tracing::info!(endpoint = %record.endpoint, "subscribed to push");
    Ok(record)
  }

  async fn unsubscribe(&self, subscription: &PushSubscriptionRecord) -> Result<()> {
    self
      .client
      .delete(self.subscriptions_url()?)
      .json(subscription)
      .send()
      .await
      .map_err(|e| eyre!("Failed to reach push service: {}", e))?
      .error_for_status()
      .map_err(|e| eyre!("Push service refused unsubscribe: {}", e))?;
    self.db.kv_delete(SUBSCRIPTION_KEY)?;
    tracing::info!(endpoint = %subscription.endpoint, "unsubscribed from push");
    Ok(())
  }

  async fn current(&self) -> Result<Option<PushSubscriptionRecord>> {
    match self.db.kv_get(SUBSCRIPTION_KEY)? {
      Some(stored) => {
        let record = serde_json::from_str(&stored.value)
          .map_err(|e| eyre!("Failed to parse stored subscription: {}", e))?;
        Ok(Some(record))
      }
      None => Ok(None),
    }
  }
}

/// Hand a subscription to the app backend so it can address pushes.
pub async fn share_with_backend(
  client: &reqwest::Client,
  backend_url: &Url,
  record: &PushSubscriptionRecord,
) -> Result<()> {
  client
    .post(backend_url.clone())
    .json(record)
    .send()
    .await
    .map_err(|e| eyre!("Failed to reach backend: {}", e))?
    .error_for_status()
    .map_err(|e| eyre!("Backend refused subscription: {}", e))?;
  Ok(())
}

/// The user's notification decision, asked for at most once.
pub struct NotificationPermissions {
  prompt: Arc<dyn PermissionPrompt>,
  db: Arc<Database>,
}

impl NotificationPermissions {
  pub fn new(prompt: Arc<dyn PermissionPrompt>, db: Arc<Database>) -> Self {
    Self { prompt, db }
  }

  /// The stored decision, `Default` if the user was never asked.
  pub fn current(&self) -> Result<Permission> {
    match self.db.kv_get(PERMISSION_KEY)? {
      Some(stored) => serde_json::from_str(&stored.value)
        .map_err(|e| eyre!("Failed to parse stored permission: {}", e)),
      None => Ok(Permission::Default),
    }
  }

  /// Ask unless the user already decided.
  pub async fn request(&self) -> Result<Permission> {
    let current = self.current()?;
    if current != Permission::Default {
      return Ok(current);
    }

    let decided = self.prompt.prompt().await?;
    let json = serde_json::to_string(&decided)
      .map_err(|e| eyre!("Failed to serialize permission: {}", e))?;
    self.db.kv_set(PERMISSION_KEY, &json)?;
    tracing::info!(permission = ?decided, "notification permission decided");
    Ok(decided)
  }
}

/// Registers this installation for push once the worker is active.
pub struct SubscriptionManager {
  service: Arc<dyn PushService>,
  permissions: NotificationPermissions,
  ready: watch::Receiver<LifecycleState>,
}

impl SubscriptionManager {
  pub fn new(
    service: Arc<dyn PushService>,
    permissions: NotificationPermissions,
    ready: watch::Receiver<LifecycleState>,
  ) -> Self {
    Self {
      service,
      permissions,
      ready,
    }
  }

  pub async fn request_permission(&self) -> Result<Permission> {
    self.permissions.request().await
  }

  /// Resolves once the worker is active.
  pub async fn ready(&self) -> Result<()> {
    let mut ready = self.ready.clone();
    ready
      .wait_for(|state| *state == LifecycleState::Active)
      .await
      .map_err(|_| eyre!("Worker stopped before becoming active"))?;
    Ok(())
  }

  pub async fn subscribe(&self, server_key: &str) -> Result<PushSubscriptionRecord> {
    let application_server_key = decode_server_key(server_key)?;
    self.ready().await?;
    self
      .service
      .subscribe(&SubscribeOptions {
        user_visible_only: true,
        application_server_key,
      })
      .await
  }

  /// Returns whether a subscription existed.
  pub async fn unsubscribe(&self) -> Result<bool> {
    self.ready().await?;
    match self.service.current().await? {
      Some(subscription) => {
        self.service.unsubscribe(&subscription).await?;
        Ok(true)
      }
      None => Ok(false),
    }
  }

  pub async fn get_subscription(&self) -> Result<Option<PushSubscriptionRecord>> {
    self.ready().await?;
    self.service.current().await
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use serde_json::json;
  use std::sync::atomic::{AtomicUsize, Ordering};
  use std::sync::Mutex;
  use wiremock::matchers::{body_json, method, path};
  use wiremock::{Mock, MockServer, ResponseTemplate};

  fn record() -> PushSubscriptionRecord {
    PushSubscriptionRecord {
      endpoint: "https://push.example.net/send/abc".to_string(),
      expiration_time: None,
      keys: SubscriptionKeys {
        p256dh: "BNc...".to_string(),
        auth: "tBH...".to_string(),
      },
    }
  }

  #[derive(Default)]
  struct FakePushService {
    current: Mutex<Option<PushSubscriptionRecord>>,
    last_options: Mutex<Option<SubscribeOptions>>,
    network_calls: AtomicUsize,
  }

  #[async_trait]
  impl PushService for FakePushService {
    async fn subscribe(&self, options: &SubscribeOptions) -> Result<PushSubscriptionRecord> {
      self.network_calls.fetch_add(1, Ordering::SeqCst);
      *self.last_options.lock().unwrap() = Some(options.clone());
      *self.current.lock().unwrap() = Some(record());
      Ok(record())
    }

    async fn unsubscribe(&self, _: &PushSubscriptionRecord) -> Result<()> {
      self.network_calls.fetch_add(1, Ordering::SeqCst);
      *self.current.lock().unwrap() = None;
      Ok(())
    }

    async fn current(&self) -> Result<Option<PushSubscriptionRecord>> {
      Ok(self.current.lock().unwrap().clone())
    }
  }

  struct FixedPrompt {
    answer: Permission,
    asked: AtomicUsize,
  }

  #[async_trait]
  impl PermissionPrompt for FixedPrompt {
    async fn prompt(&self) -> Result<Permission> {
      self.asked.fetch_add(1, Ordering::SeqCst);
      Ok(self.answer)
    }
  }

  struct Fixture {
    manager: SubscriptionManager,
    service: Arc<FakePushService>,
    prompt: Arc<FixedPrompt>,
    state: watch::Sender<LifecycleState>,
  }

  fn fixture(state: LifecycleState, answer: Permission) -> Fixture {
    let service = Arc::new(FakePushService::default());
    let prompt = Arc::new(FixedPrompt {
      answer,
      asked: AtomicUsize::new(0),
    });
    let (state_tx, state_rx) = watch::channel(state);
    let permissions = NotificationPermissions::new(
      prompt.clone(),
      Arc::new(Database::open_in_memory().unwrap()),
    );
    let manager = SubscriptionManager::new(service.clone(), permissions, state_rx);
    Fixture {
      manager,
      service,
      prompt,
      state: state_tx,
    }
  }

  #[test]
  fn test_server_key_padding_is_optional() {
    let bytes = vec![0xfb, 0xff, 0x01, 0x02, 0x03];
    let encoded = encode_server_key(&bytes);
    assert!(!encoded.contains('='));
    assert!(encoded.contains('-') || encoded.contains('_'));

    assert_eq!(decode_server_key(&encoded).unwrap(), bytes);
    assert_eq!(encoded, "-_8BAgM");
    assert_eq!(decode_server_key("-_8BAgM=").unwrap(), bytes);
    assert!(decode_server_key("not base64!").is_err());
  }

  #[test]
  fn test_record_wire_format() {
    let mut rec = record();
    rec.expiration_time = Some(1_700_000_000_000);
    let value = serde_json::to_value(&rec).unwrap();
    assert_eq!(value["expirationTime"], 1_700_000_000_000i64);
    assert_eq!(value["keys"]["p256dh"], "BNc...");

    let without: PushSubscriptionRecord = serde_json::from_value(json!({
      "endpoint": "https://push.example.net/x",
      "keys": {"p256dh": "a", "auth": "b"}
    }))
    .unwrap();
    assert_eq!(without.expiration_time, None);
  }

  #[tokio::test]
  async fn test_permission_asked_once() {
    let f = fixture(LifecycleState::Active, Permission::Granted);
    assert_eq!(f.manager.permissions.current().unwrap(), Permission::Default);

    assert_eq!(f.manager.request_permission().await.unwrap(), Permission::Granted);
    assert_eq!(f.manager.request_permission().await.unwrap(), Permission::Granted);
    assert_eq!(f.prompt.asked.load(Ordering::SeqCst), 1);
  }

  #[tokio::test]
  async fn test_denied_short_circuits() {
    let f = fixture(LifecycleState::Active, Permission::Denied);
    f.manager.request_permission().await.unwrap();
    assert_eq!(f.manager.request_permission().await.unwrap(), Permission::Denied);
    assert_eq!(f.prompt.asked.load(Ordering::SeqCst), 1);
  }

  #[tokio::test]
  async fn test_subscribe_waits_for_active_worker() {
    let f = Arc::new(fixture(LifecycleState::Installing, Permission::Granted));

    let pending = {
      let f = f.clone();
      tokio::spawn(async move { f.manager.subscribe("AQID").await })
    };
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert!(!pending.is_finished());
    assert_eq!(f.service.network_calls.load(Ordering::SeqCst), 0);

    f.state.send_replace(LifecycleState::Active);
    let subscribed = pending.await.unwrap().unwrap();
    assert_eq!(subscribed, record());

    let options = f.service.last_options.lock().unwrap().clone().unwrap();
    assert!(options.user_visible_only);
    assert_eq!(options.application_server_key, vec![1, 2, 3]);
  }

  #[tokio::test]
  async fn test_bad_key_fails_before_subscribing() {
    let f = fixture(LifecycleState::Active, Permission::Granted);
    assert!(f.manager.subscribe("%%%").await.is_err());
    assert_eq!(f.service.network_calls.load(Ordering::SeqCst), 0);
  }

  #[tokio::test]
  async fn test_unsubscribe_without_subscription() {
    let f = fixture(LifecycleState::Active, Permission::Granted);
    assert!(!f.manager.unsubscribe().await.unwrap());
    assert_eq!(f.service.network_calls.load(Ordering::SeqCst), 0);
  }

  #[tokio::test]
  async fn test_unsubscribe_existing() {
    let f = fixture(LifecycleState::Active, Permission::Granted);
    f.manager.subscribe("AQID").await.unwrap();
    assert!(f.manager.get_subscription().await.unwrap().is_some());

    assert!(f.manager.unsubscribe().await.unwrap());
    assert!(f.manager.get_subscription().await.unwrap().is_none());
  }

  #[tokio::test]
  async fn test_http_push_service_round_trip() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
      .and(path("/subscriptions"))
      .and(body_json(json!({"userVisibleOnly": true, "applicationServerKey": "AQID"})))
      .respond_with(ResponseTemplate::new(201).set_body_json(&record()))
      .mount(&server)
      .await;
    Mock::given(method("DELETE"))
      .and(path("/subscriptions"))
      .respond_with(ResponseTemplate::new(204))
      .mount(&server)
      .await;

    let db = Arc::new(Database::open_in_memory().unwrap());
    let base = Url::parse(&format!("{}/", server.uri())).unwrap();
    let service = HttpPushService::new(base, db, Duration::from_secs(5)).unwrap();

    let options = SubscribeOptions {
      user_visible_only: true,
      application_server_key: vec![1, 2, 3],
    };
    let subscribed = service.subscribe(&options).await.unwrap();
    assert_eq!(service.current().await.unwrap(), Some(subscribed.clone()));

    service.unsubscribe(&subscribed).await.unwrap();
    assert_eq!(service.current().await.unwrap(), None);
  }

  #[tokio::test]
  async fn test_http_push_service_refusal_stores_nothing() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
      .and(path("/subscriptions"))
      .respond_with(ResponseTemplate::new(403))
      .mount(&server)
      .await;

    let db = Arc::new(Database::open_in_memory().unwrap());
    let base = Url::parse(&format!("{}/", server.uri())).unwrap();
    let service = HttpPushService::new(base, db, Duration::from_secs(5)).unwrap();
    let options = SubscribeOptions {
      user_visible_only: true,
      application_server_key: vec![1, 2, 3],
    };

    assert!(service.subscribe(&options).await.is_err());
    assert_eq!(service.current().await.unwrap(), None);
  }

  #[tokio::test]
  async fn test_share_with_backend_posts_record() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
      .and(path("/api/push/subscribe"))
      .and(body_json(&record()))
      .respond_with(ResponseTemplate::new(200))
      .expect(1)
      .mount(&server)
      .await;

    let url = Url::parse(&format!("{}/api/push/subscribe", server.uri())).unwrap();
    share_with_backend(&reqwest::Client::new(), &url, &record())
      .await
      .unwrap();
  }
}
