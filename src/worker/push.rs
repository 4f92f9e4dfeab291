//! Push payloads to notifications, and notification clicks back to pages.

use color_eyre::Result;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::Mutex;
use url::Url;

use super::clients::{Client, Clients};
use crate::config::NotificationConfig;

const MESSAGE_PREVIEW_CHARS: usize = 50;

/// Notification permission as decided by the user.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Permission {
  /// Not decided yet; asking is allowed
  Default,
  Granted,
  Denied,
}

/// A button on a notification.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NotificationAction {
  pub action: String,
  pub title: String,
}

/// Wire shape of a push payload. Every field is optional.
#[derive(Debug, Default, Deserialize)]
struct PushPayload {
  title: Option<String>,
  body: Option<String>,
  tag: Option<String>,
  data: Option<Value>,
  actions: Option<Vec<NotificationAction>>,
}

/// A notification ready to be displayed.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NotificationIntent {
  pub title: String,
  pub body: String,
  pub icon: String,
  pub badge: String,
  /// Notifications sharing a tag replace each other
  pub tag: String,
  /// Re-alert the user when replacing a notification with the same tag
  pub renotify: bool,
  pub vibrate: Vec<u32>,
  pub data: Value,
  pub actions: Vec<NotificationAction>,
}

impl NotificationIntent {
  fn new(title: String, body: String, defaults: &NotificationConfig) -> Self {
    Self {
      title,
      body,
      icon: defaults.icon.clone(),
      badge: defaults.icon.clone(),
      tag: "default".to_string(),
      renotify: true,
      vibrate: vec![200, 100, 200],
      data: json!({}),
      actions: default_actions(),
    }
  }
}

fn default_actions() -> Vec<NotificationAction> {
  vec![
    NotificationAction {
      action: "open".to_string(),
      title: "Open".to_string(),
    },
    NotificationAction {
      action: "dismiss".to_string(),
      title: "Dismiss".to_string(),
    },
  ]
}

/// Build a notification from a raw push payload. Never fails: anything that is
/// not a JSON object becomes the body of a default notification.
pub fn parse_push(payload: Option<&[u8]>, defaults: &NotificationConfig) -> NotificationIntent {
  let Some(bytes) = payload else {
    return NotificationIntent::new(
      defaults.default_title.clone(),
      defaults.default_body.clone(),
      defaults,
    );
  };

  match serde_json::from_slice::<Value>(bytes) {
    Ok(value @ Value::Object(_)) => {
      let parsed: PushPayload = serde_json::from_value(value).unwrap_or_else(|e| {
        tracing::warn!("push payload fields malformed, using defaults: {}", e);
        PushPayload::default()
      });
      let mut intent = NotificationIntent::new(
        parsed.title.unwrap_or_else(|| defaults.default_title.clone()),
        parsed.body.unwrap_or_else(|| defaults.default_body.clone()),
        defaults,
      );
      if let Some(tag) = parsed.tag {
        intent.tag = tag;
      }
      if let Some(data) = parsed.data {
        intent.data = data;
      }
      if let Some(actions) = parsed.actions {
        intent.actions = actions;
      }
      intent
    }
    Ok(Value::String(text)) => NotificationIntent::new(defaults.default_title.clone(), text, defaults),
    _ => {
      let text = String::from_utf8_lossy(bytes).into_owned();
      tracing::debug!("push payload is not JSON, showing it as text");
      NotificationIntent::new(defaults.default_title.clone(), text, defaults)
    }
  }
}

/// Local notification announcing a new chat message.
pub fn message_notification(message: &Value, defaults: &NotificationConfig) -> NotificationIntent {
  let sender = message
    .get("sender")
    .and_then(Value::as_str)
    .unwrap_or("Assistant");
  let text = message
    .get("text")
    .and_then(Value::as_str)
    .unwrap_or("[image/voice]");

  let preview = if text.chars().count() > MESSAGE_PREVIEW_CHARS {
    let cut: String = text.chars().take(MESSAGE_PREVIEW_CHARS).collect();
    format!("{}...", cut)
  } else {
    text.to_string()
  };

  let mut intent = NotificationIntent::new(sender.to_string(), preview, defaults);
  intent.tag = "new-message".to_string();
  intent.data = message.clone();
  intent
}

/// What happened when a notification was displayed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Shown {
  New,
  /// Took the place of a notification with the same tag
  Replaced { realerted: bool },
}

/// Notifications currently on screen, one per tag.
#[derive(Debug, Default)]
pub struct NotificationTray {
  shown: Mutex<Vec<NotificationIntent>>,
}

impl NotificationTray {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn show(&self, intent: NotificationIntent) -> Shown {
    tracing::info!(title = %intent.title, tag = %intent.tag, "showing notification");
    let mut shown = self.shown.lock().unwrap_or_else(|e| e.into_inner());
    match shown.iter_mut().find(|n| n.tag == intent.tag) {
      Some(existing) => {
        let realerted = intent.renotify;
        *existing = intent;
        Shown::Replaced { realerted }
      }
      None => {
        shown.push(intent);
        Shown::New
      }
    }
  }

  /// Show a local notification, but only with permission.
  pub fn show_if_permitted(&self, permission: Permission, intent: NotificationIntent) -> Option<Shown> {
    if permission != Permission::Granted {
      tracing::warn!(?permission, "notifications not permitted");
      return None;
    }
    Some(self.show(intent))
  }

  pub fn get(&self, tag: &str) -> Option<NotificationIntent> {
    let shown = self.shown.lock().unwrap_or_else(|e| e.into_inner());
    shown.iter().find(|n| n.tag == tag).cloned()
  }

  pub fn close(&self, tag: &str) -> Option<NotificationIntent> {
    let mut shown = self.shown.lock().unwrap_or_else(|e| e.into_inner());
    let index = shown.iter().position(|n| n.tag == tag)?;
    Some(shown.remove(index))
  }

  pub fn all(&self) -> Vec<NotificationIntent> {
    self.shown.lock().unwrap_or_else(|e| e.into_inner()).clone()
  }
}

/// Message posted to pages after a notification click.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RelayMessage {
  #[serde(rename = "type")]
  pub kind: String,
  pub notification: RelayedNotification,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RelayedNotification {
  pub title: String,
  pub body: String,
  pub data: Value,
}

impl RelayMessage {
  pub fn notification_click(intent: &NotificationIntent) -> Self {
    Self {
      kind: "notificationclick".to_string(),
      notification: RelayedNotification {
        title: intent.title.clone(),
        body: intent.body.clone(),
        data: intent.data.clone(),
      },
    }
  }
}

/// Result of a notification click.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClickOutcome {
  /// Closed, nothing else
  Dismissed,
  /// An existing app page was focused, then `notified` pages got the relay message
  Focused { client_id: String, notified: usize },
  /// A new app page was opened, then `notified` pages got the relay message
  Opened { client_id: String, notified: usize },
}

/// Handle a click on a displayed notification.
///
/// The notification is always closed. Unless the action is `dismiss`, an app
/// page is focused or opened first, and only after that the relay message is
/// posted to every open page.
pub async fn handle_click(
  notification: &NotificationIntent,
  action: Option<&str>,
  tray: &NotificationTray,
  clients: &Clients,
  app_root: &Url,
) -> Result<ClickOutcome> {
  tray.close(&notification.tag);

  if action == Some("dismiss") {
    tracing::debug!(tag = %notification.tag, "notification dismissed");
    return Ok(ClickOutcome::Dismissed);
  }

  let existing = clients
    .match_all(true)
    .await
    .into_iter()
    .find(|c| &c.url == app_root);

  let (client_id, opened) = match existing {
    Some(client) => (clients.focus(&client.id).await?.id, false),
    None => (clients.open_window(app_root.clone()).await.id, true),
  };

  let message = serde_json::to_value(RelayMessage::notification_click(notification))?;
  let pages = clients.match_all(true).await;
  let notified = relay(clients, &pages, &message).await;

  Ok(if opened {
    ClickOutcome::Opened { client_id, notified }
  } else {
    ClickOutcome::Focused { client_id, notified }
  })
}

/// Post `message` to each page, skipping any that went away. Returns how many got it.
async fn relay(clients: &Clients, pages: &[Client], message: &Value) -> usize {
  let mut delivered = 0;
  for page in pages {
    match clients.post_message(&page.id, message.clone()).await {
      Ok(()) => delivered += 1,
      Err(err) => tracing::warn!(page = %page.id, "relay message not delivered: {}", err),
    }
  }
  delivered
}
