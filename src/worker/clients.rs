//! Foreground pages the worker can see, focus, open and message.

use color_eyre::{eyre::eyre, Result};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::RwLock;
use url::Url;

/// Snapshot of an open page.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Client {
  pub id: String,
  pub url: Url,
  pub focused: bool,
  /// Served by the current worker version
  pub controlled: bool,
}

#[derive(Debug)]
struct Slot {
  client: Client,
  inbox: Vec<serde_json::Value>,
}

/// Registry of open foreground pages.
#[derive(Debug, Default)]
pub struct Clients {
  slots: RwLock<HashMap<String, Slot>>,
  next_id: AtomicU64,
}

impl Clients {
  pub fn new() -> Self {
    Self::default()
  }

  fn allocate_id(&self) -> String {
    format!("client-{}", self.next_id.fetch_add(1, Ordering::Relaxed) + 1)
  }

  /// A page loaded by the user. Not controlled until the worker claims it.
  pub async fn connect(&self, url: Url) -> Client {
    let client = Client {
      id: self.allocate_id(),
      url,
      focused: false,
      controlled: false,
    };
    self.slots.write().await.insert(
      client.id.clone(),
      Slot {
        client: client.clone(),
        inbox: Vec::new(),
      },
    );
    client
  }

  /// A page was closed.
  pub async fn disconnect(&self, id: &str) -> bool {
    self.slots.write().await.remove(id).is_some()
  }

  pub async fn len(&self) -> usize {
    self.slots.read().await.len()
  }

  /// All open pages, in id order. Uncontrolled pages only when asked for.
  pub async fn match_all(&self, include_uncontrolled: bool) -> Vec<Client> {
    let slots = self.slots.read().await;
    let mut clients: Vec<Client> = slots
      .values()
      .map(|s| s.client.clone())
      .filter(|c| include_uncontrolled || c.controlled)
      .collect();
    clients.sort_by_key(|c| {
      c.id
        .trim_start_matches("client-")
        .parse::<u64>()
        .unwrap_or(u64::MAX)
    });
    clients
  }

  /// Bring a page to the foreground. Other pages lose focus.
  pub async fn focus(&self, id: &str) -> Result<Client> {
    let mut slots = self.slots.write().await;
    if !slots.contains_key(id) {
      return Err(eyre!("No such client: {}", id));
    }
    for slot in slots.values_mut() {
      slot.client.focused = slot.client.id == id;
    }
    Ok(slots[id].client.clone())
  }

  /// Open a new focused page. It is controlled from the start.
  pub async fn open_window(&self, url: Url) -> Client {
    let client = Client {
      id: self.allocate_id(),
      url,
      focused: true,
      controlled: true,
    };
    let mut slots = self.slots.write().await;
    for slot in slots.values_mut() {
      slot.client.focused = false;
    }
    slots.insert(
      client.id.clone(),
      Slot {
        client: client.clone(),
        inbox: Vec::new(),
      },
    );
    client
  }

  /// Take control of every open page. Returns how many were newly claimed.
  pub async fn claim(&self) -> usize {
    let mut slots = self.slots.write().await;
    let mut claimed = 0;
    for slot in slots.values_mut() {
      if !slot.client.controlled {
        slot.client.controlled = true;
        claimed += 1;
      }
    }
    claimed
  }

  /// Deliver a message to a page.
  pub async fn post_message(&self, id: &str, message: serde_json::Value) -> Result<()> {
    let mut slots = self.slots.write().await;
    let slot = slots
      .get_mut(id)
      .ok_or_else(|| eyre!("No such client: {}", id))?;
    slot.inbox.push(message);
    Ok(())
  }

  /// Messages delivered to a page since the last call.
  pub async fn take_messages(&self, id: &str) -> Vec<serde_json::Value> {
    let mut slots = self.slots.write().await;
    slots
      .get_mut(id)
      .map(|s| std::mem::take(&mut s.inbox))
      .unwrap_or_default()
  }
}
