//! Durable queue of messages that could not be delivered while offline.
//!
//! The whole queue lives as one JSON array under a single well-known key, so
//! the worker and foreground code can both reach it. Every mutation is a
//! read-modify-write guarded by a revision check on that key: a writer whose
//! snapshot went stale starts over from a fresh read instead of overwriting.

use chrono::{DateTime, Utc};
use color_eyre::{eyre::eyre, Result};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::clock::Clock;
use crate::db::Database;

/// Storage key holding the JSON-encoded queue.
pub const OFFLINE_MESSAGES_KEY: &str = "offline_messages";

/// Maximum number of retained messages.
pub const QUEUE_CAPACITY: usize = 50;

const MAX_WRITE_ATTEMPTS: usize = 8;

/// A message waiting for replay.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueuedMessage {
  pub id: u64,
  pub payload: serde_json::Value,
  #[serde(with = "chrono::serde::ts_milliseconds")]
  pub timestamp: DateTime<Utc>,
}

/// Capacity-bounded FIFO of undelivered messages.
#[derive(Clone)]
pub struct OfflineQueue {
  db: Arc<Database>,
  clock: Arc<dyn Clock>,
  capacity: usize,
}

impl OfflineQueue {
  pub fn new(db: Arc<Database>, clock: Arc<dyn Clock>) -> Self {
    Self {
      db,
      clock,
      capacity: QUEUE_CAPACITY,
    }
  }

  /// Append a message, evicting the oldest ones beyond capacity.
  pub fn enqueue(&self, payload: serde_json::Value) -> Result<QueuedMessage> {
    let timestamp = self.clock.now();
    let capacity = self.capacity;

    self.update(|messages| {
      // Seeded from the clock so ids are not reused after the queue empties
      let id = messages
        .last()
        .map(|m| m.id + 1)
        .unwrap_or(0)
        .max(timestamp.timestamp_millis().max(0) as u64);
      let message = QueuedMessage {
        id,
        payload: payload.clone(),
        timestamp,
      };
      messages.push(message.clone());
      while messages.len() > capacity {
        let evicted = messages.remove(0);
        tracing::debug!(id = evicted.id, "offline queue full, evicting oldest message");
      }
      message
    })
  }

  /// Every queued message, oldest first. Nothing is removed.
  pub fn drain(&self) -> Result<Vec<QueuedMessage>> {
    Ok(self.load()?.map(|(messages, _)| messages).unwrap_or_default())
  }

  /// Remove a single message after it was replayed successfully.
  pub fn remove(&self, id: u64) -> Result<bool> {
    self.update(|messages| {
      let before = messages.len();
      messages.retain(|m| m.id != id);
      messages.len() != before
    })
  }

  /// Drop everything.
  pub fn clear(&self) -> Result<()> {
    self.db.kv_delete(OFFLINE_MESSAGES_KEY)?;
    Ok(())
  }

  pub fn len(&self) -> Result<usize> {
    Ok(self.drain()?.len())
  }

  fn load(&self) -> Result<Option<(Vec<QueuedMessage>, i64)>> {
    let Some(stored) = self.db.kv_get(OFFLINE_MESSAGES_KEY)? else {
      return Ok(None);
    };

    let messages = serde_json::from_str(&stored.value).unwrap_or_else(|e| {
      tracing::warn!("discarding unreadable offline queue: {}", e);
      Vec::new()
    });
    Ok(Some((messages, stored.revision)))
  }

  fn update<R>(&self, mut apply: impl FnMut(&mut Vec<QueuedMessage>) -> R) -> Result<R> {
    for attempt in 1..=MAX_WRITE_ATTEMPTS {
      let (mut messages, revision) = match self.load()? {
        Some((messages, revision)) => (messages, Some(revision)),
        None => (Vec::new(), None),
      };

      let result = apply(&mut messages);

      let encoded = serde_json::to_string(&messages)
        .map_err(|e| eyre!("Failed to serialize offline queue: {}", e))?;
      if self
        .db
        .kv_compare_and_set(OFFLINE_MESSAGES_KEY, revision, &encoded)?
      {
        return Ok(result);
      }
      tracing::debug!(attempt, "offline queue changed underneath us, retrying");
    }

    Err(eyre!(
      "Offline queue kept changing; gave up after {} attempts",
      MAX_WRITE_ATTEMPTS
    ))
  }
}
