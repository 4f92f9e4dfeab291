//! Cache store trait and SQLite implementation.

use chrono::{DateTime, TimeZone, Utc};
use color_eyre::{eyre::eyre, Result};
use reqwest::Method;
use rusqlite::{params, Connection, OptionalExtension};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use url::Url;

use super::traits::{CacheEntry, CacheVersion, RequestKey};
use crate::db::Database;

/// Trait for versioned response storage.
pub trait CacheStore: Send + Sync {
  /// Make sure a version exists, even with no entries.
  fn open(&self, version: &CacheVersion) -> Result<()>;

  /// Look up a captured response.
  fn get(&self, version: &CacheVersion, key: &RequestKey) -> Result<Option<CacheEntry>>;

  /// Store a response. Returns false without writing if the status is not successful.
  fn put(&self, version: &CacheVersion, key: &RequestKey, entry: &CacheEntry) -> Result<bool>;

  /// Store a batch of responses, all or nothing.
  fn put_all(&self, version: &CacheVersion, entries: &[(RequestKey, CacheEntry)]) -> Result<()>;

  /// Request identities cached under a version, oldest first.
  fn keys(&self, version: &CacheVersion) -> Result<Vec<RequestKey>>;

  /// Drop a whole version. Returns whether it existed.
  fn delete_version(&self, tag: &str) -> Result<bool>;

  /// Every known version tag.
  fn list_versions(&self) -> Result<BTreeSet<String>>;
}

/// SQLite-based cache store.
pub struct SqliteCacheStore {
  db: Arc<Database>,
}

impl SqliteCacheStore {
  pub fn new(db: Arc<Database>) -> Self {
    Self { db }
  }
}

fn ensure_version(conn: &Connection, version: &CacheVersion) -> Result<()> {
  conn
    .execute(
      "INSERT OR IGNORE INTO cache_versions (tag) VALUES (?)",
      params![version.as_str()],
    )
    .map_err(|e| eyre!("Failed to open cache {}: {}", version, e))?;
  Ok(())
}

fn insert_entry(
  conn: &Connection,
  version: &CacheVersion,
  key: &RequestKey,
  entry: &CacheEntry,
) -> Result<()> {
  let headers =
    serde_json::to_string(&entry.headers).map_err(|e| eyre!("Failed to serialize headers: {}", e))?;

  conn
    .execute(
      "INSERT OR REPLACE INTO cache_entries
         (version, key_hash, method, url, status, headers, body, cached_at, seq)
       VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8,
         (SELECT COALESCE(MAX(seq), 0) + 1 FROM cache_entries WHERE version = ?1))",
      params![
        version.as_str(),
        key.cache_hash(),
        key.method.as_str(),
        key.url.as_str(),
        entry.status,
        headers,
        entry.body,
        entry.cached_at.timestamp_millis(),
      ],
    )
    .map_err(|e| eyre!("Failed to store {}: {}", key, e))?;

  Ok(())
}

impl CacheStore for SqliteCacheStore {
  fn open(&self, version: &CacheVersion) -> Result<()> {
    let conn = self.db.conn()?;
    ensure_version(&conn, version)
  }

  fn get(&self, version: &CacheVersion, key: &RequestKey) -> Result<Option<CacheEntry>> {
    let conn = self.db.conn()?;

    let row: Option<(u16, String, Vec<u8>, i64)> = conn
      .query_row(
        "SELECT status, headers, body, cached_at FROM cache_entries
         WHERE version = ? AND key_hash = ?",
        params![version.as_str(), key.cache_hash()],
        |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?)),
      )
      .optional()
      .map_err(|e| eyre!("Failed to look up {}: {}", key, e))?;

    match row {
      Some((status, headers, body, cached_at)) => {
        let headers: BTreeMap<String, String> = serde_json::from_str(&headers)
          .map_err(|e| eyre!("Failed to deserialize headers: {}", e))?;
        Ok(Some(CacheEntry {
          status,
          headers,
          body,
          cached_at: millis_to_datetime(cached_at)?,
        }))
      }
      None => Ok(None),
    }
  }

  fn put(&self, version: &CacheVersion, key: &RequestKey, entry: &CacheEntry) -> Result<bool> {
    if !entry.is_success() {
      tracing::debug!(%key, status = entry.status, "not caching unsuccessful response");
      return Ok(false);
    }

    let conn = self.db.conn()?;
    ensure_version(&conn, version)?;
    insert_entry(&conn, version, key, entry)?;
    Ok(true)
  }

  fn put_all(&self, version: &CacheVersion, entries: &[(RequestKey, CacheEntry)]) -> Result<()> {
    if let Some((key, entry)) = entries.iter().find(|(_, e)| !e.is_success()) {
      return Err(eyre!(
        "Refusing to cache {} with status {}",
        key,
        entry.status
      ));
    }

    let conn = self.db.conn()?;

    conn
      .execute("BEGIN TRANSACTION", [])
      .map_err(|e| eyre!("Failed to begin transaction: {}", e))?;

    let result = ensure_version(&conn, version).and_then(|_| {
      entries
        .iter()
        .try_for_each(|(key, entry)| insert_entry(&conn, version, key, entry))
    });

    match result {
      Ok(()) => {
        conn
          .execute("COMMIT", [])
          .map_err(|e| eyre!("Failed to commit transaction: {}", e))?;
        Ok(())
      }
      Err(err) => {
        let _ = conn.execute("ROLLBACK", []);
        Err(err)
      }
    }
  }

  fn keys(&self, version: &CacheVersion) -> Result<Vec<RequestKey>> {
    let conn = self.db.conn()?;

    let mut stmt = conn
      .prepare("SELECT method, url FROM cache_entries WHERE version = ? ORDER BY seq")
      .map_err(|e| eyre!("Failed to prepare key query: {}", e))?;

    let rows: Vec<(String, String)> = stmt
      .query_map(params![version.as_str()], |row| Ok((row.get(0)?, row.get(1)?)))
      .map_err(|e| eyre!("Failed to list cache keys: {}", e))?
      .filter_map(|r| r.ok())
      .collect();

    rows
      .into_iter()
      .map(|(method, url)| {
        let method = Method::from_bytes(method.as_bytes())
          .map_err(|e| eyre!("Invalid cached method '{}': {}", method, e))?;
        let url = Url::parse(&url).map_err(|e| eyre!("Invalid cached url '{}': {}", url, e))?;
        Ok(RequestKey::new(method, url))
      })
      .collect()
  }

  fn delete_version(&self, tag: &str) -> Result<bool> {
    let conn = self.db.conn()?;

    conn
      .execute("BEGIN TRANSACTION", [])
      .map_err(|e| eyre!("Failed to begin transaction: {}", e))?;

    let result = conn
      .execute("DELETE FROM cache_entries WHERE version = ?", params![tag])
      .and_then(|_| conn.execute("DELETE FROM cache_versions WHERE tag = ?", params![tag]));

    match result {
      Ok(removed) => {
        conn
          .execute("COMMIT", [])
          .map_err(|e| eyre!("Failed to commit transaction: {}", e))?;
        Ok(removed > 0)
      }
      Err(e) => {
        let _ = conn.execute("ROLLBACK", []);
        Err(eyre!("Failed to delete cache {}: {}", tag, e))
      }
    }
  }

  fn list_versions(&self) -> Result<BTreeSet<String>> {
    let conn = self.db.conn()?;

    let mut stmt = conn
      .prepare("SELECT tag FROM cache_versions")
      .map_err(|e| eyre!("Failed to prepare version query: {}", e))?;

    let tags = stmt
      .query_map([], |row| row.get(0))
      .map_err(|e| eyre!("Failed to list cache versions: {}", e))?
      .filter_map(|r| r.ok())
      .collect();

    Ok(tags)
  }
}

fn millis_to_datetime(millis: i64) -> Result<DateTime<Utc>> {
  Utc
    .timestamp_millis_opt(millis)
    .single()
    .ok_or_else(|| eyre!("Invalid cache timestamp {}", millis))
}

#[cfg(test)]
mod tests {
  use super::*;
  use chrono::Utc;

  fn store() -> SqliteCacheStore {
    SqliteCacheStore::new(Arc::new(Database::open_in_memory().unwrap()))
  }

  fn entry(status: u16, body: &str) -> CacheEntry {
    CacheEntry {
      status,
      headers: BTreeMap::from([("content-type".to_string(), "text/plain".to_string())]),
      body: body.as_bytes().to_vec(),
      cached_at: Utc.timestamp_millis_opt(1_700_000_000_000).unwrap(),
    }
  }

  fn key(path: &str) -> RequestKey {
    RequestKey::get(Url::parse(&format!("https://chat.example.com{}", path)).unwrap())
  }

  #[test]
  fn test_put_then_get() {
    let store = store();
    let v1 = CacheVersion::new("v1");

    assert!(store.get(&v1, &key("/app.js")).unwrap().is_none());
    assert!(store.put(&v1, &key("/app.js"), &entry(200, "js")).unwrap());

    let got = store.get(&v1, &key("/app.js")).unwrap().unwrap();
    assert_eq!(got, entry(200, "js"));
    assert_eq!(got.cached_at.timestamp_millis(), 1_700_000_000_000);
  }

  #[test]
  fn test_put_replaces_existing_value() {
    let store = store();
    let v1 = CacheVersion::new("v1");
    store.put(&v1, &key("/api/me"), &entry(200, "old")).unwrap();
    store.put(&v1, &key("/api/me"), &entry(200, "new")).unwrap();

    let got = store.get(&v1, &key("/api/me")).unwrap().unwrap();
    assert_eq!(got.body, b"new");
    assert_eq!(store.keys(&v1).unwrap().len(), 1);
  }

  #[test]
  fn test_unsuccessful_responses_are_not_written() {
    let store = store();
    let v1 = CacheVersion::new("v1");
    assert!(!store.put(&v1, &key("/missing"), &entry(404, "nope")).unwrap());
    assert!(store.get(&v1, &key("/missing")).unwrap().is_none());
  }

  #[test]
  fn test_versions_are_partitioned() {
    let store = store();
    let v1 = CacheVersion::new("v1");
    let v2 = CacheVersion::new("v2");
    store.put(&v1, &key("/app.js"), &entry(200, "one")).unwrap();
    store.open(&v2).unwrap();

    assert!(store.get(&v2, &key("/app.js")).unwrap().is_none());
    assert_eq!(
      store.list_versions().unwrap(),
      BTreeSet::from(["v1".to_string(), "v2".to_string()])
    );
  }

  #[test]
  fn test_delete_version_removes_entries() {
    let store = store();
    let v1 = CacheVersion::new("v1");
    store.put(&v1, &key("/app.js"), &entry(200, "one")).unwrap();

    assert!(store.delete_version("v1").unwrap());
    assert!(!store.delete_version("v1").unwrap());
    assert!(store.list_versions().unwrap().is_empty());
    assert!(store.get(&v1, &key("/app.js")).unwrap().is_none());
  }

  #[test]
  fn test_put_all_is_all_or_nothing() {
    let store = store();
    let v2 = CacheVersion::new("v2");
    let batch = vec![
      (key("/"), entry(200, "root")),
      (key("/icon.png"), entry(500, "boom")),
    ];

    assert!(store.put_all(&v2, &batch).is_err());
    assert!(store.keys(&v2).unwrap().is_empty());

    let batch = vec![(key("/"), entry(200, "root")), (key("/a.css"), entry(200, "css"))];
    store.put_all(&v2, &batch).unwrap();
    let keys = store.keys(&v2).unwrap();
    assert_eq!(keys, vec![key("/"), key("/a.css")]);
  }
}
