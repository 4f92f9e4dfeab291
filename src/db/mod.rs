pub mod schema;

use color_eyre::{eyre::eyre, Result};
use rusqlite::{params, Connection, OptionalExtension};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

/// A value read from the kv table together with the revision it was read at.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Versioned {
  pub value: String,
  pub revision: i64,
}

/// Database connection wrapper shared by the cache store, the offline queue
/// and the subscription record.
pub struct Database {
  conn: Mutex<Connection>,
}

impl Database {
  /// Open or create the database at the given path, or the default location.
  pub fn open(path: Option<&Path>) -> Result<Self> {
    let path = match path {
      Some(p) => p.to_path_buf(),
      None => Self::default_path()?,
    };

    // Ensure parent directory exists
    if let Some(parent) = path.parent() {
      std::fs::create_dir_all(parent)
        .map_err(|e| eyre!("Failed to create database directory: {}", e))?;
    }

    let conn = Connection::open(&path)
      .map_err(|e| eyre!("Failed to open database at {}: {}", path.display(), e))?;

    let db = Self {
      conn: Mutex::new(conn),
    };
    db.run_migrations()?;

    Ok(db)
  }

  /// Open a throwaway in-memory database.
  pub fn open_in_memory() -> Result<Self> {
    let conn = Connection::open_in_memory()
      .map_err(|e| eyre!("Failed to open in-memory database: {}", e))?;

    let db = Self {
      conn: Mutex::new(conn),
    };
    db.run_migrations()?;

    Ok(db)
  }

  /// Get the default database path
  pub fn default_path() -> Result<PathBuf> {
    let data_dir = dirs::data_dir()
      .or_else(|| dirs::home_dir().map(|p| p.join(".local/share")))
      .ok_or_else(|| eyre!("Could not determine data directory"))?;

    Ok(data_dir.join("relay-sw").join("relay.db"))
  }

  /// Run database migrations
  fn run_migrations(&self) -> Result<()> {
    self
      .conn()?
      .execute_batch(schema::SCHEMA)
      .map_err(|e| eyre!("Failed to run migrations: {}", e))?;
    Ok(())
  }

  /// Lock the connection
  pub fn conn(&self) -> Result<MutexGuard<'_, Connection>> {
    self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))
  }

  /// Read a kv value and its revision.
  pub fn kv_get(&self, key: &str) -> Result<Option<Versioned>> {
    let conn = self.conn()?;
    conn
      .query_row(
        "SELECT value, revision FROM kv_store WHERE key = ?",
        params![key],
        |row| {
          Ok(Versioned {
            value: row.get(0)?,
            revision: row.get(1)?,
          })
        },
      )
      .optional()
      .map_err(|e| eyre!("Failed to read {}: {}", key, e))
  }

  /// Write a kv value only if nobody changed it since `expected` was read.
  ///
  /// `expected = None` means the key must not exist yet. Returns whether the
  /// write happened.
  pub fn kv_compare_and_set(&self, key: &str, expected: Option<i64>, value: &str) -> Result<bool> {
    let conn = self.conn()?;
    let changed = match expected {
      Some(revision) => conn
        .execute(
          "UPDATE kv_store SET value = ?, revision = revision + 1
           WHERE key = ? AND revision = ?",
          params![value, key, revision],
        )
        .map_err(|e| eyre!("Failed to update {}: {}", key, e))?,
      None => conn
        .execute(
          "INSERT OR IGNORE INTO kv_store (key, value, revision) VALUES (?, ?, 0)",
          params![key, value],
        )
        .map_err(|e| eyre!("Failed to insert {}: {}", key, e))?,
    };
    Ok(changed == 1)
  }

  /// Unconditionally write a kv value.
  pub fn kv_set(&self, key: &str, value: &str) -> Result<()> {
    let conn = self.conn()?;
    conn
      .execute(
        "INSERT INTO kv_store (key, value, revision) VALUES (?, ?, 0)
         ON CONFLICT(key) DO UPDATE SET value = excluded.value, revision = revision + 1",
        params![key, value],
      )
      .map_err(|e| eyre!("Failed to write {}: {}", key, e))?;
    Ok(())
  }

  /// Remove a kv value. Returns whether it existed.
  pub fn kv_delete(&self, key: &str) -> Result<bool> {
    let conn = self.conn()?;
    let removed = conn
      .execute("DELETE FROM kv_store WHERE key = ?", params![key])
      .map_err(|e| eyre!("Failed to delete {}: {}", key, e))?;
    Ok(removed > 0)
  }
}
