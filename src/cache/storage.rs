//! Entitlement storage trait and SQLite implementation.

use chrono::Utc;
use color_eyre::{eyre::eyre, Result};
use rusqlite::{params, Connection};
use std::collections::{BTreeSet, HashMap};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

/// Durability requested for a single write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteMode {
  /// Normal write, durable once the OS gets around to it
  BestEffort,
  /// Synchronous write, flushed to disk before returning
  Flush,
}

/// Trait for entitlement storage backends.
///
/// Storage is a namespaced key -> set-of-strings map. Inserting a member that
/// already exists is a no-op.
pub trait EntitlementStorage: Send + Sync {
  /// Members of the set stored under `key`, empty if the key was never written.
  fn members(&self, namespace: &str, key: &str) -> Result<Vec<String>>;

  /// Add a member to the set stored under `key`.
  fn insert(&self, namespace: &str, key: &str, member: &str, mode: WriteMode) -> Result<()>;

  /// Remove a single member from the set stored under `key`.
  fn remove(&self, namespace: &str, key: &str, member: &str) -> Result<()>;

  /// Drop the whole set stored under `key`.
  fn remove_key(&self, namespace: &str, key: &str) -> Result<()>;
}

/// Storage that only lives as long as the process.
#[derive(Debug, Default)]
pub struct MemoryStorage {
  sets: Mutex<HashMap<(String, String), BTreeSet<String>>>,
}

impl MemoryStorage {
  pub fn new() -> Self {
    Self::default()
  }

  fn lock(&self) -> Result<MutexGuard<'_, HashMap<(String, String), BTreeSet<String>>>> {
    self
      .sets
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))
  }
}

impl EntitlementStorage for MemoryStorage {
  fn members(&self, namespace: &str, key: &str) -> Result<Vec<String>> {
    let sets = self.lock()?;
    Ok(
      sets
        .get(&(namespace.to_string(), key.to_string()))
        .map(|set| set.iter().cloned().collect())
        .unwrap_or_default(),
    )
  }

  fn insert(&self, namespace: &str, key: &str, member: &str, _mode: WriteMode) -> Result<()> {
    let mut sets = self.lock()?;
    sets
      .entry((namespace.to_string(), key.to_string()))
      .or_default()
      .insert(member.to_string());
    Ok(())
  }

  fn remove(&self, namespace: &str, key: &str, member: &str) -> Result<()> {
    let mut sets = self.lock()?;
    if let Some(set) = sets.get_mut(&(namespace.to_string(), key.to_string())) {
      set.remove(member);
    }
    Ok(())
  }

  fn remove_key(&self, namespace: &str, key: &str) -> Result<()> {
    let mut sets = self.lock()?;
    sets.remove(&(namespace.to_string(), key.to_string()));
    Ok(())
  }
}

/// SQLite-based entitlement storage.
pub struct SqliteStorage {
  conn: Mutex<Connection>,
  /// Whether the database is file-backed and runs in WAL mode
  wal: bool,
}

impl SqliteStorage {
  /// Open the storage at the default location.
  pub fn open_default() -> Result<Self> {
    Self::open(&Self::default_path()?)
  }

  /// Open (or create) the storage at `path`.
  pub fn open(path: &Path) -> Result<Self> {
    // Ensure parent directory exists
    if let Some(parent) = path.parent() {
      if !parent.as_os_str().is_empty() {
        std::fs::create_dir_all(parent)
          .map_err(|e| eyre!("Failed to create storage directory: {}", e))?;
      }
    }

    let conn = Connection::open(path)
      .map_err(|e| eyre!("Failed to open entitlement database at {}: {}", path.display(), e))?;

    let mode: String = conn
      .pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get(0))
      .map_err(|e| eyre!("Failed to enable WAL journal: {}", e))?;
    conn
      .pragma_update(None, "synchronous", "NORMAL")
      .map_err(|e| eyre!("Failed to set synchronous mode: {}", e))?;

    let storage = Self {
      conn: Mutex::new(conn),
      wal: mode.eq_ignore_ascii_case("wal"),
    };
    storage.run_migrations()?;

    Ok(storage)
  }

  /// Open a private in-memory database.
  pub fn open_in_memory() -> Result<Self> {
    let conn = Connection::open_in_memory()
      .map_err(|e| eyre!("Failed to open in-memory database: {}", e))?;

    let storage = Self {
      conn: Mutex::new(conn),
      wal: false,
    };
    storage.run_migrations()?;

    Ok(storage)
  }

  /// Get the default database path.
  pub fn default_path() -> Result<PathBuf> {
    let data_dir = dirs::data_dir()
      .or_else(|| dirs::home_dir().map(|p| p.join(".local/share")))
      .ok_or_else(|| eyre!("Could not determine data directory"))?;

    Ok(data_dir.join("course-gate").join("entitlements.db"))
  }

  fn lock(&self) -> Result<MutexGuard<'_, Connection>> {
    self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))
  }

  /// Run database migrations for entitlement tables.
  fn run_migrations(&self) -> Result<()> {
    let conn = self.lock()?;

    conn
      .execute_batch(ENTITLEMENT_SCHEMA)
      .map_err(|e| eyre!("Failed to run entitlement migrations: {}", e))?;

    Ok(())
  }
}

/// Schema for entitlement tables.
const ENTITLEMENT_SCHEMA: &str = r#"
-- One row per (partition, course id); the primary key gives set semantics
CREATE TABLE IF NOT EXISTS entitlements (
    namespace TEXT NOT NULL,
    scope_key TEXT NOT NULL,
    member TEXT NOT NULL,
    added_at TEXT NOT NULL,
    PRIMARY KEY (namespace, scope_key, member)
);
"#;

const INSERT_MEMBER: &str = "INSERT OR IGNORE INTO entitlements (namespace, scope_key, member, added_at)
   VALUES (?, ?, ?, ?)";

impl EntitlementStorage for SqliteStorage {
  fn members(&self, namespace: &str, key: &str) -> Result<Vec<String>> {
    let conn = self.lock()?;

    let mut stmt = conn
      .prepare(
        "SELECT member FROM entitlements
         WHERE namespace = ? AND scope_key = ?
         ORDER BY member",
      )
      .map_err(|e| eyre!("Failed to prepare query: {}", e))?;

    let members = stmt
      .query_map(params![namespace, key], |row| row.get::<_, String>(0))
      .map_err(|e| eyre!("Failed to query entitlements: {}", e))?
      .collect::<rusqlite::Result<Vec<String>>>()
      .map_err(|e| eyre!("Failed to read entitlement row: {}", e))?;

    Ok(members)
  }

  fn insert(&self, namespace: &str, key: &str, member: &str, mode: WriteMode) -> Result<()> {
    let mut conn = self.lock()?;
    let added_at = Utc::now().to_rfc3339();

    match mode {
      WriteMode::BestEffort => {
        conn
          .execute(INSERT_MEMBER, params![namespace, key, member, added_at])
          .map_err(|e| eyre!("Failed to store entitlement: {}", e))?;
      }
      WriteMode::Flush => {
        conn
          .pragma_update(None, "synchronous", "FULL")
          .map_err(|e| eyre!("Failed to set synchronous mode: {}", e))?;

        let written = conn
          .transaction()
          .and_then(|tx| {
            tx.execute(INSERT_MEMBER, params![namespace, key, member, added_at])?;
            tx.commit()
          })
          .map_err(|e| eyre!("Failed to store entitlement: {}", e));

        // Restore the normal mode even when the write failed
        conn
          .pragma_update(None, "synchronous", "NORMAL")
          .map_err(|e| eyre!("Failed to reset synchronous mode: {}", e))?;
        written?;

        if self.wal {
          conn
            .query_row("PRAGMA wal_checkpoint(FULL)", [], |_| Ok(()))
            .map_err(|e| eyre!("Failed to checkpoint entitlement journal: {}", e))?;
        }
      }
    }

    Ok(())
  }

  fn remove(&self, namespace: &str, key: &str, member: &str) -> Result<()> {
    let conn = self.lock()?;

    conn
      .execute(
        "DELETE FROM entitlements WHERE namespace = ? AND scope_key = ? AND member = ?",
        params![namespace, key, member],
      )
      .map_err(|e| eyre!("Failed to remove entitlement: {}", e))?;

    Ok(())
  }

  fn remove_key(&self, namespace: &str, key: &str) -> Result<()> {
    let conn = self.lock()?;

    conn
      .execute(
        "DELETE FROM entitlements WHERE namespace = ? AND scope_key = ?",
        params![namespace, key],
      )
      .map_err(|e| eyre!("Failed to clear entitlements: {}", e))?;

    Ok(())
  }
}
