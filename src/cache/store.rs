//! Two-partition entitlement store with write-verify-retry.

use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};
use tracing::{debug, error, warn};

use super::storage::{EntitlementStorage, WriteMode};
use super::types::{
  decode_member, encode_member, CourseId, EntitlementSet, ReadFallback, Scope, UserId, NAMESPACE,
};

/// Errors surfaced by the entitlement store.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
  /// A partition could not be read
  #[error("failed to read {scope} entitlements: {reason}")]
  Read { scope: Scope, reason: String },
  /// A partition could not be modified
  #[error("failed to update {scope} entitlements: {reason}")]
  Write { scope: Scope, reason: String },
  /// A write could not be confirmed after the flush retry
  #[error("course {course_id} could not be persisted to {scope}")]
  PersistenceFailure { scope: Scope, course_id: CourseId },
}

/// Durable store of the global and per-user entitlement partitions.
///
/// All operations on one store share a single reader-writer lock, so a
/// write and its read-back verification are never interleaved with a clear.
pub struct EntitlementStore<S: EntitlementStorage> {
  storage: Arc<S>,
  guard: RwLock<()>,
  read_fallback: ReadFallback,
}

impl<S: EntitlementStorage> EntitlementStore<S> {
  /// Create a store over the given storage handle.
  pub fn new(storage: S) -> Self {
    Self::from_shared(Arc::new(storage))
  }

  /// Create a store over a storage handle shared with other owners.
  pub fn from_shared(storage: Arc<S>) -> Self {
    Self {
      storage,
      guard: RwLock::new(()),
      read_fallback: ReadFallback::None,
    }
  }

  /// Set the answer `get_all` gives when the partitions cannot be read.
  pub fn with_read_fallback(mut self, read_fallback: ReadFallback) -> Self {
    self.read_fallback = read_fallback;
    self
  }

  fn read_guard(&self) -> RwLockReadGuard<'_, ()> {
    self.guard.read().unwrap_or_else(|poisoned| poisoned.into_inner())
  }

  fn write_guard(&self) -> RwLockWriteGuard<'_, ()> {
    self.guard.write().unwrap_or_else(|poisoned| poisoned.into_inner())
  }

  /// Add a course to a partition.
  ///
  /// Returns `true` once the course is confirmed present. A best-effort write
  /// that does not read back is retried once as a flushed write. Failures are
  /// logged, never raised. Course id 0 is never stored.
  pub fn add(&self, scope: Scope, course_id: CourseId) -> bool {
    if course_id == 0 {
      warn!(%scope, "Refusing to store course id 0");
      return false;
    }

    let _guard = self.write_guard();
    let key = scope.storage_key();
    let member = encode_member(course_id);

    if let Err(e) = self.storage.insert(NAMESPACE, &key, &member, WriteMode::BestEffort) {
      warn!(%scope, course_id, error = %e, "Best-effort entitlement write failed");
    }

    if self.is_present(&key, &member) {
      debug!(%scope, course_id, "Entitlement saved");
      return true;
    }

    warn!(%scope, course_id, "Entitlement not found after write, retrying with flush");
    if let Err(e) = self.storage.insert(NAMESPACE, &key, &member, WriteMode::Flush) {
      warn!(%scope, course_id, error = %e, "Flushed entitlement write failed");
    }

    if self.is_present(&key, &member) {
      debug!(%scope, course_id, "Entitlement saved on retry");
      return true;
    }

    let failure = StoreError::PersistenceFailure { scope, course_id };
    error!(%scope, course_id, "{}", failure);
    false
  }

  fn is_present(&self, key: &str, member: &str) -> bool {
    match self.storage.members(NAMESPACE, key) {
      Ok(members) => members.iter().any(|m| m == member),
      Err(e) => {
        warn!(scope = key, error = %e, "Failed to verify entitlement write");
        false
      }
    }
  }

  /// Read a single partition.
  pub fn partition(&self, scope: Scope) -> Result<EntitlementSet, StoreError> {
    let _guard = self.read_guard();
    self.read_partition(scope)
  }

  fn read_partition(&self, scope: Scope) -> Result<EntitlementSet, StoreError> {
    let members = self
      .storage
      .members(NAMESPACE, &scope.storage_key())
      .map_err(|e| StoreError::Read {
        scope,
        reason: e.to_string(),
      })?;

    Ok(
      members
        .iter()
        .filter_map(|member| {
          let parsed = decode_member(member);
          if parsed.is_none() {
            warn!(%scope, member = member.as_str(), "Skipping unparseable entitlement");
          }
          parsed
        })
        .collect(),
    )
  }

  /// Effective entitlement set: the global partition, plus the user's
  /// partition when logged in.
  ///
  /// A failed read answers according to the configured [`ReadFallback`].
  pub fn get_all(&self, user_id: UserId, is_logged_in: bool) -> Result<EntitlementSet, StoreError> {
    let _guard = self.read_guard();

    let read = || -> Result<EntitlementSet, StoreError> {
      let mut set = self.read_partition(Scope::Global)?;
      if is_logged_in {
        set.extend(self.read_partition(Scope::User(user_id))?);
      }
      Ok(set)
    };

    match read() {
      Ok(set) => {
        debug!(user_id, is_logged_in, count = set.len(), "Loaded entitlements");
        Ok(set)
      }
      Err(e) => {
        error!(user_id, error = %e, "Failed to load entitlements");
        match &self.read_fallback {
          ReadFallback::None => Ok(EntitlementSet::new()),
          ReadFallback::FixedSet { courses } => {
            warn!(count = courses.len(), "Serving fixed fallback entitlements");
            Ok(courses.iter().copied().collect())
          }
          ReadFallback::Error => Err(e),
        }
      }
    }
  }

  /// Remove a single course from a partition.
  pub fn remove(&self, scope: Scope, course_id: CourseId) -> Result<(), StoreError> {
    let _guard = self.write_guard();

    self
      .storage
      .remove(NAMESPACE, &scope.storage_key(), &encode_member(course_id))
      .map_err(|e| StoreError::Write {
        scope,
        reason: e.to_string(),
      })?;

    debug!(%scope, course_id, "Entitlement removed");
    Ok(())
  }

  /// Wipe the global partition and, when logged in, the user's partition.
  ///
  /// Other users' partitions are left alone.
  pub fn clear(&self, user_id: UserId, is_logged_in: bool) -> Result<(), StoreError> {
    let _guard = self.write_guard();

    let mut scopes = vec![Scope::Global];
    if is_logged_in {
      scopes.push(Scope::User(user_id));
    }

    for scope in scopes {
      self
        .storage
        .remove_key(NAMESPACE, &scope.storage_key())
        .map_err(|e| StoreError::Write {
          scope,
          reason: e.to_string(),
        })?;
      debug!(%scope, "Entitlements cleared");
    }

    Ok(())
  }
}
