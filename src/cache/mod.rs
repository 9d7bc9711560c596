//! Local entitlement persistence.
//!
//! This module provides the offline half of the entitlement cache:
//! - Two partitions, a global one and one per user, under the `entitlements` namespace
//! - Set-union reads and idempotent adds
//! - Write-verify-retry: unconfirmed writes are retried once as flushed writes
//! - A configurable answer for unreadable storage

mod storage;
mod store;
mod types;

pub use storage::{EntitlementStorage, MemoryStorage, SqliteStorage};
pub use store::{EntitlementStore, StoreError};
pub use types::{
  CourseId, EntitlementSet, MergePolicy, ReadFallback, Resolution, ResolutionSource, Scope, UserId,
};

#[cfg(test)]
pub(crate) use store::tests::FlakyStorage;
