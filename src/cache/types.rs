//! Core types for the entitlement cache.

use serde::Deserialize;
use std::collections::BTreeSet;
use std::fmt;

/// Identifier of a purchasable course.
pub type CourseId = u64;

/// Identifier of a storefront account.
pub type UserId = u64;

/// Set of course ids a user may open.
pub type EntitlementSet = BTreeSet<CourseId>;

/// Storage namespace holding every entitlement partition.
pub const NAMESPACE: &str = "entitlements";

/// Partition of the entitlement store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Scope {
  /// Entitlements recorded without a known user (pre-login or legacy data)
  Global,
  /// Entitlements owned by a single account
  User(UserId),
}

impl Scope {
  /// Key of this partition inside [`NAMESPACE`].
  pub fn storage_key(&self) -> String {
    match self {
      Self::Global => "global".to_string(),
      Self::User(id) => format!("user:{}", id),
    }
  }
}

impl fmt::Display for Scope {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(&self.storage_key())
  }
}

/// Encode a course id the way partitions store their members.
pub fn encode_member(course_id: CourseId) -> String {
  course_id.to_string()
}

/// Decode a stored member. Zero and non-numeric values are rejected.
pub fn decode_member(member: &str) -> Option<CourseId> {
  match member.trim().parse::<CourseId>() {
    Ok(0) | Err(_) => None,
    Ok(id) => Some(id),
  }
}

/// How a successful remote order list is merged into the user's partition.
#[derive(Debug, Clone, Copy, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum MergePolicy {
  /// Remote orders only ever add entitlements
  #[default]
  AdditiveOnly,
  /// Per-user entitlements missing from the remote list are removed
  MirrorRemote,
}

/// What `get_all` answers when the local partitions cannot be read.
///
/// Configured either as a bare `none` / `error`, or as a map tagged by
/// `policy` (`{ policy: fixed-set, courses: [1, 2] }`).
#[derive(Debug, Clone, Default, Deserialize, PartialEq, Eq)]
#[serde(from = "ReadFallbackConfig")]
pub enum ReadFallback {
  /// Answer with an empty set
  #[default]
  None,
  /// Answer with a fixed list of course ids
  FixedSet { courses: Vec<CourseId> },
  /// Surface the read error to the caller
  Error,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum ReadFallbackConfig {
  Bare(BarePolicy),
  Tagged(TaggedPolicy),
}

#[derive(Deserialize)]
#[serde(rename_all = "kebab-case")]
enum BarePolicy {
  None,
  Error,
}

#[derive(Deserialize)]
#[serde(tag = "policy", rename_all = "kebab-case")]
enum TaggedPolicy {
  None,
  FixedSet { courses: Vec<CourseId> },
  Error,
}

impl From<ReadFallbackConfig> for ReadFallback {
  fn from(config: ReadFallbackConfig) -> Self {
    match config {
      ReadFallbackConfig::Bare(BarePolicy::None) | ReadFallbackConfig::Tagged(TaggedPolicy::None) => {
        Self::None
      }
      ReadFallbackConfig::Bare(BarePolicy::Error) | ReadFallbackConfig::Tagged(TaggedPolicy::Error) => {
        Self::Error
      }
      ReadFallbackConfig::Tagged(TaggedPolicy::FixedSet { courses }) => Self::FixedSet { courses },
    }
  }
}

/// Result of resolving the effective entitlement set, including where it came from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Resolution {
  /// The effective entitlement set
  pub entitlements: EntitlementSet,
  /// Terminal state of the reconciliation attempt
  pub source: ResolutionSource,
  /// Number of remote orders merged into the store
  pub merged: usize,
}

impl Resolution {
  /// Answer for a logged-out session, served from the global partition only.
  pub fn local_only(entitlements: EntitlementSet) -> Self {
    Self {
      entitlements,
      source: ResolutionSource::LocalOnly,
      merged: 0,
    }
  }

  /// Answer after a successful merge with the remote order list.
  pub fn merged(entitlements: EntitlementSet, merged: usize) -> Self {
    Self {
      entitlements,
      source: ResolutionSource::Merged,
      merged,
    }
  }

  /// Answer served from the pre-call state after the remote source failed.
  pub fn fallen_back(entitlements: EntitlementSet) -> Self {
    Self {
      entitlements,
      source: ResolutionSource::FallenBack,
      merged: 0,
    }
  }

  /// Answer served from the pre-call state after the fetch was aborted.
  pub fn cancelled(entitlements: EntitlementSet) -> Self {
    Self {
      entitlements,
      source: ResolutionSource::Cancelled,
      merged: 0,
    }
  }

  pub fn contains(&self, course_id: CourseId) -> bool {
    self.entitlements.contains(&course_id)
  }
}

/// Terminal state of a single reconciliation attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResolutionSource {
  /// Logged out - the remote source was never contacted
  LocalOnly,
  /// Remote orders were fetched and merged
  Merged,
  /// Remote fetch failed, serving the last known local state
  FallenBack,
  /// Remote fetch was aborted, serving the last known local state
  Cancelled,
}

impl fmt::Display for ResolutionSource {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    let label = match self {
      Self::LocalOnly => "local-only",
      Self::Merged => "merged",
      Self::FallenBack => "fallen-back",
      Self::Cancelled => "cancelled",
    };
    f.write_str(label)
  }
}
