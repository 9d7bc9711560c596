//! Remote order ledger: the authoritative record of what each account bought.

pub mod api_types;
pub mod client;
pub mod types;

use std::future::Future;
use std::time::Duration;

pub use client::HttpOrderSource;
pub use types::{Order, PurchaseRequest};

/// Why a remote order call did not produce a result.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum FetchError {
  /// Transport-level failure (DNS, refused connection, reset)
  #[error("network error: {0}")]
  Network(String),
  /// No answer within the configured timeout
  #[error("request timed out after {0:?}")]
  Timeout(Duration),
  /// Non-2xx HTTP status other than 401
  #[error("server returned status {0}")]
  Status(u16),
  /// The server does not recognise the session
  #[error("not authenticated: {0}")]
  Unauthenticated(String),
  /// The server answered but refused the operation
  #[error("request rejected: {0}")]
  Rejected(String),
  /// The response body could not be decoded
  #[error("invalid response: {0}")]
  Decode(String),
}

impl FetchError {
  pub fn is_unauthenticated(&self) -> bool {
    matches!(self, Self::Unauthenticated(_))
  }
}

/// Source of the authoritative order list for the current session.
pub trait OrderSource: Send + Sync {
  /// Fetch every order visible to the current session.
  fn fetch_orders(&self) -> impl Future<Output = Result<Vec<Order>, FetchError>> + Send;

  /// Create an order. `Ok(None)` means the server confirmed the purchase
  /// without echoing the order back.
  fn create_order(
    &self,
    request: &PurchaseRequest,
  ) -> impl Future<Output = Result<Option<Order>, FetchError>> + Send;
}
