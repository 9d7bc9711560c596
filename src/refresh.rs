//! Background reconciliation with first-class cancellation.
//!
//! A `RefreshHandle` owns one spawned reconciliation. The caller can poll it
//! from an event loop, await it, or cancel it when the screen that asked for
//! it goes away.
//!
//! # Example
//!
//! ```ignore
//! let mut refresh = cache.refresh();
//!
//! // In event loop tick
//! if refresh.poll() {
//!     // Entitlements changed, trigger re-render
//! }
//!
//! // On teardown
//! refresh.cancel();
//! ```

use futures::future::{AbortHandle, AbortRegistration};
use std::future::Future;
use tokio::sync::oneshot;

use crate::cache::{Resolution, StoreError};

/// The state of a background refresh
#[derive(Debug, Clone)]
pub enum RefreshState {
  /// Reconciliation is still running
  Loading,
  /// Reconciliation finished (merged, fallen back or cancelled)
  Done(Resolution),
  /// The local store could not be read
  Failed(String),
}

impl RefreshState {
  pub fn is_loading(&self) -> bool {
    matches!(self, RefreshState::Loading)
  }

  pub fn resolution(&self) -> Option<&Resolution> {
    match self {
      RefreshState::Done(resolution) => Some(resolution),
      _ => None,
    }
  }
}

/// Handle to a reconciliation running on the tokio runtime.
pub struct RefreshHandle {
  state: RefreshState,
  receiver: Option<oneshot::Receiver<Result<Resolution, StoreError>>>,
  abort: AbortHandle,
}

impl RefreshHandle {
  /// Spawn the reconciliation built by `start`, handing it the abort
  /// registration that `cancel()` fires.
  pub fn spawn<F, Fut>(start: F) -> Self
  where
    F: FnOnce(AbortRegistration) -> Fut,
    Fut: Future<Output = Result<Resolution, StoreError>> + Send + 'static,
  {
    let (abort, registration) = AbortHandle::new_pair();
    let (tx, rx) = oneshot::channel();

    let future = start(registration);
    tokio::spawn(async move {
      let result = future.await;
      // Ignore send errors - the handle may have been dropped
      let _ = tx.send(result);
    });

    Self {
      state: RefreshState::Loading,
      receiver: Some(rx),
      abort,
    }
  }

  /// Get the current state of the refresh.
  pub fn state(&self) -> &RefreshState {
    &self.state
  }

  pub fn is_loading(&self) -> bool {
    self.state.is_loading()
  }

  /// Stop the remote fetch. The store is left as it was; the refresh still
  /// completes, with a cancelled resolution.
  pub fn cancel(&self) {
    self.abort.abort();
  }

  /// Poll for the result without blocking.
  ///
  /// Returns `true` if the state changed.
  pub fn poll(&mut self) -> bool {
    let receiver = match &mut self.receiver {
      Some(rx) => rx,
      None => return false,
    };

    match receiver.try_recv() {
      Ok(result) => {
        self.finish(Some(result));
        true
      }
      Err(oneshot::error::TryRecvError::Empty) => false,
      Err(oneshot::error::TryRecvError::Closed) => {
        self.finish(None);
        true
      }
    }
  }

  /// Wait for the refresh to finish.
  #[allow(dead_code)]
  pub async fn wait(mut self) -> RefreshState {
    if let Some(rx) = self.receiver.take() {
      self.finish(rx.await.ok());
    }
    self.state
  }

  fn finish(&mut self, result: Option<Result<Resolution, StoreError>>) {
    self.receiver = None;
    self.state = match result {
      Some(Ok(resolution)) => RefreshState::Done(resolution),
      Some(Err(e)) => RefreshState::Failed(e.to_string()),
      // Task ended without sending - treat as failure
      None => RefreshState::Failed("Refresh task ended without a result".to_string()),
    };
  }
}

impl std::fmt::Debug for RefreshHandle {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("RefreshHandle")
      .field("state", &self.state)
      .finish_non_exhaustive()
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::cache::{EntitlementSet, ResolutionSource};
  use futures::future::Abortable;
  use std::time::Duration;

  #[tokio::test]
  async fn test_refresh_success() {
    let mut refresh =
      RefreshHandle::spawn(|_| async { Ok(Resolution::merged(EntitlementSet::from([1, 2]), 2)) });
    assert!(refresh.is_loading());

    tokio::time::sleep(Duration::from_millis(10)).await;

    assert!(refresh.poll());
    let resolution = refresh.state().resolution().unwrap();
    assert_eq!(resolution.entitlements, EntitlementSet::from([1, 2]));
    assert!(!refresh.poll());
  }

  #[tokio::test]
  async fn test_refresh_failure() {
    let refresh = RefreshHandle::spawn(|_| async {
      Err(StoreError::Read {
        scope: crate::cache::Scope::Global,
        reason: "disk unavailable".to_string(),
      })
    });

    assert!(matches!(refresh.wait().await, RefreshState::Failed(msg) if msg.contains("disk unavailable")));
  }

  #[tokio::test]
  async fn test_cancel_reaches_registration() {
    let refresh = RefreshHandle::spawn(|registration| async move {
      let slow = tokio::time::sleep(Duration::from_secs(5));
      match Abortable::new(slow, registration).await {
        Ok(()) => Ok(Resolution::merged(EntitlementSet::new(), 0)),
        Err(_) => Ok(Resolution::cancelled(EntitlementSet::from([7]))),
      }
    });

    refresh.cancel();
    let state = refresh.wait().await;

    let resolution = state.resolution().unwrap();
    assert_eq!(resolution.source, ResolutionSource::Cancelled);
    assert!(resolution.contains(7));
  }
}
