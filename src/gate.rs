//! Entitlement cache facade: the single entry point the rest of the client uses.

use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

use crate::cache::{
  CourseId, EntitlementSet, EntitlementStorage, EntitlementStore, MergePolicy, Resolution, Scope,
  StoreError,
};
use crate::orders::{FetchError, Order, OrderSource, PurchaseRequest};
use crate::reconcile::{Reconciler, DEFAULT_FETCH_TIMEOUT};
use crate::refresh::RefreshHandle;
use crate::session::{Session, SessionProvider};

/// Tuning for reconciliation against the remote ledger.
#[derive(Debug, Clone, Copy)]
pub struct ReconcileOptions {
  pub merge_policy: MergePolicy,
  pub fetch_timeout: Duration,
}

impl Default for ReconcileOptions {
  fn default() -> Self {
    Self {
      merge_policy: MergePolicy::default(),
      fetch_timeout: DEFAULT_FETCH_TIMEOUT,
    }
  }
}

/// Decides which courses the current session may open.
///
/// `is_unlocked` always does a full remote round trip before answering. For
/// an immediate answer use `cached`, optionally followed by `refresh`.
pub struct EntitlementCache<S: EntitlementStorage, O: OrderSource> {
  store: Arc<EntitlementStore<S>>,
  source: Arc<O>,
  reconciler: Arc<Reconciler<S, O>>,
  session: Arc<dyn SessionProvider>,
  fetch_timeout: Duration,
}

impl<S: EntitlementStorage, O: OrderSource> Clone for EntitlementCache<S, O> {
  fn clone(&self) -> Self {
    Self {
      store: Arc::clone(&self.store),
      source: Arc::clone(&self.source),
      reconciler: Arc::clone(&self.reconciler),
      session: Arc::clone(&self.session),
      fetch_timeout: self.fetch_timeout,
    }
  }
}

impl<S: EntitlementStorage, O: OrderSource> EntitlementCache<S, O> {
  pub fn new(
    store: EntitlementStore<S>,
    source: O,
    session: Arc<dyn SessionProvider>,
    options: ReconcileOptions,
  ) -> Self {
    let store = Arc::new(store);
    let source = Arc::new(source);
    let reconciler = Reconciler::new(Arc::clone(&store), Arc::clone(&source))
      .with_merge_policy(options.merge_policy)
      .with_fetch_timeout(options.fetch_timeout);

    Self {
      store,
      source,
      reconciler: Arc::new(reconciler),
      session,
      fetch_timeout: options.fetch_timeout,
    }
  }

  /// Reconcile with the remote ledger and report the effective set.
  pub async fn resolve(&self) -> Result<Resolution, StoreError> {
    self.reconciler.sync_and_resolve(self.session.current()).await
  }

  /// Whether the current session may open `course_id`.
  ///
  /// An unreadable store (only possible with the `error` read fallback)
  /// answers `false`.
  pub async fn is_unlocked(&self, course_id: CourseId) -> bool {
    match self.resolve().await {
      Ok(resolution) => resolution.contains(course_id),
      Err(e) => {
        error!(course_id, error = %e, "Entitlement check failed, treating course as locked");
        false
      }
    }
  }

  /// Locally persisted entitlements, without contacting the server.
  pub fn cached(&self) -> EntitlementSet {
    let session = self.session.current();
    self
      .store
      .get_all(session.user_id, session.is_logged_in)
      .unwrap_or_else(|e| {
        error!(error = %e, "Cached entitlements unavailable");
        EntitlementSet::new()
      })
  }

  /// Record a completed purchase so it is visible before the next reconciliation.
  ///
  /// Returns whether the write was confirmed on disk.
  pub fn mark_purchased(&self, course_id: CourseId) -> bool {
    self.record_purchase(self.session.current(), course_id)
  }

  fn record_purchase(&self, buyer: Session, course_id: CourseId) -> bool {
    let scope = if buyer.is_logged_in {
      Scope::User(buyer.user_id)
    } else {
      Scope::Global
    };

    let confirmed = self.store.add(scope, course_id);
    info!(%scope, course_id, confirmed, "Purchase recorded");
    confirmed
  }

  /// Wipe the global partition and the current user's partition.
  pub fn clear_all(&self) -> Result<(), StoreError> {
    let session = self.session.current();
    self.store.clear(session.user_id, session.is_logged_in)?;
    info!(
      user_id = session.user_id,
      is_logged_in = session.is_logged_in,
      "Purchases cleared"
    );
    Ok(())
  }

  /// Place an order and record the entitlement once the server confirms it.
  ///
  /// The entitlement goes to whoever was signed in when the order was placed,
  /// even if the session changes before the server answers.
  pub async fn purchase(&self, request: PurchaseRequest) -> Result<Order, FetchError> {
    let session = self.session.current();
    let created = tokio::time::timeout(self.fetch_timeout, self.source.create_order(&request))
      .await
      .map_err(|_| FetchError::Timeout(self.fetch_timeout))?;

    let order = match created {
      Ok(Some(order)) => order,
      Ok(None) => {
        warn!(
          course_id = request.course_id,
          "Purchase confirmed without an order, recording the requested course"
        );
        Order {
          id: 0,
          user_id: session.user_id,
          course_id: request.course_id,
          course_title: Some(request.course_title.clone()).filter(|t| !t.is_empty()),
          price_at_purchase: Some(request.price),
          status: None,
          created_at: None,
        }
      }
      Err(e) => {
        warn!(course_id = request.course_id, error = %e, "Purchase failed");
        return Err(e);
      }
    };

    self.record_purchase(session, order.course_id);
    Ok(order)
  }

  /// Orders the server knows about for the current session.
  pub async fn orders(&self) -> Result<Vec<Order>, FetchError> {
    tokio::time::timeout(self.fetch_timeout, self.source.fetch_orders())
      .await
      .map_err(|_| FetchError::Timeout(self.fetch_timeout))?
  }
}

impl<S, O> EntitlementCache<S, O>
where
  S: EntitlementStorage + 'static,
  O: OrderSource + 'static,
{
  /// Reconcile in the background. Dropping the handle does not stop the
  /// work; call `cancel()` on teardown.
  pub fn refresh(&self) -> RefreshHandle {
    let reconciler = Arc::clone(&self.reconciler);
    let session = self.session.current();
    RefreshHandle::spawn(move |registration| async move {
      reconciler
        .sync_and_resolve_abortable(session, registration)
        .await
    })
  }
}
