//! Reconciliation of the local entitlement store with the remote order ledger.

use futures::future::{AbortRegistration, Abortable};
use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::cache::{
  CourseId, EntitlementSet, EntitlementStorage, EntitlementStore, MergePolicy, Resolution, Scope,
  StoreError, UserId,
};
use crate::orders::{FetchError, Order, OrderSource};
use crate::session::Session;

/// Default bound on a single remote order fetch.
pub const DEFAULT_FETCH_TIMEOUT: Duration = Duration::from_secs(15);

/// Merges remote orders into the user's partition and answers what the
/// session may open.
///
/// Reconciliations for the same user are serialized; different users run
/// independently.
pub struct Reconciler<S: EntitlementStorage, O: OrderSource> {
  store: Arc<EntitlementStore<S>>,
  source: Arc<O>,
  merge_policy: MergePolicy,
  fetch_timeout: Duration,
  user_locks: Mutex<HashMap<UserId, Arc<tokio::sync::Mutex<()>>>>,
}

impl<S: EntitlementStorage, O: OrderSource> Reconciler<S, O> {
  pub fn new(store: Arc<EntitlementStore<S>>, source: Arc<O>) -> Self {
    Self {
      store,
      source,
      merge_policy: MergePolicy::default(),
      fetch_timeout: DEFAULT_FETCH_TIMEOUT,
      user_locks: Mutex::new(HashMap::new()),
    }
  }

  pub fn with_merge_policy(mut self, merge_policy: MergePolicy) -> Self {
    self.merge_policy = merge_policy;
    self
  }

  pub fn with_fetch_timeout(mut self, fetch_timeout: Duration) -> Self {
    self.fetch_timeout = fetch_timeout;
    self
  }

  /// Resolve the session's entitlements, merging the remote order list first.
  ///
  /// Always completes the remote round trip (or its failure) before
  /// answering. Remote failures fall back to the local state unchanged.
  pub async fn sync_and_resolve(&self, session: Session) -> Result<Resolution, StoreError> {
    self.reconcile(session, None).await
  }

  /// Like [`Self::sync_and_resolve`], but the remote fetch stops when the
  /// matching `AbortHandle` fires. An aborted fetch never touches the store.
  pub async fn sync_and_resolve_abortable(
    &self,
    session: Session,
    registration: AbortRegistration,
  ) -> Result<Resolution, StoreError> {
    self.reconcile(session, Some(registration)).await
  }

  fn user_lock(&self, user_id: UserId) -> Arc<tokio::sync::Mutex<()>> {
    let mut locks = self
      .user_locks
      .lock()
      .unwrap_or_else(|poisoned| poisoned.into_inner());
    Arc::clone(locks.entry(user_id).or_default())
  }

  /// Drop the user's lock entry once no reconciliation holds or awaits it.
  fn release_user_lock(&self, user_id: UserId, lock: Arc<tokio::sync::Mutex<()>>) {
    let mut locks = self
      .user_locks
      .lock()
      .unwrap_or_else(|poisoned| poisoned.into_inner());
    drop(lock);
    if locks
      .get(&user_id)
      .is_some_and(|entry| Arc::strong_count(entry) == 1)
    {
      locks.remove(&user_id);
    }
  }

  async fn reconcile(
    &self,
    session: Session,
    registration: Option<AbortRegistration>,
  ) -> Result<Resolution, StoreError> {
    if !session.is_logged_in {
      let global = self.store.get_all(session.user_id, false)?;
      return Ok(Resolution::local_only(global));
    }

    let user_id = session.user_id;
    let lock = self.user_lock(user_id);
    let result = {
      let _serialized = lock.lock().await;
      self.reconcile_locked(user_id, registration).await
    };
    self.release_user_lock(user_id, lock);
    result
  }

  async fn reconcile_locked(
    &self,
    user_id: UserId,
    registration: Option<AbortRegistration>,
  ) -> Result<Resolution, StoreError> {
    let before = self.store.get_all(user_id, true)?;

    debug!(user_id, "Fetching remote orders");
    let fetch = tokio::time::timeout(self.fetch_timeout, self.source.fetch_orders());
    let fetched = match registration {
      Some(registration) => match Abortable::new(fetch, registration).await {
        Ok(fetched) => fetched,
        Err(_) => {
          info!(user_id, "Order fetch cancelled, keeping cached entitlements");
          return Ok(Resolution::cancelled(before));
        }
      },
      None => fetch.await,
    };

    let orders = match fetched {
      Ok(Ok(orders)) => orders,
      Ok(Err(e)) => return Ok(self.fall_back(user_id, &e, before)),
      Err(_) => {
        let e = FetchError::Timeout(self.fetch_timeout);
        return Ok(self.fall_back(user_id, &e, before));
      }
    };

    let owned = owned_courses(&orders, user_id);
    debug!(
      user_id,
      received = orders.len(),
      owned = owned.len(),
      "Merging remote orders"
    );

    let scope = Scope::User(user_id);
    for &course_id in &owned {
      if !self.store.add(scope, course_id) {
        warn!(user_id, course_id, "Remote entitlement could not be confirmed locally");
      }
    }

    if self.merge_policy == MergePolicy::MirrorRemote {
      self.drop_stale(scope, &owned);
    }

    let resolved = self.store.get_all(user_id, true)?;
    info!(
      user_id,
      merged = owned.len(),
      total = resolved.len(),
      "Entitlements reconciled"
    );
    Ok(Resolution::merged(resolved, owned.len()))
  }

  fn fall_back(&self, user_id: UserId, error: &FetchError, before: EntitlementSet) -> Resolution {
    if error.is_unauthenticated() {
      warn!(user_id, error = %error, "Server does not recognise the session, serving cached entitlements");
    } else {
      warn!(user_id, error = %error, "Order fetch failed, serving cached entitlements");
    }
    Resolution::fallen_back(before)
  }

  /// Remove per-user entitlements the remote ledger no longer lists.
  fn drop_stale(&self, scope: Scope, owned: &BTreeSet<CourseId>) {
    let current = match self.store.partition(scope) {
      Ok(current) => current,
      Err(e) => {
        warn!(%scope, error = %e, "Skipping stale entitlement removal");
        return;
      }
    };

    for &course_id in current.difference(owned) {
      match self.store.remove(scope, course_id) {
        Ok(()) => info!(%scope, course_id, "Removed entitlement missing from remote orders"),
        Err(e) => warn!(%scope, course_id, error = %e, "Failed to remove stale entitlement"),
      }
    }
  }
}

/// Course ids the user owns according to the order list.
fn owned_courses(orders: &[Order], user_id: UserId) -> BTreeSet<CourseId> {
  orders
    .iter()
    .filter(|order| order.user_id == user_id && order.course_id > 0)
    .map(|order| order.course_id)
    .collect()
}

#[cfg(test)]
pub(crate) mod tests {
  use super::*;
  use crate::cache::{FlakyStorage, ReadFallback, ResolutionSource, SqliteStorage};
  use crate::orders::PurchaseRequest;
  use futures::future::AbortHandle;
  use std::sync::atomic::{AtomicUsize, Ordering};

  /// Order source that replays a scripted answer.
  pub(crate) struct ScriptedSource {
    pub(crate) answer: Mutex<Result<Vec<Order>, FetchError>>,
    pub(crate) delay: Duration,
    pub(crate) calls: AtomicUsize,
  }

  impl ScriptedSource {
    pub(crate) fn orders(orders: Vec<Order>) -> Self {
      Self::answering(Ok(orders))
    }

    pub(crate) fn failing(error: FetchError) -> Self {
      Self::answering(Err(error))
    }

    fn answering(answer: Result<Vec<Order>, FetchError>) -> Self {
      Self {
        answer: Mutex::new(answer),
        delay: Duration::ZERO,
        calls: AtomicUsize::new(0),
      }
    }

    pub(crate) fn with_delay(mut self, delay: Duration) -> Self {
      self.delay = delay;
      self
    }

    pub(crate) fn set_orders(&self, orders: Vec<Order>) {
      *self.answer.lock().unwrap() = Ok(orders);
    }
  }

  impl OrderSource for ScriptedSource {
    async fn fetch_orders(&self) -> Result<Vec<Order>, FetchError> {
      self.calls.fetch_add(1, Ordering::SeqCst);
      if !self.delay.is_zero() {
        tokio::time::sleep(self.delay).await;
      }
      self.answer.lock().unwrap().clone()
    }

    async fn create_order(&self, request: &PurchaseRequest) -> Result<Option<Order>, FetchError> {
      self.calls.fetch_add(1, Ordering::SeqCst);
      if !self.delay.is_zero() {
        tokio::time::sleep(self.delay).await;
      }
      match &*self.answer.lock().unwrap() {
        Ok(_) => Ok(None),
        Err(e) => Err(FetchError::Rejected(format!("{} for course {}", e, request.course_id))),
      }
    }
  }

  pub(crate) fn order(user_id: UserId, course_id: CourseId) -> Order {
    Order {
      id: course_id,
      user_id,
      course_id,
      course_title: None,
      price_at_purchase: None,
      status: Some("completed".to_string()),
      created_at: None,
    }
  }

  fn store() -> Arc<EntitlementStore<SqliteStorage>> {
    Arc::new(EntitlementStore::new(SqliteStorage::open_in_memory().unwrap()))
  }

  fn reconciler<O: OrderSource>(
    store: &Arc<EntitlementStore<SqliteStorage>>,
    source: O,
  ) -> Reconciler<SqliteStorage, O> {
    Reconciler::new(Arc::clone(store), Arc::new(source))
  }

  #[tokio::test]
  async fn test_merges_orders_for_session_user_only() {
    let store = store();
    let reconciler = reconciler(&store, ScriptedSource::orders(vec![order(42, 9), order(43, 10)]));

    let resolution = reconciler.sync_and_resolve(Session::logged_in(42)).await.unwrap();

    assert_eq!(resolution.source, ResolutionSource::Merged);
    assert_eq!(resolution.merged, 1);
    assert_eq!(resolution.entitlements, EntitlementSet::from([9]));
    assert!(store.get_all(43, true).unwrap().is_empty());
  }

  #[tokio::test]
  async fn test_result_includes_global_partition() {
    let store = store();
    store.add(Scope::Global, 1);
    let reconciler = reconciler(&store, ScriptedSource::orders(vec![order(42, 9)]));

    let resolution = reconciler.sync_and_resolve(Session::logged_in(42)).await.unwrap();

    assert_eq!(resolution.entitlements, EntitlementSet::from([1, 9]));
  }

  #[tokio::test]
  async fn test_logged_out_skips_remote() {
    let store = store();
    store.add(Scope::Global, 1);
    store.add(Scope::User(42), 2);
    let source = Arc::new(ScriptedSource::orders(vec![order(42, 9)]));
    let reconciler = Reconciler::new(Arc::clone(&store), Arc::clone(&source));

    let resolution = reconciler.sync_and_resolve(Session::logged_out()).await.unwrap();

    assert_eq!(resolution.source, ResolutionSource::LocalOnly);
    assert_eq!(resolution.entitlements, EntitlementSet::from([1]));
    assert_eq!(source.calls.load(Ordering::SeqCst), 0);
  }

  #[tokio::test]
  async fn test_failure_returns_pre_call_state() {
    for error in [
      FetchError::Network("connection refused".to_string()),
      FetchError::Status(500),
      FetchError::Unauthenticated("未登录".to_string()),
    ] {
      let store = store();
      store.add(Scope::Global, 1);
      store.add(Scope::User(42), 7);
      let before = store.get_all(42, true).unwrap();
      let reconciler = reconciler(&store, ScriptedSource::failing(error));

      let resolution = reconciler.sync_and_resolve(Session::logged_in(42)).await.unwrap();

      assert_eq!(resolution.source, ResolutionSource::FallenBack);
      assert_eq!(resolution.entitlements, before);
      assert_eq!(store.get_all(42, true).unwrap(), before);
    }
  }

  #[tokio::test]
  async fn test_timeout_falls_back() {
    let store = store();
    store.add(Scope::User(42), 7);
    let source = ScriptedSource::orders(vec![order(42, 9)]).with_delay(Duration::from_millis(200));
    let reconciler = reconciler(&store, source).with_fetch_timeout(Duration::from_millis(20));

    let resolution = reconciler.sync_and_resolve(Session::logged_in(42)).await.unwrap();

    assert_eq!(resolution.source, ResolutionSource::FallenBack);
    assert_eq!(resolution.entitlements, EntitlementSet::from([7]));
    assert!(!store.get_all(42, true).unwrap().contains(&9));
  }

  #[tokio::test]
  async fn test_abort_leaves_store_untouched() {
    let store = store();
    store.add(Scope::User(42), 7);
    let source = ScriptedSource::orders(vec![order(42, 9)]).with_delay(Duration::from_millis(200));
    let reconciler = reconciler(&store, source);

    let (handle, registration) = AbortHandle::new_pair();
    handle.abort();
    let resolution = reconciler
      .sync_and_resolve_abortable(Session::logged_in(42), registration)
      .await
      .unwrap();

    assert_eq!(resolution.source, ResolutionSource::Cancelled);
    assert_eq!(resolution.entitlements, EntitlementSet::from([7]));
    assert_eq!(store.get_all(42, true).unwrap(), EntitlementSet::from([7]));
  }

  #[tokio::test]
  async fn test_additive_only_keeps_refunded_courses() {
    let store = store();
    let source = Arc::new(ScriptedSource::orders(vec![order(42, 9), order(42, 10)]));
    let reconciler = Reconciler::new(Arc::clone(&store), Arc::clone(&source));
    reconciler.sync_and_resolve(Session::logged_in(42)).await.unwrap();

    source.set_orders(vec![order(42, 9)]);
    let resolution = reconciler.sync_and_resolve(Session::logged_in(42)).await.unwrap();

    assert_eq!(resolution.entitlements, EntitlementSet::from([9, 10]));
  }

  #[tokio::test]
  async fn test_mirror_remote_drops_refunded_user_courses() {
    let store = store();
    store.add(Scope::Global, 1);
    store.add(Scope::User(42), 10);
    let reconciler = reconciler(&store, ScriptedSource::orders(vec![order(42, 9)]))
      .with_merge_policy(MergePolicy::MirrorRemote);

    let resolution = reconciler.sync_and_resolve(Session::logged_in(42)).await.unwrap();

    assert_eq!(resolution.entitlements, EntitlementSet::from([1, 9]));
    assert_eq!(store.partition(Scope::Global).unwrap(), EntitlementSet::from([1]));
  }

  #[tokio::test]
  async fn test_concurrent_reconciliations_converge() {
    let store = store();
    let reconciler = Arc::new(reconciler(
      &store,
      ScriptedSource::orders(vec![order(42, 9), order(42, 11)]).with_delay(Duration::from_millis(5)),
    ));

    let tasks: Vec<_> = (0..6)
      .map(|i| {
        let reconciler = Arc::clone(&reconciler);
        let store = Arc::clone(&store);
        tokio::spawn(async move {
          if i % 2 == 0 {
            store.add(Scope::User(42), 9);
          }
          reconciler.sync_and_resolve(Session::logged_in(42)).await
        })
      })
      .collect();

    for task in tasks {
      let resolution = task.await.unwrap().unwrap();
      assert_eq!(resolution.entitlements, EntitlementSet::from([9, 11]));
    }

    assert_eq!(store.get_all(42, true).unwrap(), EntitlementSet::from([9, 11]));
  }

  #[tokio::test]
  async fn test_user_locks_are_released() {
    let store = store();
    let reconciler = Arc::new(reconciler(
      &store,
      ScriptedSource::orders(vec![]).with_delay(Duration::from_millis(5)),
    ));

    let tasks: Vec<_> = [42, 42, 43]
      .into_iter()
      .map(|user_id| {
        let reconciler = Arc::clone(&reconciler);
        tokio::spawn(async move { reconciler.sync_and_resolve(Session::logged_in(user_id)).await })
      })
      .collect();
    for task in tasks {
      task.await.unwrap().unwrap();
    }

    assert!(reconciler.user_locks.lock().unwrap().is_empty());

    let failing = self::reconciler(&store, ScriptedSource::failing(FetchError::Status(500)));
    failing.sync_and_resolve(Session::logged_in(42)).await.unwrap();
    assert!(failing.user_locks.lock().unwrap().is_empty());
  }

  #[tokio::test]
  async fn test_error_read_policy_surfaces_store_error() {
    let store = Arc::new(
      EntitlementStore::new(FlakyStorage::failing_reads()).with_read_fallback(ReadFallback::Error),
    );
    let reconciler = Reconciler::new(store, Arc::new(ScriptedSource::orders(vec![])));

    assert!(reconciler.sync_and_resolve(Session::logged_in(42)).await.is_err());
  }
}
