//! Session identity consumed by the entitlement cache.
//!
//! The cache never authenticates anybody. It only asks a provider who is
//! currently signed in on the device.

use std::sync::RwLock;

use crate::cache::UserId;

/// Snapshot of the signed-in user.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Session {
  pub user_id: UserId,
  pub is_logged_in: bool,
}

impl Session {
  pub fn logged_in(user_id: UserId) -> Self {
    Self {
      user_id,
      is_logged_in: true,
    }
  }

  pub fn logged_out() -> Self {
    Self {
      user_id: 0,
      is_logged_in: false,
    }
  }
}

/// Source of the current session.
pub trait SessionProvider: Send + Sync {
  fn current(&self) -> Session;
}

/// Session that can be switched at runtime (login, logout, account change).
#[derive(Debug)]
pub struct SharedSession {
  inner: RwLock<Session>,
}

impl SharedSession {
  pub fn new(session: Session) -> Self {
    Self {
      inner: RwLock::new(session),
    }
  }

  #[allow(dead_code)]
  pub fn login(&self, user_id: UserId) {
    self.set(Session::logged_in(user_id));
  }

  #[allow(dead_code)]
  pub fn logout(&self) {
    self.set(Session::logged_out());
  }

  fn set(&self, session: Session) {
    match self.inner.write() {
      Ok(mut guard) => *guard = session,
      Err(poisoned) => *poisoned.into_inner() = session,
    }
  }
}

impl SessionProvider for SharedSession {
  fn current(&self) -> Session {
    match self.inner.read() {
      Ok(guard) => *guard,
      Err(poisoned) => *poisoned.into_inner(),
    }
  }
}

impl From<Option<UserId>> for Session {
  fn from(user_id: Option<UserId>) -> Self {
    user_id.map_or_else(Session::logged_out, Session::logged_in)
  }
}
