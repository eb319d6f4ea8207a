//! Session state shared by every component.
//!
//! [`SessionContext`] bundles the [`TokenStore`] with the observable
//! [`Session`] snapshot. It is passed by value (an `Arc` clone) into each
//! component's constructor; there is one per process.
//!
//! Writers: only the auth path mutates it. [`crate::auth::AuthSession`] drives
//! login/logout/restore, and [`SessionContext::expire_if`] is the central 401
//! handler the request gateway calls. Everything else reads.

use std::sync::Arc;
use tokio::sync::watch;

use crate::models::UserProfile;
use crate::token::{Token, TokenStore};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionStatus {
    Unauthenticated,
    Authenticating,
    Authenticated,
    /// A request returned 401; the token has been dropped.
    Expired,
}

/// Observable half of the session. The token itself stays in [`TokenStore`].
///
/// Invariant: `user.is_some()` iff `status == Authenticated`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Session {
    pub status: SessionStatus,
    pub user: Option<UserProfile>,
    /// Bumped on every token replace/clear so observers can tell a new token from the old one.
    pub token_version: u64,
}

impl Session {
    fn unauthenticated(token_version: u64) -> Self {
        Self {
            status: SessionStatus::Unauthenticated,
            user: None,
            token_version,
        }
    }

    pub fn is_authenticated(&self) -> bool {
        self.status == SessionStatus::Authenticated
    }
}

struct Inner {
    tokens: TokenStore,
    session: watch::Sender<Session>,
}

/// Process-wide session context: token store + session snapshot.
#[derive(Clone)]
pub struct SessionContext {
    inner: Arc<Inner>,
}

impl SessionContext {
    pub fn new(tokens: TokenStore) -> Self {
        let (session, _) = watch::channel(Session::unauthenticated(0));
        Self {
            inner: Arc::new(Inner { tokens, session }),
        }
    }

    pub fn tokens(&self) -> &TokenStore {
        &self.inner.tokens
    }

    pub fn token(&self) -> Option<Token> {
        self.inner.tokens.get()
    }

    pub fn snapshot(&self) -> Session {
        self.inner.session.borrow().clone()
    }

    pub fn status(&self) -> SessionStatus {
        self.inner.session.borrow().status
    }

    pub fn user(&self) -> Option<UserProfile> {
        self.inner.session.borrow().user.clone()
    }

    pub fn is_authenticated(&self) -> bool {
        self.inner.session.borrow().is_authenticated()
    }

    /// Receiver that wakes on every session change.
    pub fn subscribe(&self) -> watch::Receiver<Session> {
        self.inner.session.subscribe()
    }

    /// Token and session version read together, for requests that may later
    /// need to expire exactly this session.
    pub fn credentials(&self) -> (Option<Token>, u64) {
        let session = self.inner.session.borrow();
        (self.inner.tokens.get(), session.token_version)
    }

    /// Central 401 handler: drop the token and user, mark the session expired.
    /// Observers (the realtime channel) react to the status change.
    ///
    /// No-op (false) when the session has moved past `version` already, so a
    /// late 401 for an old token cannot end a newer session.
    pub(crate) fn expire_if(&self, version: u64) -> bool {
        self.inner.session.send_if_modified(|s| {
            if s.token_version != version {
                return false;
            }
            if self.inner.tokens.clear() {
                log::info!("session expired (401); token cleared");
            }
            s.status = SessionStatus::Expired;
            s.user = None;
            s.token_version += 1;
            true
        })
    }

    #[cfg(test)]
    pub(crate) fn begin_authenticating(&self, token: Token) {
        self.inner.session.send_modify(|s| {
            self.inner.tokens.replace(token);
            s.status = SessionStatus::Authenticating;
            s.user = None;
            s.token_version += 1;
        });
    }

    /// Store `token` and start authenticating, but only if nothing (a logout,
    /// a 401) touched the session since `version` was read. Returns the new version.
    pub(crate) fn begin_authenticating_from(&self, version: u64, token: Token) -> Option<u64> {
        let mut next = None;
        self.inner.session.send_if_modified(|s| {
            if s.token_version != version {
                return false;
            }
            self.inner.tokens.replace(token);
            s.status = SessionStatus::Authenticating;
            s.user = None;
            s.token_version += 1;
            next = Some(s.token_version);
            true
        });
        next
    }

    /// Authenticating with the token already in the store (restore path).
    pub(crate) fn mark_authenticating(&self) {
        self.inner.session.send_modify(|s| {
            s.status = SessionStatus::Authenticating;
            s.user = None;
        });
    }

    #[cfg(test)]
    pub(crate) fn set_authenticated(&self, user: UserProfile) {
        self.inner.session.send_modify(|s| {
            s.status = SessionStatus::Authenticated;
            s.user = Some(user);
        });
    }

    /// Finish an attempt started at `version`. No-op (false) if the session
    /// was reset, expired or re-keyed in the meantime.
    pub(crate) fn set_authenticated_if(&self, version: u64, user: UserProfile) -> bool {
        self.inner.session.send_if_modified(|s| {
            if s.token_version != version || s.status != SessionStatus::Authenticating {
                return false;
            }
            s.status = SessionStatus::Authenticated;
            s.user = Some(user);
            true
        })
    }

    /// Replace the profile of an already authenticated session. No-op otherwise.
    pub(crate) fn update_user(&self, user: UserProfile) {
        self.inner.session.send_if_modified(|s| {
            if s.status == SessionStatus::Authenticated {
                s.user = Some(user);
                true
            } else {
                false
            }
        });
    }

    /// Clear token and user; back to Unauthenticated.
    pub(crate) fn reset(&self) {
        self.inner.session.send_modify(|s| {
            self.inner.tokens.clear();
            let version = s.token_version + 1;
            *s = Session::unauthenticated(version);
        });
    }
}
