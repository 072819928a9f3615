//! Shared registry of connections and authenticated sessions.
//!
//! A [`Session`] outlives the connection that created it: the directory keeps
//! it so a reconnecting user finds the same session, while the active map only
//! holds sessions that currently have a connection attached.

use crate::protocol::handshake::UserId;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::debug;

/// Back-link from a session to the connection currently serving it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionLink {
    pub connection_id: u64,
    pub peer: SocketAddr,
}

#[derive(Debug)]
pub struct Session {
    user_id: UserId,
    user_name: String,
    language_id: String,
    link: Mutex<Option<SessionLink>>,
}

impl Session {
    pub fn new(user_id: UserId, user_name: String, language_id: String) -> Self {
        Self {
            user_id,
            user_name,
            language_id,
            link: Mutex::new(None),
        }
    }

    pub fn user_id(&self) -> UserId {
        self.user_id
    }

    pub fn user_name(&self) -> &str {
        &self.user_name
    }

    pub fn language_id(&self) -> &str {
        &self.language_id
    }

    pub fn link(&self) -> Option<SessionLink> {
        *self.link.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn is_linked(&self) -> bool {
        self.link().is_some()
    }

    /// Attach the session to a connection, replacing any previous link.
    pub fn attach(&self, link: SessionLink) {
        *self.link.lock().unwrap_or_else(PoisonError::into_inner) = Some(link);
    }

    /// Clear the link if it still points at `connection_id`. Returns true if cleared.
    pub fn detach(&self, connection_id: u64) -> bool {
        let mut link = self.link.lock().unwrap_or_else(PoisonError::into_inner);
        match *link {
            Some(current) if current.connection_id == connection_id => {
                *link = None;
                true
            }
            _ => false,
        }
    }
}

#[derive(Debug, Default)]
struct RegistryState {
    /// Sessions with a live connection
    active: HashMap<UserId, Arc<Session>>,
    /// Every session created since startup
    directory: HashMap<UserId, Arc<Session>>,
    connected: usize,
}

/// Process-wide connection and session bookkeeping.
#[derive(Debug, Default)]
pub struct SessionRegistry {
    state: Mutex<RegistryState>,
    next_connection_id: AtomicU64,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, RegistryState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Allocate a connection id. Ids start at 1 and are never reused.
    pub fn next_connection_id(&self) -> u64 {
        self.next_connection_id.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Count a connection unless `limit` connections are already open.
    pub fn try_increment_connected(&self, limit: usize) -> bool {
        let mut state = self.state();
        if state.connected >= limit {
            return false;
        }
        state.connected += 1;
        true
    }

    pub fn increment_connected(&self) {
        self.state().connected += 1;
    }

    pub fn decrement_connected(&self) {
        let mut state = self.state();
        state.connected = state.connected.saturating_sub(1);
    }

    pub fn connected_count(&self) -> usize {
        self.state().connected
    }

    /// Number of sessions with a live connection.
    pub fn authorized_count(&self) -> usize {
        self.state().active.len()
    }

    /// Return the directory entry for `user_id`, creating it on first login.
    pub fn find_or_create(&self, user_id: UserId, user_name: &str, language_id: &str) -> Arc<Session> {
        let mut state = self.state();
        state
            .directory
            .entry(user_id)
            .or_insert_with(|| {
                debug!(user_id, user_name, "Creating session");
                Arc::new(Session::new(user_id, user_name.to_owned(), language_id.to_owned()))
            })
            .clone()
    }

    /// Mark a session active. Also records it in the directory.
    pub fn register(&self, session: Arc<Session>) {
        let mut state = self.state();
        let user_id = session.user_id();
        state.directory.entry(user_id).or_insert_with(|| session.clone());
        state.active.insert(user_id, session);
    }

    /// Link the user's session to a connection and mark it active, under one lock.
    pub fn attach_and_register(
        &self,
        user_id: UserId,
        user_name: &str,
        language_id: &str,
        link: SessionLink,
    ) -> Arc<Session> {
        let mut state = self.state();
        let session = state
            .directory
            .entry(user_id)
            .or_insert_with(|| {
                debug!(user_id, user_name, "Creating session");
                Arc::new(Session::new(user_id, user_name.to_owned(), language_id.to_owned()))
            })
            .clone();
        session.attach(link);
        state.active.insert(user_id, session.clone());
        session
    }

    /// Unlink `session` from `connection_id` and deactivate it, under one lock.
    ///
    /// Does nothing and returns false if another connection has taken the
    /// session over.
    pub fn release(&self, session: &Arc<Session>, connection_id: u64) -> bool {
        let mut state = self.state();
        if !session.detach(connection_id) {
            return false;
        }
        let user_id = session.user_id();
        if state
            .active
            .get(&user_id)
            .is_some_and(|active| Arc::ptr_eq(active, session))
        {
            state.active.remove(&user_id);
        }
        true
    }

    /// Remove a session from the active map. The directory entry is kept.
    pub fn unregister(&self, user_id: UserId) -> Option<Arc<Session>> {
        self.state().active.remove(&user_id)
    }

    /// Find an active session.
    pub fn lookup(&self, user_id: UserId) -> Option<Arc<Session>> {
        self.state().active.get(&user_id).cloned()
    }

    /// Find a session whether or not it is active.
    pub fn lookup_any(&self, user_id: UserId) -> Option<Arc<Session>> {
        self.state().directory.get(&user_id).cloned()
    }
}
