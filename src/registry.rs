//! The global session registry.
//!
//! One entry per (username, server index, character index). A finished
//! downstream login consults the registry to join an existing session
//! instead of opening a second upstream connection for the same character.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use tokio::sync::mpsc;

use crate::session::SessionEvent;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SessionKey {
    pub username: String,
    pub server_index: u16,
    pub character_index: u32,
}

/// Session state readable outside the session task.
#[derive(Debug, Default)]
pub struct SessionShared {
    pub upstream_live: AtomicBool,
    pub active_clients: AtomicUsize,
    pub autoreconnect: AtomicBool,
    pub background: AtomicBool,
}

#[derive(Clone)]
pub struct SessionHandle {
    pub key: SessionKey,
    pub tx: mpsc::UnboundedSender<SessionEvent>,
    pub shared: Arc<SessionShared>,
}

impl SessionHandle {
    /// A session takes a new head while it runs in the background, or while
    /// nobody is actively attached.
    pub fn accepts_attach(&self) -> bool {
        self.shared.background.load(Ordering::Relaxed)
            || self.shared.active_clients.load(Ordering::Relaxed) == 0
    }
}

/// Row of the `%sessions` listing.
#[derive(Debug, Clone)]
pub struct SessionInfo {
    pub key: SessionKey,
    pub upstream_live: bool,
    pub active_clients: usize,
    pub autoreconnect: bool,
}

#[derive(Default)]
pub struct Registry {
    inner: Mutex<FxHashMap<SessionKey, SessionHandle>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, handle: SessionHandle) {
        self.inner.lock().insert(handle.key.clone(), handle);
    }

    pub fn remove(&self, key: &SessionKey) {
        self.inner.lock().remove(key);
    }

    /// The session a finished login should join, if any. A session whose
    /// upstream is live is preferred, but one waiting out a delayed
    /// reconnect is acceptable: the new head logs in against the cached
    /// world while the link is rebuilt.
    pub fn find_attachable(&self, key: &SessionKey) -> Option<SessionHandle> {
        let inner = self.inner.lock();
        inner
            .get(key)
            .filter(|handle| handle.accepts_attach())
            .cloned()
    }

    /// Join the existing session for `key`, or start a fresh one under the
    /// lock so two racing logins cannot both create it. `None` means the
    /// session exists but refuses another head right now.
    pub fn attach_or_start(
        &self,
        key: &SessionKey,
        start: impl FnOnce() -> SessionHandle,
    ) -> Option<SessionHandle> {
        let mut inner = self.inner.lock();
        match inner.get(key) {
            Some(handle) if handle.accepts_attach() => Some(handle.clone()),
            Some(_) => None,
            None => {
                let handle = start();
                inner.insert(key.clone(), handle.clone());
                Some(handle)
            }
        }
    }

    pub fn snapshot(&self) -> Vec<SessionInfo> {
        let inner = self.inner.lock();
        let mut rows: Vec<SessionInfo> = inner
            .values()
            .map(|handle| SessionInfo {
                key: handle.key.clone(),
                upstream_live: handle.shared.upstream_live.load(Ordering::Relaxed),
                active_clients: handle.shared.active_clients.load(Ordering::Relaxed),
                autoreconnect: handle.shared.autoreconnect.load(Ordering::Relaxed),
            })
            .collect();
        rows.sort_by(|a, b| {
            (&a.key.username, a.key.server_index, a.key.character_index).cmp(&(
                &b.key.username,
                b.key.server_index,
                b.key.character_index,
            ))
        });
        rows
    }
}
