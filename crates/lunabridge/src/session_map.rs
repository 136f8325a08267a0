//! Process-wide reverse map from runtime instance to session
//!
//! The runtime only hands the trampoline a raw state pointer. The map turns
//! that pointer (normalized to the runtime's main thread) back into the
//! session that owns it.
//!
//! The map is an explicit object: the first session creates it, every live
//! session holds an `Arc` to it, and the process-wide slot only keeps a weak
//! pointer, so the map disappears once the last session is gone.

use std::cell::RefCell;
use std::ptr::NonNull;
use std::rc::Rc;
use std::sync::{Arc, Weak};
use std::thread::{self, ThreadId};

use once_cell::sync::Lazy;
use parking_lot::{Mutex, ReentrantMutex};
use rustc_hash::FxHashMap;

use crate::session::SessionInner;

/// Weak pointer to the map used by every live session
static ACTIVE_MAP: Lazy<Mutex<Weak<SessionMap>>> = Lazy::new(|| Mutex::new(Weak::new()));

struct SessionEntry {
    inner: NonNull<SessionInner>,
    owner: ThreadId,
}

// The pointer is only dereferenced on `owner`, see `SessionMap::resolve`.
unsafe impl Send for SessionEntry {}

/// Reverse map keyed by the address of a runtime's main thread.
///
/// The lock is reentrant: closing a runtime runs its finalizers, and those
/// consult the map while `close` still holds it.
pub struct SessionMap {
    entries: ReentrantMutex<RefCell<FxHashMap<usize, SessionEntry>>>,
}

impl SessionMap {
    fn new() -> Self {
        Self {
            entries: ReentrantMutex::new(RefCell::new(FxHashMap::default())),
        }
    }

    /// Get the active map, creating it if no session currently holds one.
    pub fn acquire() -> Arc<SessionMap> {
        let mut slot = ACTIVE_MAP.lock();
        if let Some(map) = slot.upgrade() {
            return map;
        }
        let map = Arc::new(SessionMap::new());
        *slot = Arc::downgrade(&map);
        log::debug!("created session map");
        map
    }

    /// Get the active map if any session is alive.
    pub fn current() -> Option<Arc<SessionMap>> {
        ACTIVE_MAP.lock().upgrade()
    }

    /// Register a session under its runtime key.
    pub(crate) fn insert(&self, key: usize, inner: &Rc<SessionInner>) {
        let guard = self.entries.lock();
        let entry = SessionEntry {
            inner: NonNull::from(&**inner),
            owner: thread::current().id(),
        };
        guard.borrow_mut().insert(key, entry);
    }

    /// Look up the session owning the runtime keyed by `key`.
    ///
    /// Entries registered on another thread are treated as missing.
    pub(crate) fn resolve(&self, key: usize) -> Option<Rc<SessionInner>> {
        let guard = self.entries.lock();
        let entries = guard.borrow();
        let entry = entries.get(&key)?;
        if entry.owner != thread::current().id() {
            return None;
        }
        let ptr = entry.inner.as_ptr() as *const SessionInner;
        // An entry exists only while its `Session` holds a strong reference.
        unsafe {
            Rc::increment_strong_count(ptr);
            Some(Rc::from_raw(ptr))
        }
    }

    /// Run `teardown`, then remove the entry for `key`, holding the lock across both.
    ///
    /// Finalizers run by `teardown` may re-enter [`SessionMap::resolve`] and
    /// still find the session. No other thread observes the entry once the
    /// runtime is gone.
    pub(crate) fn remove_after<R>(&self, key: usize, teardown: impl FnOnce() -> R) -> R {
        let guard = self.entries.lock();
        let result = teardown();
        let removed = guard.borrow_mut().remove(&key);
        if removed.is_none() {
            log::warn!("runtime {:#x} was not registered in the session map", key);
        }
        result
    }

    /// Whether `key` is registered
    pub fn contains(&self, key: usize) -> bool {
        self.entries.lock().borrow().contains_key(&key)
    }

    /// Number of registered sessions
    pub fn len(&self) -> usize {
        self.entries.lock().borrow().len()
    }

    /// Whether no sessions are registered
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl std::fmt::Debug for SessionMap {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionMap").field("len", &self.len()).finish()
    }
}
