//! Session-scoped handle registry for pinned host callables
//!
//! Foreign code cannot hold Rust closures directly. The registry pins a value
//! and hands out a numeric handle; the runtime stores the handle and the
//! trampoline restores the value when the runtime calls back.
//!
//! Sessions are confined to one thread, so the registry is plain interior
//! mutable storage rather than a locked map.

use rustc_hash::FxHashMap;
use std::cell::{Cell, RefCell};
use std::fmt;
use std::num::NonZeroU64;

/// Opaque non-zero token identifying a pinned value
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Handle(NonZeroU64);

impl Handle {
    /// Rebuild a handle from its raw form. Zero is never a handle.
    pub fn from_raw(raw: u64) -> Option<Self> {
        NonZeroU64::new(raw).map(Handle)
    }

    /// Get the raw handle value
    pub fn as_u64(&self) -> u64 {
        self.0.get()
    }
}

impl fmt::Display for Handle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Registry mapping handles to pinned values.
///
/// Handles are auto-incrementing and never reused within one registry.
pub struct HandleRegistry<T> {
    map: RefCell<FxHashMap<u64, T>>,
    next_id: Cell<u64>,
}

impl<T: Clone> HandleRegistry<T> {
    /// Create a new empty registry.
    pub fn new() -> Self {
        Self {
            map: RefCell::new(FxHashMap::default()),
            next_id: Cell::new(1),
        }
    }

    /// Pin a value and return its handle.
    pub fn save(&self, value: T) -> Handle {
        let id = self.next_id.get();
        self.next_id.set(id + 1);
        self.map.borrow_mut().insert(id, value);
        // id starts at 1 and only grows
        Handle(NonZeroU64::MIN.saturating_add(id - 1))
    }

    /// Get a clone of the pinned value. A released or unknown handle misses.
    pub fn restore(&self, handle: Handle) -> Option<T> {
        self.map.borrow().get(&handle.as_u64()).cloned()
    }

    /// Unpin a value. Returns false if the handle was not live.
    pub fn release(&self, handle: Handle) -> bool {
        // Dropping the value may run arbitrary host code; keep it outside the borrow.
        let removed = self.map.borrow_mut().remove(&handle.as_u64());
        removed.is_some()
    }

    /// Pin the value behind `handle` a second time under a new handle.
    pub fn duplicate(&self, handle: Handle) -> Option<Handle> {
        let value = self.restore(handle)?;
        Some(self.save(value))
    }

    /// Number of live handles
    pub fn len(&self) -> usize {
        self.map.borrow().len()
    }

    /// Whether no handles are live
    pub fn is_empty(&self) -> bool {
        self.map.borrow().is_empty()
    }

    /// Release every handle
    pub fn clear(&self) {
        let drained: Vec<T> = self.map.borrow_mut().drain().map(|(_, v)| v).collect();
        drop(drained);
    }
}

impl<T: Clone> Default for HandleRegistry<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> fmt::Debug for HandleRegistry<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HandleRegistry")
            .field("live", &self.map.borrow().len())
            .field("next_id", &self.next_id.get())
            .finish()
    }
}
