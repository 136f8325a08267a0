//! VM sessions
//!
//! A [`Session`] owns one runtime instance together with the state needed to
//! bridge it:
//! - the handle registry pinning host callables the runtime can reach
//! - the allocation counters for boundary cells
//! - its entry in the process-wide [`SessionMap`]
//!
//! Sessions are confined to the thread that created them.

use std::cell::Cell as StdCell;
use std::ffi::CString;
use std::fmt;
use std::ptr::{self, NonNull};
use std::rc::Rc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::abi::{self, Allocations, Cell, ErrorRecord};
use crate::bridge;
use crate::cells::CellArray;
use crate::error::{BridgeError, BridgeResult};
use crate::foreign::{self, lua_State};
use crate::handles::HandleRegistry;
use crate::local::LocalFunction;
use crate::options::SessionOptions;
use crate::session_map::SessionMap;
use crate::value::{HostFunction, Value};

/// Unique identifier for a Session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SessionId(u64);

impl SessionId {
    /// Create a new unique session ID
    pub fn new() -> Self {
        static NEXT_ID: AtomicU64 = AtomicU64::new(1);
        SessionId(NEXT_ID.fetch_add(1, Ordering::Relaxed))
    }

    /// Get the raw ID value
    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Bridging state shared by a session and every local reference it produced.
pub(crate) struct SessionInner {
    id: SessionId,
    label: String,
    chunk_name: CString,

    /// Main thread of the runtime; null once closed
    main: StdCell<*mut lua_State>,

    /// Thread host operations run on: the main thread, or the coroutine a
    /// host callable was invoked from
    active: StdCell<*mut lua_State>,

    /// Host callables reachable from the runtime
    pub(crate) handles: HandleRegistry<HostFunction>,

    /// Boundary allocations
    pub(crate) allocations: Allocations,
}

impl SessionInner {
    pub(crate) fn id(&self) -> SessionId {
        self.id
    }

    pub(crate) fn is_open(&self) -> bool {
        !self.main.get().is_null()
    }

    /// The thread to run host operations on
    pub(crate) fn state(&self) -> BridgeResult<*mut lua_State> {
        let state = self.active.get();
        if state.is_null() {
            return Err(BridgeError::SessionClosed);
        }
        Ok(state)
    }

    /// Run host operations on `state` until the guard drops.
    pub(crate) fn enter(&self, state: *mut lua_State) -> ActiveState<'_> {
        let previous = self.active.replace(state);
        ActiveState {
            session: self,
            previous,
        }
    }

    /// Release a cell and whatever it anchors.
    ///
    /// Registry anchors are dropped only while the runtime is open; closing
    /// the runtime frees them wholesale.
    pub(crate) fn free_cell(&self, cell: NonNull<Cell>) {
        let (handle, reference) = {
            let cell = unsafe { cell.as_ref() };
            (cell.unresolved_handle(), cell.reference())
        };
        if let Some(handle) = handle {
            self.handles.release(handle);
        } else if let Some(reference) = reference {
            let state = self.active.get();
            if !state.is_null() {
                unsafe { foreign::unref(state, reference) };
            }
        }
        unsafe { abi::free_cell(&self.allocations, cell) };
    }
}

/// Restores the previously active thread on drop
pub(crate) struct ActiveState<'s> {
    session: &'s SessionInner,
    previous: *mut lua_State,
}

impl Drop for ActiveState<'_> {
    fn drop(&mut self) {
        if self.session.is_open() {
            self.session.active.set(self.previous);
        }
    }
}

/// An embedded runtime instance and its bridge to the host.
///
/// Dropping an open session closes it.
pub struct Session {
    inner: Rc<SessionInner>,
    map: Arc<SessionMap>,
    key: usize,
}

impl Session {
    /// Create a session with default options
    pub fn new() -> BridgeResult<Self> {
        Self::with_options(SessionOptions::default())
    }

    /// Create a session with specific options
    pub fn with_options(options: SessionOptions) -> BridgeResult<Self> {
        let state = unsafe { foreign::open(options.open_stdlib) }.ok_or_else(|| {
            BridgeError::Runtime("failed to create a runtime instance".to_string())
        })?;

        let id = SessionId::new();
        let label = options
            .label
            .clone()
            .unwrap_or_else(|| format!("session-{}", id));
        let inner = Rc::new(SessionInner {
            id,
            label,
            chunk_name: options.chunk_name_cstr(),
            main: StdCell::new(state),
            active: StdCell::new(state),
            handles: HandleRegistry::new(),
            allocations: Allocations::new(),
        });

        let key = state as usize;
        let map = SessionMap::acquire();
        map.insert(key, &inner);
        log::debug!("{} opened (stdlib: {})", inner.label, options.open_stdlib);

        Ok(Session { inner, map, key })
    }

    /// Get session ID
    pub fn id(&self) -> SessionId {
        self.inner.id
    }

    /// Label used in logs
    pub fn label(&self) -> &str {
        &self.inner.label
    }

    /// Boundary allocations not yet released, including those held by local references
    pub fn outstanding_allocations(&self) -> usize {
        self.inner.allocations.outstanding()
    }

    /// Host callables currently pinned for the runtime
    pub fn pinned_handles(&self) -> usize {
        self.inner.handles.len()
    }

    /// Run a snippet of source text.
    pub fn execute(&self, source: &str) -> BridgeResult<()> {
        let state = self.inner.state()?;
        let record =
            unsafe { foreign::execute(&self.inner, state, source, &self.inner.chunk_name) };
        match unsafe { ErrorRecord::into_message(&self.inner.allocations, record) } {
            Some(message) => Err(BridgeError::ScriptError(message)),
            None => Ok(()),
        }
    }

    /// Read a global by dotted path (`"a.b.c"`).
    ///
    /// Every segment but the last must name a table. A missing last segment
    /// reads as nil.
    pub fn get_global(&self, path: &str) -> BridgeResult<Value> {
        let state = self.inner.state()?;
        let segments = parse_path(path)?;
        let cell = unsafe { foreign::read_global(&self.inner, state, path, &segments)? };
        let mut cells = CellArray::new(&self.inner, vec![cell]);
        match cells.slots_mut().first_mut() {
            Some(slot) => bridge::marshal_in(&self.inner, slot),
            None => Ok(Value::Nil),
        }
    }

    /// Read a global function by dotted path
    pub fn get_function(&self, path: &str) -> BridgeResult<LocalFunction> {
        self.get_global(path)?.into_typed()
    }

    /// Assign a global by dotted path. Intermediate tables must already exist.
    pub fn set_global(&self, path: &str, value: impl Into<Value>) -> BridgeResult<()> {
        self.assign_global(path, &value.into(), false)
    }

    /// Assign a global by dotted path, creating missing intermediate tables.
    pub fn init_global(&self, path: &str, value: impl Into<Value>) -> BridgeResult<()> {
        self.assign_global(path, &value.into(), true)
    }

    /// Expose a host closure to scripts under a dotted path.
    pub fn register_callable<F>(&self, path: &str, f: F) -> BridgeResult<()>
    where
        F: Fn(Vec<Value>) -> BridgeResult<Vec<Value>> + 'static,
    {
        self.register_function(path, HostFunction::new(f))
    }

    /// Expose an existing host function to scripts under a dotted path.
    pub fn register_function(&self, path: &str, function: HostFunction) -> BridgeResult<()> {
        self.init_global(path, Value::HostFunction(function))
    }

    fn assign_global(&self, path: &str, value: &Value, create: bool) -> BridgeResult<()> {
        let state = self.inner.state()?;
        let segments = parse_path(path)?;
        let cell = bridge::marshal_out(&self.inner, value)?;
        unsafe { foreign::assign_global(&self.inner, state, path, &segments, cell.get(), create) }
    }

    /// Whether the runtime has been destroyed
    pub fn is_closed(&self) -> bool {
        !self.inner.is_open()
    }

    /// Destroy the runtime and remove the session from the session map.
    ///
    /// Local references that outlive the session stay valid to drop; any
    /// other use reports `SessionClosed`.
    pub fn close(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        let state = self.inner.main.get();
        if state.is_null() {
            return;
        }

        self.map
            .remove_after(self.key, || unsafe { foreign::close(state) });
        self.inner.main.set(ptr::null_mut());
        self.inner.active.set(ptr::null_mut());
        self.inner.handles.clear();

        let leaked = self.inner.allocations.outstanding();
        log::debug!(
            "{} closed ({} boundary allocations still held)",
            self.inner.label,
            leaked
        );
    }

    #[cfg(test)]
    pub(crate) fn inner(&self) -> &Rc<SessionInner> {
        &self.inner
    }

    #[cfg(test)]
    pub(crate) fn runtime_key(&self) -> usize {
        self.key
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.inner.id)
            .field("label", &self.inner.label)
            .field("closed", &self.is_closed())
            .finish()
    }
}

/// Split a dotted path into its segments.
fn parse_path(path: &str) -> BridgeResult<Vec<&str>> {
    let segments: Vec<&str> = path.split('.').collect();
    if segments.iter().any(|segment| segment.is_empty()) {
        return Err(BridgeError::InvalidPath(path.to_string()));
    }
    Ok(segments)
}
