//! Runtime-side shim over the Lua C API
//!
//! Everything that touches a `lua_State` lives under this module. The rest of
//! the crate only sees cells, call envelopes and error records.
//!
//! All functions here are `unsafe`: callers must pass a live state that
//! belongs to the given session.

mod callback;
mod globals;
mod stack;

use std::ffi::CStr;
use std::os::raw::c_int;
use std::ptr::NonNull;

use mlua_sys as ffi;

use crate::abi::{CallEnvelope, Cell, ErrorRecord};
use crate::cells::OutCell;
use crate::error::{BridgeError, BridgeResult};
use crate::session::SessionInner;

pub(crate) use globals::{assign_global, read_global};
pub(crate) use stack::{collect_cells, push_cell};

pub(crate) use ffi::lua_State;

/// Message used when the runtime fails to allocate
const OUT_OF_MEMORY: &str = "LUA OUT OF MEMORY";

/// Create a runtime instance. Returns `None` if the runtime cannot allocate.
pub(crate) unsafe fn open(open_stdlib: bool) -> Option<*mut lua_State> {
    let state = ffi::luaL_newstate();
    if state.is_null() {
        return None;
    }
    if open_stdlib {
        ffi::luaL_openlibs(state);
    }
    callback::register_metatable(state);
    Some(state)
}

/// Destroy a runtime instance, running every pending finalizer.
pub(crate) unsafe fn close(state: *mut lua_State) {
    ffi::lua_close(state);
}

/// Main thread of the runtime `state` belongs to.
///
/// Coroutines get their own `lua_State`; the main thread identifies the runtime.
pub(crate) unsafe fn main_thread(state: *mut lua_State) -> *mut lua_State {
    ffi::lua_rawgeti(state, ffi::LUA_REGISTRYINDEX, ffi::LUA_RIDX_MAINTHREAD);
    let main = ffi::lua_tothread(state, -1);
    ffi::lua_pop(state, 1);
    main
}

/// Drop a registry reference.
pub(crate) unsafe fn unref(state: *mut lua_State, reference: c_int) {
    ffi::luaL_unref(state, ffi::LUA_REGISTRYINDEX, reference);
}

/// Anchor the value a reference cell points at a second time.
pub(crate) unsafe fn duplicate_reference(
    session: &SessionInner,
    state: *mut lua_State,
    cell: &Cell,
) -> BridgeResult<NonNull<Cell>> {
    stack::reserve(state, 1)?;
    push_cell(session, state, Some(cell))?;
    NonNull::new(stack::pop_cell(session, state))
        .ok_or_else(|| BridgeError::Runtime("reference no longer resolves".to_string()))
}

/// Turn the error object left by a failed protected call into an error record,
/// popping it. The stack is expected to be above `base`.
unsafe fn error_record(
    session: &SessionInner,
    state: *mut lua_State,
    status: c_int,
    base: c_int,
) -> *mut ErrorRecord {
    let record = if status == ffi::LUA_ERRMEM {
        ErrorRecord::create(&session.allocations, OUT_OF_MEMORY)
    } else if ffi::lua_gettop(state) <= base {
        ErrorRecord::invalid()
    } else {
        match ffi::lua_type(state, -1) {
            ffi::LUA_TSTRING | ffi::LUA_TNUMBER => {
                let mut len = 0usize;
                let ptr = ffi::lua_tolstring(state, -1, &mut len);
                let bytes = std::slice::from_raw_parts(ptr as *const u8, len);
                ErrorRecord::create(&session.allocations, &String::from_utf8_lossy(bytes))
            }
            other => {
                let name = CStr::from_ptr(ffi::lua_typename(state, other)).to_string_lossy();
                ErrorRecord::create(
                    &session.allocations,
                    &format!("(error object is a {} value)", name),
                )
            }
        }
    };
    ffi::lua_settop(state, base);
    record
}

/// Compile and run a snippet, discarding its results.
///
/// Returns null on success or an error record owned by the caller.
pub(crate) unsafe fn execute(
    session: &SessionInner,
    state: *mut lua_State,
    source: &str,
    chunk_name: &CStr,
) -> *mut ErrorRecord {
    let base = ffi::lua_gettop(state);
    let mut status = ffi::luaL_loadbufferx(
        state,
        source.as_ptr() as *const _,
        source.len(),
        chunk_name.as_ptr(),
        c"t".as_ptr(),
    );
    if status == ffi::LUA_OK {
        status = ffi::lua_pcall(state, 0, 0, 0);
    }
    if status != ffi::LUA_OK {
        return error_record(session, state, status, base);
    }
    ffi::lua_settop(state, base);
    std::ptr::null_mut()
}

/// Call the runtime function held by `function` with `args` under a protected call.
///
/// Host-side failures (pushing an argument) are returned as `Err`; anything
/// the runtime raises is reported inside the envelope.
pub(crate) unsafe fn call_function(
    session: &SessionInner,
    state: *mut lua_State,
    function: &Cell,
    args: &[OutCell<'_>],
) -> BridgeResult<CallEnvelope> {
    let base = ffi::lua_gettop(state);
    let nargs = c_int::try_from(args.len())
        .map_err(|_| BridgeError::Runtime("too many arguments".to_string()))?;
    stack::reserve(state, args.len() + 1)?;

    push_cell(session, state, Some(function))?;
    for arg in args {
        if let Err(err) = push_cell(session, state, arg.get()) {
            ffi::lua_settop(state, base);
            return Err(err);
        }
    }

    let status = ffi::lua_pcall(state, nargs, ffi::LUA_MULTRET, 0);
    if status != ffi::LUA_OK {
        return Ok(CallEnvelope::failed(error_record(
            session, state, status, base,
        )));
    }

    let values = collect_cells(session, state, base);
    Ok(CallEnvelope::returned(&session.allocations, values))
}
