//! Host callables as runtime closures
//!
//! A host callable is pushed as a C closure over one upvalue: a small
//! userdata holding its handle. The userdata's `__gc` releases the handle,
//! so the pin lives exactly as long as the runtime can reach the closure.

use std::ffi::CStr;
use std::os::raw::c_int;
use std::panic::{self, AssertUnwindSafe};
use std::ptr;

use mlua_sys as ffi;

use super::lua_State;
use super::stack;
use crate::cells::CellArray;
use crate::handles::Handle;
use crate::session::SessionInner;
use crate::session_map::SessionMap;
use crate::trampoline;

const HOST_FUNCTION_META: &CStr = c"lunabridge.host_function";

/// Create the metatable shared by every host-function userdata.
pub(super) unsafe fn register_metatable(state: *mut lua_State) {
    if ffi::luaL_newmetatable(state, HOST_FUNCTION_META.as_ptr()) != 0 {
        ffi::lua_pushcfunction(state, release_host_function);
        ffi::lua_setfield(state, -2, c"__gc".as_ptr());
        ffi::lua_pushboolean(state, 0);
        ffi::lua_setfield(state, -2, c"__metatable".as_ptr());
    }
    ffi::lua_pop(state, 1);
}

/// Push a closure that calls the host callable pinned under `handle`.
///
/// The closure takes ownership of the pin.
pub(super) unsafe fn push_host_function(state: *mut lua_State, handle: Handle) {
    let slot = ffi::lua_newuserdatauv(state, std::mem::size_of::<u64>(), 0) as *mut u64;
    slot.write(handle.as_u64());
    ffi::lua_getfield(state, ffi::LUA_REGISTRYINDEX, HOST_FUNCTION_META.as_ptr());
    ffi::lua_setmetatable(state, -2);
    ffi::lua_pushcclosure(state, invoke_host_function, 1);
}

/// Whether the function at `idx` is a closure made by [`push_host_function`].
pub(super) unsafe fn is_host_function(state: *mut lua_State, idx: c_int) -> bool {
    if ffi::lua_iscfunction(state, idx) == 0 {
        return false;
    }
    if ffi::lua_getupvalue(state, idx, 1).is_null() {
        return false;
    }
    let found = !ffi::luaL_testudata(state, -1, HOST_FUNCTION_META.as_ptr()).is_null();
    ffi::lua_pop(state, 1);
    found
}

/// Find the session that owns `state`.
///
/// The runtime only calls back into states created by a live session, so a
/// miss means bridge state is corrupt and the process cannot continue.
unsafe fn owning_session(state: *mut lua_State) -> std::rc::Rc<SessionInner> {
    let key = super::main_thread(state) as usize;
    match SessionMap::current().and_then(|map| map.resolve(key)) {
        Some(session) => session,
        None => {
            log::error!("runtime {:#x} called back into a closed or unknown session", key);
            std::process::abort();
        }
    }
}

unsafe fn upvalue_handle(state: *mut lua_State) -> Option<Handle> {
    let slot = ffi::lua_touserdata(state, ffi::lua_upvalueindex(1)) as *const u64;
    if slot.is_null() {
        return None;
    }
    Handle::from_raw(slot.read())
}

/// Body of the closure. Returns the result count, or `Err` after pushing an
/// error message. All bridge state is dropped before this returns.
unsafe fn invoke(state: *mut lua_State) -> Result<c_int, ()> {
    let session = owning_session(state);
    let _active = session.enter(state);

    let base = 0;
    let args = CellArray::new(&session, stack::collect_cells(&session, state, base));

    let outcome = match upvalue_handle(state) {
        Some(handle) => trampoline::dispatch(&session, handle, args).and_then(|results| {
            stack::reserve(state, results.len())?;
            trampoline::respond(&session, &results, |cell| {
                stack::push_cell(&session, state, cell)
            })
        }),
        None => {
            drop(args);
            Err(crate::error::BridgeError::Runtime(
                "host function closure lost its handle".to_string(),
            ))
        }
    };

    match outcome {
        Ok(count) => Ok(count),
        Err(err) => {
            ffi::lua_settop(state, base);
            let message = err.to_string();
            log::debug!("host function raised: {}", message);
            ffi::lua_pushlstring(state, message.as_ptr() as *const _, message.len());
            Err(())
        }
    }
}

/// Entry point the runtime calls for every host-function closure.
pub(super) unsafe extern "C-unwind" fn invoke_host_function(state: *mut lua_State) -> c_int {
    let outcome = panic::catch_unwind(AssertUnwindSafe(|| invoke(state)));
    match outcome {
        Ok(Ok(count)) => count,
        // Nothing with a destructor is live in this frame, so the runtime may
        // unwind over it.
        Ok(Err(())) => ffi::lua_error(state),
        Err(_) => {
            log::error!("panic escaped the host function trampoline");
            std::process::abort();
        }
    }
}

/// `__gc` of the handle userdata.
unsafe extern "C-unwind" fn release_host_function(state: *mut lua_State) -> c_int {
    let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
        let slot = ffi::lua_touserdata(state, 1) as *mut u64;
        if slot.is_null() {
            return;
        }
        let Some(handle) = Handle::from_raw(ptr::replace(slot, 0)) else {
            return;
        };
        let key = super::main_thread(state) as usize;
        // A runtime no session owns has nothing left to release.
        if let Some(session) = SessionMap::current().and_then(|map| map.resolve(key)) {
            let _active = session.enter(state);
            session.handles.release(handle);
            log::trace!("released host function pin {}", handle);
        }
    }));
    if outcome.is_err() {
        log::error!("panic while releasing a host function");
        std::process::abort();
    }
    0
}
