//! Dotted-path access to the globals table
//!
//! Paths are walked with raw gets and sets; metamethods on intermediate
//! tables are not consulted.

use mlua_sys as ffi;

use super::lua_State;
use super::stack;
use crate::abi::Cell;
use crate::error::{BridgeError, BridgeResult};
use crate::session::SessionInner;

unsafe fn push_key(state: *mut lua_State, key: &str) {
    ffi::lua_pushlstring(state, key.as_ptr() as *const _, key.len());
}

/// Leave the table named by `segments` on top of the stack.
///
/// Missing tables are created when `create` is set. A segment that holds
/// anything other than a table fails the walk.
unsafe fn walk(
    state: *mut lua_State,
    path: &str,
    segments: &[&str],
    create: bool,
) -> BridgeResult<()> {
    ffi::lua_rawgeti(state, ffi::LUA_REGISTRYINDEX, ffi::LUA_RIDX_GLOBALS);
    for (depth, segment) in segments.iter().enumerate() {
        push_key(state, segment);
        let kind = ffi::lua_rawget(state, -2);
        if kind == ffi::LUA_TNIL && create {
            ffi::lua_pop(state, 1);
            ffi::lua_createtable(state, 0, 0);
            push_key(state, segment);
            ffi::lua_pushvalue(state, -2);
            ffi::lua_rawset(state, -4);
        } else if kind != ffi::LUA_TTABLE {
            let prefix = segments[..=depth].join(".");
            let reason = if kind == ffi::LUA_TNIL {
                "is not defined"
            } else {
                "is not a table"
            };
            return Err(BridgeError::InvalidPath(format!(
                "{} ({} {})",
                path, prefix, reason
            )));
        }
        ffi::lua_remove(state, -2);
    }
    Ok(())
}

/// Read the value at a dotted path as a cell. A missing last segment is nil.
pub(crate) unsafe fn read_global(
    session: &SessionInner,
    state: *mut lua_State,
    path: &str,
    segments: &[&str],
) -> BridgeResult<*mut Cell> {
    let base = ffi::lua_gettop(state);
    let (last, parents) = split(path, segments)?;
    stack::reserve(state, 4)?;
    if let Err(err) = walk(state, path, parents, false) {
        ffi::lua_settop(state, base);
        return Err(err);
    }
    push_key(state, last);
    ffi::lua_rawget(state, -2);
    let cell = stack::pop_cell(session, state);
    ffi::lua_settop(state, base);
    Ok(cell)
}

/// Store a cell at a dotted path, creating missing tables when `create` is set.
pub(crate) unsafe fn assign_global(
    session: &SessionInner,
    state: *mut lua_State,
    path: &str,
    segments: &[&str],
    cell: Option<&Cell>,
    create: bool,
) -> BridgeResult<()> {
    let base = ffi::lua_gettop(state);
    let (last, parents) = split(path, segments)?;
    stack::reserve(state, 5)?;
    let result = walk(state, path, parents, create).and_then(|()| {
        push_key(state, last);
        stack::push_cell(session, state, cell)?;
        ffi::lua_rawset(state, -3);
        Ok(())
    });
    ffi::lua_settop(state, base);
    result
}

fn split<'p>(path: &str, segments: &'p [&'p str]) -> BridgeResult<(&'p str, &'p [&'p str])> {
    segments
        .split_last()
        .map(|(last, parents)| (*last, parents))
        .ok_or_else(|| BridgeError::InvalidPath(path.to_string()))
}
