//! Moving cells on and off the runtime stack

use std::os::raw::c_int;
use std::ptr;

use mlua_sys as ffi;

use super::callback;
use super::lua_State;
use crate::abi::{self, Cell, CellTag, ReferenceKind};
use crate::error::{BridgeError, BridgeResult};
use crate::session::SessionInner;

/// Make room for `count` more values.
pub(crate) unsafe fn reserve(state: *mut lua_State, count: usize) -> BridgeResult<()> {
    let count = c_int::try_from(count).unwrap_or(c_int::MAX);
    if ffi::lua_checkstack(state, count) == 0 {
        return Err(BridgeError::Runtime(format!(
            "runtime stack cannot hold {} more values",
            count
        )));
    }
    Ok(())
}

/// Push the value a cell describes. `None` pushes nil.
///
/// A host callable that has not been delivered yet is pinned a second time,
/// so the closure left in the runtime and the cell own separate handles.
pub(crate) unsafe fn push_cell(
    session: &SessionInner,
    state: *mut lua_State,
    cell: Option<&Cell>,
) -> BridgeResult<()> {
    let Some(cell) = cell else {
        ffi::lua_pushnil(state);
        return Ok(());
    };

    match cell.tag() {
        CellTag::Nil => ffi::lua_pushnil(state),
        CellTag::Number => ffi::lua_pushnumber(state, cell.data.number),
        CellTag::Boolean => ffi::lua_pushboolean(state, cell.data.boolean as c_int),
        CellTag::String => {
            let bytes = cell.bytes();
            ffi::lua_pushlstring(state, bytes.as_ptr() as *const _, bytes.len());
        }
        CellTag::Function | CellTag::Opaque => {
            if let Some(handle) = cell.unresolved_handle() {
                let pin = session
                    .handles
                    .duplicate(handle)
                    .ok_or(BridgeError::NotCallable(handle))?;
                callback::push_host_function(state, pin);
            } else if let Some(reference) = cell.reference() {
                ffi::lua_rawgeti(state, ffi::LUA_REGISTRYINDEX, reference as ffi::lua_Integer);
            }
        }
    }
    Ok(())
}

/// Copy the value at `idx` into a new cell. Nil yields a null pointer.
///
/// Non-primitive values are anchored in the registry; the cell owns that
/// reference.
unsafe fn cell_at(session: &SessionInner, state: *mut lua_State, idx: c_int) -> *mut Cell {
    let allocs = &session.allocations;
    let cell = match ffi::lua_type(state, idx) {
        ffi::LUA_TNUMBER => Cell::number(ffi::lua_tonumber(state, idx)),
        ffi::LUA_TBOOLEAN => Cell::boolean(ffi::lua_toboolean(state, idx) != 0),
        ffi::LUA_TSTRING => {
            let mut len = 0usize;
            let data = ffi::lua_tolstring(state, idx, &mut len);
            let source = std::slice::from_raw_parts(data as *const u8, len);
            let (bytes, len) = abi::alloc_bytes(allocs, source);
            Cell::string(bytes, len)
        }
        ffi::LUA_TFUNCTION => {
            let native = callback::is_host_function(state, idx);
            Cell::function(anchor(state, idx), native)
        }
        ffi::LUA_TTABLE => Cell::opaque(anchor(state, idx), ReferenceKind::Table),
        ffi::LUA_TUSERDATA => Cell::opaque(anchor(state, idx), ReferenceKind::Userdata),
        ffi::LUA_TTHREAD => Cell::opaque(anchor(state, idx), ReferenceKind::Thread),
        ffi::LUA_TLIGHTUSERDATA => Cell::opaque(anchor(state, idx), ReferenceKind::LightUserdata),
        _ => return ptr::null_mut(),
    };
    abi::alloc_cell(allocs, cell).as_ptr()
}

unsafe fn anchor(state: *mut lua_State, idx: c_int) -> c_int {
    ffi::lua_pushvalue(state, idx);
    ffi::luaL_ref(state, ffi::LUA_REGISTRYINDEX)
}

/// Convert every value above `base` into cells, in stack order, and pop them.
pub(crate) unsafe fn collect_cells(
    session: &SessionInner,
    state: *mut lua_State,
    base: c_int,
) -> Vec<*mut Cell> {
    let top = ffi::lua_gettop(state);
    let cells = (base + 1..=top)
        .map(|idx| cell_at(session, state, idx))
        .collect();
    ffi::lua_settop(state, base);
    cells
}

/// Convert the value on top of the stack into a cell and pop it.
pub(crate) unsafe fn pop_cell(session: &SessionInner, state: *mut lua_State) -> *mut Cell {
    let cell = cell_at(session, state, -1);
    ffi::lua_pop(state, 1);
    cell
}
