//! Value marshaling between host values and boundary cells
//!
//! Outbound, a [`Value`] becomes an [`OutCell`]: primitives get a fresh cell
//! that the guard releases, local references lend their own cell, and host
//! callables are pinned in the session's handle registry.
//!
//! Inbound, a cell slot becomes a [`Value`]: primitives are copied and their
//! cell released at once, anything else moves into a local reference. In both
//! cases the slot is nulled so no other path frees the cell again.

use std::ptr::{self, NonNull};
use std::rc::Rc;

use crate::abi::{self, Cell, CellTag};
use crate::cells::{CellArray, OutCell};
use crate::error::{BridgeError, BridgeResult};
use crate::local::{LocalFunction, LocalRef};
use crate::session::SessionInner;
use crate::value::Value;

// ============================================================================
// Host -> runtime
// ============================================================================

fn lend<'a>(session: &SessionInner, reference: &'a LocalRef) -> BridgeResult<OutCell<'a>> {
    if reference.session_id() != session.id() {
        return Err(BridgeError::WrongSession {
            expected: session.id(),
            found: reference.session_id(),
        });
    }
    Ok(OutCell::Borrowed(reference.cell()))
}

/// Marshal one host value into a cell.
pub(crate) fn marshal_out<'a>(
    session: &'a SessionInner,
    value: &'a Value,
) -> BridgeResult<OutCell<'a>> {
    let cell = match value {
        Value::Nil => return Ok(OutCell::Nil),
        Value::Number(n) => Cell::number(*n),
        Value::Boolean(b) => Cell::boolean(*b),
        Value::String(s) => {
            let (bytes, len) = abi::alloc_bytes(&session.allocations, s.as_bytes());
            Cell::string(bytes, len)
        }
        Value::Reference(reference) => return lend(session, reference),
        Value::Function(function) => return lend(session, function.as_reference()),
        Value::HostFunction(function) => {
            let handle = session.handles.save(function.clone());
            log::trace!("pinned host function as {}", handle);
            Cell::unresolved_function(handle)
        }
    };
    Ok(OutCell::owned(session, cell))
}

/// Marshal a batch of host values. On failure every cell produced so far is
/// released before the error is returned.
pub(crate) fn marshal_out_many<'a>(
    session: &'a SessionInner,
    values: &'a [Value],
) -> BridgeResult<Vec<OutCell<'a>>> {
    values
        .iter()
        .enumerate()
        .map(|(index, value)| marshal_out(session, value).map_err(|err| err.at_index(index)))
        .collect()
}

// ============================================================================
// Runtime -> host
// ============================================================================

/// Marshal the cell in `slot` into a host value, taking ownership of it.
pub(crate) fn marshal_in(session: &Rc<SessionInner>, slot: &mut *mut Cell) -> BridgeResult<Value> {
    let Some(cell) = NonNull::new(std::mem::replace(slot, ptr::null_mut())) else {
        return Ok(Value::Nil);
    };

    let (tag, native) = {
        let cell = unsafe { cell.as_ref() };
        (cell.tag(), cell.is_native())
    };

    let value = match tag {
        CellTag::Nil => Ok(Value::Nil),
        CellTag::Number => Ok(Value::Number(unsafe { cell.as_ref().data.number })),
        CellTag::Boolean => Ok(Value::Boolean(unsafe { cell.as_ref().data.boolean })),
        CellTag::String => {
            let bytes = unsafe { cell.as_ref().bytes() };
            std::str::from_utf8(bytes)
                .map(|s| Value::String(s.to_owned()))
                .map_err(|err| {
                    BridgeError::UnsupportedType(format!("string is not valid UTF-8 ({})", err))
                })
        }
        CellTag::Function if !native => {
            let reference = unsafe { LocalRef::adopt(Rc::clone(session), cell) };
            return Ok(Value::Function(LocalFunction::new(reference)));
        }
        CellTag::Function | CellTag::Opaque => {
            let reference = unsafe { LocalRef::adopt(Rc::clone(session), cell) };
            return Ok(Value::Reference(reference));
        }
    };

    session.free_cell(cell);
    value
}

/// Marshal every slot of `cells` in order.
///
/// On failure the values converted so far are dropped, which releases any
/// local references among them; the remaining slots are released by `cells`.
pub(crate) fn marshal_in_many(
    session: &Rc<SessionInner>,
    cells: &mut CellArray<'_>,
) -> BridgeResult<Vec<Value>> {
    let mut values = Vec::with_capacity(cells.len());
    for (index, slot) in cells.slots_mut().iter_mut().enumerate() {
        values.push(marshal_in(session, slot).map_err(|err| err.at_index(index))?);
    }
    Ok(values)
}
