//! Scoped owners for boundary cells
//!
//! Every cell allocated on a bridge path is held by one of these guards until
//! its ownership is handed on. Dropping a guard releases whatever it still
//! owns, so early returns and `?` never leak a cell.

use std::ptr::{self, NonNull};

use crate::abi::{self, CallEnvelope, Cell, ErrorRecord};
use crate::error::{BridgeError, BridgeResult};
use crate::session::SessionInner;

/// A single heap cell owned by the bridge
pub(crate) struct OwnedCell<'s> {
    session: &'s SessionInner,
    cell: NonNull<Cell>,
}

impl<'s> OwnedCell<'s> {
    pub(crate) fn new(session: &'s SessionInner, cell: Cell) -> Self {
        Self {
            cell: abi::alloc_cell(&session.allocations, cell),
            session,
        }
    }

    pub(crate) fn get(&self) -> &Cell {
        unsafe { self.cell.as_ref() }
    }
}

impl Drop for OwnedCell<'_> {
    fn drop(&mut self) {
        self.session.free_cell(self.cell);
    }
}

/// A cell produced by marshaling a host value out
pub(crate) enum OutCell<'a> {
    /// The null cell
    Nil,
    /// A cell allocated for this transfer, released when dropped
    Owned(OwnedCell<'a>),
    /// The cell of a local reference, passed through without copying
    Borrowed(&'a Cell),
}

impl std::fmt::Debug for OutCell<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            OutCell::Nil => f.write_str("Nil"),
            OutCell::Owned(_) => f.write_str("Owned(..)"),
            OutCell::Borrowed(_) => f.write_str("Borrowed(..)"),
        }
    }
}

impl<'a> OutCell<'a> {
    pub(crate) fn owned(session: &'a SessionInner, cell: Cell) -> Self {
        OutCell::Owned(OwnedCell::new(session, cell))
    }

    /// The cell to hand to the runtime; `None` for nil
    pub(crate) fn get(&self) -> Option<&Cell> {
        match self {
            OutCell::Nil => None,
            OutCell::Owned(owned) => Some(owned.get()),
            OutCell::Borrowed(cell) => Some(cell),
        }
    }
}

/// An ordered batch of cells coming in from the runtime.
///
/// Slots are nulled as their cells are taken; whatever is left is released
/// on drop.
pub(crate) struct CellArray<'s> {
    session: &'s SessionInner,
    slots: Vec<*mut Cell>,
}

impl<'s> CellArray<'s> {
    pub(crate) fn new(session: &'s SessionInner, slots: Vec<*mut Cell>) -> Self {
        Self { session, slots }
    }

    /// Take ownership of a call envelope.
    ///
    /// An envelope carrying an error yields `ScriptError` with the message
    /// verbatim; otherwise its value array is adopted.
    ///
    /// # Safety
    /// The envelope must have been produced for `session` and not adopted before.
    pub(crate) unsafe fn from_envelope(
        session: &'s SessionInner,
        envelope: CallEnvelope,
    ) -> BridgeResult<Self> {
        let slots = if envelope.values.is_null() {
            Vec::new()
        } else {
            abi::reclaim_slots(
                &session.allocations,
                envelope.values,
                envelope.value_count.max(0) as usize,
            )
        };
        let cells = CellArray::new(session, slots);

        match ErrorRecord::into_message(&session.allocations, envelope.error) {
            Some(message) => Err(BridgeError::ScriptError(message)),
            None => Ok(cells),
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.slots.len()
    }

    pub(crate) fn slots_mut(&mut self) -> &mut [*mut Cell] {
        &mut self.slots
    }
}

impl Drop for CellArray<'_> {
    fn drop(&mut self) {
        for slot in self.slots.iter_mut() {
            if let Some(cell) = NonNull::new(std::mem::replace(slot, ptr::null_mut())) {
                self.session.free_cell(cell);
            }
        }
    }
}
