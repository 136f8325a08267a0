//! Dispatch of script calls into host callables
//!
//! The runtime-facing closure (see `foreign::callback`) gathers the argument
//! cells and resolves the owning session; this module does the rest:
//! restore the callable, marshal arguments in, run it, and marshal its
//! results out. Errors and results are exclusive; an error always means zero
//! results for the script caller.

use std::os::raw::c_int;
use std::panic::{self, AssertUnwindSafe};
use std::rc::Rc;

use crate::abi::Cell;
use crate::bridge;
use crate::cells::CellArray;
use crate::error::{BridgeError, BridgeResult};
use crate::handles::Handle;
use crate::session::SessionInner;
use crate::value::Value;

/// Invoke the callable pinned under `handle` with the given argument cells.
pub(crate) fn dispatch(
    session: &Rc<SessionInner>,
    handle: Handle,
    mut args: CellArray<'_>,
) -> BridgeResult<Vec<Value>> {
    let function = session
        .handles
        .restore(handle)
        .ok_or(BridgeError::NotCallable(handle))?;

    let args = bridge::marshal_in_many(session, &mut args)?;
    log::trace!("dispatching {} with {} arguments", handle, args.len());

    match panic::catch_unwind(AssertUnwindSafe(|| function.call(args))) {
        Ok(result) => result,
        Err(payload) => {
            let message = payload
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| payload.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "unknown panic".to_string());
            log::warn!("host function {} panicked: {}", handle, message);
            Err(BridgeError::Panic(message))
        }
    }
}

/// Marshal `results` out and hand each cell to `push`, in order.
///
/// Returns the number of values pushed. The cells are released once pushed;
/// the runtime keeps its own copies.
pub(crate) fn respond<F>(
    session: &SessionInner,
    results: &[Value],
    mut push: F,
) -> BridgeResult<c_int>
where
    F: FnMut(Option<&Cell>) -> BridgeResult<()>,
{
    let count = c_int::try_from(results.len())
        .map_err(|_| BridgeError::Runtime("too many results".to_string()))?;
    let cells = bridge::marshal_out_many(session, results)?;
    for cell in &cells {
        push(cell.get())?;
    }
    Ok(count)
}
