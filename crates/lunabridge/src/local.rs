//! Host-side handles over runtime-owned values

use std::fmt;
use std::ptr::NonNull;
use std::rc::Rc;

use crate::abi::{CallEnvelope, Cell, ReferenceKind};
use crate::bridge;
use crate::cells::CellArray;
use crate::error::BridgeResult;
use crate::foreign;
use crate::session::{SessionId, SessionInner};
use crate::value::Value;

/// A runtime value held alive from the host.
///
/// The reference owns one registry anchor in its session's runtime and
/// releases it when dropped. It can only be passed back to the session that
/// produced it.
pub struct LocalRef {
    session: Rc<SessionInner>,
    cell: NonNull<Cell>,
}

impl LocalRef {
    /// Take ownership of an inbound cell.
    ///
    /// # Safety
    /// `cell` must be a live Function or Opaque cell allocated for `session`,
    /// with no other owner.
    pub(crate) unsafe fn adopt(session: Rc<SessionInner>, cell: NonNull<Cell>) -> Self {
        Self { session, cell }
    }

    /// Runtime type of the referenced value
    pub fn kind(&self) -> ReferenceKind {
        self.cell().reference_kind().unwrap_or(ReferenceKind::Function)
    }

    /// Whether this refers to a host callable that came back from the runtime
    pub fn is_host_function(&self) -> bool {
        self.cell().is_native()
    }

    /// Session that owns the value
    pub fn session_id(&self) -> SessionId {
        self.session.id()
    }

    /// Release the value now.
    pub fn release(self) {
        drop(self)
    }

    /// Hold the same runtime value through a second, independent anchor.
    pub fn clone_ref(&self) -> BridgeResult<LocalRef> {
        let state = self.session.state()?;
        let cell = unsafe { foreign::duplicate_reference(&self.session, state, self.cell())? };
        Ok(unsafe { LocalRef::adopt(Rc::clone(&self.session), cell) })
    }

    /// Whether both refer to the same anchored cell
    pub fn same_cell(&self, other: &LocalRef) -> bool {
        self.cell == other.cell
    }

    pub(crate) fn cell(&self) -> &Cell {
        unsafe { self.cell.as_ref() }
    }
}

impl Drop for LocalRef {
    fn drop(&mut self) {
        self.session.free_cell(self.cell);
    }
}

impl fmt::Debug for LocalRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LocalRef")
            .field("session", &self.session.id())
            .field("cell", self.cell())
            .finish()
    }
}

/// A runtime function that can be called from the host.
#[derive(Debug)]
pub struct LocalFunction(LocalRef);

impl LocalFunction {
    pub(crate) fn new(reference: LocalRef) -> Self {
        LocalFunction(reference)
    }

    /// Call the function under a protected call.
    ///
    /// Arguments are lent to the runtime: primitives marshaled for the call
    /// are released when it returns, local references stay owned by the
    /// caller. A runtime error comes back as `ScriptError` with no results.
    pub fn call(&self, args: &[Value]) -> BridgeResult<Vec<Value>> {
        let session = &self.0.session;
        let state = session.state()?;

        let outbound = bridge::marshal_out_many(session, args)?;
        let envelope: CallEnvelope =
            unsafe { foreign::call_function(session, state, self.0.cell(), &outbound)? };
        drop(outbound);

        let mut cells = unsafe { CellArray::from_envelope(session, envelope)? };
        bridge::marshal_in_many(session, &mut cells)
    }

    /// Borrow as a plain reference
    pub fn as_reference(&self) -> &LocalRef {
        &self.0
    }

    /// Hold the same function through a second, independent anchor
    pub fn clone_ref(&self) -> BridgeResult<LocalFunction> {
        self.0.clone_ref().map(LocalFunction)
    }

    /// Convert into a plain reference
    pub fn into_reference(self) -> LocalRef {
        self.0
    }

    /// Release the function now.
    pub fn release(self) {
        self.0.release()
    }
}

impl From<LocalFunction> for LocalRef {
    fn from(function: LocalFunction) -> Self {
        function.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::BridgeError;
    use crate::session::Session;

    #[test]
    fn test_reference_kinds() {
        let session = Session::new().unwrap();
        session
            .execute("t = {} co = coroutine.create(function() end) f = function() end")
            .unwrap();

        let t = session.get_global("t").unwrap();
        let co = session.get_global("co").unwrap();
        let f = session.get_global("f").unwrap();
        assert_eq!(t.as_reference().unwrap().kind(), ReferenceKind::Table);
        assert_eq!(co.as_reference().unwrap().kind(), ReferenceKind::Thread);
        assert_eq!(f.as_reference().unwrap().kind(), ReferenceKind::Function);
        assert!(f.as_function().is_some());

        drop((t, co, f));
        assert_eq!(session.outstanding_allocations(), 0);
        session.close();
    }

    #[test]
    fn test_call_returns_results_in_order() {
        let session = Session::new().unwrap();
        session
            .execute("function multi(a) return a * 3, 'testing', false end")
            .unwrap();
        let multi = session.get_global("multi").unwrap();
        let results = multi.as_function().unwrap().call(&[Value::from(3)]).unwrap();
        assert_eq!(
            results,
            vec![Value::Number(9.0), Value::from("testing"), Value::Boolean(false)]
        );
        drop(multi);
        assert_eq!(session.outstanding_allocations(), 0);
        session.close();
    }

    #[test]
    fn test_call_reports_script_error() {
        let session = Session::new().unwrap();
        session.execute("function fail() error('some error') end").unwrap();
        let fail = session.get_global("fail").unwrap().into_typed::<LocalFunction>().unwrap();
        let err = fail.call(&[]).unwrap_err();
        assert!(matches!(err, BridgeError::ScriptError(ref m) if m.ends_with("some error")));
        fail.release();
        assert_eq!(session.outstanding_allocations(), 0);
        session.close();
    }

    #[test]
    fn test_reference_passed_back_is_not_consumed() {
        let session = Session::new().unwrap();
        session
            .execute("t = { n = 4 } function get(tbl) return tbl.n end")
            .unwrap();
        let t = session.get_global("t").unwrap();
        let get = session.get_global("get").unwrap();
        let get = get.as_function().unwrap();

        let args = [t];
        assert_eq!(get.call(&args).unwrap(), vec![Value::Number(4.0)]);
        assert_eq!(get.call(&args).unwrap(), vec![Value::Number(4.0)]);
        drop(args);
        session.close();
    }

    #[test]
    fn test_clone_ref_outlives_original() {
        let session = Session::new().unwrap();
        session.execute("function one() return 1 end").unwrap();
        let one = session.get_function("one").unwrap();
        let copy = one.clone_ref().unwrap();
        assert!(!copy.as_reference().same_cell(one.as_reference()));
        assert_eq!(session.outstanding_allocations(), 2);

        drop(one);
        assert_eq!(copy.call(&[]).unwrap(), vec![Value::Number(1.0)]);
        drop(copy);
        assert_eq!(session.outstanding_allocations(), 0);
        session.close();
    }

    #[test]
    fn test_clone_ref_after_close_fails() {
        let session = Session::new().unwrap();
        session.execute("t = {}").unwrap();
        let t = session.get_global("t").unwrap().into_typed::<LocalRef>().unwrap();
        session.close();
        assert!(matches!(t.clone_ref(), Err(BridgeError::SessionClosed)));
    }

    #[test]
    fn test_call_after_close_fails() {
        let session = Session::new().unwrap();
        session.execute("function f() end").unwrap();
        let f = session.get_global("f").unwrap().into_typed::<LocalFunction>().unwrap();
        session.close();
        assert!(matches!(f.call(&[]), Err(BridgeError::SessionClosed)));
        drop(f);
    }
}
