//! In-process layouts shared by the bridge and the foreign-side shim
//!
//! These types are C-compatible and carry raw pointers. Ownership of every
//! allocation made here is tracked by an [`Allocations`] counter owned by the
//! session, so that tests can check that each scenario releases exactly what
//! it acquired.
//!
//! # Cell encoding
//!
//! ```text
//! Nil       null Cell pointer (no allocation)
//! Number    data.number
//! Boolean   data.boolean
//! String    data.pointer -> bridge-owned bytes, aux = byte length
//! Function  data.reference (registry ref), aux = 0
//!           data.handle (host handle),     aux = AUX_UNRESOLVED
//!           native = true for host-registered callbacks
//! Opaque    data.reference (registry ref), aux = ReferenceKind
//! ```

use std::ffi::{c_void, CString};
use std::os::raw::{c_char, c_int};
use std::ptr::{self, NonNull};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use crate::handles::Handle;

// ============================================================================
// Cell
// ============================================================================

/// Discriminant of a value crossing the boundary
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CellTag {
    /// Absent value
    Nil = 0,
    /// Double-precision number
    Number = 1,
    /// Boolean
    Boolean = 2,
    /// Byte string
    String = 3,
    /// Callable runtime value
    Function = 4,
    /// Table, userdata, thread or light userdata
    Opaque = 5,
}

/// Fixed-width payload of a [`Cell`]
#[repr(C)]
#[derive(Clone, Copy)]
pub union CellData {
    /// Number payload
    pub number: f64,
    /// Boolean payload
    pub boolean: bool,
    /// String bytes
    pub pointer: *mut c_void,
    /// Handle of an outbound host callable
    pub handle: u64,
    /// Runtime registry reference
    pub reference: c_int,
}

/// `aux` marker for a Function cell that still holds a registry handle
pub const AUX_UNRESOLVED: usize = 1;

/// Runtime type of a non-primitive value held by reference
#[repr(usize)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReferenceKind {
    /// Function value
    Function = 0,
    /// Table
    Table = 1,
    /// Full userdata
    Userdata = 2,
    /// Coroutine
    Thread = 3,
    /// Light userdata
    LightUserdata = 4,
}

impl ReferenceKind {
    pub(crate) fn from_aux(aux: usize) -> Self {
        match aux {
            1 => ReferenceKind::Table,
            2 => ReferenceKind::Userdata,
            3 => ReferenceKind::Thread,
            4 => ReferenceKind::LightUserdata,
            _ => ReferenceKind::Function,
        }
    }

    /// Name used in diagnostics
    pub fn name(self) -> &'static str {
        match self {
            ReferenceKind::Function => "function",
            ReferenceKind::Table => "table",
            ReferenceKind::Userdata => "userdata",
            ReferenceKind::Thread => "thread",
            ReferenceKind::LightUserdata => "lightuserdata",
        }
    }
}

/// A tagged value crossing the boundary.
///
/// Cells are heap-allocated one at a time and have exactly one owner.
#[repr(C)]
pub struct Cell {
    /// Value kind
    pub tag: CellTag,
    /// Payload
    pub data: CellData,
    /// String length, function resolution marker or reference kind
    pub aux: usize,
    /// Set for host-registered callbacks
    pub native: bool,
}

impl Cell {
    pub(crate) fn number(n: f64) -> Self {
        Cell {
            tag: CellTag::Number,
            data: CellData { number: n },
            aux: 0,
            native: false,
        }
    }

    pub(crate) fn boolean(b: bool) -> Self {
        Cell {
            tag: CellTag::Boolean,
            data: CellData { boolean: b },
            aux: 0,
            native: false,
        }
    }

    /// Adopts a buffer obtained from [`alloc_bytes`].
    pub(crate) fn string(bytes: *mut u8, len: usize) -> Self {
        Cell {
            tag: CellTag::String,
            data: CellData {
                pointer: bytes as *mut c_void,
            },
            aux: len,
            native: false,
        }
    }

    pub(crate) fn unresolved_function(handle: Handle) -> Self {
        Cell {
            tag: CellTag::Function,
            data: CellData {
                handle: handle.as_u64(),
            },
            aux: AUX_UNRESOLVED,
            native: true,
        }
    }

    pub(crate) fn function(reference: c_int, native: bool) -> Self {
        Cell {
            tag: CellTag::Function,
            data: CellData { reference },
            aux: 0,
            native,
        }
    }

    pub(crate) fn opaque(reference: c_int, kind: ReferenceKind) -> Self {
        Cell {
            tag: CellTag::Opaque,
            data: CellData { reference },
            aux: kind as usize,
            native: false,
        }
    }

    /// Value kind
    pub fn tag(&self) -> CellTag {
        self.tag
    }

    /// Whether this cell is a host-registered callback
    pub fn is_native(&self) -> bool {
        self.native
    }

    /// Handle of a host callable that has not been delivered to the runtime
    pub fn unresolved_handle(&self) -> Option<Handle> {
        if self.tag == CellTag::Function && self.aux == AUX_UNRESOLVED {
            Handle::from_raw(unsafe { self.data.handle })
        } else {
            None
        }
    }

    /// Registry reference of a value held by the runtime
    pub fn reference(&self) -> Option<c_int> {
        match self.tag {
            CellTag::Function if self.aux != AUX_UNRESOLVED => Some(unsafe { self.data.reference }),
            CellTag::Opaque => Some(unsafe { self.data.reference }),
            _ => None,
        }
    }

    /// Runtime type of a referenced value
    pub fn reference_kind(&self) -> Option<ReferenceKind> {
        match self.tag {
            CellTag::Function => Some(ReferenceKind::Function),
            CellTag::Opaque => Some(ReferenceKind::from_aux(self.aux)),
            _ => None,
        }
    }

    /// String payload
    ///
    /// # Safety
    /// The cell must be a String cell whose buffer is still live.
    pub(crate) unsafe fn bytes(&self) -> &[u8] {
        if self.aux == 0 {
            return &[];
        }
        std::slice::from_raw_parts(self.data.pointer as *const u8, self.aux)
    }
}

impl std::fmt::Debug for Cell {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.tag {
            CellTag::Nil => write!(f, "Cell::Nil"),
            CellTag::Number => write!(f, "Cell::Number({})", unsafe { self.data.number }),
            CellTag::Boolean => write!(f, "Cell::Boolean({})", unsafe { self.data.boolean }),
            CellTag::String => write!(f, "Cell::String(len={})", self.aux),
            CellTag::Function => match self.unresolved_handle() {
                Some(handle) => write!(f, "Cell::Function(handle={})", handle),
                None => write!(
                    f,
                    "Cell::Function(ref={}, native={})",
                    unsafe { self.data.reference },
                    self.native
                ),
            },
            CellTag::Opaque => write!(
                f,
                "Cell::Opaque({}, ref={})",
                ReferenceKind::from_aux(self.aux).name(),
                unsafe { self.data.reference }
            ),
        }
    }
}

// ============================================================================
// Allocation accounting
// ============================================================================

/// Allocation counters for one session
#[derive(Debug, Default)]
pub struct Allocations {
    /// Allocations acquired and not yet released
    live: AtomicUsize,

    /// Allocations acquired over the session lifetime
    total: AtomicU64,
}

impl Allocations {
    /// Create zeroed counters
    pub fn new() -> Self {
        Self::default()
    }

    /// Record one allocation
    pub fn acquire(&self) {
        self.live.fetch_add(1, Ordering::Relaxed);
        self.total.fetch_add(1, Ordering::Relaxed);
    }

    /// Record one release
    pub fn release(&self) {
        let previous = self.live.fetch_sub(1, Ordering::Relaxed);
        debug_assert!(previous > 0, "allocation released twice");
    }

    /// Allocations currently outstanding
    pub fn outstanding(&self) -> usize {
        self.live.load(Ordering::Relaxed)
    }

    /// Allocations made since creation
    pub fn total(&self) -> u64 {
        self.total.load(Ordering::Relaxed)
    }
}

/// Move a cell to the heap.
pub(crate) fn alloc_cell(allocs: &Allocations, cell: Cell) -> NonNull<Cell> {
    allocs.acquire();
    NonNull::from(Box::leak(Box::new(cell)))
}

/// Free a cell and the string buffer it owns.
///
/// Registry references and handles are not touched here; the session
/// releases those before calling this.
///
/// # Safety
/// `cell` must come from [`alloc_cell`] and must not be used afterwards.
pub(crate) unsafe fn free_cell(allocs: &Allocations, cell: NonNull<Cell>) {
    let boxed = Box::from_raw(cell.as_ptr());
    if boxed.tag == CellTag::String {
        free_bytes(allocs, boxed.data.pointer as *mut u8, boxed.aux);
    }
    drop(boxed);
    allocs.release();
}

/// Copy bytes into a bridge-owned buffer.
pub(crate) fn alloc_bytes(allocs: &Allocations, bytes: &[u8]) -> (*mut u8, usize) {
    allocs.acquire();
    let len = bytes.len();
    let buffer = Box::into_raw(bytes.to_vec().into_boxed_slice()) as *mut u8;
    (buffer, len)
}

/// # Safety
/// `ptr`/`len` must come from [`alloc_bytes`].
pub(crate) unsafe fn free_bytes(allocs: &Allocations, ptr: *mut u8, len: usize) {
    drop(Box::from_raw(ptr::slice_from_raw_parts_mut(ptr, len)));
    allocs.release();
}

/// Move an array of cell pointers to the heap. The cells are not copied.
pub(crate) fn alloc_slots(allocs: &Allocations, slots: Vec<*mut Cell>) -> (*mut *mut Cell, usize) {
    allocs.acquire();
    let len = slots.len();
    let array = Box::into_raw(slots.into_boxed_slice()) as *mut *mut Cell;
    (array, len)
}

/// Take back an array from [`alloc_slots`]. The cells it points to are not freed.
///
/// # Safety
/// `ptr`/`len` must come from [`alloc_slots`].
pub(crate) unsafe fn reclaim_slots(
    allocs: &Allocations,
    ptr: *mut *mut Cell,
    len: usize,
) -> Vec<*mut Cell> {
    let slots = Box::from_raw(ptr::slice_from_raw_parts_mut(ptr, len)).into_vec();
    allocs.release();
    slots
}

// ============================================================================
// Error record
// ============================================================================

/// Error information crossing the boundary. A null record means success.
#[repr(C)]
pub struct ErrorRecord {
    message: *mut c_char,
}

#[repr(transparent)]
struct Sentinel(ErrorRecord);

unsafe impl Sync for Sentinel {}

static INVALID_ERROR: Sentinel = Sentinel(ErrorRecord {
    message: c"INVALID ERROR".as_ptr() as *mut c_char,
});

impl ErrorRecord {
    /// Allocate a record holding `message`
    pub(crate) fn create(allocs: &Allocations, message: &str) -> *mut ErrorRecord {
        let message = CString::new(message).unwrap_or_else(|err| {
            let mut bytes = err.into_vec();
            bytes.retain(|&b| b != 0);
            CString::new(bytes).unwrap_or_default()
        });
        allocs.acquire();
        Box::into_raw(Box::new(ErrorRecord {
            message: message.into_raw(),
        }))
    }

    /// Reserved sentinel signalling that the foreign side lost track of an error
    pub(crate) fn invalid() -> *mut ErrorRecord {
        &INVALID_ERROR.0 as *const ErrorRecord as *mut ErrorRecord
    }

    /// Whether `record` is the reserved sentinel
    pub(crate) fn is_invalid(record: *const ErrorRecord) -> bool {
        ptr::eq(record, ErrorRecord::invalid())
    }

    /// Consume a record and return its message. Null yields `None`.
    ///
    /// The sentinel record only appears when the foreign side is corrupt; it
    /// aborts the process rather than surfacing as an error a host callable
    /// could catch.
    ///
    /// # Safety
    /// `record` must be null, the sentinel, or a live record from [`ErrorRecord::create`].
    pub(crate) unsafe fn into_message(
        allocs: &Allocations,
        record: *mut ErrorRecord,
    ) -> Option<String> {
        if record.is_null() {
            return None;
        }
        if ErrorRecord::is_invalid(record) {
            log::error!("invalid error record raised from the runtime");
            std::process::abort();
        }
        let message = CString::from_raw((*record).message)
            .to_string_lossy()
            .into_owned();
        drop(Box::from_raw(record));
        allocs.release();
        Some(message)
    }
}

// ============================================================================
// Call envelope
// ============================================================================

/// Result of a protected call into the runtime.
///
/// `error` and `values` are mutually exclusive: a failed call has a null
/// value array and a count of zero.
#[repr(C)]
pub struct CallEnvelope {
    /// Error raised by the call, or null
    pub error: *mut ErrorRecord,
    /// Number of returned cells
    pub value_count: i32,
    /// Returned cells (array from [`alloc_slots`]), or null
    pub values: *mut *mut Cell,
}

impl CallEnvelope {
    pub(crate) fn failed(error: *mut ErrorRecord) -> Self {
        CallEnvelope {
            error,
            value_count: 0,
            values: ptr::null_mut(),
        }
    }

    pub(crate) fn returned(allocs: &Allocations, values: Vec<*mut Cell>) -> Self {
        let (values, len) = alloc_slots(allocs, values);
        CallEnvelope {
            error: ptr::null_mut(),
            value_count: len as i32,
            values,
        }
    }
}
