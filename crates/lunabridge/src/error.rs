//! Error types for the host/script bridge

use crate::handles::Handle;
use crate::session::SessionId;

/// Result type for bridge operations
pub type BridgeResult<T> = Result<T, BridgeError>;

/// Errors that can occur while marshaling values or calling across the boundary.
///
/// Every variant is returned to the caller. The only conditions that are not
/// reported through this type are bridge-internal corruption (an invalid error
/// record crossing the boundary, or a callback arriving for a runtime that no
/// live session owns); those abort.
#[derive(Debug, Clone, thiserror::Error)]
pub enum BridgeError {
    /// Value has no representation on the other side of the boundary
    #[error("Unsupported type: {0}")]
    UnsupportedType(String),

    /// Typed extraction from a `Value` found another kind
    #[error("Type mismatch: expected {expected}, got {found}")]
    TypeMismatch {
        /// Expected type name
        expected: &'static str,
        /// Actual type name
        found: &'static str,
    },

    /// A local reference was handed to a session other than its own
    #[error("Local reference belongs to session {found}, not session {expected}")]
    WrongSession {
        /// Session the operation was issued on
        expected: SessionId,
        /// Session that owns the reference
        found: SessionId,
    },

    /// Handle does not resolve to a pinned host callable
    #[error("Handle {0} does not resolve to a callable")]
    NotCallable(Handle),

    /// The runtime raised an error; the message is carried verbatim
    #[error("{0}")]
    ScriptError(String),

    /// A batch marshal stopped at `index`; everything marshaled before it was released
    #[error("Failed to marshal value {index}: {source}")]
    MarshalFailure {
        /// Position of the failing element in the batch
        index: usize,
        /// Error raised by the failing element
        #[source]
        source: Box<BridgeError>,
    },

    /// Dotted global path is malformed or does not lead through tables
    #[error("Invalid global path: {0}")]
    InvalidPath(String),

    /// The session owning this value has been closed
    #[error("Session is closed")]
    SessionClosed,

    /// The runtime instance could not be created or refused an operation
    #[error("Runtime error: {0}")]
    Runtime(String),

    /// A host callable panicked while servicing a script call
    #[error("Host function panicked: {0}")]
    Panic(String),

    /// Error raised by a host callable; the message is carried verbatim
    #[error("{0}")]
    Host(String),
}

impl BridgeError {
    /// Create an error to return from a host callable
    pub fn host(message: impl Into<String>) -> Self {
        BridgeError::Host(message.into())
    }

    /// Innermost error, looking through nested marshal failures
    pub fn root(&self) -> &BridgeError {
        let mut current = self;
        while let BridgeError::MarshalFailure { source, .. } = current {
            current = source;
        }
        current
    }

    pub(crate) fn at_index(self, index: usize) -> Self {
        BridgeError::MarshalFailure {
            index,
            source: Box::new(self),
        }
    }
}

impl From<String> for BridgeError {
    fn from(s: String) -> Self {
        BridgeError::Host(s)
    }
}

impl From<&str> for BridgeError {
    fn from(s: &str) -> Self {
        BridgeError::Host(s.to_string())
    }
}
