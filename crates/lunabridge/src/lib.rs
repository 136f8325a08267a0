//! Lunabridge - Host/script value bridge for an embedded Lua runtime
//!
//! This crate embeds a Lua 5.4 runtime and lets host code and script code
//! exchange values and call into each other. Values cross the boundary as
//! tagged cells with a single owner; runtime values the host keeps hold of
//! are wrapped in local references that release themselves on drop.
//!
//! # Example
//!
//! ```ignore
//! use lunabridge::{BridgeError, Session, Value};
//!
//! let session = Session::new()?;
//! session.register_callable("host.greet", |args| {
//!     let name = args.into_iter().next().unwrap_or(Value::Nil);
//!     match name.as_str() {
//!         Some(name) => Ok(vec![Value::from(format!("hello, {}", name))]),
//!         None => Err(BridgeError::host("expected a name")),
//!     }
//! })?;
//!
//! session.execute("function fib(n) if n < 2 then return n end return fib(n-1) + fib(n-2) end")?;
//! let fib = session.get_function("fib")?;
//! assert_eq!(fib.call(&[Value::from(7)])?, vec![Value::from(13)]);
//! session.close();
//! ```

#![warn(missing_docs)]

pub mod abi;
mod bridge;
mod cells;
pub mod error;
mod foreign;
pub mod handles;
pub mod local;
pub mod options;
pub mod session;
pub mod session_map;
mod trampoline;
pub mod value;

pub use abi::{CallEnvelope, Cell, CellTag, ErrorRecord, ReferenceKind};
pub use error::{BridgeError, BridgeResult};
pub use handles::{Handle, HandleRegistry};
pub use local::{LocalFunction, LocalRef};
pub use options::SessionOptions;
pub use session::{Session, SessionId};
pub use session_map::SessionMap;
pub use value::{FromValue, HostFn, HostFunction, Value};
