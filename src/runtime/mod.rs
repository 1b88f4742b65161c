//! Connection runtime.
//!
//! The pieces a connection passes through, leaves first:
//! - `BufferArena`: one pre-allocated block carved into receive/send slices
//! - `ContextPool`: LIFO pool of per-connection operation contexts
//! - `Admission`: semaphore bounding concurrently admitted connections
//! - `listener`: accept loop handing connections to their own tasks
//! - `connection`: receive/parse/dispatch/send state machine

pub mod admission;
pub mod arena;
pub mod connection;
pub mod context;
pub mod listener;

pub use admission::{Admission, AdmissionClosed, AdmissionPermit};
pub use arena::{ArenaError, BufferArena, Slice};
pub use connection::{ConnState, Outcome};
pub use context::{ContextPool, OperationContext, PendingResponse, Returned};
