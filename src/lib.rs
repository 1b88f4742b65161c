//! remote-core: buffer-pooled command server for media center remote control.
//!
//! Clients send one request line such as `GET /music-play indexes:1 HTTP/1.1`
//! and receive a minimal HTTP response, after which the server closes the
//! connection. Commands are executed by an external [`dispatch::Dispatcher`];
//! this crate only admits connections, parses requests, routes commands and
//! frames responses.
//!
//! Features:
//! - One pre-allocated buffer arena sliced per connection
//! - LIFO pool of reusable operation contexts
//! - Semaphore-based admission control with typed release ordering
//! - Chained commands (`cmd1/cmd2`) with concatenated output
//! - Responses of any size streamed through a fixed send buffer

pub mod config;
pub mod dispatch;
pub mod response;
pub mod router;
pub mod runtime;
pub mod server;

pub use config::Config;
pub use dispatch::{CommandOutput, CommandTable, ContentKind, DispatchError, Dispatcher, TemplateSet, Templates};
pub use router::Router;
pub use server::{Server, ServerError, ServerStats};
