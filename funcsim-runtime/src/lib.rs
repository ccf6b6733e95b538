//! Invocation engine for funcsim
//!
//! Drives one handler invocation from environment staging through the
//! exactly-once completion protocol, and provides the watch-mode HTTP
//! front end.

pub mod context;
pub mod handler;
pub mod invoker;
pub mod loader;
pub mod server;

pub use context::{CompletionState, InvocationContext};
pub use funcsim_core::{ErrorKind, InvokeError};
pub use handler::{handler_fn, AsyncFnHandler, BoxError, FnHandler, Handler, HandlerCtor, HandlerOutcome};
pub use invoker::{execute, execute_with_callback, ClientContext, EventSource, InvokeOptions};
pub use loader::HandlerRegistry;
pub use server::{watch, WatchOptions};
