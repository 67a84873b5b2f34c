//! UI layer: TCP listener and per-connection sessions.

mod server;
mod session;
mod signal;

pub use server::{Server, ServerError};
pub use session::{MAX_LINE_LENGTH, serve_connection};
pub use signal::shutdown_signal;
