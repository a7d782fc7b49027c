//! Helper utilities, functions, and macros.

#[macro_use]
mod print;

#[macro_use]
mod config;

mod error;
mod safetcp;
mod shutdown;

pub use error::{ChorusError, ErrorKind};
pub use print::{logger_init, ME};
pub use shutdown::ShutdownSignal;

pub(crate) use safetcp::{
    safe_tcp_read, safe_tcp_write, tcp_bind_with_retry, tcp_connect_with_retry,
};
