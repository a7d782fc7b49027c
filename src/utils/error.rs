//! Customized unified error type.

use std::error;
use std::fmt;
use std::io;
use std::net;
use std::num;
use std::string;

/// Category of a `ChorusError`, which decides how far a failure propagates:
/// transport and protocol faults tear down a single connection, storage
/// faults bring down the whole server.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum ErrorKind {
    /// Anything not falling into the categories below.
    Generic,

    /// Session/socket level failure.
    Transport,

    /// Unexpected message type or protocol version.
    Protocol,

    /// Change log storage failure; always fatal.
    Storage,

    /// Generation id mismatch, duplicate server id, and the like.
    Consistency,
}

/// Customized error type for Chorus.
#[derive(Debug, PartialEq, Eq, Clone)]
pub struct ChorusError {
    kind: ErrorKind,
    msg: String,
}

impl ChorusError {
    pub fn msg(msg: impl ToString) -> Self {
        ChorusError {
            kind: ErrorKind::Generic,
            msg: msg.to_string(),
        }
    }

    pub fn transport(msg: impl ToString) -> Self {
        ChorusError {
            kind: ErrorKind::Transport,
            msg: msg.to_string(),
        }
    }

    pub fn protocol(msg: impl ToString) -> Self {
        ChorusError {
            kind: ErrorKind::Protocol,
            msg: msg.to_string(),
        }
    }

    pub fn storage(msg: impl ToString) -> Self {
        ChorusError {
            kind: ErrorKind::Storage,
            msg: msg.to_string(),
        }
    }

    pub fn consistency(msg: impl ToString) -> Self {
        ChorusError {
            kind: ErrorKind::Consistency,
            msg: msg.to_string(),
        }
    }

    #[inline]
    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    /// Returns true if this error must shut down the whole server.
    #[inline]
    pub fn is_fatal(&self) -> bool {
        self.kind == ErrorKind::Storage
    }

    /// Re-tags the error as a storage fault, keeping its message.
    pub fn into_storage(self) -> Self {
        ChorusError {
            kind: ErrorKind::Storage,
            msg: self.msg,
        }
    }
}

impl fmt::Display for ChorusError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.msg) // do not display literal quotes
    }
}

impl error::Error for ChorusError {}

// Helper macro for saving boiler-plate `impl From<X>`s for transparent
// conversion from various common error types to `ChorusError`.
macro_rules! impl_from_error {
    ($error:ty, $kind:ident) => {
        impl From<$error> for ChorusError {
            fn from(e: $error) -> Self {
                // just store the source error's string representation
                ChorusError {
                    kind: ErrorKind::$kind,
                    msg: e.to_string(),
                }
            }
        }
    };
}

// Helper macro for saving boiler-plate `impl From<X<T>>`s for transparent
// conversion from various common generic error types to `ChorusError`.
macro_rules! impl_from_error_generic {
    ($error:ty, $kind:ident) => {
        impl<T> From<$error> for ChorusError {
            fn from(e: $error) -> ChorusError {
                ChorusError {
                    kind: ErrorKind::$kind,
                    msg: e.to_string(),
                }
            }
        }
    };
}

impl_from_error!(io::Error, Transport);
impl_from_error!(string::FromUtf8Error, Generic);
impl_from_error!(num::ParseIntError, Generic);
impl_from_error!(num::TryFromIntError, Generic);
impl_from_error!(net::AddrParseError, Generic);
impl_from_error!(rmp_serde::encode::Error, Protocol);
impl_from_error!(rmp_serde::decode::Error, Protocol);
impl_from_error!(toml::ser::Error, Generic);
impl_from_error!(toml::de::Error, Generic);
impl_from_error!(ctrlc::Error, Generic);
impl_from_error!(tokio::task::JoinError, Generic);
impl_from_error!(tokio::sync::AcquireError, Transport);
impl_from_error!(tokio::time::error::Elapsed, Transport);

impl_from_error_generic!(tokio::sync::watch::error::SendError<T>, Generic);
impl_from_error_generic!(tokio::sync::mpsc::error::SendError<T>, Transport);
