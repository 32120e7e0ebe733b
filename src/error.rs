//! The EDA DAQ errors

use failure::{Backtrace, Context, Fail};
use std::fmt::{self, Debug, Display};
use std::io;
use std::time::Duration;

pub struct Error {
    inner: Context<ErrorKind>,
}

#[derive(Clone, Eq, PartialEq, Debug, Fail)]
pub enum ErrorKind {
    /// General error used for more specific input/output error.
    #[fail(display = "{}", _0)]
    General(String),

    /// Standard input/output error.
    #[fail(display = "IO: {}", _0)]
    Io(String),

    /// A marker byte did not belong to the expected set at that position.
    #[fail(display = "unexpected marker byte {:#04x}", _0)]
    BadMarker(u8),

    /// Decoder header chamber-id mismatch.
    #[fail(display = "wrong chamber id: got {:#04x}, want {:#04x}", got, want)]
    WrongChamberId { got: u8, want: u8 },

    /// An analog-frame marker was encountered.
    #[fail(display = "analog frames are not supported")]
    AnalogUnsupported,

    /// The incomplete-frame marker was encountered.
    #[fail(display = "hardware flagged an incomplete frame")]
    IncompleteFrame,

    /// Trailer CRC does not match the running checksum.
    #[fail(display = "CRC mismatch: got {:#06x}, want {:#06x}", got, want)]
    CrcMismatch { got: u16, want: u16 },

    /// EOF in the middle of a record.
    #[fail(display = "unexpected EOF inside record")]
    UnexpectedEof,

    /// EOF where the next record was expected to start.
    #[fail(display = "input exhausted")]
    InputExhausted,

    /// A hardware readiness bit never showed up.
    #[fail(display = "hardware timeout: {} not ready after {:?}", what, after)]
    HardwareTimeout { what: String, after: Duration },

    /// Slow-control handshake failed the loopback check.
    #[fail(
        display = "slot {}: slow-control loopback mismatch: got {:#010x}, want {:#010x}",
        slot, got, want
    )]
    LoopbackMismatch { slot: usize, got: u32, want: u32 },

    /// Sink framing violation (non-ACK reply, short read/write, ...).
    #[fail(display = "protocol: {}", _0)]
    Protocol(String),

    /// Configuration file parsing.
    #[fail(display = "config: line {}: {}", line, detail)]
    Config { line: usize, detail: String },

    /// An operation was attempted in a mode that does not support it.
    #[fail(display = "invalid state: {}", _0)]
    InvalidState(String),
}

/// Implement Fail trait instead of use Derive to get more control over custom type.
/// The main advantage is customization of Context type which allows conversion of
/// any error types to this custom error with general error kind by calling context
/// method on any result type.
impl Fail for Error {
    fn cause(&self) -> Option<&dyn Fail> {
        self.inner.cause()
    }

    fn backtrace(&self) -> Option<&Backtrace> {
        self.inner.backtrace()
    }
}

impl Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        Display::fmt(&self.inner, f)
    }
}

impl Debug for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        Debug::fmt(&self.inner, f)
    }
}

impl Error {
    pub fn kind(&self) -> ErrorKind {
        self.inner.get_context().clone()
    }
}

impl From<ErrorKind> for Error {
    fn from(kind: ErrorKind) -> Self {
        Self {
            inner: Context::new(kind),
        }
    }
}

impl From<Context<ErrorKind>> for Error {
    fn from(inner: Context<ErrorKind>) -> Self {
        Self { inner }
    }
}

impl From<Context<String>> for Error {
    fn from(context: Context<String>) -> Self {
        Self {
            inner: context.map(|info| ErrorKind::General(info)),
        }
    }
}

impl From<String> for Error {
    fn from(msg: String) -> Self {
        ErrorKind::General(msg).into()
    }
}

impl From<std::num::ParseIntError> for Error {
    fn from(e: std::num::ParseIntError) -> Self {
        let msg = e.to_string();
        Self {
            inner: e.context(ErrorKind::General(msg)),
        }
    }
}

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Self {
        let msg = e.to_string();
        Self {
            inner: e.context(ErrorKind::Io(msg)),
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        ErrorKind::Protocol(e.to_string()).into()
    }
}

impl From<nix::Error> for Error {
    fn from(e: nix::Error) -> Self {
        ErrorKind::Io(e.to_string()).into()
    }
}

/// A specialized `Result` type bound to [`Error`].
pub type Result<T> = std::result::Result<T, Error>;
