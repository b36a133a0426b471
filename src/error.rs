//! Error types for the Coral runtime.

use thiserror::Error;

/// Result type alias using the runtime's Error.
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for runtime operations.
#[derive(Error, Debug)]
pub enum Error {
    /// A shared block could not be created, mapped, resized or released.
    ///
    /// The message names the failing step and carries the OS error text.
    #[error("shared block allocation failed: {0}")]
    Allocation(String),

    /// Indexed access past the end of a buffer.
    #[error("index {index} out of range for length {len}")]
    OutOfRange {
        /// The requested index.
        index: usize,
        /// The buffer length at the time of the access.
        len: usize,
    },

    /// An argument was built with a type or flag the wire cannot carry.
    #[error("invalid argument: {0}")]
    ArgumentType(String),

    /// Resolving, connecting to, or writing to the resource manager failed.
    #[error("connection to resource manager failed: {0}")]
    Connection(#[source] std::io::Error),

    /// The peer sent something that does not follow the wire protocol.
    #[error("protocol violation: {0}")]
    Protocol(String),

    /// A session was used out of order.
    #[error("session misuse: {0}")]
    Misuse(String),

    /// A configuration override could not be parsed.
    #[error("invalid configuration: {0}")]
    Config(String),
}

impl Error {
    /// Build an allocation error from a failing system call.
    pub(crate) fn allocation(step: &str, errno: rustix::io::Errno) -> Self {
        Error::Allocation(format!("{step}: {errno}"))
    }

    /// Build a protocol error from an I/O failure while reading from the peer.
    pub(crate) fn protocol_io(what: &str, err: std::io::Error) -> Self {
        if err.kind() == std::io::ErrorKind::UnexpectedEof {
            Error::Protocol(format!("short read while reading {what}"))
        } else {
            Error::Protocol(format!("reading {what}: {err}"))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_allocation_message_carries_os_text() {
        let err = Error::allocation("mmap", rustix::io::Errno::NOMEM);
        let text = err.to_string();
        assert!(text.starts_with("shared block allocation failed: mmap: "));
        assert!(text.len() > "shared block allocation failed: mmap: ".len());
    }

    #[test]
    fn test_short_read_is_protocol_error() {
        let io = std::io::Error::new(std::io::ErrorKind::UnexpectedEof, "eof");
        match Error::protocol_io("packet header", io) {
            Error::Protocol(msg) => assert_eq!(msg, "short read while reading packet header"),
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn test_out_of_range_display() {
        let err = Error::OutOfRange { index: 7, len: 3 };
        assert_eq!(err.to_string(), "index 7 out of range for length 3");
    }
}
