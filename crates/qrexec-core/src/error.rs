//! Error types for the qrexec client.

use std::path::PathBuf;

use thiserror::Error;

use crate::exit::EXIT_FAILURE;
use crate::protocol::MsgType;

/// Result type alias using the qrexec [`Error`].
pub type Result<T> = std::result::Result<T, Error>;

/// Violations of the framed wire protocol.
///
/// Any of these leaves the inbound byte stream unframed, so the session
/// cannot resynchronise and must abort.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    /// A header declared a payload larger than the protocol allows.
    #[error("frame length {len} exceeds maximum chunk size {max}")]
    OversizedFrame { len: u32, max: usize },

    /// A header carried a type outside the protocol enumeration.
    #[error("unknown message type {0:#x}")]
    UnknownMessageType(u32),

    /// A known message type that is never valid in this direction.
    #[error("unexpected {0} message from daemon")]
    UnexpectedMessage(MsgType),

    /// An `EXIT_CODE` payload too short to hold a status word.
    #[error("exit code payload is {len} bytes, expected 4")]
    MalformedExitCode { len: usize },

    /// Command strings travel NUL-terminated and cannot embed a NUL.
    #[error("command line contains an interior NUL byte")]
    CommandContainsNul,

    /// Command does not fit in a single frame.
    #[error("command line is {len} bytes, exceeds maximum chunk size {max}")]
    CommandTooLong { len: usize, max: usize },
}

/// Session-level error taxonomy.
#[derive(Debug, Error)]
pub enum Error {
    /// The daemon endpoint does not exist or refused the connection.
    #[error("cannot connect to {}: {source}", path.display())]
    Connect {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Malformed or unexpected traffic on the daemon channel.
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// The peer closed its read side while we were writing.
    #[error("daemon closed its end of the connection")]
    BrokenPeer,

    /// Any other failure reading from or writing to the daemon.
    #[error("daemon connection: {0}")]
    Connection(#[source] std::io::Error),

    /// Failure on a local endpoint (subordinate pipes or our own stdio).
    #[error("local I/O: {0}")]
    LocalIo(#[source] std::io::Error),

    /// The local command could not be started.
    #[error("failed to spawn local command `{command}`: {source}")]
    ChildSpawn {
        command: String,
        #[source]
        source: std::io::Error,
    },

    /// Configuration error
    #[error("configuration error: {0}")]
    Config(String),
}

impl Error {
    /// Classify a failed write on the daemon connection.
    pub fn from_write(err: std::io::Error) -> Self {
        if err.kind() == std::io::ErrorKind::BrokenPipe {
            Self::BrokenPeer
        } else {
            Self::Connection(err)
        }
    }

    /// Whether this error is the recoverable peer-closed condition.
    pub const fn is_broken_peer(&self) -> bool {
        matches!(self, Self::BrokenPeer)
    }

    /// Process exit code for a session that dies with this error.
    pub const fn exit_code(&self) -> i32 {
        EXIT_FAILURE
    }
}

#[cfg(test)]
#[allow(clippy::panic, clippy::expect_used, clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn broken_pipe_is_broken_peer() {
        let err = Error::from_write(std::io::Error::from(std::io::ErrorKind::BrokenPipe));
        assert!(err.is_broken_peer());
    }

    #[test]
    fn other_write_failures_are_connection_errors() {
        let err = Error::from_write(std::io::Error::from(std::io::ErrorKind::ConnectionReset));
        assert!(matches!(err, Error::Connection(_)));
        assert_eq!(err.exit_code(), EXIT_FAILURE);
    }

    #[test]
    fn oversized_frame_message_names_both_lengths() {
        let msg = ProtocolError::OversizedFrame { len: 4097, max: 4096 }.to_string();
        assert!(msg.contains("4097"));
        assert!(msg.contains("4096"));
    }
}
