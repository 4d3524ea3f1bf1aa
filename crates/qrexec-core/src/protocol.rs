//! Framed wire protocol spoken with the qrexec daemon.
//!
//! Every framed message is a fixed header followed by its payload:
//!
//! ```text
//! [type:u32][len:u32][payload: len bytes]
//! ```
//!
//! Both header words use native byte order; the daemon always runs on the
//! same host. Only the initial command message travels framed from client
//! to daemon, everything after it on that direction is raw bytes. The
//! daemon to client direction is framed for its whole lifetime.

use std::fmt;

use tokio::io::{AsyncRead, AsyncReadExt};

use crate::error::{Error, ProtocolError, Result};

/// Largest payload a single frame may carry.
pub const MAX_DATA_CHUNK: usize = 4096;

/// Size of an encoded [`Header`].
pub const HEADER_LEN: usize = 8;

/// Message types valid on the client channel.
///
/// The daemon numbers all of its messages in one enumeration starting at
/// `0x100`; values between [`MsgType::ConnectExisting`] and
/// [`MsgType::Stdout`] belong to the daemon/agent link and never reach a
/// client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MsgType {
    /// Client → daemon: run a command and stream its stdio.
    ExecCmdline,
    /// Client → daemon: run a command without streaming anything back.
    JustExec,
    /// Client → daemon: attach to an already running remote command.
    ConnectExisting,
    /// Daemon → client: chunk of the remote command's stdout.
    Stdout,
    /// Daemon → client: chunk of the remote command's stderr.
    Stderr,
    /// Daemon → client: the remote command's wait status.
    ExitCode,
}

impl MsgType {
    /// Wire discriminant value.
    pub const fn to_u32(self) -> u32 {
        match self {
            Self::ExecCmdline => 0x100,
            Self::JustExec => 0x101,
            Self::ConnectExisting => 0x102,
            Self::Stdout => 0x10e,
            Self::Stderr => 0x10f,
            Self::ExitCode => 0x110,
        }
    }

    /// Parse wire discriminant; `None` for values not valid on this channel.
    pub const fn from_u32(v: u32) -> Option<Self> {
        match v {
            0x100 => Some(Self::ExecCmdline),
            0x101 => Some(Self::JustExec),
            0x102 => Some(Self::ConnectExisting),
            0x10e => Some(Self::Stdout),
            0x10f => Some(Self::Stderr),
            0x110 => Some(Self::ExitCode),
            _ => None,
        }
    }
}

impl fmt::Display for MsgType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::ExecCmdline => "EXEC_CMDLINE",
            Self::JustExec => "JUST_EXEC",
            Self::ConnectExisting => "CONNECT_EXISTING",
            Self::Stdout => "STDOUT",
            Self::Stderr => "STDERR",
            Self::ExitCode => "EXIT_CODE",
        };
        f.write_str(label)
    }
}

/// Frame header as it appears on the wire.
///
/// `msg_type` stays raw so unknown values can be reported verbatim.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    pub msg_type: u32,
    pub len: u32,
}

impl Header {
    pub const fn to_bytes(self) -> [u8; HEADER_LEN] {
        let t = self.msg_type.to_ne_bytes();
        let l = self.len.to_ne_bytes();
        [t[0], t[1], t[2], t[3], l[0], l[1], l[2], l[3]]
    }

    pub const fn from_bytes(buf: [u8; HEADER_LEN]) -> Self {
        Self {
            msg_type: u32::from_ne_bytes([buf[0], buf[1], buf[2], buf[3]]),
            len: u32::from_ne_bytes([buf[4], buf[5], buf[6], buf[7]]),
        }
    }

    /// Declared payload length, rejected if above [`MAX_DATA_CHUNK`].
    pub fn payload_len(&self) -> std::result::Result<usize, ProtocolError> {
        match usize::try_from(self.len) {
            Ok(len) if len <= MAX_DATA_CHUNK => Ok(len),
            _ => Err(ProtocolError::OversizedFrame {
                len: self.len,
                max: MAX_DATA_CHUNK,
            }),
        }
    }
}

/// A decoded daemon message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub msg_type: MsgType,
    pub payload: Vec<u8>,
}

impl Frame {
    /// Read the 4-byte status word carried by an `EXIT_CODE` frame.
    pub fn status_word(&self) -> std::result::Result<u32, ProtocolError> {
        let word: [u8; 4] = self
            .payload
            .get(..4)
            .and_then(|b| b.try_into().ok())
            .ok_or(ProtocolError::MalformedExitCode {
                len: self.payload.len(),
            })?;
        Ok(u32::from_ne_bytes(word))
    }
}

/// Encode one frame.
///
/// Payloads are never fragmented; anything above [`MAX_DATA_CHUNK`] is
/// refused.
pub fn encode(msg_type: MsgType, payload: &[u8]) -> std::result::Result<Vec<u8>, ProtocolError> {
    let len = match u32::try_from(payload.len()) {
        Ok(len) if payload.len() <= MAX_DATA_CHUNK => len,
        _ => {
            return Err(ProtocolError::OversizedFrame {
                len: u32::try_from(payload.len()).unwrap_or(u32::MAX),
                max: MAX_DATA_CHUNK,
            });
        }
    };
    let header = Header {
        msg_type: msg_type.to_u32(),
        len,
    };
    let mut buf = Vec::with_capacity(HEADER_LEN + payload.len());
    buf.extend_from_slice(&header.to_bytes());
    buf.extend_from_slice(payload);
    Ok(buf)
}

/// Payload of a session request: the command line plus a trailing NUL.
pub fn command_payload(command: &str) -> std::result::Result<Vec<u8>, ProtocolError> {
    if command.as_bytes().contains(&0) {
        return Err(ProtocolError::CommandContainsNul);
    }
    let len = command.len() + 1;
    if len > MAX_DATA_CHUNK {
        return Err(ProtocolError::CommandTooLong {
            len,
            max: MAX_DATA_CHUNK,
        });
    }
    let mut payload = Vec::with_capacity(len);
    payload.extend_from_slice(command.as_bytes());
    payload.push(0);
    Ok(payload)
}

/// Read exactly one header.
pub async fn read_header<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Header> {
    let mut buf = [0u8; HEADER_LEN];
    reader
        .read_exact(&mut buf)
        .await
        .map_err(Error::Connection)?;
    Ok(Header::from_bytes(buf))
}

/// Read the payload announced by `len`.
///
/// The length is validated before any byte is consumed.
pub async fn read_payload<R: AsyncRead + Unpin>(reader: &mut R, len: u32) -> Result<Vec<u8>> {
    let len = Header { msg_type: 0, len }.payload_len()?;
    let mut payload = vec![0u8; len];
    reader
        .read_exact(&mut payload)
        .await
        .map_err(Error::Connection)?;
    Ok(payload)
}

/// Read one complete frame.
pub async fn read_frame<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Frame> {
    let header = read_header(reader).await?;
    let payload = read_payload(reader, header.len).await?;
    let msg_type = MsgType::from_u32(header.msg_type)
        .ok_or(ProtocolError::UnknownMessageType(header.msg_type))?;
    Ok(Frame { msg_type, payload })
}
