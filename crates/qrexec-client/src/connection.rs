//! Connection to the per-domain qrexec daemon socket.
//!
//! One `AF_UNIX` stream carries the whole session. The client writes one
//! framed request followed by raw bytes, and reads frames until the
//! session ends. The two directions close independently.

use std::path::Path;

use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::net::UnixStream;
use tokio::net::unix::OwnedReadHalf;
use tracing::{debug, info};

use qrexec_core::protocol::{self, Frame, MsgType};
use qrexec_core::{Error, Result};

/// An established daemon connection, before the relays split it.
#[derive(Debug)]
pub struct BrokerConnection {
    stream: UnixStream,
}

impl BrokerConnection {
    /// Connect to the daemon socket at `path`.
    ///
    /// A missing or refusing endpoint is fatal; there is no retry.
    pub async fn connect(path: &Path) -> Result<Self> {
        let stream = UnixStream::connect(path)
            .await
            .map_err(|source| Error::Connect {
                path: path.to_path_buf(),
                source,
            })?;
        info!(path = %path.display(), "Connected to qrexec daemon");
        Ok(Self { stream })
    }

    /// Wrap an already connected stream.
    pub const fn from_stream(stream: UnixStream) -> Self {
        Self { stream }
    }

    /// Write one complete frame.
    pub async fn send_frame(&mut self, msg_type: MsgType, payload: &[u8]) -> Result<()> {
        let buf = protocol::encode(msg_type, payload)?;
        self.stream.write_all(&buf).await.map_err(Error::from_write)
    }

    /// Write the session request: a NUL-terminated command line.
    ///
    /// An invalid command is refused before anything is written.
    pub async fn send_command(&mut self, msg_type: MsgType, command: &str) -> Result<()> {
        let payload = protocol::command_payload(command)?;
        self.send_frame(msg_type, &payload).await?;
        debug!(%msg_type, command, "Sent session request");
        Ok(())
    }

    /// Split into the inbound (framed) and outbound (raw) halves.
    pub fn into_split(self) -> (FrameReader, RawWriter) {
        let (read, write) = self.stream.into_split();
        (FrameReader { inner: read }, RawWriter::new(write))
    }
}

/// Inbound half: decodes frames sent by the daemon.
#[derive(Debug)]
pub struct FrameReader {
    inner: OwnedReadHalf,
}

impl FrameReader {
    pub async fn read_frame(&mut self) -> Result<Frame> {
        protocol::read_frame(&mut self.inner).await
    }
}

/// Outbound half: forwards raw bytes to the daemon.
pub struct RawWriter {
    inner: Box<dyn AsyncWrite + Send + Unpin>,
}

impl std::fmt::Debug for RawWriter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RawWriter").finish_non_exhaustive()
    }
}

impl RawWriter {
    pub fn new(inner: impl AsyncWrite + Send + Unpin + 'static) -> Self {
        Self {
            inner: Box::new(inner),
        }
    }

    /// Write `data` unframed. A peer that stopped reading yields
    /// [`Error::BrokenPeer`].
    pub async fn write_chunk(&mut self, data: &[u8]) -> Result<()> {
        self.inner.write_all(data).await.map_err(Error::from_write)
    }

    /// Shut down the write direction only; reads are unaffected.
    pub async fn half_close_write(&mut self) -> Result<()> {
        self.inner.shutdown().await.map_err(Error::from_write)
    }
}
