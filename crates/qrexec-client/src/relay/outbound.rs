//! Local output → daemon, unframed.
//!
//! Only one stream ever travels this way, so bytes go out exactly as read.

use std::sync::Arc;

use tokio::io::AsyncReadExt;
use tracing::{debug, trace, warn};

use qrexec_core::{Error, MAX_DATA_CHUNK, Result};

use crate::connection::RawWriter;
use crate::local::LocalOutput;
use crate::relay::state::{Direction, DirectionState, SessionContext};
use crate::session::SessionOutcome;

/// How the outbound relay stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutboundEnd {
    /// This direction is finished; the session carries on inbound.
    Detached,
    /// The session was terminated elsewhere.
    Cancelled,
    /// This relay decided the session is over.
    Terminate(SessionOutcome),
}

pub struct OutboundRelay {
    source: Option<LocalOutput>,
    sink: RawWriter,
    ctx: Arc<SessionContext>,
}

impl OutboundRelay {
    pub fn new(source: Option<LocalOutput>, sink: RawWriter, ctx: Arc<SessionContext>) -> Self {
        Self { source, sink, ctx }
    }

    /// Pump until EOF, a dead peer, a fatal error, or cancellation.
    pub async fn run(mut self) -> Result<OutboundEnd> {
        let cancel = self.ctx.cancel_token().clone();
        let mut buf = vec![0u8; MAX_DATA_CHUNK];
        loop {
            let Some(source) = self.source.as_mut() else {
                return Ok(OutboundEnd::Detached);
            };
            let n = tokio::select! {
                biased;
                () = cancel.cancelled() => return Ok(OutboundEnd::Cancelled),
                read = source.read(&mut buf) => read.map_err(Error::LocalIo)?,
            };
            if n == 0 {
                return Ok(self.on_eof().await);
            }
            let written = tokio::select! {
                biased;
                () = cancel.cancelled() => return Ok(OutboundEnd::Cancelled),
                written = self.sink.write_chunk(&buf[..n]) => written,
            };
            match written {
                Ok(()) => trace!(bytes = n, "Forwarded local output"),
                Err(Error::BrokenPeer) => return Ok(self.on_broken_peer()),
                Err(e) => return Err(e),
            }
        }
    }

    async fn on_eof(&mut self) -> OutboundEnd {
        self.source = None;
        self.ctx.advance(Direction::Outbound, DirectionState::HalfClosed);
        if let Err(e) = self.sink.half_close_write().await {
            debug!(error = %e, "Half-close of daemon connection failed");
        }
        if self.ctx.state(Direction::Inbound).is_terminal() {
            debug!("Local output and input both closed");
            OutboundEnd::Terminate(SessionOutcome::StreamsClosed)
        } else {
            OutboundEnd::Detached
        }
    }

    /// The daemon stopped reading; nothing we read can be delivered.
    fn on_broken_peer(&mut self) -> OutboundEnd {
        self.source = None;
        let prev = self.ctx.advance(Direction::Outbound, DirectionState::Gone);
        if prev == DirectionState::Gone {
            return OutboundEnd::Detached;
        }
        if self.ctx.state(Direction::Inbound).is_terminal() {
            warn!("Daemon closed the connection before sending an exit code");
            OutboundEnd::Terminate(SessionOutcome::PeerLost)
        } else {
            debug!("Daemon stopped reading; still relaying its output");
            OutboundEnd::Detached
        }
    }
}
