//! Daemon → local, framed and demultiplexed.
//!
//! `STDOUT` frames feed the local input endpoint, `STDERR` frames go to our
//! error stream, and `EXIT_CODE` ends the session.

use std::sync::Arc;

use tokio::io::AsyncWriteExt;
use tracing::{debug, trace};

use qrexec_core::exit::translate_status;
use qrexec_core::{Error, Frame, MsgType, ProtocolError, Result};

use crate::connection::FrameReader;
use crate::local::LocalInput;
use crate::relay::escape::EscapeFilter;
use crate::relay::state::{Direction, DirectionState, SessionContext};
use crate::session::SessionOutcome;

pub struct InboundRelay {
    source: FrameReader,
    sink: Option<LocalInput>,
    errors: LocalInput,
    filter: EscapeFilter,
    ctx: Arc<SessionContext>,
}

impl InboundRelay {
    pub fn new(
        source: FrameReader,
        sink: Option<LocalInput>,
        errors: LocalInput,
        filter: EscapeFilter,
        ctx: Arc<SessionContext>,
    ) -> Self {
        if sink.is_none() {
            ctx.advance(Direction::Inbound, DirectionState::Gone);
        }
        Self {
            source,
            sink,
            errors,
            filter,
            ctx,
        }
    }

    /// Relay frames until `EXIT_CODE` or a fatal error.
    pub async fn run(mut self) -> Result<SessionOutcome> {
        loop {
            let frame = self.source.read_frame().await?;
            trace!(msg_type = %frame.msg_type, len = frame.payload.len(), "Frame from daemon");
            if let Some(outcome) = self.dispatch(frame).await? {
                return Ok(outcome);
            }
        }
    }

    async fn dispatch(&mut self, frame: Frame) -> Result<Option<SessionOutcome>> {
        match frame.msg_type {
            MsgType::Stdout => {
                self.on_stdout(frame.payload).await?;
                Ok(None)
            }
            MsgType::Stderr => {
                self.on_stderr(frame.payload).await;
                Ok(None)
            }
            MsgType::ExitCode => {
                let status = frame.status_word()?;
                let code = translate_status(status);
                debug!(status, code, "Remote command finished");
                Ok(Some(SessionOutcome::RemoteExit(code)))
            }
            other => Err(ProtocolError::UnexpectedMessage(other).into()),
        }
    }

    async fn on_stdout(&mut self, mut payload: Vec<u8>) -> Result<()> {
        let Some(sink) = self.sink.as_mut() else {
            trace!(len = payload.len(), "Local input closed, dropping stdout");
            return Ok(());
        };
        if payload.is_empty() {
            debug!("Remote stdout reached EOF");
            self.close_input().await;
            return Ok(());
        }
        self.filter.apply(MsgType::Stdout, &mut payload);
        let written = match sink.write_all(&payload).await {
            Ok(()) => sink.flush().await,
            Err(e) => Err(e),
        };
        match written {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::BrokenPipe => {
                debug!("Local input closed by reader");
                self.close_input().await;
                Ok(())
            }
            Err(e) => Err(Error::LocalIo(e)),
        }
    }

    /// Best effort; a failing error stream never ends the session.
    async fn on_stderr(&mut self, mut payload: Vec<u8>) {
        if payload.is_empty() {
            return;
        }
        self.filter.apply(MsgType::Stderr, &mut payload);
        let written = match self.errors.write_all(&payload).await {
            Ok(()) => self.errors.flush().await,
            Err(e) => Err(e),
        };
        if let Err(e) = written {
            debug!(error = %e, "Failed to write remote stderr");
        }
    }

    async fn close_input(&mut self) {
        if let Some(mut sink) = self.sink.take() {
            if let Err(e) = sink.shutdown().await {
                trace!(error = %e, "Shutdown of local input failed");
            }
        }
        self.ctx.advance(Direction::Inbound, DirectionState::Gone);
    }
}

#[cfg(test)]
#[allow(clippy::panic, clippy::expect_used, clippy::unwrap_used)]
mod tests {
    use super::*;
    use qrexec_core::protocol::{Header, encode};
    use tokio::io::{AsyncReadExt, DuplexStream};
    use tokio::net::UnixStream;

    use crate::connection::BrokerConnection;

    struct Harness {
        daemon: UnixStream,
        local_in: DuplexStream,
        errors: DuplexStream,
        ctx: Arc<SessionContext>,
        relay: InboundRelay,
    }

    fn harness(filter: EscapeFilter) -> Harness {
        let (client, daemon) = UnixStream::pair().unwrap();
        let (reader, _writer) = BrokerConnection::from_stream(client).into_split();
        let (sink, local_in) = tokio::io::duplex(64 * 1024);
        let (err_sink, errors) = tokio::io::duplex(64 * 1024);
        let ctx = Arc::new(SessionContext::new());
        let relay = InboundRelay::new(
            reader,
            Some(Box::new(sink)),
            Box::new(err_sink),
            filter,
            Arc::clone(&ctx),
        );
        Harness {
            daemon,
            local_in,
            errors,
            ctx,
            relay,
        }
    }

    impl Harness {
        async fn send(&mut self, msg_type: MsgType, payload: &[u8]) {
            self.daemon
                .write_all(&encode(msg_type, payload).unwrap())
                .await
                .unwrap();
        }
    }

    #[tokio::test]
    async fn exit_code_ends_relay() {
        let mut h = harness(EscapeFilter::default());
        h.send(MsgType::Stdout, b"out").await;
        h.send(MsgType::ExitCode, &(42_u32 << 8).to_ne_bytes()).await;
        let outcome = h.relay.run().await.unwrap();
        assert_eq!(outcome, SessionOutcome::RemoteExit(42));

        let mut got = Vec::new();
        h.local_in.read_to_end(&mut got).await.unwrap();
        assert_eq!(got, b"out");
    }

    #[tokio::test]
    async fn empty_stdout_closes_input_once() {
        let mut h = harness(EscapeFilter::default());
        h.send(MsgType::Stdout, b"a").await;
        h.send(MsgType::Stdout, b"").await;
        h.send(MsgType::Stdout, b"late").await;
        h.send(MsgType::Stdout, b"").await;
        h.send(MsgType::ExitCode, &0_u32.to_ne_bytes()).await;

        let ctx = Arc::clone(&h.ctx);
        assert_eq!(h.relay.run().await.unwrap(), SessionOutcome::RemoteExit(0));
        assert_eq!(ctx.state(Direction::Inbound), DirectionState::Gone);

        let mut got = Vec::new();
        h.local_in.read_to_end(&mut got).await.unwrap();
        assert_eq!(got, b"a");
    }

    #[tokio::test]
    async fn stderr_is_filtered_independently() {
        let mut h = harness(EscapeFilter::new(false, true));
        h.send(MsgType::Stdout, b"\x1b[1m").await;
        h.send(MsgType::Stderr, b"warn\x1b\n").await;
        h.send(MsgType::ExitCode, &0_u32.to_ne_bytes()).await;
        h.relay.run().await.unwrap();

        let mut out = Vec::new();
        h.local_in.read_to_end(&mut out).await.unwrap();
        assert_eq!(out, b"\x1b[1m");
        let mut err = Vec::new();
        h.errors.read_to_end(&mut err).await.unwrap();
        assert_eq!(err, b"warn_\n");
    }

    #[tokio::test]
    async fn closed_error_stream_is_not_fatal() {
        let Harness {
            mut daemon,
            errors,
            relay,
            ..
        } = harness(EscapeFilter::default());
        drop(errors);
        for frame in [
            encode(MsgType::Stderr, b"nobody listens").unwrap(),
            encode(MsgType::ExitCode, &(1_u32 << 8).to_ne_bytes()).unwrap(),
        ] {
            daemon.write_all(&frame).await.unwrap();
        }
        assert_eq!(relay.run().await.unwrap(), SessionOutcome::RemoteExit(1));
    }

    #[tokio::test]
    async fn request_type_from_daemon_is_protocol_error() {
        let mut h = harness(EscapeFilter::default());
        h.send(MsgType::ExecCmdline, b"x\0").await;
        let err = h.relay.run().await.unwrap_err();
        assert!(matches!(
            err,
            Error::Protocol(ProtocolError::UnexpectedMessage(MsgType::ExecCmdline))
        ));
    }

    #[tokio::test]
    async fn short_exit_code_is_protocol_error() {
        let mut h = harness(EscapeFilter::default());
        h.send(MsgType::ExitCode, &[0, 0]).await;
        assert!(matches!(
            h.relay.run().await,
            Err(Error::Protocol(ProtocolError::MalformedExitCode { len: 2 }))
        ));
    }

    #[tokio::test]
    async fn daemon_hangup_is_connection_error() {
        let h = harness(EscapeFilter::default());
        let header = Header {
            msg_type: MsgType::Stdout.to_u32(),
            len: 10,
        };
        let Harness {
            mut daemon, relay, ..
        } = h;
        daemon.write_all(&header.to_bytes()).await.unwrap();
        drop(daemon);
        assert!(matches!(relay.run().await, Err(Error::Connection(_))));
    }

    #[tokio::test]
    async fn closed_local_reader_is_not_fatal() {
        let Harness {
            mut daemon,
            local_in,
            ctx,
            relay,
            ..
        } = harness(EscapeFilter::default());
        drop(local_in);
        for frame in [
            encode(MsgType::Stdout, b"data").unwrap(),
            encode(MsgType::Stdout, b"more").unwrap(),
            encode(MsgType::ExitCode, &(5_u32 << 8).to_ne_bytes()).unwrap(),
        ] {
            daemon.write_all(&frame).await.unwrap();
        }

        assert_eq!(relay.run().await.unwrap(), SessionOutcome::RemoteExit(5));
        assert_eq!(ctx.state(Direction::Inbound), DirectionState::Gone);
    }
}
