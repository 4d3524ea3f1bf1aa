//! Session controller.
//!
//! Drives one session through `HANDSHAKE → STREAMING → DRAINING →
//! TERMINATED`: sends the request, runs both relays until one of them
//! ends the session, then releases every endpoint and reaps.

use std::fmt;
use std::sync::Arc;

use tracing::{debug, info, warn};

use qrexec_core::exit::EXIT_FAILURE;
use qrexec_core::{Error, MsgType, Result};

use crate::connection::BrokerConnection;
use crate::local::{LocalInput, LocalProcess, ReapPolicy};
use crate::relay::{EscapeFilter, InboundRelay, OutboundEnd, OutboundRelay, SessionContext};

/// What the daemon is asked to do.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ExecMode {
    /// Start the command and stream its stdio.
    #[default]
    Exec,
    /// Start the command and return immediately.
    JustExec,
    /// Attach to a command that is already running.
    ConnectExisting,
}

impl ExecMode {
    pub const fn msg_type(self) -> MsgType {
        match self {
            Self::Exec => MsgType::ExecCmdline,
            Self::JustExec => MsgType::JustExec,
            Self::ConnectExisting => MsgType::ConnectExisting,
        }
    }
}

/// The single request that opens a session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionRequest {
    pub mode: ExecMode,
    pub command: String,
}

impl SessionRequest {
    pub fn new(mode: ExecMode, command: impl Into<String>) -> Self {
        Self {
            mode,
            command: command.into(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionPhase {
    Handshake,
    Streaming,
    Draining,
    Terminated,
}

impl fmt::Display for SessionPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::Handshake => "HANDSHAKE",
            Self::Streaming => "STREAMING",
            Self::Draining => "DRAINING",
            Self::Terminated => "TERMINATED",
        };
        f.write_str(label)
    }
}

/// How a session ended without a fatal error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionOutcome {
    /// The daemon reported the remote command's status, already translated.
    RemoteExit(i32),
    /// Both local streams closed before any exit status arrived.
    StreamsClosed,
    /// The daemon stopped reading after our input had closed, so the exit
    /// status can no longer be learned.
    PeerLost,
    /// A fire-and-forget request was delivered.
    Dispatched,
    /// The session was cancelled from outside, e.g. on a signal.
    Interrupted,
}

impl SessionOutcome {
    pub const fn exit_code(self) -> i32 {
        match self {
            Self::RemoteExit(code) => code,
            Self::StreamsClosed | Self::Dispatched => 0,
            Self::PeerLost | Self::Interrupted => EXIT_FAILURE,
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SessionOptions {
    pub filter: EscapeFilter,
    pub reap: ReapPolicy,
}

pub struct Session {
    conn: BrokerConnection,
    local: LocalProcess,
    errors: LocalInput,
    options: SessionOptions,
    ctx: Arc<SessionContext>,
}

impl Session {
    /// Remote stderr goes to our own stderr unless overridden.
    pub fn new(conn: BrokerConnection, local: LocalProcess, options: SessionOptions) -> Self {
        Self {
            conn,
            local,
            errors: Box::new(tokio::io::stderr()),
            options,
            ctx: Arc::new(SessionContext::new()),
        }
    }

    #[must_use]
    pub fn with_error_stream(mut self, errors: LocalInput) -> Self {
        self.errors = errors;
        self
    }

    /// Shared half-close state, for observing a running session.
    ///
    /// Cancelling it while the session streams ends the session with
    /// [`SessionOutcome::Interrupted`].
    pub fn context(&self) -> Arc<SessionContext> {
        Arc::clone(&self.ctx)
    }

    /// Run the session to completion.
    ///
    /// Endpoints are closed and children reaped on every path, including
    /// fatal errors.
    pub async fn run(self, request: SessionRequest) -> Result<SessionOutcome> {
        let Self {
            mut conn,
            mut local,
            errors,
            options,
            ctx,
        } = self;
        let mut phase = SessionPhase::Handshake;

        let handshake = conn
            .send_command(request.mode.msg_type(), &request.command)
            .await;
        let result = match handshake {
            Err(e) => {
                warn!(error = %e, "Failed to send session request");
                Err(e)
            }
            Ok(()) if request.mode == ExecMode::JustExec => Ok(SessionOutcome::Dispatched),
            Ok(()) => {
                enter(&mut phase, SessionPhase::Streaming);
                stream(conn, &mut local, errors, options.filter, &ctx).await
            }
        };

        enter(&mut phase, SessionPhase::Draining);
        ctx.cancel();
        if matches!(result, Ok(SessionOutcome::Interrupted)) {
            local.terminate();
        }
        local.reap(options.reap).await;
        enter(&mut phase, SessionPhase::Terminated);

        match &result {
            Ok(outcome) => info!(?outcome, code = outcome.exit_code(), "Session finished"),
            Err(e) => debug!(error = %e, "Session aborted"),
        }
        result
    }
}

fn enter(phase: &mut SessionPhase, next: SessionPhase) {
    debug!(from = %phase, to = %next, "Session phase");
    *phase = next;
}

/// Run both relays until one of them ends the session.
///
/// Everything the relays own is dropped, and so closed, before this returns.
async fn stream(
    conn: BrokerConnection,
    local: &mut LocalProcess,
    errors: LocalInput,
    filter: EscapeFilter,
    ctx: &Arc<SessionContext>,
) -> Result<SessionOutcome> {
    let (input, output) = local.take_endpoints();
    let (reader, writer) = conn.into_split();
    let outbound = OutboundRelay::new(output, writer, Arc::clone(ctx));
    let inbound = InboundRelay::new(reader, input, errors, filter, Arc::clone(ctx));

    let mut outbound_task = tokio::spawn(outbound.run());
    let mut outbound_running = true;
    let inbound_run = inbound.run();
    tokio::pin!(inbound_run);

    let result = loop {
        tokio::select! {
            biased;
            res = &mut inbound_run => break res,
            () = ctx.cancel_token().cancelled() => {
                debug!("Session cancelled");
                break Ok(SessionOutcome::Interrupted);
            }
            joined = &mut outbound_task, if outbound_running => {
                outbound_running = false;
                match joined {
                    Ok(Ok(OutboundEnd::Terminate(outcome))) => break Ok(outcome),
                    Ok(Ok(end)) => debug!(?end, "Outbound relay finished"),
                    Ok(Err(e)) => break Err(e),
                    Err(e) => break Err(Error::LocalIo(std::io::Error::other(e))),
                }
            }
        }
    };

    ctx.cancel();
    if outbound_running {
        if let Err(e) = outbound_task.await {
            warn!(error = %e, "Outbound relay task failed");
        }
    }
    result
}
