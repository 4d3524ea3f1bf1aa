//! qrexec client
//!
//! Asks the qrexec daemon of a domain to run a command and relays that
//! command's stdio to a local program, or to our own stdio.

use std::path::PathBuf;

use clap::Parser;
use tokio::signal::unix::{SignalKind, signal};
use tracing::{info, warn};

use qrexec_client::local::{LocalProcess, ReapPolicy, SpawnOptions};
use qrexec_client::relay::EscapeFilter;
use qrexec_client::{BrokerConnection, ExecMode, Session, SessionOptions, SessionRequest};
use qrexec_core::config::{Config, load_config};
use qrexec_core::exit::EXIT_FAILURE;
use qrexec_core::tracing_init::init_tracing;

#[derive(Parser, Debug)]
#[command(name = "qrexec-client")]
#[command(version, about = "Run a command in another domain through its qrexec daemon")]
struct Cli {
    /// Domain whose daemon receives the request
    #[arg(short = 'd', long)]
    domain: String,

    /// Local command (run with `<shell> -c`) wired to the remote command;
    /// our own stdio is used when omitted
    #[arg(short = 'l', long)]
    local: Option<String>,

    /// Start the remote command and exit without relaying any data
    #[arg(short = 'e', long)]
    just_exec: bool,

    /// Attach to an already running remote command
    #[arg(short = 'c', long)]
    connect_existing: bool,

    /// Replace terminal escape bytes in remote stdout
    #[arg(short = 't', long)]
    filter_stdout: bool,

    /// Replace terminal escape bytes in remote stderr
    #[arg(short = 'T', long)]
    filter_stderr: bool,

    /// Directory holding the per-domain daemon sockets
    #[arg(long)]
    socket_dir: Option<PathBuf>,

    /// Shell used to run the local command
    #[arg(long)]
    shell: Option<PathBuf>,

    /// Log level filter (e.g. "warn", "debug")
    #[arg(long)]
    log_level: Option<String>,

    /// Output logs as JSON
    #[arg(long)]
    log_json: bool,

    /// Command line handed to the daemon
    remote_cmdline: String,
}

impl Cli {
    const fn mode(&self) -> ExecMode {
        if self.just_exec {
            ExecMode::JustExec
        } else if self.connect_existing {
            ExecMode::ConnectExisting
        } else {
            ExecMode::Exec
        }
    }

    fn apply_overrides(&self, config: &mut Config) {
        if let Some(dir) = &self.socket_dir {
            config.socket_dir.clone_from(dir);
        }
        if let Some(shell) = &self.shell {
            config.shell.clone_from(shell);
        }
        if let Some(level) = &self.log_level {
            config.log_level.clone_from(level);
        }
        if self.log_json {
            config.log_json = true;
        }
    }
}

#[tokio::main]
#[allow(clippy::print_stderr)]
async fn main() {
    let cli = Cli::parse();

    let code = match run(cli).await {
        Ok(code) => code,
        Err(e) => {
            eprintln!("qrexec-client: {e}");
            EXIT_FAILURE
        }
    };

    // A local read may still be parked on a blocking thread; don't wait for it.
    std::process::exit(code);
}

async fn run(cli: Cli) -> anyhow::Result<i32> {
    let mut config = load_config()?;
    cli.apply_overrides(&mut config);

    let level = &config.log_level;
    init_tracing(
        &format!("qrexec_client={level},qrexec_core={level}"),
        config.log_json,
    );

    let socket = config.socket_path(&cli.domain);
    info!(
        version = env!("CARGO_PKG_VERSION"),
        domain = %cli.domain,
        socket = %socket.display(),
        mode = ?cli.mode(),
        "Starting qrexec-client"
    );

    // Registered before any child exists so a signal never kills us unreaped.
    let mut sigint = signal(SignalKind::interrupt())?;
    let mut sigterm = signal(SignalKind::terminate())?;

    let conn = BrokerConnection::connect(&socket).await?;

    #[cfg(target_os = "linux")]
    if let Err(e) = qrexec_client::local::become_subreaper() {
        warn!(error = %e, "Could not become child subreaper");
    }

    let spawn = SpawnOptions::new(cli.domain.clone()).with_shell(config.shell.clone());
    let local = LocalProcess::attach(cli.local.as_deref(), &spawn)?;

    let options = SessionOptions {
        filter: EscapeFilter::new(cli.filter_stdout, cli.filter_stderr),
        reap: ReapPolicy::AllDescendants,
    };
    let request = SessionRequest::new(cli.mode(), cli.remote_cmdline);
    let session = Session::new(conn, local, options);

    let ctx = session.context();
    tokio::spawn(async move {
        tokio::select! {
            _ = sigint.recv() => info!("Received SIGINT, ending session"),
            _ = sigterm.recv() => info!("Received SIGTERM, ending session"),
        }
        ctx.cancel();
    });

    let outcome = session.run(request).await?;
    Ok(outcome.exit_code())
}
