//! Local end of the relay: either a spawned command or our own stdio.
//!
//! The adapter exposes two endpoints. The *input* endpoint is written with
//! data the daemon sends as the remote command's stdout. The *output*
//! endpoint is read and its bytes become the remote command's stdin.

use std::os::fd::{AsRawFd, FromRawFd, OwnedFd};
use std::path::PathBuf;
use std::process::Stdio;

use nix::errno::Errno;
use nix::sys::signal::{Signal, kill};
use nix::sys::wait::waitpid;
use nix::unistd::Pid;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::process::{Child, Command};
use tracing::{debug, info, trace, warn};

use qrexec_core::config::{DEFAULT_SHELL, REMOTE_DOMAIN_ENV};
use qrexec_core::{Error, Result};

/// Writable local endpoint (feeds the subordinate's stdin).
pub type LocalInput = Box<dyn AsyncWrite + Send + Unpin>;

/// Readable local endpoint (drains the subordinate's stdout).
pub type LocalOutput = Box<dyn AsyncRead + Send + Unpin>;

/// How much to wait for when the session tears down.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ReapPolicy {
    /// Wait for the spawned command only.
    #[default]
    OwnedChild,
    /// Wait for the spawned command, then for every remaining child of this
    /// process. Combined with [`become_subreaper`] this covers processes the
    /// command spawned recursively.
    AllDescendants,
}

/// Settings for spawning the local command.
#[derive(Debug, Clone)]
pub struct SpawnOptions {
    /// Interpreter run as `<shell> -c <command>`.
    pub shell: PathBuf,
    /// Domain announced to the command through `QREXEC_REMOTE_DOMAIN`.
    pub domain: String,
}

impl SpawnOptions {
    pub fn new(domain: impl Into<String>) -> Self {
        Self {
            shell: PathBuf::from(DEFAULT_SHELL),
            domain: domain.into(),
        }
    }

    pub fn with_shell(mut self, shell: impl Into<PathBuf>) -> Self {
        self.shell = shell.into();
        self
    }
}

/// The local process adapter.
pub struct LocalProcess {
    input: Option<LocalInput>,
    output: Option<LocalOutput>,
    child: Option<Child>,
}

impl std::fmt::Debug for LocalProcess {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalProcess")
            .field("input_open", &self.input.is_some())
            .field("output_open", &self.output.is_some())
            .field("child", &self.child_id())
            .finish()
    }
}

impl LocalProcess {
    /// Spawn `command` if given, otherwise alias our own stdio.
    pub fn attach(command: Option<&str>, options: &SpawnOptions) -> Result<Self> {
        match command {
            Some(command) => Self::spawn(command, options),
            None => Ok(Self::stdio()),
        }
    }

    /// Use the caller's stdout as the input endpoint and stdin as output.
    ///
    /// The adapter takes ownership of descriptors 0 and 1 so that closing an
    /// endpoint really closes the descriptor and downstream readers see EOF.
    /// Nothing else in the process may use stdin or stdout afterwards: once
    /// the endpoint is closed, `std::io::stdout()` and `println!` would write
    /// to a closed (or reused) descriptor. Diagnostics go to stderr only.
    pub fn stdio() -> Self {
        let stdin_fd = std::io::stdin().as_raw_fd();
        let stdout_fd = std::io::stdout().as_raw_fd();
        // SAFETY: descriptors 0 and 1 stay open for the life of the process
        // and this is the only place that takes ownership of them.
        #[allow(unsafe_code)]
        let (stdin_fd, stdout_fd) = unsafe {
            (
                OwnedFd::from_raw_fd(stdin_fd),
                OwnedFd::from_raw_fd(stdout_fd),
            )
        };
        let input = tokio::fs::File::from_std(std::fs::File::from(stdout_fd));
        let output = tokio::fs::File::from_std(std::fs::File::from(stdin_fd));
        debug!("Relaying own stdio");
        Self::from_endpoints(Box::new(input), Box::new(output))
    }

    /// Run `command` through the configured shell with piped stdin/stdout.
    ///
    /// Stderr is inherited.
    pub fn spawn(command: &str, options: &SpawnOptions) -> Result<Self> {
        let mut cmd = Command::new(&options.shell);
        cmd.arg("-c")
            .arg(command)
            .env(REMOTE_DOMAIN_ENV, &options.domain)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit());

        let spawn_err = |source: std::io::Error| Error::ChildSpawn {
            command: command.to_string(),
            source,
        };
        let mut child = cmd.spawn().map_err(&spawn_err)?;
        let stdin = child.stdin.take().ok_or_else(|| {
            spawn_err(std::io::Error::other("failed to capture stdin"))
        })?;
        let stdout = child.stdout.take().ok_or_else(|| {
            spawn_err(std::io::Error::other("failed to capture stdout"))
        })?;

        info!(
            pid = ?child.id(),
            shell = %options.shell.display(),
            command,
            "Spawned local command"
        );
        Ok(Self {
            input: Some(Box::new(stdin)),
            output: Some(Box::new(stdout)),
            child: Some(child),
        })
    }

    /// Build an adapter over arbitrary endpoints, owning no child.
    pub fn from_endpoints(input: LocalInput, output: LocalOutput) -> Self {
        Self {
            input: Some(input),
            output: Some(output),
            child: None,
        }
    }

    /// Hand both endpoints to the relays. Each can be taken only once.
    pub fn take_endpoints(&mut self) -> (Option<LocalInput>, Option<LocalOutput>) {
        (self.input.take(), self.output.take())
    }

    /// Process id of the spawned command, if any and still unreaped.
    pub fn child_id(&self) -> Option<u32> {
        self.child.as_ref().and_then(Child::id)
    }

    /// Ask the spawned command to stop with `SIGTERM`. No-op without a child.
    pub fn terminate(&self) {
        let Some(pid) = self.child_id().and_then(|pid| i32::try_from(pid).ok()) else {
            return;
        };
        match kill(Pid::from_raw(pid), Signal::SIGTERM) {
            Ok(()) => debug!(pid, "Sent SIGTERM to local command"),
            Err(e) => warn!(pid, error = %e, "Failed to signal local command"),
        }
    }

    /// Close any endpoints still held and wait for children per `policy`.
    pub async fn reap(&mut self, policy: ReapPolicy) {
        self.input = None;
        self.output = None;

        if let Some(mut child) = self.child.take() {
            match child.wait().await {
                Ok(status) => debug!(?status, "Local command exited"),
                Err(e) => warn!(error = %e, "Failed to wait for local command"),
            }
        }

        if policy == ReapPolicy::AllDescendants {
            match tokio::task::spawn_blocking(reap_remaining_children).await {
                Ok(0) => {}
                Ok(n) => debug!(count = n, "Reaped descendants"),
                Err(e) => warn!(error = %e, "Descendant reaper task failed"),
            }
        }
    }
}

/// Block until this process has no children left.
fn reap_remaining_children() -> usize {
    let mut reaped = 0;
    loop {
        match waitpid(Option::<Pid>::None, None) {
            Ok(status) => {
                trace!(?status, "Reaped child");
                reaped += 1;
            }
            Err(Errno::EINTR) => {}
            Err(Errno::ECHILD) => return reaped,
            Err(e) => {
                warn!(error = %e, "waitpid failed");
                return reaped;
            }
        }
    }
}

/// Become the reaper for orphaned descendants.
///
/// Processes the local command leaves behind are re-parented to us instead
/// of init, so [`ReapPolicy::AllDescendants`] waits for them too.
#[cfg(target_os = "linux")]
pub fn become_subreaper() -> Result<()> {
    nix::sys::prctl::set_child_subreaper(true)
        .map_err(|e| Error::LocalIo(std::io::Error::from(e)))
}

#[cfg(test)]
#[allow(clippy::panic, clippy::expect_used, clippy::unwrap_used)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    fn sh_options() -> SpawnOptions {
        SpawnOptions::new("test-vm").with_shell("/bin/sh")
    }

    #[tokio::test]
    async fn spawned_command_sees_remote_domain() {
        let mut local =
            LocalProcess::attach(Some("printf %s \"$QREXEC_REMOTE_DOMAIN\""), &sh_options())
                .unwrap();
        assert!(local.child_id().is_some());

        let (_input, output) = local.take_endpoints();
        let mut out = String::new();
        output.unwrap().read_to_string(&mut out).await.unwrap();
        assert_eq!(out, "test-vm");

        local.reap(ReapPolicy::OwnedChild).await;
        assert!(local.child_id().is_none());
    }

    #[tokio::test]
    async fn spawned_command_pipes_both_directions() {
        let mut local = LocalProcess::spawn("tr a-z A-Z", &sh_options()).unwrap();
        let (input, output) = local.take_endpoints();

        let mut input = input.unwrap();
        input.write_all(b"hello\n").await.unwrap();
        input.shutdown().await.unwrap();
        drop(input);

        let mut out = Vec::new();
        output.unwrap().read_to_end(&mut out).await.unwrap();
        assert_eq!(out, b"HELLO\n");
        local.reap(ReapPolicy::OwnedChild).await;
    }

    #[tokio::test]
    async fn missing_shell_is_spawn_error() {
        let options = SpawnOptions::new("test-vm").with_shell("/nonexistent/shell");
        let err = LocalProcess::spawn("true", &options).unwrap_err();
        assert!(matches!(err, Error::ChildSpawn { ref command, .. } if command == "true"));
    }

    #[tokio::test]
    async fn reap_without_child_returns() {
        let (a, _b) = tokio::io::duplex(16);
        let mut local = LocalProcess::from_endpoints(Box::new(a), Box::new(tokio::io::empty()));
        local.reap(ReapPolicy::OwnedChild).await;
        let (input, output) = local.take_endpoints();
        assert!(input.is_none() && output.is_none());
    }

    #[tokio::test]
    async fn terminate_stops_command_that_ignores_input() {
        let mut local = LocalProcess::spawn("exec sleep 30", &sh_options()).unwrap();
        assert!(local.child_id().is_some());
        local.terminate();
        tokio::time::timeout(
            std::time::Duration::from_secs(5),
            local.reap(ReapPolicy::OwnedChild),
        )
        .await
        .unwrap();
        assert!(local.child_id().is_none());
    }

    #[test]
    fn terminate_without_child_is_noop() {
        let local = LocalProcess::from_endpoints(
            Box::new(tokio::io::sink()),
            Box::new(tokio::io::empty()),
        );
        local.terminate();
    }
}
