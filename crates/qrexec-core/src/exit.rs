//! Exit codes and translation of remote wait statuses.

use nix::sys::wait::WaitStatus;
use nix::unistd::Pid;

/// Exit code for session-level fatal errors.
pub const EXIT_FAILURE: i32 = 1;

/// Exit code when the remote command did not terminate normally.
pub const EXIT_ABNORMAL: i32 = 255;

/// Translate a `waitpid(2)` status word into the exit code to propagate.
///
/// A normal exit yields its exit status; a signal, stop, or any word that
/// does not decode yields [`EXIT_ABNORMAL`].
pub fn translate_status(word: u32) -> i32 {
    let raw = i32::from_ne_bytes(word.to_ne_bytes());
    match WaitStatus::from_raw(Pid::from_raw(0), raw) {
        Ok(WaitStatus::Exited(_, code)) => code,
        _ => EXIT_ABNORMAL,
    }
}

#[cfg(test)]
#[allow(clippy::panic, clippy::expect_used, clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn normal_exit_propagates_status() {
        assert_eq!(translate_status(0), 0);
        assert_eq!(translate_status(3 << 8), 3);
        assert_eq!(translate_status(255 << 8), 255);
    }

    #[test]
    fn killed_by_signal_is_abnormal() {
        // SIGKILL, no core dump
        assert_eq!(translate_status(9), EXIT_ABNORMAL);
        // SIGSEGV with core dump flag
        assert_eq!(translate_status(11 | 0x80), EXIT_ABNORMAL);
    }

    #[test]
    fn stopped_is_abnormal() {
        // WIFSTOPPED: low byte 0x7f, signal in the next byte (SIGSTOP = 19 on Linux)
        assert_eq!(translate_status((19 << 8) | 0x7f), EXIT_ABNORMAL);
    }
}
