//! Terminal escape filtering for relayed output.

use qrexec_core::MsgType;

/// The byte that starts terminal control sequences.
pub const ESC: u8 = 0x1b;

/// Inert byte written in place of [`ESC`].
pub const ESC_SUBSTITUTE: u8 = b'_';

/// Which daemon streams get escape bytes replaced.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct EscapeFilter {
    pub stdout: bool,
    pub stderr: bool,
}

impl EscapeFilter {
    pub const fn new(stdout: bool, stderr: bool) -> Self {
        Self { stdout, stderr }
    }

    /// Filter `buf` in place if the stream it came from is enabled.
    pub fn apply(self, stream: MsgType, buf: &mut [u8]) {
        let enabled = match stream {
            MsgType::Stdout => self.stdout,
            MsgType::Stderr => self.stderr,
            _ => false,
        };
        if enabled {
            replace_escapes(buf);
        }
    }
}

pub fn replace_escapes(buf: &mut [u8]) {
    for b in buf.iter_mut().filter(|b| **b == ESC) {
        *b = ESC_SUBSTITUTE;
    }
}
