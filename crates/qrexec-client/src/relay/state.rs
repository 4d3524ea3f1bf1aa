//! Per-session half-close bookkeeping shared by the two relays.

use std::sync::atomic::{AtomicU8, Ordering};

use tokio_util::sync::CancellationToken;
use tracing::debug;

/// One data direction of the session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Local output → daemon (raw).
    Outbound,
    /// Daemon → local input (framed).
    Inbound,
}

/// Lifecycle of one direction. States only ever move forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum DirectionState {
    Open = 0,
    /// Our endpoint for this direction is closed.
    HalfClosed = 1,
    /// The peer will not take or send more data this direction.
    Gone = 2,
}

impl DirectionState {
    const fn from_u8(v: u8) -> Self {
        match v {
            0 => Self::Open,
            1 => Self::HalfClosed,
            _ => Self::Gone,
        }
    }

    /// No more data will flow this direction.
    pub const fn is_terminal(self) -> bool {
        !matches!(self, Self::Open)
    }
}

/// Shared state of one session.
///
/// Each relay only advances its own direction and only reads the other.
#[derive(Debug, Default)]
pub struct SessionContext {
    outbound: AtomicU8,
    inbound: AtomicU8,
    cancel: CancellationToken,
}

impl SessionContext {
    pub fn new() -> Self {
        Self::default()
    }

    fn slot(&self, direction: Direction) -> &AtomicU8 {
        match direction {
            Direction::Outbound => &self.outbound,
            Direction::Inbound => &self.inbound,
        }
    }

    pub fn state(&self, direction: Direction) -> DirectionState {
        DirectionState::from_u8(self.slot(direction).load(Ordering::SeqCst))
    }

    /// Move `direction` to `to` unless it is already further along.
    /// Returns the previous state.
    pub fn advance(&self, direction: Direction, to: DirectionState) -> DirectionState {
        let prev = DirectionState::from_u8(self.slot(direction).fetch_max(to as u8, Ordering::SeqCst));
        if prev < to {
            debug!(?direction, from = ?prev, ?to, "Direction state changed");
        }
        prev
    }

    /// Token fired once the session has decided to terminate.
    pub const fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }
}

#[cfg(test)]
#[allow(clippy::panic, clippy::expect_used, clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn directions_start_open() {
        let ctx = SessionContext::new();
        assert_eq!(ctx.state(Direction::Outbound), DirectionState::Open);
        assert_eq!(ctx.state(Direction::Inbound), DirectionState::Open);
        assert!(!ctx.cancel_token().is_cancelled());
    }

    #[test]
    fn states_never_move_backwards() {
        let ctx = SessionContext::new();
        assert_eq!(
            ctx.advance(Direction::Outbound, DirectionState::Gone),
            DirectionState::Open
        );
        assert_eq!(
            ctx.advance(Direction::Outbound, DirectionState::HalfClosed),
            DirectionState::Gone
        );
        assert_eq!(ctx.state(Direction::Outbound), DirectionState::Gone);
        assert_eq!(ctx.state(Direction::Inbound), DirectionState::Open);
    }

    #[test]
    fn half_closed_and_gone_are_terminal() {
        let ctx = SessionContext::new();
        ctx.advance(Direction::Outbound, DirectionState::HalfClosed);
        assert!(ctx.state(Direction::Outbound).is_terminal());
        assert!(!ctx.state(Direction::Inbound).is_terminal());
        ctx.advance(Direction::Inbound, DirectionState::Gone);
        assert!(ctx.state(Direction::Inbound).is_terminal());
    }
}
