//! The two data relays of a session and the state they share.

pub mod escape;
pub mod inbound;
pub mod outbound;
pub mod state;

pub use escape::EscapeFilter;
pub use inbound::InboundRelay;
pub use outbound::{OutboundEnd, OutboundRelay};
pub use state::{Direction, DirectionState, SessionContext};
