//! qrexec client library
//!
//! Asks the qrexec daemon to run (or attach to) a command in another domain
//! and relays that command's stdio to a local program or to our own stdio.

pub mod connection;
pub mod local;
pub mod relay;
pub mod session;

pub use connection::BrokerConnection;
pub use local::{LocalProcess, ReapPolicy, SpawnOptions};
pub use session::{ExecMode, Session, SessionOptions, SessionOutcome, SessionRequest};
