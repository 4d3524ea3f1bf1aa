//! `qrexec` Core Library
//!
//! Shared functionality for the qrexec client:
//! - Framed wire protocol spoken with the qrexec daemon
//! - Translation of process status words into exit codes
//! - Configuration resolution and hierarchy
//! - Common error types

pub mod config;
pub mod error;
pub mod exit;
pub mod protocol;
pub mod tracing_init;

pub use config::Config;
pub use error::{Error, ProtocolError, Result};
pub use protocol::{Frame, Header, MAX_DATA_CHUNK, MsgType};
