/// GDB/MI session engine
///
/// This crate drives a GDB backend running in MI mode: it parses the
/// backend's output, correlates commands with their replies, offers a
/// request/response facade with activity-aware timeouts, tracks the target's
/// run state and coordinates "stop the target, inspect, resume" operations.

use std::time::Duration;
use thiserror::Error;

pub mod commands;
pub mod communication;
pub mod config;
pub mod events;
pub mod interrupt;
pub mod parser;
pub mod pending;
pub mod process;
pub mod session;
pub mod state;
pub mod transport;
pub mod types;

pub use commands::{GdbCommands, SharedLibrary, StepKind};
pub use communication::{Dispatcher, Inbound, PendingReply};
pub use config::SessionConfig;
pub use events::{EventRouter, Notification};
pub use interrupt::InterruptTicket;
pub use parser::parse_record;
pub use process::ProcessTransport;
pub use session::Session;
pub use state::{RunState, ThreadGroup, ThreadInfo};
pub use transport::{LoopbackHandle, LoopbackTransport, Transport, TransportEvent};
pub use types::*;

#[derive(Error, Debug)]
pub enum GdbError {
    #[error("Failed to start GDB process: {0}")]
    ProcessStartError(#[from] std::io::Error),
    #[error("Malformed record '{line}': {reason}")]
    MalformedRecord { line: String, reason: String },
    #[error("No pending command for token {0}")]
    UnknownToken(u32),
    #[error("Timed out waiting for '{command}' after {timeout:?} without GDB activity")]
    Timeout { command: String, timeout: Duration },
    #[error("GDB process terminated")]
    Exited,
    #[error("'{class}' record is missing field '{field}'")]
    MissingField { class: String, field: String },
    #[error("Field '{field}' has unexpected value '{value}'")]
    InvalidField { field: String, value: String },
    #[error("GDB command '{command}' failed: {message}")]
    CommandError { command: String, message: String },
    #[error("Configuration error: {0}")]
    ConfigError(String),
}

impl GdbError {
    pub(crate) fn missing(class: impl ToString, field: &str) -> Self {
        GdbError::MissingField {
            class: class.to_string(),
            field: field.to_string(),
        }
    }

    /// Errors the reader recovers from by dropping the offending record
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            GdbError::MalformedRecord { .. }
                | GdbError::UnknownToken(_)
                | GdbError::MissingField { .. }
                | GdbError::InvalidField { .. }
                | GdbError::Timeout { .. }
        )
    }
}

pub type Result<T> = std::result::Result<T, GdbError>;

/// Lock a std mutex, recovering the data if a holder panicked
pub(crate) fn lock<T>(mutex: &std::sync::Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
