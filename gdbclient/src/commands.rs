/// GDB command management and execution
///
/// This module provides a high-level interface over a [`Session`] for the
/// common execution-control, settings and inspection commands.

use regex::Regex;
use serde::Serialize;
use std::sync::OnceLock;

use crate::session::Session;
use crate::types::{ResultRecord, Value};
use crate::{GdbError, Result};

/// Granularity of a step
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepKind {
    /// Source line
    Statement,
    Instruction,
}

/// One row of `info sharedlibrary`
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SharedLibrary {
    pub from: u64,
    pub to: u64,
    pub symbols_loaded: bool,
    pub path: String,
}

fn shared_library_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"(?P<from>0x[0-9a-fA-F]+)[ ]+(?P<to>0x[0-9a-fA-F]+)[ ]+(?P<syms>Yes|No)(?: \(\*\))?[ ]+(?P<lib>\S+)")
            .unwrap_or_else(|e| panic!("invalid shared library pattern: {}", e))
    })
}

fn parse_address(text: &str) -> Option<u64> {
    u64::from_str_radix(text.trim_start_matches("0x"), 16).ok()
}

/// Scrape the console output of `info sharedlibrary`
pub fn parse_shared_libraries(text: &str) -> Vec<SharedLibrary> {
    shared_library_pattern()
        .captures_iter(text)
        .filter_map(|caps| {
            Some(SharedLibrary {
                from: parse_address(&caps["from"])?,
                to: parse_address(&caps["to"])?,
                symbols_loaded: &caps["syms"] == "Yes",
                path: caps["lib"].to_string(),
            })
        })
        .collect()
}

/// High-level interface for GDB commands
#[derive(Clone)]
pub struct GdbCommands {
    session: Session,
}

impl GdbCommands {
    pub fn new(session: Session) -> Self {
        Self { session }
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    async fn execute(&self, command: &str) -> Result<ResultRecord> {
        self.session.send_command(command).await?.require_ok(command)
    }

    /// Stop the running target
    pub async fn interrupt(&self) -> Result<ResultRecord> {
        let command = self.session.config().interrupt_command.clone();
        self.execute(&command).await
    }

    /// Continue execution
    pub async fn continue_execution(&self) -> Result<ResultRecord> {
        let command = self.session.config().resume_command.clone();
        self.execute(&command).await
    }

    pub async fn step_into(&self, kind: StepKind, reverse: bool) -> Result<ResultRecord> {
        let command = match kind {
            StepKind::Statement => "-exec-step",
            StepKind::Instruction => "-exec-step-instruction",
        };
        self.execute(&with_direction(command, reverse)).await
    }

    pub async fn step_over(&self, kind: StepKind, reverse: bool) -> Result<ResultRecord> {
        let command = match kind {
            StepKind::Statement => "-exec-next",
            StepKind::Instruction => "-exec-next-instruction",
        };
        self.execute(&with_direction(command, reverse)).await
    }

    /// Run until the current function returns
    pub async fn step_out(&self, reverse: bool) -> Result<ResultRecord> {
        self.execute(&with_direction("-exec-finish", reverse)).await
    }

    /// Value of a GDB setting (`-gdb-show`)
    pub async fn get_setting(&self, name: &str) -> Result<String> {
        let result = self.execute(&format!("-gdb-show {}", name)).await?;
        result
            .fields
            .get_str("value")
            .map(str::to_string)
            .ok_or_else(|| GdbError::missing("done", "value"))
    }

    pub async fn set_setting(&self, name: &str, value: &str) -> Result<()> {
        self.execute(&format!("-gdb-set {} {}", name, value)).await?;
        Ok(())
    }

    /// Connect to a gdbserver
    pub async fn connect_remote(&self, host: &str, port: u16) -> Result<ResultRecord> {
        let command = format!("target remote {}:{}", host, port);
        let timeout = self.session.config().connect_timeout();
        log::info!("Connecting to {}:{}", host, port);
        self.session
            .send_synchronous(&command, timeout)
            .await?
            .require_ok(&command)
    }

    /// Detach from the target without waiting for the reply
    pub fn detach(&self) -> u32 {
        self.session.issue_detached("-target-detach")
    }

    /// Kill the target without waiting for the reply
    pub fn terminate(&self) -> u32 {
        self.session.issue_detached("kill")
    }

    /// Name of a thread, read while the target is stopped
    pub async fn thread_name(&self, thread_id: u32) -> Result<Option<String>> {
        self.session
            .with_target_stopped(true, move |session| async move {
                let command = format!("-thread-info {}", thread_id);
                let result = session.send_command(&command).await?.require_ok(&command)?;
                let threads = result
                    .fields
                    .get("threads")
                    .ok_or_else(|| GdbError::missing("done", "threads"))?;
                let name = threads
                    .values()
                    .filter_map(Value::as_tuple)
                    .find(|t| t.get("id").and_then(Value::as_u32) == Some(thread_id))
                    .and_then(|t| t.get_str("name").or_else(|| t.get_str("target-id")))
                    .map(str::to_string);
                Ok(name)
            })
            .await
    }

    /// Loaded shared libraries as reported by the CLI
    pub async fn shared_libraries(&self) -> Result<Vec<SharedLibrary>> {
        let result = self.execute("info sharedlibrary").await?;
        Ok(parse_shared_libraries(&result.output_text()))
    }
}

fn with_direction(command: &str, reverse: bool) -> String {
    if reverse {
        format!("{} --reverse", command)
    } else {
        command.to_string()
    }
}
