/// Session configuration
///
/// Loaded from JSON; every field has a default so partial files work.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::{GdbError, Result};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// GDB executable
    pub gdb_path: PathBuf,
    pub gdb_args: Vec<String>,
    /// Inactivity window for synchronous commands
    pub command_timeout_ms: u64,
    /// Inactivity window for `target remote`
    pub connect_timeout_ms: u64,
    /// Upper bound on waiting for the target to confirm it stopped
    pub interrupt_timeout_ms: u64,
    pub interrupt_command: String,
    pub resume_command: String,
    /// Run in order by `Session::initialize`
    pub startup_commands: Vec<String>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            gdb_path: PathBuf::from("gdb"),
            gdb_args: vec!["--interpreter=mi".to_string()],
            command_timeout_ms: 60_000,
            connect_timeout_ms: 60_000,
            interrupt_timeout_ms: 30_000,
            interrupt_command: "-exec-interrupt".to_string(),
            resume_command: "-exec-continue".to_string(),
            startup_commands: Vec::new(),
        }
    }
}

impl SessionConfig {
    /// Load a JSON configuration file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|e| {
            GdbError::ConfigError(format!("Failed to read {}: {}", path.display(), e))
        })?;
        Self::from_json(&text)
    }

    pub fn from_json(text: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(text)
            .map_err(|e| GdbError::ConfigError(format!("Invalid configuration: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.gdb_path.as_os_str().is_empty() {
            return Err(GdbError::ConfigError("gdb_path must not be empty".into()));
        }
        if self.command_timeout_ms == 0 || self.interrupt_timeout_ms == 0 {
            return Err(GdbError::ConfigError("timeouts must be non-zero".into()));
        }
        Ok(())
    }

    pub fn command_timeout(&self) -> Duration {
        Duration::from_millis(self.command_timeout_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn interrupt_timeout(&self) -> Duration {
        Duration::from_millis(self.interrupt_timeout_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_json_uses_defaults() {
        let config = SessionConfig::from_json(
            r#"{"gdb_path": "/opt/ndk/bin/gdb", "command_timeout_ms": 1500}"#,
        )
        .unwrap();

        assert_eq!(config.gdb_path, PathBuf::from("/opt/ndk/bin/gdb"));
        assert_eq!(config.command_timeout(), Duration::from_millis(1500));
        assert_eq!(config.gdb_args, vec!["--interpreter=mi".to_string()]);
        assert_eq!(config.interrupt_command, "-exec-interrupt");
        assert_eq!(config.resume_command, "-exec-continue");
    }

    #[test]
    fn test_rejects_bad_config() {
        assert!(matches!(
            SessionConfig::from_json(r#"{"command_timeout_ms": 0}"#),
            Err(GdbError::ConfigError(_))
        ));
        assert!(matches!(
            SessionConfig::from_json("{not json"),
            Err(GdbError::ConfigError(_))
        ));
    }

    #[test]
    fn test_missing_file() {
        let err = SessionConfig::from_file("/definitely/not/here.json").unwrap_err();
        assert!(err.to_string().contains("Failed to read"));
    }
}
