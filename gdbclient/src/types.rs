/// GDB/MI types and data structures
///
/// This module defines the records produced by the parser and the
/// recursively-typed values they carry.

use serde::Serialize;
use std::fmt;

/// One parsed line of GDB/MI output
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "record", rename_all = "kebab-case")]
pub enum Record {
    Result(ResultRecord),
    Async(AsyncRecord),
    Stream(StreamRecord),
    Prompt,
}

/// Terminal reply to one issued command
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ResultRecord {
    /// Correlation token, 0 when the line carried none
    pub token: u32,
    pub class: ResultClass,
    pub fields: Fields,
    /// Stream records collected for the command while it was pending
    pub output: Vec<StreamRecord>,
}

impl ResultRecord {
    pub fn is_error(&self) -> bool {
        self.class == ResultClass::Error
    }

    /// The `msg` field of an `^error` record
    pub fn error_message(&self) -> Option<&str> {
        self.fields.get_str("msg")
    }

    /// Turn an `^error` reply into a `CommandError`
    pub fn require_ok(self, command: &str) -> crate::Result<Self> {
        if self.is_error() {
            let message = self.error_message().unwrap_or("Unknown error").to_string();
            log::error!("RECV[{}]: GDB ERROR -> {}", self.token, message);
            return Err(crate::GdbError::CommandError {
                command: command.to_string(),
                message,
            });
        }
        Ok(self)
    }

    /// Concatenated text of the attached stream output
    pub fn output_text(&self) -> String {
        self.output.iter().map(|s| s.text.as_str()).collect()
    }
}

/// GDB/MI result classes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum ResultClass {
    Done,
    Running,
    Connected,
    Error,
    Exit,
}

impl ResultClass {
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "done" => Some(ResultClass::Done),
            "running" => Some(ResultClass::Running),
            "connected" => Some(ResultClass::Connected),
            "error" => Some(ResultClass::Error),
            "exit" => Some(ResultClass::Exit),
            _ => None,
        }
    }
}

/// Unsolicited notification about target state
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AsyncRecord {
    pub token: u32,
    pub kind: AsyncKind,
    pub class: AsyncClass,
    pub fields: Fields,
}

/// Which async channel a record arrived on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum AsyncKind {
    /// `*` records
    Exec,
    /// `+` records
    Status,
    /// `=` records
    Notify,
}

/// GDB/MI async classes
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum AsyncClass {
    // Exec async records
    Running,
    Stopped,

    // Notify async records
    ThreadGroupAdded,
    ThreadGroupRemoved,
    ThreadGroupStarted,
    ThreadGroupExited,
    ThreadCreated,
    ThreadExited,
    ThreadSelected,
    LibraryLoaded,
    LibraryUnloaded,
    BreakpointCreated,
    BreakpointModified,
    BreakpointDeleted,
    CmdParamChanged,
    MemoryChanged,

    /// Anything newer than this client knows about
    Other(String),
}

impl AsyncClass {
    pub fn from_name(name: &str) -> Self {
        match name {
            "running" => AsyncClass::Running,
            "stopped" => AsyncClass::Stopped,
            "thread-group-added" => AsyncClass::ThreadGroupAdded,
            "thread-group-removed" => AsyncClass::ThreadGroupRemoved,
            "thread-group-started" => AsyncClass::ThreadGroupStarted,
            "thread-group-exited" => AsyncClass::ThreadGroupExited,
            "thread-created" => AsyncClass::ThreadCreated,
            "thread-exited" => AsyncClass::ThreadExited,
            "thread-selected" => AsyncClass::ThreadSelected,
            "library-loaded" => AsyncClass::LibraryLoaded,
            "library-unloaded" => AsyncClass::LibraryUnloaded,
            "breakpoint-created" => AsyncClass::BreakpointCreated,
            "breakpoint-modified" => AsyncClass::BreakpointModified,
            "breakpoint-deleted" => AsyncClass::BreakpointDeleted,
            "cmd-param-changed" => AsyncClass::CmdParamChanged,
            "memory-changed" => AsyncClass::MemoryChanged,
            other => AsyncClass::Other(other.to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            AsyncClass::Running => "running",
            AsyncClass::Stopped => "stopped",
            AsyncClass::ThreadGroupAdded => "thread-group-added",
            AsyncClass::ThreadGroupRemoved => "thread-group-removed",
            AsyncClass::ThreadGroupStarted => "thread-group-started",
            AsyncClass::ThreadGroupExited => "thread-group-exited",
            AsyncClass::ThreadCreated => "thread-created",
            AsyncClass::ThreadExited => "thread-exited",
            AsyncClass::ThreadSelected => "thread-selected",
            AsyncClass::LibraryLoaded => "library-loaded",
            AsyncClass::LibraryUnloaded => "library-unloaded",
            AsyncClass::BreakpointCreated => "breakpoint-created",
            AsyncClass::BreakpointModified => "breakpoint-modified",
            AsyncClass::BreakpointDeleted => "breakpoint-deleted",
            AsyncClass::CmdParamChanged => "cmd-param-changed",
            AsyncClass::MemoryChanged => "memory-changed",
            AsyncClass::Other(name) => name,
        }
    }
}

impl fmt::Display for AsyncClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Free-form textual output
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StreamRecord {
    pub kind: StreamKind,
    pub text: String,
}

/// Types of GDB/MI streams
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum StreamKind {
    Console, // ~ prefix
    Target,  // @ prefix
    Log,     // & prefix
}

/// Ordered `name=value` pairs.
///
/// GDB repeats field names (several `reason` entries on one stop, several
/// `frame` entries in a stack list), so lookups come in first/last/nth
/// flavours instead of a plain map.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(transparent)]
pub struct Fields(Vec<(String, Value)>);

impl Fields {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, name: impl Into<String>, value: Value) {
        self.0.push((name.into(), value));
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.0.iter().any(|(n, _)| n == name)
    }

    /// First value stored under `name`
    pub fn get(&self, name: &str) -> Option<&Value> {
        self.0.iter().find(|(n, _)| n == name).map(|(_, v)| v)
    }

    /// Most recent value stored under `name`
    pub fn get_last(&self, name: &str) -> Option<&Value> {
        self.0.iter().rev().find(|(n, _)| n == name).map(|(_, v)| v)
    }

    pub fn get_nth(&self, name: &str, index: usize) -> Option<&Value> {
        self.0
            .iter()
            .filter(|(n, _)| n == name)
            .nth(index)
            .map(|(_, v)| v)
    }

    pub fn get_all<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a Value> + 'a {
        self.0.iter().filter(move |(n, _)| n == name).map(|(_, v)| v)
    }

    pub fn count(&self, name: &str) -> usize {
        self.0.iter().filter(|(n, _)| n == name).count()
    }

    pub fn get_str(&self, name: &str) -> Option<&str> {
        self.get(name).and_then(Value::as_string)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.0.iter().map(|(n, v)| (n.as_str(), v))
    }
}

impl FromIterator<(String, Value)> for Fields {
    fn from_iter<I: IntoIterator<Item = (String, Value)>>(iter: I) -> Self {
        Fields(iter.into_iter().collect())
    }
}

/// Represents values in GDB/MI output
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum Value {
    String(String),
    List(Vec<Value>),
    Tuple(Fields),
}

impl Value {
    /// Get the value as a string, if possible
    pub fn as_string(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }

    /// Get the value as a list, if possible
    pub fn as_list(&self) -> Option<&[Value]> {
        match self {
            Value::List(list) => Some(list),
            _ => None,
        }
    }

    /// Get the value as a tuple, if possible
    pub fn as_tuple(&self) -> Option<&Fields> {
        match self {
            Value::Tuple(tuple) => Some(tuple),
            _ => None,
        }
    }

    /// Elements of a list or of a named list (`[frame={..},frame={..}]`)
    pub fn values(&self) -> Box<dyn Iterator<Item = &Value> + '_> {
        match self {
            Value::List(list) => Box::new(list.iter()),
            Value::Tuple(tuple) => Box::new(tuple.iter().map(|(_, v)| v)),
            Value::String(_) => Box::new(std::iter::empty()),
        }
    }

    pub fn as_u32(&self) -> Option<u32> {
        self.as_string().and_then(|s| s.parse().ok())
    }
}

/// Stop reason for stopped events
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum StopReason {
    BreakpointHit,
    WatchpointTrigger,
    ReadWatchpointTrigger,
    AccessWatchpointTrigger,
    FunctionFinished,
    LocationReached,
    WatchpointScope,
    EndSteppingRange,
    ExitedSignalled,
    Exited,
    ExitedNormally,
    SignalReceived,
    SolibEvent,
    Fork,
    Vfork,
    SyscallEntry,
    SyscallReturn,
    Exec,
    NoHistory,
    Unknown(String),
}

impl StopReason {
    pub fn parse(s: &str) -> Self {
        match s {
            "breakpoint-hit" => StopReason::BreakpointHit,
            "watchpoint-trigger" => StopReason::WatchpointTrigger,
            "read-watchpoint-trigger" => StopReason::ReadWatchpointTrigger,
            "access-watchpoint-trigger" => StopReason::AccessWatchpointTrigger,
            "function-finished" => StopReason::FunctionFinished,
            "location-reached" => StopReason::LocationReached,
            "watchpoint-scope" => StopReason::WatchpointScope,
            "end-stepping-range" => StopReason::EndSteppingRange,
            "exited-signalled" => StopReason::ExitedSignalled,
            "exited" => StopReason::Exited,
            "exited-normally" => StopReason::ExitedNormally,
            "signal-received" => StopReason::SignalReceived,
            "solib-event" => StopReason::SolibEvent,
            "fork" => StopReason::Fork,
            "vfork" => StopReason::Vfork,
            "syscall-entry" => StopReason::SyscallEntry,
            "syscall-return" => StopReason::SyscallReturn,
            "exec" => StopReason::Exec,
            "no-history" => StopReason::NoHistory,
            other => StopReason::Unknown(other.to_string()),
        }
    }

    pub fn is_exit(&self) -> bool {
        matches!(
            self,
            StopReason::Exited | StopReason::ExitedNormally | StopReason::ExitedSignalled
        )
    }
}

impl fmt::Display for StopReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            StopReason::BreakpointHit => "breakpoint-hit",
            StopReason::WatchpointTrigger => "watchpoint-trigger",
            StopReason::ReadWatchpointTrigger => "read-watchpoint-trigger",
            StopReason::AccessWatchpointTrigger => "access-watchpoint-trigger",
            StopReason::FunctionFinished => "function-finished",
            StopReason::LocationReached => "location-reached",
            StopReason::WatchpointScope => "watchpoint-scope",
            StopReason::EndSteppingRange => "end-stepping-range",
            StopReason::ExitedSignalled => "exited-signalled",
            StopReason::Exited => "exited",
            StopReason::ExitedNormally => "exited-normally",
            StopReason::SignalReceived => "signal-received",
            StopReason::SolibEvent => "solib-event",
            StopReason::Fork => "fork",
            StopReason::Vfork => "vfork",
            StopReason::SyscallEntry => "syscall-entry",
            StopReason::SyscallReturn => "syscall-return",
            StopReason::Exec => "exec",
            StopReason::NoHistory => "no-history",
            StopReason::Unknown(other) => other,
        };
        write!(f, "{}", s)
    }
}

/// Parse an `exit-code` field the way GDB prints it (octal, `0` prefixed)
pub fn parse_exit_code(text: &str) -> Option<u32> {
    if text.len() > 1 && text.starts_with('0') {
        u32::from_str_radix(&text[1..], 8).ok()
    } else {
        text.parse().ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn s(v: &str) -> Value {
        Value::String(v.to_string())
    }

    #[test]
    fn test_fields_keep_repeated_names() {
        let mut fields = Fields::new();
        fields.push("reason", s("signal-received"));
        fields.push("signal-name", s("SIGSEGV"));
        fields.push("reason", s("exited-signalled"));

        assert_eq!(fields.len(), 3);
        assert_eq!(fields.count("reason"), 2);
        assert_eq!(fields.get_str("reason"), Some("signal-received"));
        assert_eq!(fields.get_last("reason").and_then(Value::as_string), Some("exited-signalled"));
        assert_eq!(fields.get_nth("reason", 1), Some(&s("exited-signalled")));
        assert!(fields.get_nth("reason", 2).is_none());
    }

    #[test]
    fn test_values_over_named_list() {
        let mut frames = Fields::new();
        frames.push("frame", s("a"));
        frames.push("frame", s("b"));
        let named = Value::Tuple(frames);
        let plain = Value::List(vec![s("a"), s("b")]);

        let named: Vec<_> = named.values().filter_map(Value::as_string).collect();
        let plain: Vec<_> = plain.values().filter_map(Value::as_string).collect();
        assert_eq!(named, plain);
    }

    #[test]
    fn test_stop_reason_display_round_trip() {
        for name in ["breakpoint-hit", "end-stepping-range", "exited-normally", "signal-received"] {
            assert_eq!(StopReason::parse(name).to_string(), name);
        }
        assert_eq!(StopReason::parse("vendor-thing"), StopReason::Unknown("vendor-thing".into()));
        assert!(StopReason::ExitedSignalled.is_exit());
        assert!(!StopReason::SignalReceived.is_exit());
    }

    #[test]
    fn test_parse_exit_code() {
        assert_eq!(parse_exit_code("0"), Some(0));
        assert_eq!(parse_exit_code("01"), Some(1));
        assert_eq!(parse_exit_code("012"), Some(10));
        assert_eq!(parse_exit_code("3"), Some(3));
        assert_eq!(parse_exit_code("zz"), None);
    }
}
