/// Event routing and run-state tracking
///
/// The router consumes every record the dispatcher did not claim, applies
/// the run-state transition it implies and turns it into notifications for
/// the layer above (breakpoint hits, step completion, exceptions, exits,
/// thread and module lifecycle).

use serde::Serialize;
use std::sync::Mutex;
use tokio::sync::{mpsc, watch};

use crate::communication::Inbound;
use crate::state::{RunState, StoppedThreads, ThreadScope};
use crate::types::{
    parse_exit_code, AsyncClass, AsyncKind, AsyncRecord, Fields, ResultClass, ResultRecord,
    StopReason, StreamKind, StreamRecord, Value,
};
use crate::{lock, GdbError, Result};

/// Exception code reported for signals
pub const SIGNAL_EXCEPTION_CODE: u32 = 0x8000_0000;

/// Signal GDB uses to stop the target on `-exec-interrupt`
pub const INTERRUPT_SIGNAL: &str = "SIGINT";

const REMOTE_COMMUNICATION_ERROR: &str = "Remote communication error";

/// Something the session layer should know about
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "kebab-case")]
pub enum Notification {
    BreakpointHit {
        breakpoint_id: u32,
        temporary: bool,
        thread_id: Option<u32>,
    },
    StepComplete {
        thread_id: Option<u32>,
    },
    Break {
        thread_id: Option<u32>,
    },
    Exception {
        kind: String,
        description: String,
        code: u32,
        can_continue: bool,
        thread_id: Option<u32>,
    },
    ProgramExited {
        code: u32,
    },
    ModuleLoaded {
        name: String,
        metadata: Fields,
    },
    ModuleUnloaded {
        name: String,
    },
    ThreadCreated {
        id: u32,
        group_id: String,
    },
    ThreadExited {
        id: u32,
        exit_code: u32,
    },
    ThreadSelected {
        id: u32,
    },
    /// Breakpoint list should be refreshed; `None` means all of it
    BreakpointsChanged {
        id: Option<String>,
    },
    Output(StreamRecord),
    ConnectionLost,
    BackendExited {
        code: Option<i32>,
    },
}

pub struct EventRouter {
    run_state: Mutex<RunState>,
    running: watch::Sender<bool>,
    notifications: mpsc::UnboundedSender<Notification>,
}

impl EventRouter {
    pub fn new(notifications: mpsc::UnboundedSender<Notification>) -> Self {
        let (running, _) = watch::channel(false);
        Self {
            run_state: Mutex::new(RunState::new()),
            running,
            notifications,
        }
    }

    /// Receiver that observes every running/stopped transition
    pub fn subscribe_running(&self) -> watch::Receiver<bool> {
        self.running.subscribe()
    }

    pub fn is_running(&self) -> bool {
        *self.running.borrow()
    }

    pub fn run_state(&self) -> RunState {
        lock(&self.run_state).clone()
    }

    pub fn emit(&self, notification: Notification) {
        if self.notifications.send(notification).is_err() {
            log::trace!("Notification dropped, no receiver");
        }
    }

    /// Apply one record. `interrupt_in_flight` suppresses the stop an
    /// interrupt operation provoked.
    pub fn route(&self, inbound: Inbound, interrupt_in_flight: bool) -> Result<()> {
        match inbound {
            Inbound::Async(record) => self.handle_async(record, interrupt_in_flight),
            Inbound::Result(record) => self.handle_unsolicited_result(record),
            Inbound::Stream(stream) => {
                self.handle_stream(stream);
                Ok(())
            }
            Inbound::Prompt => Ok(()),
        }
    }

    fn handle_async(&self, record: AsyncRecord, interrupt_in_flight: bool) -> Result<()> {
        log::debug!("RECV[{}]: {:?} {}", record.token, record.kind, record.class);
        match record.kind {
            AsyncKind::Exec => match record.class {
                AsyncClass::Running => {
                    self.handle_running(&record.fields);
                    Ok(())
                }
                AsyncClass::Stopped => self.handle_stopped(&record.fields, interrupt_in_flight),
                ref other => {
                    log::debug!("Ignoring exec record '{}'", other);
                    Ok(())
                }
            },
            AsyncKind::Notify => self.handle_notify(&record.class, &record.fields),
            AsyncKind::Status => {
                log::trace!("Status record '{}'", record.class);
                Ok(())
            }
        }
    }

    fn handle_running(&self, fields: &Fields) {
        let scope = match fields.get_str("thread-id") {
            None | Some("all") => ThreadScope::All,
            Some(id) => match id.parse() {
                Ok(id) => ThreadScope::Thread(id),
                Err(_) => {
                    log::warn!("Unexpected thread-id '{}' on *running", id);
                    ThreadScope::All
                }
            },
        };
        lock(&self.run_state).set_running(scope);
        self.running.send_replace(true);
    }

    fn handle_stopped(&self, fields: &Fields, interrupt_in_flight: bool) -> Result<()> {
        let thread_id = fields.get("thread-id").and_then(Value::as_u32);
        let stopped = match fields.get("stopped-threads") {
            None => StoppedThreads::All,
            Some(Value::String(s)) if s == "all" => StoppedThreads::All,
            Some(value) => StoppedThreads::List(value.values().filter_map(Value::as_u32).collect()),
        };

        // Transition first: waiters for the stop must be released even if
        // the record cannot be classified.
        lock(&self.run_state).set_stopped(thread_id, stopped);
        self.running.send_replace(false);

        let reason_index = fields.count("reason").saturating_sub(1);
        let reason = match fields.get_last("reason").and_then(Value::as_string) {
            Some(reason) => StopReason::parse(reason),
            None => {
                if interrupt_in_flight {
                    log::debug!("Stop without reason during interrupt, suppressed");
                } else {
                    self.emit(Notification::Break { thread_id });
                }
                return Ok(());
            }
        };
        log::debug!("Target stopped: reason={} thread={:?}", reason, thread_id);

        match reason {
            StopReason::BreakpointHit | StopReason::WatchpointTrigger => {
                let breakpoint_id = fields
                    .get("bkptno")
                    .or_else(|| fields.get("wpt").and_then(Value::as_tuple).and_then(|w| w.get("number")))
                    .ok_or_else(|| GdbError::missing("stopped", "bkptno"))?;
                let breakpoint_id = breakpoint_id.as_u32().ok_or_else(|| GdbError::InvalidField {
                    field: "bkptno".into(),
                    value: format!("{:?}", breakpoint_id),
                })?;
                self.emit(Notification::BreakpointHit {
                    breakpoint_id,
                    temporary: fields.get_str("disp") == Some("del"),
                    thread_id,
                });
            }
            StopReason::EndSteppingRange | StopReason::FunctionFinished => {
                self.emit(Notification::StepComplete { thread_id });
            }
            StopReason::SignalReceived => {
                let name = fields
                    .get_nth("signal-name", reason_index)
                    .or_else(|| fields.get_last("signal-name"))
                    .and_then(Value::as_string);
                match name {
                    None | Some(INTERRUPT_SIGNAL) => {
                        if interrupt_in_flight {
                            log::debug!("Interrupt stop suppressed");
                        } else {
                            self.emit(Notification::Break { thread_id });
                        }
                    }
                    Some(name) => {
                        let meaning = fields
                            .get_nth("signal-meaning", reason_index)
                            .or_else(|| fields.get_last("signal-meaning"))
                            .and_then(Value::as_string)
                            .unwrap_or("");
                        self.emit(Notification::Exception {
                            kind: name.to_string(),
                            description: describe_signal(name, meaning, fields.get("frame")),
                            code: SIGNAL_EXCEPTION_CODE,
                            can_continue: true,
                            thread_id,
                        });
                    }
                }
            }
            reason if reason.is_exit() => self.handle_exit(fields),
            StopReason::Unknown(ref name) => {
                log::warn!("Unknown stop reason '{}', reporting as break", name);
                self.emit(Notification::Break { thread_id });
            }
            _ => self.emit(Notification::Break { thread_id }),
        }
        Ok(())
    }

    fn handle_exit(&self, fields: &Fields) {
        let code = fields
            .get_str("exit-code")
            .and_then(parse_exit_code)
            .unwrap_or(0);
        if lock(&self.run_state).mark_exit_reported() {
            log::info!("Program exited with code {}", code);
            self.emit(Notification::ProgramExited { code });
        } else {
            log::debug!("Program exit already reported");
        }
    }

    fn handle_notify(&self, class: &AsyncClass, fields: &Fields) -> Result<()> {
        let required = |field: &str| {
            fields
                .get_str(field)
                .ok_or_else(|| GdbError::missing(class, field))
        };
        let required_u32 = |field: &str| {
            let value = required(field)?;
            value.parse::<u32>().map_err(|_| GdbError::InvalidField {
                field: field.to_string(),
                value: value.to_string(),
            })
        };

        match class {
            AsyncClass::ThreadGroupAdded | AsyncClass::ThreadGroupStarted => {
                let id = required("id")?;
                let pid = fields.get("pid").and_then(Value::as_u32);
                let mut state = lock(&self.run_state);
                state.group_started(id, pid);
                if *class == AsyncClass::ThreadGroupStarted {
                    state.run_started();
                }
            }
            AsyncClass::ThreadGroupRemoved | AsyncClass::ThreadGroupExited => {
                let id = required("id")?;
                let code = fields.get_str("exit-code").and_then(parse_exit_code);
                lock(&self.run_state).group_exited(id, code);
            }
            AsyncClass::ThreadCreated => {
                let id = required_u32("id")?;
                let group_id = fields.get_str("group-id").unwrap_or_default();
                lock(&self.run_state).thread_created(id, group_id);
                self.emit(Notification::ThreadCreated {
                    id,
                    group_id: group_id.to_string(),
                });
            }
            AsyncClass::ThreadExited => {
                let id = required_u32("id")?;
                let exit_code = lock(&self.run_state).thread_exited(id, fields.get_str("group-id"));
                self.emit(Notification::ThreadExited { id, exit_code });
            }
            AsyncClass::ThreadSelected => {
                let id = required_u32("id")?;
                lock(&self.run_state).select_thread(id);
                self.emit(Notification::ThreadSelected { id });
            }
            AsyncClass::LibraryLoaded => {
                let name = module_name(class, fields)?;
                lock(&self.run_state).add_module(&name, fields.clone());
                self.emit(Notification::ModuleLoaded {
                    name,
                    metadata: fields.clone(),
                });
            }
            AsyncClass::LibraryUnloaded => {
                let name = module_name(class, fields)?;
                lock(&self.run_state).remove_module(&name);
                self.emit(Notification::ModuleUnloaded { name });
            }
            AsyncClass::BreakpointCreated | AsyncClass::BreakpointModified => {
                let id = fields
                    .get("bkpt")
                    .and_then(Value::as_tuple)
                    .and_then(|b| b.get_str("number"))
                    .ok_or_else(|| GdbError::missing(class, "bkpt.number"))?;
                self.emit(Notification::BreakpointsChanged {
                    id: Some(id.to_string()),
                });
            }
            AsyncClass::BreakpointDeleted => {
                let id = required("id")?;
                self.emit(Notification::BreakpointsChanged {
                    id: Some(id.to_string()),
                });
            }
            other => log::trace!("Ignoring notify record '{}'", other),
        }
        Ok(())
    }

    fn handle_unsolicited_result(&self, record: ResultRecord) -> Result<()> {
        match record.class {
            ResultClass::Done | ResultClass::Running => {
                let exited = record
                    .fields
                    .get_last("reason")
                    .and_then(Value::as_string)
                    .map(|r| StopReason::parse(r).is_exit())
                    .unwrap_or(false);
                if exited {
                    lock(&self.run_state).set_stopped(None, StoppedThreads::All);
                    self.running.send_replace(false);
                    self.handle_exit(&record.fields);
                }
            }
            ResultClass::Connected => {
                log::info!("Connected to remote target");
                self.emit(Notification::BreakpointsChanged { id: None });
            }
            ResultClass::Error => {
                log::warn!(
                    "RECV[0]: unsolicited error: {}",
                    record.error_message().unwrap_or("Unknown error")
                );
            }
            ResultClass::Exit => log::info!("RECV[0]: GDB is exiting"),
        }
        Ok(())
    }

    fn handle_stream(&self, stream: StreamRecord) {
        if stream.kind == StreamKind::Log && stream.text.contains(REMOTE_COMMUNICATION_ERROR) {
            log::error!("Lost connection to remote target: {}", stream.text.trim_end());
            self.emit(Notification::ConnectionLost);
        }
        self.emit(Notification::Output(stream));
    }
}

fn module_name(class: &AsyncClass, fields: &Fields) -> Result<String> {
    fields
        .get_str("target-name")
        .or_else(|| fields.get_str("id"))
        .map(str::to_string)
        .ok_or_else(|| GdbError::missing(class, "target-name"))
}

fn describe_signal(name: &str, meaning: &str, frame: Option<&Value>) -> String {
    let frame = frame.and_then(Value::as_tuple);
    let addr = frame.and_then(|f| f.get_str("addr")).unwrap_or("??");
    let func = frame.and_then(|f| f.get_str("func")).unwrap_or("??");
    format!("{} ({}) at {} ({})", name, meaning, addr, func)
}
