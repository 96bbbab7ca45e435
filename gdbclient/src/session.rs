/// GDB session
///
/// Ties a transport to the dispatcher and the event router, runs the reader
/// task, and offers the synchronous request/response facade whose timeout is
/// measured from the last backend activity rather than from the call start.

use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;
use tokio::sync::{mpsc, watch};

use crate::communication::{Dispatcher, PendingReply};
use crate::config::SessionConfig;
use crate::events::{EventRouter, Notification};
use crate::interrupt::InterruptState;
use crate::state::RunState;
use crate::transport::{Transport, TransportEvent};
use crate::types::ResultRecord;
use crate::{lock, GdbError, Result};

const EXIT_COMMAND: &str = "-gdb-exit";

pub(crate) struct Shared {
    pub(crate) config: SessionConfig,
    pub(crate) dispatcher: Dispatcher,
    pub(crate) router: EventRouter,
    /// Bumped on every line the backend produces
    activity: watch::Sender<u64>,
    pub(crate) closed: watch::Sender<bool>,
    /// One synchronous wait at a time
    sync_gate: tokio::sync::Mutex<()>,
    pub(crate) interrupts: Mutex<InterruptState>,
    notifications: Mutex<Option<mpsc::UnboundedReceiver<Notification>>>,
}

impl Shared {
    fn touch(&self) {
        self.activity.send_modify(|tick| *tick = tick.wrapping_add(1));
    }

    fn interrupt_in_flight(&self) -> bool {
        lock(&self.interrupts).in_flight()
    }

    fn handle_line(&self, line: &str) {
        log::trace!("GDB_OUT: {}", line);
        let inbound = match self.dispatcher.route_line(line) {
            Ok(Some(inbound)) => inbound,
            Ok(None) => return,
            Err(e) => {
                log::warn!("Dropping line: {}", e);
                return;
            }
        };
        let in_flight = self.interrupt_in_flight();
        if let Err(e) = self.router.route(inbound, in_flight) {
            log::warn!("Skipping record: {}", e);
        }
    }

    fn shutdown(&self, code: Option<i32>) {
        if *self.closed.borrow() {
            return;
        }
        let released = self.dispatcher.close();
        self.closed.send_replace(true);
        log::info!("GDB session closed (exit code {:?}), released {} waiter(s)", code, released);
        self.router.emit(Notification::BackendExited { code });
    }
}

/// Handle to a running GDB/MI session; clones share the session
#[derive(Clone)]
pub struct Session {
    pub(crate) inner: Arc<Shared>,
}

impl Session {
    /// Start `transport` and the reader task. Must be called inside a tokio runtime.
    pub fn attach<T: Transport>(mut transport: T, config: SessionConfig) -> Result<Session> {
        config.validate()?;
        let events = transport.start()?;
        let transport: Arc<dyn Transport> = Arc::new(transport);

        let (notify_tx, notify_rx) = mpsc::unbounded_channel();
        let (activity, _) = watch::channel(0u64);
        let (closed, _) = watch::channel(false);

        let shared = Arc::new(Shared {
            config,
            dispatcher: Dispatcher::new(transport),
            router: EventRouter::new(notify_tx),
            activity,
            closed,
            sync_gate: tokio::sync::Mutex::new(()),
            interrupts: Mutex::new(InterruptState::default()),
            notifications: Mutex::new(Some(notify_rx)),
        });

        tokio::spawn(reader_loop(Arc::downgrade(&shared), events));
        log::debug!("GDB session attached");

        Ok(Session { inner: shared })
    }

    /// Run the configured startup commands in order
    pub async fn initialize(&self) -> Result<()> {
        for command in self.inner.config.startup_commands.clone() {
            self.send_command(&command).await?.require_ok(&command)?;
        }
        Ok(())
    }

    pub fn config(&self) -> &SessionConfig {
        &self.inner.config
    }

    /// Issue a command and return a handle to its reply
    pub fn issue(&self, command: &str) -> PendingReply {
        self.inner.dispatcher.issue(command)
    }

    /// Issue a command nobody waits for
    pub fn issue_detached(&self, command: &str) -> u32 {
        self.inner.dispatcher.issue_detached(command)
    }

    /// Send a command and wait for its result with the configured timeout
    pub async fn send_command(&self, command: &str) -> Result<ResultRecord> {
        self.send_synchronous(command, self.inner.config.command_timeout()).await
    }

    /// Send a command and wait for its result.
    ///
    /// Fails with `Timeout` only after `timeout` passes with no backend
    /// activity at all, and with `Exited` as soon as the backend goes away.
    pub async fn send_synchronous(&self, command: &str, timeout: Duration) -> Result<ResultRecord> {
        let _gate = self.inner.sync_gate.lock().await;
        let mut activity = self.inner.activity.subscribe();

        let reply = self.issue(command);
        let token = reply.token();
        let mut receiver = reply.receiver;
        log::debug!("SEND[{}]: waiting for response...", token);

        loop {
            tokio::select! {
                biased;
                result = &mut receiver => {
                    return match result {
                        Ok(record) => {
                            log::debug!("RECV[{}]: SUCCESS -> class={:?}", token, record.class);
                            Ok(record)
                        }
                        Err(_) => {
                            log::debug!("RECV[{}]: session exited while waiting", token);
                            Err(GdbError::Exited)
                        }
                    };
                }
                changed = activity.changed() => {
                    if changed.is_err() {
                        return (&mut receiver).await.map_err(|_| GdbError::Exited);
                    }
                }
                _ = tokio::time::sleep(timeout) => {
                    log::warn!("SEND[{}]: no activity for {:?} waiting on '{}'", token, timeout, command);
                    return Err(GdbError::Timeout {
                        command: command.to_string(),
                        timeout,
                    });
                }
            }
        }
    }

    /// Ask GDB to exit and tear the transport down
    pub fn close(&self) {
        if self.is_closed() {
            return;
        }
        self.issue_detached(EXIT_COMMAND);
        self.inner.dispatcher.transport().dispose();
    }

    /// Wait until the backend has gone away
    pub async fn closed(&self) {
        let mut closed = self.inner.closed.subscribe();
        let _ = closed.wait_for(|c| *c).await;
    }

    pub fn is_closed(&self) -> bool {
        *self.inner.closed.borrow()
    }

    /// The notification stream; only the first caller gets it
    pub fn take_notifications(&self) -> Option<mpsc::UnboundedReceiver<Notification>> {
        lock(&self.inner.notifications).take()
    }

    pub fn is_running(&self) -> bool {
        self.inner.router.is_running()
    }

    /// Watch the target's running flag
    pub fn subscribe_running(&self) -> watch::Receiver<bool> {
        self.inner.router.subscribe_running()
    }

    /// Snapshot of the run state
    pub fn run_state(&self) -> RunState {
        self.inner.router.run_state()
    }
}

async fn reader_loop(shared: Weak<Shared>, mut events: mpsc::UnboundedReceiver<TransportEvent>) {
    log::debug!("GDB reader started");
    while let Some(event) = events.recv().await {
        let shared = match shared.upgrade() {
            Some(shared) => shared,
            None => break,
        };
        match event {
            TransportEvent::Line(line) => {
                shared.touch();
                shared.handle_line(&line);
            }
            TransportEvent::Stderr(line) => {
                shared.touch();
                log::debug!("GDB stderr: {}", line);
            }
            TransportEvent::Exited(code) => {
                shared.shutdown(code);
                break;
            }
        }
    }
    if let Some(shared) = shared.upgrade() {
        shared.shutdown(None);
    }
    log::debug!("GDB reader finished");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::{split_token, LoopbackTransport};
    use crate::types::ResultClass;

    #[tokio::test]
    async fn test_initialize_runs_startup_commands() {
        let (transport, handle) = LoopbackTransport::with_responder(|line| {
            let (token, _) = split_token(line);
            vec![format!("{}^done", token)]
        });
        let config = SessionConfig {
            startup_commands: vec!["-gdb-set pagination off".into(), "-enable-pretty-printing".into()],
            ..SessionConfig::default()
        };
        let session = Session::attach(transport, config).unwrap();

        session.initialize().await.unwrap();
        assert_eq!(
            handle.sent(),
            vec!["1-gdb-set pagination off", "2-enable-pretty-printing"]
        );
    }

    #[tokio::test]
    async fn test_initialize_stops_on_error() {
        let (transport, handle) = LoopbackTransport::with_responder(|line| {
            let (token, _) = split_token(line);
            vec![format!("{}^error,msg=\"Undefined command\"", token)]
        });
        let config = SessionConfig {
            startup_commands: vec!["-bogus".into(), "-never-sent".into()],
            ..SessionConfig::default()
        };
        let session = Session::attach(transport, config).unwrap();

        let err = session.initialize().await.unwrap_err();
        assert!(matches!(err, GdbError::CommandError { ref message, .. } if message == "Undefined command"));
        assert_eq!(handle.sent().len(), 1);
    }

    #[tokio::test]
    async fn test_close_sends_exit_and_reports_backend_exit() {
        let (transport, handle) = LoopbackTransport::new();
        let session = Session::attach(transport, SessionConfig::default()).unwrap();
        let mut notifications = session.take_notifications().unwrap();
        assert!(session.take_notifications().is_none());

        session.close();
        session.closed().await;

        assert!(session.is_closed());
        assert_eq!(handle.sent(), vec!["1-gdb-exit"]);
        assert_eq!(notifications.recv().await, Some(Notification::BackendExited { code: None }));
        assert!(matches!(
            session.send_command("-exec-continue").await,
            Err(GdbError::Exited)
        ));
    }

    #[tokio::test]
    async fn test_unknown_token_and_garbage_do_not_stop_reader() {
        let (transport, handle) = LoopbackTransport::new();
        let session = Session::attach(transport, SessionConfig::default()).unwrap();

        let reply = session.issue("-list-features");
        handle.push_line("99^done");
        handle.push_line("}{ garbage");
        handle.push_line(format!("{}^done,features=[\"async\"]", reply.token()));

        let record = reply.wait().await.unwrap();
        assert_eq!(record.class, ResultClass::Done);
    }

    #[tokio::test]
    async fn test_attach_rejects_invalid_config() {
        let (transport, _handle) = LoopbackTransport::new();
        let config = SessionConfig {
            command_timeout_ms: 0,
            ..SessionConfig::default()
        };
        assert!(matches!(
            Session::attach(transport, config),
            Err(GdbError::ConfigError(_))
        ));
    }
}
