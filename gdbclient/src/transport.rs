/// Line-oriented channel to the GDB backend
///
/// The session only needs to push command lines in and get output lines and
/// an exit notice back; how the backend is launched lives behind [`Transport`].

use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;

use crate::lock;

/// Something the transport observed
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    /// One line of standard output
    Line(String),
    /// One line of standard error; counts as activity only
    Stderr(String),
    /// The backend is gone. Always the last event, after every `Line`.
    Exited(Option<i32>),
}

pub trait Transport: Send + Sync + 'static {
    /// Start the backend and return its event stream
    fn start(&mut self) -> io::Result<mpsc::UnboundedReceiver<TransportEvent>>;

    /// Queue one line (without newline) for the backend.
    ///
    /// Never fails loudly: returns false when the channel is already closed.
    fn send(&self, line: &str) -> bool;

    fn is_alive(&self) -> bool;

    /// Tear the backend down; an `Exited` event follows
    fn dispose(&self);
}

type Responder = Box<dyn FnMut(&str) -> Vec<String> + Send>;

struct Loopback {
    events: mpsc::UnboundedSender<TransportEvent>,
    receiver: Mutex<Option<mpsc::UnboundedReceiver<TransportEvent>>>,
    sent: Mutex<Vec<String>>,
    responder: Mutex<Option<Responder>>,
    alive: AtomicBool,
}

impl Loopback {
    fn emit(&self, event: TransportEvent) {
        if self.alive.load(Ordering::SeqCst) {
            let _ = self.events.send(event);
        }
    }

    fn exit(&self, code: Option<i32>) {
        if self.alive.swap(false, Ordering::SeqCst) {
            let _ = self.events.send(TransportEvent::Exited(code));
        }
    }
}

/// In-memory transport.
///
/// Every submitted line is recorded; an optional responder closure answers
/// them, and the paired [`LoopbackHandle`] injects output or an exit.
pub struct LoopbackTransport {
    inner: Arc<Loopback>,
}

/// Backend side of a [`LoopbackTransport`]
#[derive(Clone)]
pub struct LoopbackHandle {
    inner: Arc<Loopback>,
}

impl LoopbackTransport {
    pub fn new() -> (Self, LoopbackHandle) {
        let (events, receiver) = mpsc::unbounded_channel();
        let inner = Arc::new(Loopback {
            events,
            receiver: Mutex::new(Some(receiver)),
            sent: Mutex::new(Vec::new()),
            responder: Mutex::new(None),
            alive: AtomicBool::new(true),
        });
        (
            Self { inner: inner.clone() },
            LoopbackHandle { inner },
        )
    }

    /// Loopback whose submitted lines are answered by `responder`
    pub fn with_responder<F>(responder: F) -> (Self, LoopbackHandle)
    where
        F: FnMut(&str) -> Vec<String> + Send + 'static,
    {
        let (transport, handle) = Self::new();
        handle.set_responder(responder);
        (transport, handle)
    }
}

impl Transport for LoopbackTransport {
    fn start(&mut self) -> io::Result<mpsc::UnboundedReceiver<TransportEvent>> {
        lock(&self.inner.receiver)
            .take()
            .ok_or_else(|| io::Error::new(io::ErrorKind::AlreadyExists, "loopback already started"))
    }

    fn send(&self, line: &str) -> bool {
        if !self.is_alive() {
            log::debug!("LOOPBACK: dropping '{}' after exit", line);
            return false;
        }
        lock(&self.inner.sent).push(line.to_string());

        let replies = match lock(&self.inner.responder).as_mut() {
            Some(responder) => responder(line),
            None => Vec::new(),
        };
        for reply in replies {
            self.inner.emit(TransportEvent::Line(reply));
        }
        true
    }

    fn is_alive(&self) -> bool {
        self.inner.alive.load(Ordering::SeqCst)
    }

    fn dispose(&self) {
        self.inner.exit(None);
    }
}

impl LoopbackHandle {
    pub fn push_line(&self, line: impl Into<String>) {
        self.inner.emit(TransportEvent::Line(line.into()));
    }

    pub fn push_stderr(&self, line: impl Into<String>) {
        self.inner.emit(TransportEvent::Stderr(line.into()));
    }

    /// Simulate the backend process exiting
    pub fn exit(&self, code: Option<i32>) {
        self.inner.exit(code);
    }

    pub fn set_responder<F>(&self, responder: F)
    where
        F: FnMut(&str) -> Vec<String> + Send + 'static,
    {
        *lock(&self.inner.responder) = Some(Box::new(responder));
    }

    /// Lines submitted so far, oldest first
    pub fn sent(&self) -> Vec<String> {
        lock(&self.inner.sent).clone()
    }

    pub fn is_alive(&self) -> bool {
        self.inner.alive.load(Ordering::SeqCst)
    }
}

/// Split `12-exec-continue` into `(12, "-exec-continue")`
pub fn split_token(line: &str) -> (u32, &str) {
    let digits = line.bytes().take_while(u8::is_ascii_digit).count();
    let token = line[..digits].parse().unwrap_or(0);
    (token, &line[digits..])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_split_token() {
        assert_eq!(split_token("12-exec-continue"), (12, "-exec-continue"));
        assert_eq!(split_token("3info sharedlibrary"), (3, "info sharedlibrary"));
        assert_eq!(split_token("-gdb-exit"), (0, "-gdb-exit"));
    }

    #[tokio::test]
    async fn test_loopback_records_and_responds() {
        let (mut transport, handle) = LoopbackTransport::with_responder(|line| {
            let (token, _) = split_token(line);
            vec![format!("{}^done", token)]
        });
        let mut events = transport.start().unwrap();
        assert!(transport.start().is_err());

        assert!(transport.send("1-list-features"));
        handle.push_line("~\"hello\"");

        assert_eq!(events.recv().await, Some(TransportEvent::Line("1^done".into())));
        assert_eq!(events.recv().await, Some(TransportEvent::Line("~\"hello\"".into())));
        assert_eq!(handle.sent(), vec!["1-list-features".to_string()]);
    }

    #[tokio::test]
    async fn test_loopback_exit_is_final() {
        let (mut transport, handle) = LoopbackTransport::new();
        let mut events = transport.start().unwrap();

        handle.exit(Some(0));
        handle.exit(Some(1));
        handle.push_line("^done");

        assert!(!transport.send("1-exec-run"));
        assert_eq!(events.recv().await, Some(TransportEvent::Exited(Some(0))));
        assert!(events.try_recv().is_err());
        assert!(handle.sent().is_empty());
    }
}
