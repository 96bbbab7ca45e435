/// Process management for GDB
///
/// This module launches the GDB backend with piped stdio and exposes it as a
/// [`Transport`]: a writer task owns stdin, reader tasks forward stdout and
/// stderr lines, and a waiter task reports the exit.

use std::io;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWriteExt, BufReader};
use tokio::process::{ChildStdin, Command};
use tokio::sync::{mpsc, oneshot};

use crate::config::SessionConfig;
use crate::lock;
use crate::transport::{Transport, TransportEvent};

/// How long output may keep flowing after GDB exits. A debuggee that
/// inherited GDB's stdout can hold the pipe open indefinitely.
const OUTPUT_DRAIN_GRACE: Duration = Duration::from_millis(250);

pub struct ProcessTransport {
    program: std::path::PathBuf,
    args: Vec<String>,
    writer: Mutex<Option<mpsc::UnboundedSender<String>>>,
    kill: Mutex<Option<oneshot::Sender<()>>>,
    alive: Arc<AtomicBool>,
}

impl ProcessTransport {
    pub fn new(config: &SessionConfig) -> Self {
        Self {
            program: config.gdb_path.clone(),
            args: config.gdb_args.clone(),
            writer: Mutex::new(None),
            kill: Mutex::new(None),
            alive: Arc::new(AtomicBool::new(false)),
        }
    }

    async fn write_lines(mut stdin: ChildStdin, mut lines: mpsc::UnboundedReceiver<String>) {
        while let Some(line) = lines.recv().await {
            let framed = format!("{}\n", line);
            if let Err(e) = stdin.write_all(framed.as_bytes()).await {
                log::error!("GDB stdin write error: {}", e);
                break;
            }
            if let Err(e) = stdin.flush().await {
                log::error!("GDB stdin flush error: {}", e);
                break;
            }
        }
        log::debug!("GDB stdin writer finished");
    }

    async fn read_lines<R, F>(stream: R, name: &'static str, events: mpsc::UnboundedSender<TransportEvent>, wrap: F)
    where
        R: AsyncRead + Unpin,
        F: Fn(String) -> TransportEvent,
    {
        log::debug!("GDB {} reader started", name);
        let mut reader = BufReader::new(stream);
        let mut line = String::new();

        loop {
            line.clear();
            match reader.read_line(&mut line).await {
                Ok(0) => {
                    log::debug!("GDB {}: EOF reached", name);
                    break;
                }
                Ok(_) => {
                    let trimmed = line.trim_end();
                    if !trimmed.is_empty() && events.send(wrap(trimmed.to_string())).is_err() {
                        break;
                    }
                }
                Err(e) => {
                    log::error!("GDB {} read error: {}", name, e);
                    break;
                }
            }
        }
        log::debug!("GDB {} reader finished", name);
    }
}

impl Transport for ProcessTransport {
    fn start(&mut self) -> io::Result<mpsc::UnboundedReceiver<TransportEvent>> {
        if self.is_alive() {
            return Err(io::Error::new(io::ErrorKind::AlreadyExists, "GDB already running"));
        }

        log::debug!("Starting GDB process: {} {:?}", self.program.display(), self.args);

        let mut child = Command::new(&self.program)
            .args(&self.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()?;

        log::debug!("GDB process started with PID: {:?}", child.id());

        let missing = |what: &str| io::Error::new(io::ErrorKind::BrokenPipe, format!("Failed to get {} handle", what));
        let stdin = child.stdin.take().ok_or_else(|| missing("stdin"))?;
        let stdout = child.stdout.take().ok_or_else(|| missing("stdout"))?;
        let stderr = child.stderr.take().ok_or_else(|| missing("stderr"))?;

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (lines_tx, lines_rx) = mpsc::unbounded_channel();
        let (kill_tx, kill_rx) = oneshot::channel::<()>();

        tokio::spawn(Self::write_lines(stdin, lines_rx));
        let mut stdout_task = tokio::spawn(Self::read_lines(stdout, "stdout", events_tx.clone(), TransportEvent::Line));
        let mut stderr_task = tokio::spawn(Self::read_lines(stderr, "stderr", events_tx.clone(), TransportEvent::Stderr));

        let alive = self.alive.clone();
        alive.store(true, Ordering::SeqCst);

        tokio::spawn(async move {
            let status = tokio::select! {
                status = child.wait() => status,
                _ = kill_rx => {
                    log::debug!("Killing GDB process");
                    if let Err(e) = child.kill().await {
                        log::warn!("Failed to kill GDB: {}", e);
                    }
                    child.wait().await
                }
            };
            alive.store(false, Ordering::SeqCst);

            // Let the last output lines through before reporting the exit.
            let drained = tokio::time::timeout(OUTPUT_DRAIN_GRACE, async {
                let _ = (&mut stdout_task).await;
                let _ = (&mut stderr_task).await;
            })
            .await;
            if drained.is_err() {
                log::warn!("GDB output still open {:?} after exit, abandoning readers", OUTPUT_DRAIN_GRACE);
                stdout_task.abort();
                stderr_task.abort();
            }

            let code = match status {
                Ok(status) => status.code(),
                Err(e) => {
                    log::error!("Failed to wait for GDB: {}", e);
                    None
                }
            };
            log::info!("GDB process exited with code {:?}", code);
            let _ = events_tx.send(TransportEvent::Exited(code));
        });

        *lock(&self.writer) = Some(lines_tx);
        *lock(&self.kill) = Some(kill_tx);

        Ok(events_rx)
    }

    fn send(&self, line: &str) -> bool {
        if !self.is_alive() {
            return false;
        }
        match lock(&self.writer).as_ref() {
            Some(writer) => writer.send(line.to_string()).is_ok(),
            None => false,
        }
    }

    fn is_alive(&self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }

    fn dispose(&self) {
        lock(&self.writer).take();
        if let Some(kill) = lock(&self.kill).take() {
            let _ = kill.send(());
        }
    }
}

impl Drop for ProcessTransport {
    fn drop(&mut self) {
        self.dispose();
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    fn config(program: &str, args: &[&str]) -> SessionConfig {
        SessionConfig {
            gdb_path: program.into(),
            gdb_args: args.iter().map(|a| a.to_string()).collect(),
            ..SessionConfig::default()
        }
    }

    #[tokio::test]
    async fn test_lines_then_exit() {
        let mut transport = ProcessTransport::new(&config("sh", &["-c", "echo '^done'; echo oops >&2; exit 3"]));
        let mut events = transport.start().unwrap();

        let mut seen = Vec::new();
        while let Some(event) = events.recv().await {
            let last = matches!(event, TransportEvent::Exited(_));
            seen.push(event);
            if last {
                break;
            }
        }

        assert!(seen.contains(&TransportEvent::Line("^done".into())));
        assert!(seen.contains(&TransportEvent::Stderr("oops".into())));
        assert_eq!(seen.last(), Some(&TransportEvent::Exited(Some(3))));
        assert!(!transport.is_alive());
        assert!(!transport.send("1-gdb-exit"));
    }

    #[tokio::test]
    async fn test_send_reaches_stdin_and_dispose_kills() {
        let mut transport = ProcessTransport::new(&config("cat", &[]));
        let mut events = transport.start().unwrap();

        assert!(transport.send("1-list-features"));
        assert_eq!(events.recv().await, Some(TransportEvent::Line("1-list-features".into())));

        transport.dispose();
        loop {
            match events.recv().await {
                Some(TransportEvent::Exited(_)) => break,
                Some(_) => continue,
                None => panic!("event stream closed without exit"),
            }
        }
        assert!(!transport.send("2-gdb-exit"));
    }

    #[tokio::test]
    async fn test_exit_reported_while_grandchild_holds_stdout() {
        let mut transport = ProcessTransport::new(&config("sh", &["-c", "echo '^done'; sleep 5 & exit 0"]));
        let mut events = transport.start().unwrap();
        let start = std::time::Instant::now();

        let mut seen = Vec::new();
        while let Some(event) = events.recv().await {
            let last = matches!(event, TransportEvent::Exited(_));
            seen.push(event);
            if last {
                break;
            }
        }

        assert!(start.elapsed() < Duration::from_secs(2), "{:?}", start.elapsed());
        assert_eq!(seen.first(), Some(&TransportEvent::Line("^done".into())));
        assert_eq!(seen.last(), Some(&TransportEvent::Exited(Some(0))));
    }

    #[tokio::test]
    async fn test_session_waiter_released_while_grandchild_holds_stdout() {
        let transport = ProcessTransport::new(&config("sh", &["-c", "sleep 5 & sleep 0.2; exit 0"]));
        let session = crate::session::Session::attach(transport, SessionConfig::default()).unwrap();
        let start = std::time::Instant::now();

        let result = session
            .send_synchronous("-exec-continue", Duration::from_millis(5000))
            .await;

        assert!(matches!(result, Err(crate::GdbError::Exited)));
        assert!(start.elapsed() < Duration::from_secs(2), "{:?}", start.elapsed());
    }

    #[test]
    fn test_missing_binary_fails_to_start() {
        let runtime = tokio::runtime::Runtime::new().unwrap();
        let _guard = runtime.enter();
        let mut transport = ProcessTransport::new(&config("/nonexistent/gdb-multiarch", &[]));
        assert!(transport.start().is_err());
        assert!(!transport.is_alive());
    }
}
