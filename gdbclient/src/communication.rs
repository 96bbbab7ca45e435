/// Communication layer for GDB/MI protocol
///
/// This module handles the low-level correlation with GDB: token allocation,
/// command submission, and matching inbound result records to the command
/// that is waiting for them.

use std::sync::{Arc, Mutex};
use tokio::sync::oneshot;

use crate::parser::parse_record;
use crate::pending::{PendingCommand, PendingTable};
use crate::transport::Transport;
use crate::types::{AsyncRecord, Record, ResultRecord, StreamRecord};
use crate::{lock, GdbError, Result};

/// A parsed line that the dispatcher did not consume itself
#[derive(Debug, Clone, PartialEq)]
pub enum Inbound {
    /// Zero-token result record
    Result(ResultRecord),
    Async(AsyncRecord),
    /// Stream record, already buffered onto pending CLI commands
    Stream(StreamRecord),
    Prompt,
}

/// Handle to the eventual reply of one issued command
#[derive(Debug)]
pub struct PendingReply {
    token: u32,
    pub(crate) receiver: oneshot::Receiver<ResultRecord>,
}

impl PendingReply {
    /// Token the command went out with; 0 when it was never sent
    pub fn token(&self) -> u32 {
        self.token
    }

    /// Wait for the result record; `Exited` if the session went away first
    pub async fn wait(self) -> Result<ResultRecord> {
        self.receiver.await.map_err(|_| GdbError::Exited)
    }
}

/// Allocates tokens, registers pending commands and routes result records
pub struct Dispatcher {
    transport: Arc<dyn Transport>,
    next_token: Mutex<u32>,
    pending: Mutex<PendingTable>,
}

impl Dispatcher {
    pub fn new(transport: Arc<dyn Transport>) -> Self {
        Self {
            transport,
            next_token: Mutex::new(1),
            pending: Mutex::new(PendingTable::new()),
        }
    }

    /// Send a command and get a handle to its reply
    pub fn issue(&self, command: &str) -> PendingReply {
        let (sender, receiver) = oneshot::channel();
        let token = self.submit(command, Some(sender));
        PendingReply { token, receiver }
    }

    /// Send a command whose reply nobody waits for. Returns its token, 0 if not sent.
    pub fn issue_detached(&self, command: &str) -> u32 {
        self.submit(command, None)
    }

    fn submit(&self, command: &str, reply: Option<oneshot::Sender<ResultRecord>>) -> u32 {
        // Holding the counter across insert and write keeps tokens unique and
        // puts lines on the wire in token order.
        let mut next_token = lock(&self.next_token);
        let mut pending = lock(&self.pending);
        if pending.is_closed() {
            log::warn!("SEND[0]: session closed, dropping '{}'", command);
            return 0;
        }

        // After wraparound, skip tokens whose commands are still outstanding.
        let mut token = *next_token;
        while token == 0 || pending.contains(token) {
            token = token.wrapping_add(1);
        }
        if let Err(rejected) = pending.insert(PendingCommand::new(token, command, reply)) {
            log::warn!("SEND[{}]: could not register '{}'", token, rejected.command);
            return 0;
        }
        drop(pending);

        let line = format!("{}{}", token, command);
        log::debug!("SEND[{}]: {}", token, line);
        if !self.transport.send(&line) {
            // The entry stays until the exit drains the table.
            log::debug!("SEND[{}]: transport not accepting input", token);
        }

        *next_token = token.wrapping_add(1).max(1);
        token
    }

    /// Parse one line and consume it if it answers a pending command
    pub fn route_line(&self, line: &str) -> Result<Option<Inbound>> {
        let record = parse_record(line)?;

        match record {
            Record::Stream(stream) => {
                let count = lock(&self.pending).buffer_stream(&stream);
                if count > 0 {
                    log::trace!("RECV[0]: stream buffered onto {} CLI command(s)", count);
                }
                Ok(Some(Inbound::Stream(stream)))
            }
            Record::Result(result) if result.token != 0 => {
                let token = result.token;
                // Removed before delivery so a failing receiver cannot leave the entry behind.
                let entry = lock(&self.pending).take(token);
                match entry {
                    Some(command) => {
                        log::debug!("RECV[{}]: Result -> class={:?} for '{}'", token, result.class, command.command);
                        if !command.complete(result) {
                            log::debug!("RECV[{}]: nobody waiting for the reply", token);
                        }
                        Ok(None)
                    }
                    None => Err(GdbError::UnknownToken(token)),
                }
            }
            Record::Result(result) => Ok(Some(Inbound::Result(result))),
            Record::Async(record) => Ok(Some(Inbound::Async(record))),
            Record::Prompt => Ok(Some(Inbound::Prompt)),
        }
    }

    /// Refuse further commands and drop every pending reply sender.
    ///
    /// Waiters observe `Exited`. Returns how many were released.
    pub fn close(&self) -> usize {
        let drained = lock(&self.pending).close();
        for command in &drained {
            log::debug!("RECV[{}]: released '{}' on exit", command.token, command.command);
        }
        drained.len()
    }

    pub fn is_closed(&self) -> bool {
        lock(&self.pending).is_closed()
    }

    pub fn pending_count(&self) -> usize {
        lock(&self.pending).len()
    }

    pub fn transport(&self) -> &Arc<dyn Transport> {
        &self.transport
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::{LoopbackHandle, LoopbackTransport};
    use crate::types::{ResultClass, StreamKind};

    fn dispatcher() -> (Dispatcher, LoopbackHandle) {
        let (transport, handle) = LoopbackTransport::new();
        (Dispatcher::new(Arc::new(transport)), handle)
    }

    #[test]
    fn test_tokens_start_at_one_and_prefix_the_line() {
        let (dispatcher, handle) = dispatcher();
        let first = dispatcher.issue("-exec-continue");
        let second = dispatcher.issue_detached("info threads");

        assert_eq!(first.token(), 1);
        assert_eq!(second, 2);
        assert_eq!(handle.sent(), vec!["1-exec-continue", "2info threads"]);
        assert_eq!(dispatcher.pending_count(), 2);
    }

    #[tokio::test]
    async fn test_result_resolves_matching_reply_once() {
        let (dispatcher, _handle) = dispatcher();
        let reply = dispatcher.issue("-data-evaluate-expression x");

        assert_eq!(dispatcher.route_line("1^done,value=\"5\"").unwrap(), None);
        let record = reply.wait().await.unwrap();
        assert_eq!(record.class, ResultClass::Done);
        assert_eq!(record.fields.get_str("value"), Some("5"));

        // A double reply finds nothing.
        assert!(matches!(
            dispatcher.route_line("1^done"),
            Err(GdbError::UnknownToken(1))
        ));
    }

    #[tokio::test]
    async fn test_cli_output_is_spliced_before_result_output() {
        let (dispatcher, _handle) = dispatcher();
        let cli = dispatcher.issue("info sharedlibrary");
        let mi = dispatcher.issue("-thread-info");

        let routed = dispatcher.route_line("~\"From To Syms Read\\n\"").unwrap();
        assert!(matches!(routed, Some(Inbound::Stream(_))));
        dispatcher.route_line("~\"0x1000 0x2000 Yes /system/lib/libc.so\\n\"").unwrap();
        dispatcher.route_line("2^done").unwrap();
        dispatcher.route_line("1^done").unwrap();

        let cli = cli.wait().await.unwrap();
        assert_eq!(cli.output.len(), 2);
        assert_eq!(cli.output[0].kind, StreamKind::Console);
        assert_eq!(cli.output_text(), "From To Syms Read\n0x1000 0x2000 Yes /system/lib/libc.so\n");
        assert!(mi.wait().await.unwrap().output.is_empty());
    }

    #[test]
    fn test_unsolicited_records_are_forwarded() {
        let (dispatcher, _handle) = dispatcher();
        assert!(matches!(dispatcher.route_line("^done"), Ok(Some(Inbound::Result(_)))));
        assert!(matches!(
            dispatcher.route_line("*running,thread-id=\"all\""),
            Ok(Some(Inbound::Async(_)))
        ));
        assert_eq!(dispatcher.route_line("(gdb)").unwrap(), Some(Inbound::Prompt));
        assert!(matches!(
            dispatcher.route_line("not mi"),
            Err(GdbError::MalformedRecord { .. })
        ));
    }

    #[tokio::test]
    async fn test_close_releases_waiters_and_refuses_new_commands() {
        let (dispatcher, handle) = dispatcher();
        let reply = dispatcher.issue("-exec-continue");

        assert_eq!(dispatcher.close(), 1);
        assert!(matches!(reply.wait().await, Err(GdbError::Exited)));

        let late = dispatcher.issue("-exec-interrupt");
        assert_eq!(late.token(), 0);
        assert!(matches!(late.wait().await, Err(GdbError::Exited)));
        assert_eq!(handle.sent(), vec!["1-exec-continue"]);
    }

    #[tokio::test]
    async fn test_dropped_reply_leaves_table_consistent() {
        let (dispatcher, _handle) = dispatcher();
        drop(dispatcher.issue("-stack-list-frames"));
        assert_eq!(dispatcher.pending_count(), 1);

        assert_eq!(dispatcher.route_line("1^done").unwrap(), None);
        assert_eq!(dispatcher.pending_count(), 0);

        let next = dispatcher.issue("-thread-info");
        assert_eq!(next.token(), 2);
        dispatcher.route_line("2^done").unwrap();
        assert_eq!(next.wait().await.unwrap().class, ResultClass::Done);
        assert_eq!(dispatcher.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_wrapped_token_skips_outstanding_commands() {
        let (dispatcher, handle) = dispatcher();
        let long_running = dispatcher.issue("-target-download");
        *lock(&dispatcher.next_token) = u32::MAX;

        let last = dispatcher.issue_detached("-thread-info");
        let wrapped = dispatcher.issue("-stack-list-frames");
        assert_eq!(last, u32::MAX);
        assert_eq!(wrapped.token(), 2);
        assert_eq!(dispatcher.pending_count(), 3);
        assert_eq!(handle.sent().last().map(String::as_str), Some("2-stack-list-frames"));

        dispatcher.route_line("1^done").unwrap();
        dispatcher.route_line("2^done").unwrap();
        assert!(long_running.wait().await.is_ok());
        assert!(wrapped.wait().await.is_ok());
    }

    #[tokio::test]
    async fn test_send_after_transport_exit_does_not_fail() {
        let (dispatcher, handle) = dispatcher();
        handle.exit(Some(0));

        let reply = dispatcher.issue("-gdb-exit");
        assert_eq!(reply.token(), 1);
        assert!(handle.sent().is_empty());
        dispatcher.close();
        assert!(matches!(reply.wait().await, Err(GdbError::Exited)));
    }
}
