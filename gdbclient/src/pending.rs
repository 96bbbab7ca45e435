/// Pending-command table
///
/// Maps an outstanding token to the command it was issued for, the channel
/// its reply goes to, and any console output collected while it waited.

use std::collections::BTreeMap;
use tokio::sync::oneshot;

use crate::types::{ResultRecord, StreamRecord};

/// Prefix that marks a formal MI command
pub const MI_COMMAND_PREFIX: char = '-';

#[derive(Debug)]
pub struct PendingCommand {
    pub token: u32,
    pub command: String,
    reply: Option<oneshot::Sender<ResultRecord>>,
    buffered: Vec<StreamRecord>,
}

impl PendingCommand {
    pub fn new(token: u32, command: impl Into<String>, reply: Option<oneshot::Sender<ResultRecord>>) -> Self {
        Self {
            token,
            command: command.into(),
            reply,
            buffered: Vec::new(),
        }
    }

    /// CLI-style commands get no token correlation for their output
    pub fn is_cli(&self) -> bool {
        !self.command.trim_start().starts_with(MI_COMMAND_PREFIX)
    }

    pub fn buffered(&self) -> &[StreamRecord] {
        &self.buffered
    }

    /// Attach the buffered output and hand the record to whoever waits for it.
    ///
    /// Returns false when nobody was listening.
    pub fn complete(self, mut record: ResultRecord) -> bool {
        let mut output = self.buffered;
        output.append(&mut record.output);
        record.output = output;

        match self.reply {
            Some(reply) => reply.send(record).is_ok(),
            None => false,
        }
    }
}

/// Table of commands awaiting their result record.
///
/// Once closed it refuses new entries, so nothing can be left waiting on a
/// session that already went away.
#[derive(Debug, Default)]
pub struct PendingTable {
    entries: BTreeMap<u32, PendingCommand>,
    closed: bool,
}

impl PendingTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a command; hands it back if the token is taken or the table is closed
    pub fn insert(&mut self, command: PendingCommand) -> Result<(), PendingCommand> {
        if self.closed || command.token == 0 || self.entries.contains_key(&command.token) {
            return Err(command);
        }
        self.entries.insert(command.token, command);
        Ok(())
    }

    /// Remove the entry for `token`; token 0 never matches
    pub fn take(&mut self, token: u32) -> Option<PendingCommand> {
        if token == 0 {
            return None;
        }
        self.entries.remove(&token)
    }

    /// Copy a stream record onto every pending CLI command. Returns how many got it.
    pub fn buffer_stream(&mut self, record: &StreamRecord) -> usize {
        let mut count = 0;
        for command in self.entries.values_mut().filter(|c| c.is_cli()) {
            command.buffered.push(record.clone());
            count += 1;
        }
        count
    }

    pub fn contains(&self, token: u32) -> bool {
        self.entries.contains_key(&token)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// Close the table and return everything still pending
    pub fn close(&mut self) -> Vec<PendingCommand> {
        self.closed = true;
        std::mem::take(&mut self.entries).into_values().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Fields, ResultClass, StreamKind};

    fn console(text: &str) -> StreamRecord {
        StreamRecord {
            kind: StreamKind::Console,
            text: text.to_string(),
        }
    }

    fn done(token: u32) -> ResultRecord {
        ResultRecord {
            token,
            class: ResultClass::Done,
            fields: Fields::new(),
            output: Vec::new(),
        }
    }

    #[test]
    fn test_cli_detection() {
        assert!(PendingCommand::new(1, "info sharedlibrary", None).is_cli());
        assert!(PendingCommand::new(2, "kill", None).is_cli());
        assert!(!PendingCommand::new(3, "-exec-continue", None).is_cli());
    }

    #[test]
    fn test_insert_rejects_duplicates_and_zero() {
        let mut table = PendingTable::new();
        assert!(table.insert(PendingCommand::new(1, "-a", None)).is_ok());
        assert!(table.insert(PendingCommand::new(1, "-b", None)).is_err());
        assert!(table.insert(PendingCommand::new(0, "-c", None)).is_err());
        assert_eq!(table.len(), 1);
        assert!(table.take(0).is_none());
    }

    #[test]
    fn test_stream_fan_out_only_reaches_cli_commands() {
        let mut table = PendingTable::new();
        table.insert(PendingCommand::new(1, "info threads", None)).unwrap();
        table.insert(PendingCommand::new(2, "-thread-info", None)).unwrap();
        table.insert(PendingCommand::new(3, "info sharedlibrary", None)).unwrap();

        assert_eq!(table.buffer_stream(&console("line one\n")), 2);
        assert_eq!(table.buffer_stream(&console("line two\n")), 2);

        assert_eq!(table.take(1).unwrap().buffered().len(), 2);
        assert!(table.take(2).unwrap().buffered().is_empty());
        let third = table.take(3).unwrap();
        assert_eq!(third.buffered()[0].text, "line one\n");
        assert_eq!(third.buffered()[1].text, "line two\n");
    }

    #[test]
    fn test_complete_splices_output_in_order() {
        let (tx, mut rx) = oneshot::channel();
        let mut command = PendingCommand::new(4, "info registers", Some(tx));
        command.buffered.push(console("first"));
        command.buffered.push(console("second"));

        assert!(command.complete(done(4)));
        let record = rx.try_recv().unwrap();
        let texts: Vec<_> = record.output.iter().map(|s| s.text.as_str()).collect();
        assert_eq!(texts, vec!["first", "second"]);
    }

    #[test]
    fn test_closed_table_refuses_entries() {
        let mut table = PendingTable::new();
        table.insert(PendingCommand::new(1, "-a", None)).unwrap();
        table.insert(PendingCommand::new(2, "-b", None)).unwrap();

        let drained = table.close();
        assert_eq!(drained.len(), 2);
        assert!(table.is_empty());
        assert!(table.is_closed());
        assert!(table.insert(PendingCommand::new(3, "-c", None)).is_err());
    }
}
