/// Interrupt coordination
///
/// Lets any number of callers require the target to be stopped while they
/// work. The first caller of an episode interrupts a running target; the
/// last one out decides whether to resume it, and only if this episode did
/// the interrupting.

use std::future::Future;

use crate::session::Session;
use crate::{lock, GdbError, Result};

/// Shared nesting state of the current interrupt episode
#[derive(Debug, Default)]
pub(crate) struct InterruptState {
    depth: usize,
    /// The episode's opener found the target running and interrupted it
    interrupted: bool,
}

impl InterruptState {
    pub(crate) fn in_flight(&self) -> bool {
        self.depth > 0
    }
}

/// One caller's claim on a stopped target. Dropping it releases the claim.
pub struct InterruptTicket {
    session: Session,
    resume_after: bool,
}

impl Session {
    /// Join the current interrupt episode, opening one if there is none
    pub fn interrupt_ticket(&self, resume_after: bool) -> InterruptTicket {
        let shared = &self.inner;
        let mut state = lock(&shared.interrupts);

        if state.depth == 0 {
            state.interrupted = false;
            if shared.router.is_running() {
                let token = shared.dispatcher.issue_detached(&shared.config.interrupt_command);
                log::debug!("SEND[{}]: interrupting running target", token);
                state.interrupted = true;
            }
        }
        state.depth += 1;
        log::trace!("Interrupt depth now {}", state.depth);

        InterruptTicket {
            session: self.clone(),
            resume_after,
        }
    }

    /// Run `op` with the target stopped, resuming it afterwards if this
    /// episode stopped it and this caller is the last one out with
    /// `resume_after` set.
    pub async fn with_target_stopped<F, Fut, T>(&self, resume_after: bool, op: F) -> Result<T>
    where
        F: FnOnce(Session) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let ticket = self.interrupt_ticket(resume_after);
        ticket.wait_stopped().await?;
        let result = op(self.clone()).await;
        drop(ticket);
        result
    }
}

impl InterruptTicket {
    /// Wait until the run state reports the target stopped
    pub async fn wait_stopped(&self) -> Result<()> {
        let shared = &self.session.inner;
        let mut running = shared.router.subscribe_running();
        let mut closed = shared.closed.subscribe();
        let timeout = shared.config.interrupt_timeout();

        tokio::select! {
            biased;
            stopped = running.wait_for(|running| !*running) => {
                stopped.map(|_| ()).map_err(|_| GdbError::Exited)
            }
            _ = closed.wait_for(|closed| *closed) => Err(GdbError::Exited),
            _ = tokio::time::sleep(timeout) => {
                log::warn!("Target did not stop within {:?}", timeout);
                Err(GdbError::Timeout {
                    command: shared.config.interrupt_command.clone(),
                    timeout,
                })
            }
        }
    }
}

impl Drop for InterruptTicket {
    fn drop(&mut self) {
        let shared = &self.session.inner;
        let mut state = lock(&shared.interrupts);
        state.depth = state.depth.saturating_sub(1);
        log::trace!("Interrupt depth now {}", state.depth);

        if state.depth == 0 {
            if state.interrupted && self.resume_after {
                let token = shared.dispatcher.issue_detached(&shared.config.resume_command);
                log::debug!("SEND[{}]: resuming target after interrupt", token);
            } else if state.interrupted {
                log::debug!("Leaving target stopped after interrupt");
            }
            state.interrupted = false;
        }
    }
}
