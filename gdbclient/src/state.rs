/// Run-state model
///
/// Tracks whether the debuggee is running, per-thread run state, the current
/// thread, thread groups and loaded modules. Only the event router mutates it.

use serde::Serialize;
use std::collections::{BTreeMap, HashMap};

use crate::types::Fields;

/// Which threads a `*running` record covers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThreadScope {
    All,
    Thread(u32),
}

/// Which threads a `*stopped` record covers
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoppedThreads {
    All,
    List(Vec<u32>),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ThreadInfo {
    pub id: u32,
    pub group_id: String,
    pub running: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ThreadGroup {
    pub id: String,
    pub pid: Option<u32>,
    /// Last known exit code, 0 until the group exits
    pub exit_code: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Module {
    pub name: String,
    pub metadata: Fields,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct RunState {
    running: bool,
    threads: BTreeMap<u32, ThreadInfo>,
    current_thread: Option<u32>,
    groups: HashMap<String, ThreadGroup>,
    modules: BTreeMap<String, Module>,
    exit_reported: bool,
}

impl RunState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_running(&self) -> bool {
        self.running
    }

    pub fn current_thread(&self) -> Option<u32> {
        self.current_thread
    }

    pub fn thread(&self, id: u32) -> Option<&ThreadInfo> {
        self.threads.get(&id)
    }

    pub fn threads(&self) -> impl Iterator<Item = &ThreadInfo> {
        self.threads.values()
    }

    pub fn group(&self, id: &str) -> Option<&ThreadGroup> {
        self.groups.get(id)
    }

    pub fn modules(&self) -> impl Iterator<Item = &Module> {
        self.modules.values()
    }

    pub fn set_running(&mut self, scope: ThreadScope) {
        self.running = true;
        match scope {
            ThreadScope::All => {
                for thread in self.threads.values_mut() {
                    thread.running = true;
                }
            }
            ThreadScope::Thread(id) => {
                if let Some(thread) = self.threads.get_mut(&id) {
                    thread.running = true;
                }
                self.current_thread = Some(id);
            }
        }
    }

    pub fn set_stopped(&mut self, thread_id: Option<u32>, stopped: StoppedThreads) {
        self.running = false;
        if let Some(id) = thread_id {
            self.current_thread = Some(id);
            if let Some(thread) = self.threads.get_mut(&id) {
                thread.running = false;
            }
        }
        match stopped {
            StoppedThreads::All => {
                for thread in self.threads.values_mut() {
                    thread.running = false;
                }
            }
            StoppedThreads::List(ids) => {
                for id in ids {
                    if let Some(thread) = self.threads.get_mut(&id) {
                        thread.running = false;
                    }
                }
            }
        }
    }

    /// `thread-group-added` / `thread-group-started`
    pub fn group_started(&mut self, id: &str, pid: Option<u32>) {
        let group = self.groups.entry(id.to_string()).or_insert_with(|| ThreadGroup {
            id: id.to_string(),
            pid: None,
            exit_code: 0,
        });
        group.exit_code = 0;
        if pid.is_some() {
            group.pid = pid;
        }
    }

    /// A new program run begins; the next exit is reported again
    pub fn run_started(&mut self) {
        self.exit_reported = false;
    }

    /// `thread-group-removed` / `thread-group-exited`
    pub fn group_exited(&mut self, id: &str, exit_code: Option<u32>) {
        let group = self.groups.entry(id.to_string()).or_insert_with(|| ThreadGroup {
            id: id.to_string(),
            pid: None,
            exit_code: 0,
        });
        if let Some(code) = exit_code {
            group.exit_code = code;
        }
    }

    pub fn thread_created(&mut self, id: u32, group_id: &str) {
        self.threads.insert(
            id,
            ThreadInfo {
                id,
                group_id: group_id.to_string(),
                running: self.running,
            },
        );
    }

    /// Remove a thread and return the exit code inherited from its group
    pub fn thread_exited(&mut self, id: u32, group_id: Option<&str>) -> u32 {
        let removed = self.threads.remove(&id);
        if self.current_thread == Some(id) {
            self.current_thread = None;
        }
        let group_id = group_id
            .map(str::to_string)
            .or_else(|| removed.map(|t| t.group_id));
        group_id
            .and_then(|g| self.groups.get(&g))
            .map(|g| g.exit_code)
            .unwrap_or(0)
    }

    pub fn select_thread(&mut self, id: u32) {
        self.current_thread = Some(id);
    }

    pub fn add_module(&mut self, name: &str, metadata: Fields) {
        self.modules.insert(
            name.to_string(),
            Module {
                name: name.to_string(),
                metadata,
            },
        );
    }

    pub fn remove_module(&mut self, name: &str) -> bool {
        self.modules.remove(name).is_some()
    }

    /// Record that the program exit was reported. False if it already was.
    pub fn mark_exit_reported(&mut self) -> bool {
        !std::mem::replace(&mut self.exit_reported, true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn state_with_threads() -> RunState {
        let mut state = RunState::new();
        state.group_started("i1", Some(4242));
        state.thread_created(1, "i1");
        state.thread_created(2, "i1");
        state.thread_created(3, "i1");
        state
    }

    #[test]
    fn test_initially_stopped() {
        let state = RunState::new();
        assert!(!state.is_running());
        assert_eq!(state.current_thread(), None);
    }

    #[test]
    fn test_running_all_then_stopped_all() {
        let mut state = state_with_threads();
        state.set_running(ThreadScope::All);
        assert!(state.is_running());
        assert!(state.threads().all(|t| t.running));

        state.set_stopped(Some(2), StoppedThreads::All);
        assert!(!state.is_running());
        assert_eq!(state.current_thread(), Some(2));
        assert!(state.threads().all(|t| !t.running));
    }

    #[test]
    fn test_specific_thread_does_not_touch_others() {
        let mut state = state_with_threads();
        state.set_running(ThreadScope::Thread(2));
        assert!(state.is_running());
        assert_eq!(state.current_thread(), Some(2));
        assert!(state.thread(2).unwrap().running);
        assert!(!state.thread(1).unwrap().running);
        assert!(!state.thread(3).unwrap().running);

        state.set_running(ThreadScope::All);
        state.set_stopped(Some(1), StoppedThreads::List(vec![1, 3]));
        assert!(!state.thread(1).unwrap().running);
        assert!(state.thread(2).unwrap().running);
        assert!(!state.thread(3).unwrap().running);
    }

    #[test]
    fn test_thread_exit_inherits_group_code() {
        let mut state = state_with_threads();
        state.group_exited("i1", Some(3));
        assert_eq!(state.thread_exited(1, Some("i1")), 3);
        assert_eq!(state.thread_exited(2, None), 3);
        assert!(state.thread(1).is_none());
        assert_eq!(state.group("i1").unwrap().pid, Some(4242));

        state.group_started("i1", None);
        assert_eq!(state.group("i1").unwrap().exit_code, 0);
        assert_eq!(state.group("i1").unwrap().pid, Some(4242));
    }

    #[test]
    fn test_exit_reported_once_per_run() {
        let mut state = RunState::new();
        assert!(state.mark_exit_reported());
        assert!(!state.mark_exit_reported());
        state.run_started();
        assert!(state.mark_exit_reported());
    }

    #[test]
    fn test_modules() {
        let mut state = RunState::new();
        state.add_module("/system/lib/libc.so", Fields::new());
        assert_eq!(state.modules().count(), 1);
        assert!(state.remove_module("/system/lib/libc.so"));
        assert!(!state.remove_module("/system/lib/libc.so"));
    }
}
