use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Mutex, PoisonError};

use sysinfo::{Pid, ProcessesToUpdate, Signal, System};
use tracing::debug;

/// Signals the supervisor sends while tearing down a process tree.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TreeSignal {
    /// Ask the process to exit (SIGTERM on Unix).
    Terminate,
    /// Unconditional kill (SIGKILL on Unix, TerminateProcess on Windows).
    Kill,
}

/// Host capability used by the supervisor to find and signal the helper
/// processes the imaging executable spawns.
pub trait ProcessTree: Send + Sync {
    /// Returns every live descendant of `pid`, children before grandchildren.
    fn descendants(&self, pid: u32) -> Vec<u32>;

    /// Sends `signal` to `pid`. Returns `false` if the process does not exist
    /// or the signal could not be delivered.
    fn signal(&self, pid: u32, signal: TreeSignal) -> bool;

    /// Returns whether `pid` is still running (zombies count as gone).
    fn is_alive(&self, pid: u32) -> bool;
}

/// [`ProcessTree`] backed by the `sysinfo` process table.
pub struct SysinfoTree {
    sys: Mutex<System>,
}

impl SysinfoTree {
    pub fn new() -> Self {
        Self {
            sys: Mutex::new(System::new()),
        }
    }
}

impl Default for SysinfoTree {
    fn default() -> Self {
        Self::new()
    }
}

impl ProcessTree for SysinfoTree {
    fn descendants(&self, pid: u32) -> Vec<u32> {
        let mut sys = self.sys.lock().unwrap_or_else(PoisonError::into_inner);
        sys.refresh_processes(ProcessesToUpdate::All, true);

        // Threads show up in the table on Linux; they are signalled with
        // their owning process and must not be counted as children.
        let threads: HashSet<Pid> = sys
            .processes()
            .iter()
            .filter_map(|(owner, p)| p.tasks().map(|tasks| (owner, tasks)))
            .flat_map(|(owner, tasks)| tasks.iter().filter(move |t| *t != owner).copied())
            .collect();

        let mut children: HashMap<Pid, Vec<Pid>> = HashMap::new();
        for (child, process) in sys.processes() {
            if threads.contains(child) {
                continue;
            }
            if let Some(parent) = process.parent() {
                children.entry(parent).or_default().push(*child);
            }
        }

        let mut found = Vec::new();
        let mut queue = VecDeque::from([Pid::from_u32(pid)]);
        while let Some(next) = queue.pop_front() {
            for child in children.get(&next).into_iter().flatten() {
                found.push(child.as_u32());
                queue.push_back(*child);
            }
        }
        debug!(pid, count = found.len(), "enumerated process tree");
        found
    }

    fn signal(&self, pid: u32, signal: TreeSignal) -> bool {
        let mut sys = self.sys.lock().unwrap_or_else(PoisonError::into_inner);
        let target = Pid::from_u32(pid);
        sys.refresh_processes(ProcessesToUpdate::Some(&[target]), true);
        let Some(process) = sys.process(target) else {
            return false;
        };
        match signal {
            // Platforms without SIGTERM fall back to a plain kill.
            TreeSignal::Terminate => process
                .kill_with(Signal::Term)
                .unwrap_or_else(|| process.kill()),
            TreeSignal::Kill => process.kill(),
        }
    }

    fn is_alive(&self, pid: u32) -> bool {
        let mut sys = self.sys.lock().unwrap_or_else(PoisonError::into_inner);
        let target = Pid::from_u32(pid);
        sys.refresh_processes(ProcessesToUpdate::Some(&[target]), true);
        sys.process(target)
            .is_some_and(|p| p.status() != sysinfo::ProcessStatus::Zombie)
    }
}
