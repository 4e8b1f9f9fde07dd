//! Task table and scheduling state.
//!
//! Cooperative, single-threaded: the executive retires exactly one
//! instruction per Ready PID per rotation, in ascending PID order. This
//! module owns the task records, the pending wake-ups, and the state
//! transitions; the executive drives rotations and emits events.
//!
//! Wake-ups are a lazily-invalidated min-heap rather than an indexed
//! deadline table: an entry fires only if the task is still parked on that
//! exact deadline. Early wakes, kills, and re-blocks (a retried RECV
//! carries its original deadline in the task record) simply leave stale
//! entries behind to decay at expiry time, so nothing ever has to be
//! cancelled.

use std::cmp::Reverse;
use std::collections::{BTreeMap, BinaryHeap};

use log::{debug, warn};

use hsx_abi::MAX_TASKS;

use crate::task::{Pid, TaskRecord, TaskState, WaitReason};

pub struct Scheduler {
    tasks: BTreeMap<Pid, TaskRecord>,
    /// Pending `(deadline, pid)` wake-ups, earliest (then lowest PID) first.
    wakeups: BinaryHeap<Reverse<(u64, Pid)>>,
    /// Completed rotation count, reported by `clock.status`.
    pub rotations: u64,
}

impl Scheduler {
    pub fn new() -> Self {
        Self {
            tasks: BTreeMap::new(),
            wakeups: BinaryHeap::new(),
            rotations: 0,
        }
    }

    /// Lowest unused PID in `1..=MAX_TASKS`, or `None` when the table is
    /// full. PID 0 is the executive.
    pub fn allocate_pid(&self) -> Option<Pid> {
        (1..=MAX_TASKS as Pid).find(|pid| !self.tasks.contains_key(pid))
    }

    pub fn insert(&mut self, task: TaskRecord) {
        debug!("task {} ({}) added", task.pid(), task.app_name);
        self.tasks.insert(task.pid(), task);
    }

    pub fn task(&self, pid: Pid) -> Option<&TaskRecord> {
        self.tasks.get(&pid)
    }

    pub fn task_mut(&mut self, pid: Pid) -> Option<&mut TaskRecord> {
        self.tasks.get_mut(&pid)
    }

    pub fn iter(&self) -> impl Iterator<Item = &TaskRecord> {
        self.tasks.values()
    }

    /// PIDs currently Ready, ascending.
    pub fn ready_pids(&self) -> Vec<Pid> {
        self.tasks
            .values()
            .filter(|t| t.state() == TaskState::Ready)
            .map(|t| t.pid())
            .collect()
    }

    pub fn live_count(&self) -> usize {
        self.tasks.values().filter(|t| t.is_live()).count()
    }

    /// Transition a task, returning `(from, to)` for event emission.
    /// Unknown PIDs are ignored with a warning, mirroring the races the
    /// control plane can produce (kill vs. step).
    pub fn set_state(&mut self, pid: Pid, state: TaskState) -> Option<(TaskState, TaskState)> {
        let Some(task) = self.tasks.get_mut(&pid) else {
            warn!("set_state: no task with PID {pid}, ignoring");
            return None;
        };
        let from = task.state();
        if from == state {
            return None;
        }
        task.set_state(state);
        Some((from, state))
    }

    /// Block a Running task on a mailbox or deadline.
    pub fn block(&mut self, pid: Pid, reason: WaitReason) -> Option<(TaskState, TaskState)> {
        let state = match reason {
            WaitReason::Sleep { .. } => TaskState::Sleeping,
            _ => TaskState::Waiting,
        };
        let transition = self.set_state(pid, state)?;
        let task = self.tasks.get_mut(&pid).expect("transitioned above");
        task.wait = Some(reason);
        if let Some(deadline) = reason.deadline() {
            self.wakeups.push(Reverse((deadline, pid)));
        }
        Some(transition)
    }

    /// Wake a blocked task. A no-op for tasks that are not Waiting or
    /// Sleeping (they may have been killed or already woken). Any wake-up
    /// still queued for the abandoned deadline goes stale and decays.
    pub fn wake(&mut self, pid: Pid) -> Option<(TaskState, TaskState)> {
        match self.tasks.get(&pid).map(|t| t.state()) {
            Some(TaskState::Waiting | TaskState::Sleeping) => {
                self.set_state(pid, TaskState::Ready)
            }
            _ => None,
        }
    }

    /// Tasks whose deadlines expired by `now_ms`, with their wait reasons,
    /// earliest deadline (then lowest PID) first.
    pub fn collect_expired(&mut self, now_ms: u64) -> Vec<(Pid, WaitReason)> {
        let mut due = Vec::new();
        while let Some(&Reverse((deadline, pid))) = self.wakeups.peek() {
            if deadline > now_ms {
                break;
            }
            self.wakeups.pop();
            // An entry only fires while the task is still parked on this
            // exact deadline; anything else is a stale leftover. A retried
            // RECV re-parks on its carried deadline, so duplicates for one
            // live wait collapse to a single wake.
            if due.iter().any(|&(p, _)| p == pid) {
                continue;
            }
            let Some(reason) = self.tasks.get(&pid).and_then(|t| t.wait) else {
                continue;
            };
            if reason.deadline() != Some(deadline) {
                continue;
            }
            due.push((pid, reason));
        }
        if !due.is_empty() {
            debug!("{} deadline wake(s) at {now_ms}ms", due.len());
        }
        due
    }

    pub fn remove(&mut self, pid: Pid) -> Option<TaskRecord> {
        self.tasks.remove(&pid)
    }
}

impl Default for Scheduler {
    fn default() -> Self {
        Self::new()
    }
}
