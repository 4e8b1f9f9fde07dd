//! Task records and the register window.
//!
//! A task's entire CPU state lives inside the arena at `reg_base`; the
//! record here only carries lifecycle bookkeeping. Context switching is a
//! pure pointer retarget — nothing in this module ever copies a register
//! bank.

use hsx_abi::isa::{NUM_REGS, PC_OFFSET, PSW_OFFSET, SP_OFFSET};

use crate::arena::Arena;
use crate::mailbox::Handle;
use crate::session::SessionId;

/// Task identifier. PID 0 is reserved for the executive itself.
pub type Pid = u16;

/// Task lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskState {
    Ready,
    /// Transient, only observable inside a step.
    Running,
    /// Blocked on a mailbox receive or send.
    Waiting,
    /// Blocked on a deadline.
    Sleeping,
    /// Stopped by a debugger (BRK or breakpoint).
    Paused,
    Faulted,
    Exited,
}

impl TaskState {
    pub fn as_str(self) -> &'static str {
        match self {
            TaskState::Ready => "ready",
            TaskState::Running => "running",
            TaskState::Waiting => "waiting",
            TaskState::Sleeping => "sleeping",
            TaskState::Paused => "paused",
            TaskState::Faulted => "faulted",
            TaskState::Exited => "exited",
        }
    }
}

/// Why a task is Waiting or Sleeping, and how to wake it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitReason {
    /// Blocked in MAILBOX_RECV; optional timeout deadline in executive ms.
    Recv {
        handle: Handle,
        deadline: Option<u64>,
    },
    /// Blocked in MAILBOX_SEND under fan-out-block.
    SendBlocked { handle: Handle },
    /// Blocked in EXEC_SLEEP_MS until the deadline.
    Sleep { deadline: u64 },
}

impl WaitReason {
    /// The wake deadline this wait carries, if any. Blocked senders have
    /// none; they wake only on subscriber catch-up.
    pub fn deadline(self) -> Option<u64> {
        match self {
            WaitReason::Recv { deadline, .. } => deadline,
            WaitReason::SendBlocked { .. } => None,
            WaitReason::Sleep { deadline } => Some(deadline),
        }
    }
}

/// Per-task record. CPU state is *not* here — it lives at `reg_base`.
pub struct TaskRecord {
    pid: Pid,
    pub app_name: String,
    /// Source path or transport the image came from.
    pub origin: String,
    state: TaskState,
    pub wait: Option<WaitReason>,
    /// Arena offset of the 16-register window plus PC/SP/PSW.
    pub reg_base: u32,
    /// Start of this task's arena footprint (code segment base). The
    /// footprint runs contiguously up to `stack_base`.
    pub region_base: u32,
    /// Top of the stack region; the stack grows down from here and ends
    /// the task's footprint.
    pub stack_base: u32,
    /// Lowest valid stack address.
    pub stack_limit: u32,
    /// Session holding the exclusive debug lock, if any.
    pub owner_session: Option<SessionId>,
    /// Retired instruction counter.
    pub instr_retired: u64,
    /// Deadline carried across a blocking SVC retry.
    pub svc_deadline: Option<u64>,
    /// Set once the task has emitted its blocking `mailbox_wait` event, so a
    /// retried SVC does not emit it again.
    pub wait_announced: bool,
    /// Resume address whose breakpoint should be stepped over once.
    pub bp_skip: Option<u32>,
    pub exit_code: Option<i32>,
    pub fault: Option<String>,
}

impl TaskRecord {
    pub fn new(pid: Pid, app_name: String, origin: String) -> Self {
        Self {
            pid,
            app_name,
            origin,
            state: TaskState::Ready,
            wait: None,
            reg_base: 0,
            region_base: 0,
            stack_base: 0,
            stack_limit: 0,
            owner_session: None,
            instr_retired: 0,
            svc_deadline: None,
            wait_announced: false,
            bp_skip: None,
            exit_code: None,
            fault: None,
        }
    }

    pub fn pid(&self) -> Pid {
        self.pid
    }

    pub fn state(&self) -> TaskState {
        self.state
    }

    pub fn set_state(&mut self, state: TaskState) {
        self.state = state;
        if state != TaskState::Waiting && state != TaskState::Sleeping {
            self.wait = None;
        }
    }

    pub fn is_live(&self) -> bool {
        !matches!(self.state, TaskState::Faulted | TaskState::Exited)
    }

    /// Whether `addr..addr+len` lies inside this task's arena footprint.
    pub fn owns_range(&self, addr: u32, len: u32) -> bool {
        let end = addr as u64 + len as u64;
        addr >= self.region_base && end <= self.stack_base as u64
    }

    pub fn window(&self) -> RegWindow {
        RegWindow {
            base: self.reg_base,
        }
    }
}

/// Accessor for a task's register window inside the arena.
///
/// The loader guarantees the window lies inside the arena, so accesses
/// cannot fault; the `expect`s below guard that invariant, not user input.
#[derive(Debug, Clone, Copy)]
pub struct RegWindow {
    pub base: u32,
}

impl RegWindow {
    pub fn reg(&self, arena: &Arena, idx: u8) -> u32 {
        debug_assert!((idx as usize) < NUM_REGS);
        arena
            .read_u32(self.base + idx as u32 * 4)
            .expect("register window in arena")
    }

    pub fn set_reg(&self, arena: &mut Arena, idx: u8, value: u32) {
        debug_assert!((idx as usize) < NUM_REGS);
        arena
            .write_u32(self.base + idx as u32 * 4, value)
            .expect("register window in arena")
    }

    pub fn pc(&self, arena: &Arena) -> u32 {
        arena
            .read_u32(self.base + PC_OFFSET as u32)
            .expect("register window in arena")
    }

    pub fn set_pc(&self, arena: &mut Arena, value: u32) {
        arena
            .write_u32(self.base + PC_OFFSET as u32, value)
            .expect("register window in arena")
    }

    pub fn sp(&self, arena: &Arena) -> u32 {
        arena
            .read_u32(self.base + SP_OFFSET as u32)
            .expect("register window in arena")
    }

    pub fn set_sp(&self, arena: &mut Arena, value: u32) {
        arena
            .write_u32(self.base + SP_OFFSET as u32, value)
            .expect("register window in arena")
    }

    pub fn psw(&self, arena: &Arena) -> u32 {
        arena
            .read_u32(self.base + PSW_OFFSET as u32)
            .expect("register window in arena")
    }

    pub fn set_psw(&self, arena: &mut Arena, value: u32) {
        arena
            .write_u32(self.base + PSW_OFFSET as u32, value)
            .expect("register window in arena")
    }
}
