//! Supervisor-call dispatch.
//!
//! Decoded `(module, function)` pairs route statically to the mailbox,
//! executive-core, value, command, or HAL handlers. Register ABI: R1..R5
//! carry arguments, R0 returns the status code, R0..R5 are caller-saved.
//!
//! Blocking SVCs (RECV, SEND under fan-out-block, SLEEP) are implemented by
//! the retry protocol: the handler rewinds PC over the 4-byte SVC
//! instruction, parks the task in the scheduler, and the instruction
//! re-executes when the task wakes. A timeout deadline computed on the
//! first attempt is carried across retries in the task record.

mod cmd;
mod exec_core;
mod mbx;
mod val;

use log::debug;

use hsx_abi::{MODULE_CMD, MODULE_EXEC, MODULE_HAL_FIRST, MODULE_HAL_LAST, MODULE_MBX, MODULE_VAL,
    status};

use crate::exec::Executive;
use crate::task::Pid;

/// Route one SVC. The task is Running; handlers complete the call (writing
/// R0 and friends) or park the task for retry.
pub(crate) fn dispatch(exec: &mut Executive, pid: Pid, module: u8, function: u8) {
    debug!("svc pid={pid} module={module:#04x} fn={function:#04x}");
    match module {
        MODULE_MBX => mbx::dispatch(exec, pid, function),
        MODULE_EXEC => exec_core::dispatch(exec, pid, function),
        MODULE_VAL => val::dispatch(exec, pid, function),
        MODULE_CMD => cmd::dispatch(exec, pid, function),
        MODULE_HAL_FIRST..=MODULE_HAL_LAST => {
            let a = args(exec, pid);
            let result = exec.hal.dispatch(module, function, a);
            set_reg(exec, pid, 1, result.r1);
            complete(exec, pid, result.status);
        }
        _ => complete(exec, pid, status::ENOSYS),
    }
}

/// Read the argument registers R1..R5.
pub(crate) fn args(exec: &Executive, pid: Pid) -> [u32; 5] {
    let window = exec.window_of(pid);
    [
        window.reg(&exec.arena, 1),
        window.reg(&exec.arena, 2),
        window.reg(&exec.arena, 3),
        window.reg(&exec.arena, 4),
        window.reg(&exec.arena, 5),
    ]
}

pub(crate) fn set_reg(exec: &mut Executive, pid: Pid, idx: u8, value: u32) {
    let window = exec.window_of(pid);
    window.set_reg(&mut exec.arena, idx, value);
}

/// Finish an SVC: write the R0 status and clear retry bookkeeping.
pub(crate) fn complete(exec: &mut Executive, pid: Pid, r0: u32) {
    set_reg(exec, pid, 0, r0);
    if let Some(task) = exec.sched.task_mut(pid) {
        task.svc_deadline = None;
        task.wait_announced = false;
    }
}

/// Rewind PC over the SVC instruction so it re-executes on wake.
pub(crate) fn rewind_svc(exec: &mut Executive, pid: Pid) {
    let window = exec.window_of(pid);
    let pc = window.pc(&exec.arena);
    window.set_pc(&mut exec.arena, pc - 4);
}

/// Copy a guest string argument out of the arena.
pub(crate) fn guest_str(exec: &Executive, ptr: u32, len: u32) -> Option<String> {
    if len as usize > hsx_abi::MAX_NAME_BYTES {
        return None;
    }
    let bytes = exec.arena.read_bytes(ptr, len).ok()?;
    core::str::from_utf8(bytes).ok().map(str::to_string)
}
